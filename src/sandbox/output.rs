//! Scroll-back capture of a child process's standard streams.
//!
//! Programs rewrite lines in place (progress bars use `\r`, some tools
//! emit `ESC[2K` or cursor-up sequences), so plain byte concatenation
//! produces garbage. `TerminalBuffer` is a deliberately small line
//! emulator: it understands `\r`, `\n`, backspace, tab, and the CSI
//! cursor/erase sequences `A B C D E F G K`. Every other control byte,
//! CSI sequence (colours included) and OSC string is dropped.
//!
//! The raw transcript may be large; callers only ever see the bounded
//! view produced by [`TerminalBuffer::render`].

use std::collections::VecDeque;

pub const DEFAULT_MAX_LINES: usize = 200;
pub const DEFAULT_MAX_LINE_LENGTH: usize = 500;
pub const DEFAULT_SCROLLBACK: usize = 100_000;

const TAB_WIDTH: usize = 8;

/// Furthest column cursor sequences may move to. Plain text can still run
/// past it; only escape-driven movement and padding are capped.
const MAX_CURSOR_COLUMN: usize = 4096;

/// Bounds applied when a transcript crosses the component boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderLimits {
    pub max_lines: usize,
    pub max_line_length: usize,
}

impl Default for RenderLimits {
    fn default() -> Self {
        Self {
            max_lines: DEFAULT_MAX_LINES,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ParseState {
    Ground,
    Escape,
    Csi(String),
    Osc,
    OscEscape,
}

/// Line-addressable terminal transcript.
#[derive(Debug)]
pub struct TerminalBuffer {
    lines: VecDeque<Vec<char>>,
    row: usize,
    col: usize,
    scrollback: usize,
    state: ParseState,
}

impl TerminalBuffer {
    pub fn new(scrollback: usize) -> Self {
        let mut lines = VecDeque::new();
        lines.push_back(Vec::new());
        Self {
            lines,
            row: 0,
            col: 0,
            scrollback: scrollback.max(1),
            state: ParseState::Ground,
        }
    }

    /// Feeds decoded text, including control characters and escape
    /// sequences. Partial escape sequences carry over to the next call.
    pub fn write_str(&mut self, text: &str) {
        for c in text.chars() {
            self.feed(c);
        }
    }

    fn feed(&mut self, c: char) {
        match std::mem::replace(&mut self.state, ParseState::Ground) {
            ParseState::Ground => self.feed_ground(c),
            ParseState::Escape => match c {
                '[' => self.state = ParseState::Csi(String::new()),
                ']' => self.state = ParseState::Osc,
                _ => {}
            },
            ParseState::Csi(mut params) => match c {
                '\u{20}'..='\u{3f}' => {
                    params.push(c);
                    self.state = ParseState::Csi(params);
                }
                '\u{40}'..='\u{7e}' => self.execute_csi(&params, c),
                // Malformed sequence: drop it.
                _ => {}
            },
            ParseState::Osc => match c {
                '\u{07}' => {}
                '\u{1b}' => self.state = ParseState::OscEscape,
                _ => self.state = ParseState::Osc,
            },
            ParseState::OscEscape => {
                if c != '\\' {
                    self.state = ParseState::Osc;
                }
            }
        }
    }

    fn feed_ground(&mut self, c: char) {
        match c {
            '\n' => self.line_feed(),
            '\r' => self.col = 0,
            '\u{08}' => self.col = self.col.saturating_sub(1),
            '\t' => {
                let next = (self.col / TAB_WIDTH + 1) * TAB_WIDTH;
                while self.col < next {
                    self.put(' ');
                }
            }
            '\u{1b}' => self.state = ParseState::Escape,
            c if c.is_control() => {}
            c => self.put(c),
        }
    }

    fn put(&mut self, c: char) {
        let line = &mut self.lines[self.row];
        if self.col < line.len() {
            line[self.col] = c;
        } else {
            line.resize(self.col, ' ');
            line.push(c);
        }
        self.col += 1;
    }

    fn line_feed(&mut self) {
        self.row += 1;
        self.col = 0;
        if self.row == self.lines.len() {
            self.lines.push_back(Vec::new());
        }
        while self.lines.len() > self.scrollback {
            self.lines.pop_front();
            self.row = self.row.saturating_sub(1);
        }
    }

    fn execute_csi(&mut self, params: &str, action: char) {
        let first = params
            .split(';')
            .next()
            .and_then(|p| p.parse::<usize>().ok());
        let count = first.unwrap_or(1).max(1);
        let last_row = self.lines.len() - 1;

        match action {
            'A' => self.row = self.row.saturating_sub(count),
            'B' => self.row = self.row.saturating_add(count).min(last_row),
            'C' => self.col = self.col.saturating_add(count).min(self.max_cursor_column()),
            'D' => self.col = self.col.saturating_sub(count),
            'E' => {
                self.row = self.row.saturating_add(count).min(last_row);
                self.col = 0;
            }
            'F' => {
                self.row = self.row.saturating_sub(count);
                self.col = 0;
            }
            'G' => self.col = (count - 1).min(MAX_CURSOR_COLUMN),
            'K' => {
                let line = &mut self.lines[self.row];
                match first.unwrap_or(0) {
                    0 => line.truncate(self.col),
                    1 => {
                        let end = self.col.saturating_add(1).min(line.len());
                        line[..end].iter_mut().for_each(|ch| *ch = ' ');
                    }
                    _ => line.clear(),
                }
            }
            // SGR colours, screen-addressed movement, modes: ignored.
            _ => {}
        }
    }

    fn max_cursor_column(&self) -> usize {
        MAX_CURSOR_COLUMN.max(self.col)
    }

    /// Transcript lines, excluding the empty line the cursor sits on after
    /// a trailing newline.
    fn visible(&self) -> impl Iterator<Item = &Vec<char>> {
        let mut len = self.lines.len();
        if self.lines.back().is_some_and(|l| l.is_empty()) {
            len -= 1;
        }
        self.lines.iter().take(len)
    }

    pub fn line_count(&self) -> usize {
        self.visible().count()
    }

    pub fn line(&self, index: usize) -> Option<String> {
        self.visible().nth(index).map(|l| l.iter().collect())
    }

    /// Bounded view of the transcript.
    ///
    /// At most `max_lines` lines are shown: beyond that the first and last
    /// ⌈max_lines/2⌉ lines are kept around a three-line skip marker. Lines
    /// longer than `max_line_length` are cut with a trailing
    /// "truncated N characters" note.
    pub fn render(&self, limits: RenderLimits) -> String {
        let lines: Vec<&Vec<char>> = self.visible().collect();
        let total = lines.len();
        let half = limits.max_lines.div_ceil(2);
        let cut = |l: &Vec<char>| truncate_line(l, limits.max_line_length);

        if total <= limits.max_lines || total <= half * 2 {
            return lines.into_iter().map(cut).collect::<Vec<_>>().join("\n");
        }

        let skipped = total - half * 2;
        let mut out: Vec<String> = lines[..half].iter().map(|l| cut(l)).collect();
        out.push(String::new());
        out.push(format!("... ({skipped} lines skipped) ..."));
        out.push(String::new());
        out.extend(lines[total - half..].iter().map(|l| cut(l)));
        out.join("\n")
    }
}

fn truncate_line(line: &[char], max_len: usize) -> String {
    if line.len() <= max_len {
        return line.iter().collect();
    }
    let mut out: String = line[..max_len].iter().collect();
    out.push_str(&format!("... (truncated {} characters)", line.len() - max_len));
    out
}

/// Incremental UTF-8 decoder for one pipe.
///
/// Multi-byte sequences split across reads are held back until complete;
/// invalid bytes decode to U+FFFD.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(bytes);

        let mut out = String::with_capacity(data.len());
        let mut rest: &[u8] = &data;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(e) => {
                    let (valid, invalid) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        None => {
                            self.pending = invalid.to_vec();
                            break;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &invalid[len..];
                        }
                    }
                }
            }
        }
        out
    }

    fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            self.pending.clear();
            char::REPLACEMENT_CHARACTER.to_string()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// Combined and per-stream transcripts of one execution.
///
/// Chunks from both pipes land in `combined` in arrival order; the
/// relative order of stdout and stderr output is best-effort only.
#[derive(Debug)]
pub struct OutputBuffer {
    combined: TerminalBuffer,
    stdout: TerminalBuffer,
    stderr: TerminalBuffer,
    stdout_decoder: Utf8Decoder,
    stderr_decoder: Utf8Decoder,
}

impl OutputBuffer {
    pub fn new(scrollback: usize) -> Self {
        Self {
            combined: TerminalBuffer::new(scrollback),
            stdout: TerminalBuffer::new(scrollback),
            stderr: TerminalBuffer::new(scrollback),
            stdout_decoder: Utf8Decoder::default(),
            stderr_decoder: Utf8Decoder::default(),
        }
    }

    pub fn write(&mut self, stream: StreamKind, bytes: &[u8]) {
        let text = match stream {
            StreamKind::Stdout => self.stdout_decoder.decode(bytes),
            StreamKind::Stderr => self.stderr_decoder.decode(bytes),
        };
        self.push_text(stream, &text);
    }

    /// Marks end-of-stream: a dangling partial UTF-8 sequence becomes U+FFFD.
    pub fn finish(&mut self, stream: StreamKind) {
        let text = match stream {
            StreamKind::Stdout => self.stdout_decoder.finish(),
            StreamKind::Stderr => self.stderr_decoder.finish(),
        };
        self.push_text(stream, &text);
    }

    fn push_text(&mut self, stream: StreamKind, text: &str) {
        if text.is_empty() {
            return;
        }
        match stream {
            StreamKind::Stdout => self.stdout.write_str(text),
            StreamKind::Stderr => self.stderr.write_str(text),
        }
        self.combined.write_str(text);
    }

    pub fn combined(&self) -> &TerminalBuffer {
        &self.combined
    }

    pub fn stdout(&self) -> &TerminalBuffer {
        &self.stdout
    }

    pub fn stderr(&self) -> &TerminalBuffer {
        &self.stderr
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_SCROLLBACK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term(input: &str) -> TerminalBuffer {
        let mut t = TerminalBuffer::new(DEFAULT_SCROLLBACK);
        t.write_str(input);
        t
    }

    fn all_lines(t: &TerminalBuffer) -> Vec<String> {
        (0..t.line_count()).filter_map(|i| t.line(i)).collect()
    }

    fn numbered(count: usize) -> TerminalBuffer {
        let mut t = TerminalBuffer::new(DEFAULT_SCROLLBACK);
        for i in 0..count {
            t.write_str(&format!("line {i}\n"));
        }
        t
    }

    // ── emulation ────────────────────────────────────────

    #[test]
    fn test_plain_lines() {
        let t = term("hello\nworld\n");
        assert_eq!(all_lines(&t), vec!["hello", "world"]);
    }

    #[test]
    fn test_partial_line_kept() {
        let t = term("no newline");
        assert_eq!(all_lines(&t), vec!["no newline"]);
    }

    #[test]
    fn test_partial_line_across_writes() {
        let mut t = TerminalBuffer::new(10);
        t.write_str("hel");
        t.write_str("lo\nwor");
        t.write_str("ld");
        assert_eq!(all_lines(&t), vec!["hello", "world"]);
    }

    #[test]
    fn test_carriage_return_overwrites() {
        let t = term("progress 10%\rprogress 55%\rprogress 100%\ndone\n");
        assert_eq!(all_lines(&t), vec!["progress 100%", "done"]);
    }

    #[test]
    fn test_carriage_return_shorter_text_keeps_tail() {
        // Same as a real terminal: only the written cells change.
        let t = term("abcdef\rXY");
        assert_eq!(all_lines(&t), vec!["XYcdef"]);
    }

    #[test]
    fn test_erase_line() {
        let t = term("abcdef\r\x1b[2Kxy\n");
        assert_eq!(all_lines(&t), vec!["xy"]);
    }

    #[test]
    fn test_erase_to_end_of_line() {
        let t = term("abcdef\x1b[3D\x1b[K!");
        assert_eq!(all_lines(&t), vec!["abc!"]);
    }

    #[test]
    fn test_cursor_up_rewrites_previous_line() {
        let t = term("first\nsecond\n\x1b[2A\x1b[2KFIRST\n");
        assert_eq!(all_lines(&t), vec!["FIRST", "second"]);
    }

    #[test]
    fn test_colours_stripped() {
        let t = term("\x1b[1;31merror\x1b[0m: boom\n");
        assert_eq!(all_lines(&t), vec!["error: boom"]);
    }

    #[test]
    fn test_escape_sequence_split_across_writes() {
        let mut t = TerminalBuffer::new(10);
        t.write_str("\x1b[3");
        t.write_str("2mgreen\x1b");
        t.write_str("[0m\n");
        assert_eq!(all_lines(&t), vec!["green"]);
    }

    #[test]
    fn test_osc_title_ignored() {
        let t = term("\x1b]0;my title\x07visible\n\x1b]2;other\x1b\\next\n");
        assert_eq!(all_lines(&t), vec!["visible", "next"]);
    }

    #[test]
    fn test_backspace_and_tab() {
        let t = term("abc\x08X\n\tz\n");
        assert_eq!(all_lines(&t), vec!["abX", "        z"]);
    }

    #[test]
    fn test_cursor_column_absolute_pads() {
        let t = term("\x1b[5Gx");
        assert_eq!(all_lines(&t), vec!["    x"]);
    }

    #[test]
    fn test_huge_cursor_counts_are_capped() {
        let max = usize::MAX;
        let t = term(&format!("\x1b[{max}Gx\n"));
        assert_eq!(t.line(0).unwrap().len(), MAX_CURSOR_COLUMN + 1);

        let t = term(&format!("ab\x1b[{max}Cy\nnext\n"));
        assert_eq!(t.line(0).unwrap().len(), MAX_CURSOR_COLUMN + 1);
        assert_eq!(t.line(1).as_deref(), Some("next"));

        let t = term(&format!("one\ntwo\x1b[2A\x1b[{max}B\x1b[{max}E!\n"));
        assert_eq!(all_lines(&t), vec!["one", "!wo"]);

        let t = term("\x1b[2000000000Gz");
        assert!(t.line(0).unwrap().len() <= MAX_CURSOR_COLUMN + 1);
    }

    #[test]
    fn test_cursor_forward_stops_at_column_cap() {
        // Text may run past the cap, cursor movement may not
        let long = "x".repeat(MAX_CURSOR_COLUMN + 10);
        let t = term(&format!("{long}\x1b[3Cy"));
        assert_eq!(t.line(0).unwrap().len(), MAX_CURSOR_COLUMN + 11);
    }

    #[test]
    fn test_scrollback_drops_oldest_lines() {
        let mut t = TerminalBuffer::new(3);
        t.write_str("a\nb\nc\nd\ne");
        assert_eq!(all_lines(&t), vec!["c", "d", "e"]);
    }

    #[test]
    fn test_empty_buffer() {
        let t = TerminalBuffer::new(10);
        assert_eq!(t.line_count(), 0);
        assert_eq!(t.render(RenderLimits::default()), "");
    }

    // ── render ───────────────────────────────────────────

    #[test]
    fn test_render_under_limit_shows_everything() {
        let t = numbered(5);
        assert_eq!(
            t.render(RenderLimits::default()),
            "line 0\nline 1\nline 2\nline 3\nline 4"
        );
    }

    #[test]
    fn test_render_truncates_long_lines() {
        let t = term(&format!("{}\nshort\n", "x".repeat(30)));
        let out = t.render(RenderLimits {
            max_lines: 10,
            max_line_length: 10,
        });
        assert_eq!(
            out,
            format!("{}... (truncated 20 characters)\nshort", "x".repeat(10))
        );
    }

    #[test]
    fn test_render_elides_middle() {
        let t = numbered(20);
        let out = t.render(RenderLimits {
            max_lines: 4,
            max_line_length: 100,
        });
        assert_eq!(
            out,
            "line 0\nline 1\n\n... (16 lines skipped) ...\n\nline 18\nline 19"
        );
    }

    #[test]
    fn test_render_odd_limit_rounds_up() {
        let t = numbered(10);
        let out = t.render(RenderLimits {
            max_lines: 3,
            max_line_length: 100,
        });
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "line 0");
        assert_eq!(lines[1], "line 1");
        assert_eq!(lines[3], "... (6 lines skipped) ...");
        assert_eq!(lines[5], "line 8");
        assert_eq!(lines[6], "line 9");
    }

    #[test]
    fn test_render_bounds_hold() {
        for total in [0, 1, 2, 7, 50, 300] {
            for max_lines in [1, 2, 3, 10, 200] {
                let mut t = TerminalBuffer::new(DEFAULT_SCROLLBACK);
                for i in 0..total {
                    t.write_str(&format!("{}{i}\n", "y".repeat(i % 40)));
                }
                let max_line_length = 16;
                let out = t.render(RenderLimits {
                    max_lines,
                    max_line_length,
                });
                let line_count = if out.is_empty() { 0 } else { out.split('\n').count() };
                assert!(line_count <= max_lines + 3, "{total} lines, limit {max_lines}");
                let marker_len = "... (truncated 99 characters)".len();
                for line in out.split('\n') {
                    assert!(line.chars().count() <= max_line_length + marker_len);
                }
            }
        }
    }

    // ── UTF-8 and streams ────────────────────────────────

    #[test]
    fn test_utf8_split_across_chunks() {
        let mut out = OutputBuffer::default();
        let bytes = "héllo wörld\n".as_bytes();
        // Split inside the two-byte 'é'
        out.write(StreamKind::Stdout, &bytes[..2]);
        out.write(StreamKind::Stdout, &bytes[2..]);
        assert_eq!(out.stdout().line(0).as_deref(), Some("héllo wörld"));
    }

    #[test]
    fn test_invalid_utf8_replaced() {
        let mut out = OutputBuffer::default();
        out.write(StreamKind::Stdout, b"a\xffb\n");
        assert_eq!(out.stdout().line(0).as_deref(), Some("a\u{fffd}b"));
    }

    #[test]
    fn test_dangling_utf8_at_eof() {
        let mut out = OutputBuffer::default();
        out.write(StreamKind::Stderr, &[b'x', 0xe2, 0x82]);
        out.finish(StreamKind::Stderr);
        assert_eq!(out.stderr().line(0).as_deref(), Some("x\u{fffd}"));
    }

    #[test]
    fn test_streams_are_separated_and_combined() {
        let mut out = OutputBuffer::default();
        out.write(StreamKind::Stdout, b"out 1\n");
        out.write(StreamKind::Stderr, b"err 1\n");
        out.write(StreamKind::Stdout, b"out 2\n");

        let limits = RenderLimits::default();
        assert_eq!(out.stdout().render(limits), "out 1\nout 2");
        assert_eq!(out.stderr().render(limits), "err 1");
        assert_eq!(out.combined().render(limits), "out 1\nerr 1\nout 2");
    }

    #[test]
    fn test_split_utf8_does_not_corrupt_other_stream() {
        let mut out = OutputBuffer::default();
        let bytes = "€\n".as_bytes();
        out.write(StreamKind::Stdout, &bytes[..1]);
        out.write(StreamKind::Stderr, b"err\n");
        out.write(StreamKind::Stdout, &bytes[1..]);
        assert_eq!(out.stdout().line(0).as_deref(), Some("€"));
        assert_eq!(out.combined().line(0).as_deref(), Some("err"));
        assert_eq!(out.combined().line(1).as_deref(), Some("€"));
    }
}
