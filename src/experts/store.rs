//! Durable storage for expert answers, keyed by branch id.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Append/read store of finished expert answers.
pub trait AnswerStore: Send + Sync {
    /// Returns `None` when `id` was never stored.
    fn get(&self, id: &str) -> Result<Option<String>>;

    /// Stores `text` under `id`, replacing any previous value.
    fn set(&self, id: &str, text: &str) -> Result<()>;
}

/// One line of an answers file.
#[derive(Debug, Serialize, Deserialize, Clone)]
struct AnswerEntry {
    id: String,
    content: String,
    ts: String,
}

/// JSONL answers file, one per conversation.
///
/// Layout: `{project_dir}/.cache/experts/{conversation}.jsonl`
pub struct JsonlAnswerStore {
    path: PathBuf,
}

impl JsonlAnswerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_conversation(project_dir: &Path, conversation_id: &str) -> Self {
        Self::new(
            project_dir
                .join(".cache")
                .join("experts")
                .join(format!("{}.jsonl", sanitize_id(conversation_id))),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Vec<AnswerEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        let mut entries = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_str::<AnswerEntry>(line) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

impl AnswerStore for JsonlAnswerStore {
    fn get(&self, id: &str) -> Result<Option<String>> {
        // Last write wins if an id was appended more than once
        Ok(self
            .load()?
            .into_iter()
            .rev()
            .find(|e| e.id == id)
            .map(|e| e.content))
    }

    fn set(&self, id: &str, text: &str) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }

        let new_entry = AnswerEntry {
            id: id.to_string(),
            content: text.to_string(),
            ts: chrono::Utc::now().to_rfc3339(),
        };

        let mut entries = self.load()?;
        if let Some(pos) = entries.iter().position(|e| e.id == id) {
            // Overwrite: replace entry and rewrite file
            entries[pos] = new_entry;
            let mut file = fs::File::create(&self.path)?;
            for entry in &entries {
                let json = serde_json::to_string(entry)?;
                writeln!(file, "{json}")?;
            }
        } else {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            let json = serde_json::to_string(&new_entry)?;
            writeln!(file, "{json}")?;
        }

        debug!("Stored expert answer {id} in {}", self.path.display());
        Ok(())
    }
}

/// Keeps conversation ids from escaping the cache directory.
fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Process-local store, used when no project directory is involved.
#[derive(Default)]
pub struct InMemoryAnswerStore {
    answers: Mutex<HashMap<String, String>>,
}

impl InMemoryAnswerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.answers.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AnswerStore for InMemoryAnswerStore {
    fn get(&self, id: &str) -> Result<Option<String>> {
        let answers = self
            .answers
            .lock()
            .map_err(|_| anyhow::anyhow!("answer store lock poisoned"))?;
        Ok(answers.get(id).cloned())
    }

    fn set(&self, id: &str, text: &str) -> Result<()> {
        let mut answers = self
            .answers
            .lock()
            .map_err(|_| anyhow::anyhow!("answer store lock poisoned"))?;
        answers.insert(id.to_string(), text.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonl_set_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlAnswerStore::for_conversation(dir.path(), "conv-1");

        assert_eq!(store.get("a").unwrap(), None);
        store.set("a", "first answer").unwrap();
        store.set("b", "second\nanswer").unwrap();

        assert_eq!(store.get("a").unwrap().as_deref(), Some("first answer"));
        assert_eq!(store.get("b").unwrap().as_deref(), Some("second\nanswer"));
        assert!(store.path().ends_with(".cache/experts/conv-1.jsonl"));
    }

    #[test]
    fn test_jsonl_overwrite_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlAnswerStore::for_conversation(dir.path(), "conv");

        store.set("a", "old").unwrap();
        store.set("b", "other").unwrap();
        store.set("a", "new").unwrap();

        assert_eq!(store.get("a").unwrap().as_deref(), Some("new"));
        let lines = fs::read_to_string(store.path()).unwrap();
        assert_eq!(lines.lines().count(), 2);
    }

    #[test]
    fn test_jsonl_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        JsonlAnswerStore::for_conversation(dir.path(), "c")
            .set("id", "persisted")
            .unwrap();

        let reopened = JsonlAnswerStore::for_conversation(dir.path(), "c");
        assert_eq!(reopened.get("id").unwrap().as_deref(), Some("persisted"));
    }

    #[test]
    fn test_jsonl_skips_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlAnswerStore::new(dir.path().join("answers.jsonl"));
        store.set("ok", "fine").unwrap();

        let mut file = OpenOptions::new().append(true).open(store.path()).unwrap();
        writeln!(file, "{{ not json").unwrap();

        assert_eq!(store.get("ok").unwrap().as_deref(), Some("fine"));
    }

    #[test]
    fn test_conversation_id_is_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlAnswerStore::for_conversation(dir.path(), "../../etc/passwd");
        assert!(store.path().starts_with(dir.path().join(".cache/experts")));
        assert_eq!(store.path().file_name().unwrap(), "______etc_passwd.jsonl");
    }

    #[test]
    fn test_in_memory_store() {
        let store = InMemoryAnswerStore::new();
        assert_eq!(store.get("x").unwrap(), None);
        store.set("x", "1").unwrap();
        store.set("x", "2").unwrap();
        assert_eq!(store.get("x").unwrap().as_deref(), Some("2"));
        assert_eq!(store.len(), 1);
    }
}
