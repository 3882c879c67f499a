use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::store::AnswerStore;
use super::{ExpertSnapshot, ExpertTask};
use crate::config::MAX_EXPERTS_LIMIT;
use crate::debounce::Debouncer;
use crate::error::{ToolError, ToolResult};
use crate::llm::{LlmClient, Message, StreamDelta};

/// Receives the aggregated state of every branch.
pub type SnapshotSink = Arc<dyn Fn(ExpertSnapshot) + Send + Sync>;

/// One consultation.
pub struct ConsultRequest {
    pub question: String,
    /// Ids of answers stored by earlier consultations
    pub references: Vec<String>,
    pub expert_count: usize,
    /// Prior conversation turns shared by every branch
    pub history: Vec<Message>,
    pub system_prompt: String,
    pub cancel: Option<CancellationToken>,
    pub on_progress: Option<SnapshotSink>,
}

impl ConsultRequest {
    pub fn new(question: impl Into<String>, expert_count: usize) -> Self {
        Self {
            question: question.into(),
            references: Vec::new(),
            expert_count,
            history: Vec::new(),
            system_prompt: String::new(),
            cancel: None,
            on_progress: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsultOutcome {
    /// Every answer, wrapped in `<expert>` tags, for the calling model
    pub transcript: String,
    pub snapshot: ExpertSnapshot,
}

/// Fans one question out to N parallel streaming calls.
pub struct ExpertDispatcher {
    llm: Arc<dyn LlmClient>,
    max_experts: usize,
    progress_interval: Duration,
}

type SharedTasks = Arc<Mutex<Vec<ExpertTask>>>;

fn lock(tasks: &Mutex<Vec<ExpertTask>>) -> MutexGuard<'_, Vec<ExpertTask>> {
    tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ExpertDispatcher {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            max_experts: MAX_EXPERTS_LIMIT,
            progress_interval: Duration::from_millis(250),
        }
    }

    pub fn with_max_experts(mut self, max_experts: usize) -> Self {
        self.max_experts = max_experts.clamp(1, MAX_EXPERTS_LIMIT);
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn max_experts(&self) -> usize {
        self.max_experts
    }

    /// Runs one consultation to completion.
    ///
    /// Out-of-range counts and unknown references fail before any model
    /// call. A failed branch fails the whole consultation and nothing is
    /// persisted.
    pub async fn consult(
        &self,
        request: ConsultRequest,
        store: &dyn AnswerStore,
    ) -> ToolResult<ConsultOutcome> {
        if request.expert_count == 0 || request.expert_count > self.max_experts {
            return Err(ToolError::Configuration(format!(
                "Expert count must be between 1 and {}, got {}",
                self.max_experts, request.expert_count
            )));
        }

        let references = resolve_references(&request.references, store)?;
        let messages = Arc::new(build_messages(&request.history, &references, &request.question));
        let system_prompt = Arc::new(request.system_prompt);

        // Ids exist before any network call
        let tasks: SharedTasks = Arc::new(Mutex::new(
            (0..request.expert_count)
                .map(|_| ExpertTask::new(Uuid::new_v4().to_string()))
                .collect(),
        ));

        let debouncer = {
            let tasks = Arc::clone(&tasks);
            let sink = request.on_progress.clone();
            Debouncer::new(self.progress_interval, move || {
                if let Some(ref sink) = sink {
                    let snapshot = ExpertSnapshot {
                        experts: lock(&tasks).clone(),
                    };
                    sink(snapshot);
                }
            })
        };

        info!(
            "Consulting {} experts via {}",
            request.expert_count,
            self.llm.description()
        );

        let handles: Vec<_> = (0..request.expert_count)
            .map(|index| {
                let llm = Arc::clone(&self.llm);
                let tasks = Arc::clone(&tasks);
                let debouncer = debouncer.clone();
                let messages = Arc::clone(&messages);
                let system_prompt = Arc::clone(&system_prompt);
                tokio::spawn(async move {
                    run_branch(llm, index, tasks, debouncer, &system_prompt, &messages).await
                })
            })
            .collect();
        // Dropping `consult` early must not leave branches streaming
        let _guard = BranchGuard {
            branches: handles.iter().map(|h| h.abort_handle()).collect(),
            debouncer: debouncer.clone(),
        };

        let cancelled = async {
            match &request.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let results = tokio::select! {
            results = join_all(handles) => results,
            _ = cancelled => {
                debouncer.cancel();
                info!("Expert consultation cancelled");
                return Err(ToolError::Cancelled);
            }
        };

        debouncer.flush();

        let mut failure = None;
        for (index, result) in results.into_iter().enumerate() {
            let error = match result {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("expert {} failed: {e:#}", index + 1),
                Err(e) => format!("expert {} task failed: {e}", index + 1),
            };
            warn!("{error}");
            failure.get_or_insert(error);
        }
        if let Some(error) = failure {
            return Err(ToolError::Expert(error));
        }

        let snapshot = ExpertSnapshot {
            experts: lock(&tasks).clone(),
        };
        for task in &snapshot.experts {
            store
                .set(&task.id, &task.combined_text())
                .map_err(ToolError::storage)?;
        }

        info!("Expert consultation complete ({} answers stored)", snapshot.experts.len());
        Ok(ConsultOutcome {
            transcript: render_transcript(&snapshot),
            snapshot,
        })
    }
}

/// Aborts unfinished branches and silences progress when dropped.
struct BranchGuard {
    branches: Vec<AbortHandle>,
    debouncer: Debouncer,
}

impl Drop for BranchGuard {
    fn drop(&mut self) {
        for branch in &self.branches {
            branch.abort();
        }
        self.debouncer.cancel();
    }
}

async fn run_branch(
    llm: Arc<dyn LlmClient>,
    index: usize,
    tasks: SharedTasks,
    debouncer: Debouncer,
    system_prompt: &str,
    messages: &[Message],
) -> anyhow::Result<()> {
    let delta_tasks = Arc::clone(&tasks);
    let delta_debouncer = debouncer.clone();
    let mut on_delta = move |delta: StreamDelta| {
        if let Some(task) = lock(&delta_tasks).get_mut(index) {
            task.apply(&delta);
        }
        delta_debouncer.debounce();
    };

    let response = llm.stream(system_prompt, messages, &mut on_delta).await?;
    debug!(
        "Expert {} finished ({} in / {} out tokens)",
        index + 1,
        response.input_tokens,
        response.output_tokens
    );

    if let Some(task) = lock(&tasks).get_mut(index) {
        task.finish();
    }
    debouncer.debounce();
    Ok(())
}

fn resolve_references(ids: &[String], store: &dyn AnswerStore) -> ToolResult<Vec<(String, String)>> {
    ids.iter()
        .map(|id| {
            let text = store
                .get(id)
                .map_err(ToolError::storage)?
                .ok_or_else(|| {
                    ToolError::Configuration(format!("Unknown expert answer reference: {id}"))
                })?;
            Ok((id.clone(), text))
        })
        .collect()
}

/// History, then one user turn carrying the referenced answers and the
/// question.
fn build_messages(history: &[Message], references: &[(String, String)], question: &str) -> Vec<Message> {
    let mut prompt = String::new();
    if !references.is_empty() {
        prompt.push_str("Previous expert answers referenced in this question:\n\n");
        for (id, text) in references {
            prompt.push_str(&format!("<reference id=\"{id}\">\n{text}\n</reference>\n\n"));
        }
    }
    prompt.push_str(&format!(
        "You are being asked the following question: \n\n{question}\n\nThink carefully, and provide an answer that fits the requirements."
    ));

    let mut messages = history.to_vec();
    messages.push(Message::user(prompt));
    messages
}

fn render_transcript(snapshot: &ExpertSnapshot) -> String {
    snapshot
        .experts
        .iter()
        .enumerate()
        .map(|(i, task)| {
            format!(
                "<expert id=\"{}\" index=\"{}\">\n{}\n</expert>",
                task.id,
                i + 1,
                task.response_content.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
