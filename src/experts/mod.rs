//! Parallel expert consultation.
//!
//! A question is fanned out to several independent streaming model calls
//! ("experts"). Their partial output is aggregated into one
//! [`ExpertSnapshot`] that is pushed to the caller at a debounced rate, and
//! each finished answer is persisted under its id so later consultations
//! can reference it.

pub mod dispatcher;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use dispatcher::{ConsultOutcome, ConsultRequest, ExpertDispatcher, SnapshotSink};
pub use store::{AnswerStore, InMemoryAnswerStore, JsonlAnswerStore};

use crate::llm::StreamDelta;

/// State of one expert branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpertTask {
    pub id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub complete: bool,
    pub reasoning_content: String,
    pub response_content: String,
}

impl ExpertTask {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            start_time: Utc::now(),
            end_time: None,
            complete: false,
            reasoning_content: String::new(),
            response_content: String::new(),
        }
    }

    pub fn apply(&mut self, delta: &StreamDelta) {
        match delta {
            StreamDelta::Reasoning(chunk) => self.reasoning_content.push_str(chunk),
            StreamDelta::Text(chunk) => self.response_content.push_str(chunk),
        }
    }

    /// Marks the branch finished. Later calls keep the first end time.
    pub fn finish(&mut self) {
        if !self.complete {
            self.complete = true;
            self.end_time = Some(Utc::now());
        }
    }

    /// Text persisted for later reference: reasoning (if any) followed by
    /// the answer.
    pub fn combined_text(&self) -> String {
        if self.reasoning_content.trim().is_empty() {
            self.response_content.clone()
        } else {
            format!(
                "<reasoning>\n{}\n</reasoning>\n\n{}",
                self.reasoning_content.trim(),
                self.response_content
            )
        }
    }
}

/// Every branch of one consultation, in dispatch order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpertSnapshot {
    pub experts: Vec<ExpertTask>,
}

impl ExpertSnapshot {
    pub fn all_complete(&self) -> bool {
        self.experts.iter().all(|e| e.complete)
    }
}
