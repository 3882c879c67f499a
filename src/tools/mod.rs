//! Tools the agent can invoke.
//!
//! The set of tools is closed: every name the model sends is parsed into a
//! [`ToolInvocation`] (with an explicit `Unknown` variant) and routed by
//! [`Toolbox::dispatch`]. Each run ends in a [`ToolOutcome`] whose
//! `response` is the text returned to the model.

pub mod builtin;
pub mod toolbox;

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{ToolError, ToolResult};
use crate::experts::ExpertSnapshot;
use crate::llm::Message;

pub use toolbox::Toolbox;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolKind {
    WriteLibFile,
    ExecuteScript,
    ConsultExperts,
    ReadScriptFile,
    Unknown(String),
}

impl ToolKind {
    /// Every tool offered to the model.
    pub const ALL: [ToolKind; 4] = [
        ToolKind::WriteLibFile,
        ToolKind::ExecuteScript,
        ToolKind::ConsultExperts,
        ToolKind::ReadScriptFile,
    ];

    pub fn from_name(name: &str) -> Self {
        match name {
            "write-lib-file" => ToolKind::WriteLibFile,
            "execute-script" => ToolKind::ExecuteScript,
            "consult-experts" => ToolKind::ConsultExperts,
            "read-script-file" => ToolKind::ReadScriptFile,
            other => ToolKind::Unknown(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ToolKind::WriteLibFile => "write-lib-file",
            ToolKind::ExecuteScript => "execute-script",
            ToolKind::ConsultExperts => "consult-experts",
            ToolKind::ReadScriptFile => "read-script-file",
            ToolKind::Unknown(name) => name.as_str(),
        }
    }

    pub fn description(&self) -> &str {
        match self {
            ToolKind::WriteLibFile => "Write a file to the lib directory",
            ToolKind::ExecuteScript => {
                "Execute a TypeScript script with Deno. The script runs sandboxed, with \
                 read/write access to the current project and its workdir."
            }
            ToolKind::ConsultExperts => {
                "Get advice or answers to questions from several expert programmers in \
                 parallel. The experts can see the full chat history. Earlier expert \
                 answers can be referenced by id."
            }
            ToolKind::ReadScriptFile => {
                "Read the contents of a script file from either @lib/ or @core/"
            }
            ToolKind::Unknown(_) => "",
        }
    }

    /// JSON Schema of the tool input.
    pub fn parameters_schema(&self) -> Value {
        match self {
            ToolKind::WriteLibFile => json!({
                "type": "object",
                "properties": {
                    "filename": { "type": "string" },
                    "content": {
                        "type": "string",
                        "description": "The actual content of the lib file, exporting all the \
                                        relevant helper functions. Doc comment the file's \
                                        contents, including a comment at the top of the file."
                    }
                },
                "required": ["filename", "content"]
            }),
            ToolKind::ExecuteScript => json!({
                "type": "object",
                "properties": {
                    "code": {
                        "type": "string",
                        "description": "The TypeScript code to execute"
                    }
                },
                "required": ["code"]
            }),
            ToolKind::ConsultExperts => json!({
                "type": "object",
                "properties": {
                    "question": {
                        "type": "string",
                        "description": "The question or topic to get advice about. Be specific \
                                        and thorough, and include extra context where possible."
                    },
                    "references": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Ids of earlier expert answers to include"
                    },
                    "expertCount": {
                        "type": "integer",
                        "minimum": 1,
                        "maximum": crate::config::MAX_EXPERTS_LIMIT,
                        "description": "How many experts to consult in parallel"
                    }
                },
                "required": ["question"]
            }),
            ToolKind::ReadScriptFile => json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "The path to the script file, must start with either \
                                        @lib/ or @core/"
                    }
                },
                "required": ["path"]
            }),
            ToolKind::Unknown(_) => json!({ "type": "object" }),
        }
    }
}

/// Where a `read-script-file` path points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptPath {
    Lib(String),
    Core(String),
}

impl ScriptPath {
    const LIB_PREFIX: &'static str = "@lib/";
    const CORE_PREFIX: &'static str = "@core/";

    /// Accepts `@lib/<file>` or `@core/<file>` with exactly one slash.
    pub fn parse(path: &str) -> ToolResult<Self> {
        let invalid = || {
            ToolError::Configuration(
                "Path must start with @lib/ or @core/ and contain exactly one slash".to_string(),
            )
        };
        if path.matches('/').count() != 1 {
            return Err(invalid());
        }
        let parsed = if let Some(file) = path.strip_prefix(Self::LIB_PREFIX) {
            ScriptPath::Lib(file.to_string())
        } else if let Some(file) = path.strip_prefix(Self::CORE_PREFIX) {
            ScriptPath::Core(file.to_string())
        } else {
            return Err(invalid());
        };
        if parsed.filename().is_empty() {
            return Err(invalid());
        }
        Ok(parsed)
    }

    pub fn filename(&self) -> &str {
        match self {
            ScriptPath::Lib(file) | ScriptPath::Core(file) => file,
        }
    }
}

/// A parsed tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolInvocation {
    WriteLibFile {
        filename: String,
        content: String,
    },
    ExecuteScript {
        code: String,
    },
    ConsultExperts {
        question: String,
        references: Vec<String>,
        expert_count: Option<usize>,
    },
    ReadScriptFile {
        path: ScriptPath,
    },
    Unknown {
        name: String,
    },
}

fn required_str(input: &Value, key: &str) -> ToolResult<String> {
    input[key]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ToolError::Configuration(format!("Missing required parameter: {key}")))
}

impl ToolInvocation {
    /// Parses the model's tool call. Unknown names are not an error here;
    /// they surface when dispatched.
    pub fn parse(name: &str, input: &Value) -> ToolResult<Self> {
        Ok(match ToolKind::from_name(name) {
            ToolKind::WriteLibFile => ToolInvocation::WriteLibFile {
                filename: required_str(input, "filename")?,
                content: required_str(input, "content")?,
            },
            ToolKind::ExecuteScript => ToolInvocation::ExecuteScript {
                code: required_str(input, "code")?,
            },
            ToolKind::ConsultExperts => {
                let references = match &input["references"] {
                    Value::Null => Vec::new(),
                    Value::Array(items) => items
                        .iter()
                        .map(|item| {
                            item.as_str().map(str::to_string).ok_or_else(|| {
                                ToolError::Configuration(
                                    "references must be a list of answer ids".to_string(),
                                )
                            })
                        })
                        .collect::<ToolResult<_>>()?,
                    _ => {
                        return Err(ToolError::Configuration(
                            "references must be a list of answer ids".to_string(),
                        ))
                    }
                };
                let expert_count = match &input["expertCount"] {
                    Value::Null => None,
                    value => Some(value.as_u64().map(|n| n as usize).ok_or_else(|| {
                        ToolError::Configuration(
                            "expertCount must be a positive integer".to_string(),
                        )
                    })?),
                };
                ToolInvocation::ConsultExperts {
                    question: required_str(input, "question")?,
                    references,
                    expert_count,
                }
            }
            ToolKind::ReadScriptFile => ToolInvocation::ReadScriptFile {
                path: ScriptPath::parse(&required_str(input, "path")?)?,
            },
            ToolKind::Unknown(name) => ToolInvocation::Unknown { name },
        })
    }

    pub fn kind(&self) -> ToolKind {
        match self {
            ToolInvocation::WriteLibFile { .. } => ToolKind::WriteLibFile,
            ToolInvocation::ExecuteScript { .. } => ToolKind::ExecuteScript,
            ToolInvocation::ConsultExperts { .. } => ToolKind::ConsultExperts,
            ToolInvocation::ReadScriptFile { .. } => ToolKind::ReadScriptFile,
            ToolInvocation::Unknown { name } => ToolKind::Unknown(name.clone()),
        }
    }
}

/// Live progress of a running tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolProgress {
    /// Bounded combined output of a running script
    Output(String),
    Experts(ExpertSnapshot),
}

pub type ToolProgressSink = Arc<dyn Fn(ToolProgress) + Send + Sync>;

/// Per-call context supplied by the agent loop.
#[derive(Clone)]
pub struct ToolContext {
    pub project: String,
    pub conversation_id: String,
    /// Conversation so far, shared with consulted experts
    pub history: Vec<Message>,
    pub cancel: CancellationToken,
    pub progress: Option<ToolProgressSink>,
}

impl ToolContext {
    pub fn new(project: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            conversation_id: conversation_id.into(),
            history: Vec::new(),
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub(crate) fn report(&self, progress: ToolProgress) {
        if let Some(ref sink) = self.progress {
            sink(progress);
        }
    }
}

/// Result of a successful tool run.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolReply {
    /// Text returned to the model
    pub response: String,
    /// Structured result for the client UI
    pub client_result: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Completed { response: String, client_result: Value },
    Failed { response: String },
    Cancelled,
}

impl ToolOutcome {
    /// Maps a tool result; cancellation stays distinct from failure.
    pub fn from_result(result: ToolResult<ToolReply>) -> Self {
        match result {
            Ok(reply) => ToolOutcome::Completed {
                response: reply.response,
                client_result: reply.client_result,
            },
            Err(e) if e.is_cancelled() => ToolOutcome::Cancelled,
            Err(e) => ToolOutcome::Failed {
                response: format!("An error occurred: {e}"),
            },
        }
    }

    /// Text returned to the model.
    pub fn response(&self) -> &str {
        match self {
            ToolOutcome::Completed { response, .. } | ToolOutcome::Failed { response } => response,
            ToolOutcome::Cancelled => "The tool call was cancelled.",
        }
    }
}
