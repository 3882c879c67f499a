use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{info, warn};

use super::builtin::{consult_experts, execute_script, script_files};
use super::{ToolContext, ToolInvocation, ToolKind, ToolOutcome, ToolReply};
use crate::config::Config;
use crate::error::{ToolError, ToolResult};
use crate::experts::ExpertDispatcher;
use crate::llm::LlmClient;
use crate::project::{ProjectConfig, ProjectDb};
use crate::sandbox::dns::system_dns_servers;
use crate::sandbox::runner::ScriptRunner;

enum DnsSource {
    System,
    Fixed(Vec<String>),
}

/// Routes tool calls to their implementations.
pub struct Toolbox {
    pub(crate) projects: Arc<ProjectDb>,
    pub(crate) runner: ScriptRunner,
    pub(crate) experts: ExpertDispatcher,
    pub(crate) default_experts: usize,
    dns: DnsSource,
}

impl Toolbox {
    pub fn new(projects: Arc<ProjectDb>, runner: ScriptRunner, experts: ExpertDispatcher) -> Self {
        let default_experts = experts.max_experts().min(3);
        Self {
            projects,
            runner,
            experts,
            default_experts,
            dns: DnsSource::System,
        }
    }

    pub fn from_config(config: &Config, expert_llm: Arc<dyn LlmClient>) -> Self {
        let projects = Arc::new(ProjectDb::new(&config.sandbox.dir));
        let runner = ScriptRunner::from_config(
            &config.sandbox.interpreter,
            config.sandbox.interpreter_args.clone(),
            &config.execution,
        );
        let experts = ExpertDispatcher::new(expert_llm)
            .with_max_experts(config.experts.max_experts)
            .with_progress_interval(Duration::from_millis(config.experts.progress_interval_ms));
        Self::new(projects, runner, experts).with_default_experts(config.experts.default_experts)
    }

    pub fn with_default_experts(mut self, count: usize) -> Self {
        self.default_experts = count.clamp(1, self.experts.max_experts());
        self
    }

    /// Uses a fixed resolver list instead of reading the system's.
    pub fn with_dns_servers(mut self, servers: Vec<String>) -> Self {
        self.dns = DnsSource::Fixed(servers);
        self
    }

    pub fn projects(&self) -> &ProjectDb {
        &self.projects
    }

    pub(crate) async fn dns_servers(&self) -> Vec<String> {
        match &self.dns {
            DnsSource::System => system_dns_servers().await,
            DnsSource::Fixed(servers) => servers.clone(),
        }
    }

    pub(crate) fn project_config(&self, project: &str) -> ToolResult<ProjectConfig> {
        self.projects
            .read_config(project)
            .map_err(ToolError::storage)?
            .ok_or_else(|| ToolError::Configuration(format!("Unknown project: {project}")))
    }

    /// Tool catalogue in the `{name, description, input_schema}` shape
    /// LLM tool APIs expect.
    pub fn definitions() -> Vec<Value> {
        ToolKind::ALL
            .iter()
            .map(|kind| {
                json!({
                    "name": kind.name(),
                    "description": kind.description(),
                    "input_schema": kind.parameters_schema(),
                })
            })
            .collect()
    }

    /// Parses and runs one tool call by name.
    pub async fn call(&self, name: &str, input: &Value, ctx: &ToolContext) -> ToolOutcome {
        match ToolInvocation::parse(name, input) {
            Ok(invocation) => self.dispatch(invocation, ctx).await,
            Err(e) => {
                warn!("Invalid {name} call: {e}");
                ToolOutcome::from_result(Err(e))
            }
        }
    }

    pub async fn dispatch(&self, invocation: ToolInvocation, ctx: &ToolContext) -> ToolOutcome {
        let kind = invocation.kind();
        info!("Tool call: {} (project {})", kind.name(), ctx.project);

        let result = self.run(invocation, ctx).await;
        let outcome = ToolOutcome::from_result(result);
        match &outcome {
            ToolOutcome::Completed { .. } => info!("Tool {} completed", kind.name()),
            ToolOutcome::Failed { response } => warn!("Tool {} failed: {response}", kind.name()),
            ToolOutcome::Cancelled => info!("Tool {} cancelled", kind.name()),
        }
        outcome
    }

    async fn run(&self, invocation: ToolInvocation, ctx: &ToolContext) -> ToolResult<ToolReply> {
        match invocation {
            ToolInvocation::WriteLibFile { filename, content } => {
                script_files::write_lib_file(self, ctx, &filename, &content)
            }
            ToolInvocation::ExecuteScript { code } => execute_script::run(self, ctx, code).await,
            ToolInvocation::ConsultExperts {
                question,
                references,
                expert_count,
            } => consult_experts::run(self, ctx, question, references, expert_count).await,
            ToolInvocation::ReadScriptFile { path } => script_files::read_script_file(self, ctx, &path),
            ToolInvocation::Unknown { name } => {
                Err(ToolError::Configuration(format!("Unknown tool: {name}")))
            }
        }
    }
}
