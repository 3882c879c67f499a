use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use crate::error::ToolResult;
use crate::sandbox::runner::{ExecutionRequest, ExecutionResult, ProgressSink};
use crate::tools::{ToolContext, ToolProgress, ToolReply, Toolbox};

/// Runs `code` in the project's sandbox with its resolved capabilities.
pub async fn run(toolbox: &Toolbox, ctx: &ToolContext, code: String) -> ToolResult<ToolReply> {
    let project = toolbox.project_config(&ctx.project)?;
    let dns_servers = toolbox.dns_servers().await;
    let capabilities = project.resolve_capabilities(&dns_servers);
    debug!("Capabilities for {}: {:?}", ctx.project, capabilities.to_flags());

    let mut request = ExecutionRequest::new(code, capabilities, toolbox.projects.scripts_dir(&ctx.project))
        .with_cancel(ctx.cancel.clone());
    if let Some(workdir) = project.workdir_path() {
        request = request.with_workdir(workdir);
    }
    if ctx.progress.is_some() {
        let ctx = ctx.clone();
        let sink: ProgressSink = Arc::new(move |output: String| ctx.report(ToolProgress::Output(output)));
        request = request.with_progress(sink);
    }

    let result = toolbox.runner.run(request).await?;
    Ok(ToolReply {
        response: format_output(&result),
        client_result: json!(result),
    })
}

/// The transcript handed back to the model.
pub fn format_output(result: &ExecutionResult) -> String {
    format!(
        "<output>\n<stdout>\n{}\n</stdout>\n<stderr>\n{}\n</stderr>\n<exitCode>\n{}\n</exitCode>\n</output>",
        result.stdout, result.stderr, result.exit_code
    )
}
