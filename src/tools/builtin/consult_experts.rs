use std::sync::Arc;

use serde_json::json;

use crate::error::{ToolError, ToolResult};
use crate::experts::{ConsultRequest, ExpertSnapshot, JsonlAnswerStore, SnapshotSink};
use crate::project::ProjectConfig;
use crate::tools::{ToolContext, ToolProgress, ToolReply, Toolbox};

const FOLLOW_UP_NOTE: &str =
    "You can now execute the tools necessary to fulfil this request (if applicable).";

/// Fans the question out to the configured number of experts and stores
/// their answers in the conversation's answer file.
pub async fn run(
    toolbox: &Toolbox,
    ctx: &ToolContext,
    question: String,
    references: Vec<String>,
    expert_count: Option<usize>,
) -> ToolResult<ToolReply> {
    let project = toolbox.project_config(&ctx.project)?;
    let system_prompt = expert_system_prompt(toolbox, &project)?;
    let store = JsonlAnswerStore::for_conversation(
        &toolbox.projects.project_dir(&ctx.project),
        &ctx.conversation_id,
    );

    let mut request = ConsultRequest::new(question, expert_count.unwrap_or(toolbox.default_experts));
    request.references = references;
    request.history = ctx.history.clone();
    request.system_prompt = system_prompt;
    request.cancel = Some(ctx.cancel.clone());
    if ctx.progress.is_some() {
        let ctx = ctx.clone();
        let sink: SnapshotSink = Arc::new(move |snapshot: ExpertSnapshot| ctx.report(ToolProgress::Experts(snapshot)));
        request.on_progress = Some(sink);
    }

    let outcome = toolbox.experts.consult(request, &store).await?;
    Ok(ToolReply {
        response: format!("{}\n\n{FOLLOW_UP_NOTE}", outcome.transcript),
        client_result: json!(outcome.snapshot),
    })
}

/// Project context shared by every expert: workdir, available scripts and
/// the project's notes.
pub fn expert_system_prompt(toolbox: &Toolbox, project: &ProjectConfig) -> ToolResult<String> {
    let projects = &toolbox.projects;
    let lib_files = projects
        .list_lib_scripts(&project.name)
        .map_err(ToolError::storage)?;
    let core_files = projects.list_core_scripts().map_err(ToolError::storage)?;
    let context = projects
        .read_context(&project.name)
        .map_err(ToolError::storage)?;

    let mut prompt = format!(
        "You are an expert programmer advising an agent that writes and runs Deno \
         TypeScript scripts in a permission-restricted sandbox.\n\n\
         # Library files\n\n\
         Core scripts:\n{}\n\n\
         Project lib scripts:\n{}\n",
        file_list("@core/", &core_files),
        file_list("@lib/", &lib_files),
    );
    if !context.trim().is_empty() {
        prompt.push_str(&format!("\n# Context\n\n<context>\n{context}\n</context>\n"));
    }
    prompt.push_str(&format!(
        "\n# Environment\n\nWORKDIR={}\nPROJECT_NAME={}\n",
        project.workdir, project.name
    ));
    Ok(prompt)
}

fn file_list(prefix: &str, files: &[String]) -> String {
    if files.is_empty() {
        return "(none)".to_string();
    }
    files
        .iter()
        .map(|f| format!("- {prefix}{f}"))
        .collect::<Vec<_>>()
        .join("\n")
}
