use std::io::ErrorKind;

use serde_json::json;

use crate::error::{ToolError, ToolResult};
use crate::tools::{ScriptPath, ToolContext, ToolReply, Toolbox};

const LIB_PREFIX: &str = "@lib/";

/// Writes a helper script into the project's lib folder. A leading
/// `@lib/` on the filename is accepted and stripped.
pub fn write_lib_file(
    toolbox: &Toolbox,
    ctx: &ToolContext,
    filename: &str,
    content: &str,
) -> ToolResult<ToolReply> {
    let filename = filename.strip_prefix(LIB_PREFIX).unwrap_or(filename);
    toolbox
        .projects
        .write_lib_script(&ctx.project, filename, content)
        .map_err(ToolError::storage)?;

    Ok(ToolReply {
        response: "File written".to_string(),
        client_result: json!({ "status": "success" }),
    })
}

pub fn read_script_file(
    toolbox: &Toolbox,
    ctx: &ToolContext,
    path: &ScriptPath,
) -> ToolResult<ToolReply> {
    let content = match path {
        ScriptPath::Lib(file) => toolbox.projects.read_lib_script(&ctx.project, file),
        ScriptPath::Core(file) => toolbox.projects.read_core_script(file),
    }
    .map_err(ToolError::storage)?;

    let Some(content) = content else {
        let shown = match path {
            ScriptPath::Lib(file) => format!("@lib/{file}"),
            ScriptPath::Core(file) => format!("@core/{file}"),
        };
        return Err(ToolError::Io(std::io::Error::new(
            ErrorKind::NotFound,
            format!("File {shown} not found"),
        )));
    };

    Ok(ToolReply {
        response: format!("File contents:\n```typescript\n{content}\n```"),
        client_result: json!({ "content": content }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::toolbox::tests::toolbox;
    use crate::tools::{ToolInvocation, ToolOutcome};

    #[tokio::test]
    async fn test_write_then_read_lib_file() {
        let (_dir, toolbox) = toolbox("deno", vec![]);
        let ctx = ToolContext::new("demo", "c1");

        let written = toolbox
            .dispatch(
                ToolInvocation::WriteLibFile {
                    filename: "@lib/math.ts".into(),
                    content: "export const add = (a: number, b: number) => a + b;".into(),
                },
                &ctx,
            )
            .await;
        assert_eq!(written.response(), "File written");
        assert_eq!(
            toolbox.projects().list_lib_scripts("demo").unwrap(),
            vec!["math.ts"]
        );

        let read = toolbox
            .call("read-script-file", &json!({"path": "@lib/math.ts"}), &ctx)
            .await;
        match read {
            ToolOutcome::Completed {
                response,
                client_result,
            } => {
                assert!(response.starts_with("File contents:\n```typescript\n"));
                assert!(response.contains("export const add"));
                assert!(client_result["content"].as_str().unwrap().contains("a + b"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_core_file() {
        let (_dir, toolbox) = toolbox("deno", vec![]);
        std::fs::write(toolbox.projects().core_dir().join("git.ts"), "// git helpers").unwrap();

        let outcome = toolbox
            .call(
                "read-script-file",
                &json!({"path": "@core/git.ts"}),
                &ToolContext::new("demo", "c1"),
            )
            .await;
        assert!(outcome.response().contains("// git helpers"));
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let (_dir, toolbox) = toolbox("deno", vec![]);
        let outcome = toolbox
            .call(
                "read-script-file",
                &json!({"path": "@lib/nope.ts"}),
                &ToolContext::new("demo", "c1"),
            )
            .await;
        assert_eq!(
            outcome.response(),
            "An error occurred: I/O error: File @lib/nope.ts not found"
        );
    }

    #[tokio::test]
    async fn test_read_rejects_nested_path() {
        let (_dir, toolbox) = toolbox("deno", vec![]);
        let outcome = toolbox
            .call(
                "read-script-file",
                &json!({"path": "@lib/../../secret.ts"}),
                &ToolContext::new("demo", "c1"),
            )
            .await;
        assert!(outcome.response().contains("exactly one slash"));
    }

    #[tokio::test]
    async fn test_write_rejects_traversal() {
        let (_dir, toolbox) = toolbox("deno", vec![]);
        let outcome = toolbox
            .dispatch(
                ToolInvocation::WriteLibFile {
                    filename: "../escape.ts".into(),
                    content: String::new(),
                },
                &ToolContext::new("demo", "c1"),
            )
            .await;
        assert!(matches!(outcome, ToolOutcome::Failed { .. }));
    }
}
