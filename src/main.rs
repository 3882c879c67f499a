mod config;
mod debounce;
mod error;
mod experts;
mod llm;
mod project;
mod sandbox;
mod tools;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::experts::{ConsultRequest, ExpertDispatcher, ExpertSnapshot, InMemoryAnswerStore, SnapshotSink};
use crate::project::ProjectDb;
use crate::sandbox::dns::system_dns_servers;
use crate::tools::{ToolContext, ToolOutcome, ToolProgress, Toolbox};

const DEFAULT_CONFIG_PATH: &str = "config/syzygy.toml";

fn print_help() {
    println!(
        "\
syzygy v{}

Capability-scoped Deno sandbox and parallel expert consultation for AI agents.

USAGE:
    syzygy [OPTIONS] <COMMAND> [ARGS]

COMMANDS:
    init <project> [workdir]        Create a project in the sandbox directory
    list                            List projects
    flags <project>                 Print the Deno permission flags of a project
    run <project> <script.ts>       Run a script in the project's sandbox
    consult <project> [--experts N] [--ref ID]... <question>
                                    Ask N experts, answers are stored per conversation
    ask [--experts N] <question>    One-shot consultation, nothing is stored
    tools                           Print the tool definitions as JSON

OPTIONS:
    -c, --config <PATH>    Path to TOML configuration file [default: {DEFAULT_CONFIG_PATH}]
        --conversation <ID>
                           Conversation id used to store expert answers [default: cli]
    -h, --help             Print this help message and exit
    -V, --version          Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG              Log level filter for tracing
                          (e.g. debug, syzygy=debug,warn)
    ANTHROPIC_API_KEY     API key for Anthropic models
    OPENAI_API_KEY        API key for OpenAI-compatible endpoints

EXAMPLES:
    syzygy init demo ~/src/demo
    syzygy run demo scripts/list-files.ts
    syzygy consult demo --experts 3 \"How should I structure the cache?\"
    RUST_LOG=debug syzygy flags demo",
        env!("CARGO_PKG_VERSION"),
    );
}

/// Parsed command line.
#[derive(Debug, PartialEq)]
struct Cli {
    config_path: String,
    conversation: String,
    experts: Option<usize>,
    references: Vec<String>,
    command: Vec<String>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Cli> {
    let mut cli = Cli {
        config_path: DEFAULT_CONFIG_PATH.to_string(),
        conversation: "cli".to_string(),
        experts: None,
        references: Vec::new(),
        command: Vec::new(),
    };

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let mut value = |flag: &str| args.next().ok_or_else(|| anyhow!("{flag} requires a value"));
        match arg.as_str() {
            "-c" | "--config" => cli.config_path = value(&arg)?,
            "--conversation" => cli.conversation = value(&arg)?,
            "--ref" => cli.references.push(value(&arg)?),
            "--experts" => {
                let count = value(&arg)?;
                cli.experts = Some(
                    count
                        .parse()
                        .with_context(|| format!("Invalid expert count: {count}"))?,
                );
            }
            flag if flag.starts_with("--") => bail!("Unknown option: {flag}"),
            _ => cli.command.push(arg.clone()),
        }
    }
    Ok(cli)
}

/// Cancels `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling");
            token.cancel();
        }
    });
}

fn print_progress(progress: ToolProgress) {
    match progress {
        ToolProgress::Output(output) => {
            if let Some(line) = output.lines().last() {
                eprintln!("  | {line}");
            }
        }
        ToolProgress::Experts(snapshot) => print_expert_progress(&snapshot),
    }
}

fn print_expert_progress(snapshot: &ExpertSnapshot) {
    let done = snapshot.experts.iter().filter(|e| e.complete).count();
    let chars: usize = snapshot
        .experts
        .iter()
        .map(|e| e.reasoning_content.len() + e.response_content.len())
        .sum();
    eprintln!(
        "  experts: {done}/{} complete, {chars} chars streamed",
        snapshot.experts.len()
    );
}

/// Prints the reply and turns failure into a non-zero exit.
fn finish(outcome: ToolOutcome) -> Result<()> {
    match outcome {
        ToolOutcome::Completed { response, .. } => {
            println!("{response}");
            Ok(())
        }
        ToolOutcome::Failed { response } => Err(anyhow!(response)),
        ToolOutcome::Cancelled => {
            warn!("Tool call cancelled");
            Ok(())
        }
    }
}

fn toolbox(config: &Config) -> Result<Toolbox> {
    let expert_llm = llm::from_config(config.expert_llm())?;
    Ok(Toolbox::from_config(config, expert_llm))
}

fn tool_context(cli: &Cli, project: &str) -> ToolContext {
    let mut ctx = ToolContext::new(project, cli.conversation.as_str());
    ctx.progress = Some(Arc::new(print_progress));
    cancel_on_ctrl_c(ctx.cancel.clone());
    ctx
}

async fn run_command(cli: &Cli, config: &Config) -> Result<()> {
    let command: Vec<&str> = cli.command.iter().map(String::as_str).collect();
    match command.as_slice() {
        ["init", project, rest @ ..] if rest.len() <= 1 => {
            let workdir = rest.first().copied().unwrap_or("");
            let db = ProjectDb::new(&config.sandbox.dir);
            let created = db.create_project(project, workdir)?;
            println!("Created project {} in {}", created.name, db.project_dir(project).display());
        }
        ["list"] => {
            let db = ProjectDb::new(&config.sandbox.dir);
            for project in db.list_projects()? {
                let workdir = if project.workdir.is_empty() { "-" } else { project.workdir.as_str() };
                println!("{}\t{}\t{}", project.name, workdir, project.created_at.to_rfc3339());
            }
        }
        ["flags", project] => {
            let db = ProjectDb::new(&config.sandbox.dir);
            let project = db
                .read_config(project)?
                .ok_or_else(|| anyhow!("Unknown project: {project}"))?;
            let dns_servers = system_dns_servers().await;
            for flag in project.resolve_capabilities(&dns_servers).to_flags() {
                println!("{flag}");
            }
        }
        ["run", project, script] => {
            let code = std::fs::read_to_string(script)
                .with_context(|| format!("Cannot read script {script}"))?;
            let toolbox = toolbox(config)?;
            let ctx = tool_context(cli, project);
            finish(
                toolbox
                    .call("execute-script", &json!({ "code": code }), &ctx)
                    .await,
            )?;
        }
        ["consult", project, question @ ..] if !question.is_empty() => {
            let toolbox = toolbox(config)?;
            let ctx = tool_context(cli, project);
            let mut input = json!({
                "question": question.join(" "),
                "references": cli.references,
            });
            if let Some(count) = cli.experts {
                input["expertCount"] = json!(count);
            }
            finish(toolbox.call("consult-experts", &input, &ctx).await)?;
        }
        ["ask", question @ ..] if !question.is_empty() => {
            let llm = llm::from_config(config.expert_llm())?;
            let dispatcher = ExpertDispatcher::new(llm)
                .with_max_experts(config.experts.max_experts)
                .with_progress_interval(Duration::from_millis(config.experts.progress_interval_ms));

            let mut request = ConsultRequest::new(
                question.join(" "),
                cli.experts.unwrap_or(config.experts.default_experts),
            );
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            request.cancel = Some(cancel);
            let sink: SnapshotSink = Arc::new(|snapshot: ExpertSnapshot| print_expert_progress(&snapshot));
            request.on_progress = Some(sink);

            let store = InMemoryAnswerStore::new();
            match dispatcher.consult(request, &store).await {
                Ok(outcome) => println!("{}", outcome.transcript),
                Err(e) if e.is_cancelled() => warn!("Consultation cancelled"),
                Err(e) => return Err(e.into()),
            }
        }
        [] => {
            print_help();
        }
        other => bail!("Unknown command: {} (see --help)", other.join(" ")),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("syzygy v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("syzygy=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = parse_args(std::env::args().skip(1))?;

    // Needs no config file
    if cli.command == ["tools"] {
        println!("{}", serde_json::to_string_pretty(&Toolbox::definitions())?);
        return Ok(());
    }

    info!("Loading configuration from {}", cli.config_path);
    let config = Config::load(&cli.config_path)
        .with_context(|| format!("Cannot load configuration from {}", cli.config_path))?;
    info!(
        "Sandbox: {} ({})",
        config.sandbox.dir.display(),
        config.sandbox.interpreter.display()
    );
    info!("Expert LLM: {}", config.expert_llm().description());

    run_command(&cli, &config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[llm]
provider = "anthropic"
model = "claude-sonnet-4-5"
api_key = "test-key"
"#;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args_defaults() {
        let cli = parse_args(args(&["list"])).unwrap();
        assert_eq!(cli.config_path, DEFAULT_CONFIG_PATH);
        assert_eq!(cli.conversation, "cli");
        assert_eq!(cli.command, vec!["list"]);
    }

    #[test]
    fn test_parse_args_consult() {
        let cli = parse_args(args(&[
            "--config", "/etc/syzygy.toml", "consult", "demo", "--experts", "2", "--ref", "a1",
            "--ref", "b2", "Which", "cache?",
        ]))
        .unwrap();
        assert_eq!(cli.config_path, "/etc/syzygy.toml");
        assert_eq!(cli.experts, Some(2));
        assert_eq!(cli.references, vec!["a1", "b2"]);
        assert_eq!(cli.command, vec!["consult", "demo", "Which", "cache?"]);
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(parse_args(args(&["--experts"])).is_err());
        assert!(parse_args(args(&["--experts", "many"])).is_err());
        assert!(parse_args(args(&["--verbose"])).is_err());
    }

    #[tokio::test]
    async fn test_init_and_list_commands() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::parse(CONFIG).unwrap();
        config.sandbox.dir = dir.path().to_path_buf();

        let cli = parse_args(args(&["init", "demo", "/work"])).unwrap();
        run_command(&cli, &config).await.unwrap();
        let project = ProjectDb::new(dir.path()).read_config("demo").unwrap().unwrap();
        assert_eq!(project.workdir, "/work");

        // Second init of the same project fails
        assert!(run_command(&cli, &config).await.is_err());

        let cli = parse_args(args(&["list"])).unwrap();
        run_command(&cli, &config).await.unwrap();

        let cli = parse_args(args(&["bogus"])).unwrap();
        assert!(run_command(&cli, &config).await.is_err());
    }

    #[test]
    fn test_finish_maps_failure() {
        assert!(finish(ToolOutcome::Failed { response: "boom".into() }).is_err());
        assert!(finish(ToolOutcome::Cancelled).is_ok());
    }
}
