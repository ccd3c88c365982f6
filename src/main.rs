//! Maaflow - terminal host for MaaHelper workflows.
//!
//! Creates, executes and controls workflows run by the external engine.

#![allow(clippy::single_match_else)]

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use maaflow::app::present_outcome;
use maaflow::console::{ConsolePresenter, ConsoleSink};
use maaflow::core::Config;
use maaflow::engine::{AnalysisKind, AnalysisRequest};
use maaflow::workflow::{ActionOutcome, ExecutionOutcome, NullSink, Presenter, WorkflowAction};
use maaflow::{App, StartRequest, Started};

/// Terminal host for MaaHelper workflows
#[derive(Parser)]
#[command(name = "maaflow")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to .maaflow.toml, then the global config)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Engine executable, overriding [engine] cli_path
    #[arg(long, global = true, env = "MAAFLOW_ENGINE", value_name = "PATH")]
    engine: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List available workflow templates
    Templates {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Create a workflow from a template
    Start {
        /// Template name (asked for when omitted)
        template: Option<String>,

        /// Input values (key=value), skipping their prompts
        #[arg(short, long = "input", value_name = "KEY=VALUE", value_parser = parse_key_val)]
        input: Vec<(String, String)>,

        /// Execute the workflow right after creating it
        #[arg(short = 'x', long)]
        execute: bool,
    },

    /// List known workflows
    Workflows {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Pick a workflow and run an action against it
    Manage,

    /// Show the status of a workflow
    Status {
        /// Workflow id
        id: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Execute a workflow, streaming its output
    Exec {
        /// Workflow id
        id: String,
    },

    /// Pause a running workflow
    Pause {
        /// Workflow id
        id: String,
    },

    /// Resume a paused workflow
    Resume {
        /// Workflow id
        id: String,
    },

    /// Cancel a running or paused workflow
    Cancel {
        /// Workflow id
        id: String,
    },

    /// Create a named checkpoint
    Checkpoint {
        /// Workflow id
        id: String,

        /// Checkpoint name
        name: String,
    },

    /// List the checkpoints of a workflow
    Checkpoints {
        /// Workflow id
        id: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run a one-shot analysis on a file
    Analyze {
        /// Analysis to run (file-search, code-review, bug-analysis, refactor,
        /// explain, generate-tests, optimize)
        kind: AnalysisKind,

        /// File to analyze
        file: PathBuf,
    },

    /// Show configuration
    Config {
        /// Print the global config file path
        #[arg(long)]
        path: bool,

        /// Write the effective configuration to the global config file
        #[arg(long, conflicts_with = "path")]
        init: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli)?;

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(filter)
        .init();

    // Handle commands
    match cli.command {
        Commands::Templates { format } => cmd_templates(config, &format),
        Commands::Start { template, input, execute } => cmd_start(config, template, input, execute),
        Commands::Workflows { format } => cmd_workflows(config, &format),
        Commands::Manage => cmd_manage(config),
        Commands::Status { id, format } => cmd_status(config, &id, &format),
        Commands::Exec { id } => cmd_exec(config, &id),
        Commands::Pause { id } => cmd_action(config, &id, WorkflowAction::Pause),
        Commands::Resume { id } => cmd_action(config, &id, WorkflowAction::Resume),
        Commands::Cancel { id } => cmd_action(config, &id, WorkflowAction::Cancel),
        Commands::Checkpoint { id, name } => {
            cmd_action(config, &id, WorkflowAction::Checkpoint { name })
        }
        Commands::Checkpoints { id, format } => cmd_checkpoints(config, &id, &format),
        Commands::Analyze { kind, file } => cmd_analyze(config, kind, file),
        Commands::Config { path, init } => cmd_config(&config, path, init),
        Commands::Completions { shell } => {
            cmd_completions(shell);
            Ok(())
        }
    }
}

/// Load configuration, applying command-line overrides.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match cli.config {
        Some(ref path) => Config::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load().context("Failed to load configuration")?,
    };

    if let Some(ref engine) = cli.engine {
        config.engine.cli_path.clone_from(engine);
    }

    Ok(config)
}

/// Parse a `key=value` pair.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) =
        s.split_once('=').ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("invalid KEY=VALUE: empty key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Cancellation token triggered by Ctrl-C.
fn cancel_on_ctrl_c() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nCancelling...");
        handler_token.cancel();
    })
    .context("Failed to install Ctrl-C handler")?;
    Ok(token)
}

/// Turn an execution outcome into the process result.
fn finish_execution(outcome: &ExecutionOutcome) -> Result<()> {
    match outcome {
        ExecutionOutcome::Completed { .. } => Ok(()),
        ExecutionOutcome::Failed { exit_code, stderr } => {
            let detail = stderr.lines().last().unwrap_or_default();
            match exit_code {
                Some(code) if detail.is_empty() => {
                    anyhow::bail!("Workflow execution failed with exit code {code}")
                }
                Some(code) => {
                    anyhow::bail!("Workflow execution failed with exit code {code}: {detail}")
                }
                None => anyhow::bail!("Workflow execution failed"),
            }
        }
        ExecutionOutcome::Cancelled => std::process::exit(130),
    }
}

/// List workflow templates.
fn cmd_templates(config: Config, format: &str) -> Result<()> {
    let app = App::new(config);
    let rt = tokio::runtime::Runtime::new()?;
    let templates = rt.block_on(app.orchestrator().list_templates())?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&templates)?;
            println!("{json}");
        }
        _ => {
            for template in &templates {
                if template.description.is_empty() {
                    println!("{}", template.name);
                } else {
                    println!("{} - {}", template.name, template.description);
                }
                if !template.category.is_empty() {
                    println!("  Category: {}", template.category);
                }
                let inputs: Vec<String> = template
                    .default_inputs
                    .iter()
                    .map(|(key, default)| {
                        if template.needs_input(key) {
                            format!("{key} (required)")
                        } else {
                            format!("{key} = {default}")
                        }
                    })
                    .collect();
                if !inputs.is_empty() {
                    println!("  Inputs: {}", inputs.join(", "));
                }
            }
            println!("\nTotal: {} templates", templates.len());
        }
    }

    Ok(())
}

/// Create a workflow, optionally executing it.
fn cmd_start(
    config: Config,
    template: Option<String>,
    input: Vec<(String, String)>,
    execute: bool,
) -> Result<()> {
    let notify = config.workflow.notify_on_finish;
    let app = App::new(config);
    let cancel = cancel_on_ctrl_c()?;
    let presenter = ConsolePresenter::new().interrupt_on(cancel.clone());

    let label = template.clone().unwrap_or_else(|| "workflow".to_string());
    let request = StartRequest { template, inputs: input.into_iter().collect(), execute };

    let rt = tokio::runtime::Runtime::new()?;
    let started = rt.block_on(async {
        let sink = ConsoleSink::new(label).notify(notify);
        let started = app.start_workflow(&presenter, &sink, request, cancel.clone()).await;
        app.shutdown().await;
        started
    });
    // An abandoned prompt leaves its stdin reader blocked.
    rt.shutdown_background();

    match started? {
        Some(Started { execution: Some(ref outcome), .. }) => finish_execution(outcome),
        _ if cancel.is_cancelled() => std::process::exit(130),
        _ => Ok(()),
    }
}

/// List known workflows.
fn cmd_workflows(config: Config, format: &str) -> Result<()> {
    let app = App::new(config);
    let rt = tokio::runtime::Runtime::new()?;
    let workflows = rt.block_on(app.orchestrator().list_workflows())?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&workflows)?;
            println!("{json}");
        }
        _ => {
            for workflow in &workflows {
                println!(
                    "{}  {}  {}  {}",
                    workflow.id,
                    workflow.label(),
                    workflow.status,
                    workflow.progress.summary()
                );
            }
            println!("\nTotal: {} workflows", workflows.len());
        }
    }

    Ok(())
}

/// Interactive workflow management.
fn cmd_manage(config: Config) -> Result<()> {
    let notify = config.workflow.notify_on_finish;
    let app = App::new(config);
    let cancel = cancel_on_ctrl_c()?;
    let presenter = ConsolePresenter::new().interrupt_on(cancel.clone());

    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(async {
        let sink = ConsoleSink::new("workflow").notify(notify);
        let outcome = app.manage_workflows(&presenter, &sink, cancel.clone()).await;
        app.shutdown().await;
        outcome
    });
    rt.shutdown_background();

    match outcome? {
        Some(ActionOutcome::Executed(ref outcome)) => finish_execution(outcome),
        _ if cancel.is_cancelled() => std::process::exit(130),
        _ => Ok(()),
    }
}

/// Show a workflow's status.
fn cmd_status(config: Config, id: &str, format: &str) -> Result<()> {
    let app = App::new(config);
    let rt = tokio::runtime::Runtime::new()?;
    let workflow = rt.block_on(app.orchestrator().get_status(id))?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&workflow)?;
            println!("{json}");
        }
        _ => ConsolePresenter::new().show_status(&workflow),
    }

    Ok(())
}

/// Execute a workflow.
fn cmd_exec(config: Config, id: &str) -> Result<()> {
    let notify = config.workflow.notify_on_finish;
    let app = App::new(config);
    let cancel = cancel_on_ctrl_c()?;

    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(async {
        let sink = ConsoleSink::new(id).notify(notify);
        let outcome = app.orchestrator().execute(id, &sink, cancel).await;
        app.shutdown().await;
        outcome
    })?;

    finish_execution(&outcome)
}

/// Run a control action against a workflow.
fn cmd_action(config: Config, id: &str, action: WorkflowAction) -> Result<()> {
    let app = App::new(config);
    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(app.orchestrator().perform(
        id,
        action,
        &NullSink,
        CancellationToken::new(),
    ))?;

    present_outcome(&ConsolePresenter::new(), id, &outcome);
    Ok(())
}

/// List a workflow's checkpoints.
fn cmd_checkpoints(config: Config, id: &str, format: &str) -> Result<()> {
    let app = App::new(config);
    let rt = tokio::runtime::Runtime::new()?;
    let checkpoints = rt.block_on(app.orchestrator().list_checkpoints(id))?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&checkpoints)?;
            println!("{json}");
        }
        _ => present_outcome(&ConsolePresenter::new(), id, &ActionOutcome::Checkpoints(checkpoints)),
    }

    Ok(())
}

/// Run a one-shot analysis.
fn cmd_analyze(config: Config, kind: AnalysisKind, file: PathBuf) -> Result<()> {
    let request = AnalysisRequest::from_file(kind, &file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let app = App::new(config);
    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(app.analyze(request))?;

    for warning in &report.warnings {
        eprintln!("Warning: {warning}");
    }
    print!("{}", report.output);

    Ok(())
}

/// Show configuration.
fn cmd_config(config: &Config, show_path: bool, init: bool) -> Result<()> {
    if init {
        if let Some(path) = Config::global_path().filter(|p| p.exists()) {
            anyhow::bail!("Config file already exists: {}", path.display());
        }
        let path = config.save()?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    if show_path {
        if let Some(path) = Config::global_path() {
            println!("{}", path.display());
        }
        return Ok(());
    }

    let toml = toml::to_string_pretty(config)?;
    println!("{toml}");

    Ok(())
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "maaflow", &mut io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("bug_description=null pointer = bad").unwrap(),
            ("bug_description".to_string(), "null pointer = bad".to_string())
        );
        assert_eq!(parse_key_val("license_type=").unwrap().1, "");
        assert!(parse_key_val("feature_name").is_err());
        assert!(parse_key_val("=value").is_err());
    }
}
