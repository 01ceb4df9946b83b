//! Local-LLM coding agent CLI.
//!
//! `dodder run` starts an interactive session in which a model served by
//! Ollama proposes one shell action per turn. `dodder list` shows the models
//! the server can run.

use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, Parser, Subcommand};

use dodder::agent::{AgentLoop, LoopEvent, LoopSettings, Suspension};
use dodder::cancel::{CancelToken, listen_for_interrupts};
use dodder::core::types::{ExecutionResult, GenerationParams, ProjectContext};
use dodder::error::{AgentError, BackendError};
use dodder::exit_codes;
use dodder::io::config::{DodderConfig, OLLAMA_HOST_ENV, default_config_path, load_config};
use dodder::io::console::{UserInput, stdin_input};
use dodder::io::instructions::load_instructions;
use dodder::io::model::{ModelClient, OllamaClient};
use dodder::io::shell::{HostShell, ShellInfo};
use dodder::logging;
use dodder::session::{SessionEvent, run_session};

const DESCRIPTION_PROMPT: &str = "Please describe what you want to do: ";

#[derive(Parser)]
#[command(
    name = "dodder",
    version,
    disable_version_flag = true,
    about = "Local-LLM coding agent that turns project requests into validated shell actions"
)]
struct Cli {
    /// Print version.
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List models available on the Ollama server.
    List {
        /// Config file (default: ./.dodder/config.toml).
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
    /// Start an agent session with MODEL.
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Model name as known to Ollama (see `dodder list`).
    model: String,

    /// What to build. Asked for interactively when omitted.
    description: Option<String>,

    /// Project directory (default: current directory).
    #[arg(long, value_name = "PATH")]
    dir: Option<PathBuf>,

    /// Instructions file (.txt or .md) appended to the system prompt.
    #[arg(long, value_name = "FILE")]
    instructions: Option<PathBuf>,

    /// Inline instructions, appended after the instructions file.
    #[arg(long, value_name = "TEXT")]
    instr: Option<String>,

    #[arg(long, default_value_t = 0.7)]
    temperature: f32,

    #[arg(long, default_value_t = 1500)]
    max_tokens: u32,

    #[arg(long, default_value_t = 1.0)]
    top_p: f32,

    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    frequency_penalty: f32,

    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    presence_penalty: f32,

    /// Config file (default: <dir>/.dodder/config.toml).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

impl RunArgs {
    fn params(&self) -> GenerationParams {
        GenerationParams {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
            frequency_penalty: self.frequency_penalty,
            presence_penalty: self.presence_penalty,
        }
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {:#}", err);
        std::process::exit(exit_code_for(&err));
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init()?;
    match cli.command {
        Command::List { config } => cmd_list(config),
        Command::Run(args) => cmd_run(args),
    }
}

/// Unreachable backends get their own exit code; everything else is a plain failure.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    let backend = err
        .downcast_ref::<BackendError>()
        .or_else(|| match err.downcast_ref::<AgentError>() {
            Some(AgentError::Backend(backend)) => Some(backend),
            _ => None,
        });
    match backend {
        Some(BackendError::Unavailable(_)) => exit_codes::BACKEND_UNAVAILABLE,
        _ => exit_codes::FAILED,
    }
}

fn load_config_for(explicit: Option<PathBuf>, project_dir: &Path) -> Result<DodderConfig> {
    let path = explicit.unwrap_or_else(|| default_config_path(project_dir));
    load_config(&path)
}

fn client_for(config: &DodderConfig) -> Result<OllamaClient> {
    let host = env::var(OLLAMA_HOST_ENV).ok();
    let url = config.backend.resolved_url(host.as_deref());
    OllamaClient::new(&url, config.backend.request_timeout())
}

fn cmd_list(config: Option<PathBuf>) -> Result<()> {
    let cwd = env::current_dir().context("read current directory")?;
    let config = load_config_for(config, &cwd)?;
    let client = client_for(&config)?;
    print_models(&client, &mut io::stdout().lock())
        .with_context(|| format!("list models at {}", client.base_url()))
}

fn print_models<M: ModelClient, W: Write>(client: &M, out: &mut W) -> Result<()> {
    let models = client.list_models()?;
    if models.is_empty() {
        writeln!(out, "No models found.")?;
    }
    for model in models {
        writeln!(out, "- {model}")?;
    }
    Ok(())
}

fn cmd_run(args: RunArgs) -> Result<()> {
    let root = resolve_root(args.dir.as_deref())?;
    let config = load_config_for(args.config.clone(), &root)?;

    let params = args.params();
    let errors = params.validate();
    if !errors.is_empty() {
        bail!("invalid generation parameters:\n- {}", errors.join("\n- "));
    }
    let instructions = load_instructions(args.instructions.as_deref(), args.instr.as_deref())?;

    let mut input = stdin_input();
    let request = match args.description.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => ask_description(&mut input)?,
    };

    let context = ProjectContext {
        model: args.model.clone(),
        root,
        instructions,
        params,
    };

    let cancel = CancelToken::new();
    listen_for_interrupts(cancel.clone());

    let shell_info = ShellInfo::detect();
    let shell = HostShell::new(
        shell_info.clone(),
        config.shell.command_timeout(),
        config.shell.output_limit_bytes,
        cancel.clone(),
    );
    let client = client_for(&config)?;
    let mut agent = AgentLoop::new(
        context,
        &shell_info,
        &client,
        &shell,
        LoopSettings::from_config(&config),
        cancel,
    )?;

    println!(
        "dodder: model {} at {}, shell {}, project {}",
        args.model,
        client.base_url(),
        shell_info,
        agent.context().root.display()
    );
    let outcome = run_session(&mut agent, &mut input, &request, print_event)?;
    println!("Session ended after {} turns.", outcome.turns);
    Ok(())
}

fn resolve_root(dir: Option<&Path>) -> Result<PathBuf> {
    let dir = match dir {
        Some(dir) => dir.to_path_buf(),
        None => env::current_dir().context("read current directory")?,
    };
    let root = fs::canonicalize(&dir)
        .with_context(|| format!("resolve project directory {}", dir.display()))?;
    if !root.is_dir() {
        bail!("project directory {} is not a directory", root.display());
    }
    Ok(root)
}

fn ask_description<I: UserInput>(input: &mut I) -> Result<String> {
    match input.read_line(DESCRIPTION_PROMPT)? {
        Some(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
        _ => bail!("no project description given"),
    }
}

fn print_event(event: SessionEvent<'_>) {
    match event {
        SessionEvent::Loop(event) => print_loop_event(event),
        SessionEvent::Suspended(suspension) => match suspension {
            Suspension::NextRequest => println!("\nWhat next? (exit to quit)"),
            Suspension::Feedback => println!("\nAny feedback? (exit to quit)"),
            Suspension::Escalated(err) => {
                eprintln!("\n{err}");
                println!("How should I continue? (exit to quit)");
            }
        },
    }
}

fn print_loop_event(event: &LoopEvent) {
    match event {
        LoopEvent::Action(action) => {
            println!("\n[{}] {}", action.kind().as_str(), action.user_message());
            if !action.thought().trim().is_empty() {
                println!("  thought: {}", action.thought());
            }
            if !action.next_step().trim().is_empty() {
                println!("  next: {}", action.next_step());
            }
        }
        LoopEvent::Inconsistent { declared, state } => {
            eprintln!("note: model declared '{}' while {}", declared.as_str(), state);
        }
        LoopEvent::CommandStarted { command, cwd } => {
            println!("$ {command}  (in {})", cwd.display());
        }
        LoopEvent::CommandFinished(result) => print_result(result),
        LoopEvent::Refused(violation) => eprintln!("refused: {violation}"),
        LoopEvent::Correction { error, attempt } => {
            eprintln!("invalid reply, asking for a correction (attempt {attempt}): {error}");
        }
        LoopEvent::BackendRetry { error, attempt } => {
            eprintln!("{error}; retrying ({attempt})");
        }
    }
}

fn print_result(result: &ExecutionResult) {
    if !result.stdout.trim().is_empty() {
        println!("{}", result.stdout.trim_end());
    }
    if !result.stderr.trim().is_empty() {
        eprintln!("{}", result.stderr.trim_end());
    }
    let status = match (result.success, &result.error) {
        (true, _) => "ok".to_string(),
        (false, Some(error)) => format!("failed: {error}"),
        (false, None) => "failed".to_string(),
    };
    println!("[{status}]");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_defaults() {
        let cli = Cli::parse_from(["dodder", "run", "llama3.1"]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.model, "llama3.1");
        assert_eq!(args.description, None);
        assert_eq!(args.params(), GenerationParams::default());
    }

    #[test]
    fn parse_run_with_options() {
        let cli = Cli::parse_from([
            "dodder",
            "run",
            "qwen2.5-coder",
            "make a todo app",
            "--dir",
            "/tmp",
            "--instr",
            "use pnpm",
            "--temperature",
            "0.2",
            "--max-tokens",
            "800",
            "--presence-penalty",
            "-0.5",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.description.as_deref(), Some("make a todo app"));
        assert_eq!(args.dir, Some(PathBuf::from("/tmp")));
        assert_eq!(args.instr.as_deref(), Some("use pnpm"));
        assert_eq!(args.max_tokens, 800);
        assert!((args.presence_penalty + 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn parse_list() {
        let cli = Cli::parse_from(["dodder", "list"]);
        assert!(matches!(cli.command, Command::List { config: None }));
    }

    #[test]
    fn unavailable_backend_maps_to_its_exit_code() {
        let err = anyhow::Error::new(BackendError::Unavailable("refused".to_string()))
            .context("list models");
        assert_eq!(exit_code_for(&err), exit_codes::BACKEND_UNAVAILABLE);

        let err = anyhow::Error::new(AgentError::Backend(BackendError::Unavailable(
            "refused".to_string(),
        )));
        assert_eq!(exit_code_for(&err), exit_codes::BACKEND_UNAVAILABLE);

        let err = anyhow::anyhow!("bad config");
        assert_eq!(exit_code_for(&err), exit_codes::FAILED);
    }

    #[test]
    fn prints_one_line_per_model() {
        let model = dodder::test_support::ScriptedModel::new(Vec::new())
            .with_models(&["llama3.1:latest", "qwen2.5-coder:7b"]);
        let mut out = Vec::new();
        print_models(&model, &mut out).expect("print");
        assert_eq!(
            String::from_utf8_lossy(&out),
            "- llama3.1:latest\n- qwen2.5-coder:7b\n"
        );

        let empty = dodder::test_support::ScriptedModel::new(Vec::new());
        let mut out = Vec::new();
        print_models(&empty, &mut out).expect("print");
        assert_eq!(String::from_utf8_lossy(&out), "No models found.\n");
    }

    #[test]
    fn empty_description_aborts() {
        let mut input = dodder::test_support::ScriptedInput::new(&["   "]);
        let err = ask_description(&mut input).unwrap_err();
        assert!(err.to_string().contains("no project description"));
        assert_eq!(input.prompts(), [DESCRIPTION_PROMPT.to_string()]);
    }
}
