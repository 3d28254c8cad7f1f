//! `droidpilot` command line.
//!
//! Runs a free-text mobile test procedure against an adb device and prints the
//! outcome as JSON. The exit code reflects the verdict (see [`exit_codes`]).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;

use droidpilot::agents::actor::OracleActionExecutor;
use droidpilot::agents::decomposer::DecomposerAgent;
use droidpilot::core::types::OutcomeStatus;
use droidpilot::exit_codes;
use droidpilot::io::config::{EngineConfig, load_config, write_config};
use droidpilot::io::device::AdbScreenProvider;
use droidpilot::io::oracle::CodexOracle;
use droidpilot::io::prompt::PromptBuilder;
use droidpilot::io::report::JsonlReportSink;
use droidpilot::logging;
use droidpilot::looping::{Collaborators, run_test};

const DEFAULT_CONFIG: &str = ".droidpilot/config.toml";
const DEFAULT_STATE_DIR: &str = ".droidpilot/state";

#[derive(Parser)]
#[command(
    name = "droidpilot",
    version,
    about = "Objective-tracking replan engine for mobile test automation"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default config to `.droidpilot/config.toml`.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run a test procedure to a verdict.
    Run {
        /// File holding the free-text test procedure.
        #[arg(short, long)]
        procedure: PathBuf,
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Directory for oracle call logs, screen captures and the run report.
        #[arg(long, default_value = DEFAULT_STATE_DIR)]
        state_dir: PathBuf,
    },
    /// Print the objective steps a procedure decomposes into.
    Decompose {
        #[arg(short, long)]
        procedure: PathBuf,
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        #[arg(long, default_value = DEFAULT_STATE_DIR)]
        state_dir: PathBuf,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(force),
        Command::Run {
            procedure,
            config,
            state_dir,
        } => cmd_run(&procedure, &config, &state_dir),
        Command::Decompose {
            procedure,
            config,
            state_dir,
        } => cmd_decompose(&procedure, &config, &state_dir),
    }
}

fn cmd_init(force: bool) -> Result<i32> {
    let path = Path::new(DEFAULT_CONFIG);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &EngineConfig::default())?;
    println!("{}", path.display());
    Ok(exit_codes::PASS)
}

fn cmd_run(procedure: &Path, config: &Path, state_dir: &Path) -> Result<i32> {
    let procedure = read_procedure(procedure)?;
    let cfg = load_config(config)?;
    fs::create_dir_all(state_dir)
        .with_context(|| format!("create state dir {}", state_dir.display()))?;
    let workdir = std::env::current_dir().context("resolve working directory")?;

    let oracle = CodexOracle::new(&workdir, state_dir, cfg.oracle.clone());
    let actor = OracleActionExecutor::new(
        CodexOracle::with_side_effects(&workdir, state_dir, cfg.oracle.clone()),
        cfg.prompt_budget_bytes,
        cfg.knowhow().map(str::to_string),
    )?;
    let screen = AdbScreenProvider::new(cfg.device.clone(), state_dir);
    let sink = JsonlReportSink::create(&state_dir.join("report.jsonl"))?;

    let outcome = run_test(
        &procedure,
        &Collaborators {
            oracle: &oracle,
            screen: &screen,
            actor: &actor,
            sink: &sink,
        },
        &cfg,
    )?;
    print_json(&outcome)?;
    Ok(match outcome.status {
        OutcomeStatus::Pass => exit_codes::PASS,
        OutcomeStatus::Fail => exit_codes::FAIL,
        OutcomeStatus::NeedsReview => exit_codes::NEEDS_REVIEW,
    })
}

fn cmd_decompose(procedure: &Path, config: &Path, state_dir: &Path) -> Result<i32> {
    let procedure = read_procedure(procedure)?;
    let cfg = load_config(config)?;
    fs::create_dir_all(state_dir)
        .with_context(|| format!("create state dir {}", state_dir.display()))?;
    let workdir = std::env::current_dir().context("resolve working directory")?;

    let oracle = CodexOracle::new(&workdir, state_dir, cfg.oracle.clone());
    let prompts = PromptBuilder::new(cfg.prompt_budget_bytes)?;
    let progress = DecomposerAgent::new(&prompts, cfg.knowhow()).run(&oracle, &procedure)?;
    print_json(&progress)?;
    Ok(exit_codes::PASS)
}

fn read_procedure(path: &Path) -> Result<String> {
    let procedure =
        fs::read_to_string(path).with_context(|| format!("read procedure {}", path.display()))?;
    if procedure.trim().is_empty() {
        bail!("procedure {} is empty", path.display());
    }
    Ok(procedure)
}

/// Print `value` as pretty JSON on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
