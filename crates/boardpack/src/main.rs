use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use boardpack::Result;
use boardpack::planner::{Stage, StageSelect};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Enable debug diagnostics on stderr (overridden by BOARDPACK_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download the upstream core, extract it and overlay the board files
    Setup {
        /// Path to the build definition TOML
        #[arg(default_value = "boardpack.toml")]
        config: PathBuf,
        /// Print what would run without executing task bodies
        #[arg(long)]
        dry_run: bool,
    },
    /// Archive the working tree and emit the board-manager manifest entry
    Build {
        /// Path to the build definition TOML
        #[arg(default_value = "boardpack.toml")]
        config: PathBuf,
        /// Print what would run without executing task bodies
        #[arg(long)]
        dry_run: bool,
    },
    /// Load config and print the computed task plan
    Plan {
        /// Path to the build definition TOML
        #[arg(default_value = "boardpack.toml")]
        config: PathBuf,
        /// setup, build or all
        #[arg(long, default_value = "all")]
        stage: StageSelect,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// Load config and print the fully-resolved TOML (after imports/extends)
    Resolve {
        /// Path to the build definition TOML
        #[arg(default_value = "boardpack.toml")]
        config: PathBuf,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("BOARDPACK_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    let res = match args.cmd {
        Command::Setup { config, dry_run } => {
            cmd_run(&config, StageSelect::Only(Stage::Setup), dry_run)
        }
        Command::Build { config, dry_run } => {
            cmd_run(&config, StageSelect::Only(Stage::Package), dry_run)
        }
        Command::Plan { config, stage, dot } => cmd_plan(&config, stage, dot),
        Command::Resolve { config } => cmd_resolve(&config),
    };
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn cmd_plan(path: &Path, stage: StageSelect, dot: bool) -> Result<()> {
    let doc = boardpack::config::load(path)?;
    let plan = boardpack::planner::build_plan(&doc, stage)?;

    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }

    let ordered = plan.ordered()?;
    for (i, task) in ordered.iter().enumerate() {
        println!(
            "{:>2}. {:<18}  {:<8} {:<9}  {}",
            i + 1,
            task.id,
            task.module,
            task.phase,
            task.label
        );
    }
    Ok(())
}

fn cmd_resolve(path: &Path) -> Result<()> {
    let doc = boardpack::config::load(path)?;
    let s = toml::to_string_pretty(&doc.value)
        .map_err(|e| boardpack::Error::msg(format!("failed to render config: {e}")))?;
    print!("{s}");
    Ok(())
}

fn cmd_run(path: &Path, stage: StageSelect, dry_run: bool) -> Result<()> {
    let doc = boardpack::config::load(path)?;
    let sink = Arc::new(boardpack::executor::StdoutSink::default());
    boardpack::run_stage(&doc, stage, dry_run, sink)
}
