mod case;
mod cli;
mod config;
mod fixtures;
mod judge;
mod outcome;
mod report;
mod results;
mod suite;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use harness::{HarnessError, exit_codes, logging};

#[derive(Parser)]
#[command(
    name = "validate",
    version,
    about = "Scenario suite for the agent across execution modes"
)]
struct Cli {
    /// Project root holding `validation/cases` and `fixtures/`. Defaults to the current directory.
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List cases under `validation/cases`.
    List,
    /// Run cases in one gateway session.
    Run {
        /// Execution mode: direct, native or docker. Falls back to $BRAINPRO_TEST_MODE, then direct.
        #[arg(long)]
        mode: Option<String>,
        /// Case id to run; repeatable. All cases when omitted.
        #[arg(long = "case")]
        cases: Vec<String>,
    },
    /// Aggregate captured results for a case.
    Report { case_id: String },
    /// Remove captured results for a case.
    Clean { case_id: String },
}

fn main() {
    logging::init();
    let code = match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            err.downcast_ref::<HarnessError>()
                .map_or(exit_codes::AGENT_FAILED, HarnessError::exit_code)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let project_root = match cli.project_root {
        Some(path) => path,
        None => std::env::current_dir().context("read current dir")?,
    };
    let project_root = std::path::absolute(&project_root)
        .with_context(|| format!("absolutize {}", project_root.display()))?;

    match cli.command {
        Command::List => cli::list_cases(&project_root),
        Command::Run { mode, cases } => cli::run_cases(&project_root, mode, &cases),
        Command::Report { case_id } => cli::report_case(&project_root, &case_id),
        Command::Clean { case_id } => cli::clean_case(&project_root, &case_id),
    }
}
