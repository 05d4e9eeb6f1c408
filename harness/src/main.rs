//! Send prompts to the agent under a chosen execution mode.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use harness::config::{HarnessConfig, load_config};
use harness::gateway::{self, GatewaySession, probe};
use harness::mode::{self, ModeConfig};
use harness::result::RunnerResult;
use harness::runner::Runner;
use harness::{HarnessError, Result, exit_codes, logging};

#[derive(Parser)]
#[command(
    name = "harness",
    version,
    about = "Run prompts against the agent directly or through a gateway"
)]
struct Cli {
    /// Execution mode: direct, native or docker. Falls back to $BRAINPRO_TEST_MODE, then direct.
    #[arg(long, global = true)]
    mode: Option<String>,

    /// Project root holding `target/release` and `validation/harness.toml`.
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,

    /// Print the full result (exit code, output, transcript) as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the resolved mode configuration.
    Resolve,
    /// Send one prompt.
    Oneshot { prompt: String },
    /// Send ordered turns to one session. Turns starting with `/` are control commands.
    Repl {
        #[arg(required = true)]
        turns: Vec<String>,
    },
    /// Check whether something accepts connections at the gateway address.
    Probe,
}

fn main() {
    logging::init();
    let code = match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            err.exit_code()
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let root = project_root(cli.project_root.as_deref())?;
    let selector = mode::selector_from_env(cli.mode);
    let mode_config = mode::resolve(selector.as_deref(), &root)?;
    let config = load_config(&HarnessConfig::path(&root))
        .map_err(|err| HarnessError::config(format!("{err:#}")))?;

    match cli.command {
        Command::Resolve => cmd_resolve(&mode_config, &config),
        Command::Probe => cmd_probe(&mode_config, &config),
        Command::Oneshot { prompt } => {
            let result = with_session(mode_config, &config, |runner| runner.oneshot(&prompt))?;
            Ok(print_result(&result, cli.json))
        }
        Command::Repl { turns } => {
            let result = with_session(mode_config, &config, |runner| runner.repl(turns))?;
            Ok(print_result(&result, cli.json))
        }
    }
}

fn project_root(flag: Option<&Path>) -> Result<PathBuf> {
    let root = match flag {
        Some(path) => path.to_path_buf(),
        None => std::env::current_dir()
            .map_err(|err| HarnessError::config(format!("read current dir: {err}")))?,
    };
    std::path::absolute(&root)
        .map_err(|err| HarnessError::config(format!("absolutize {}: {err}", root.display())))
}

fn cmd_resolve(mode_config: &ModeConfig, config: &HarnessConfig) -> Result<i32> {
    let address = gateway::expected_address(mode_config, config)?;
    println!(
        "resolve: mode={} project_root={} binary={} gateway={}",
        mode_config.mode(),
        mode_config.project_root().display(),
        mode_config.binary_path().display(),
        address.as_deref().unwrap_or("none")
    );
    Ok(exit_codes::OK)
}

fn cmd_probe(mode_config: &ModeConfig, config: &HarnessConfig) -> Result<i32> {
    let Some(address) = gateway::expected_address(mode_config, config)? else {
        println!("probe: mode={} gateway=none", mode_config.mode());
        return Ok(exit_codes::OK);
    };
    let reachable = probe::is_reachable(&address, config.gateway.probe_policy().connect_timeout);
    println!("probe: address={address} reachable={reachable}");
    Ok(if reachable {
        exit_codes::OK
    } else {
        exit_codes::GATEWAY
    })
}

/// Open the session, run one call, and always tear the gateway down.
fn with_session<F>(
    mode_config: ModeConfig,
    config: &HarnessConfig,
    call: F,
) -> Result<RunnerResult>
where
    F: FnOnce(&Runner) -> Result<RunnerResult>,
{
    let session = GatewaySession::open(mode_config, config)?;
    let result = session.runner(config).and_then(|runner| call(&runner));
    let closed = session.close();
    let result = result?;
    closed?;
    Ok(result)
}

fn print_result(result: &RunnerResult, json: bool) -> i32 {
    if json {
        match serde_json::to_string_pretty(result) {
            Ok(payload) => println!("{payload}"),
            Err(err) => eprintln!("serialize result: {err}"),
        }
    } else {
        print!("{}", result.output);
    }
    if result.exit_code == 0 {
        exit_codes::OK
    } else {
        exit_codes::AGENT_FAILED
    }
}
