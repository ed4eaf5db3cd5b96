//! `room-ledger` command line.
//!
//! ```bash
//! room-ledger run scenario.json
//! room-ledger simulate --seed 7 --steps 5000
//! room-ledger genesis > genesis.json
//! ```

use std::{
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
};

use clap::{Parser, Subcommand};
use room_ledger::{
    config::GenesisConfig,
    script::{Script, ScriptRunner},
    simulation::{Simulation, SimulationConfig},
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "room-ledger")]
#[command(about = "Run room ledger scenarios against a simulated chain")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a JSON scenario script
    Run {
        script: PathBuf,
        /// Genesis file; overrides the one embedded in the script
        #[arg(long)]
        genesis: Option<PathBuf>,
    },
    /// Drive one room with random calls and check its invariants
    Simulate {
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long, default_value_t = 1_000)]
        steps: usize,
        /// Reward ids are drawn below this bound
        #[arg(long, default_value_t = 64)]
        reward_ids: u64,
        #[arg(long)]
        genesis: Option<PathBuf>,
    },
    /// Print the default genesis configuration
    Genesis,
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();

    let mut out = io::stdout().lock();
    match args.command {
        Command::Run { script, genesis } => {
            let loaded = Script::load(&script)?;
            let genesis = match genesis {
                Some(path) => GenesisConfig::load(&path)?,
                None => loaded.genesis.clone().unwrap_or_default(),
            };
            genesis.validate()?;
            tracing::info!(
                script = %script.display(),
                steps = loaded.steps.len(),
                "running script"
            );

            let report = ScriptRunner::new(genesis).run(&loaded)?;
            for step in &report.steps {
                writeln!(out, "{}", serde_json::to_string(step)?)?;
            }
            writeln!(out, "{}", serde_json::to_string_pretty(&report.snapshot)?)?;
            if report.mismatches > 0 {
                tracing::error!(mismatches = report.mismatches, "script expectations failed");
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Simulate {
            seed,
            steps,
            reward_ids,
            genesis,
        } => {
            let genesis = GenesisConfig::load_or_default(genesis.as_deref())?;
            let config = SimulationConfig {
                seed,
                steps,
                reward_id_space: reward_ids,
                ..SimulationConfig::default()
            };
            let report = Simulation::new(&genesis, config)?.run()?;
            writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
            if !report.is_clean() {
                tracing::error!(violations = report.violations.len(), "invariants violated");
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Genesis => {
            writeln!(
                out,
                "{}",
                serde_json::to_string_pretty(&GenesisConfig::default())?
            )?;
        }
    }
    Ok(ExitCode::SUCCESS)
}
