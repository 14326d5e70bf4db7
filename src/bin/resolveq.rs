//! resolveq CLI: run simulated workloads against an engine and inspect
//! configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use resolveq::config::Config;
use resolveq::telemetry::{TelemetryConfig, init_telemetry};
use resolveq::{Engine, EngineConfig, Mode, WorkItem};

#[derive(Parser)]
#[command(name = "resolveq", version, about = "In-process admission and resolution engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a batch of timed work items and print the engine metadata
    Simulate {
        /// Number of work items to admit
        #[arg(long, default_value_t = 10)]
        items: u32,
        /// Concurrency ceiling (overrides RESOLVEQ_CONCURRENCY)
        #[arg(long)]
        concurrency: Option<usize>,
        /// Simulated work duration per item
        #[arg(long, default_value_t = 50)]
        delay_ms: u64,
        /// Make every Nth item fail (0 = never)
        #[arg(long, default_value_t = 0)]
        fail_every: u32,
        /// Feed results into a second, chained engine
        #[arg(long)]
        chain: bool,
        /// Engine config file (TOML), instead of the environment
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the effective engine configuration
    Config {
        /// Engine config file (TOML), instead of the environment
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Simulate {
            items,
            concurrency,
            delay_ms,
            fail_every,
            chain,
            config: file,
        } => {
            let _guard = init_telemetry(TelemetryConfig::from_config(&config, "resolveq"))?;
            let mut engine_config = engine_config(&config, file)?;
            if let Some(concurrency) = concurrency {
                engine_config = engine_config.concurrency(concurrency);
            }
            cmd_simulate(engine_config, items, delay_ms, fail_every, chain).await
        }
        Command::Config { file } => {
            let engine_config = engine_config(&config, file)?;
            println!("{}", serde_json::to_string_pretty(&engine_config)?);
            Ok(())
        }
    }
}

fn engine_config(config: &Config, file: Option<PathBuf>) -> anyhow::Result<EngineConfig> {
    match file {
        Some(path) => Ok(EngineConfig::from_toml_file(path)?),
        None => Ok(config.engine.clone()),
    }
}

async fn cmd_simulate(
    engine_config: EngineConfig,
    items: u32,
    delay_ms: u64,
    fail_every: u32,
    chain: bool,
) -> anyhow::Result<()> {
    let engine: Engine<u32> = Engine::new(engine_config.clone())?;

    let downstream = if chain {
        let downstream = Engine::new(
            EngineConfig::new(format!("{}-downstream", engine_config.name)).mode(Mode::Passive),
        )?;
        downstream.subscribe(&engine)?;
        Some(downstream)
    } else {
        None
    };

    let mut tickets = Vec::with_capacity(items as usize);
    for n in 1..=items {
        let fails = fail_every > 0 && n % fail_every == 0;
        tickets.push(engine.resolve(WorkItem::function(move |_| async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if fails {
                anyhow::bail!("item {n} failed");
            }
            Ok(n)
        }))?);
    }

    let mut failed = 0;
    for ticket in tickets {
        if ticket.await.is_err() {
            failed += 1;
        }
    }
    engine.set_complete();

    println!("{failed} of {items} item(s) failed");
    println!("{}", serde_json::to_string_pretty(&engine.get_metadata())?);

    if let Some(downstream) = downstream {
        while downstream.get_metadata().metrics.resolved() < u64::from(items) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        println!("{}", serde_json::to_string_pretty(&downstream.get_metadata())?);
    }

    Ok(())
}
