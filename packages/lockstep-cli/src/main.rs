//! Lockstep demo CLI
//!
//! Drives an inventory application on the engine over in-memory logs. `run`
//! sends a generated workload, then restarts a fresh engine from the same
//! logs and checks that replay rebuilt identical state. `serve` keeps the
//! engine running until interrupted.

mod inventory;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use dotenvy::dotenv;
use lockstep::{
    Engine, EngineConfig, EngineCounters, EngineStatus, InMemoryStore, MessageStore, SourceId,
};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::inventory::{ReorderOutput, Warehouse, Workload};

/// Stock level below which the reorder output restocks an item.
const REORDER_THRESHOLD: i64 = 3;
const REORDER_BATCH: i64 = 10;

#[derive(Parser)]
#[command(name = "lockstep-demo")]
#[command(about = "Run the lockstep inventory demo")]
struct Cli {
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a generated workload, then replay it into a fresh engine
    Run {
        /// Number of commands to send
        #[arg(long, default_value_t = 200)]
        commands: usize,
        /// Number of client sources
        #[arg(long, default_value_t = 4)]
        sources: SourceId,
        /// Workload seed
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },

    /// Keep the engine running, sending one generated command per tick
    Serve {
        /// Tick interval in milliseconds
        #[arg(long, default_value_t = 100)]
        tick_ms: u64,
        /// Stop after this many ticks
        #[arg(long)]
        ticks: Option<u64>,
        #[arg(long, default_value_t = 4)]
        sources: SourceId,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },

    /// Print the engine configuration loaded from the environment
    Config,
}

// ============================================================================
// JSON Response Types
// ============================================================================

#[derive(Serialize)]
struct RunSummary {
    counters: EngineCounters,
    stock: std::collections::BTreeMap<String, i64>,
    commands_logged: u64,
    events_logged: u64,
    replay: ReplaySummary,
}

#[derive(Serialize)]
struct ReplaySummary {
    status: EngineStatus,
    state_matches: bool,
    events_appended: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Load .env file if present (development)
    let _ = dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,lockstep=info,lockstep_demo=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env().context("Failed to load engine configuration")?;

    match cli.command {
        Commands::Run {
            commands,
            sources,
            seed,
        } => {
            let summary = run(&config, commands, sources, seed)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
        }
        Commands::Serve {
            tick_ms,
            ticks,
            sources,
            seed,
        } => {
            let counters = serve(&config, Duration::from_millis(tick_ms), ticks, sources, seed).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&counters)?);
            } else {
                print_counters(&counters);
            }
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn build_engine(
    config: &EngineConfig,
    warehouse: &Warehouse,
    stores: Option<(Box<dyn MessageStore>, Box<dyn MessageStore>)>,
) -> Result<Engine> {
    let (commands, events) = stores.unwrap_or_else(|| {
        (
            Box::new(InMemoryStore::new()) as Box<dyn MessageStore>,
            Box::new(InMemoryStore::new()) as Box<dyn MessageStore>,
        )
    });
    let engine = Engine::builder(commands, events)
        .with_config(config.clone())
        .with_processor(warehouse.processor())
        .with_applier(warehouse.applier())
        .with_output(ReorderOutput::new(
            REORDER_THRESHOLD,
            REORDER_BATCH,
            config.loopback_source_id,
        ))
        .build()
        .context("Failed to build engine")?;
    Ok(engine)
}

fn run(config: &EngineConfig, commands: usize, sources: SourceId, seed: u64) -> Result<RunSummary> {
    let warehouse = Warehouse::new();
    let mut engine = build_engine(config, &warehouse, None)?;
    engine.start()?;

    let mut workload = Workload::new(seed, sources);
    for _ in 0..commands {
        let (source_id, payload_type, payload) = workload.next_command();
        engine.send(source_id, payload_type, payload.as_bytes())?;
        engine.run_cycle()?;
    }
    engine.run_until_idle()?;

    let counters = engine.counters();
    let live_watermark = engine.base_state().last_applied_event_sequence();
    let commands_logged = engine.command_store().len();
    let events_logged = engine.event_store().len();
    info!(commands_logged, events_logged, "workload done, restarting from logs");

    let replayed = Warehouse::new();
    let mut engine = build_engine(config, &replayed, Some(engine.into_stores()))?;
    let status = engine.start()?;
    engine.run_until_idle()?;

    let state_matches = replayed.stock() == warehouse.stock()
        && engine.base_state().last_applied_event_sequence() == live_watermark;
    if !state_matches {
        warn!("replayed state differs from the live state");
    }

    Ok(RunSummary {
        counters,
        stock: warehouse.stock(),
        commands_logged,
        events_logged,
        replay: ReplaySummary {
            status,
            state_matches,
            events_appended: engine.event_store().len() - events_logged,
        },
    })
}

async fn serve(
    config: &EngineConfig,
    tick: Duration,
    ticks: Option<u64>,
    sources: SourceId,
    seed: u64,
) -> Result<EngineCounters> {
    let warehouse = Warehouse::new();
    let mut engine = build_engine(config, &warehouse, None)?;
    engine.start()?;
    info!(tick_ms = tick.as_millis() as u64, "engine serving, ctrl-c to stop");

    let mut workload = Workload::new(seed, sources);
    let mut interval = tokio::time::interval(tick);
    let mut sent = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            _ = interval.tick() => {
                let (source_id, payload_type, payload) = workload.next_command();
                engine.send(source_id, payload_type, payload.as_bytes())?;
                sent += 1;
                engine.run_until_idle()?;

                if sent % 50 == 0 {
                    let counters = engine.counters();
                    info!(
                        sent,
                        commits = counters.commits,
                        rollbacks = counters.rollbacks,
                        outputs_published = counters.outputs_published,
                        "serving"
                    );
                }
                if ticks.is_some_and(|limit| sent >= limit) {
                    break;
                }
            }
        }
    }

    Ok(engine.counters())
}

// ============================================================================
// Terminal Output
// ============================================================================

fn print_counters(counters: &EngineCounters) {
    println!("{}", "Engine".bright_blue().bold());
    println!("  commands sent        {}", counters.commands_sent);
    println!("  commands dispatched  {}", counters.commands_dispatched);
    println!("  duplicates skipped   {}", counters.duplicates_skipped);
    println!(
        "  commits / auto / rollbacks  {} / {} / {}",
        counters.commits.to_string().green(),
        counters.auto_commits,
        counters.rollbacks.to_string().yellow()
    );
    println!("  events applied       {}", counters.events_applied);
    println!(
        "  outputs published    {} (retries {}, failures {})",
        counters.outputs_published, counters.output_retries, counters.output_failures
    );
}

fn print_summary(summary: &RunSummary) {
    print_counters(&summary.counters);

    println!();
    println!("{}", "Stock".bright_blue().bold());
    for (item, level) in &summary.stock {
        println!("  {item:<8} {level}");
    }

    println!();
    println!("{}", "Replay".bright_blue().bold());
    println!(
        "  replayed {} of {} events",
        summary.replay.status.replayed_events, summary.events_logged
    );
    if summary.replay.state_matches && summary.replay.events_appended == 0 {
        println!("  {}", "state matches the live engine".green());
    } else {
        println!("  {}", "state differs from the live engine".red().bold());
    }
}
