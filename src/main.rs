use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use flowctx::{
    CompletionGate, ContextBuilder, EventContext,
    config::{ConfigManager, EnvConfigManager, RuntimeConfig},
    logger::{LogLevel, init_tracing},
};
use serde_json::{Value, json};
use std::{path::PathBuf, time::{Duration, Instant}};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "flowctx",
    about = "Drive event context trees and watch them complete",
    version = "0.2.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fork a root event into children and wait for the whole tree to complete
    FanOut(FanOutArgs),
}

#[derive(Args, Debug)]
struct FanOutArgs {
    /// Number of child events to fork
    #[arg(long, default_value_t = 4)]
    children: usize,

    /// Hold completion behind an external gate that fires after all children are done
    #[arg(long)]
    gate: bool,

    /// Flow name stamped on the root event
    #[arg(long, default_value = "fan-out")]
    flow: String,

    /// Optional .env file with FLOWCTX_* settings
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::FanOut(args) => fan_out(args).await,
    }
}

async fn fan_out(args: FanOutArgs) -> anyhow::Result<()> {
    let manager = ConfigManager(EnvConfigManager::new(args.env_file));
    let mut config = RuntimeConfig::load(&manager).await?;
    if let Some(level) = args.log_level {
        config.log = config.log.with_level(level);
    }
    let _guard = init_tracing(&config.log)?;

    let gate = args.gate.then(CompletionGate::new);
    let mut builder = ContextBuilder::new(config.flow(&args.flow));
    if let Some(gate) = &gate {
        builder = builder.gate(gate.clone());
    }
    let root: EventContext<Value> = builder.build();
    info!(root = %root, children = args.children, "forking");

    let started = Instant::now();
    let mut workers = Vec::with_capacity(args.children);
    for index in 0..args.children {
        let child = EventContext::child(&root)?;
        workers.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5 * (index as u64 + 1))).await;
            child.success(Some(json!({ "child": index })))
        }));
    }
    root.success(Some(json!({ "forked": args.children })))?;

    for worker in workers {
        worker.await.context("child worker panicked")??;
    }

    if let Some(gate) = &gate {
        info!(pending = !root.is_complete(), "children done, firing gate");
        gate.fire()?;
    }

    match root.completion_signal().wait_for(config.await_timeout).await {
        Ok(()) => {
            info!(
                root = %root,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "event tree completed"
            );
            Ok(())
        }
        Err(err) => {
            error!(root = %root, "event tree did not complete: {err}");
            Err(err.into())
        }
    }
}
