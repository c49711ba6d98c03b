use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use toolbox_launcher::{
    Attached, Config, Delivery, EventBus, Launcher, OutputEvent, ProcessSlot, SlotSelection,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "toolbox-launcher")]
#[command(about = "Launch the toolbox helpers and stream their output", long_about = None)]
struct Args {
    /// Config file (defaults to the standard search path)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start services and print their output events (both when no flag is given)
    Run {
        #[arg(long)]
        skin: bool,
        #[arg(long)]
        helper: bool,
    },
    /// Start one slot and print its output until it exits
    Watch {
        /// Slot name: skin or helper
        slot: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "toolbox_launcher=debug"
    } else {
        "toolbox_launcher=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };

    let (bus, events) = EventBus::new(1024);
    let launcher = Launcher::new(config, Arc::new(bus));

    let result = match args.command {
        Command::Run { skin, helper } => {
            let (skin, helper) = if skin || helper { (skin, helper) } else { (true, true) };
            run_services(&launcher, events, skin, helper).await
        }
        Command::Watch { slot } => watch(&launcher, &slot).await,
    };

    launcher.shutdown().await;
    result
}

async fn run_services(
    launcher: &Launcher,
    mut events: mpsc::Receiver<OutputEvent>,
    skin: bool,
    helper: bool,
) -> Result<()> {
    let selections = [
        SlotSelection::new(ProcessSlot::Skin, skin),
        SlotSelection::new(ProcessSlot::Helper, helper),
    ];
    let started = launcher
        .start_many(&selections, Delivery::Push)
        .context("Failed to start services")?;

    let forwarders: Vec<_> = started
        .into_iter()
        .filter_map(|(_, attached)| match attached {
            Attached::Push(forwarder) => Some(forwarder),
            Attached::Pull(_) => None,
        })
        .collect();

    // Resolves once every process's output has closed
    let mut drained = tokio::spawn(async move {
        for forwarder in forwarders {
            let _ = forwarder.await;
        }
    });

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => println!("[{}] {}", event.name, event.payload),
                None => break,
            },
            _ = &mut drained => {
                // Forwarders are done, so everything they emitted is buffered
                while let Ok(event) = events.try_recv() {
                    println!("[{}] {}", event.name, event.payload);
                }
                info!("All services exited");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping services");
                break;
            }
        }
    }

    Ok(())
}

async fn watch(launcher: &Launcher, slot: &str) -> Result<()> {
    let mut output = launcher
        .watch_output(slot)
        .with_context(|| format!("Failed to start {slot}"))?;

    loop {
        tokio::select! {
            line = output.recv() => match line {
                Some(line) => println!("{line}"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping {slot}");
                break;
            }
        }
    }

    Ok(())
}
