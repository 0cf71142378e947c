//! kiln - parallel source-build orchestrator
//!
//! CLI front-end: parses the build request, seeds the engine with the
//! compiled-in recipes, and hands the rest to the loader.

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use kiln_core::{Builder, Engine, LoadError, Settings};

mod recipes;

/// kiln - parallel source-build orchestrator
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Override a global setting, e.g. MACHINEARCH=arm
    #[arg(long = "set", value_name = "KEY=VALUE")]
    set: Vec<String>,

    /// Number of loader slots (defaults to 2 x CPU count)
    #[arg(long)]
    loaders: Option<i64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build carton(s); a target may name a stage or a task force
    Carton {
        /// Cartons to build, each `name[@target]`
        #[arg(required = true)]
        cartons: Vec<String>,

        /// Skip dependency scheduling
        #[arg(long)]
        nodeps: bool,

        /// Drop all stage markers first, forcing a full replay
        #[arg(long)]
        force: bool,
    },

    /// Show a carton's summary and runbook
    Info {
        /// Carton name
        name: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&cli.verbosity).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let settings = Settings::new();
    for pair in &cli.set {
        match pair.split_once('=') {
            Some((key, value)) => settings.set(key, value),
            None => {
                eprintln!("--set wants KEY=VALUE, got {pair}");
                return ExitCode::FAILURE;
            }
        }
    }
    if let Some(loaders) = cli.loaders {
        settings.set("MAXLOADERS", loaders);
    }

    let engine = Engine::new(settings);
    recipes::register(&engine);
    tracing::debug!("recipes registered");

    match run(&engine, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(engine: &Engine, command: Commands) -> Result<()> {
    match command {
        Commands::Carton {
            cartons,
            nodeps,
            force,
        } => {
            let loader = engine.new_loader("kiln").await.map_err(busy_hint)?;
            loader.run(&cartons, nodeps, force).await?;
            Ok(())
        }
        Commands::Info { name } => {
            let inventory = engine.build_inventory().await?;
            let found = inventory.find(&name)?;
            print!("{}", found.builder.summary());

            let info = found.builder.runbook().info();
            let stages: Vec<String> = info
                .stages
                .iter()
                .map(|(name, tasks)| format!("{name}[{tasks}]"))
                .collect();
            println!("Stages: {}", stages.join(" -> "));
            if !info.forces.is_empty() {
                let mut forces = info.forces.clone();
                forces.sort();
                println!("Task forces: {}", forces.join(" "));
            }
            Ok(())
        }
    }
}

/// Surface the lockfile-busy condition with its own message shape so
/// wrappers can tell it apart from build failures.
fn busy_hint(e: LoadError) -> anyhow::Error {
    match e {
        LoadError::Busy { tool } => anyhow::anyhow!("another instance of {tool} is running"),
        other => other.into(),
    }
}
