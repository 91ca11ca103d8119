//! Sandbox Sync CLI
//!
//! Serves the apply/sync HTTP API, or parses a saved LLM response offline.

use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sandbox_sync::server::{self, AppState};
use sandbox_sync::{
    ApplyPipeline, Config, HttpProjectStore, HttpSandboxProvider, MemoryProjectStore,
    MemorySandboxProvider, ProjectOrchestrator, ProjectStore, ProjectSync, ResponseGrammar,
    Result, SandboxProvider, StreamingParser, TagGrammar, Validate,
};

#[derive(Debug, Parser)]
#[command(name = "sandbox-sync", version, about = "Apply LLM code output to preview sandboxes")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API.
    Serve {
        #[arg(long, default_value = "127.0.0.1:3000")]
        addr: SocketAddr,
    },
    /// Parse an LLM response and print its directives as JSON.
    Parse {
        /// Response file; reads stdin when omitted.
        file: Option<PathBuf>,
        /// Also print the streaming parse events as NDJSON.
        #[arg(long)]
        events: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let outcome = match cli.command {
        Command::Serve { addr } => serve(config, addr).await,
        Command::Parse { file, events } => parse(&config, file, events),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: Config, addr: SocketAddr) -> Result<()> {
    for warning in config.validate().into_result()? {
        tracing::warn!("{}", warning);
    }

    let provider: Arc<dyn SandboxProvider> = if config.sandbox.api_url.is_some() {
        Arc::new(HttpSandboxProvider::from_config(&config.sandbox)?)
    } else {
        tracing::info!("no sandbox API configured; using in-process sandboxes");
        Arc::new(MemorySandboxProvider::new(config.sandbox.app_root.clone()))
    };
    let store: Arc<dyn ProjectStore> = if config.storage.base_url.is_some() {
        Arc::new(HttpProjectStore::from_config(&config.storage)?)
    } else {
        tracing::info!("no storage API configured; projects are kept in memory");
        Arc::new(MemoryProjectStore::new())
    };
    tracing::info!(provider = provider.name(), store = store.name(), "starting server");

    let sync = Arc::new(ProjectSync::new(store, config.sync.clone()));
    let state = Arc::new(AppState {
        orchestrator: ProjectOrchestrator::new(provider, config.sandbox.clone(), Arc::clone(&sync)),
        pipeline: ApplyPipeline::new(config.apply.clone(), config.packages.clone()).with_sync(sync),
    });
    server::serve(state, addr).await
}

fn parse(config: &Config, file: Option<PathBuf>, events: bool) -> Result<()> {
    let text = match file {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            text
        }
    };

    if events {
        let mut parser = StreamingParser::new();
        let mut all = parser.push(&text);
        all.extend(parser.finish());
        for event in all {
            println!("{}", serde_json::to_string(&event)?);
        }
    }

    let grammar = TagGrammar::new(config.packages.runtime_provided.clone());
    let parsed = grammar.parse(&text);
    println!("{}", serde_json::to_string_pretty(&parsed)?);
    Ok(())
}
