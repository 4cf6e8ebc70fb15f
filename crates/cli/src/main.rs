//! Indexer entry point.
//!
//! This binary is the composition root. It:
//!
//! 1. parses [`settings::Settings`] from flags and environment;
//! 2. installs the tracing subscriber (and OTLP export when configured);
//! 3. loads the pipeline definition from a file or the control endpoint;
//! 4. builds the blob, status and graph adapters and the message broker,
//!    binds every stage route, and runs the worker and builder loops until
//!    SIGINT or SIGTERM.
//!
//! Any failure before the loops start exits non-zero.

mod app;
mod observability;
mod settings;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use settings::{LogFormat, RunArgs};

#[derive(Parser)]
#[command(name = "indexer", version)]
#[command(about = "Configuration-driven document indexing pipeline")]
struct Cli {
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty, env = "INDEXER_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker and builder loops
    Run(RunArgs),

    /// Check a pipeline definition file and print its stage order and routes
    Validate {
        #[arg(value_name = "PIPELINE_JSON")]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let telemetry = observability::init(cli.log_format)?;

    let result = match cli.command {
        Command::Run(args) => {
            let (stop, shutdown) = watch::channel(false);
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("shutdown requested; draining in-flight deliveries");
                let _ = stop.send(true);
            });
            app::run(args.into(), shutdown).await
        }
        Command::Validate { file } => validate(&file).await,
    };

    if let Err(error) = &result {
        error!("indexer stopped: {error:#}");
    }
    telemetry.shutdown();
    result
}

async fn validate(file: &std::path::Path) -> anyhow::Result<()> {
    let definition = app::read_definition(file).await?;
    println!("{} is valid", file.display());
    for (order, stage) in definition.progress_stages().iter().enumerate() {
        println!("{order:>3}  {stage}");
    }
    for route in definition.routes() {
        println!(
            "     {} --{}--> {}",
            route.exchange, route.routing_key, route.queue
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                warn!(%error, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
