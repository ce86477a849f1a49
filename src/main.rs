//! `hl7-mllp-ingest`: listens for MLLP framed HL7 v2 messages and writes them to stdout as an
//! event stream.
//!
//! ```bash
//! # everything from a config file
//! hl7-mllp-ingest --config ward-7.toml
//!
//! # or straight from the command line
//! hl7-mllp-ingest --port 6661 --output-kvp --remove-phi
//! ```
//!
//! Logging goes to stderr and is controlled with `RUST_LOG` (default `info`).

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use hl7_mllp_ingest::{queue, Config, Emitter, MllpServer, Sink};

#[derive(Parser, Debug)]
#[command(name = "hl7-mllp-ingest")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long)]
    bind: Option<String>,

    /// Emit flattened key=value pairs instead of raw messages
    #[arg(long)]
    output_kvp: bool,

    /// Strip PHI fields before emitting
    #[arg(long)]
    remove_phi: bool,
}

impl Args {
    fn load_config(&self) -> Result<Config, hl7_mllp_ingest::ConfigurationError> {
        let mut config = match &self.config {
            Some(path) => {
                info!("Loading config from {:?}", path);
                Config::from_file(path)?
            }
            None => Config::default(),
        };
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = &self.bind {
            config.bind_address = bind.clone();
        }
        config.output_kvp |= self.output_kvp;
        config.remove_phi |= self.remove_phi;
        Ok(config)
    }
}

/// Cancels `cancel` once `signal` fires.  A signal handler that could not be installed is logged
/// and leaves the server running.
async fn shutdown_on<F>(signal: F, cancel: CancellationToken)
where
    F: Future<Output = io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Shutdown signal received, stopping listener...");
            cancel.cancel();
        }
        Err(e) => error!("Unable to listen for the shutdown signal: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.load_config()?;

    let (producer, consumer) = queue::channel();
    let server = match MllpServer::bind(&config, producer).await {
        Ok(server) => server,
        Err(e) => {
            error!("Refusing to start: {}", e);
            return Err(e.into());
        }
    };

    info!(
        "Instance '{}' on {}, {:?} output, PHI removal {}",
        config.title,
        server.local_addr()?,
        config.output_mode(),
        if config.remove_phi { "on" } else { "off" }
    );

    let emitter = Emitter::new(config.output_mode(), config.routing(), Arc::new(Sink::stdout()))
        .with_filter(config.filter())
        .with_quoted_values(config.quote_values);
    let emitter = emitter.spawn(consumer)?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on(tokio::signal::ctrl_c(), cancel.clone()));

    server.run(cancel).await;

    // the producer went away with the server, so the emitter finishes once the queue drains
    let stats = tokio::task::spawn_blocking(move || emitter.join()).await?;
    match stats {
        Ok(stats) => info!(
            "Stopped, {} events written, {} dropped",
            stats.written, stats.dropped
        ),
        Err(_) => error!("Emitter thread panicked"),
    }
    Ok(())
}
