//! Triggerhub - relay HTTP triggers to outbound-connected listeners
//!
//! `triggerhub dispatch` runs the broker, `triggerhub join` runs a listener.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use triggerhub::{
    config::{generate_token, TriggerhubConfig, DEFAULT_TOKEN_LENGTH},
    dispatcher::Dispatcher,
    listener::ListenerClient,
};

#[derive(Parser)]
#[command(name = "triggerhub")]
#[command(version)]
#[command(about = "Relay HTTP triggers to outbound-connected action listeners")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "TRIGGERHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher
    Dispatch {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Shared secret listeners must present
        #[arg(long, env = "TRIGGERHUB_TOKEN")]
        token: Option<String>,

        /// Serve over TLS
        #[arg(long)]
        tls: bool,

        /// TLS certificate (PEM)
        #[arg(long)]
        cert: Option<PathBuf>,

        /// TLS private key (PEM)
        #[arg(long)]
        key: Option<PathBuf>,
    },

    /// Connect to a dispatcher and serve the configured actions
    Join {
        /// Listener name
        #[arg(long)]
        name: Option<String>,

        /// Dispatcher host[:port]
        #[arg(long)]
        dispatcher: Option<String>,

        /// Dispatcher shared secret
        #[arg(long, env = "TRIGGERHUB_TOKEN")]
        token: Option<String>,

        /// Dial with wss://
        #[arg(long)]
        tls: bool,

        /// Redial after a lost connection
        #[arg(long)]
        reconnect: bool,
    },

    /// Print a random shared secret
    Token {
        /// Token length
        #[arg(long, default_value_t = DEFAULT_TOKEN_LENGTH)]
        length: usize,
    },

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("triggerhub={},tower_http=debug", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &cli.config {
        Some(path) => TriggerhubConfig::load(path)?,
        None => TriggerhubConfig::default(),
    };

    match cli.command {
        Commands::Dispatch {
            host,
            port,
            token,
            tls,
            cert,
            key,
        } => {
            let mut dispatcher = config.dispatcher;
            if let Some(host) = host {
                dispatcher.host = host;
            }
            if let Some(port) = port {
                dispatcher.port = port;
            }
            if let Some(token) = token {
                dispatcher.token = token;
            }
            dispatcher.tls_enabled |= tls;
            if cert.is_some() {
                dispatcher.tls_cert = cert;
            }
            if key.is_some() {
                dispatcher.tls_key = key;
            }
            run_dispatcher(Dispatcher::new(dispatcher)?).await?;
        }
        Commands::Join {
            name,
            dispatcher,
            token,
            tls,
            reconnect,
        } => {
            let mut listener = config.listener;
            if let Some(name) = name {
                listener.name = name;
            }
            if let Some(dispatcher) = dispatcher {
                listener.dispatcher_host = dispatcher;
            }
            if let Some(token) = token {
                listener.dispatcher_token = token;
            }
            listener.tls |= tls;
            listener.reconnect |= reconnect;
            run_listener(ListenerClient::new(listener)?).await?;
        }
        Commands::Token { length } => {
            println!("{}", generate_token(length));
        }
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
    }

    Ok(())
}

async fn run_dispatcher(dispatcher: Dispatcher) -> Result<()> {
    tracing::info!("Starting Triggerhub dispatcher");

    dispatcher
        .serve(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Shutting down..."),
                Err(e) => {
                    tracing::error!("Cannot listen for ctrl-c: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        })
        .await?;

    Ok(())
}

async fn run_listener(client: ListenerClient) -> Result<()> {
    let config = client.config();
    if config.actions.is_empty() {
        tracing::warn!("No actions configured; triggers will not match this listener");
    }
    tracing::info!(listener = %config.name, "Starting Triggerhub listener. Press Ctrl+C to stop.");

    client.run().await?;

    tracing::info!("Listener stopped");
    Ok(())
}

fn show_config(config: Option<&TriggerhubConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default().redacted();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}
