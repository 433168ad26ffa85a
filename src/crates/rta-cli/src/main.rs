//! rta command-line client - watch real-time activity subscriptions

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rta::{
    ActivationManager, ChannelSubscriber, ConsumerKind, Principal, RtaConfig, StaticTokenProvider,
    Topic, Transport, TransportFactory, WebSocketTransport,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// rta command-line client
#[derive(Parser, Debug)]
#[command(name = "rta")]
#[command(version)]
#[command(about = "Watch real-time activity subscriptions", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to resources and print every event as a JSON line
    Watch {
        /// Principal (xuid) that owns the connection
        #[arg(short, long)]
        principal: String,

        /// Bearer token for the connect handshake
        #[arg(long, env = "RTA_TOKEN", hide_env_values = true)]
        token: String,

        /// Raw resource URI to subscribe to (repeatable)
        #[arg(long = "uri", value_name = "URI")]
        uris: Vec<String>,

        /// Subscribe to device presence of this xuid (repeatable)
        #[arg(long = "presence", value_name = "XUID")]
        presence: Vec<u64>,

        /// Endpoint override
        #[arg(short, long)]
        endpoint: Option<String>,

        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the resource URI for a topic given as JSON
    Uri {
        /// Topic, e.g. {"kind":"device_presence","xuid":2533274800000000}
        #[arg(value_name = "JSON")]
        topic: String,
    },
    /// Show the effective configuration
    Config {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Watch {
            principal,
            token,
            uris,
            presence,
            endpoint,
            config,
        } => {
            let mut config = load_config(config.as_ref())?;
            if let Some(endpoint) = endpoint {
                config = config.with_endpoint(endpoint);
            }
            config.validate()?;

            let mut topics: Vec<Topic> =
                uris.into_iter().map(|uri| Topic::Custom { uri }).collect();
            topics.extend(presence.into_iter().map(|xuid| Topic::DevicePresence { xuid }));
            if topics.is_empty() {
                bail!("nothing to watch: pass at least one --uri or --presence");
            }

            watch(config, Principal::new(principal), token, topics).await?;
        }
        Command::Uri { topic } => {
            let topic: Topic = serde_json::from_str(&topic).context("invalid topic JSON")?;
            println!("{}", topic.uri());
        }
        Command::Config { config } => {
            let config = load_config(config.as_ref())?;
            println!("{:#?}", config);
        }
    }

    Ok(())
}

/// File (if any), then `RTA_*` environment overrides
fn load_config(path: Option<&PathBuf>) -> Result<RtaConfig> {
    let mut config = match path {
        Some(path) => RtaConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => RtaConfig::default(),
    };
    config.merge(RtaConfig::from_env()?);
    Ok(config)
}

async fn watch(
    config: RtaConfig,
    principal: Principal,
    token: String,
    topics: Vec<Topic>,
) -> Result<()> {
    let tokens = Arc::new(StaticTokenProvider::new(token));
    let factory: TransportFactory = Arc::new(move || -> Arc<dyn Transport> {
        Arc::new(WebSocketTransport::new(tokens.clone()))
    });
    let manager = ActivationManager::new(config, factory);

    let service = manager.activate(&principal, ConsumerKind::Title)?;
    service.add_connection_state_change_handler(|state| info!(state = %state, "Connection state"));
    service.add_subscription_error_handler(|event| {
        warn!(
            uri = %event.subscription.resource_uri(),
            error = ?event.error,
            message = %event.message,
            "Subscription rejected"
        )
    });
    service.add_resync_handler(|| warn!("Service requested resync"));

    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let mut subscriptions = Vec::with_capacity(topics.len());
    for topic in &topics {
        let (subscription, mut events) = ChannelSubscriber::subscribe(topic);
        service.add_subscription(&subscription)?;

        let uri = subscription.resource_uri().to_string();
        let out = out_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if out.send((uri.clone(), event)).is_err() {
                    break;
                }
            }
        });
        subscriptions.push(subscription);
    }
    drop(out_tx);

    info!(principal = %principal, count = subscriptions.len(), "Watching");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            Some((uri, event)) = out_rx.recv() => {
                let line = serde_json::json!({ "uri": uri, "event": event });
                println!("{}", line);
            }
            _ = &mut shutdown => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    for subscription in &subscriptions {
        if let Err(e) = service.remove_subscription(subscription) {
            warn!(error = %e, "Failed to remove subscription");
        }
    }
    manager.deactivate(&principal, ConsumerKind::Title);
    Ok(())
}
