//! CLI for sharedsub
//!
//! Subcommands:
//! - `consumer`: join a shared subscription and log every message handled
//! - `publisher`: publish an incrementing sequence number at a fixed interval

use std::time::Duration;

use clap::Parser;
use sharedsub::config::{LoggingSettings, Settings, load_config};
use sharedsub::{Client, ClientIdentity, ClientOptions, QoS, SessionStore, WebSocketConnector};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "sharedsub")]
enum Command {
    /// Consume a shared subscription as one member of the group
    Consumer {
        /// Topic filter to subscribe to
        #[arg(long, default_value = "$share/group1/device/+/data")]
        filter: String,
        /// Subscription QoS (0, 1 or 2)
        #[arg(long, default_value_t = 1)]
        qos: u8,
    },
    /// Publish `{"seq": n}` messages
    Publisher {
        #[arg(long, default_value = "device/1/data")]
        topic: String,
        /// Delay between two publishes
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
        #[arg(long, default_value_t = 1)]
        qos: u8,
    },
}

#[tokio::main]
async fn main() {
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            sharedsub::utils::logging::init(&LoggingSettings {
                level: "info".to_string(),
            });
            error!("Invalid configuration: {}", e);
            return;
        }
    };
    sharedsub::utils::logging::init(&settings.logging);

    let result = match cmd {
        Command::Consumer { filter, qos } => run_consumer(&settings, &filter, qos).await,
        Command::Publisher {
            topic,
            interval_ms,
            qos,
        } => run_publisher(&settings, &topic, interval_ms, qos).await,
    };
    if let Err(e) = result {
        error!("Exiting: {}", e);
    }
}

fn start_client(settings: &Settings, fallback_id: ClientIdentity) -> Client {
    let options = ClientOptions::from_settings(settings, fallback_id);
    let store = match settings.session.backend.as_str() {
        "memory" => SessionStore::in_memory(),
        _ => SessionStore::sled(&settings.session.path),
    };
    info!(
        "Connecting to {} as '{}'",
        settings.client.broker_url, options.client_id
    );
    Client::start(
        options,
        WebSocketConnector::new(settings.client.broker_url.clone()),
        store,
    )
}

async fn run_consumer(settings: &Settings, filter: &str, qos: u8) -> sharedsub::Result<()> {
    let qos = QoS::try_from(qos)?;
    let client = start_client(settings, ClientIdentity::for_consumer());
    let handle = client.handle().clone();

    let id = handle.client_id().clone();
    handle.register_handler(filter, move |_topic: &str, payload: &[u8], _qos: QoS| {
        info!("Handled by {}: {}", id, String::from_utf8_lossy(payload));
        Ok(())
    })?;
    handle.subscribe(filter, qos).await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
    }
    info!("Shutdown signal received. Exiting gracefully.");
    client.shutdown().await;
    Ok(())
}

async fn run_publisher(
    settings: &Settings,
    topic: &str,
    interval_ms: u64,
    qos: u8,
) -> sharedsub::Result<()> {
    let qos = QoS::try_from(qos)?;
    let client = start_client(settings, ClientIdentity::for_publisher());
    let handle = client.handle().clone();

    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    let mut seq: u64 = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received. Exiting gracefully.");
                break;
            }
            _ = ticker.tick() => {
                seq += 1;
                let message = serde_json::json!({ "seq": seq }).to_string();
                match handle.publish(topic, message.clone().into_bytes(), qos).await {
                    Ok(_) => info!("Published: {}", message),
                    Err(e) => warn!("Publish failed: {}", e),
                }
            }
        }
    }

    client.shutdown().await;
    Ok(())
}
