//! mqtap - tap a broker from the command line
//!
//! Usage:
//!   mqtap --url nats://127.0.0.1:4222
//!   mqtap --url redis://cache:6379/0 --pattern 'orders.>' --no-firehose
//!   mqtap --url nats://127.0.0.1:4222 --durable --config mqtap.toml

use anyhow::Result;
use clap::Parser;
use mq_session::cli::{render, TapArgs};
use mq_session::ConnectionManager;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = TapArgs::parse();
    args.check_backend()?;
    let settings = args.settings()?;

    init_logging(&args, &settings.log_level);

    let manager = ConnectionManager::new(settings);
    let mut feed = manager.message_feed();

    manager.connect(args.connect_request()).await.map_err(|e| {
        error!("Failed to connect: {}", e);
        e
    })?;
    if let Some(summary) = manager.summary() {
        info!(
            provider = %summary.provider,
            url = %summary.url,
            firehose = ?summary.firehose,
            "Tapping"
        );
    }

    for pattern in &args.patterns {
        manager.subscribe(pattern).await?;
    }
    for stream in manager.streams() {
        info!(
            stream = %stream.name(),
            messages = stream.state.messages,
            "Stream available"
        );
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            delivery = feed.recv() => match delivery {
                Ok(message) => println!("{}", render(&message)),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Output fell behind"),
                Err(RecvError::Closed) => break,
            },
            _ = &mut shutdown => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    manager.disconnect().await?;
    let stats = manager.stats();
    info!(
        received = stats.messages_received,
        bytes = stats.bytes_received,
        duplicates = stats.duplicates_suppressed,
        "Session closed"
    );
    Ok(())
}

fn init_logging(args: &TapArgs, default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if args.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        // Deliveries go to stdout
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
