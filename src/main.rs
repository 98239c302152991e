//! strata-worker - Write Consumer Entry Point
//!
//! Drains write batches from the queue transport into the memory store.
//! The transport hands batches over stdin as NDJSON (one JSON array of
//! queue messages per line); per-message failures are emitted on stdout as
//! JSON for partial-batch redelivery.

use std::sync::Arc;
use strata::memory::{self, QueueMessage};
use strata::Config;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the batch outcome protocol.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strata=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env()?;
    info!(
        store = %config.store_uri,
        model = %config.embed_model,
        "loaded configuration"
    );

    let system = memory::init_memory(&config);

    let (batch_tx, batch_rx) = mpsc::channel::<Vec<QueueMessage>>(16);
    let (outcome_tx, mut outcome_rx) = mpsc::channel(16);
    let worker = memory::spawn_consumer_loop(Arc::clone(&system.consumer), batch_rx, outcome_tx);

    let reporter = tokio::spawn(async move {
        while let Some(outcome) = outcome_rx.recv().await {
            match serde_json::to_string(&outcome) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "failed to encode batch outcome"),
            }
        }
    });

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let batch: Vec<QueueMessage> = match serde_json::from_str(&line) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "discarding undecodable batch line");
                continue;
            }
        };

        if batch_tx.send(batch).await.is_err() {
            break;
        }
    }

    drop(batch_tx);
    worker.await?;
    reporter.await?;

    info!("input closed, worker exiting");
    Ok(())
}
