use std::sync::Arc;

use fiber_core::pg_queue::PgQueue;
use fiber_core::queue::{MemoryQueue, SampleQueue};
use fiber_etl::config::EtlConfig;
use fiber_etl::postgres::PgStore;
use fiber_etl::store::{MemoryStore, Store};
use fiber_etl::worker::Worker;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    fiber_core::config::init_tracing("fiber-etl");

    let config = match EtlConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "etl cannot start");
            std::process::exit(1);
        }
    };

    let queue: Arc<dyn SampleQueue> = if config.queue_url == "mem:" {
        warn!("using in-process queue; only meaningful when co-located with a gateway");
        Arc::new(MemoryQueue::new())
    } else {
        match PgQueue::connect(&config.queue_url).await {
            Ok(queue) => Arc::new(queue),
            Err(e) => {
                error!(error = %e, "queue backend unreachable");
                std::process::exit(1);
            }
        }
    };

    let store: Arc<dyn Store> = match &config.db_url {
        Some(url) => match PgStore::connect(url).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(error = %e, "storage unreachable");
                std::process::exit(1);
            }
        },
        None => {
            warn!("DB_URL unset, persisting to process memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    let mut handles = Vec::new();
    for id in 0..config.workers {
        let worker = Worker::new(
            id,
            config.clone(),
            Arc::clone(&queue),
            Arc::clone(&store),
            cancel.clone(),
        );
        handles.push(tokio::spawn(worker.run()));
    }
    for handle in handles {
        let _ = handle.await;
    }
}
