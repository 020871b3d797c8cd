use std::sync::Arc;

use fiber_core::pg_queue::PgQueue;
use fiber_core::queue::{MemoryQueue, SampleQueue};
use fiber_gateway::config::GatewayConfig;
use fiber_gateway::read::PgMetricsReader;
use fiber_gateway::{server, Gateway};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    fiber_core::config::init_tracing("fiber-gateway");

    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "gateway cannot start");
            std::process::exit(1);
        }
    };

    let queue: Arc<dyn SampleQueue> = if config.queue_url == "mem:" {
        info!("using in-process queue");
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

    let mut gateway = Gateway::new(config, queue);
    if let Some(db_url) = gateway.config.db_url.clone() {
        match sqlx::postgres::PgPoolOptions::new()
            .max_connections(4)
            .connect(&db_url)
            .await
        {
            Ok(pool) => {
                gateway = gateway.with_reader(Arc::new(PgMetricsReader::new(pool)));
            }
            Err(e) => {
                // the read path is optional; ingest must come up regardless
                error!(error = %e, "read-path database unavailable, serving empty reads");
            }
        }
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    if let Err(e) = server::serve(Arc::new(gateway), cancel).await {
        error!(error = %e, "gateway exited with error");
        std::process::exit(1);
    }
}
