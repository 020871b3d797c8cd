use std::sync::Arc;

use fiber_core::queue::SampleQueue;
use fiber_gateway::{server, Gateway};
use fiber_relay::buffer::DurableBuffer;
use fiber_relay::config::RelayConfig;
use fiber_relay::forwarder::Forwarder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    fiber_core::config::init_tracing("fiber-relay");

    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "relay cannot start");
            std::process::exit(1);
        }
    };

    let buffer = match DurableBuffer::open(
        &config.buffer_dir,
        config.buffer_max_bytes,
        config.buffer_retention,
    ) {
        Ok(buffer) => Arc::new(buffer),
        Err(e) => {
            error!(error = %e, "relay buffer cannot open");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let (forwarder, status) = match Forwarder::new(Arc::clone(&buffer), config.clone(), cancel.clone()) {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "forwarder cannot start");
            std::process::exit(1);
        }
    };

    let gateway = Gateway::new(
        config.gateway.clone(),
        Arc::clone(&buffer) as Arc<dyn SampleQueue>,
    )
    .with_federation(status);

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    let forwarder_handle = tokio::spawn(forwarder.run());

    if let Err(e) = server::serve(Arc::new(gateway), cancel.clone()).await {
        error!(error = %e, "relay front end exited with error");
    }
    cancel.cancel();
    let _ = forwarder_handle.await;
}
