use fiber_probe::agent::Agent;
use fiber_probe::config::ProbeConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    fiber_core::config::init_tracing("fiber-probe");

    let config = match ProbeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "probe cannot start");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let agent = match Agent::new(config, cancel.clone()) {
        Ok(agent) => agent,
        Err(e) => {
            error!(error = %e, "probe cannot start");
            std::process::exit(1);
        }
    };

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            cancel.cancel();
        }
    });

    agent.run().await;
}
