//! HTTP serving loop with graceful shutdown.
//!
//! One accept loop, one spawned connection task per socket. A panicking
//! handler kills its connection, never the server. On cancellation the
//! listener stops accepting and in-flight connections get the configured
//! grace before the process moves on.

use std::io;
use std::sync::Arc;

use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::handlers;
use crate::{Gateway, GatewayError};

pub async fn serve(gateway: Arc<Gateway>, cancel: CancellationToken) -> Result<(), GatewayError> {
    let listener = TcpListener::bind(gateway.config.bind_addr).await?;
    serve_on(gateway, listener, cancel).await
}

/// Binds to an OS-assigned port; used by tests and single-host demos.
pub async fn bind(addr: std::net::SocketAddr) -> Result<TcpListener, GatewayError> {
    Ok(TcpListener::bind(addr).await?)
}

pub async fn serve_on(
    gateway: Arc<Gateway>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> Result<(), GatewayError> {
    let addr = listener.local_addr()?;
    info!(%addr, role = gateway.config.role.as_str(), "gateway listening");

    let server = hyper::server::conn::http1::Builder::new();
    let mut connections = tokio::task::JoinSet::new();

    loop {
        let conn = tokio::select! {
            accepted = listener.accept() => match accepted {
                Err(e) if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionRefused
                ) => continue,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    return Err(e.into());
                }
                Ok((conn, _)) => conn,
            },
            finished = async {
                match connections.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!("connection handler panicked: {e:?}");
                    }
                }
                continue;
            }
            _ = cancel.cancelled() => break,
        };

        let io = TokioIo::new(conn);
        let server = server.clone();
        let gateway = Arc::clone(&gateway);
        connections.spawn(async move {
            let service = service_fn(move |req| handlers::handle(Arc::clone(&gateway), req));
            if let Err(e) = server.serve_connection(io, service).await {
                // clients hanging up mid-request are routine
                tracing::debug!(error = %e, "connection closed with error");
            }
        });
    }

    info!("gateway draining connections");
    let grace = gateway.config.shutdown_grace;
    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(grace_s = grace.as_secs(), "shutdown grace expired, aborting connections");
        connections.abort_all();
    }
    info!("gateway stopped");
    Ok(())
}
