//! Mock central gateway for forwarder tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

#[derive(Clone, Debug)]
pub struct ReceivedRequest {
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
}

impl ReceivedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone)]
pub struct MockCentral {
    pub addr: SocketAddr,
    pub received: Arc<Mutex<Vec<ReceivedRequest>>>,
    ingest_status: Arc<AtomicU16>,
    status_status: Arc<AtomicU16>,
}

impl MockCentral {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock central");
        let addr = listener.local_addr().expect("failed to get local addr");
        let received = Arc::new(Mutex::new(Vec::new()));
        let ingest_status = Arc::new(AtomicU16::new(202));
        let status_status = Arc::new(AtomicU16::new(200));

        let received_clone = received.clone();
        let ingest_clone = ingest_status.clone();
        let status_clone = status_status.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let io = TokioIo::new(stream);
                let received = received_clone.clone();
                let ingest = ingest_clone.clone();
                let status = status_clone.clone();

                tokio::spawn(async move {
                    let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                        let received = received.clone();
                        let ingest = ingest.clone();
                        let status = status.clone();
                        async move {
                            let path = req.uri().path().to_string();
                            let headers: Vec<(String, String)> = req
                                .headers()
                                .iter()
                                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                                .collect();
                            let body_bytes = req
                                .into_body()
                                .collect()
                                .await
                                .map(|c| c.to_bytes().to_vec())
                                .unwrap_or_default();
                            let body = serde_json::from_slice(&body_bytes)
                                .unwrap_or(serde_json::Value::Null);

                            let code = if path == "/status" {
                                status.load(Ordering::SeqCst)
                            } else {
                                ingest.load(Ordering::SeqCst)
                            };
                            received.lock().unwrap().push(ReceivedRequest { path, headers, body });

                            Ok::<_, hyper::http::Error>(
                                Response::builder()
                                    .status(code)
                                    .body(Full::new(Bytes::from_static(
                                        br#"{"status":"accepted"}"#,
                                    )))
                                    .unwrap(),
                            )
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await;
                });
            }
        });

        MockCentral {
            addr,
            received,
            ingest_status,
            status_status,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ingest_responds_with(&self, status: u16) {
        self.ingest_status.store(status, Ordering::SeqCst);
    }

    pub fn status_responds_with(&self, status: u16) {
        self.status_status.store(status, Ordering::SeqCst);
    }

    pub fn requests_for(&self, path: &str) -> Vec<ReceivedRequest> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }
}
