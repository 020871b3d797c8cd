//! The endpoint handler: one function per route, one fixed pipeline for
//! writes: auth, size gate, validation, idempotency, rate limit, enqueue.

use std::sync::Arc;

use bytes::Bytes;
use fiber_core::auth::{Actor, AuthError, TokenVerifier};
use fiber_core::queue::ETL_DLQ;
use fiber_core::sample::{
    Envelope, Sample, SampleBatch, MAX_BATCH_BYTES, MAX_BATCH_SAMPLES, MAX_SAMPLE_BYTES,
};
use fiber_core::trace::TraceId;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{http, Method, Request, StatusCode};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::http_utils::{
    error_response, json_response, trace_from_headers, verify_content_length, HttpResponse,
};
use crate::rate_limit::{EndpointClass, RateCheck};
use crate::Gateway;

pub async fn handle(
    gateway: Arc<Gateway>,
    req: Request<Incoming>,
) -> http::Result<HttpResponse> {
    let trace = trace_from_headers(req.headers());
    match (req.method(), req.uri().path()) {
        (&Method::POST, "/push") => handle_push(gateway, req, trace).await,
        (&Method::POST, "/ingest") => handle_ingest(gateway, req, trace).await,
        (&Method::GET, "/status") => handle_status(gateway, trace).await,
        (&Method::GET, "/metrics") => handle_metrics(gateway, req, trace).await,
        (&Method::GET, "/federation/status") => handle_federation_status(gateway, trace).await,
        _ => error_response(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "no such endpoint",
            &trace,
            &[],
        ),
    }
}

/// Auth step shared by every protected route. `Err` carries the finished
/// response so callers can bubble it with `?`-like early return.
fn authenticate(
    gateway: &Gateway,
    req: &Request<Incoming>,
    declared_region: Option<&str>,
    trace: &TraceId,
    resource: &str,
) -> Result<Actor, http::Result<HttpResponse>> {
    let token = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(TokenVerifier::bearer)
        .unwrap_or("");

    match gateway.verifier.verify(token, declared_region) {
        Ok(actor) => Ok(actor),
        Err(AuthError::RegionMismatch { token, declared }) => {
            gateway.audit.append(
                "unknown",
                "REGION_MISMATCH",
                resource,
                json!({ "token_region": token, "declared_region": declared }),
            );
            Err(error_response(
                StatusCode::UNAUTHORIZED,
                "INVALID_TOKEN",
                "token region does not match declared region",
                trace,
                &[],
            ))
        }
        Err(e) => {
            gateway.audit.append(
                "unknown",
                "AUTH_DENIED",
                resource,
                json!({ "reason": e.to_string() }),
            );
            Err(error_response(
                StatusCode::UNAUTHORIZED,
                "INVALID_TOKEN",
                "authentication failed",
                trace,
                &[],
            ))
        }
    }
}

async fn collect_body(
    req: Request<Incoming>,
    max: usize,
    trace: &TraceId,
) -> Result<Bytes, http::Result<HttpResponse>> {
    match req.into_body().collect().await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            if bytes.len() > max {
                Err(error_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "PAYLOAD_TOO_LARGE",
                    "payload exceeds limit",
                    trace,
                    &[],
                ))
            } else {
                Ok(bytes)
            }
        }
        Err(e) => Err(error_response(
            StatusCode::BAD_REQUEST,
            "MALFORMED_INPUT",
            &format!("failed to read body: {e}"),
            trace,
            &[],
        )),
    }
}

fn rate_gate(
    gateway: &Gateway,
    class: EndpointClass,
    key: &str,
    trace: &TraceId,
) -> Result<Vec<(String, String)>, http::Result<HttpResponse>> {
    match gateway.limiter.check(class, key) {
        RateCheck::Allowed { headers } => Ok(headers),
        RateCheck::Limited { headers, retry_after_s } => {
            debug!(key, retry_after_s, "rate limited");
            Err(error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                "rate limit exceeded",
                trace,
                &headers,
            ))
        }
        RateCheck::Overloaded => Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "OVERLOADED",
            "system over global capacity",
            trace,
            &[],
        )),
    }
}

async fn handle_push(
    gateway: Arc<Gateway>,
    req: Request<Incoming>,
    trace: TraceId,
) -> http::Result<HttpResponse> {
    let actor = match authenticate(&gateway, &req, None, &trace, "/push") {
        Ok(actor) => actor,
        Err(resp) => return resp,
    };

    if let Some(resp) = verify_content_length(req.headers(), MAX_SAMPLE_BYTES, &trace) {
        return resp;
    }
    let body = match collect_body(req, MAX_SAMPLE_BYTES, &trace).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    let sample: Sample = match serde_json::from_slice(&body) {
        Ok(sample) => sample,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "MALFORMED_INPUT",
                &format!("invalid sample payload: {e}"),
                &trace,
                &[],
            )
        }
    };
    if let Err(e) = sample.validate() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_SAMPLE",
            &e.to_string(),
            &trace,
            &[],
        );
    }

    let rate_headers = match rate_gate(&gateway, EndpointClass::Push, &actor.subject, &trace) {
        Ok(headers) => headers,
        Err(resp) => return resp,
    };

    let envelope = Envelope::new(sample, &trace, Some(gateway.config.region.clone()));
    let node_id = envelope.sample.node_id.clone();
    let payload = match serde_json::to_value(&envelope) {
        Ok(v) => v,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "MALFORMED_INPUT",
                &e.to_string(),
                &trace,
                &[],
            )
        }
    };

    if let Err(e) = gateway.queue.push(gateway.config.queue_name(), payload).await {
        warn!(error = %e, "enqueue failed, failing closed");
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "UNAVAILABLE",
            "queue backend unavailable",
            &trace,
            &rate_headers,
        );
    }

    let message_id = Uuid::new_v4().to_string();
    info!(node_id = %node_id, trace_id = trace.as_str(), "sample queued");
    json_response(
        StatusCode::ACCEPTED,
        &trace,
        json!({
            "status": "accepted",
            "message": "sample queued for processing",
            "data": { "message_id": message_id }
        }),
        &rate_headers,
    )
}

async fn handle_ingest(
    gateway: Arc<Gateway>,
    req: Request<Incoming>,
    trace: TraceId,
) -> http::Result<HttpResponse> {
    let declared_region = req
        .headers()
        .get("X-Region-ID")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let actor = match authenticate(&gateway, &req, declared_region.as_deref(), &trace, "/ingest") {
        Ok(actor) => actor,
        Err(resp) => return resp,
    };

    let Some(batch_id) = req
        .headers()
        .get("X-Batch-ID")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|v| !v.is_empty())
    else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "MALFORMED_BATCH",
            "missing X-Batch-ID header",
            &trace,
            &[],
        );
    };

    if let Some(resp) = verify_content_length(req.headers(), MAX_BATCH_BYTES, &trace) {
        return resp;
    }
    let body = match collect_body(req, MAX_BATCH_BYTES, &trace).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    let batch: SampleBatch = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "MALFORMED_BATCH",
                &format!("invalid batch payload: {e}"),
                &trace,
                &[],
            )
        }
    };
    if batch.samples.len() > MAX_BATCH_SAMPLES {
        return error_response(
            StatusCode::BAD_REQUEST,
            "MALFORMED_BATCH",
            &format!("batch of {} exceeds {MAX_BATCH_SAMPLES} samples", batch.samples.len()),
            &trace,
            &[],
        );
    }
    if let Err(e) = batch.validate() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_SAMPLE",
            &e.to_string(),
            &trace,
            &[],
        );
    }

    // duplicate batch ids are an idempotent accept, not an error
    if let Some(original) = gateway.idempotency.lookup(&batch_id) {
        debug!(batch_id, original, "duplicate batch, replaying accept");
        return json_response(
            StatusCode::CONFLICT,
            &trace,
            json!({
                "status": "accepted",
                "message": "batch already processed",
                "data": { "batch_id": batch_id, "enqueued": original }
            }),
            &[],
        );
    }

    let rate_headers = match rate_gate(&gateway, EndpointClass::Ingest, &actor.subject, &trace) {
        Ok(headers) => headers,
        Err(resp) => return resp,
    };

    let ingest_region = declared_region
        .or_else(|| batch.source_region.clone())
        .unwrap_or_else(|| gateway.config.region.clone());

    let mut payloads = Vec::with_capacity(batch.samples.len());
    for sample in batch.samples {
        let envelope = Envelope::new(sample, &trace, Some(ingest_region.clone()));
        match serde_json::to_value(&envelope) {
            Ok(v) => payloads.push(v),
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "MALFORMED_BATCH",
                    &e.to_string(),
                    &trace,
                    &[],
                )
            }
        }
    }

    let enqueued = match gateway
        .queue
        .push_all(gateway.config.queue_name(), payloads)
        .await
    {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, batch_id, "enqueue failed, failing closed");
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "UNAVAILABLE",
                "queue backend unavailable",
                &trace,
                &rate_headers,
            );
        }
    };

    gateway.idempotency.record(&batch_id, enqueued);
    info!(
        batch_id,
        enqueued,
        actor = %actor.subject,
        region = %ingest_region,
        trace_id = trace.as_str(),
        "batch queued"
    );
    json_response(
        StatusCode::ACCEPTED,
        &trace,
        json!({
            "status": "accepted",
            "data": { "batch_id": batch_id, "enqueued": enqueued }
        }),
        &rate_headers,
    )
}

async fn handle_status(gateway: Arc<Gateway>, trace: TraceId) -> http::Result<HttpResponse> {
    let queue_ok = gateway.queue.healthy().await;
    let dlq_depth = gateway.queue.len(ETL_DLQ).await.unwrap_or(0);
    let degraded = dlq_depth >= gateway.config.dlq_degrade_threshold;

    let status = if !queue_ok {
        "error"
    } else if degraded {
        "degraded"
    } else {
        "ok"
    };
    let body = json!({
        "status": status,
        "data": {
            "api": "ok",
            "queue": if queue_ok { "ok" } else { "error" },
            "dlq_depth": dlq_depth,
        }
    });
    let code = if queue_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(code, &trace, body, &[])
}

async fn handle_metrics(
    gateway: Arc<Gateway>,
    req: Request<Incoming>,
    trace: TraceId,
) -> http::Result<HttpResponse> {
    let actor = match authenticate(&gateway, &req, None, &trace, "/metrics") {
        Ok(actor) => actor,
        Err(resp) => return resp,
    };

    let rate_headers = match rate_gate(&gateway, EndpointClass::Metrics, &actor.subject, &trace) {
        Ok(headers) => headers,
        Err(resp) => return resp,
    };

    let query = req.uri().query().unwrap_or("");
    let node_id = query_param(query, "node_id");
    let limit = query_param(query, "limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(100usize);
    let offset = query_param(query, "offset")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0usize);

    let metrics = match &gateway.reader {
        Some(reader) => match reader.recent(node_id.as_deref(), limit, offset).await {
            Ok(rows) => serde_json::to_value(rows).unwrap_or_else(|_| json!([])),
            Err(e) => {
                return error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "UNAVAILABLE",
                    &e.to_string(),
                    &trace,
                    &rate_headers,
                )
            }
        },
        None => json!([]),
    };

    json_response(
        StatusCode::OK,
        &trace,
        json!({ "status": "ok", "data": { "metrics": metrics } }),
        &rate_headers,
    )
}

async fn handle_federation_status(
    gateway: Arc<Gateway>,
    trace: TraceId,
) -> http::Result<HttpResponse> {
    let depth = gateway
        .queue
        .len(gateway.config.queue_name())
        .await
        .unwrap_or(0);
    let mut body = json!({
        "status": "ok",
        "data": {
            "role": gateway.config.role.as_str(),
            "region": gateway.config.region,
            "queue_depth": depth,
            "source": "heartbeat",
        }
    });
    if let Some(reporter) = &gateway.federation {
        if let Some(data) = body["data"].as_object_mut() {
            if let serde_json::Value::Object(extra) = reporter.report() {
                data.extend(extra);
            }
        }
    }
    json_response(StatusCode::OK, &trace, body, &[])
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name && !v.is_empty()).then(|| v.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param() {
        assert_eq!(query_param("a=1&b=2", "b"), Some("2".to_string()));
        assert_eq!(query_param("a=1&b=2", "c"), None);
        assert_eq!(query_param("", "a"), None);
        assert_eq!(query_param("a=", "a"), None);
        assert_eq!(query_param("node_id=p1&limit=10", "node_id"), Some("p1".to_string()));
    }
}
