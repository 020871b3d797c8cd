//! Response construction helpers.
//!
//! Every response carries `X-Trace-ID`; error bodies are always
//! `{status:"error", code:"<UPPER_SNAKE>", message}`.

use bytes::Bytes;
use fiber_core::trace::{TraceId, TRACE_HEADER};
use http_body_util::Full;
use hyper::header::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use hyper::{http, Response, StatusCode};
use serde_json::json;
use tracing::{debug, error};

pub type HttpResponse = Response<Full<Bytes>>;

pub fn json_response(
    status: StatusCode,
    trace: &TraceId,
    body: serde_json::Value,
    extra_headers: &[(String, String)],
) -> http::Result<HttpResponse> {
    let mut builder = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .header(TRACE_HEADER, trace.as_str());
    for (name, value) in extra_headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(Full::new(Bytes::from(body.to_string())))
}

/// Logs and builds an error response in the canonical error shape.
pub fn error_response(
    status: StatusCode,
    code: &str,
    message: &str,
    trace: &TraceId,
    extra_headers: &[(String, String)],
) -> http::Result<HttpResponse> {
    if status.is_server_error() {
        error!(code, message, trace_id = trace.as_str(), "request failed");
    } else {
        debug!(code, message, trace_id = trace.as_str(), "request rejected");
    }
    json_response(
        status,
        trace,
        json!({ "status": "error", "code": code, "message": message }),
        extra_headers,
    )
}

/// Content-Length gate, checked before the body is read. Chunked uploads
/// pass here and are re-checked against the collected body size.
pub fn verify_content_length(
    headers: &HeaderMap,
    max: usize,
    trace: &TraceId,
) -> Option<http::Result<HttpResponse>> {
    let declared = match headers.get(CONTENT_LENGTH) {
        Some(value) => value,
        None => {
            if headers.contains_key(TRANSFER_ENCODING) {
                return None;
            }
            return Some(error_response(
                StatusCode::LENGTH_REQUIRED,
                "LENGTH_REQUIRED",
                "missing Content-Length and Transfer-Encoding header",
                trace,
                &[],
            ));
        }
    };
    let parsed = declared.to_str().ok().and_then(|v| v.parse::<usize>().ok());
    match parsed {
        None => Some(error_response(
            StatusCode::BAD_REQUEST,
            "BAD_CONTENT_LENGTH",
            "invalid Content-Length header",
            trace,
            &[],
        )),
        Some(len) if len > max => Some(error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "PAYLOAD_TOO_LARGE",
            "payload exceeds limit",
            trace,
            &[],
        )),
        Some(_) => None,
    }
}

/// Trace id from the request, minted when absent or unusable.
pub fn trace_from_headers(headers: &HeaderMap) -> TraceId {
    headers
        .get(TRACE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(TraceId::generate)
}
