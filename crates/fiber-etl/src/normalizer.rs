//! Queue-item normalization.
//!
//! The queue carries whatever the gateway accepted, which over federation
//! hops and version skew can be looser than the typed model: numbers as
//! strings, epoch timestamps, uppercase regions. Normalization is lenient
//! where the gateway is strict: values are coerced and clipped rather
//! than rejected, because rejecting here would drop data the system
//! already promised to keep. Only an item with no usable identity is
//! refused (and routed to the DLQ by the worker).

use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use fiber_core::sample::{Envelope, EnvelopeMeta, Sample, MAX_LATENCY_MS, MAX_PCT};
use tracing::debug;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum NormalizeError {
    #[error("item is not a JSON object")]
    NotAnObject,

    #[error("item has no node_id")]
    MissingNodeId,
}

/// Coerces a raw queue item into a typed envelope.
pub fn normalize(raw: &serde_json::Value) -> Result<Envelope, NormalizeError> {
    let obj = raw.as_object().ok_or(NormalizeError::NotAnObject)?;

    let node_id = obj
        .get("node_id")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(NormalizeError::MissingNodeId)?
        .to_string();

    let country = obj
        .get("country")
        .and_then(|v| v.as_str())
        .map_or_else(|| "XX".to_string(), |c| {
            let upper: String = c.trim().to_uppercase();
            if upper.len() == 2 && upper.bytes().all(|b| b.is_ascii_uppercase()) {
                upper
            } else {
                "XX".to_string()
            }
        });

    let region_raw = obj
        .get("region")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");

    let timestamp = obj
        .get("timestamp")
        .map_or_else(Utc::now, to_timestamp)
        .trunc_subsecs(3);

    let meta = obj.get("_meta").and_then(|m| m.as_object());
    let envelope_meta = EnvelopeMeta {
        trace_id: meta
            .and_then(|m| m.get("trace_id"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
        ingest_region: meta
            .and_then(|m| m.get("ingest_region"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        ingest_ts: meta
            .and_then(|m| m.get("ingest_ts"))
            .map_or_else(Utc::now, to_timestamp),
    };

    let sample = Sample {
        region: canonical_region(&country, region_raw),
        node_id,
        country,
        latency_ms: to_f64(obj.get("latency_ms"), 0.0).clamp(0.0, MAX_LATENCY_MS),
        uptime_pct: to_f64(obj.get("uptime_pct"), 100.0).clamp(0.0, MAX_PCT),
        packet_loss: to_f64(obj.get("packet_loss"), 0.0).clamp(0.0, MAX_PCT),
        timestamp,
        target_host: obj
            .get("target_host")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        probe_type: obj
            .get("probe_type")
            .and_then(|v| v.as_str())
            .unwrap_or("ping")
            .to_string(),
        metadata: obj
            .get("metadata")
            .and_then(|v| v.as_object())
            .map(normalize_metadata),
    };

    Ok(Envelope {
        sample,
        meta: envelope_meta,
    })
}

/// `lower(country) + "-" + slug(region)`, e.g. `("GH", "Greater Accra")`
/// becomes `gh-greater-accra`.
pub fn canonical_region(country: &str, region: &str) -> String {
    format!("{}-{}", country.to_lowercase(), slug(region))
}

fn slug(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_dash = true; // suppress a leading dash
    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    if out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        "unknown".to_string()
    } else {
        out
    }
}

fn to_f64(value: Option<&serde_json::Value>, default: f64) -> f64 {
    match value {
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(default),
        Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or_else(|_| {
            debug!(value = %s, "unparseable number, using default");
            default
        }),
        Some(serde_json::Value::Bool(b)) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        _ => default,
    }
}

/// RFC 3339 strings and numeric epochs (seconds or milliseconds) both
/// land as UTC; anything else becomes "now" rather than dropping the item.
fn to_timestamp(value: &serde_json::Value) -> DateTime<Utc> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        serde_json::Value::Number(n) => {
            let raw = n.as_f64().unwrap_or(0.0);
            // heuristically: past ~2100 in seconds means it was milliseconds
            let secs = if raw > 4_102_444_800.0 { raw / 1000.0 } else { raw };
            Utc.timestamp_opt(secs as i64, ((secs.fract()) * 1e9) as u32)
                .single()
                .unwrap_or_else(Utc::now)
        }
        _ => Utc::now(),
    }
}

/// Metadata keys with numeric suffixes are coerced to numbers; everything
/// else rides through untouched.
fn normalize_metadata(
    meta: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    const NUMERIC_SUFFIXES: [&str; 5] = ["_percent", "_pct", "_ms", "_count", "_bytes"];
    meta.iter()
        .map(|(k, v)| {
            let coerced = if NUMERIC_SUFFIXES.iter().any(|s| k.ends_with(s)) {
                serde_json::Number::from_f64(to_f64(Some(v), 0.0))
                    .map_or_else(|| v.clone(), serde_json::Value::Number)
            } else {
                v.clone()
            };
            (k.clone(), coerced)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_well_formed_envelope() {
        let raw = json!({
            "node_id": "p1",
            "country": "GH",
            "region": "Greater Accra",
            "latency_ms": 42.5,
            "uptime_pct": 99.9,
            "packet_loss": 0.1,
            "timestamp": "2025-12-30T12:00:00.123Z",
            "_meta": {
                "trace_id": "abc12345",
                "ingest_region": "gh-accra",
                "ingest_ts": "2025-12-30T12:00:01Z"
            }
        });
        let env = normalize(&raw).unwrap();
        assert_eq!(env.sample.node_id, "p1");
        assert_eq!(env.sample.region, "gh-greater-accra");
        assert_eq!(env.meta.trace_id, "abc12345");
        assert_eq!(env.meta.ingest_region.as_deref(), Some("gh-accra"));
        assert_eq!(env.sample.timestamp.timestamp_subsec_millis(), 123);
    }

    #[test]
    fn test_missing_node_id_is_refused() {
        assert_eq!(normalize(&json!({"x": 1})), Err(NormalizeError::MissingNodeId));
        assert_eq!(normalize(&json!([1, 2])), Err(NormalizeError::NotAnObject));
        assert_eq!(
            normalize(&json!({"node_id": "  "})),
            Err(NormalizeError::MissingNodeId)
        );
    }

    #[test]
    fn test_string_numbers_coerced() {
        let raw = json!({
            "node_id": "p1",
            "country": "GH",
            "region": "Accra",
            "latency_ms": "42.5",
            "uptime_pct": "bogus",
            "packet_loss": null,
            "timestamp": "2025-12-30T12:00:00Z"
        });
        let env = normalize(&raw).unwrap();
        assert_eq!(env.sample.latency_ms, 42.5);
        assert_eq!(env.sample.uptime_pct, 100.0); // default
        assert_eq!(env.sample.packet_loss, 0.0);
    }

    #[test]
    fn test_out_of_bounds_values_clipped() {
        let raw = json!({
            "node_id": "p1",
            "country": "GH",
            "region": "Accra",
            "latency_ms": 99999.0,
            "uptime_pct": -5.0,
            "packet_loss": 150.0,
            "timestamp": "2025-12-30T12:00:00Z"
        });
        let env = normalize(&raw).unwrap();
        assert_eq!(env.sample.latency_ms, MAX_LATENCY_MS);
        assert_eq!(env.sample.uptime_pct, 0.0);
        assert_eq!(env.sample.packet_loss, 100.0);
    }

    #[test]
    fn test_bad_country_becomes_placeholder() {
        let raw = json!({
            "node_id": "p1",
            "country": "Ghana",
            "region": "Accra",
            "timestamp": "2025-12-30T12:00:00Z"
        });
        let env = normalize(&raw).unwrap();
        assert_eq!(env.sample.country, "XX");
        assert_eq!(env.sample.region, "xx-accra");
    }

    #[test]
    fn test_lowercase_country_is_upcased() {
        let raw = json!({
            "node_id": "p1",
            "country": "gh",
            "region": "Accra",
            "timestamp": "2025-12-30T12:00:00Z"
        });
        assert_eq!(normalize(&raw).unwrap().sample.country, "GH");
    }

    #[test]
    fn test_epoch_timestamps() {
        let secs = json!({
            "node_id": "p1", "country": "GH", "region": "A",
            "timestamp": 1_767_096_000
        });
        let env = normalize(&secs).unwrap();
        assert_eq!(env.sample.timestamp.timestamp(), 1_767_096_000);

        let millis = json!({
            "node_id": "p1", "country": "GH", "region": "A",
            "timestamp": 1_767_096_000_500i64
        });
        let env = normalize(&millis).unwrap();
        assert_eq!(env.sample.timestamp.timestamp(), 1_767_096_000);
        assert_eq!(env.sample.timestamp.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn test_timestamp_truncated_to_millis() {
        let raw = json!({
            "node_id": "p1", "country": "GH", "region": "A",
            "timestamp": "2025-12-30T12:00:00.123456789Z"
        });
        let env = normalize(&raw).unwrap();
        assert_eq!(env.sample.timestamp.timestamp_subsec_nanos() % 1_000_000, 0);
        assert_eq!(env.sample.timestamp.timestamp_subsec_millis(), 123);
    }

    #[test]
    fn test_region_slugging() {
        assert_eq!(canonical_region("GH", "Greater Accra"), "gh-greater-accra");
        assert_eq!(canonical_region("NG", "Lagos"), "ng-lagos");
        assert_eq!(canonical_region("DE", "Berlin / Mitte"), "de-berlin-mitte");
        assert_eq!(canonical_region("US", "  "), "us-unknown");
        assert_eq!(canonical_region("FR", "Île-de-France"), "fr-le-de-france");
    }

    #[test]
    fn test_metadata_numeric_suffix_coercion() {
        let raw = json!({
            "node_id": "p1", "country": "GH", "region": "A",
            "timestamp": "2025-12-30T12:00:00Z",
            "metadata": {
                "cpu_percent": "12.5",
                "queue_count": 3,
                "label": "free-form",
                "nested": {"deep": true}
            }
        });
        let env = normalize(&raw).unwrap();
        let meta = env.sample.metadata.unwrap();
        assert_eq!(meta["cpu_percent"], json!(12.5));
        assert_eq!(meta["queue_count"], json!(3.0));
        assert_eq!(meta["label"], json!("free-form"));
        assert_eq!(meta["nested"], json!({"deep": true}));
    }

    #[test]
    fn test_missing_meta_gets_placeholders() {
        let raw = json!({
            "node_id": "p1", "country": "GH", "region": "A",
            "timestamp": "2025-12-30T12:00:00Z"
        });
        let env = normalize(&raw).unwrap();
        assert_eq!(env.meta.trace_id, "unknown");
        assert_eq!(env.meta.ingest_region, None);
    }
}
