//! Trace-id generation and propagation.
//!
//! Trace ids are short opaque correlation tokens: 8 base62 characters when
//! we mint them, anything reasonable when a caller hands one to us. They
//! ride the `X-Trace-ID` header from probe to gateway, land in the queue
//! envelope `_meta`, and reappear in every ETL log line for that sample.

use std::fmt;
use std::str::FromStr;

use rand::Rng;

/// Header carrying the trace id on every hop.
pub const TRACE_HEADER: &str = "X-Trace-ID";

const GENERATED_LEN: usize = 8;
const MAX_ACCEPTED_LEN: usize = 64;
const BASE62: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("invalid trace id")]
pub struct InvalidTraceId;

/// Opaque correlation token.
///
/// Foreign ids are carried as-is (1–64 alphanumeric-or-dash characters);
/// rejecting them would break correlation across mixed fleets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceId(String);

impl TraceId {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let id: String = (0..GENERATED_LEN)
            .map(|_| BASE62[rng.gen_range(0..BASE62.len())] as char)
            .collect();
        TraceId(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TraceId {
    type Err = InvalidTraceId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ok = !s.is_empty()
            && s.len() <= MAX_ACCEPTED_LEN
            && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-');
        if ok {
            Ok(TraceId(s.to_string()))
        } else {
            Err(InvalidTraceId)
        }
    }
}
