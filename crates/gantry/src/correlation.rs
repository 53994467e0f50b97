//! Correlation identifier extraction and the metadata keys it travels under.
//!
//! The correlation id is the 128-bit trace id of the call's distributed-trace
//! context, rendered as its canonical lowercase hex string. It exists only
//! when a trace context was established upstream (by a client or by the
//! gateway bridge); absence is a valid state, not an error.

use http::HeaderMap;
use opentelemetry::propagation::{Extractor, Injector};
use opentelemetry::trace::TraceContextExt;
use opentelemetry::Context;
use tonic::metadata::{MetadataKey, MetadataMap};

/// Response metadata/header key carrying the correlation id on both
/// transports.
pub const TRACE_ID_KEY: &str = "x-trace-id";

/// Inbound metadata/header key requesting per-call debug capture.
pub const TRACE_DEBUG_KEY: &str = "x-trace-debug";

/// Exact value of [`TRACE_DEBUG_KEY`] that enables debug capture.
pub const TRACE_DEBUG_VALUE: &str = "1";

/// Upper bound, in bytes, on a single captured payload attached to a span.
pub const MAX_SPAN_BYTES: usize = 64000;

/// Returns the canonical hex trace id of `cx`, if it carries a valid span
/// context. Pure and deterministic.
pub fn trace_id_hex(cx: &Context) -> Option<String> {
    let span = cx.span();
    let span_context = span.span_context();
    span_context
        .is_valid()
        .then(|| span_context.trace_id().to_string())
}

/// Reads text-map propagation fields out of HTTP headers.
pub(crate) struct HeaderExtractor<'a>(pub &'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|key| key.as_str()).collect()
    }
}

/// Writes text-map propagation fields into outbound gRPC metadata.
pub(crate) struct MetadataInjector<'a>(pub &'a mut MetadataMap);

impl Injector for MetadataInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        if let Ok(name) = MetadataKey::from_bytes(key.as_bytes()) {
            if let Ok(value) = value.parse() {
                self.0.insert(name, value);
            }
        }
    }
}
