//! The per-call middleware pipeline.
//!
//! Every inbound request, on both listeners, passes through a fixed stack of
//! tower layers before reaching its handler. Outermost to innermost:
//!
//! 1. [`call`] — classifies the call, extracts the trace context, runs the
//!    enrichment hook and stamps the correlation id on the response.
//! 2. [`profiling`] — annotates the call for the profiler, when enabled.
//! 3. [`capture`] — buffers and sanitizes payloads into span attributes for
//!    debug-flagged unary calls.
//! 4. [`recovery`] — converts handler panics into error responses.
//!
//! Recovery sits innermost so a panic anywhere in a handler is caught before
//! it can unwind through the capture and correlation stages; capture sits
//! inside the call stage so the contexts it records are fully enriched.

pub(crate) mod call;
pub(crate) mod capture;
pub(crate) mod profiling;
pub(crate) mod recovery;

use std::collections::HashSet;
use std::sync::Arc;

use http::header::{HeaderValue, CONTENT_TYPE};
use http::Response;
use opentelemetry::global::BoxedTracer;
use opentelemetry::propagation::TextMapPropagator;

use crate::body::WireBody;
use crate::config::{PanicLogger, PayloadFormatter};
use crate::context::EnrichHooks;
use crate::redact::Redactor;

/// Shared, read-only state consulted by every pipeline stage.
pub(crate) struct PipelineState {
    pub propagator: Arc<dyn TextMapPropagator + Send + Sync>,
    pub tracer: BoxedTracer,
    pub redactor: Arc<Redactor>,
    pub hooks: EnrichHooks,
    pub streaming_methods: HashSet<String>,
    pub formatter: PayloadFormatter,
    pub panic_logger: Option<PanicLogger>,
    pub recovery_enabled: bool,
    pub profiling_enabled: bool,
}

/// Synthesizes a gRPC error response.
///
/// gRPC transports status in trailers over an HTTP 200; for a response that
/// never reached the handler the status goes in the headers of an empty
/// body (trailers-only form).
pub(crate) fn grpc_error_response<B: WireBody>(code: u32, message: &str) -> Response<B> {
    let mut response = Response::new(B::empty());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    headers.insert(
        "grpc-status",
        HeaderValue::from_str(&code.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("2")),
    );
    if let Ok(value) = HeaderValue::from_str(&percent_encode(message)) {
        headers.insert("grpc-message", value);
    }
    response
}

/// Synthesizes a plain-text HTTP error response for the gateway listener.
pub(crate) fn http_error_response<B: WireBody>(status: http::StatusCode, message: &str) -> Response<B> {
    let mut response = Response::new(B::from_text(message.to_owned()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Percent-encodes a `grpc-message` value per the gRPC HTTP/2 spec: bytes
/// outside the printable ASCII range (and `%` itself) become `%XX`.
pub(crate) fn percent_encode(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for byte in message.bytes() {
        match byte {
            b' '..=b'$' | b'&'..=b'~' => out.push(byte as char),
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}
