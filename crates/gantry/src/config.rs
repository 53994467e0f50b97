//! Service configuration.
//!
//! [`ServiceConfig`] holds everything the builder collects before
//! [`Service::start`](crate::Service::start): listener addresses, feature
//! toggles and the injectable hooks. An empty address string disables the
//! corresponding listener.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::context::CallContext;
use crate::redact::Redactor;

/// Renders a captured payload for span attachment.
///
/// Receives the gRPC method path and the raw protobuf message bytes (frame
/// prefix already stripped) and returns the text to attach, or `None` to
/// skip attachment. The default renders the bytes as lossy UTF-8 and skips
/// empty payloads; installations that can resolve the method to a message
/// descriptor typically plug in a JSON transcoder here.
pub type PayloadFormatter = Arc<dyn Fn(&str, &[u8]) -> Option<String> + Send + Sync>;

/// Observes recovered panics, in addition to the built-in structured log.
pub type PanicLogger = Arc<dyn Fn(Option<&CallContext>, &str) + Send + Sync>;

pub(crate) fn default_payload_formatter() -> PayloadFormatter {
    Arc::new(|_method, bytes| {
        if bytes.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
    })
}

/// JSON rendering options applied by gateway route handlers when transcoding
/// protobuf responses.
#[derive(Clone, Copy, Debug)]
pub struct JsonOptions {
    /// Render enum fields as their integer values instead of their names.
    pub use_enum_numbers: bool,
    /// Emit fields that hold their default value.
    pub emit_unpopulated: bool,
}

impl Default for JsonOptions {
    fn default() -> Self {
        Self {
            use_enum_numbers: false,
            emit_unpopulated: true,
        }
    }
}

/// Resolved service configuration.
#[derive(Clone)]
pub struct ServiceConfig {
    /// Service name, used in log fields.
    pub name: String,
    /// Primary gRPC listener address. Always enabled.
    pub grpc_addr: String,
    /// Gateway listener address; empty disables the gateway entirely.
    pub http_addr: String,
    /// Metrics listener address; empty disables it.
    pub metrics_addr: String,
    /// Profiling listener address; empty disables it.
    pub profiling_addr: String,
    /// Convert handler panics into error responses instead of rethrowing.
    pub recovery_enabled: bool,
    /// Annotate calls with profiler labels.
    pub profiling_enabled: bool,
    /// Key denylist for payload sanitization.
    pub sanitize_keys: Vec<String>,
    /// Gateway path for the liveness probe.
    pub liveness_path: String,
    /// Gateway path for the readiness probe.
    pub readiness_path: String,
    /// Inbound gateway headers copied verbatim into gRPC metadata, and
    /// response metadata keys copied back into gateway response headers.
    pub headers_from_metadata: Vec<String>,
    /// JSON rendering options handed to gateway route handlers.
    pub json: JsonOptions,
    /// Advertise large-file streaming support to gateway route handlers.
    /// File-mode bodies bypass JSON transcoding, so routes using it cannot
    /// also serve arbitrary streamed calls.
    pub http_file_support: bool,
    /// Time allowed for a client to send its request headers on the HTTP
    /// listeners. `None` leaves slow clients unbounded.
    pub http_header_timeout: Option<Duration>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "grpc".to_owned(),
            grpc_addr: "0.0.0.0:50051".to_owned(),
            http_addr: "0.0.0.0:50052".to_owned(),
            metrics_addr: String::new(),
            profiling_addr: String::new(),
            recovery_enabled: false,
            profiling_enabled: false,
            sanitize_keys: Redactor::default_keys(),
            liveness_path: "/live".to_owned(),
            readiness_path: "/ready".to_owned(),
            headers_from_metadata: Vec::new(),
            json: JsonOptions::default(),
            http_file_support: false,
            http_header_timeout: None,
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("name", &self.name)
            .field("grpc_addr", &self.grpc_addr)
            .field("http_addr", &self.http_addr)
            .field("metrics_addr", &self.metrics_addr)
            .field("profiling_addr", &self.profiling_addr)
            .field("recovery_enabled", &self.recovery_enabled)
            .field("profiling_enabled", &self.profiling_enabled)
            .finish_non_exhaustive()
    }
}
