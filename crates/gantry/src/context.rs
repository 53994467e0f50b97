//! Per-call execution context and the enrichment hooks that extend it.
//!
//! A [`CallContext`] is built once per inbound call by the pipeline's call
//! stage, handed to the transport-appropriate enrichment hook, and then
//! stored in the request extensions where later stages and the handler can
//! read it. Replacement, not mutation: hooks take the context by value and
//! return the one to use for the remainder of the call.

use std::fmt;
use std::sync::Arc;

use http::Extensions;
use opentelemetry::Context;

/// The transport shape of an inbound call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    /// Single-response gRPC call.
    Unary,
    /// Server-streaming gRPC call.
    Stream,
    /// Text-protocol request on the gateway listener.
    Http,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallKind::Unary => "grpc-unary",
            CallKind::Stream => "grpc-stream",
            CallKind::Http => "http",
        })
    }
}

/// Execution context threaded through one inbound call.
///
/// After enrichment has run, the context carries the correlation id, the
/// determined remote address and any hook additions; subsequent stages only
/// read from it.
#[derive(Clone, Debug)]
pub struct CallContext {
    /// Transport shape of this call.
    pub kind: CallKind,
    /// Full method identifier (gRPC path or request URI path).
    pub method: String,
    /// Peer IP address, when the transport exposes one.
    pub remote_addr: Option<String>,
    /// Correlation id, when a distributed-trace context is active.
    pub trace_id: Option<String>,
    /// The OpenTelemetry context for this call, used for span parenting and
    /// explicit propagation into outbound calls.
    pub otel: Context,
    values: Extensions,
}

impl CallContext {
    pub(crate) fn new(
        kind: CallKind,
        method: String,
        remote_addr: Option<String>,
        trace_id: Option<String>,
        otel: Context,
    ) -> Self {
        Self {
            kind,
            method,
            remote_addr,
            trace_id,
            otel,
            values: Extensions::new(),
        }
    }

    /// Attaches an arbitrary value to the context, returning any previous
    /// value of the same type.
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.values.insert(value)
    }

    /// Reads a value previously attached with [`CallContext::insert`].
    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.values.get()
    }
}

/// A context enrichment hook.
///
/// Runs synchronously in the hot path of every call, so it must not block;
/// it is invoked once per call and must be safe for concurrent invocation
/// across calls.
pub type EnrichHook = Arc<dyn Fn(CallContext) -> CallContext + Send + Sync>;

/// One enrichment hook per transport shape. Defaults are the identity.
#[derive(Clone)]
pub struct EnrichHooks {
    pub unary: EnrichHook,
    pub stream: EnrichHook,
    pub http: EnrichHook,
}

impl EnrichHooks {
    pub(crate) fn for_kind(&self, kind: CallKind) -> &EnrichHook {
        match kind {
            CallKind::Unary => &self.unary,
            CallKind::Stream => &self.stream,
            CallKind::Http => &self.http,
        }
    }
}

impl Default for EnrichHooks {
    fn default() -> Self {
        let identity: EnrichHook = Arc::new(|ctx| ctx);
        Self {
            unary: identity.clone(),
            stream: identity.clone(),
            http: identity,
        }
    }
}

impl fmt::Debug for EnrichHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnrichHooks").finish_non_exhaustive()
    }
}

/// Determines the peer IP from whichever connect-info extension the serving
/// transport installed.
pub(crate) fn remote_addr(extensions: &Extensions) -> Option<String> {
    if let Some(info) = extensions.get::<tonic::transport::server::TcpConnectInfo>() {
        return info.remote_addr().map(|addr| addr.ip().to_string());
    }
    extensions
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|info| info.0.ip().to_string())
}
