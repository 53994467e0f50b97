//! Gantry is a server-side framework for tonic services: a per-call
//! middleware pipeline, an HTTP gateway bridged to the gRPC listener over a
//! loopback channel, and a multi-listener lifecycle with graceful,
//! deadline-bounded shutdown.
//!
//! # Architecture
//!
//! A [`Service`] owns up to four listeners:
//!
//! - **gRPC** (primary): serves every registered module's services through
//!   the full pipeline — call classification and correlation, optional
//!   profiler labels, debug payload capture, panic recovery.
//! - **HTTP gateway** (optional): module-provided axum routes that call the
//!   primary listener over a loopback channel, sharing the call's trace
//!   context so both hops report one correlation id.
//! - **metrics** and **profiler** (optional): application-provided routers
//!   on their own ports.
//!
//! # Correlation
//!
//! When an inbound call carries a trace context, its trace id is echoed to
//! the client under `x-trace-id` and stamped on every log line the pipeline
//! emits for the call. Calls without a trace context simply have no
//! correlation id; nothing is synthesized.
//!
//! # Debug capture
//!
//! A unary call with `x-trace-debug: 1` has its request and response
//! payloads buffered, rendered, sanitized and attached to a child span.
//! String fields under denylisted keys (`password` and friends) are
//! replaced with `"sanitized"` before anything leaves the process, and
//! attached payloads are capped at 64 kB.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use gantry::Service;
//!
//! # struct Greeter;
//! # impl gantry::GrpcModule for Greeter {
//! #     fn register_grpc(&self, _routes: &mut tonic::service::RoutesBuilder) {}
//! # }
//! # async fn run() -> Result<(), gantry::Error> {
//! let mut service = Service::builder()
//!     .name("greeter")
//!     .grpc_addr("0.0.0.0:50051")
//!     .http_addr("0.0.0.0:50052")
//!     .recovery(true)
//!     .module(Greeter)
//!     .build();
//!
//! service.start().await?;
//! tokio::signal::ctrl_c().await.ok();
//! service.stop(Duration::from_secs(30)).await?;
//! # Ok(())
//! # }
//! ```

mod body;
mod config;
mod context;
mod correlation;
mod error;
mod gateway;
mod lifecycle;
mod pipeline;
mod redact;
mod registry;
mod service;

pub use body::WireBody;
pub use config::{JsonOptions, PanicLogger, PayloadFormatter, ServiceConfig};
pub use context::{CallContext, CallKind, EnrichHook, EnrichHooks};
pub use correlation::{
    trace_id_hex, MAX_SPAN_BYTES, TRACE_DEBUG_KEY, TRACE_DEBUG_VALUE, TRACE_ID_KEY,
};
pub use error::Error;
pub use gateway::GatewayContext;
pub use redact::{Redactor, REDACTED};
pub use registry::{GrpcLayer, GrpcModule, GrpcService, HealthCheck, ModuleOptions};
pub use service::{Builder, Service};
