//! The HTTP gateway listener.
//!
//! Gateway route handlers are plain axum handlers that translate between the
//! text protocol and the primary listener's gRPC services over a loopback
//! channel. The [`GatewayContext`] hands each module that channel plus the
//! translation knobs: trace propagation into the loopback call, metadata
//! echoing into response headers and JSON rendering options.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use http::{HeaderMap, HeaderValue, StatusCode};
use opentelemetry::propagation::TextMapPropagator;
use tonic::metadata::MetadataMap;
use tonic::transport::Channel;

use crate::config::{JsonOptions, ServiceConfig};
use crate::context::CallContext;
use crate::correlation::MetadataInjector;
use crate::registry::{GrpcModule, HealthCheck};

/// Everything a module's gateway routes need to call back into the primary
/// listener.
#[derive(Clone)]
pub struct GatewayContext {
    /// Loopback channel to the primary gRPC listener.
    pub channel: Channel,
    /// JSON rendering options for transcoded responses.
    pub json: JsonOptions,
    /// Whether routes may stream large file payloads instead of buffering.
    pub file_support: bool,
    /// Response metadata keys to copy into gateway response headers.
    pub headers_from_metadata: Vec<String>,
    propagator: Arc<dyn TextMapPropagator + Send + Sync>,
}

impl GatewayContext {
    pub(crate) fn new(
        channel: Channel,
        config: &ServiceConfig,
        propagator: Arc<dyn TextMapPropagator + Send + Sync>,
    ) -> Self {
        Self {
            channel,
            json: config.json,
            file_support: config.http_file_support,
            headers_from_metadata: config.headers_from_metadata.clone(),
            propagator,
        }
    }

    /// Injects the gateway call's trace context into a loopback request, so
    /// the gRPC side joins the same trace and reports the same correlation
    /// id.
    pub fn inject_trace<T>(&self, ctx: &CallContext, request: &mut tonic::Request<T>) {
        self.propagator
            .inject_context(&ctx.otel, &mut MetadataInjector(request.metadata_mut()));
    }

    /// Copies configured response metadata entries into HTTP response
    /// headers. Keys without a valid ASCII value are skipped.
    pub fn forward_metadata(&self, metadata: &MetadataMap, headers: &mut HeaderMap) {
        for key in &self.headers_from_metadata {
            let Some(value) = metadata.get(key.as_str()) else {
                continue;
            };
            let Ok(text) = value.to_str() else { continue };
            if let (Ok(name), Ok(value)) = (
                http::header::HeaderName::try_from(key.as_str()),
                HeaderValue::from_str(text),
            ) {
                headers.insert(name, value);
            }
        }
    }
}

impl std::fmt::Debug for GatewayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayContext")
            .field("json", &self.json)
            .field("file_support", &self.file_support)
            .field("headers_from_metadata", &self.headers_from_metadata)
            .finish_non_exhaustive()
    }
}

/// Assembles the gateway router: module routes first, probes merged on top.
pub(crate) fn build_router(
    modules: &[Arc<dyn GrpcModule>],
    ctx: &GatewayContext,
    config: &ServiceConfig,
    health: Option<Arc<dyn HealthCheck>>,
) -> Router {
    let mut router = Router::new();
    for module in modules {
        if module.options().http_routes {
            router = module.register_http(router, ctx);
        }
    }
    router.merge(health_router(
        &config.liveness_path,
        &config.readiness_path,
        health,
    ))
}

fn health_router(
    liveness_path: &str,
    readiness_path: &str,
    health: Option<Arc<dyn HealthCheck>>,
) -> Router {
    let live = health.clone();
    let ready = health;
    Router::new()
        .route(
            liveness_path,
            get(move || {
                let health = live.clone();
                async move {
                    let result = match &health {
                        Some(health) => health.live().await,
                        None => Ok(()),
                    };
                    probe_response(result)
                }
            }),
        )
        .route(
            readiness_path,
            get(move || {
                let health = ready.clone();
                async move {
                    let result = match &health {
                        Some(health) => health.ready().await,
                        None => Ok(()),
                    };
                    probe_response(result)
                }
            }),
        )
}

fn probe_response(result: Result<(), String>) -> (StatusCode, String) {
    match result {
        Ok(()) => (StatusCode::OK, "ok".to_owned()),
        Err(message) => (StatusCode::SERVICE_UNAVAILABLE, message),
    }
}
