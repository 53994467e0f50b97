//! The service: builder, start and stop.
//!
//! A [`Service`] owns up to four listeners. The primary gRPC listener is
//! always present; the HTTP gateway, metrics and profiler listeners exist
//! only when configured. [`Service::start`] binds every configured socket
//! before serving any of them, so a half-started service is never left
//! behind on a bind failure. [`Service::stop`] drains in dependency order
//! under one shared deadline.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::service::RoutesBuilder;
use tonic::transport::{Channel, Endpoint, Server};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

use crate::config::{
    default_payload_formatter, JsonOptions, PanicLogger, PayloadFormatter, ServiceConfig,
};
use crate::context::EnrichHooks;
use crate::error::Error;
use crate::gateway::{build_router, GatewayContext};
use crate::lifecycle::{bind, spawn_http, ListenerTask};
use crate::pipeline::call::{CallLayer, Transport};
use crate::pipeline::capture::CaptureLayer;
use crate::pipeline::profiling::ProfilingLayer;
use crate::pipeline::recovery::RecoveryLayer;
use crate::pipeline::PipelineState;
use crate::redact::Redactor;
use crate::registry::{GrpcModule, HealthCheck, ModuleLayerStack};

type EndpointHook = Arc<dyn Fn(Endpoint) -> Endpoint + Send + Sync>;

/// Configures and constructs a [`Service`].
pub struct Builder {
    config: ServiceConfig,
    modules: Vec<Arc<dyn GrpcModule>>,
    health: Option<Arc<dyn HealthCheck>>,
    hooks: EnrichHooks,
    cors: Option<CorsLayer>,
    metrics_router: Option<Router>,
    profiler_router: Option<Router>,
    panic_logger: Option<PanicLogger>,
    formatter: PayloadFormatter,
    propagator: Arc<dyn TextMapPropagator + Send + Sync>,
    tracer: Option<BoxedTracer>,
    bridge_endpoint: Option<EndpointHook>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            config: ServiceConfig::default(),
            modules: Vec::new(),
            health: None,
            hooks: EnrichHooks::default(),
            cors: None,
            metrics_router: None,
            profiler_router: None,
            panic_logger: None,
            formatter: default_payload_formatter(),
            propagator: Arc::new(TraceContextPropagator::new()),
            tracer: None,
            bridge_endpoint: None,
        }
    }
}

impl Builder {
    /// Service name used in log fields.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Primary gRPC listener address.
    pub fn grpc_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.grpc_addr = addr.into();
        self
    }

    /// Gateway listener address. An empty string disables the gateway.
    pub fn http_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.http_addr = addr.into();
        self
    }

    /// Serves `router` on a dedicated metrics listener.
    pub fn metrics(mut self, addr: impl Into<String>, router: Router) -> Self {
        self.config.metrics_addr = addr.into();
        self.metrics_router = Some(router);
        self
    }

    /// Serves `router` on a dedicated profiler listener.
    pub fn profiler(mut self, addr: impl Into<String>, router: Router) -> Self {
        self.config.profiling_addr = addr.into();
        self.profiler_router = Some(router);
        self
    }

    /// Annotates each call with profiler labels.
    pub fn profiling_labels(mut self, enabled: bool) -> Self {
        self.config.profiling_enabled = enabled;
        self
    }

    /// Converts handler panics into error responses instead of rethrowing.
    pub fn recovery(mut self, enabled: bool) -> Self {
        self.config.recovery_enabled = enabled;
        self
    }

    /// Replaces the payload sanitization denylist.
    pub fn sanitize_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.sanitize_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Applies `cors` to the gateway listener, outermost.
    pub fn cors(mut self, cors: CorsLayer) -> Self {
        self.cors = Some(cors);
        self
    }

    /// Registers a module. Registration order is preserved.
    pub fn module(mut self, module: impl GrpcModule) -> Self {
        self.modules.push(Arc::new(module));
        self
    }

    /// Installs health probes on the gateway listener.
    pub fn health(mut self, health: impl HealthCheck) -> Self {
        self.health = Some(Arc::new(health));
        self
    }

    /// Gateway paths for the liveness and readiness probes.
    pub fn health_paths(mut self, liveness: impl Into<String>, readiness: impl Into<String>) -> Self {
        self.config.liveness_path = liveness.into();
        self.config.readiness_path = readiness.into();
        self
    }

    /// Installs per-transport context enrichment hooks.
    pub fn context_hooks(mut self, hooks: EnrichHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Observes recovered panics in addition to the built-in log.
    pub fn panic_logger(mut self, logger: PanicLogger) -> Self {
        self.panic_logger = Some(logger);
        self
    }

    /// Replaces the debug-capture payload renderer.
    pub fn payload_formatter(mut self, formatter: PayloadFormatter) -> Self {
        self.formatter = formatter;
        self
    }

    /// Replaces the trace-context propagator. Defaults to W3C traceparent.
    pub fn propagator(mut self, propagator: impl TextMapPropagator + Send + Sync + 'static) -> Self {
        self.propagator = Arc::new(propagator);
        self
    }

    /// Tracer used for the spans the pipeline opens. Defaults to the global
    /// provider's tracer at start time.
    pub fn tracer(mut self, tracer: BoxedTracer) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Response metadata keys echoed into gateway response headers.
    pub fn headers_from_metadata<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.headers_from_metadata = keys.into_iter().map(Into::into).collect();
        self
    }

    /// JSON rendering options handed to gateway routes.
    pub fn json_options(mut self, json: JsonOptions) -> Self {
        self.config.json = json;
        self
    }

    /// Advertises large-file streaming support to gateway routes.
    pub fn http_file_support(mut self, enabled: bool) -> Self {
        self.config.http_file_support = enabled;
        self
    }

    /// Time allowed for a client to send its request headers on the HTTP
    /// listeners. Connections that dawdle past it are closed. Unset means
    /// no limit.
    pub fn http_header_timeout(mut self, timeout: Duration) -> Self {
        self.config.http_header_timeout = Some(timeout);
        self
    }

    /// Adjusts the gateway's loopback channel endpoint before it connects,
    /// for installations that need transport tuning on the dial-back path.
    pub fn bridge_endpoint(
        mut self,
        configure: impl Fn(Endpoint) -> Endpoint + Send + Sync + 'static,
    ) -> Self {
        self.bridge_endpoint = Some(Arc::new(configure));
        self
    }

    pub fn build(self) -> Service {
        Service {
            config: self.config,
            modules: self.modules,
            health: self.health,
            hooks: self.hooks,
            cors: self.cors,
            metrics_router: self.metrics_router,
            profiler_router: self.profiler_router,
            panic_logger: self.panic_logger,
            formatter: self.formatter,
            propagator: self.propagator,
            tracer: self.tracer,
            bridge_endpoint: self.bridge_endpoint,
            runtime: None,
        }
    }
}

struct Runtime {
    grpc: ListenerTask,
    gateway: Option<ListenerTask>,
    metrics: Option<ListenerTask>,
    profiler: Option<ListenerTask>,
    bridge: Option<Channel>,
    tracker: TaskTracker,
}

/// A multi-listener gRPC service.
pub struct Service {
    config: ServiceConfig,
    modules: Vec<Arc<dyn GrpcModule>>,
    health: Option<Arc<dyn HealthCheck>>,
    hooks: EnrichHooks,
    cors: Option<CorsLayer>,
    metrics_router: Option<Router>,
    profiler_router: Option<Router>,
    panic_logger: Option<PanicLogger>,
    formatter: PayloadFormatter,
    propagator: Arc<dyn TextMapPropagator + Send + Sync>,
    tracer: Option<BoxedTracer>,
    bridge_endpoint: Option<EndpointHook>,
    runtime: Option<Runtime>,
}

impl Service {
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Binds every configured listener and begins serving.
    ///
    /// Fails without side effects: no listener serves until all configured
    /// sockets are bound and the gateway channel is constructed. After a
    /// successful start, a serve fault on the primary listener terminates
    /// the process; faults on auxiliary listeners are logged and that
    /// listener dies quietly.
    pub async fn start(&mut self) -> Result<(), Error> {
        if self.runtime.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let (grpc_listener, grpc_addr) = bind("grpc", &self.config.grpc_addr).await?;

        let gateway_parts = if self.config.http_addr.is_empty() {
            None
        } else {
            let (listener, addr) = bind("http", &self.config.http_addr).await?;
            let mut endpoint = Endpoint::from_shared(format!("http://{grpc_addr}")).map_err(
                |source| Error::GatewayChannel {
                    addr: grpc_addr.to_string(),
                    source,
                },
            )?;
            if let Some(configure) = &self.bridge_endpoint {
                endpoint = configure(endpoint);
            }
            Some((listener, addr, endpoint.connect_lazy()))
        };

        let metrics_parts = match (&self.config.metrics_addr, &self.metrics_router) {
            (addr, Some(router)) if !addr.is_empty() => {
                let (listener, addr) = bind("metrics", addr).await?;
                Some((listener, addr, router.clone()))
            }
            _ => None,
        };
        let profiler_parts = match (&self.config.profiling_addr, &self.profiler_router) {
            (addr, Some(router)) if !addr.is_empty() => {
                let (listener, addr) = bind("profiler", addr).await?;
                Some((listener, addr, router.clone()))
            }
            _ => None,
        };

        let tracer = self
            .tracer
            .take()
            .unwrap_or_else(|| global::tracer("gantry"));
        let mut streaming_methods = HashSet::new();
        let mut module_layers = Vec::new();
        for module in &self.modules {
            let options = module.options();
            streaming_methods.extend(options.streaming_methods);
            module_layers.extend(options.grpc_layers);
        }
        let state = Arc::new(PipelineState {
            propagator: self.propagator.clone(),
            tracer,
            redactor: Arc::new(Redactor::new(self.config.sanitize_keys.clone())),
            hooks: self.hooks.clone(),
            streaming_methods,
            formatter: self.formatter.clone(),
            panic_logger: self.panic_logger.clone(),
            recovery_enabled: self.config.recovery_enabled,
            profiling_enabled: self.config.profiling_enabled,
        });

        let tracker = TaskTracker::new();

        let mut routes = RoutesBuilder::default();
        for module in &self.modules {
            module.register_grpc(&mut routes);
        }
        let stack = ServiceBuilder::new()
            .layer(CallLayer::new(state.clone(), Transport::Grpc))
            .layer(ProfilingLayer::new(state.clone()))
            .layer(CaptureLayer::new(state.clone()))
            .layer(RecoveryLayer::new(state.clone(), Transport::Grpc))
            .layer(ModuleLayerStack::new(module_layers))
            .into_inner();

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let service_name = self.config.name.clone();
        let handle = tracker.spawn(async move {
            let result = Server::builder()
                .layer(stack)
                .add_routes(routes.routes())
                .serve_with_incoming_shutdown(
                    TcpListenerStream::new(grpc_listener),
                    token.cancelled_owned(),
                )
                .await;
            if let Err(error) = result {
                // A dead primary listener leaves the process half-alive;
                // crashing lets the orchestrator restart it whole.
                tracing::error!(service = %service_name, %error, "primary listener failed, terminating");
                std::process::exit(1);
            }
        });
        let grpc = ListenerTask {
            name: "grpc",
            local_addr: grpc_addr,
            shutdown,
            handle,
        };

        let header_timeout = self.config.http_header_timeout;
        let mut bridge = None;
        let gateway = gateway_parts.map(|(listener, addr, channel)| {
            bridge = Some(channel.clone());
            let ctx = GatewayContext::new(channel, &self.config, self.propagator.clone());
            let mut app = build_router(&self.modules, &ctx, &self.config, self.health.clone());
            app = app.layer(
                ServiceBuilder::new()
                    .layer(CallLayer::new(state.clone(), Transport::Http))
                    .layer(RecoveryLayer::new(state.clone(), Transport::Http))
                    .into_inner(),
            );
            if let Some(cors) = &self.cors {
                app = app.layer(cors.clone());
            }
            spawn_http("http", listener, addr, app, header_timeout, &tracker)
        });

        let metrics = metrics_parts.map(|(listener, addr, router)| {
            spawn_http("metrics", listener, addr, router, header_timeout, &tracker)
        });
        let profiler = profiler_parts.map(|(listener, addr, router)| {
            spawn_http("profiler", listener, addr, router, header_timeout, &tracker)
        });

        tracing::info!(
            service = %self.config.name,
            grpc = %grpc.local_addr,
            gateway = gateway.as_ref().map(|t| t.local_addr.to_string()).unwrap_or_default(),
            "service started"
        );
        self.runtime = Some(Runtime {
            grpc,
            gateway,
            metrics,
            profiler,
            bridge,
            tracker,
        });
        Ok(())
    }

    /// Drains all listeners under a single deadline.
    ///
    /// The gateway goes first so no new loopback calls reach the primary
    /// listener mid-drain, then the auxiliary listeners, then the primary.
    /// Every listener is asked to stop even if an earlier one failed to
    /// drain; accumulated failures are reported together.
    pub async fn stop(&mut self, timeout: Duration) -> Result<(), Error> {
        let runtime = self.runtime.take().ok_or(Error::NotStarted)?;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut failures = Vec::new();
        let mut record = |result: Result<(), String>| {
            if let Err(failure) = result {
                tracing::error!(%failure, "listener drain failed");
                failures.push(failure);
            }
        };

        if let Some(gateway) = runtime.gateway {
            record(gateway.drain(deadline).await);
        }
        drop(runtime.bridge);

        let (metrics, profiler) = tokio::join!(
            drain_optional(runtime.metrics, deadline),
            drain_optional(runtime.profiler, deadline),
        );
        record(metrics);
        record(profiler);

        record(runtime.grpc.drain(deadline).await);

        runtime.tracker.close();
        if tokio::time::timeout_at(deadline, runtime.tracker.wait())
            .await
            .is_err()
        {
            failures.push("background tasks did not finish before the deadline".to_owned());
        }

        if failures.is_empty() {
            tracing::info!(service = %self.config.name, "service stopped");
            Ok(())
        } else {
            Err(Error::Shutdown { failures })
        }
    }

    /// Bound address of the primary listener, once started.
    pub fn grpc_addr(&self) -> Option<SocketAddr> {
        self.runtime.as_ref().map(|r| r.grpc.local_addr)
    }

    /// Bound address of the gateway listener, when enabled and started.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.runtime
            .as_ref()
            .and_then(|r| r.gateway.as_ref())
            .map(|t| t.local_addr)
    }

    /// Bound address of the metrics listener, when enabled and started.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.runtime
            .as_ref()
            .and_then(|r| r.metrics.as_ref())
            .map(|t| t.local_addr)
    }

    /// Bound address of the profiler listener, when enabled and started.
    pub fn profiler_addr(&self) -> Option<SocketAddr> {
        self.runtime
            .as_ref()
            .and_then(|r| r.profiler.as_ref())
            .map(|t| t.local_addr)
    }

    /// Number of listeners currently serving.
    pub fn active_listeners(&self) -> usize {
        match &self.runtime {
            None => 0,
            Some(runtime) => {
                1 + usize::from(runtime.gateway.is_some())
                    + usize::from(runtime.metrics.is_some())
                    + usize::from(runtime.profiler.is_some())
            }
        }
    }

    /// Whether a gateway loopback channel is currently held.
    pub fn has_gateway_channel(&self) -> bool {
        self.runtime
            .as_ref()
            .is_some_and(|runtime| runtime.bridge.is_some())
    }
}

async fn drain_optional(
    task: Option<ListenerTask>,
    deadline: tokio::time::Instant,
) -> Result<(), String> {
    match task {
        Some(task) => task.drain(deadline).await,
        None => Ok(()),
    }
}
