//! Module registration.
//!
//! A [`GrpcModule`] bundles one logical unit of the application: its gRPC
//! services, its optional gateway routes and its declared streaming methods.
//! Modules are handed to the builder before start; registration order is the
//! order modules were added in.

use std::sync::Arc;

use axum::Router;
use http::{Request, Response};
use tonic::body::Body;
use tonic::service::RoutesBuilder;
use tower::util::{BoxCloneSyncService, BoxCloneSyncServiceLayer};
use tower::{Layer, Service, ServiceExt};

use crate::gateway::GatewayContext;

/// The type-erased shape of the primary listener's service as seen by
/// module-supplied layers.
pub type GrpcService = BoxCloneSyncService<Request<Body>, Response<Body>, tower::BoxError>;

/// A boxed tower layer a module can splice into the primary listener's
/// stack via [`ModuleOptions::grpc_layers`].
pub type GrpcLayer =
    BoxCloneSyncServiceLayer<GrpcService, Request<Body>, Response<Body>, tower::BoxError>;

/// Per-module registration options.
#[derive(Clone, Debug, Default)]
pub struct ModuleOptions {
    /// Whether [`GrpcModule::register_http`] should be invoked when the
    /// gateway is enabled.
    pub http_routes: bool,
    /// Full gRPC method paths (`/package.Service/Method`) served by this
    /// module as server streams. The pipeline classifies calls to these
    /// paths as streaming and skips payload capture for them.
    pub streaming_methods: Vec<String>,
    /// Extra layers merged into the primary listener's stack, inside the
    /// built-in pipeline. Layers run in module registration order, then in
    /// declaration order within a module.
    pub grpc_layers: Vec<GrpcLayer>,
}

/// Folds every module-declared layer around the routed service, innermost
/// of the built-in pipeline stages.
#[derive(Clone)]
pub(crate) struct ModuleLayerStack {
    layers: Arc<[GrpcLayer]>,
}

impl ModuleLayerStack {
    pub(crate) fn new(layers: Vec<GrpcLayer>) -> Self {
        Self {
            layers: layers.into(),
        }
    }
}

impl<S> Layer<S> for ModuleLayerStack
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + Sync + 'static,
    S::Error: Into<tower::BoxError>,
    S::Future: Send + 'static,
{
    type Service = GrpcService;

    fn layer(&self, inner: S) -> Self::Service {
        let routed = GrpcService::new(inner.map_err(|error: S::Error| error.into()));
        // Fold back to front so the first-declared layer ends up outermost.
        self.layers
            .iter()
            .rev()
            .fold(routed, |service, layer| layer.layer(service))
    }
}

/// One registrable unit of the application.
pub trait GrpcModule: Send + Sync + 'static {
    /// Adds this module's gRPC services to the primary listener's router.
    fn register_grpc(&self, routes: &mut RoutesBuilder);

    /// Adds this module's gateway routes. Only invoked when the gateway is
    /// enabled and [`ModuleOptions::http_routes`] is set.
    fn register_http(&self, router: Router, _gateway: &GatewayContext) -> Router {
        router
    }

    fn options(&self) -> ModuleOptions {
        ModuleOptions::default()
    }
}

/// Application-supplied health probes, exposed on the gateway listener.
///
/// Liveness should only fail when the process is beyond recovery; readiness
/// reflects whether new traffic can currently be served. A probe error
/// becomes a `503` carrying the returned message.
#[tonic::async_trait]
pub trait HealthCheck: Send + Sync + 'static {
    async fn live(&self) -> Result<(), String> {
        Ok(())
    }

    async fn ready(&self) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::task::{Context as TaskContext, Poll};

    #[derive(Clone)]
    struct Tagged {
        name: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
        inner: GrpcService,
    }

    impl Service<Request<Body>> for Tagged {
        type Response = Response<Body>;
        type Error = tower::BoxError;
        type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

        fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
            self.inner.poll_ready(cx)
        }

        fn call(&mut self, req: Request<Body>) -> Self::Future {
            self.order.lock().unwrap().push(self.name);
            Box::pin(self.inner.call(req))
        }
    }

    struct TagLayer {
        name: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Layer<GrpcService> for TagLayer {
        type Service = Tagged;

        fn layer(&self, inner: GrpcService) -> Tagged {
            Tagged {
                name: self.name,
                order: self.order.clone(),
                inner,
            }
        }
    }

    #[tokio::test]
    async fn module_layers_run_in_declaration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let layers = vec![
            GrpcLayer::new(TagLayer {
                name: "first",
                order: order.clone(),
            }),
            GrpcLayer::new(TagLayer {
                name: "second",
                order: order.clone(),
            }),
        ];
        let inner = tower::service_fn(|_req: Request<Body>| async {
            Ok::<_, std::convert::Infallible>(Response::new(Body::empty()))
        });

        let mut stack = ModuleLayerStack::new(layers).layer(inner);
        stack
            .ready()
            .await
            .unwrap()
            .call(Request::new(Body::empty()))
            .await
            .unwrap();

        assert_eq!(*order.lock().unwrap(), ["first", "second"]);
    }
}
