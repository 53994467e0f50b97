//! Profiler labeling stage.
//!
//! When profiling is enabled the call's method path is attached to the
//! task-local tracing scope so samples taken while the handler runs can be
//! grouped by method. Disabled, the stage passes calls through untouched.

use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures::future::BoxFuture;
use http::{Request, Response};
use tower::{Layer, Service};
use tracing::Instrument;

use crate::context::CallContext;
use crate::pipeline::PipelineState;

#[derive(Clone)]
pub(crate) struct ProfilingLayer {
    state: Arc<PipelineState>,
}

impl ProfilingLayer {
    pub(crate) fn new(state: Arc<PipelineState>) -> Self {
        Self { state }
    }
}

impl<S> Layer<S> for ProfilingLayer {
    type Service = ProfilingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ProfilingService {
            inner,
            enabled: self.state.profiling_enabled,
        }
    }
}

#[derive(Clone)]
pub(crate) struct ProfilingService<S> {
    inner: S,
    enabled: bool,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ProfilingService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if !self.enabled {
            return Box::pin(inner.call(req));
        }

        let method = req
            .extensions()
            .get::<CallContext>()
            .map(|ctx| ctx.method.clone())
            .unwrap_or_else(|| req.uri().path().to_owned());
        let span = tracing::debug_span!("profile", grpc_method = %method);
        Box::pin(inner.call(req).instrument(span))
    }
}
