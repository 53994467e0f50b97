//! Outermost pipeline stage: call classification, trace-context extraction,
//! enrichment and correlation-id stamping.
//!
//! On the gateway listener this stage also opens the server span for the
//! call, so the loopback gRPC call the route handler makes is recorded as a
//! child of the gateway request rather than of the remote parent directly.

use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures::future::BoxFuture;
use http::{HeaderValue, Request, Response};
use opentelemetry::trace::{SpanKind, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use tower::{Layer, Service};
use tracing::Instrument;

use crate::context::{remote_addr, CallContext, CallKind};
use crate::correlation::{trace_id_hex, HeaderExtractor, TRACE_ID_KEY};
use crate::pipeline::PipelineState;

/// Which listener this stage instance fronts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Transport {
    Grpc,
    Http,
}

#[derive(Clone)]
pub(crate) struct CallLayer {
    state: Arc<PipelineState>,
    transport: Transport,
}

impl CallLayer {
    pub(crate) fn new(state: Arc<PipelineState>, transport: Transport) -> Self {
        Self { state, transport }
    }
}

impl<S> Layer<S> for CallLayer {
    type Service = CallService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CallService {
            inner,
            state: self.state.clone(),
            transport: self.transport,
        }
    }
}

#[derive(Clone)]
pub(crate) struct CallService<S> {
    inner: S,
    state: Arc<PipelineState>,
    transport: Transport,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for CallService<S>
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

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let state = self.state.clone();
        let method = req.uri().path().to_owned();
        let remote = remote_addr(req.extensions());

        let parent = state
            .propagator
            .extract_with_context(&Context::new(), &HeaderExtractor(req.headers()));

        let kind = match self.transport {
            Transport::Http => CallKind::Http,
            Transport::Grpc if state.streaming_methods.contains(&method) => CallKind::Stream,
            Transport::Grpc => CallKind::Unary,
        };

        // The gateway stage owns the call's server span; on the gRPC
        // listener the capture stage opens spans on demand instead.
        let (cx, owns_span) = match kind {
            CallKind::Http => {
                let mut attributes = vec![KeyValue::new("http.request.uri", method.clone())];
                if let Some(remote) = &remote {
                    attributes.push(KeyValue::new("remote_addr", remote.clone()));
                }
                let span = state
                    .tracer
                    .span_builder("http_gateway")
                    .with_kind(SpanKind::Server)
                    .with_attributes(attributes)
                    .start_with_context(&state.tracer, &parent);
                (parent.with_span(span), true)
            }
            _ => (parent, false),
        };

        let trace_id = trace_id_hex(&cx);
        let mut call_ctx = CallContext::new(kind, method, remote, trace_id.clone(), cx);
        call_ctx = (state.hooks.for_kind(kind))(call_ctx);

        let span = tracing::info_span!(
            "rpc",
            kind = %call_ctx.kind,
            method = %call_ctx.method,
            remote = call_ctx.remote_addr.as_deref().unwrap_or("-"),
            trace_id = call_ctx.trace_id.as_deref().unwrap_or("-"),
        );

        let otel = call_ctx.otel.clone();
        req.extensions_mut().insert(call_ctx);

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(
            async move {
                let result = inner.call(req).await;
                if owns_span {
                    otel.span().end();
                }
                let mut response = result?;
                if let Some(trace_id) = &trace_id {
                    if let Ok(value) = HeaderValue::from_str(trace_id) {
                        response.headers_mut().insert(TRACE_ID_KEY, value);
                    }
                }
                Ok(response)
            }
            .instrument(span),
        )
    }
}
