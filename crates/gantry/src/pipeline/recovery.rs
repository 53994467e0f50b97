//! Panic recovery.
//!
//! The innermost stage. A panic in the handler (or in any stage below this
//! one) is caught whether it happens while constructing the future or while
//! polling it. Every panic is logged with a backtrace and handed to the
//! optional panic observer; only when recovery is enabled is the panic then
//! converted into an error response instead of resuming the unwind.

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use http::{Request, Response, StatusCode};
use tower::{Layer, Service};

use crate::body::WireBody;
use crate::context::CallContext;
use crate::pipeline::call::Transport;
use crate::pipeline::{grpc_error_response, http_error_response, PipelineState};

#[derive(Clone)]
pub(crate) struct RecoveryLayer {
    state: Arc<PipelineState>,
    transport: Transport,
}

impl RecoveryLayer {
    pub(crate) fn new(state: Arc<PipelineState>, transport: Transport) -> Self {
        Self { state, transport }
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = RecoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecoveryService {
            inner,
            state: self.state.clone(),
            transport: self.transport,
        }
    }
}

#[derive(Clone)]
pub(crate) struct RecoveryService<S> {
    inner: S,
    state: Arc<PipelineState>,
    transport: Transport,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RecoveryService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: WireBody,
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
        let state = self.state.clone();
        let transport = self.transport;
        let ctx = req.extensions().get::<CallContext>().cloned();

        Box::pin(async move {
            let result = match std::panic::catch_unwind(AssertUnwindSafe(|| inner.call(req))) {
                Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
                Err(payload) => Err(payload),
            };
            let payload = match result {
                Ok(result) => return result,
                Err(payload) => payload,
            };

            let text = panic_message(payload.as_ref());
            tracing::error!(
                panic = %text,
                method = ctx.as_ref().map(|c| c.method.as_str()).unwrap_or("-"),
                trace_id = ctx
                    .as_ref()
                    .and_then(|c| c.trace_id.as_deref())
                    .unwrap_or("-"),
                backtrace = %Backtrace::force_capture(),
                "handler panicked"
            );
            if let Some(logger) = &state.panic_logger {
                logger(ctx.as_ref(), &text);
            }
            if !state.recovery_enabled {
                std::panic::resume_unwind(payload);
            }

            let message = format!("recover: {text}");
            Ok(match transport {
                Transport::Grpc => grpc_error_response(13, &message),
                Transport::Http => {
                    http_error_response(StatusCode::INTERNAL_SERVER_ERROR, &message)
                }
            })
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_owned()
    }
}
