//! Debug payload capture.
//!
//! When a unary call arrives with the debug header set, this stage buffers
//! the request and response bodies, renders the contained messages as text,
//! sanitizes them and attaches the results to a dedicated child span. The
//! buffered bytes are replayed downstream unchanged, trailers included, so
//! capture is invisible to the handler and the client.
//!
//! Streaming calls are never captured: buffering would stall the stream and
//! the payloads are unbounded.

use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures::future::BoxFuture;
use http::{Request, Response};
use http_body_util::BodyExt;
use opentelemetry::trace::{Span, SpanKind, Tracer};
use opentelemetry::KeyValue;
use tower::{Layer, Service};

use crate::body::WireBody;
use crate::context::{CallContext, CallKind};
use crate::correlation::{MAX_SPAN_BYTES, TRACE_DEBUG_KEY, TRACE_DEBUG_VALUE};
use crate::pipeline::{grpc_error_response, PipelineState};

#[derive(Clone)]
pub(crate) struct CaptureLayer {
    state: Arc<PipelineState>,
}

impl CaptureLayer {
    pub(crate) fn new(state: Arc<PipelineState>) -> Self {
        Self { state }
    }
}

impl<S> Layer<S> for CaptureLayer {
    type Service = CaptureService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CaptureService {
            inner,
            state: self.state.clone(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct CaptureService<S> {
    inner: S,
    state: Arc<PipelineState>,
}

impl<S, B> Service<Request<B>> for CaptureService<S>
where
    S: Service<Request<B>, Response = Response<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: WireBody,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let debug_requested = req
            .headers()
            .get(TRACE_DEBUG_KEY)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == TRACE_DEBUG_VALUE);
        let ctx = req.extensions().get::<CallContext>().cloned();

        let ctx = match ctx {
            Some(ctx) if debug_requested && ctx.kind == CallKind::Unary => ctx,
            _ => return Box::pin(inner.call(req)),
        };

        let state = self.state.clone();
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let request_bytes = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(error) => {
                    let error: tower::BoxError = error.into();
                    tracing::debug!(
                        method = %ctx.method,
                        %error,
                        "failed to buffer request for capture"
                    );
                    return Ok(grpc_error_response(13, "failed to buffer request"));
                }
            };
            let req = Request::from_parts(parts, B::from_frames(request_bytes.clone(), None));

            let mut attributes = Vec::with_capacity(1);
            if let Some(remote) = &ctx.remote_addr {
                attributes.push(KeyValue::new("remote_addr", remote.clone()));
            }
            let mut span = state
                .tracer
                .span_builder("grpc_data")
                .with_kind(SpanKind::Server)
                .with_attributes(attributes)
                .start_with_context(&state.tracer, &ctx.otel);

            if let Some(text) = request_attribute(&state, &ctx.method, &request_bytes) {
                span.set_attribute(KeyValue::new("grpc_request", text));
            }

            let response = match inner.call(req).await {
                Ok(response) => response,
                Err(error) => {
                    span.end();
                    return Err(error);
                }
            };

            let (parts, body) = response.into_parts();
            let collected = match body.collect().await {
                Ok(collected) => collected,
                Err(error) => {
                    let error: tower::BoxError = error.into();
                    tracing::debug!(
                        method = %ctx.method,
                        %error,
                        "failed to buffer response for capture"
                    );
                    span.end();
                    return Ok(grpc_error_response(13, "failed to buffer response"));
                }
            };
            let trailers = collected.trailers().cloned();
            let response_bytes = collected.to_bytes();

            if let Some(text) = response_attribute(&state, &ctx.method, &response_bytes) {
                span.set_attribute(KeyValue::new("grpc_response", text));
            }
            span.end();

            Ok(Response::from_parts(
                parts,
                B::from_frames(response_bytes, trailers),
            ))
        })
    }
}

/// Strips the length-prefixed framing from a buffered unary body, leaving
/// the encoded message. Compressed or malformed frames pass through whole.
fn message_payload(frame: &[u8]) -> &[u8] {
    if frame.len() >= 5 && frame[0] == 0 {
        let declared = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
        if let Some(payload) = frame.get(5..5 + declared) {
            return payload;
        }
        return &frame[5..];
    }
    frame
}

/// Truncates to at most `max` bytes, backing off to the nearest `char`
/// boundary so the result stays valid UTF-8 within the limit.
fn truncate_text(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

/// Renders and sanitizes the request payload. Oversized requests are not
/// attached at all, since a truncated request is more misleading than a
/// missing one.
fn request_attribute(state: &PipelineState, method: &str, frame: &[u8]) -> Option<String> {
    let text = (state.formatter)(method, message_payload(frame))?;
    if text.len() >= MAX_SPAN_BYTES {
        return None;
    }
    Some(state.redactor.sanitize_text(&text))
}

/// Renders and sanitizes the response payload, truncating before the
/// sanitization pass so the attached attribute never exceeds the span limit.
fn response_attribute(state: &PipelineState, method: &str, frame: &[u8]) -> Option<String> {
    let text = (state.formatter)(method, message_payload(frame))?;
    let truncated = truncate_text(text, MAX_SPAN_BYTES);
    Some(state.redactor.sanitize_text(&truncated))
}
