//! Body abstraction shared by the gRPC and gateway pipelines.
//!
//! The pipeline stages are generic over the response body type so the same
//! layers can sit in front of tonic's router and the axum gateway. Stages
//! that synthesize or rebuild bodies (capture, recovery) do so through
//! [`WireBody`] instead of naming either transport's concrete body type.

use bytes::Bytes;
use http::HeaderMap;
use http_body::Frame;
use tower::BoxError;

/// A response body the pipeline can buffer and reconstitute.
///
/// `from_frames` must yield the data frame (when non-empty) followed by the
/// trailers frame (when present), in that order, so a buffered gRPC response
/// keeps its `grpc-status` trailers intact.
pub trait WireBody:
    http_body::Body<Data = Bytes, Error: Into<BoxError>> + Send + 'static
{
    fn empty() -> Self;

    fn from_frames(data: Bytes, trailers: Option<HeaderMap>) -> Self;

    fn from_text(text: impl Into<String>) -> Self
    where
        Self: Sized,
    {
        Self::from_frames(Bytes::from(text.into()), None)
    }
}

fn frame_stream(
    data: Bytes,
    trailers: Option<HeaderMap>,
) -> impl futures::Stream<Item = Result<Frame<Bytes>, BoxError>> + Send + 'static {
    let mut frames = Vec::with_capacity(2);
    if !data.is_empty() {
        frames.push(Ok(Frame::data(data)));
    }
    if let Some(trailers) = trailers {
        frames.push(Ok(Frame::trailers(trailers)));
    }
    futures::stream::iter(frames)
}

impl WireBody for tonic::body::Body {
    fn empty() -> Self {
        tonic::body::Body::empty()
    }

    fn from_frames(data: Bytes, trailers: Option<HeaderMap>) -> Self {
        tonic::body::Body::new(http_body_util::StreamBody::new(frame_stream(
            data, trailers,
        )))
    }
}

impl WireBody for axum::body::Body {
    fn empty() -> Self {
        axum::body::Body::empty()
    }

    fn from_frames(data: Bytes, trailers: Option<HeaderMap>) -> Self {
        axum::body::Body::new(http_body_util::StreamBody::new(frame_stream(
            data, trailers,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn rebuilt_body_preserves_data_and_trailers() {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", "0".parse().unwrap());

        let body =
            <tonic::body::Body as WireBody>::from_frames(Bytes::from_static(b"abc"), Some(trailers));
        let collected = body.collect().await.unwrap();

        assert_eq!(
            collected.trailers().and_then(|t| t.get("grpc-status")),
            Some(&"0".parse().unwrap())
        );
        assert_eq!(collected.to_bytes(), Bytes::from_static(b"abc"));
    }

    #[tokio::test]
    async fn empty_body_collects_to_nothing() {
        let body = <axum::body::Body as WireBody>::empty();
        let collected = body.collect().await.unwrap();
        assert!(collected.trailers().is_none());
        assert!(collected.to_bytes().is_empty());
    }
}
