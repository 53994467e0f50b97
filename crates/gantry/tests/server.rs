//! End-to-end tests: real listeners on ephemeral ports, a real tonic client
//! and raw HTTP/1.1 against the gateway.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::get;
use axum::Router;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tonic::{Code, Request};
use tower::Service as _;

use gantry::{GrpcLayer, GrpcService, ModuleOptions, Service, TRACE_DEBUG_KEY, TRACE_ID_KEY};
use support::{echo_client, init_tracing, say, EchoModule, EchoRequest};

const TRACEPARENT: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";
const TRACE_ID: &str = "0af7651916cd43dd8448eb211c80319c";

fn base_builder() -> gantry::Builder {
    init_tracing();
    Service::builder()
        .name("echo-test")
        .grpc_addr("127.0.0.1:0")
        .http_addr("")
        .module(EchoModule)
}

/// Sends one HTTP/1.1 request and returns the raw response text.
async fn http_get(
    addr: std::net::SocketAddr,
    path: &str,
    headers: &[(&str, &str)],
) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

fn status_line(response: &str) -> &str {
    response.lines().next().unwrap_or_default()
}

#[tokio::test]
async fn primary_only_service_serves_and_stops() {
    let mut service = base_builder().build();
    service.start().await.unwrap();

    assert_eq!(service.active_listeners(), 1);
    assert!(!service.has_gateway_channel());
    assert!(service.http_addr().is_none());

    let mut client = echo_client(service.grpc_addr().unwrap()).await;
    let response = say(
        &mut client,
        Request::new(EchoRequest {
            name: "world".into(),
            password: String::new(),
        }),
    )
    .await
    .unwrap();
    assert_eq!(response.into_inner().message, "hello world");

    service.stop(Duration::from_secs(5)).await.unwrap();
    assert_eq!(service.active_listeners(), 0);
}

#[tokio::test]
async fn start_and_stop_reject_wrong_states() {
    let mut service = base_builder().build();
    assert!(matches!(
        service.stop(Duration::from_secs(1)).await,
        Err(gantry::Error::NotStarted)
    ));

    service.start().await.unwrap();
    assert!(matches!(
        service.start().await,
        Err(gantry::Error::AlreadyStarted)
    ));
    service.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn correlation_id_is_echoed_to_grpc_clients() {
    let mut service = base_builder().build();
    service.start().await.unwrap();

    let mut client = echo_client(service.grpc_addr().unwrap()).await;
    let mut request = Request::new(EchoRequest {
        name: "traced".into(),
        password: String::new(),
    });
    request
        .metadata_mut()
        .insert("traceparent", TRACEPARENT.parse().unwrap());

    let response = say(&mut client, request).await.unwrap();
    assert_eq!(
        response.metadata().get(TRACE_ID_KEY).unwrap(),
        TRACE_ID
    );

    service.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn correlation_id_is_absent_without_a_trace_context() {
    let mut service = base_builder().build();
    service.start().await.unwrap();

    let mut client = echo_client(service.grpc_addr().unwrap()).await;
    let response = say(
        &mut client,
        Request::new(EchoRequest {
            name: "untraced".into(),
            password: String::new(),
        }),
    )
    .await
    .unwrap();
    assert!(response.metadata().get(TRACE_ID_KEY).is_none());

    service.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn recovery_converts_handler_panics_into_internal_status() {
    let mut service = base_builder().recovery(true).build();
    service.start().await.unwrap();

    let mut client = echo_client(service.grpc_addr().unwrap()).await;
    let status = say(
        &mut client,
        Request::new(EchoRequest {
            name: "panic".into(),
            password: String::new(),
        }),
    )
    .await
    .unwrap_err();

    assert_eq!(status.code(), Code::Internal);
    assert!(status.message().contains("recover: echo handler exploded"));

    // The listener keeps serving after a recovered panic.
    let response = say(
        &mut client,
        Request::new(EchoRequest {
            name: "again".into(),
            password: String::new(),
        }),
    )
    .await
    .unwrap();
    assert_eq!(response.into_inner().message, "hello again");

    service.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn without_recovery_the_panic_is_not_converted() {
    let mut service = base_builder().build();
    service.start().await.unwrap();

    let mut client = echo_client(service.grpc_addr().unwrap()).await;
    let status = say(
        &mut client,
        Request::new(EchoRequest {
            name: "panic".into(),
            password: String::new(),
        }),
    )
    .await
    .unwrap_err();

    // The connection dies with the unwinding task; no synthesized status.
    assert!(!status.message().contains("recover:"));

    service.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn debug_capture_leaves_the_response_intact() {
    let mut service = base_builder().build();
    service.start().await.unwrap();

    let mut client = echo_client(service.grpc_addr().unwrap()).await;
    let mut request = Request::new(EchoRequest {
        name: "Bob".into(),
        password: "123".into(),
    });
    request
        .metadata_mut()
        .insert("traceparent", TRACEPARENT.parse().unwrap());
    request
        .metadata_mut()
        .insert(TRACE_DEBUG_KEY, "1".parse().unwrap());

    let response = say(&mut client, request).await.unwrap();
    assert_eq!(
        response.metadata().get(TRACE_ID_KEY).unwrap(),
        TRACE_ID
    );
    assert_eq!(response.into_inner().message, "hello Bob");

    service.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn stop_waits_for_in_flight_calls() {
    let mut service = base_builder().build();
    service.start().await.unwrap();

    let mut client = echo_client(service.grpc_addr().unwrap()).await;
    let in_flight = tokio::spawn(async move {
        say(
            &mut client,
            Request::new(EchoRequest {
                name: "slow".into(),
                password: String::new(),
            }),
        )
        .await
    });
    // Let the slow call reach the handler before draining.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    service.stop(Duration::from_secs(5)).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(150));

    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(response.into_inner().message, "hello slow");
}

#[tokio::test]
async fn gateway_routes_proxy_to_the_primary_listener() {
    let mut service = base_builder().http_addr("127.0.0.1:0").build();
    service.start().await.unwrap();

    assert_eq!(service.active_listeners(), 2);
    assert!(service.has_gateway_channel());

    let response = http_get(
        service.http_addr().unwrap(),
        "/v1/echo/world",
        &[("traceparent", TRACEPARENT)],
    )
    .await;

    assert!(status_line(&response).contains("200"));
    assert!(response.contains("hello world"));
    // Both hops share one trace, so the gateway response carries the same
    // correlation id a direct gRPC call would.
    assert!(response
        .to_ascii_lowercase()
        .contains(&format!("{TRACE_ID_KEY}: {TRACE_ID}")));

    service.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn gateway_panics_become_500_when_recovery_is_on() {
    let mut service = base_builder()
        .http_addr("127.0.0.1:0")
        .recovery(true)
        .build();
    service.start().await.unwrap();

    let response = http_get(service.http_addr().unwrap(), "/v1/panic", &[]).await;
    assert!(status_line(&response).contains("500"));
    assert!(response.contains("recover: gateway route exploded"));

    service.stop(Duration::from_secs(5)).await.unwrap();
}

#[derive(Clone)]
struct CountingService {
    hits: Arc<AtomicUsize>,
    inner: GrpcService,
}

impl tower::Service<http::Request<tonic::body::Body>> for CountingService {
    type Response = http::Response<tonic::body::Body>;
    type Error = tower::BoxError;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<tonic::body::Body>) -> Self::Future {
        self.hits.fetch_add(1, Ordering::SeqCst);
        Box::pin(self.inner.call(req))
    }
}

struct CountingLayer {
    hits: Arc<AtomicUsize>,
}

impl tower::Layer<GrpcService> for CountingLayer {
    type Service = CountingService;

    fn layer(&self, inner: GrpcService) -> CountingService {
        CountingService {
            hits: self.hits.clone(),
            inner,
        }
    }
}

struct CountingModule {
    hits: Arc<AtomicUsize>,
}

impl gantry::GrpcModule for CountingModule {
    fn register_grpc(&self, _routes: &mut tonic::service::RoutesBuilder) {}

    fn options(&self) -> ModuleOptions {
        ModuleOptions {
            grpc_layers: vec![GrpcLayer::new(CountingLayer {
                hits: self.hits.clone(),
            })],
            ..ModuleOptions::default()
        }
    }
}

#[tokio::test]
async fn module_layers_observe_primary_listener_calls() {
    let hits = Arc::new(AtomicUsize::new(0));
    let mut service = base_builder()
        .module(CountingModule { hits: hits.clone() })
        .build();
    service.start().await.unwrap();

    let mut client = echo_client(service.grpc_addr().unwrap()).await;
    let response = say(
        &mut client,
        Request::new(EchoRequest {
            name: "counted".into(),
            password: String::new(),
        }),
    )
    .await
    .unwrap();
    assert_eq!(response.into_inner().message, "hello counted");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    service.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn bridge_endpoint_tuning_applies_to_the_loopback_channel() {
    let configured = Arc::new(AtomicUsize::new(0));
    let seen = configured.clone();
    let mut service = base_builder()
        .http_addr("127.0.0.1:0")
        .bridge_endpoint(move |endpoint| {
            seen.fetch_add(1, Ordering::SeqCst);
            endpoint.tcp_nodelay(true)
        })
        .build();
    service.start().await.unwrap();
    assert_eq!(configured.load(Ordering::SeqCst), 1);

    // The tuned channel still reaches the primary listener.
    let response = http_get(service.http_addr().unwrap(), "/v1/echo/tuned", &[]).await;
    assert!(status_line(&response).contains("200"));
    assert!(response.contains("hello tuned"));

    service.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn slow_header_clients_are_disconnected() {
    let mut service = base_builder()
        .http_addr("127.0.0.1:0")
        .http_header_timeout(Duration::from_millis(200))
        .build();
    service.start().await.unwrap();
    let addr = service.http_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /v1/echo/slowpoke HTTP/1.1\r\n")
        .await
        .unwrap();
    // Never finish the headers; the server hangs up once the timeout lapses.
    let mut rest = Vec::new();
    let closed =
        tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut rest)).await;
    assert!(closed.is_ok(), "connection stayed open past the header timeout");

    // Prompt clients are unaffected.
    let response = http_get(addr, "/v1/echo/prompt", &[]).await;
    assert!(status_line(&response).contains("200"));

    service.stop(Duration::from_secs(5)).await.unwrap();
}

struct NeverReady;

#[tonic::async_trait]
impl gantry::HealthCheck for NeverReady {
    async fn ready(&self) -> Result<(), String> {
        Err("warming up".to_owned())
    }
}

#[tokio::test]
async fn health_probes_are_served_on_the_gateway() {
    let mut service = base_builder()
        .http_addr("127.0.0.1:0")
        .health(NeverReady)
        .build();
    service.start().await.unwrap();
    let addr = service.http_addr().unwrap();

    let live = http_get(addr, "/live", &[]).await;
    assert!(status_line(&live).contains("200"));

    let ready = http_get(addr, "/ready", &[]).await;
    assert!(status_line(&ready).contains("503"));
    assert!(ready.contains("warming up"));

    service.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn metrics_listener_serves_the_injected_router() {
    let metrics = Router::new().route("/metrics", get(|| async { "# no samples yet\n" }));
    let mut service = base_builder().metrics("127.0.0.1:0", metrics).build();
    service.start().await.unwrap();

    assert_eq!(service.active_listeners(), 2);
    let response = http_get(service.metrics_addr().unwrap(), "/metrics", &[]).await;
    assert!(status_line(&response).contains("200"));
    assert!(response.contains("# no samples yet"));

    service.stop(Duration::from_secs(5)).await.unwrap();
}
