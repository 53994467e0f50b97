//! Hand-rolled echo service used by the integration tests: prost messages,
//! the tonic server plumbing codegen would normally emit, a client helper
//! and a module wiring it all into a service.

use std::net::SocketAddr;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use axum::extract::Path;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Extension, Router};
use futures::future::BoxFuture;
use http::uri::PathAndQuery;
use http::{HeaderMap, StatusCode};
use tonic::server::NamedService;
use tonic::service::RoutesBuilder;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};
use tonic_prost::ProstCodec;

use gantry::{CallContext, GatewayContext, GrpcModule, ModuleOptions};

pub const ECHO_SAY_PATH: &str = "/gantry.test.Echo/Say";

#[derive(Clone, PartialEq, prost::Message)]
pub struct EchoRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub password: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EchoResponse {
    #[prost(string, tag = "1")]
    pub message: String,
}

/// The echo handler. Magic names trigger test behaviors: `panic` panics,
/// `slow` sleeps before replying.
struct SayService;

impl tonic::server::UnaryService<EchoRequest> for SayService {
    type Response = EchoResponse;
    type Future = BoxFuture<'static, Result<Response<EchoResponse>, Status>>;

    fn call(&mut self, request: Request<EchoRequest>) -> Self::Future {
        Box::pin(async move {
            let request = request.into_inner();
            match request.name.as_str() {
                "panic" => panic!("echo handler exploded"),
                "slow" => tokio::time::sleep(Duration::from_millis(300)).await,
                _ => {}
            }
            Ok(Response::new(EchoResponse {
                message: format!("hello {}", request.name),
            }))
        })
    }
}

#[derive(Clone, Default)]
pub struct EchoServer;

impl NamedService for EchoServer {
    const NAME: &'static str = "gantry.test.Echo";
}

impl tower::Service<http::Request<tonic::body::Body>> for EchoServer {
    type Response = http::Response<tonic::body::Body>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<tonic::body::Body>) -> Self::Future {
        Box::pin(async move {
            match req.uri().path() {
                ECHO_SAY_PATH => {
                    let codec = ProstCodec::<EchoResponse, EchoRequest>::default();
                    let mut grpc = tonic::server::Grpc::new(codec);
                    Ok(grpc.unary(SayService, req).await)
                }
                _ => Ok(http::Response::builder()
                    .status(StatusCode::OK)
                    .header("grpc-status", "12")
                    .body(tonic::body::Body::empty())
                    .unwrap()),
            }
        })
    }
}

/// Registers the echo service plus two gateway routes: `/v1/echo/{name}`
/// proxies to the gRPC listener, `/v1/panic` panics in the route handler.
pub struct EchoModule;

impl GrpcModule for EchoModule {
    fn register_grpc(&self, routes: &mut RoutesBuilder) {
        routes.add_service(EchoServer);
    }

    fn register_http(&self, router: Router, gateway: &GatewayContext) -> Router {
        router
            .route("/v1/echo/{name}", get(echo_route))
            .route("/v1/panic", get(panic_route))
            .layer(Extension(gateway.clone()))
    }

    fn options(&self) -> ModuleOptions {
        ModuleOptions {
            http_routes: true,
            streaming_methods: Vec::new(),
            grpc_layers: Vec::new(),
        }
    }
}

async fn echo_route(
    Path(name): Path<String>,
    Extension(gateway): Extension<GatewayContext>,
    Extension(ctx): Extension<CallContext>,
) -> axum::response::Response {
    let mut client = tonic::client::Grpc::new(gateway.channel.clone());
    if client.ready().await.is_err() {
        return (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response();
    }

    let mut request = Request::new(EchoRequest {
        name,
        password: String::new(),
    });
    gateway.inject_trace(&ctx, &mut request);

    let codec = ProstCodec::<EchoRequest, EchoResponse>::default();
    match client
        .unary(request, PathAndQuery::from_static(ECHO_SAY_PATH), codec)
        .await
    {
        Ok(response) => {
            let mut headers = HeaderMap::new();
            gateway.forward_metadata(response.metadata(), &mut headers);
            let body =
                serde_json::json!({ "message": response.into_inner().message }).to_string();
            (StatusCode::OK, headers, body).into_response()
        }
        Err(status) => {
            (StatusCode::INTERNAL_SERVER_ERROR, status.message().to_owned()).into_response()
        }
    }
}

async fn panic_route() -> &'static str {
    panic!("gateway route exploded")
}

/// Connects a raw gRPC client to `addr`.
pub async fn echo_client(addr: SocketAddr) -> tonic::client::Grpc<Channel> {
    let channel = Endpoint::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .expect("echo server should be reachable");
    tonic::client::Grpc::new(channel)
}

pub async fn say(
    client: &mut tonic::client::Grpc<Channel>,
    request: Request<EchoRequest>,
) -> Result<Response<EchoResponse>, Status> {
    client
        .ready()
        .await
        .map_err(|error| Status::unavailable(error.to_string()))?;
    let codec = ProstCodec::<EchoRequest, EchoResponse>::default();
    client
        .unary(request, PathAndQuery::from_static(ECHO_SAY_PATH), codec)
        .await
}

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .with_test_writer()
        .try_init();
}
