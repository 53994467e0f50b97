//! Listener lifecycle plumbing.
//!
//! Each listener runs as one tracked task with its own cancellation token.
//! Shutdown is cooperative: cancel the token, then wait for the task under a
//! shared deadline. A listener that misses the deadline is aborted and
//! reported, never silently dropped.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceBuilder;

use crate::error::Error;

pub(crate) struct ListenerTask {
    pub name: &'static str,
    pub local_addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<()>,
}

impl ListenerTask {
    /// Signals shutdown and waits for the serve task, aborting it if the
    /// deadline passes first.
    pub(crate) async fn drain(mut self, deadline: Instant) -> Result<(), String> {
        self.shutdown.cancel();
        match tokio::time::timeout_at(deadline, &mut self.handle).await {
            Ok(Ok(())) => {
                tracing::info!(listener = self.name, "listener drained");
                Ok(())
            }
            Ok(Err(error)) => Err(format!("{} listener task failed: {error}", self.name)),
            Err(_) => {
                self.handle.abort();
                Err(format!(
                    "{} listener did not drain before the deadline",
                    self.name
                ))
            }
        }
    }
}

/// Binds a TCP listener, resolving the OS-assigned port.
pub(crate) async fn bind(
    name: &'static str,
    addr: &str,
) -> Result<(TcpListener, SocketAddr), Error> {
    let map_err = |source| Error::Bind {
        listener: name,
        addr: addr.to_owned(),
        source,
    };
    let listener = TcpListener::bind(addr).await.map_err(map_err)?;
    let local_addr = listener.local_addr().map_err(map_err)?;
    tracing::info!(listener = name, addr = %local_addr, "listening");
    Ok((listener, local_addr))
}

/// Spawns an HTTP server for `router` on the tracker, gracefully shut down
/// by the returned task's token. Each connection runs as its own tracked
/// task; `header_timeout` bounds how long a client may take to finish its
/// request headers before the connection is closed.
pub(crate) fn spawn_http(
    name: &'static str,
    listener: TcpListener,
    local_addr: SocketAddr,
    router: Router,
    header_timeout: Option<Duration>,
    tracker: &TaskTracker,
) -> ListenerTask {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let conn_tracker = tracker.clone();
    let handle = tracker.spawn(async move {
        let mut server = ConnBuilder::new(TokioExecutor::new());
        server.http1().timer(TokioTimer::new());
        server.http2().timer(TokioTimer::new());
        if let Some(timeout) = header_timeout {
            server.http1().header_read_timeout(timeout);
        }
        let graceful = GracefulShutdown::new();

        loop {
            let (stream, remote) = tokio::select! {
                () = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        tracing::debug!(listener = name, %error, "accept failed");
                        continue;
                    }
                },
            };
            let service = TowerToHyperService::new(
                ServiceBuilder::new()
                    .map_request(move |mut request: http::Request<hyper::body::Incoming>| {
                        request.extensions_mut().insert(ConnectInfo(remote));
                        request
                    })
                    .service(router.clone()),
            );
            let connection = graceful.watch(
                server
                    .serve_connection_with_upgrades(TokioIo::new(stream), service)
                    .into_owned(),
            );
            conn_tracker.spawn(async move {
                if let Err(error) = connection.await {
                    tracing::debug!(listener = name, %error, "connection closed with error");
                }
            });
        }

        drop(listener);
        graceful.shutdown().await;
    });
    ListenerTask {
        name,
        local_addr,
        shutdown,
        handle,
    }
}
