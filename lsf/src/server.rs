//! Accept loop
//!
//! hyper cannot give a handler the raw socket of a plain GET, but a tunnel
//! has to answer on it with its own response head. Every new connection is
//! therefore peeked first: requests that resolve to a framed-transport
//! backend are bridged on the raw socket, everything else is served by
//! hyper/axum.

use std::{net::SocketAddr, time::Duration};

use axum::{http::Request, Router};
use hyper::body::Incoming;
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use lsf_tunnel::StartError;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower::ServiceBuilder;
use tracing::{debug, error, info, warn};

use crate::{
    error::AppError,
    http::{
        create_router,
        tunnel::{self, Prefetched, Route, TunnelPlan},
        AppState,
    },
};

const PEEK_SIZE: usize = 4096;
const PEEK_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_HEAD: usize = 16 * 1024;
/// Upper bound on waiting for in-flight requests once shutdown begins.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Serve `listener` until a shutdown signal arrives or `cancel` fires.
///
/// On shutdown the listener stops accepting, HTTP connections finish their
/// in-flight request and close, and raw tunnels are cut.
pub async fn run(listener: TcpListener, state: AppState, cancel: CancellationToken) {
    let app = create_router(state.clone());
    let shutdown = shutdown_signal(cancel);
    tokio::pin!(shutdown);

    let tracker = TaskTracker::new();
    let draining = CancellationToken::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        tracker.spawn(handle_connection(
                            stream,
                            peer,
                            state.clone(),
                            app.clone(),
                            draining.clone(),
                        ));
                    }
                    Err(e) => {
                        debug!("Accept error: {e}");
                    }
                }
            }
            () = &mut shutdown => break,
        }
    }

    drop(listener);
    info!(connections = tracker.len(), "draining connections");
    draining.cancel();
    tracker.close();
    if tokio::time::timeout(DRAIN_TIMEOUT, tracker.wait()).await.is_err() {
        warn!(connections = tracker.len(), "drain timed out, dropping connections");
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: AppState,
    app: Router,
    draining: CancellationToken,
) {
    let route = match request_target(&stream).await {
        Some(target) => tunnel::route(&state, &target).await,
        None => Route::Http(None),
    };

    match route {
        Route::Tunnel(plan) => serve_tunnel(stream, peer, &state, plan, draining).await,
        Route::Http(prefetched) => serve_http(stream, app, prefetched, draining).await,
    }
}

async fn request_target(stream: &TcpStream) -> Option<String> {
    let mut buf = [0u8; PEEK_SIZE];
    let n = tokio::time::timeout(PEEK_TIMEOUT, stream.peek(&mut buf))
        .await
        .ok()?
        .ok()?;
    parse_request_target(&buf[..n])
}

/// Target of a GET request line. The head may be incomplete.
fn parse_request_target(head: &[u8]) -> Option<String> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(head) {
        Ok(_) | Err(httparse::Error::TooManyHeaders) => {}
        Err(_) => return None,
    }
    if request.method != Some("GET") {
        return None;
    }
    request.path.map(str::to_string)
}

async fn serve_http(
    stream: TcpStream,
    app: Router,
    prefetched: Option<Prefetched>,
    draining: CancellationToken,
) {
    let service = ServiceBuilder::new()
        .map_request(move |mut request: Request<Incoming>| {
            if let Some(prefetched) = &prefetched {
                request.extensions_mut().insert(prefetched.clone());
            }
            request
        })
        .service(app);

    let io = TokioIo::new(stream);
    let conn = hyper::server::conn::http1::Builder::new()
        .serve_connection(io, TowerToHyperService::new(service));
    tokio::pin!(conn);

    // The connection is polled first so a request already on the socket is
    // read before a pending shutdown can close it.
    let result = tokio::select! {
        biased;
        result = conn.as_mut() => result,
        () = draining.cancelled() => {
            // Finish the request in flight, then close.
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = result {
        debug!("Hyper connection error: {e}");
    }
}

async fn serve_tunnel(
    mut stream: TcpStream,
    peer: SocketAddr,
    state: &AppState,
    plan: TunnelPlan,
    draining: CancellationToken,
) {
    if let Err(e) = consume_head(&mut stream).await {
        debug!(%peer, error = %e, "dropping connection before tunnel");
        return;
    }
    info!(%peer, url = %plan.url, "bridging tunnel");

    let bridge = state.bridge(plan.headers, plan.proxy, plan.mobile);
    match bridge.start(stream, plan.url.as_str()).await {
        Ok(mut pump) => {
            tokio::select! {
                _ = &mut pump => debug!(%peer, url = %plan.url, "tunnel finished"),
                () = draining.cancelled() => {
                    pump.abort();
                    debug!(%peer, url = %plan.url, "tunnel cut by shutdown");
                }
            }
        }
        Err(StartError { error, mut conn }) => {
            error!(%peer, url = %plan.url, error = %error, "forward ws(s) stream error");
            let response = AppError::new(plan.failure, error.to_string()).to_http1();
            let _ = conn.write_all(&response).await;
            let _ = conn.shutdown().await;
        }
    }
}

/// Read the request head off the socket so the response starts clean.
async fn consume_head(stream: &mut TcpStream) -> std::io::Result<()> {
    let mut head = Vec::with_capacity(1024);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await? == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        head.push(byte[0]);
        if head.len() > MAX_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "headers too large",
            ));
        }
    }
    Ok(())
}

/// Wait for Ctrl+C, SIGTERM or `cancel`.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
        () = cancel.cancelled() => {}
    }
}
