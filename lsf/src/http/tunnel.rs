//! Framed-transport backends
//!
//! A request whose origin is a `ws`/`wss` URL is normally answered on the
//! raw socket by the accept loop (see [`crate::server`]), which decides that
//! through [`route`] before hyper sees the connection. Requests that still
//! reach a handler, e.g. a second request on a kept-alive connection, are
//! streamed through hyper by [`tunnel_response`].

use std::sync::Arc;

use axum::{
    body::Body,
    extract::Query,
    http::{header, HeaderMap, StatusCode, Uri},
    response::Response,
};
use bytes::BytesMut;
use parking_lot::Mutex;
use url::Url;

use crate::{
    error::{AppError, AppResult},
    extractor::Resolved,
    http::{debug, forwarder, AppState},
};

/// Everything needed to open a tunnel for one request.
#[derive(Debug, Clone)]
pub struct TunnelPlan {
    pub url: Url,
    pub headers: HeaderMap,
    pub proxy: Option<Url>,
    pub mobile: bool,
    /// Status used when the tunnel cannot be opened.
    pub failure: StatusCode,
}

/// A resolution performed by the accept loop, handed to the handler of the
/// same request so the extractor runs once.
#[derive(Debug, Clone, Default)]
pub struct Prefetched(Arc<Mutex<Option<(String, AppResult<Resolved>)>>>);

impl Prefetched {
    #[must_use]
    pub fn new(target: String, resolved: AppResult<Resolved>) -> Self {
        Self(Arc::new(Mutex::new(Some((target, resolved)))))
    }

    /// Take the resolution if it was made for `target`.
    pub fn take(&self, target: &str) -> Option<AppResult<Resolved>> {
        let mut slot = self.0.lock();
        if slot.as_ref().is_some_and(|(t, _)| t == target) {
            slot.take().map(|(_, resolved)| resolved)
        } else {
            None
        }
    }
}

/// How the accept loop serves a request.
#[derive(Debug)]
pub enum Route {
    /// Answer on the raw socket.
    Tunnel(TunnelPlan),
    /// Hand the connection to hyper.
    Http(Option<Prefetched>),
}

/// Classify a request by its request-line target.
///
/// Anything that cannot be decided here goes to hyper, where the handlers
/// produce the proper error.
pub async fn route(state: &AppState, target: &str) -> Route {
    let Ok(uri) = target.parse::<Uri>() else {
        return Route::Http(None);
    };
    let segments: Vec<&str> = uri.path().trim_start_matches('/').split('/').collect();
    // Path extraction percent-decodes; leave encoded segments to the handlers.
    if segments.iter().any(|s| s.is_empty() || s.contains('%')) {
        return Route::Http(None);
    }

    match segments.as_slice() {
        ["debug", method] if state.debug_routes => {
            let Ok(Query(query)) = Query::<debug::DebugQuery>::try_from_uri(&uri) else {
                return Route::Http(None);
            };
            debug::tunnel_plan(state, method, &query).map_or(Route::Http(None), Route::Tunnel)
        }
        [platform, room] => {
            let Ok(Query(query)) = Query::<forwarder::ForwardQuery>::try_from_uri(&uri) else {
                return Route::Http(None);
            };
            forwarder::route(state, platform, room, &query, target).await
        }
        _ => Route::Http(None),
    }
}

#[must_use]
pub fn is_tunnel(url: &Url) -> bool {
    matches!(url.scheme(), "ws" | "wss")
}

/// Stream a tunnel through hyper.
pub async fn tunnel_response(state: &AppState, plan: TunnelPlan) -> AppResult<Response> {
    let client = state.tunnel_client(plan.url, plan.headers, plan.proxy, plan.mobile);
    client.start().await.map_err(|e| {
        tracing::error!(url = %client.url(), error = %e, "forward ws(s) stream error");
        AppError::new(plan.failure, e.to_string())
    })?;

    let body = futures::stream::unfold(client, |client| async move {
        let mut buf = BytesMut::zeroed(lsf_tunnel::bridge::COPY_BUFFER_SIZE);
        match client.read(&mut buf).await {
            Ok(n) => {
                buf.truncate(n);
                Some((Ok::<_, lsf_tunnel::PipeError>(buf.freeze()), client))
            }
            Err(e) => {
                tracing::debug!(url = %client.url(), error = %e, "tunnel stream ended");
                None
            }
        }
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "video/x-flv")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body))
        .map_err(|e| AppError::internal(e.to_string()))
}
