//! Platform room forwarding
//!
//! `GET /{platform}/{room}` resolves the room through the platform's
//! extractor and forwards the stream by origin type: playlists are rewritten,
//! other HTTP(S) media is relayed byte for byte and `ws`/`wss` origins are
//! tunnelled. Follow-up requests for proxied references carry the origin in
//! the `url` parameter and skip the extractor.

use axum::{
    extract::{OriginalUri, Path, Query, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::Response,
    Extension,
};
use lsf_proxy::{hls::is_playlist, HlsForwarder, WebForwarder};
use serde::Deserialize;
use url::Url;

use crate::{
    error::{AppError, AppResult},
    extractor::{Extractor, PlaylistMode, Resolved},
    http::{
        tunnel::{self, Prefetched, Route, TunnelPlan},
        AppState,
    },
};

#[derive(Debug, Default, Deserialize)]
pub struct ForwardQuery {
    /// Proxied reference of a playlist entry.
    pub url: Option<String>,
    pub proxy: Option<String>,
}

/// GET /{platform}/{room}
pub async fn forward_room(
    State(state): State<AppState>,
    Path((platform, room)): Path<(String, String)>,
    Query(query): Query<ForwardQuery>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    prefetched: Option<Extension<Prefetched>>,
) -> AppResult<Response> {
    let proxy = state.outbound_proxy(query.proxy.as_deref())?;
    let extractor = state
        .extractors
        .get(&platform)
        .ok_or_else(|| AppError::bad_request("unsupported platform"))?;
    let prefix = request_prefix(&headers, &uri)?;
    tracing::debug!(%platform, %room, %prefix, proxy = ?proxy.as_ref().map(Url::as_str), "forwarding room");

    if let Some(encoded) = query.url.as_deref().filter(|u| !u.is_empty()) {
        let client = state.upstream(proxy.as_ref(), extractor.mobile())?;
        return HlsForwarder::new(client)
            .with_headers(extractor.headers())
            .forward(encoded, &prefix)
            .await
            .map_err(|e| {
                tracing::error!(%platform, %room, error = %e, "forward hls stream error");
                AppError::bad_request(e.to_string())
            });
    }

    let target = uri.path_and_query().map_or_else(|| uri.path(), |pq| pq.as_str());
    let resolved = match prefetched.and_then(|Extension(p)| p.take(target)) {
        Some(resolved) => resolved?,
        None => resolve(extractor.as_ref(), &room, proxy.as_ref()).await?,
    };

    serve_resolved(&state, extractor.as_ref(), resolved, proxy, &prefix).await
}

/// Accept-loop side of [`forward_room`].
pub(crate) async fn route(
    state: &AppState,
    platform: &str,
    room: &str,
    query: &ForwardQuery,
    target: &str,
) -> Route {
    if query.url.as_deref().is_some_and(|u| !u.is_empty()) {
        return Route::Http(None);
    }
    let Some(extractor) = state.extractors.get(platform) else {
        return Route::Http(None);
    };
    let Ok(proxy) = state.outbound_proxy(query.proxy.as_deref()) else {
        return Route::Http(None);
    };

    match resolve(extractor.as_ref(), room, proxy.as_ref()).await {
        Ok(resolved) if tunnel::is_tunnel(&resolved.url) => {
            Route::Tunnel(tunnel_plan(extractor.as_ref(), resolved, proxy))
        }
        resolved => Route::Http(Some(Prefetched::new(target.to_string(), resolved))),
    }
}

async fn resolve(extractor: &dyn Extractor, room: &str, proxy: Option<&Url>) -> AppResult<Resolved> {
    extractor.resolve(room, proxy).await.map_err(|e| {
        tracing::error!(%room, error = %e, "get link error");
        AppError::internal(e.to_string())
    })
}

fn origin_headers(extractor: &dyn Extractor, resolved: &Resolved) -> HeaderMap {
    let mut headers = extractor.headers();
    for (name, value) in &resolved.headers {
        headers.insert(name, value.clone());
    }
    headers
}

fn tunnel_plan(extractor: &dyn Extractor, resolved: Resolved, proxy: Option<Url>) -> TunnelPlan {
    TunnelPlan {
        headers: origin_headers(extractor, &resolved),
        mobile: extractor.mobile() || resolved.mobile,
        url: resolved.url,
        proxy,
        failure: StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn serve_resolved(
    state: &AppState,
    extractor: &dyn Extractor,
    resolved: Resolved,
    proxy: Option<Url>,
    prefix: &Url,
) -> AppResult<Response> {
    if tunnel::is_tunnel(&resolved.url) {
        let plan = tunnel_plan(extractor, resolved, proxy);
        return tunnel::tunnel_response(state, plan).await;
    }
    if !matches!(resolved.url.scheme(), "http" | "https") {
        return Err(AppError::internal("unsupported schema"));
    }

    let origin = resolved.url.as_str();
    let headers = origin_headers(extractor, &resolved);
    let client = state.upstream(proxy.as_ref(), extractor.mobile() || resolved.mobile)?;

    if is_playlist(&resolved.url) {
        let hls = HlsForwarder::new(client).with_headers(headers);
        let result = match resolved.playlist {
            PlaylistMode::Wrap => hls.wrap_playlist(origin, prefix),
            PlaylistMode::Forward => hls.forward_playlist(origin, prefix).await,
        };
        result.map_err(|e| {
            tracing::error!(%origin, error = %e, "forward playlist error");
            AppError::bad_request(e.to_string())
        })
    } else {
        WebForwarder::new(client)
            .forward(&headers, origin, 0)
            .await
            .map_err(|e| {
                tracing::error!(%origin, error = %e, "forward http(s) stream error");
                AppError::internal(e.to_string())
            })
    }
}

/// `http://<host><path>` of the current request; proxied references are
/// built on it.
fn request_prefix(headers: &HeaderMap, uri: &Uri) -> AppResult<Url> {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| uri.authority().map(|a| a.as_str()))
        .ok_or_else(|| AppError::bad_request("missing host"))?;

    Url::parse(&format!("http://{host}{}", uri.path()))
        .map_err(|e| AppError::bad_request(format!("invalid host: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_request_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("127.0.0.1:8080"));
        let uri: Uri = "/huya/1?url=abc&proxy=x".parse().unwrap();

        let prefix = request_prefix(&headers, &uri).unwrap();
        assert_eq!(prefix.as_str(), "http://127.0.0.1:8080/huya/1");
    }

    #[test]
    fn test_request_prefix_needs_host() {
        let uri: Uri = "/huya/1".parse().unwrap();
        let err = request_prefix(&HeaderMap::new(), &uri).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
