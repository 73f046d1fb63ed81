// Module: http
// Player-facing routes: platform rooms, debug forwarding and health.

pub mod debug;
pub mod forwarder;
pub mod health;
pub mod tunnel;

use std::time::Duration;

use anyhow::Context;
use axum::{
    http::{HeaderMap, Method},
    routing::get,
    Router,
};
use lsf_core::{Config, UserAgent};
use lsf_proxy::UpstreamClient;
use lsf_tunnel::{TunnelBridge, TunnelClient};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use url::Url;

use crate::{
    error::{AppError, AppResult},
    extractor::Registry,
};

/// Shared by every route and by the raw accept loop.
#[derive(Debug, Clone)]
pub struct AppState {
    pub extractors: Registry,
    pub user_agent: UserAgent,
    /// Used when a request carries no `proxy` parameter.
    pub default_proxy: Option<Url>,
    pub handshake_timeout: Duration,
    pub debug_routes: bool,
}

impl AppState {
    pub fn from_config(config: &Config, extractors: Registry) -> anyhow::Result<Self> {
        let default_proxy = config
            .upstream
            .proxy
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(Url::parse)
            .transpose()
            .context("upstream.proxy is not a valid URL")?;

        Ok(Self {
            extractors,
            user_agent: UserAgent::from(&config.upstream),
            default_proxy,
            handshake_timeout: config.upstream.handshake_timeout(),
            debug_routes: config.server.debug_routes,
        })
    }

    /// The outbound proxy for one request: its `proxy` parameter, else the
    /// configured default.
    pub fn outbound_proxy(&self, requested: Option<&str>) -> AppResult<Option<Url>> {
        match requested.filter(|p| !p.is_empty()) {
            Some(proxy) => Url::parse(proxy).map(Some).map_err(|e| {
                tracing::debug!(proxy, error = %e, "rejecting proxy parameter");
                AppError::bad_request("invalid proxy")
            }),
            None => Ok(self.default_proxy.clone()),
        }
    }

    pub fn upstream(&self, proxy: Option<&Url>, mobile: bool) -> AppResult<UpstreamClient> {
        UpstreamClient::new(proxy, self.user_agent.pick(mobile))
            .map_err(|e| AppError::bad_request(e.to_string()))
    }

    pub fn bridge(&self, headers: HeaderMap, proxy: Option<Url>, mobile: bool) -> TunnelBridge {
        TunnelBridge::new(self.user_agent.pick(mobile), proxy)
            .with_headers(headers)
            .with_handshake_timeout(self.handshake_timeout)
    }

    pub fn tunnel_client(
        &self,
        url: Url,
        headers: HeaderMap,
        proxy: Option<Url>,
        mobile: bool,
    ) -> TunnelClient {
        TunnelClient::new(url, headers, proxy)
            .with_user_agent(self.user_agent.pick(mobile))
            .with_handshake_timeout(self.handshake_timeout)
    }
}

/// Build the HTTP router.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .merge(health::create_health_router())
        .route("/{platform}/{room}", get(forwarder::forward_room));

    if state.debug_routes {
        router = router.route("/debug/{method}", get(debug::forward_debug));
    }

    router
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::HEAD,
                ])
                .allow_headers(Any)
                .max_age(Duration::from_secs(12 * 60 * 60)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
