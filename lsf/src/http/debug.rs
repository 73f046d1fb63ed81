//! Debug forwarding
//!
//! `GET /debug/{method}?url=<base64>&headers=<base64 json>` forwards an
//! arbitrary origin without going through an extractor. `headers` decodes to
//! `{"data": {"Name": "value", ...}}`; a `User-Agent` in it is ignored since
//! the forwarder sets its own.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use lsf_proxy::{reference::decode_origin, WebForwarder};
use serde::Deserialize;
use url::Url;

use crate::{
    error::{AppError, AppResult},
    http::{
        tunnel::{self, TunnelPlan},
        AppState,
    },
};

#[derive(Debug, Default, Deserialize)]
pub struct DebugQuery {
    pub url: Option<String>,
    pub headers: Option<String>,
    pub proxy: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Web,
    Tunnel,
}

fn parse_method(method: &str) -> AppResult<Method> {
    match method.to_lowercase().as_str() {
        "web" | "http" => Ok(Method::Web),
        "websocket" | "ws" => Ok(Method::Tunnel),
        _ => Err(AppError::bad_request("unsupported forwarder")),
    }
}

impl DebugQuery {
    fn origin(&self) -> AppResult<String> {
        let encoded = self
            .url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| AppError::bad_request("no url found"))?;
        decode_origin(encoded).map_err(|e| AppError::bad_request(format!("decode url error: {e}")))
    }

    fn origin_headers(&self) -> AppResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        let Some(encoded) = self.headers.as_deref().filter(|h| !h.is_empty()) else {
            return Ok(headers);
        };

        let raw = STANDARD
            .decode(encoded.trim().replace(' ', "+"))
            .map_err(|e| AppError::bad_request(format!("decode headers error: {e}")))?;
        let packed: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|e| AppError::bad_request(format!("decode headers error: {e}")))?;
        tracing::debug!(headers = %packed, "request headers from query");

        let Some(data) = packed.get("data").and_then(serde_json::Value::as_object) else {
            return Ok(headers);
        };
        for (name, value) in data {
            if name.eq_ignore_ascii_case("user-agent") {
                continue;
            }
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| AppError::bad_request(format!("invalid header name: {name}")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|_| AppError::bad_request(format!("invalid header value for {name}")))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

/// Tunnel plan for a debug request, if it is one and is well-formed.
pub(crate) fn tunnel_plan(state: &AppState, method: &str, query: &DebugQuery) -> Option<TunnelPlan> {
    if parse_method(method).ok()? != Method::Tunnel {
        return None;
    }
    Some(TunnelPlan {
        url: Url::parse(&query.origin().ok()?).ok()?,
        headers: query.origin_headers().ok()?,
        proxy: state.outbound_proxy(query.proxy.as_deref()).ok()?,
        mobile: false,
        failure: StatusCode::BAD_REQUEST,
    })
}

/// GET /debug/{method}
pub async fn forward_debug(
    State(state): State<AppState>,
    Path(method): Path<String>,
    Query(query): Query<DebugQuery>,
) -> AppResult<Response> {
    let proxy = state.outbound_proxy(query.proxy.as_deref())?;
    let headers = query.origin_headers()?;
    let origin = query.origin()?;
    tracing::debug!(%method, %origin, ?headers, "debug forward");

    match parse_method(&method)? {
        Method::Web => {
            let client = state.upstream(proxy.as_ref(), false)?;
            WebForwarder::new(client)
                .forward(&headers, &origin, 0)
                .await
                .map_err(|e| AppError::bad_request(e.to_string()))
        }
        Method::Tunnel => {
            let url = Url::parse(&origin).map_err(|e| AppError::bad_request(e.to_string()))?;
            let plan = TunnelPlan {
                url,
                headers,
                proxy,
                mobile: false,
                failure: StatusCode::BAD_REQUEST,
            };
            tunnel::tunnel_response(&state, plan).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(url: Option<&str>, headers: Option<&str>) -> DebugQuery {
        DebugQuery {
            url: url.map(str::to_string),
            headers: headers.map(str::to_string),
            proxy: None,
        }
    }

    #[test]
    fn test_parse_method() {
        assert_eq!(parse_method("WS").unwrap(), Method::Tunnel);
        assert_eq!(parse_method("websocket").unwrap(), Method::Tunnel);
        assert_eq!(parse_method("http").unwrap(), Method::Web);
        assert_eq!(
            parse_method("ftp").unwrap_err().message,
            "unsupported forwarder"
        );
    }

    #[test]
    fn test_origin_headers_strip_user_agent() {
        let packed = STANDARD.encode(
            r#"{"data":{"Referer":"https://live.example.com","User-Agent":"curl","X-Count":3}}"#,
        );
        let headers = query(None, Some(&packed)).origin_headers().unwrap();

        assert_eq!(headers["referer"], "https://live.example.com");
        assert_eq!(headers["x-count"], "3");
        assert!(!headers.contains_key("user-agent"));
    }

    #[test]
    fn test_origin_errors() {
        assert_eq!(query(None, None).origin().unwrap_err().message, "no url found");
        assert!(query(Some("%%%"), None)
            .origin()
            .unwrap_err()
            .message
            .starts_with("decode url error"));
        assert!(query(None, Some("%%%"))
            .origin_headers()
            .unwrap_err()
            .message
            .starts_with("decode headers error"));
    }
}
