use axum::http::{header, HeaderMap, StatusCode};
use url::Url;

use crate::{Error, Result};

/// Upper bound on redirect hops. An infinite redirect loop costs exactly
/// `MAX_REDIRECTS + 1` requests before failing.
pub const MAX_REDIRECTS: usize = 10;

/// HTTP client used for every origin request of one forwarded request.
///
/// Redirects are never followed by reqwest itself; [`Self::get`] chases
/// them explicitly so the hop count stays bounded and observable.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    proxy: Option<Url>,
}

impl UpstreamClient {
    /// Build a client sending `user_agent`, optionally through `proxy`.
    pub fn new(proxy: Option<&Url>, user_agent: &str) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(user_agent);

        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|e| Error::InvalidProxy(format!("{proxy}: {e}")))?;
            builder = builder.proxy(proxy);
        }

        Ok(Self {
            http: builder.build()?,
            proxy: proxy.cloned(),
        })
    }

    /// The outbound proxy this client sends through, if any.
    #[must_use]
    pub const fn proxy(&self) -> Option<&Url> {
        self.proxy.as_ref()
    }

    /// GET `url`, following 301/302 redirects, and return the first `200`
    /// response together with the URL that served it.
    ///
    /// `depth` is the number of hops already taken; callers start at 0.
    pub async fn get(
        &self,
        headers: &HeaderMap,
        url: &str,
        depth: usize,
    ) -> Result<(Url, reqwest::Response)> {
        let mut current = Url::parse(url).map_err(|e| Error::invalid_url(url, e))?;
        let mut depth = depth;

        loop {
            if depth > MAX_REDIRECTS {
                return Err(Error::TooManyRedirections);
            }
            tracing::debug!(url = %current, depth, "requesting origin");

            let response = self
                .http
                .get(current.clone())
                .headers(headers.clone())
                .send()
                .await?;

            match response.status() {
                StatusCode::OK => return Ok((current, response)),
                StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => {
                    let location = response
                        .headers()
                        .get(header::LOCATION)
                        .and_then(|v| v.to_str().ok())
                        .filter(|v| !v.is_empty())
                        .ok_or(Error::MissingLocation)?;
                    current = current
                        .join(location)
                        .map_err(|_| Error::InvalidLocation(location.to_string()))?;
                    depth += 1;
                }
                status => return Err(Error::UpstreamStatus(status)),
            }
        }
    }
}
