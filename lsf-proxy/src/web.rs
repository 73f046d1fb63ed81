//! Verbatim byte forwarding of HTTP(S) media (FLV streams, HLS segments).

use axum::{
    body::Body,
    http::HeaderMap,
    response::Response,
};
use futures::TryStreamExt;

use crate::{client::UpstreamClient, Result};

/// Streams an origin response through unchanged.
#[derive(Debug, Clone)]
pub struct WebForwarder {
    client: UpstreamClient,
}

impl WebForwarder {
    #[must_use]
    pub const fn new(client: UpstreamClient) -> Self {
        Self { client }
    }

    /// GET `url` with `headers` and relay the first `200` response.
    ///
    /// Status and headers are copied as-is and the body is streamed without
    /// buffering. Header filtering is the caller's job. Once the response
    /// is handed back, an origin failure can only truncate the body.
    pub async fn forward(&self, headers: &HeaderMap, url: &str, depth: usize) -> Result<Response> {
        let (served_by, upstream) = self.client.get(headers, url, depth).await?;
        tracing::debug!(url = %served_by, headers = ?upstream.headers(), "relaying origin response");

        let mut builder = Response::builder().status(upstream.status());
        for (name, value) in upstream.headers() {
            builder = builder.header(name, value);
        }

        let body = upstream.bytes_stream().inspect_err(move |e| {
            tracing::debug!(url = %served_by, error = %e, "origin body interrupted");
        });

        Ok(builder.body(Body::from_stream(body))?)
    }
}
