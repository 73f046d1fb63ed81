//! Raw-socket bridge from a tunnel to a hijacked client connection.
//!
//! The client gets a fixed FLV response head followed by the backend's byte
//! stream. The head carries neither a length nor chunked framing, so the
//! stream ends when either side closes the connection.

use std::time::Duration;

use http::HeaderMap;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    task::JoinHandle,
};
use url::Url;

use crate::{
    client::{TunnelClient, HANDSHAKE_TIMEOUT},
    Error,
};

/// Response head written to the client once the tunnel is up.
pub const PREAMBLE: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: video/x-flv\r\n\
Transfer-Encoding: identity\r\n\
Connection: close\r\n\
Cache-Control: no-cache\r\n\
Access-Control-Allow-Origin: *\r\n\
Access-Control-Allow-Headers: *\r\n\
Access-Control-Allow-Methods: *\r\n\
\r\n";

pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// A bridge that could not start, with the untouched client connection.
///
/// Nothing has been written to `conn`, so it can still carry an error
/// response.
#[derive(Debug)]
pub struct StartError<S> {
    pub error: Error,
    pub conn: S,
}

#[derive(Debug, Clone)]
pub struct TunnelBridge {
    user_agent: String,
    headers: HeaderMap,
    proxy: Option<Url>,
    handshake_timeout: Duration,
}

impl TunnelBridge {
    #[must_use]
    pub fn new(user_agent: impl Into<String>, proxy: Option<Url>) -> Self {
        Self {
            user_agent: user_agent.into(),
            headers: HeaderMap::new(),
            proxy,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    /// Headers sent with every upgrade request.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Open a tunnel to `backend` and stream it into `conn`.
    ///
    /// Setup failures come back with `conn` unwritten. Once this returns
    /// `Ok` the response head has been sent and the copy runs on the
    /// returned task; later failures only end the stream, tearing down both
    /// the tunnel and the client connection.
    pub async fn start<S>(&self, mut conn: S, backend: &str) -> Result<JoinHandle<()>, StartError<S>>
    where
        S: AsyncWrite + Unpin + Send + 'static,
    {
        let client = match self.connect(backend).await {
            Ok(client) => client,
            Err(error) => return Err(StartError { error, conn }),
        };

        if let Err(e) = conn.write_all(PREAMBLE).await {
            client.close();
            return Err(StartError {
                error: Error::Frontend(e),
                conn,
            });
        }

        Ok(tokio::spawn(pump(client, conn)))
    }

    async fn connect(&self, backend: &str) -> Result<TunnelClient, Error> {
        let url = Url::parse(backend).map_err(|source| Error::InvalidUrl {
            url: backend.to_string(),
            source,
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::UnsupportedScheme(url.scheme().to_string()));
        }

        let client = TunnelClient::new(url, self.headers.clone(), self.proxy.clone())
            .with_user_agent(&self.user_agent)
            .with_handshake_timeout(self.handshake_timeout);
        client.start().await?;
        Ok(client)
    }
}

async fn pump<S>(client: TunnelClient, mut conn: S)
where
    S: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;

    loop {
        let n = match client.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(url = %client.url(), error = %e, copied, "tunnel stream ended");
                break;
            }
        };
        if let Err(e) = conn.write_all(&buf[..n]).await {
            tracing::debug!(url = %client.url(), error = %e, copied, "client went away");
            break;
        }
        copied += n as u64;
    }

    client.close();
    let _ = conn.shutdown().await;
}
