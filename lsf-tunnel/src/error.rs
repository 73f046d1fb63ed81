use std::time::Duration;

use thiserror::Error;

/// Tunnel setup failures.
///
/// Everything here happens before a single byte reaches the client, so the
/// caller can still answer with an ordinary HTTP error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown protocol: {0}")]
    UnsupportedScheme(String),

    #[error("invalid backend url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("backend url has no host: {0}")]
    MissingHost(String),

    #[error("dial backend error: {0}")]
    Connect(#[from] std::io::Error),

    #[error("websocket handshake error: {0}")]
    Handshake(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("backend refused the upgrade: {0}")]
    UnexpectedStatus(http::StatusCode),

    #[error("handshake did not finish within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("proxy scheme not supported for tunnels: {0} (use http, socks5 or socks5h)")]
    UnsupportedProxy(String),

    #[error("proxy refused CONNECT: {0}")]
    ProxyRefused(String),

    #[error("socks5 proxy error: {0}")]
    Socks(#[from] tokio_socks::Error),

    #[error("tunnel already started")]
    AlreadyStarted,

    #[error("tunnel closed")]
    Closed,

    #[error("write frontend error: {0}")]
    Frontend(#[source] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Handshake(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
