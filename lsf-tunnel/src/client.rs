//! WebSocket tunnel client
//!
//! Binary frames from the backend are appended to a [`Pipe`]; text and
//! control frames are ignored. A close frame or the end of the stream
//! closes the pipe so buffered bytes still drain.

use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    client_async_tls_with_config,
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::{CancellationToken, DropGuard};
use url::Url;

use crate::{
    connect,
    pipe::{Pipe, PipeError},
    Error, Result,
};

/// Default bound on dialing plus the upgrade handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
enum Slot {
    Idle,
    /// Dropping the guard stops the frame reader.
    Running { _reader: DropGuard },
    Closed,
}

#[derive(Debug)]
pub struct TunnelClient {
    url: Url,
    headers: HeaderMap,
    proxy: Option<Url>,
    handshake_timeout: Duration,
    pipe: Arc<Pipe>,
    slot: Mutex<Slot>,
}

impl TunnelClient {
    #[must_use]
    pub fn new(url: Url, headers: HeaderMap, proxy: Option<Url>) -> Self {
        Self {
            url,
            headers,
            proxy,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            pipe: Arc::new(Pipe::new()),
            slot: Mutex::new(Slot::Idle),
        }
    }

    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the `User-Agent` sent with the upgrade request, unless the
    /// caller's headers already carry one.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        if !self.headers.contains_key(header::USER_AGENT) {
            if let Ok(value) = HeaderValue::from_str(user_agent) {
                self.headers.insert(header::USER_AGENT, value);
            }
        }
        self
    }

    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// Dial the backend, complete the upgrade and start the frame reader.
    pub async fn start(&self) -> Result<()> {
        match *self.slot.lock() {
            Slot::Idle => {}
            Slot::Running { .. } => return Err(Error::AlreadyStarted),
            Slot::Closed => return Err(Error::Closed),
        }

        let ws = tokio::time::timeout(self.handshake_timeout, self.handshake())
            .await
            .map_err(|_| Error::HandshakeTimeout(self.handshake_timeout))??;

        let mut slot = self.slot.lock();
        match *slot {
            Slot::Idle => {}
            Slot::Running { .. } => return Err(Error::AlreadyStarted),
            Slot::Closed => return Err(Error::Closed),
        }

        let cancel = CancellationToken::new();
        tokio::spawn(read_frames(
            ws,
            Arc::clone(&self.pipe),
            cancel.clone(),
            self.url.clone(),
        ));
        *slot = Slot::Running {
            _reader: cancel.drop_guard(),
        };
        tracing::debug!(url = %self.url, "tunnel established");
        Ok(())
    }

    async fn handshake(&self) -> Result<WsStream> {
        let mut request = self.url.as_str().into_client_request()?;
        for (name, value) in &self.headers {
            request.headers_mut().append(name, value.clone());
        }

        let stream = connect::dial(&self.url, self.proxy.as_ref()).await?;
        let (ws, response) = match client_async_tls_with_config(request, stream, None, None).await {
            Ok(upgraded) => upgraded,
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                return Err(Error::UnexpectedStatus(response.status()));
            }
            Err(e) => return Err(e.into()),
        };
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(Error::UnexpectedStatus(response.status()));
        }
        Ok(ws)
    }

    /// Read buffered stream bytes, waiting for the next frame if needed.
    pub async fn read(&self, out: &mut [u8]) -> std::result::Result<usize, PipeError> {
        self.pipe.read_async(out).await
    }

    /// Tear the tunnel down.
    ///
    /// Stops the frame reader, drops any bytes not yet read and fails
    /// pending and future reads with [`PipeError::TunnelClosed`]. Safe to
    /// call any number of times.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.slot.lock(), Slot::Closed);
        if matches!(previous, Slot::Closed) {
            return;
        }
        drop(previous);
        self.pipe.break_with_error(PipeError::TunnelClosed);
        tracing::debug!(url = %self.url, unread = self.pipe.unread(), "tunnel closed");
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Closed)
    }

    /// The pipe carrying the backend's byte stream.
    pub fn pipe(&self) -> &Pipe {
        &self.pipe
    }
}

impl Drop for TunnelClient {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_frames(mut ws: WsStream, pipe: Arc<Pipe>, cancel: CancellationToken, url: Url) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => return,
            message = ws.next() => message,
        };

        match message {
            Some(Ok(Message::Binary(payload))) => {
                if pipe.write(&payload).is_err() {
                    return;
                }
            }
            Some(Ok(Message::Text(_))) => {
                tracing::trace!(url = %url, "ignoring text frame");
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!(url = %url, frame = ?frame, "backend sent close");
                pipe.close_with_error(PipeError::BackendClosed);
                return;
            }
            Some(Err(e)) => {
                tracing::debug!(url = %url, error = %e, "tunnel read failed");
                pipe.close_with_error(PipeError::Transport(e.to_string()));
                return;
            }
            None => {
                pipe.close_with_error(PipeError::BackendClosed);
                return;
            }
        }
    }
}
