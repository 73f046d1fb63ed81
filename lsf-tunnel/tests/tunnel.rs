//! Tunnel client and bridge tests against a local WebSocket backend.

use std::{future::Future, time::Duration};

use futures_util::SinkExt;
use http::HeaderMap;
use lsf_tunnel::{
    bridge::PREAMBLE, Error, PipeError, TunnelBridge, TunnelClient,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{Request, Response},
        Message,
    },
    WebSocketStream,
};
use url::Url;

/// Accept one WebSocket connection and run `script` on it. The returned
/// receiver yields the upgrade request's `User-Agent`.
async fn spawn_backend<F, Fut>(script: F) -> (Url, oneshot::Receiver<String>)
where
    F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (ua_tx, ua_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut user_agent = String::new();
        let ws = accept_hdr_async(stream, |request: &Request, response: Response| {
            user_agent = request
                .headers()
                .get("user-agent")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            Ok(response)
        })
        .await
        .unwrap();
        let _ = ua_tx.send(user_agent);
        script(ws).await;
    });

    (Url::parse(&format!("ws://{addr}/live/room.flv")).unwrap(), ua_rx)
}

async fn read_all(client: &TunnelClient) -> (Vec<u8>, PipeError) {
    let mut collected = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match client.read(&mut buf).await {
            Ok(n) => collected.extend_from_slice(&buf[..n]),
            Err(e) => return (collected, e),
        }
    }
}

#[tokio::test]
async fn test_binary_frames_become_the_stream() {
    let (url, user_agent) = spawn_backend(|mut ws| async move {
        ws.send(Message::binary(b"FLV".to_vec())).await.unwrap();
        ws.send(Message::text("metadata")).await.unwrap();
        ws.send(Message::binary(b"\x01\x05".to_vec())).await.unwrap();
        ws.close(None).await.unwrap();
    })
    .await;

    let client = TunnelClient::new(url, HeaderMap::new(), None).with_user_agent("lsf-test");
    client.start().await.unwrap();

    let (bytes, end) = read_all(&client).await;
    assert_eq!(bytes, b"FLV\x01\x05");
    assert_eq!(end, PipeError::BackendClosed);
    assert_eq!(user_agent.await.unwrap(), "lsf-test");
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (url, _) = spawn_backend(|mut ws| async move {
        ws.send(Message::binary(b"data".to_vec())).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    })
    .await;

    let client = TunnelClient::new(url, HeaderMap::new(), None);
    client.start().await.unwrap();
    client.close();
    client.close();

    assert!(client.is_closed());
    let mut buf = [0u8; 8];
    assert_eq!(client.read(&mut buf).await, Err(PipeError::TunnelClosed));
    assert!(matches!(client.start().await, Err(Error::Closed)));
}

#[tokio::test]
async fn test_close_before_start() {
    let client = TunnelClient::new(
        Url::parse("ws://127.0.0.1:9/never").unwrap(),
        HeaderMap::new(),
        None,
    );
    client.close();

    assert!(matches!(client.start().await, Err(Error::Closed)));
    assert_eq!(client.pipe().err(), Some(PipeError::TunnelClosed));
}

#[tokio::test]
async fn test_refused_upgrade_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = stream.read(&mut buf).await;
        let _ = stream
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
            .await;
    });

    let client = TunnelClient::new(
        Url::parse(&format!("ws://{addr}/gone")).unwrap(),
        HeaderMap::new(),
        None,
    );
    match client.start().await {
        Err(Error::UnexpectedStatus(status)) => assert_eq!(status.as_u16(), 404),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_silent_backend_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let client = TunnelClient::new(
        Url::parse(&format!("ws://{addr}/slow")).unwrap(),
        HeaderMap::new(),
        None,
    )
    .with_handshake_timeout(Duration::from_millis(100));

    assert!(matches!(
        client.start().await,
        Err(Error::HandshakeTimeout(_))
    ));
}

#[tokio::test]
async fn test_bridge_writes_preamble_then_stream() {
    let (url, _) = spawn_backend(|mut ws| async move {
        ws.send(Message::binary(b"FLV\x01".to_vec())).await.unwrap();
        ws.send(Message::binary(b"tag".to_vec())).await.unwrap();
        // Dropping without a close frame ends the stream abruptly.
    })
    .await;

    let (conn, mut client_side) = tokio::io::duplex(256 * 1024);
    let bridge = TunnelBridge::new("lsf-test", None);
    let pump = bridge.start(conn, url.as_str()).await.unwrap();

    let mut received = Vec::new();
    client_side.read_to_end(&mut received).await.unwrap();
    pump.await.unwrap();

    let mut expected = PREAMBLE.to_vec();
    expected.extend_from_slice(b"FLV\x01tag");
    assert_eq!(received, expected);

    let text = String::from_utf8_lossy(&received);
    assert_eq!(text.matches("HTTP/1.1").count(), 1);
}

#[tokio::test]
async fn test_bridge_stops_when_client_leaves() {
    let (url, _) = spawn_backend(|mut ws| async move {
        for _ in 0..1000 {
            if ws.send(Message::binary(vec![0u8; 4096])).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;

    let (conn, client_side) = tokio::io::duplex(4096);
    let pump = TunnelBridge::new("lsf-test", None)
        .start(conn, url.as_str())
        .await
        .unwrap();
    drop(client_side);

    tokio::time::timeout(Duration::from_secs(5), pump)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_bridge_rejects_non_websocket_backend() {
    let (conn, mut client_side) = tokio::io::duplex(1024);
    let bridge = TunnelBridge::new("lsf-test", None);

    let err = bridge
        .start(conn, "http://127.0.0.1:9/live.flv")
        .await
        .unwrap_err();
    assert!(matches!(err.error, Error::UnsupportedScheme(ref s) if s == "http"));
    assert_eq!(err.error.to_string(), "unknown protocol: http");

    // The connection comes back unwritten.
    drop(err.conn);
    let mut received = Vec::new();
    client_side.read_to_end(&mut received).await.unwrap();
    assert!(received.is_empty());
}
