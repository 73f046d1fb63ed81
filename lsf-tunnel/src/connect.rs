//! TCP dialing for tunnels: direct, through an HTTP CONNECT proxy, or
//! through a SOCKS5 proxy.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_socks::tcp::Socks5Stream;
use url::Url;

use crate::{Error, Result};

const MAX_PROXY_HEAD: usize = 8 * 1024;

pub(crate) async fn dial(target: &Url, proxy: Option<&Url>) -> Result<TcpStream> {
    let host = target
        .host_str()
        .ok_or_else(|| Error::MissingHost(target.to_string()))?;
    let port = target.port_or_known_default().unwrap_or(80);

    match proxy {
        None => Ok(TcpStream::connect((host, port)).await?),
        Some(proxy) => match proxy.scheme() {
            "http" => connect_via_http(proxy, host, port).await,
            "socks5" | "socks5h" => connect_via_socks(proxy, host, port).await,
            other => Err(Error::UnsupportedProxy(other.to_string())),
        },
    }
}

/// `socks5` resolves the target here, `socks5h` leaves it to the proxy.
async fn connect_via_socks(proxy: &Url, host: &str, port: u16) -> Result<TcpStream> {
    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| Error::MissingHost(proxy.to_string()))?;
    let proxy_port = proxy.port().unwrap_or(1080);

    tracing::debug!(
        proxy = %proxy_host,
        target = %host,
        port,
        scheme = proxy.scheme(),
        "opening SOCKS5 tunnel"
    );
    let socket = TcpStream::connect((proxy_host, proxy_port)).await?;

    let stream = if proxy.scheme() == "socks5" {
        let addr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| Error::MissingHost(format!("{host}:{port}")))?;
        socks_handshake(socket, addr, proxy).await?
    } else {
        socks_handshake(socket, (host, port), proxy).await?
    };
    Ok(stream)
}

async fn socks_handshake<'t, T>(socket: TcpStream, target: T, proxy: &Url) -> Result<TcpStream>
where
    T: tokio_socks::IntoTargetAddr<'t>,
{
    let stream = if proxy.username().is_empty() {
        Socks5Stream::connect_with_socket(socket, target).await?
    } else {
        Socks5Stream::connect_with_password_and_socket(
            socket,
            target,
            proxy.username(),
            proxy.password().unwrap_or_default(),
        )
        .await?
    };
    Ok(stream.into_inner())
}

async fn connect_via_http(proxy: &Url, host: &str, port: u16) -> Result<TcpStream> {
    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| Error::MissingHost(proxy.to_string()))?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(80);

    tracing::debug!(proxy = %proxy_host, target = %host, port, "opening CONNECT tunnel");
    let mut stream = TcpStream::connect((proxy_host, proxy_port)).await?;

    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if !proxy.username().is_empty() {
        let credentials = format!("{}:{}", proxy.username(), proxy.password().unwrap_or_default());
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            STANDARD.encode(credentials)
        ));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let head = read_head(&mut stream).await?;
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(&head) {
        Ok(httparse::Status::Complete(_)) if response.code == Some(200) => Ok(stream),
        Ok(httparse::Status::Complete(_)) => Err(Error::ProxyRefused(format!(
            "{} {}",
            response.code.unwrap_or_default(),
            response.reason.unwrap_or_default()
        ))),
        Ok(httparse::Status::Partial) => Err(Error::ProxyRefused("truncated response".into())),
        Err(e) => Err(Error::ProxyRefused(e.to_string())),
    }
}

/// Read up to the blank line ending the proxy's response head.
///
/// Reads a byte at a time so nothing past the head is consumed.
async fn read_head(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await? == 0 {
            return Err(Error::ProxyRefused("connection closed".into()));
        }
        head.push(byte[0]);
        if head.len() > MAX_PROXY_HEAD {
            return Err(Error::ProxyRefused("response head too large".into()));
        }
    }
    Ok(head)
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    async fn fake_proxy(reply: &'static [u8]) -> (Url, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 512];
            while !received.ends_with(b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
            }
            stream.write_all(reply).await.unwrap();
            received
        });
        (Url::parse(&format!("http://user:pw@{addr}")).unwrap(), task)
    }

    #[tokio::test]
    async fn test_connect_request() {
        let (proxy, task) = fake_proxy(b"HTTP/1.1 200 Connection established\r\n\r\n").await;
        let target = Url::parse("wss://live.example.com/ws").unwrap();

        dial(&target, Some(&proxy)).await.unwrap();

        let received = String::from_utf8(task.await.unwrap()).unwrap();
        assert!(received.starts_with("CONNECT live.example.com:443 HTTP/1.1\r\n"));
        assert!(received.contains(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            STANDARD.encode("user:pw")
        )));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (proxy, _task) = fake_proxy(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await;
        let target = Url::parse("ws://live.example.com/ws").unwrap();

        let result = dial(&target, Some(&proxy)).await;
        assert!(matches!(result, Err(Error::ProxyRefused(reason)) if reason.starts_with("407")));
    }

    /// Minimal SOCKS5 server: optional username/password, one CONNECT,
    /// then writes `hello`. Yields the CONNECT address bytes it received.
    async fn fake_socks(
        credentials: Option<(&'static str, &'static str)>,
    ) -> (String, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut greeting = [0u8; 2];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting[0], 5);
            let mut methods = vec![0u8; greeting[1] as usize];
            stream.read_exact(&mut methods).await.unwrap();

            if let Some((user, pass)) = credentials {
                assert!(methods.contains(&2));
                stream.write_all(&[5, 2]).await.unwrap();
                let mut version_and_len = [0u8; 2];
                stream.read_exact(&mut version_and_len).await.unwrap();
                let mut username = vec![0u8; version_and_len[1] as usize];
                stream.read_exact(&mut username).await.unwrap();
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await.unwrap();
                let mut password = vec![0u8; len[0] as usize];
                stream.read_exact(&mut password).await.unwrap();
                assert_eq!(username, user.as_bytes());
                assert_eq!(password, pass.as_bytes());
                stream.write_all(&[1, 0]).await.unwrap();
            } else {
                assert!(methods.contains(&0));
                stream.write_all(&[5, 0]).await.unwrap();
            }

            let mut request = [0u8; 4];
            stream.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[..2], &[5, 1]);
            let mut address = match request[3] {
                1 => vec![0u8; 4],
                3 => {
                    let mut len = [0u8; 1];
                    stream.read_exact(&mut len).await.unwrap();
                    vec![0u8; len[0] as usize]
                }
                other => panic!("unexpected address type {other}"),
            };
            stream.read_exact(&mut address).await.unwrap();
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await.unwrap();
            address.extend_from_slice(&port);

            stream.write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0, 0]).await.unwrap();
            stream.write_all(b"hello").await.unwrap();
            address
        });
        (addr, task)
    }

    #[tokio::test]
    async fn test_socks5h_passes_hostname_and_credentials() {
        let (addr, task) = fake_socks(Some(("user", "pw"))).await;
        let proxy = Url::parse(&format!("socks5h://user:pw@{addr}")).unwrap();
        let target = Url::parse("wss://live.example.com/ws").unwrap();

        let mut stream = dial(&target, Some(&proxy)).await.unwrap();
        let mut greeting = [0u8; 5];
        stream.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"hello");

        let mut expected = b"live.example.com".to_vec();
        expected.extend_from_slice(&443u16.to_be_bytes());
        assert_eq!(task.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_socks5_resolves_locally() {
        let (addr, task) = fake_socks(None).await;
        let proxy = Url::parse(&format!("socks5://{addr}")).unwrap();
        let target = Url::parse("ws://127.0.0.1:9000/ws").unwrap();

        dial(&target, Some(&proxy)).await.unwrap();

        let mut expected = vec![127, 0, 0, 1];
        expected.extend_from_slice(&9000u16.to_be_bytes());
        assert_eq!(task.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_https_proxy_unsupported() {
        let proxy = Url::parse("https://127.0.0.1:8443").unwrap();
        let target = Url::parse("ws://live.example.com/ws").unwrap();
        let err = dial(&target, Some(&proxy)).await.unwrap_err();

        assert!(matches!(&err, Error::UnsupportedProxy(scheme) if scheme == "https"));
        assert!(err.to_string().contains("use http, socks5 or socks5h"));
    }
}
