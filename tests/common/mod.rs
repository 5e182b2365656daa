//! Common utilities for integration tests
#![allow(dead_code)]

use base64::{engine::general_purpose::STANDARD, Engine as _};
use meter_proxy::config::{AccountingConfig, ServerConfig, ServerFullConfig};
use meter_proxy::{Accounting, Server};
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::time::timeout;

pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Accounting files under `dir`, with the given secrets and whitelist content
pub fn accounting(dir: &Path, secrets: &str, whitelist: &str) -> AccountingConfig {
    let config = AccountingConfig {
        secrets: dir.join("secrets"),
        whitelist: dir.join("whitelist"),
        status: dir.join("status"),
        record: dir.join("database"),
        keep: 3,
    };
    std::fs::write(&config.secrets, secrets).unwrap();
    std::fs::write(&config.whitelist, whitelist).unwrap();
    config
}

/// A proxy server running in the background
pub struct RunningServer {
    pub addr: SocketAddr,
    pub accounting: Arc<Accounting>,
    cancel: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl RunningServer {
    /// Stop the server and wait for the final save
    pub async fn stop(self) {
        self.cancel.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

pub async fn start_server(accounting: AccountingConfig, https: bool) -> RunningServer {
    let config = ServerFullConfig {
        server: ServerConfig::builder()
            .bind_addr("127.0.0.1")
            .bind_port(get_available_port())
            .https(https)
            .build()
            .unwrap(),
        accounting,
    };
    let server = Server::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let accounting = server.accounting().clone();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(server.run(cancel.clone()));
    RunningServer {
        addr,
        accounting,
        cancel,
        handle,
    }
}

pub fn basic(user: &str, pass: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", user, pass)))
}

/// Create a simple echo server for testing
pub async fn start_echo_server() -> SocketAddr {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// HTTP origin answering every request with the request head it received as the body
pub async fn start_origin_server() -> SocketAddr {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind origin server");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut reader = BufReader::new(socket);
                let mut head = String::new();
                loop {
                    let mut line = String::new();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                    if line == "\r\n" {
                        break;
                    }
                    head.push_str(&line);
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n{}",
                    head.len(),
                    head
                );
                let _ = reader.get_mut().write_all(response.as_bytes()).await;
                let _ = reader.get_mut().shutdown().await;
            });
        }
    });
    addr
}

/// Read a response head, returning it with any bytes read past it
pub async fn read_response_head<S: AsyncRead + Unpin>(stream: &mut S) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            return (String::from_utf8_lossy(&buf).into_owned(), rest);
        }
        let n = timeout(IO_TIMEOUT, stream.read(&mut chunk))
            .await
            .expect("Timed out reading response head")
            .expect("Failed to read response head");
        assert!(n > 0, "Connection closed before response head");
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Send CONNECT through the proxy, returning the stream and the response head
pub async fn connect_via(
    proxy: SocketAddr,
    target: SocketAddr,
    authorization: Option<&str>,
) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
    if let Some(auth) = authorization {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let (head, rest) = read_response_head(&mut stream).await;
    assert!(rest.is_empty());
    (stream, head)
}

/// Write `data` and read back the same number of bytes
pub async fn echo_round_trip<S>(stream: &mut S, data: &[u8]) -> Vec<u8>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(data).await.unwrap();
    let mut received = vec![0u8; data.len()];
    timeout(IO_TIMEOUT, stream.read_exact(&mut received))
        .await
        .expect("Timed out waiting for echo")
        .unwrap();
    received
}

/// Send a plain HTTP request through the proxy and read the whole response
pub async fn http_get_via(proxy: SocketAddr, url: &str, extra_headers: &str) -> String {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: ignored.invalid\r\n{}\r\n",
        url, extra_headers
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    timeout(IO_TIMEOUT, stream.read_to_end(&mut response))
        .await
        .expect("Timed out reading response")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

/// Poll `f` until it returns true
pub async fn eventually<F: FnMut() -> bool>(mut f: F) -> bool {
    for _ in 0..50 {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
