use super::tunnel::{copy_with_idle_timeout, has_port, CONNECTION_IDLE_TIMEOUT};
use super::{write_error, Exchange};
use crate::error::{ProxyError, Result};
use crate::protocol::{read_head, Headers, RequestHead, ResponseHead};
use http::StatusCode;
use std::io::{self, Cursor};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tracing::{debug, warn};
use url::Url;

/// 只在相邻两跳之间有意义的头部，转发时去掉
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

/// 报文体长度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyLength {
    Empty,
    Fixed(u64),
    /// 分块编码，到结束块和尾部为止
    Chunked,
    /// 读到连接关闭为止
    Unbounded,
}

/// 分块编码中一行的最大长度
const MAX_CHUNK_LINE: u64 = 4096;

fn is_chunked(headers: &Headers) -> bool {
    headers
        .get("transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
}

fn content_length(headers: &Headers) -> Option<u64> {
    headers.get("content-length")?.trim().parse().ok()
}

fn request_body(headers: &Headers) -> BodyLength {
    if is_chunked(headers) {
        return BodyLength::Chunked;
    }
    match content_length(headers) {
        Some(0) | None => BodyLength::Empty,
        Some(n) => BodyLength::Fixed(n),
    }
}

fn response_body(method: &str, response: &ResponseHead) -> BodyLength {
    if method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&response.status)
        || response.status == 204
        || response.status == 304
    {
        return BodyLength::Empty;
    }
    if is_chunked(&response.headers) {
        return BodyLength::Chunked;
    }
    match content_length(&response.headers) {
        Some(n) => BodyLength::Fixed(n),
        None => BodyLength::Unbounded,
    }
}

/// 去掉逐跳头部（包括 `Connection` 中列出的头部）
pub(crate) fn strip_hop_by_hop(headers: &mut Headers) {
    let listed: Vec<String> = headers
        .get("connection")
        .map(|v| {
            v.split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default();
    for name in listed.iter().map(String::as_str).chain(HOP_BY_HOP.iter().copied()) {
        headers.remove(name);
    }
}

fn with_default_port(host: &str, port: u16) -> String {
    if has_port(host) {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    }
}

/// 把代理请求改写为发往源站的请求，返回 (目标地址, 请求头)
pub(crate) fn rewrite_request(request: &RequestHead) -> Result<(String, RequestHead)> {
    let (addr, path, host) = if request.target.starts_with('/') {
        let host = request
            .headers
            .get("host")
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::protocol_error("missing Host header"))?;
        (
            with_default_port(host, 80),
            request.target.clone(),
            host.to_string(),
        )
    } else {
        let url = Url::parse(&request.target).map_err(|e| {
            ProxyError::protocol_error(format!("invalid request target {}: {}", request.target, e))
        })?;
        if url.scheme() != "http" {
            return Err(ProxyError::protocol_error(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::protocol_error("request target has no host"))?;
        let port = url.port_or_known_default().unwrap_or(80);

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        let host_header = match url.port() {
            Some(p) => format!("{}:{}", host, p),
            None => host.to_string(),
        };
        (format!("{}:{}", host, port), path, host_header)
    };

    let mut headers = request.headers.clone();
    strip_hop_by_hop(&mut headers);
    // 不处理 1xx 中间响应
    headers.remove("expect");
    // 绝对形式的目标优先于请求中的 Host
    headers.set("Host", host);
    headers.set("Connection", "close");

    Ok((
        addr,
        RequestHead {
            method: request.method.clone(),
            target: path,
            version: "HTTP/1.1".to_string(),
            headers,
        },
    ))
}

async fn read_response<R>(reader: &mut R) -> Result<(ResponseHead, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let (head, rest) = read_head(reader)
        .await?
        .ok_or_else(|| ProxyError::protocol_error("empty response from target"))?;
    Ok((ResponseHead::parse(&head)?, rest))
}

async fn copy_body<R, W>(reader: R, writer: &mut W, length: BodyLength) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match length {
        BodyLength::Empty => {
            writer.flush().await?;
            Ok(0)
        }
        BodyLength::Fixed(n) => copy_with_idle_timeout(&mut reader.take(n), writer).await,
        BodyLength::Chunked => copy_chunked(reader, writer).await,
        BodyLength::Unbounded => {
            let mut reader = reader;
            copy_with_idle_timeout(&mut reader, writer).await
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let line = std::str::from_utf8(line)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))?;
    let size = line.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(size, 16).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid chunk size: {:?}", size),
        )
    })
}

async fn read_chunk_line<R>(reader: &mut R, line: &mut Vec<u8>) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let mut limited = (&mut *reader).take(MAX_CHUNK_LINE);
    match tokio::time::timeout(CONNECTION_IDLE_TIMEOUT, limited.read_until(b'\n', line)).await {
        Ok(Ok(_)) if line.ends_with(b"\n") => Ok(()),
        Ok(Ok(_)) => Err(io::ErrorKind::UnexpectedEof.into()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "Connection idle timeout",
        )),
    }
}

/// 原样复制分块编码的报文体，读到结束块和尾部后停止
async fn copy_chunked<R, W>(reader: R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut total = 0u64;

    loop {
        read_chunk_line(&mut reader, &mut line).await?;
        writer.write_all(&line).await?;
        total += line.len() as u64;

        let size = parse_chunk_size(&line)?;
        if size == 0 {
            break;
        }
        // 数据之后的 CRLF
        let want = size + 2;
        let copied = copy_with_idle_timeout(&mut (&mut reader).take(want), writer).await?;
        total += copied;
        if copied < want {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
    }

    loop {
        read_chunk_line(&mut reader, &mut line).await?;
        writer.write_all(&line).await?;
        total += line.len() as u64;
        if line == b"\r\n" || line == b"\n" {
            break;
        }
    }
    writer.flush().await?;
    Ok(total)
}

/// 普通 HTTP 请求转发
pub(super) async fn forward<S>(
    ctx: Exchange<'_>,
    mut inbound: S,
    leftover: Vec<u8>,
    request: &RequestHead,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (addr, outgoing) = match rewrite_request(request) {
        Ok(rewritten) => rewritten,
        Err(e) => {
            write_error(&mut inbound, StatusCode::BAD_REQUEST, &e.to_string(), None)
                .await
                .ok();
            return Err(e);
        }
    };

    let tagged = match ctx.outbound.dial(ctx.cancel, &addr).await {
        Ok(tagged) => tagged,
        Err(e) => {
            warn!("{} {}: {}", request.method, request.target, e);
            write_error(
                &mut inbound,
                StatusCode::SERVICE_UNAVAILABLE,
                &e.to_string(),
                None,
            )
            .await
            .ok();
            return Ok(());
        }
    };
    let metered = ctx.outbound.is_metered(tagged.leg);

    let (mut target_r, mut target_w) = tokio::io::split(tagged.stream);
    if let Err(e) = target_w.write_all(&outgoing.encode()).await {
        write_error(
            &mut inbound,
            StatusCode::SERVICE_UNAVAILABLE,
            &e.to_string(),
            None,
        )
        .await
        .ok();
        return Ok(());
    }

    let (client_r, mut client_w) = tokio::io::split(inbound);

    // 请求体与响应并行转发：分块编码的请求体在响应结束时被放弃
    let body_length = request_body(&request.headers);
    let upload = async move {
        let body = Cursor::new(leftover).chain(client_r);
        copy_body(body, &mut target_w, body_length).await
    };
    tokio::pin!(upload);
    let mut uploading = true;

    let response = {
        let read = read_response(&mut target_r);
        tokio::pin!(read);
        loop {
            tokio::select! {
                result = &mut upload, if uploading => {
                    uploading = false;
                    if let Err(e) = result {
                        debug!("{} request body: {}", addr, e);
                    }
                }
                result = &mut read => break result,
            }
        }
    };

    let (mut response, rest) = match response {
        Ok(response) => response,
        Err(e) => {
            write_error(
                &mut client_w,
                StatusCode::SERVICE_UNAVAILABLE,
                &e.to_string(),
                None,
            )
            .await
            .ok();
            return Ok(());
        }
    };

    let length = response_body(&request.method, &response);
    strip_hop_by_hop(&mut response.headers);
    response.headers.set("Connection", "close");

    let download = async {
        client_w.write_all(&response.encode()).await?;
        let body = Cursor::new(rest).chain(target_r);
        let copied = if metered {
            let grant = ctx.grant;
            let mut writer = ctx
                .gate
                .ledger()
                .writer(&grant.principal, grant.limiter.writer(&mut client_w));
            copy_body(body, &mut writer, length).await?
        } else {
            copy_body(body, &mut client_w, length).await?
        };
        let _ = client_w.shutdown().await;
        Ok::<u64, io::Error>(copied)
    };
    tokio::pin!(download);

    let result = loop {
        tokio::select! {
            result = &mut upload, if uploading => {
                uploading = false;
                if let Err(e) = result {
                    debug!("{} request body: {}", addr, e);
                }
            }
            result = &mut download => break result,
        }
    };

    match result {
        Ok(n) => {
            debug!("[{}] {} {} -> {} bytes", tagged.leg, response.status, addr, n);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
