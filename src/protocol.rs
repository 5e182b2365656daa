/// HTTP/1.1 报文头编解码
///
/// 代理只需要解析请求行、状态行和头部，报文体按字节流原样转发
use crate::error::{ProxyError, Result};
use std::fmt::Write as _;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// 报文头最大长度
pub const MAX_HEAD_SIZE: usize = 16 * 1024;
/// 读取请求头的超时时间
pub const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(30);

const READ_CHUNK: usize = 4096;

/// 查找 `\r\n\r\n`，返回报文头结束位置（含分隔符）
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// 读取一个完整的报文头
///
/// 返回 (报文头, 多读到的字节)。连接在读到任何数据之前关闭时返回 None
pub async fn read_head<R>(reader: &mut R) -> Result<Option<(Vec<u8>, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    let mut scanned: usize = 0;

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::protocol_error(
                "Unexpected EOF while reading HTTP head",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        // 分隔符可能跨越两次读取
        if let Some(end) = find_head_end(&buf[scanned.saturating_sub(3)..]) {
            let end = scanned.saturating_sub(3) + end;
            let rest = buf.split_off(end);
            return Ok(Some((buf, rest)));
        }
        scanned = buf.len();

        if buf.len() > MAX_HEAD_SIZE {
            return Err(ProxyError::protocol_error("HTTP head too long"));
        }
    }
}

/// 逐字节读取报文头，不会读到报文头之后的数据
///
/// 用于上游代理 CONNECT 握手，握手成功后剩余的数据属于隧道
pub async fn read_head_exact<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    loop {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ProxyError::protocol_error(
                    "Unexpected EOF while reading HTTP head",
                ))
            }
            Err(e) => return Err(e.into()),
        };
        buf.push(byte);
        if buf.ends_with(b"\r\n\r\n") {
            return Ok(buf);
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(ProxyError::protocol_error("HTTP head too long"));
        }
    }
}

/// 有序的头部列表，名称比较不区分大小写
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// 追加，不影响已有的同名头部
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// 设置，删除已有的同名头部
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.append(name, value);
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn parse<'a>(lines: impl Iterator<Item = &'a str>) -> Self {
        let mut headers = Self::new();
        for line in lines {
            if let Some((key, value)) = line.split_once(':') {
                headers.append(key.trim(), value.trim());
            }
        }
        headers
    }

    fn encode_into(&self, out: &mut String) {
        for (k, v) in &self.0 {
            let _ = write!(out, "{}: {}\r\n", k, v);
        }
    }
}

fn head_lines(bytes: &[u8]) -> Result<Vec<&str>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| ProxyError::protocol_error("HTTP head is not valid UTF-8"))?;
    let lines: Vec<&str> = text
        .split("\r\n")
        .map(|l| l.trim_end_matches('\n'))
        .take_while(|l| !l.is_empty())
        .collect();
    if lines.is_empty() {
        return Err(ProxyError::protocol_error("Empty HTTP head"));
    }
    Ok(lines)
}

/// 请求头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Headers,
}

impl RequestHead {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let lines = head_lines(bytes)?;
        let parts: Vec<&str> = lines[0].split_whitespace().collect();
        let [method, target, version] = parts.as_slice() else {
            return Err(ProxyError::protocol_error(format!(
                "Invalid HTTP request line: {}",
                lines[0]
            )));
        };
        if !version.starts_with("HTTP/") {
            return Err(ProxyError::protocol_error(format!(
                "Invalid HTTP version: {}",
                version
            )));
        }

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
            headers: Headers::parse(lines[1..].iter().copied()),
        })
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.target, self.version);
        self.headers.encode_into(&mut out);
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// 响应头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let lines = head_lines(bytes)?;
        let mut parts = lines[0].splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        let status = parts.next().and_then(|s| s.parse::<u16>().ok());
        let (true, Some(status)) = (version.starts_with("HTTP/"), status) else {
            return Err(ProxyError::protocol_error(format!(
                "Invalid HTTP status line: {}",
                lines[0]
            )));
        };

        Ok(Self {
            version: version.to_string(),
            status,
            reason: parts.next().unwrap_or_default().to_string(),
            headers: Headers::parse(lines[1..].iter().copied()),
        })
    }

    /// 状态行（不含换行）
    pub fn status_line(&self) -> String {
        if self.reason.is_empty() {
            format!("{} {}", self.version, self.status)
        } else {
            format!("{} {} {}", self.version, self.status, self.reason)
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.status_line();
        out.push_str("\r\n");
        self.headers.encode_into(&mut out);
        out.push_str("\r\n");
        out.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect() {
        let head = RequestHead::parse(
            b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n",
        )
        .unwrap();
        assert!(head.is_connect());
        assert_eq!(head.target, "example.com:443");
        assert_eq!(head.headers.get("host"), Some("example.com:443"));
    }

    #[test]
    fn test_parse_request_keeps_header_order() {
        let head = RequestHead::parse(
            b"GET http://a/ HTTP/1.1\r\nX-B: 1\r\nX-A: 2\r\nX-B: 3\r\n\r\n",
        )
        .unwrap();
        let names: Vec<&str> = head.headers.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["X-B", "X-A", "X-B"]);
        assert_eq!(head.headers.get("x-b"), Some("1"));
    }

    #[test]
    fn test_parse_invalid_request() {
        assert!(RequestHead::parse(b"GARBAGE\r\n\r\n").is_err());
        assert!(RequestHead::parse(b"GET / FTP/1.0\r\n\r\n").is_err());
        assert!(RequestHead::parse(b"\r\n\r\n").is_err());
    }

    #[test]
    fn test_parse_response() {
        let head = ResponseHead::parse(
            b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 3\r\n\r\n",
        )
        .unwrap();
        assert_eq!(head.status, 407);
        assert_eq!(head.status_line(), "HTTP/1.1 407 Proxy Authentication Required");
        assert_eq!(head.headers.get("content-length"), Some("3"));

        assert!(ResponseHead::parse(b"HTTP/1.1 abc\r\n\r\n").is_err());
    }

    #[test]
    fn test_headers_set_and_remove() {
        let mut headers = Headers::new();
        headers.append("Connection", "keep-alive");
        headers.append("connection", "upgrade");
        headers.set("Connection", "close");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("CONNECTION"), Some("close"));
        headers.remove("connection");
        assert!(headers.is_empty());
    }

    #[test]
    fn test_encode_request() {
        let mut head = RequestHead::parse(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        head.headers.set("Connection", "close");
        assert_eq!(
            head.encode(),
            b"GET / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n".to_vec()
        );
    }

    #[tokio::test]
    async fn test_read_head_with_leftover() {
        let data = b"CONNECT a:1 HTTP/1.1\r\n\r\nhello".to_vec();
        let mut reader = &data[..];
        let (head, rest) = read_head(&mut reader).await.unwrap().unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(rest, b"hello");
    }

    #[tokio::test]
    async fn test_read_head_split_delimiter() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let reader = tokio::spawn(async move { read_head(&mut server).await });

        use tokio::io::AsyncWriteExt;
        client.write_all(b"GET / HTTP/1.1\r\n\r").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"\nbody").await.unwrap();

        let (head, rest) = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(head, b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(rest, b"body");
    }

    #[tokio::test]
    async fn test_read_head_eof() {
        let mut empty: &[u8] = &[];
        assert!(read_head(&mut empty).await.unwrap().is_none());

        let mut partial: &[u8] = b"GET / HTTP/1.1\r\n";
        assert!(read_head(&mut partial).await.is_err());
    }

    #[tokio::test]
    async fn test_read_head_too_long() {
        let data = vec![b'a'; MAX_HEAD_SIZE + READ_CHUNK];
        let mut reader = &data[..];
        assert!(read_head(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_read_head_exact_stops_at_head() {
        let data = b"HTTP/1.1 200 OK\r\n\r\ntunnel".to_vec();
        let mut reader = &data[..];
        let head = read_head_exact(&mut reader).await.unwrap();
        assert_eq!(head, b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(reader, b"tunnel");
    }
}
