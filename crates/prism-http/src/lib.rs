//! Minimal HTTP/1.x message codec.
//!
//! This is a parser for routing and logging decisions, not a general HTTP
//! implementation. Every parsed message keeps its exact on-wire bytes in
//! `raw`; forwarding writes those bytes verbatim and never re-serializes
//! from the structured fields.

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::warn;

/// Upper bound on a single message head (request/status line plus headers).
const MAX_HEAD_BYTES: usize = 64 * 1024;

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_TLS_PORT: u16 = 443;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("malformed status line")]
    MalformedStatusLine,
    #[error("malformed CONNECT request: {0}")]
    MalformedConnect(&'static str),
    #[error("message head exceeded {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,
    #[error("unexpected end of stream while reading {0}")]
    UnexpectedEof(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Header map with last-value-wins semantics and case-insensitive names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn push(&mut self, name: String, value: String) {
        self.entries.push((name, value));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One client request as read from the proxy socket. `raw` holds the
/// request line, header block, and terminating CRLFCRLF exactly as
/// received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub user_agent: Option<String>,
    pub proxy_connection: Option<String>,
    pub raw: Bytes,
}

/// One origin response. `raw` holds status line, headers, and any
/// Content-Length body exactly as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub protocol: String,
    pub status_code: u16,
    pub status_text: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub raw: Bytes,
}

/// Target of a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub raw: Bytes,
}

/// Reads one request head from the stream.
///
/// EOF before the request line completes is an error; EOF mid-headers is
/// treated as end-of-headers so short requests from sloppy clients still
/// parse. Unrecognized headers are kept only in `raw`.
pub async fn read_request<R>(reader: &mut R) -> Result<HttpRequest, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::with_capacity(512);
    let request_line = read_head_line(reader, &mut raw)
        .await?
        .ok_or(CodecError::UnexpectedEof("request line"))?;

    let mut parts = request_line.split_whitespace();
    let (method, target, protocol) = match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(protocol)) => {
            (method.to_string(), target.to_string(), protocol.to_string())
        }
        _ => return Err(CodecError::MalformedRequestLine),
    };

    let mut request = HttpRequest {
        method,
        target,
        protocol,
        host: String::new(),
        port: DEFAULT_HTTP_PORT,
        user_agent: None,
        proxy_connection: None,
        raw: Bytes::new(),
    };

    loop {
        let line = match read_head_line(reader, &mut raw).await? {
            Some(line) => line,
            None => break,
        };
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("Host") {
            let (host, port) = split_host_port(value);
            request.host = host.to_string();
            if let Some(port) = port {
                request.port = port;
            }
        } else if name.eq_ignore_ascii_case("User-Agent") {
            request.user_agent = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("Proxy-Connection") {
            request.proxy_connection = Some(value.to_string());
        }
    }

    request.raw = Bytes::from(raw);
    Ok(request)
}

/// Reads one response head plus a Content-Length body if one is declared.
///
/// Chunked bodies are not reassembled; callers that need to relay a
/// chunked stream must bypass the codec and copy raw bytes.
pub async fn read_response<R>(reader: &mut R) -> Result<HttpResponse, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::with_capacity(512);
    let status_line = read_head_line(reader, &mut raw)
        .await?
        .ok_or(CodecError::UnexpectedEof("status line"))?;

    let mut parts = status_line.split_whitespace();
    let protocol = parts
        .next()
        .ok_or(CodecError::MalformedStatusLine)?
        .to_string();
    let code_text = parts.next().ok_or(CodecError::MalformedStatusLine)?;
    let status_code = match code_text.parse::<u16>() {
        Ok(code) => code,
        Err(_) => {
            warn!(status = %code_text, "unparseable response status code");
            0
        }
    };
    let status_text = parts.collect::<Vec<_>>().join(" ");

    let mut headers = Headers::default();
    loop {
        let line = match read_head_line(reader, &mut raw).await? {
            Some(line) => line,
            None => break,
        };
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push(name.trim().to_string(), value.trim().to_string());
        }
    }

    let mut body = None;
    if let Some(length_text) = headers.get("Content-Length") {
        match length_text.parse::<usize>() {
            Ok(length) if length > 0 => {
                let mut bytes = vec![0_u8; length];
                reader.read_exact(&mut bytes).await?;
                raw.extend_from_slice(&bytes);
                body = Some(Bytes::from(bytes));
            }
            Ok(_) => {}
            Err(_) => warn!(value = %length_text, "unparseable Content-Length header"),
        }
    } else if has_chunked_transfer_encoding(&headers) {
        warn!("chunked response body is not reassembled by the codec");
    }

    Ok(HttpResponse {
        protocol,
        status_code,
        status_text,
        headers,
        body,
        raw: Bytes::from(raw),
    })
}

/// Parses a complete CONNECT head (request line through CRLFCRLF).
pub fn parse_connect(head: &[u8]) -> Result<ConnectTarget, CodecError> {
    let text = String::from_utf8_lossy(head);
    let request_line = text.split("\r\n").next().unwrap_or_default();

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or(CodecError::MalformedConnect("empty request line"))?;
    let authority = parts
        .next()
        .ok_or(CodecError::MalformedConnect("missing authority"))?;
    parts
        .next()
        .ok_or(CodecError::MalformedConnect("missing protocol version"))?;

    if method != "CONNECT" {
        return Err(CodecError::MalformedConnect("method is not CONNECT"));
    }

    let (host, port) = parse_connect_authority(authority)?;
    Ok(ConnectTarget {
        host,
        port,
        raw: Bytes::copy_from_slice(head),
    })
}

fn parse_connect_authority(authority: &str) -> Result<(String, u16), CodecError> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, suffix) = rest
            .split_once(']')
            .ok_or(CodecError::MalformedConnect("unterminated IPv6 authority"))?;
        if host.is_empty() {
            return Err(CodecError::MalformedConnect("empty host"));
        }
        let port = match suffix.strip_prefix(':') {
            Some(port_text) => port_text
                .parse::<u16>()
                .map_err(|_| CodecError::MalformedConnect("invalid port"))?,
            None if suffix.is_empty() => DEFAULT_TLS_PORT,
            None => return Err(CodecError::MalformedConnect("invalid authority")),
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port_text)) => {
            if host.is_empty() || host.contains(':') {
                return Err(CodecError::MalformedConnect("invalid authority"));
            }
            let port = port_text
                .parse::<u16>()
                .map_err(|_| CodecError::MalformedConnect("invalid port"))?;
            Ok((host.to_string(), port))
        }
        None => {
            if authority.is_empty() {
                return Err(CodecError::MalformedConnect("empty authority"));
            }
            Ok((authority.to_string(), DEFAULT_TLS_PORT))
        }
    }
}

/// Reads one header-block line into `raw`, returning its trimmed text, or
/// `None` on clean EOF. The terminator bytes stay in `raw` untouched.
async fn read_head_line<R>(reader: &mut R, raw: &mut Vec<u8>) -> Result<Option<String>, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    let start = raw.len();
    let read = reader.read_until(b'\n', raw).await?;
    if read == 0 {
        return Ok(None);
    }
    if raw.len() > MAX_HEAD_BYTES {
        return Err(CodecError::HeadTooLarge);
    }
    let line = String::from_utf8_lossy(&raw[start..]);
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

fn split_host_port(value: &str) -> (&str, Option<u16>) {
    match value.split_once(':') {
        Some((host, port_text)) => (host, port_text.trim().parse::<u16>().ok()),
        None => (value, None),
    }
}

fn has_chunked_transfer_encoding(headers: &Headers) -> bool {
    headers
        .get("Transfer-Encoding")
        .map(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
        })
        .unwrap_or(false)
}
