//! Reads CRLF-delimited request lines and header blocks off a buffered byte
//! stream, and writes status lines and headers back out. Used identically on
//! the client side (requests) and the upstream side (responses read back).

use std::io;

use http::{
    HeaderMap, HeaderName, HeaderValue,
    header::{ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, EXPECT, HOST, TRANSFER_ENCODING, UPGRADE},
};
use roxy_shared::version::HttpVersion;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};

use crate::error::ProxyError;

/// A parsed request (or status) line, pre-header-parse.
#[derive(Debug, Clone)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
}

/// Reads one CRLF-terminated ASCII line, bounded by `max_len` bytes so a
/// client can't make us buffer forever. Returns `None` only on a clean EOF
/// with no bytes read at all; a line that is itself empty (a bare `\r\n`,
/// e.g. the blank line ending a header block) still reads its terminator
/// and comes back as `Some(String::new())`, which callers that care about
/// the EOF/empty-line distinction (chunked trailers) rely on. At the top of
/// the top of the session loop the two are treated identically: either one
/// ends the session cleanly.
pub async fn read_line<R>(reader: &mut R, max_len: usize) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        let (consumed, found_newline) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                break;
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(idx) => {
                    buf.extend_from_slice(&available[..=idx]);
                    (idx + 1, true)
                }
                None => {
                    buf.extend_from_slice(available);
                    (available.len(), false)
                }
            }
        };
        reader.consume(consumed);
        if buf.len() > max_len {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "line exceeds buffer_size"));
        }
        if found_newline {
            break;
        }
    }
    if buf.is_empty() {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Splits on single spaces into at most three fields. Two fields assumes
/// HTTP/1.1; three selects HTTP/1.0 only when that field is (case
/// insensitively) exactly `HTTP/1.0`, otherwise HTTP/1.1.
pub fn parse_request_line(line: &str) -> Result<RequestLine, ProxyError> {
    let mut parts = line.splitn(3, ' ');
    let method = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProxyError::MalformedRequest(format!("no method in {line:?}")))?;
    let target = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProxyError::MalformedRequest(format!("no request-target in {line:?}")))?;
    let version = match parts.next() {
        Some(v) if v.eq_ignore_ascii_case("HTTP/1.0") => HttpVersion(http::Version::HTTP_10),
        _ => HttpVersion(http::Version::HTTP_11),
    };
    Ok(RequestLine {
        method: method.to_ascii_uppercase(),
        target: target.to_string(),
        version,
    })
}

/// Reads lines until an empty line, splitting each on the first `:`.
/// Multiplicity and ordering of repeated header names survive via
/// `HeaderMap::append`.
pub async fn read_headers<R>(reader: &mut R, max_len: usize) -> Result<HeaderMap, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = HeaderMap::new();
    loop {
        let line = read_line(reader, max_len)
            .await
            .map_err(|e| ProxyError::MalformedHeader(e.to_string()))?;
        let Some(line) = line else {
            break;
        };
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::MalformedHeader(line.clone()))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| ProxyError::MalformedHeader(format!("invalid header name: {name}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| ProxyError::MalformedHeader(format!("invalid header value: {value}")))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// `PrepareRequestHeaders`: normalizes `Accept-Encoding` and strips
/// hop-by-hop headers before the request is dispatched upstream.
pub fn prepare_request_headers(headers: &mut HeaderMap) {
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip,deflate"));
    headers.remove("proxy-connection");
    headers.remove("proxy-authorization");

    if let Some(connection) = headers.get(CONNECTION).cloned()
        && let Ok(value) = connection.to_str()
    {
        for token in value.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
                headers.remove(name);
            }
        }
    }
}

pub async fn write_status_line<W>(
    writer: &mut W,
    version: HttpVersion,
    status: u16,
    reason: &str,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(format!("{version} {status} {reason}\r\n").as_bytes())
        .await
}

pub async fn write_headers<W>(writer: &mut W, headers: &HeaderMap) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for (name, value) in headers.iter() {
        writer.write_all(name.as_str().as_bytes()).await?;
        writer.write_all(b": ").await?;
        writer.write_all(value.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
    }
    writer.write_all(b"\r\n").await
}

/// The header-derived flags the data model surfaces on `Request`/`Response`.
#[derive(Debug, Clone, Default)]
pub struct HeaderFlags {
    pub has_body: bool,
    pub is_chunked: bool,
    pub content_length: u64,
    pub expect_continue: bool,
    pub upgrade_to_websocket: bool,
    pub host: Option<String>,
}

pub fn extract_flags(headers: &HeaderMap) -> HeaderFlags {
    let is_chunked = headers
        .get(TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("chunked")))
        .unwrap_or(false);
    let content_length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(0);
    let expect_continue = headers
        .get(EXPECT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("100-continue"))
        .unwrap_or(false);
    let upgrade_to_websocket = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let host = headers.get(HOST).and_then(|v| v.to_str().ok()).map(str::to_string);

    HeaderFlags {
        has_body: is_chunked || content_length > 0,
        is_chunked,
        content_length,
        expect_continue,
        upgrade_to_websocket,
        host,
    }
}

/// Keep-alive governance: HTTP/1.1 defaults to keep-alive unless the server
/// said `Connection: close`; HTTP/1.0 defaults to close unless the server
/// said `Connection: keep-alive`.
pub fn keep_alive_for(version: HttpVersion, headers: &HeaderMap) -> bool {
    let connection = headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let tokens: Vec<&str> = connection.split(',').map(str::trim).collect();
    if version.0 == http::Version::HTTP_10 {
        tokens.iter().any(|t| t.eq_ignore_ascii_case("keep-alive"))
    } else {
        !tokens.iter().any(|t| t.eq_ignore_ascii_case("close"))
    }
}
