//! Minimal HTTP/1.x-style framing: one request per connection, a JSON body
//! sized by `Content-Length`, one JSON response, then close.

use std::collections::HashMap;
use std::io;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use taskhive_protocol::StatusCode;

pub const MAX_LINE_BYTES: usize = 8 * 1024;
pub const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Other,
}

impl Method {
    fn parse(raw: &str) -> Self {
        match raw {
            "GET" => Method::Get,
            "POST" => Method::Post,
            _ => Method::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Other => "UNSUPPORTED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    /// Always a JSON object; empty when no body was sent.
    pub body: Value,
}

#[derive(Error, Debug)]
pub enum WireError {
    #[error("empty request")]
    Empty,

    #[error("malformed request line: {0:?}")]
    BadRequestLine(String),

    #[error("malformed header: {0:?}")]
    BadHeader(String),

    #[error("too many headers")]
    TooManyHeaders,

    #[error("line exceeds {MAX_LINE_BYTES} bytes")]
    LineTooLong,

    #[error("invalid Content-Length: {0:?}")]
    BadContentLength(String),

    #[error("body of {length} bytes exceeds limit of {limit}")]
    TooLarge { length: i64, limit: usize },

    #[error("connection closed before the full body arrived")]
    Truncated,

    #[error("invalid JSON body: {0}")]
    BadJson(#[from] serde_json::Error),

    #[error("JSON body must be an object")]
    NotObject,

    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    pub fn status(&self) -> StatusCode {
        match self {
            WireError::TooLarge { .. } => StatusCode::PayloadTooLarge,
            WireError::Io(_) => StatusCode::InternalError,
            _ => StatusCode::BadRequest,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            WireError::TooLarge { .. } => "payload_too_large",
            WireError::BadJson(_) | WireError::NotObject => "invalid_json",
            WireError::Io(_) => "internal_error",
            _ => "bad_request",
        }
    }
}

/// Read one request: request line, headers up to a blank line, then
/// exactly `Content-Length` body bytes if that header is present.
pub async fn read_request<R>(reader: &mut R, max_body: usize) -> Result<Request, WireError>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(reader).await?.ok_or(WireError::Empty)?;
    let (method, target) = parse_request_line(&line)?;
    let headers = read_headers(reader).await?;

    let body = match headers.get("content-length") {
        Some(raw) => {
            let length = parse_content_length(raw, max_body)?;
            let mut buf = vec![0u8; length];
            reader.read_exact(&mut buf).await.map_err(|err| {
                if err.kind() == io::ErrorKind::UnexpectedEof {
                    WireError::Truncated
                } else {
                    WireError::Io(err)
                }
            })?;
            parse_body(&buf)?
        }
        None => Value::Object(Map::new()),
    };

    let (path, query) = split_target(target);
    Ok(Request {
        method,
        path,
        query,
        headers,
        body,
    })
}

/// One CRLF- or LF-terminated line without its terminator. `None` at EOF.
async fn read_line<R>(reader: &mut R) -> Result<Option<String>, WireError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = MAX_LINE_BYTES as u64 + 2;
    let n = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    if buf.len() > MAX_LINE_BYTES {
        return Err(WireError::LineTooLong);
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|err| WireError::BadRequestLine(String::from_utf8_lossy(err.as_bytes()).into_owned()))
}

fn parse_request_line(line: &str) -> Result<(Method, &str), WireError> {
    let mut parts = line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Err(if line.trim().is_empty() {
            WireError::Empty
        } else {
            WireError::BadRequestLine(line.to_string())
        });
    };
    if !target.starts_with('/') {
        return Err(WireError::BadRequestLine(line.to_string()));
    }
    Ok((Method::parse(method), target))
}

/// Header names are lowercased. EOF ends the header block.
async fn read_headers<R>(reader: &mut R) -> Result<HashMap<String, String>, WireError>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = HashMap::new();
    while let Some(line) = read_line(reader).await? {
        if line.is_empty() {
            break;
        }
        if headers.len() >= MAX_HEADERS {
            return Err(WireError::TooManyHeaders);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| WireError::BadHeader(line.clone()))?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }
    Ok(headers)
}

/// Negative or oversized lengths are rejected before any body is read.
fn parse_content_length(raw: &str, max_body: usize) -> Result<usize, WireError> {
    let length: i64 = raw
        .trim()
        .parse()
        .map_err(|_| WireError::BadContentLength(raw.to_string()))?;
    match usize::try_from(length) {
        Ok(length) if length <= max_body => Ok(length),
        _ => Err(WireError::TooLarge {
            length,
            limit: max_body,
        }),
    }
}

fn parse_body(buf: &[u8]) -> Result<Value, WireError> {
    if buf.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }
    match serde_json::from_slice(buf)? {
        body @ Value::Object(_) => Ok(body),
        _ => Err(WireError::NotObject),
    }
}

fn split_target(target: &str) -> (String, HashMap<String, String>) {
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let query = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(key), percent_decode(value))
        })
        .collect();
    (path.to_string(), query)
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => match (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 2;
                }
                _ => out.push(b'%'),
            },
            byte => out.push(byte),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|d| d as u8)
}

/// Serialize a complete response. The connection is closed after it.
pub fn encode_response(status: StatusCode, body: &Value) -> Vec<u8> {
    let payload = body.to_string();
    let mut out = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status.code(),
        status.reason(),
        payload.len()
    )
    .into_bytes();
    out.extend_from_slice(payload.as_bytes());
    out
}
