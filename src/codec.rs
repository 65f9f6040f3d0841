//! Hand-rolled HTTP/1.1 reading and writing
//!
//! The proxy speaks HTTP/1.1 on every leg: the outer listener, the
//! loopback listeners behind CONNECT tunnels, and the re-originated
//! upstream requests. Heads are read line-by-line over a `BufReader`,
//! bodies by `Content-Length`, chunked framing, or connection close.

use crate::error::{Error, Result};
use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Upper bound for a request or response head
const MAX_HEAD_SIZE: usize = 64 * 1024;
/// Upper bound for a buffered message body
const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Parsed request line and headers.
#[derive(Clone, Debug)]
pub struct RequestHead {
  /// Request method
  pub method: Method,
  /// Request-target as received (origin-form, absolute-form, or authority-form)
  pub target: String,
  /// HTTP version
  pub version: Version,
  /// Request headers
  pub headers: HeaderMap,
}

/// Parsed status line and headers.
#[derive(Clone, Debug)]
pub struct ResponseHead {
  /// HTTP version
  pub version: Version,
  /// Response status
  pub status: StatusCode,
  /// Response headers
  pub headers: HeaderMap,
}

fn parse_version(token: &[u8]) -> Result<Version> {
  match token {
    b"HTTP/0.9" => Ok(Version::HTTP_09),
    b"HTTP/1.0" => Ok(Version::HTTP_10),
    b"HTTP/1.1" => Ok(Version::HTTP_11),
    b"HTTP/2.0" => Ok(Version::HTTP_2),
    _ => Err(Error::protocol_error("invalid http version")),
  }
}

pub(crate) fn parse_header_line(buffer: &[u8]) -> Result<(HeaderName, HeaderValue)> {
  let buffer = buffer.strip_suffix(CR_LF).unwrap_or(buffer);
  let buffer = buffer.strip_suffix(b"\n").unwrap_or(buffer);
  let mut parts = buffer.splitn(2, |b| *b == b':');
  let name = parts
    .next()
    .ok_or_else(|| Error::protocol_error("empty header line"))?;
  let value = parts
    .next()
    .ok_or_else(|| Error::protocol_error("header line without colon"))?;
  let value = value.strip_prefix(SPACE).unwrap_or(value);
  let name = HeaderName::from_bytes(name).map_err(|e| Error::Http(http::Error::from(e)))?;
  let value = HeaderValue::from_bytes(value).map_err(|e| Error::Http(http::Error::from(e)))?;
  Ok((name, value))
}

async fn read_headers<R: AsyncBufRead + Unpin>(reader: &mut R, acc: &mut usize) -> Result<HeaderMap> {
  let mut headers = HeaderMap::new();
  let mut line = Vec::new();
  loop {
    line.clear();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 || line == b"\r\n" || line == b"\n" {
      break;
    }
    *acc += n;
    if *acc > MAX_HEAD_SIZE {
      return Err(Error::protocol_error("head exceeds maximum allowed size"));
    }
    if let Ok((k, v)) = parse_header_line(&line) {
      headers.append(k, v);
    }
  }
  Ok(headers)
}

/// Read a request head. Returns `None` on clean EOF before any byte.
pub async fn read_request_head<R: AsyncBufRead + Unpin>(
  reader: &mut R,
) -> Result<Option<RequestHead>> {
  let mut line = Vec::new();
  let n = reader.read_until(b'\n', &mut line).await?;
  if n == 0 {
    return Ok(None);
  }
  if n > MAX_HEAD_SIZE {
    return Err(Error::protocol_error("request line too long"));
  }
  let text = line
    .strip_suffix(CR_LF)
    .or_else(|| line.strip_suffix(b"\n"))
    .unwrap_or(&line);
  let mut parts = text.split(|b| *b == b' ').filter(|p| !p.is_empty());
  let method = parts
    .next()
    .ok_or_else(|| Error::protocol_error("empty request line"))?;
  let target = parts
    .next()
    .ok_or_else(|| Error::protocol_error("request line without target"))?;
  let version = parts
    .next()
    .ok_or_else(|| Error::protocol_error("request line without version"))?;
  let method =
    Method::from_bytes(method).map_err(|_| Error::protocol_error("invalid request method"))?;
  let target = std::str::from_utf8(target)
    .map_err(|_| Error::protocol_error("request-target is not utf-8"))?
    .to_string();
  let version = parse_version(version)?;
  let mut acc = n;
  let headers = read_headers(reader, &mut acc).await?;
  Ok(Some(RequestHead {
    method,
    target,
    version,
    headers,
  }))
}

/// Read a response head.
pub async fn read_response_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<ResponseHead> {
  let mut line = Vec::new();
  let n = reader.read_until(b'\n', &mut line).await?;
  if n == 0 {
    return Err(Error::protocol_error("connection closed before status line"));
  }
  let text = line
    .strip_suffix(CR_LF)
    .or_else(|| line.strip_suffix(b"\n"))
    .unwrap_or(&line);
  let mut parts = text.splitn(3, |b| *b == b' ');
  let version = parts
    .next()
    .ok_or_else(|| Error::protocol_error("empty status line"))?;
  let status = parts
    .next()
    .ok_or_else(|| Error::protocol_error("status line without code"))?;
  let version = parse_version(version)?;
  let status =
    StatusCode::try_from(status).map_err(|e| Error::Http(http::Error::from(e)))?;
  let mut acc = n;
  let headers = read_headers(reader, &mut acc).await?;
  Ok(ResponseHead {
    version,
    status,
    headers,
  })
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
  headers
    .get(http::header::CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.parse().ok())
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get(http::header::TRANSFER_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.to_ascii_lowercase().contains("chunked"))
    .unwrap_or(false)
}

async fn read_chunked_body<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
  let mut body = Vec::new();
  loop {
    let mut size_line = Vec::new();
    reader.read_until(b'\n', &mut size_line).await?;
    let size_text = std::str::from_utf8(&size_line)
      .map_err(|_| Error::protocol_error("invalid chunk size"))?
      .trim();
    let size_text = size_text.split(';').next().unwrap_or(size_text);
    let size = usize::from_str_radix(size_text, 16)
      .map_err(|_| Error::protocol_error("invalid chunk size"))?;
    if size == 0 {
      // trailer section up to the final empty line
      let mut trailer = Vec::new();
      loop {
        trailer.clear();
        let n = reader.read_until(b'\n', &mut trailer).await?;
        if n == 0 || trailer == b"\r\n" || trailer == b"\n" {
          break;
        }
      }
      break;
    }
    if body.len() + size > MAX_BODY_SIZE {
      return Err(Error::protocol_error("body exceeds maximum allowed size"));
    }
    let mut chunk = vec![0u8; size];
    reader.read_exact(&mut chunk).await?;
    body.append(&mut chunk);
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
  }
  Ok(body)
}

/// Read a request body: only `Content-Length` and chunked framing carry one.
pub async fn read_request_body<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  headers: &HeaderMap,
) -> Result<Bytes> {
  if is_chunked(headers) {
    return Ok(Bytes::from(read_chunked_body(reader).await?));
  }
  match content_length(headers) {
    None | Some(0) => Ok(Bytes::new()),
    Some(len) => {
      if len > MAX_BODY_SIZE {
        return Err(Error::protocol_error("body exceeds maximum allowed size"));
      }
      let mut body = vec![0u8; len];
      reader.read_exact(&mut body).await?;
      Ok(Bytes::from(body))
    }
  }
}

/// Read a response body: `Content-Length`, chunked, or close-delimited.
pub async fn read_response_body<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  head: &ResponseHead,
  head_request: bool,
) -> Result<Bytes> {
  if head_request
    || head.status == StatusCode::NO_CONTENT
    || head.status == StatusCode::NOT_MODIFIED
    || head.status.is_informational()
  {
    return Ok(Bytes::new());
  }
  if is_chunked(&head.headers) {
    return Ok(Bytes::from(read_chunked_body(reader).await?));
  }
  match content_length(&head.headers) {
    Some(len) => {
      if len > MAX_BODY_SIZE {
        return Err(Error::protocol_error("body exceeds maximum allowed size"));
      }
      let mut body = vec![0u8; len];
      reader.read_exact(&mut body).await?;
      Ok(Bytes::from(body))
    }
    None => {
      let mut body = Vec::new();
      // servers that skip close_notify surface an unexpected EOF here;
      // keep whatever arrived
      match reader.take(MAX_BODY_SIZE as u64).read_to_end(&mut body).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {}
        Err(e) => return Err(e.into()),
      }
      Ok(Bytes::from(body))
    }
  }
}

/// Whether a request head asks for a WebSocket upgrade.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
  let connection = headers
    .get(http::header::CONNECTION)
    .and_then(|v| v.to_str().ok())
    .map(str::to_ascii_lowercase)
    .unwrap_or_default();
  let upgrade = headers
    .get(http::header::UPGRADE)
    .and_then(|v| v.to_str().ok())
    .map(str::to_ascii_lowercase)
    .unwrap_or_default();
  connection.contains("upgrade") && upgrade.contains("websocket")
}

fn version_token(version: Version) -> &'static str {
  match version {
    Version::HTTP_10 => "HTTP/1.0",
    _ => "HTTP/1.1",
  }
}

/// Serialize a request line, headers and body into raw bytes.
pub fn encode_request(
  method: &Method,
  target: &str,
  version: Version,
  headers: &HeaderMap,
  body: &[u8],
) -> Vec<u8> {
  let mut raw = Vec::new();
  raw.extend(method.as_str().as_bytes());
  raw.extend(SPACE);
  raw.extend(target.as_bytes());
  raw.extend(SPACE);
  raw.extend(version_token(version).as_bytes());
  raw.extend(CR_LF);
  for (k, v) in headers.iter() {
    raw.extend(k.as_str().as_bytes());
    raw.extend(COLON_SPACE);
    raw.extend(v.as_bytes());
    raw.extend(CR_LF);
  }
  raw.extend(CR_LF);
  raw.extend(body);
  raw
}

/// Serialize a status line, headers and body into raw bytes.
pub fn encode_response(
  version: Version,
  status: StatusCode,
  headers: &HeaderMap,
  body: &[u8],
) -> Vec<u8> {
  let mut raw = Vec::new();
  raw.extend(version_token(version).as_bytes());
  raw.extend(SPACE);
  raw.extend(status.as_str().as_bytes());
  raw.extend(SPACE);
  raw.extend(status.canonical_reason().unwrap_or("Unknown").as_bytes());
  raw.extend(CR_LF);
  for (k, v) in headers.iter() {
    raw.extend(k.as_str().as_bytes());
    raw.extend(COLON_SPACE);
    raw.extend(v.as_bytes());
    raw.extend(CR_LF);
  }
  raw.extend(CR_LF);
  raw.extend(body);
  raw
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::BufReader;

  #[tokio::test]
  async fn test_read_request_head() {
    let raw = b"GET /path HTTP/1.1\r\nHost: example.com\r\nX-One: a\r\nX-One: b\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let head = read_request_head(&mut reader).await.unwrap().unwrap();
    assert_eq!(head.method, Method::GET);
    assert_eq!(head.target, "/path");
    assert_eq!(head.headers.get("host").unwrap(), "example.com");
    assert_eq!(head.headers.get_all("x-one").iter().count(), 2);
  }

  #[tokio::test]
  async fn test_read_request_head_eof() {
    let mut reader = BufReader::new(&b""[..]);
    assert!(read_request_head(&mut reader).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_non_http_preamble_is_an_error() {
    let mut reader = BufReader::new(&b"SSH-2.0-OpenSSH_9.0\r\n"[..]);
    assert!(read_request_head(&mut reader).await.is_err());
  }

  #[tokio::test]
  async fn test_read_chunked_response() {
    let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let head = read_response_head(&mut reader).await.unwrap();
    assert_eq!(head.status, StatusCode::OK);
    let body = read_response_body(&mut reader, &head, false).await.unwrap();
    assert_eq!(&body[..], b"Wikipedia");
  }

  #[tokio::test]
  async fn test_read_close_delimited_response() {
    let raw = b"HTTP/1.1 200 OK\r\n\r\nhello";
    let mut reader = BufReader::new(&raw[..]);
    let head = read_response_head(&mut reader).await.unwrap();
    let body = read_response_body(&mut reader, &head, false).await.unwrap();
    assert_eq!(&body[..], b"hello");
  }

  #[test]
  fn test_websocket_upgrade_detection() {
    let mut headers = HeaderMap::new();
    headers.insert(http::header::CONNECTION, "keep-alive, Upgrade".parse().unwrap());
    headers.insert(http::header::UPGRADE, "websocket".parse().unwrap());
    assert!(is_websocket_upgrade(&headers));
    headers.insert(http::header::UPGRADE, "h2c".parse().unwrap());
    assert!(!is_websocket_upgrade(&headers));
  }
}
