//! Host and port extraction from request-targets and headers

use crate::codec::RequestHead;
use crate::error::{Error, Result};

/// Split `host[:port]`, keeping IPv6 literals in brackets intact.
pub fn split_host_port(authority: &str) -> Result<(String, Option<u16>)> {
  if let Some(rest) = authority.strip_prefix('[') {
    let end = rest
      .find(']')
      .ok_or_else(|| Error::protocol_error(format!("unclosed IPv6 literal: {}", authority)))?;
    let host = rest[..end].to_string();
    let tail = &rest[end + 1..];
    if let Some(port) = tail.strip_prefix(':') {
      let port = port
        .parse::<u16>()
        .map_err(|_| Error::protocol_error(format!("invalid port: {}", port)))?;
      return Ok((host, Some(port)));
    }
    return Ok((host, None));
  }
  match authority.split_once(':') {
    Some((host, port)) => {
      let port = port
        .parse::<u16>()
        .map_err(|_| Error::protocol_error(format!("invalid port: {}", port)))?;
      Ok((host.to_string(), Some(port)))
    }
    None => Ok((authority.to_string(), None)),
  }
}

/// Parse a CONNECT target of the form `hostname:port`.
pub fn connect_target(target: &str) -> Result<(String, u16)> {
  let (host, port) = split_host_port(target)?;
  let port =
    port.ok_or_else(|| Error::protocol_error(format!("missing port in CONNECT: {}", target)))?;
  if host.is_empty() {
    return Err(Error::protocol_error(format!(
      "missing host in CONNECT: {}",
      target
    )));
  }
  Ok((host, port))
}

/// Extract `(host, port)` for a plain request head.
///
/// The `Host` header is required. An absolute-form request-target overrides
/// the header and is rewritten in place to its origin-form path.
pub fn from_request(head: &mut RequestHead, default_port: u16) -> Result<(String, u16)> {
  let host_header = head
    .headers
    .get(http::header::HOST)
    .and_then(|v| v.to_str().ok())
    .map(str::to_string)
    .ok_or_else(|| Error::protocol_error("missing Host header"))?;
  let (mut host, mut port) = split_host_port(&host_header)?;

  if head.target.starts_with("http://") || head.target.starts_with("https://") {
    let uri: http::Uri = head
      .target
      .parse()
      .map_err(|_| Error::protocol_error(format!("invalid request-target: {}", head.target)))?;
    host = uri
      .host()
      .ok_or_else(|| Error::protocol_error("absolute-form target without host"))?
      .to_string();
    port = uri.port_u16();
    head.target = uri
      .path_and_query()
      .map(|pq| pq.to_string())
      .unwrap_or_else(|| "/".to_string());
  }

  Ok((host, port.unwrap_or(default_port)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use http::{HeaderMap, HeaderValue, Method, Version};

  fn head(target: &str, host: Option<&str>) -> RequestHead {
    let mut headers = HeaderMap::new();
    if let Some(h) = host {
      headers.insert(http::header::HOST, HeaderValue::from_str(h).unwrap());
    }
    RequestHead {
      method: Method::GET,
      target: target.to_string(),
      version: Version::HTTP_11,
      headers,
    }
  }

  #[test]
  fn test_connect_target() {
    assert_eq!(
      connect_target("example.com:443").unwrap(),
      ("example.com".to_string(), 443)
    );
    assert!(connect_target("example.com").is_err());
    assert_eq!(
      connect_target("[::1]:8443").unwrap(),
      ("::1".to_string(), 8443)
    );
  }

  #[test]
  fn test_host_header_required() {
    let mut h = head("/a", None);
    assert!(from_request(&mut h, 80).is_err());
  }

  #[test]
  fn test_host_header_with_port() {
    let mut h = head("/a", Some("example.com:8080"));
    assert_eq!(
      from_request(&mut h, 80).unwrap(),
      ("example.com".to_string(), 8080)
    );
    assert_eq!(h.target, "/a");
  }

  #[test]
  fn test_absolute_form_overrides_host() {
    let mut h = head("http://other.example:81/x?q=1", Some("example.com"));
    assert_eq!(
      from_request(&mut h, 80).unwrap(),
      ("other.example".to_string(), 81)
    );
    assert_eq!(h.target, "/x?q=1");
  }
}
