//! Proxy auto-configuration (PAC) support
//!
//! The proxy treats PAC as a policy seam: a [`PacEvaluator`] turns a PAC
//! URL plus the request URL into a `FindProxyForURL`-style result string,
//! and [`parse_pac_result`] maps its entries onto upstream decisions. The
//! built-in evaluator fetches the script over HTTP and handles scripts that
//! reduce to returning a literal; richer policies plug in their own
//! evaluator.

use crate::codec;
use crate::error::{Error, Result};
use crate::upstream::Connector;
use async_trait::async_trait;
use http::Uri;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::RwLock;

/// The upstream decision one PAC entry maps to.
#[derive(Clone, Debug, PartialEq)]
pub enum PacDecision {
  /// Connect directly to the origin
  Direct,
  /// Chain through an HTTP upstream
  Proxy(Uri),
  /// Chain through a SOCKS5 upstream
  Socks(Uri),
}

/// Evaluates a PAC policy for one request.
#[async_trait]
pub trait PacEvaluator: Send + Sync {
  /// Return the `FindProxyForURL` result string for `url`/`host`.
  async fn find_proxy(&self, pac_url: &Uri, url: &str, host: &str) -> Result<String>;
}

/// Map one PAC entry (`DIRECT`, `PROXY host:port`, `SOCKS host:port`, …)
/// onto a decision. Unknown entry kinds yield `None` so the caller can move
/// on to the next entry.
pub fn map_pac_entry(entry: &str) -> Option<PacDecision> {
  let trimmed = entry.trim();
  if trimmed.eq_ignore_ascii_case("DIRECT") {
    return Some(PacDecision::Direct);
  }
  let mut parts = trimmed.split_whitespace();
  let kind = parts.next()?.to_ascii_uppercase();
  let endpoint = parts.next()?;
  if parts.next().is_some() {
    return None;
  }
  let uri = |scheme: &str| format!("{}://{}", scheme, endpoint).parse::<Uri>().ok();
  match kind.as_str() {
    "PROXY" | "HTTP" => uri("http").map(PacDecision::Proxy),
    "HTTPS" => uri("https").map(PacDecision::Proxy),
    "SOCKS" | "SOCKS5" => uri("socks").map(PacDecision::Socks),
    _ => None,
  }
}

/// Map a full `FindProxyForURL` result (entries separated by `;`) onto the
/// first usable decision.
pub fn parse_pac_result(result: &str) -> Option<PacDecision> {
  result.split(';').find_map(map_pac_entry)
}

/// Built-in evaluator: fetches the script over HTTP(S) and evaluates the
/// common script shape whose `FindProxyForURL` returns a string literal.
pub struct ScriptPacEvaluator {
  connector: Arc<Connector>,
  scripts: RwLock<HashMap<String, String>>,
}

impl ScriptPacEvaluator {
  /// Create an evaluator fetching scripts through the given connector.
  pub fn new(connector: Arc<Connector>) -> Self {
    Self {
      connector,
      scripts: RwLock::new(HashMap::new()),
    }
  }

  async fn fetch_script(&self, pac_url: &Uri) -> Result<String> {
    if let Some(script) = self.scripts.read().await.get(&pac_url.to_string()) {
      return Ok(script.clone());
    }
    let host = pac_url
      .host()
      .ok_or_else(|| Error::upstream_unavailable("PAC URL without host"))?;
    let tls = pac_url.scheme_str() == Some("https");
    let port = pac_url.port_u16().unwrap_or(if tls { 443 } else { 80 });
    let path = pac_url
      .path_and_query()
      .map(|pq| pq.to_string())
      .unwrap_or_else(|| "/".to_string());

    let stream = self
      .connector
      .tcp(host, port)
      .await
      .map_err(|e| Error::upstream_unavailable(format!("PAC fetch failed: {}", e)))?;
    let mut stream = crate::socket::MaybeTlsStream::Tcp(stream);
    if tls {
      stream = self
        .connector
        .tls(stream, host)
        .await
        .map_err(|e| Error::upstream_unavailable(format!("PAC fetch failed: {}", e)))?;
    }
    let mut headers = http::HeaderMap::new();
    headers.insert(http::header::HOST, http::HeaderValue::from_str(host)?);
    headers.insert(http::header::CONNECTION, http::HeaderValue::from_static("close"));
    let raw = codec::encode_request(
      &http::Method::GET,
      &path,
      http::Version::HTTP_11,
      &headers,
      &[],
    );
    stream.write_all(&raw).await?;
    let mut reader = BufReader::new(stream);
    let head = codec::read_response_head(&mut reader).await?;
    if !head.status.is_success() {
      return Err(Error::upstream_unavailable(format!(
        "PAC fetch returned {}",
        head.status
      )));
    }
    let body = codec::read_response_body(&mut reader, &head, false).await?;
    let script = String::from_utf8_lossy(&body).to_string();
    self
      .scripts
      .write()
      .await
      .insert(pac_url.to_string(), script.clone());
    Ok(script)
  }
}

#[async_trait]
impl PacEvaluator for ScriptPacEvaluator {
  async fn find_proxy(&self, pac_url: &Uri, _url: &str, _host: &str) -> Result<String> {
    let script = self.fetch_script(pac_url).await?;
    evaluate_literal_script(&script)
      .ok_or_else(|| Error::upstream_unavailable("PAC script is not a literal return"))
  }
}

/// Extract the returned string from a script whose `FindProxyForURL`
/// reduces to `return "…";`.
pub(crate) fn evaluate_literal_script(script: &str) -> Option<String> {
  let from = script.find("return").map(|i| i + "return".len())?;
  let rest = &script[from..];
  let open = rest.find('"')?;
  let rest = &rest[open + 1..];
  let close = rest.find('"')?;
  Some(rest[..close].to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_map_pac_entry() {
    assert_eq!(map_pac_entry("DIRECT"), Some(PacDecision::Direct));
    assert_eq!(map_pac_entry(" direct "), Some(PacDecision::Direct));
    assert_eq!(
      map_pac_entry("PROXY up:3128"),
      Some(PacDecision::Proxy("http://up:3128".parse().unwrap()))
    );
    assert_eq!(
      map_pac_entry("SOCKS up:1080"),
      Some(PacDecision::Socks("socks://up:1080".parse().unwrap()))
    );
    assert_eq!(map_pac_entry("QUIC up:784"), None);
    assert_eq!(map_pac_entry("PROXY up:3128 extra"), None);
  }

  #[test]
  fn test_parse_pac_result_takes_first_usable() {
    let decision = parse_pac_result("UNKNOWN x; PROXY up:3128; DIRECT").unwrap();
    assert_eq!(
      decision,
      PacDecision::Proxy("http://up:3128".parse().unwrap())
    );
  }

  #[test]
  fn test_evaluate_literal_script() {
    let script = r#"function FindProxyForURL(url, host) { return "PROXY up:3128; DIRECT"; }"#;
    assert_eq!(
      evaluate_literal_script(script).as_deref(),
      Some("PROXY up:3128; DIRECT")
    );
    assert_eq!(evaluate_literal_script("function f() {}"), None);
  }
}
