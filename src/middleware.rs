//! Built-in middleware
//!
//! The composed order is client-facing to network-facing: upstream-proxy
//! resolution, summary logging, user middleware, gzip handling, agent
//! selection, and finally the middleware that issues the outbound request.

use crate::codec;
use crate::error::{Error, Result};
use crate::pac::PacEvaluator;
use crate::pipeline::{Context, InterceptedResponse, Middleware, Next, Protocol};
use crate::sysproxy::{resolve_system_proxy, SystemProxyDetector, UpstreamProxyConfig};
use crate::upstream::{select_agent, Agent, Connector};
use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::MultiGzDecoder;
use http::{header, HeaderValue};
use std::io::Read;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};

/// Populates `ctx.proxy` from the pinned configuration or the system
/// resolver, once per request.
pub struct ClientProxy {
  pinned: Option<UpstreamProxyConfig>,
  detector: Arc<dyn SystemProxyDetector>,
}

impl ClientProxy {
  /// Build with an optional pinned configuration that bypasses discovery.
  pub fn new(pinned: Option<UpstreamProxyConfig>, detector: Arc<dyn SystemProxyDetector>) -> Self {
    Self { pinned, detector }
  }
}

#[async_trait]
impl Middleware for ClientProxy {
  async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<()> {
    if ctx.proxy.is_none() {
      ctx.proxy = Some(
        self
          .pinned
          .clone()
          .unwrap_or_else(|| resolve_system_proxy(self.detector.as_ref())),
      );
    }
    next.run(ctx).await
  }
}

/// Logs the request/response pair when the rest of the chain has finished.
pub struct Summary;

#[async_trait]
impl Middleware for Summary {
  async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<()> {
    ctx.summary.method = ctx.request.method.to_string();
    ctx.summary.url = ctx.url();
    let result = next.run(ctx).await;
    ctx.summary.status = ctx.response.as_ref().map(|r| r.status.as_u16());
    match &ctx.summary.proxy {
      Some(via) => tracing::info!(
        method = %ctx.summary.method,
        url = %ctx.summary.url,
        status = ?ctx.summary.status,
        proxy_kind = via.kind,
        proxy_address = %via.address,
        "request complete"
      ),
      None => tracing::info!(
        method = %ctx.summary.method,
        url = %ctx.summary.url,
        status = ?ctx.summary.status,
        "request complete"
      ),
    }
    result
  }
}

/// Forces `Accept-Encoding: gzip` upstream and decodes a gzipped response
/// in place so downstream middleware sees plain bytes.
pub struct Gunzip;

#[async_trait]
impl Middleware for Gunzip {
  async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<()> {
    ctx
      .request
      .headers
      .insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
    next.run(ctx).await?;
    if let Some(response) = ctx.response.as_mut() {
      let gzipped = response
        .headers
        .get(header::CONTENT_ENCODING)
        .map(|v| v.as_bytes().eq_ignore_ascii_case(b"gzip"))
        .unwrap_or(false);
      if gzipped && !response.body.is_empty() {
        let mut decoded = Vec::new();
        let mut decoder = MultiGzDecoder::new(&response.body[..]);
        decoder
          .read_to_end(&mut decoded)
          .map_err(|e| Error::protocol_error(format!("invalid gzip body: {}", e)))?;
        response.headers.remove(header::CONTENT_ENCODING);
        response.headers.insert(
          header::CONTENT_LENGTH,
          HeaderValue::from_str(&decoded.len().to_string())?,
        );
        response.body = Bytes::from(decoded);
      }
    }
    Ok(())
  }
}

/// Runs the upstream agent selector and records the choice.
pub struct ServerProxy {
  evaluator: Arc<dyn PacEvaluator>,
}

impl ServerProxy {
  /// Build with the PAC evaluator used when a PAC URL is configured.
  pub fn new(evaluator: Arc<dyn PacEvaluator>) -> Self {
    Self { evaluator }
  }
}

#[async_trait]
impl Middleware for ServerProxy {
  async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<()> {
    let config = ctx.proxy.clone().unwrap_or_default();
    let url = ctx.url();
    let (agent, via) = select_agent(
      ctx.protocol,
      &ctx.hostname,
      &url,
      &config,
      self.evaluator.as_ref(),
    )
    .await?;
    ctx.summary.proxy = via;
    ctx.agent = Some(agent);
    next.run(ctx).await
  }
}

/// Terminal middleware: opens the upstream connection, sends the request
/// and buffers the response into `ctx.response`.
pub struct ServerEnd {
  connector: Arc<Connector>,
}

impl ServerEnd {
  /// Build over the shared outbound connector.
  pub fn new(connector: Arc<Connector>) -> Self {
    Self { connector }
  }
}

#[async_trait]
impl Middleware for ServerEnd {
  async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<()> {
    let agent = ctx.agent.clone().unwrap_or(Agent::Direct { sni: None });
    let tls = ctx.protocol == Protocol::Https;
    let stream = agent
      .connect(&self.connector, &ctx.hostname, ctx.port, tls)
      .await?;

    let mut headers = ctx.request.headers.clone();
    headers.remove(header::PROXY_AUTHORIZATION);
    headers.remove("proxy-connection");
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    headers.insert(header::HOST, HeaderValue::from_str(&ctx.host_header())?);
    headers.remove(header::TRANSFER_ENCODING);
    if ctx.request.body.is_empty() {
      headers.remove(header::CONTENT_LENGTH);
    } else {
      headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&ctx.request.body.len().to_string())?,
      );
    }

    let target = if agent.absolute_form(ctx.protocol) {
      ctx.url()
    } else {
      ctx.request.target.clone()
    };
    let raw = codec::encode_request(
      &ctx.request.method,
      &target,
      ctx.request.version,
      &headers,
      &ctx.request.body,
    );

    let mut reader = BufReader::new(stream);
    reader.get_mut().write_all(&raw).await?;
    reader.get_mut().flush().await?;

    let head = codec::read_response_head(&mut reader).await?;
    let body = codec::read_response_body(
      &mut reader,
      &head,
      ctx.request.method == http::Method::HEAD,
    )
    .await?;
    ctx.response = Some(InterceptedResponse {
      version: head.version,
      status: head.status,
      headers: head.headers,
      body,
    });
    next.run(ctx).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::pipeline::{InterceptedRequest, Pipeline};
  use crate::record::RequestSummary;
  use flate2::write::GzEncoder;
  use flate2::Compression;
  use http::{HeaderMap, Method, StatusCode, Version};
  use std::io::Write as _;

  fn test_context() -> Context {
    Context {
      protocol: Protocol::Http,
      hostname: "example.com".to_string(),
      port: 80,
      client_ip: None,
      connect: None,
      request: InterceptedRequest {
        method: Method::GET,
        target: "/".to_string(),
        version: Version::HTTP_11,
        headers: HeaderMap::new(),
        body: Bytes::new(),
      },
      proxy: None,
      agent: None,
      summary: RequestSummary::default(),
      response: None,
    }
  }

  struct GzippedResponder;

  #[async_trait]
  impl Middleware for GzippedResponder {
    async fn handle(&self, ctx: &mut Context, _next: Next<'_>) -> Result<()> {
      assert_eq!(
        ctx.request.headers.get(header::ACCEPT_ENCODING).unwrap(),
        "gzip"
      );
      let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
      encoder.write_all(b"hello gzip").unwrap();
      let compressed = encoder.finish().unwrap();
      let mut headers = HeaderMap::new();
      headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
      ctx.response = Some(InterceptedResponse {
        version: Version::HTTP_11,
        status: StatusCode::OK,
        headers,
        body: Bytes::from(compressed),
      });
      Ok(())
    }
  }

  #[tokio::test]
  async fn test_gunzip_decodes_in_place() {
    let pipeline = Pipeline::new(vec![Arc::new(Gunzip), Arc::new(GzippedResponder)]);
    let mut ctx = test_context();
    pipeline.run(&mut ctx).await.unwrap();
    let response = ctx.response.unwrap();
    assert_eq!(&response.body[..], b"hello gzip");
    assert!(response.headers.get(header::CONTENT_ENCODING).is_none());
    assert_eq!(response.headers.get(header::CONTENT_LENGTH).unwrap(), "10");
  }
}
