//! Middleware pipeline
//!
//! Every intercepted HTTP transaction flows through an ordered chain of
//! middleware. Each middleware receives the mutable [`Context`] and a
//! [`Next`] continuation; calling `next.run(ctx)` resumes after the rest of
//! the chain completes, and not calling it short-circuits. `Next` is
//! consumed by value, so a middleware cannot resume the chain twice.

use crate::error::Result;
use crate::record::RequestSummary;
use crate::registry::ConnectInfo;
use crate::sysproxy::UpstreamProxyConfig;
use crate::upstream::Agent;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Version};
use std::net::IpAddr;
use std::sync::Arc;

/// Protocol of the intercepted transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
  /// Plain HTTP
  Http,
  /// TLS-intercepted HTTPS
  Https,
}

impl Protocol {
  /// URL scheme for this protocol
  pub fn scheme(&self) -> &'static str {
    match self {
      Protocol::Http => "http",
      Protocol::Https => "https",
    }
  }

  /// Default port for this protocol
  pub fn default_port(&self) -> u16 {
    match self {
      Protocol::Http => 80,
      Protocol::Https => 443,
    }
  }
}

/// The mutable outbound request, rewritten freely by middleware.
#[derive(Clone, Debug)]
pub struct InterceptedRequest {
  /// Request method
  pub method: Method,
  /// Origin-form request-target (path and query)
  pub target: String,
  /// HTTP version
  pub version: Version,
  /// Request headers
  pub headers: HeaderMap,
  /// Request body
  pub body: Bytes,
}

/// The buffered upstream response, rewritten freely by middleware.
#[derive(Clone, Debug)]
pub struct InterceptedResponse {
  /// HTTP version
  pub version: Version,
  /// Response status
  pub status: StatusCode,
  /// Response headers
  pub headers: HeaderMap,
  /// Response body
  pub body: Bytes,
}

/// Per-transaction state threaded through the middleware chain.
pub struct Context {
  /// Whether the transaction was intercepted over TLS
  pub protocol: Protocol,
  /// Target hostname (the CONNECT's original host when tunneled)
  pub hostname: String,
  /// Target port
  pub port: u16,
  /// Address of the proxy client, taken from the originating CONNECT when
  /// the request arrived through a tunnel
  pub client_ip: Option<IpAddr>,
  /// The CONNECT request this transaction rides on, if any
  pub connect: Option<ConnectInfo>,
  /// The mutable outbound request
  pub request: InterceptedRequest,
  /// Upstream proxy configuration, populated once per request
  pub proxy: Option<UpstreamProxyConfig>,
  /// The connection factory chosen for this request
  pub agent: Option<Agent>,
  /// Observation record
  pub summary: RequestSummary,
  /// The upstream response, once produced
  pub response: Option<InterceptedResponse>,
}

impl Context {
  /// Absolute URL of the outbound request.
  pub fn url(&self) -> String {
    if self.port == self.protocol.default_port() {
      format!("{}://{}{}", self.protocol.scheme(), self.hostname, self.request.target)
    } else {
      format!(
        "{}://{}:{}{}",
        self.protocol.scheme(),
        self.hostname,
        self.port,
        self.request.target
      )
    }
  }

  /// `host:port` form, omitting a protocol-default port.
  pub fn host_header(&self) -> String {
    if self.port == self.protocol.default_port() {
      self.hostname.clone()
    } else {
      format!("{}:{}", self.hostname, self.port)
    }
  }
}

/// One middleware in the chain.
#[async_trait]
pub trait Middleware: Send + Sync {
  /// Handle the transaction; call `next.run(ctx)` to continue the chain.
  async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<()>;
}

/// Continuation over the remainder of the chain.
///
/// Consumed by value: a middleware can run the rest of the chain at most
/// once, and dropping it without running short-circuits.
pub struct Next<'a> {
  stack: &'a [Arc<dyn Middleware>],
}

impl Next<'_> {
  /// Run the remaining middleware.
  pub async fn run(self, ctx: &mut Context) -> Result<()> {
    match self.stack.split_first() {
      Some((head, rest)) => head.handle(ctx, Next { stack: rest }).await,
      None => Ok(()),
    }
  }
}

/// The composed chain, built once at startup.
#[derive(Clone)]
pub struct Pipeline {
  stack: Arc<[Arc<dyn Middleware>]>,
}

impl Pipeline {
  /// Compose an ordered list of middleware into one pipeline.
  pub fn new(stack: Vec<Arc<dyn Middleware>>) -> Self {
    Self {
      stack: stack.into(),
    }
  }

  /// Run a transaction through the whole chain.
  pub async fn run(&self, ctx: &mut Context) -> Result<()> {
    Next { stack: &self.stack }.run(ctx).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

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

  struct Tag(&'static str, Arc<std::sync::Mutex<Vec<String>>>);

  #[async_trait]
  impl Middleware for Tag {
    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<()> {
      self.1.lock().unwrap().push(format!("{}:enter", self.0));
      let result = next.run(ctx).await;
      self.1.lock().unwrap().push(format!("{}:exit", self.0));
      result
    }
  }

  #[tokio::test]
  async fn test_onion_ordering() {
    let trace = Arc::new(std::sync::Mutex::new(Vec::new()));
    let pipeline = Pipeline::new(vec![
      Arc::new(Tag("outer", trace.clone())),
      Arc::new(Tag("inner", trace.clone())),
    ]);
    pipeline.run(&mut test_context()).await.unwrap();
    assert_eq!(
      *trace.lock().unwrap(),
      vec!["outer:enter", "inner:enter", "inner:exit", "outer:exit"]
    );
  }

  struct ShortCircuit;

  #[async_trait]
  impl Middleware for ShortCircuit {
    async fn handle(&self, ctx: &mut Context, _next: Next<'_>) -> Result<()> {
      ctx.response = Some(InterceptedResponse {
        version: Version::HTTP_11,
        status: StatusCode::FORBIDDEN,
        headers: HeaderMap::new(),
        body: Bytes::from_static(b"blocked"),
      });
      Ok(())
    }
  }

  struct Count(Arc<AtomicUsize>);

  #[async_trait]
  impl Middleware for Count {
    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<()> {
      self.0.fetch_add(1, Ordering::SeqCst);
      next.run(ctx).await
    }
  }

  #[tokio::test]
  async fn test_short_circuit_skips_rest() {
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = Pipeline::new(vec![
      Arc::new(ShortCircuit),
      Arc::new(Count(calls.clone())),
    ]);
    let mut ctx = test_context();
    pipeline.run(&mut ctx).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(ctx.response.unwrap().status, StatusCode::FORBIDDEN);
  }
}
