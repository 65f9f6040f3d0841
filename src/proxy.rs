//! Proxy configuration and lifecycle

use crate::ca::CertificateManager;
use crate::error::{Error, Result};
use crate::middleware::{ClientProxy, Gunzip, ServerEnd, ServerProxy, Summary};
use crate::pac::{PacEvaluator, ScriptPacEvaluator};
use crate::pipeline::{Middleware, Pipeline};
use crate::pool::TlsServerPool;
use crate::registry::ConnectRegistry;
use crate::server::{spawn_outer, spawn_plain, Shared};
use crate::sysproxy::{NoSystemProxy, SystemProxyDetector, UpstreamProxyConfig};
use crate::upstream::Connector;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Observer invoked for every surfaced proxy error.
pub type ErrorObserver = Arc<dyn Fn(&Error) + Send + Sync>;

/// Configuration for the intercepting proxy
#[derive(Clone)]
pub struct MitmConfig {
  /// Path to store the CA certificate and key
  pub ca_storage_path: PathBuf,
  /// Pinned upstream configuration; when absent the system resolver runs
  /// once per request
  pub upstream_proxy: Option<UpstreamProxyConfig>,
  /// Let hostnames of one wildcard class share a single interception
  /// listener backed by a wildcard-covering leaf
  pub wildcard_certs: bool,
  /// Verify origin certificates on re-originated connections
  pub verify_upstream: bool,
  /// Outbound connect timeout in seconds
  pub connection_timeout: u64,
}

impl Default for MitmConfig {
  fn default() -> Self {
    Self {
      ca_storage_path: PathBuf::from(".tapwire"),
      upstream_proxy: None,
      wildcard_certs: true,
      verify_upstream: false,
      connection_timeout: 30,
    }
  }
}

/// The intercepting proxy
pub struct MitmProxy {
  config: MitmConfig,
  certs: Arc<CertificateManager>,
  middlewares: Vec<Arc<dyn Middleware>>,
  detector: Arc<dyn SystemProxyDetector>,
  evaluator: Option<Arc<dyn PacEvaluator>>,
  observer: ErrorObserver,
}

impl MitmProxy {
  /// Create a proxy with the given configuration.
  pub async fn new(config: MitmConfig) -> Result<Self> {
    let certs = Arc::new(CertificateManager::new(&config.ca_storage_path).await?);
    Ok(Self {
      config,
      certs,
      middlewares: Vec::new(),
      detector: Arc::new(NoSystemProxy),
      evaluator: None,
      observer: Arc::new(|e| tracing::error!("proxy error: {}", e)),
    })
  }

  /// Append a user middleware. User middleware runs between the summary
  /// and gzip stages, in registration order.
  pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
    self.middlewares.push(middleware);
    self
  }

  /// Replace the OS proxy detector.
  pub fn with_detector(mut self, detector: Arc<dyn SystemProxyDetector>) -> Self {
    self.detector = detector;
    self
  }

  /// Replace the PAC evaluator.
  pub fn with_pac_evaluator(mut self, evaluator: Arc<dyn PacEvaluator>) -> Self {
    self.evaluator = Some(evaluator);
    self
  }

  /// Replace the process-wide error observer.
  pub fn with_error_observer<F>(mut self, observer: F) -> Self
  where
    F: Fn(&Error) + Send + Sync + 'static,
  {
    self.observer = Arc::new(observer);
    self
  }

  /// CA certificate in PEM format, for installation in the client's trust
  /// store.
  pub fn ca_cert_pem(&self) -> Result<String> {
    self.certs.ca_cert_pem()
  }

  /// Path of the persisted CA certificate.
  pub fn ca_cert_path(&self) -> PathBuf {
    self.certs.ca_cert_path()
  }

  /// Bind the listeners and start serving. Returns a handle carrying the
  /// bound address and the shutdown operation.
  pub async fn start(&self, addr: &str) -> Result<ProxyHandle> {
    let outer = TcpListener::bind(addr)
      .await
      .map_err(|e| Error::other(format!("failed to bind to {}: {}", addr, e)))?;
    let local_addr = outer.local_addr()?;
    let bind_ip = local_addr.ip();
    let plain = TcpListener::bind((bind_ip, 0)).await?;
    let plain_addr = plain.local_addr()?;

    let connector = Arc::new(Connector::new(
      self.config.verify_upstream,
      Vec::new(),
      Some(Duration::from_secs(self.config.connection_timeout)),
    )?);
    let evaluator = self
      .evaluator
      .clone()
      .unwrap_or_else(|| Arc::new(ScriptPacEvaluator::new(connector.clone())));

    let mut stack: Vec<Arc<dyn Middleware>> = vec![
      Arc::new(ClientProxy::new(
        self.config.upstream_proxy.clone(),
        self.detector.clone(),
      )),
      Arc::new(Summary),
    ];
    stack.extend(self.middlewares.iter().cloned());
    stack.push(Arc::new(Gunzip));
    stack.push(Arc::new(ServerProxy::new(evaluator)));
    stack.push(Arc::new(ServerEnd::new(connector.clone())));

    let shared = Arc::new(Shared {
      bind_ip,
      plain_port: plain_addr.port(),
      certs: self.certs.clone(),
      registry: ConnectRegistry::new(),
      pool: TlsServerPool::new(self.config.wildcard_certs),
      pipeline: Pipeline::new(stack),
      connector,
      observer: self.observer.clone(),
    });

    let plain_task = spawn_plain(plain, plain_addr, shared.clone());
    let outer_task = spawn_outer(outer, shared.clone());
    tracing::info!("proxy listening on {}", local_addr);
    Ok(ProxyHandle {
      local_addr,
      shared,
      outer_task,
      plain_task,
    })
  }
}

/// Handle over a started proxy.
pub struct ProxyHandle {
  local_addr: SocketAddr,
  shared: Arc<Shared>,
  outer_task: JoinHandle<()>,
  plain_task: JoinHandle<()>,
}

impl ProxyHandle {
  /// The address the proxy is listening on.
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Stop accepting, close the outer listener, then every pool listener.
  /// Safe to call more than once.
  pub async fn shutdown(&self) {
    self.outer_task.abort();
    self.plain_task.abort();
    self.shared.pool.shutdown().await;
  }
}
