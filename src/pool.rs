//! Ephemeral HTTPS listener pool
//!
//! One interception listener per hostname, with hostnames of the same
//! wildcard class coalescing onto a single shared listener when the CA may
//! issue wildcard-covering leaves. Creation is single-flight per wildcard
//! class: concurrent CONNECTs for the same class produce exactly one
//! listener, and the pool entry is installed before the class lock is
//! released so every waiter observes it.

use crate::error::{Error, Result};
use crate::pipeline::Protocol;
use crate::server::{serve_connection, Shared};
use crate::tls;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

struct PoolEntry {
  port: u16,
  /// `None` for alias entries, which do not own a listener
  listener: Option<JoinHandle<()>>,
}

/// Pool of ephemeral per-host HTTPS listeners.
pub struct TlsServerPool {
  entries: RwLock<HashMap<String, PoolEntry>>,
  locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
  wildcard_certs: bool,
}

/// The wildcard class of a hostname: drop the leftmost DNS label.
/// IP literals and single-label names have no class.
pub(crate) fn wildcard_key(hostname: &str) -> Option<String> {
  if hostname.parse::<std::net::IpAddr>().is_ok() {
    return None;
  }
  let (_, suffix) = hostname.split_once('.')?;
  if suffix.is_empty() {
    return None;
  }
  Some(format!("*.{}", suffix))
}

impl TlsServerPool {
  /// Create an empty pool.
  pub fn new(wildcard_certs: bool) -> Self {
    Self {
      entries: RwLock::new(HashMap::new()),
      locks: Mutex::new(HashMap::new()),
      wildcard_certs,
    }
  }

  /// Get the loopback port of the interception listener for `hostname`,
  /// creating the listener (or an alias onto its class's listener) on first
  /// use.
  pub(crate) async fn acquire(&self, hostname: &str, shared: &Arc<Shared>) -> Result<u16> {
    if let Some(entry) = self.entries.read().await.get(hostname) {
      return Ok(entry.port);
    }
    let class = wildcard_key(hostname);
    let lock_key = class.clone().unwrap_or_else(|| hostname.to_string());
    let lock = {
      let mut locks = self.locks.lock().await;
      locks
        .entry(lock_key)
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
    };
    let _guard = lock.lock().await;

    // a waiter that lost the race sees the winner's entry here
    if let Some(entry) = self.entries.read().await.get(hostname) {
      return Ok(entry.port);
    }
    let shared_class = class.filter(|_| self.wildcard_certs);
    if let Some(class) = &shared_class {
      let class_port = self.entries.read().await.get(class).map(|entry| entry.port);
      if let Some(port) = class_port {
        self.entries.write().await.insert(
          hostname.to_string(),
          PoolEntry {
            port,
            listener: None,
          },
        );
        return Ok(port);
      }
    }

    let (store_key, names) = match &shared_class {
      Some(class) => (
        class.clone(),
        vec![hostname.to_string(), class.clone()],
      ),
      None => (hostname.to_string(), vec![hostname.to_string()]),
    };
    let (port, task) = self.spawn_listener(&store_key, &names, shared).await?;
    let mut entries = self.entries.write().await;
    entries.insert(
      store_key.clone(),
      PoolEntry {
        port,
        listener: Some(task),
      },
    );
    if store_key != hostname {
      entries.insert(
        hostname.to_string(),
        PoolEntry {
          port,
          listener: None,
        },
      );
    }
    // the class lock is released only after the entries are visible
    Ok(port)
  }

  async fn spawn_listener(
    &self,
    cache_key: &str,
    names: &[String],
    shared: &Arc<Shared>,
  ) -> Result<(u16, JoinHandle<()>)> {
    let (chain, key) = shared.certs.leaf_for(cache_key, names).await?;
    let config = tls::server_config(chain, key)?;
    let acceptor = TlsAcceptor::from(Arc::new(config));
    let listener = TcpListener::bind((shared.bind_ip, 0))
      .await
      .map_err(|e| Error::tls_error(format!("failed to bind interception listener: {}", e)))?;
    let local = listener.local_addr()?;
    let shared = shared.clone();
    let task = tokio::spawn(async move {
      loop {
        match listener.accept().await {
          Ok((stream, peer)) => {
            let acceptor = acceptor.clone();
            let shared = shared.clone();
            tokio::spawn(async move {
              match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                  let result = serve_connection(
                    BufReader::new(tls_stream),
                    Protocol::Https,
                    peer,
                    local,
                    shared.clone(),
                    None,
                  )
                  .await;
                  if let Err(e) = result {
                    if !e.is_connection_reset() {
                      (shared.observer)(&e);
                    }
                  }
                }
                Err(e) => {
                  tracing::debug!("TLS accept failed on interception listener: {}", e);
                }
              }
            });
          }
          Err(e) => {
            tracing::error!("accept failed on interception listener: {}", e);
          }
        }
      }
    });
    Ok((local.port(), task))
  }

  /// Number of entries, aliases included.
  #[cfg(test)]
  pub(crate) async fn len(&self) -> usize {
    self.entries.read().await.len()
  }

  /// Number of entries owning a listener.
  #[cfg(test)]
  pub(crate) async fn listener_count(&self) -> usize {
    self
      .entries
      .read()
      .await
      .values()
      .filter(|e| e.listener.is_some())
      .count()
  }

  /// Close every owned listener and clear the pool. Alias entries are
  /// discarded without a close. Safe to call more than once.
  pub async fn shutdown(&self) {
    let mut entries = self.entries.write().await;
    for (_, entry) in entries.drain() {
      if let Some(task) = entry.listener {
        task.abort();
      }
    }
    self.locks.lock().await.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::server::{test_shared, test_shared_with};

  #[test]
  fn test_wildcard_key() {
    assert_eq!(wildcard_key("a.example.com").as_deref(), Some("*.example.com"));
    assert_eq!(wildcard_key("example.com").as_deref(), Some("*.com"));
    assert_eq!(wildcard_key("localhost"), None);
    assert_eq!(wildcard_key("127.0.0.1"), None);
    assert_eq!(wildcard_key("::1"), None);
  }

  #[tokio::test]
  async fn test_single_flight_per_class() {
    let shared = test_shared("tapwire-pool-single-flight").await;
    let mut handles = Vec::new();
    for i in 0..26u8 {
      let shared = shared.clone();
      let host = format!("{}.example.com", (b'a' + i) as char);
      handles.push(tokio::spawn(async move {
        shared.pool.acquire(&host, &shared).await.unwrap()
      }));
    }
    let mut ports = Vec::new();
    for handle in handles {
      ports.push(handle.await.unwrap());
    }
    let first = ports[0];
    assert!(
      ports.iter().all(|p| *p == first),
      "every caller must share one listener port"
    );
    assert_eq!(
      shared.pool.listener_count().await,
      1,
      "exactly one listener per wildcard class"
    );
    shared.pool.shutdown().await;
  }

  #[tokio::test]
  async fn test_alias_reuses_class_port() {
    let shared = test_shared("tapwire-pool-alias").await;
    let port = shared.pool.acquire("a.example.com", &shared).await.unwrap();
    let alias = shared.pool.acquire("b.example.com", &shared).await.unwrap();
    assert_eq!(port, alias);
    assert_eq!(shared.pool.listener_count().await, 1);
    // a different class gets its own listener
    let other = shared.pool.acquire("a.example.net", &shared).await.unwrap();
    assert_ne!(port, other);
    assert_eq!(shared.pool.listener_count().await, 2);
    shared.pool.shutdown().await;
  }

  #[tokio::test]
  async fn test_no_sharing_without_wildcard_certs() {
    let shared = test_shared_with("tapwire-pool-nowild", false).await;
    let a = shared.pool.acquire("a.example.com", &shared).await.unwrap();
    let b = shared.pool.acquire("b.example.com", &shared).await.unwrap();
    assert_ne!(a, b);
    assert_eq!(shared.pool.listener_count().await, 2);
    shared.pool.shutdown().await;
  }

  #[tokio::test]
  async fn test_shutdown_is_idempotent() {
    let shared = test_shared("tapwire-pool-shutdown").await;
    shared.pool.acquire("a.example.com", &shared).await.unwrap();
    shared.pool.shutdown().await;
    assert_eq!(shared.pool.len().await, 0);
    shared.pool.shutdown().await;
    assert_eq!(shared.pool.len().await, 0);
  }
}
