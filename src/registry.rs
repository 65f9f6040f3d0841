//! CONNECT tunnel registry
//!
//! Maps the `(local, remote)` port pair of each loopback splice to the
//! CONNECT request that opened it, so intercepted HTTP requests inherit the
//! originally requested host. Entries are inserted before the first tunneled
//! byte is forwarded and removed when the tunnel ends.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Key identifying a loopback splice, as seen from the dispatcher's side.
pub type ConnectKey = (u16, u16);

/// Metadata of the CONNECT request that opened a tunnel.
#[derive(Clone, Debug)]
pub struct ConnectInfo {
  /// Originally requested hostname
  pub host: String,
  /// Originally requested port
  pub port: u16,
  /// Address of the proxy client that issued the CONNECT
  pub client_addr: SocketAddr,
}

/// Process-wide registry of live CONNECT tunnels.
#[derive(Clone, Default)]
pub struct ConnectRegistry {
  inner: Arc<RwLock<HashMap<ConnectKey, ConnectInfo>>>,
}

impl ConnectRegistry {
  /// Create an empty registry.
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a tunnel under its splice key.
  pub async fn insert(&self, key: ConnectKey, info: ConnectInfo) {
    self.inner.write().await.insert(key, info);
  }

  /// Remove a tunnel when its splice ends.
  pub async fn remove(&self, key: &ConnectKey) {
    self.inner.write().await.remove(key);
  }

  /// Look up the CONNECT behind an inbound socket pair.
  ///
  /// The inner listener passes `(peer_port, local_port)` of its accepted
  /// socket, which mirrors the dispatcher's `(local, remote)` key.
  pub async fn lookup(&self, key: &ConnectKey) -> Option<ConnectInfo> {
    self.inner.read().await.get(key).cloned()
  }

  /// Number of live tunnels.
  pub async fn len(&self) -> usize {
    self.inner.read().await.len()
  }

  /// Whether no tunnel is live.
  pub async fn is_empty(&self) -> bool {
    self.inner.read().await.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_insert_lookup_remove() {
    let registry = ConnectRegistry::new();
    let info = ConnectInfo {
      host: "example.com".to_string(),
      port: 443,
      client_addr: "127.0.0.1:50000".parse().unwrap(),
    };
    registry.insert((40000, 40001), info).await;
    let found = registry.lookup(&(40000, 40001)).await.unwrap();
    assert_eq!(found.host, "example.com");
    assert_eq!(found.port, 443);
    registry.remove(&(40000, 40001)).await;
    assert!(registry.lookup(&(40000, 40001)).await.is_none());
    assert!(registry.is_empty().await);
  }
}
