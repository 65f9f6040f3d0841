//! Integration tests for tapwire

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tapwire::{
  CertificateManager, Context, Middleware, MitmConfig, MitmProxy, Next, ProxyVia,
  UpstreamProxyConfig,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls;

fn temp_ca_dir(tag: &str) -> std::path::PathBuf {
  let dir = std::env::temp_dir().join(tag);
  if dir.exists() {
    std::fs::remove_dir_all(&dir).ok();
  }
  dir
}

async fn start_proxy(tag: &str, config: MitmConfig) -> (MitmProxy, tapwire::ProxyHandle) {
  let config = MitmConfig {
    ca_storage_path: temp_ca_dir(tag),
    // pin an empty upstream config so ambient HTTP_PROXY variables cannot
    // divert test traffic
    upstream_proxy: config
      .upstream_proxy
      .clone()
      .or_else(|| Some(UpstreamProxyConfig::default())),
    ..config
  };
  let proxy = MitmProxy::new(config).await.expect("failed to create proxy");
  let handle = proxy
    .start("127.0.0.1:0")
    .await
    .expect("failed to start proxy");
  (proxy, handle)
}

/// Minimal plain-HTTP origin that answers every request with `body`.
async fn spawn_origin(body: &'static str) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let Ok((mut stream, _)) = listener.accept().await else {
        break;
      };
      tokio::spawn(async move {
        if read_head(&mut stream).await.is_none() {
          return;
        }
        let response = format!(
          "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
          body.len(),
          body
        );
        stream.write_all(response.as_bytes()).await.ok();
      });
    }
  });
  addr
}

/// Read a request or response head off a raw socket.
async fn read_head<S: AsyncReadExt + Unpin>(stream: &mut S) -> Option<Vec<u8>> {
  let mut head = Vec::new();
  let mut buf = [0u8; 1024];
  loop {
    let n = stream.read(&mut buf).await.ok()?;
    if n == 0 {
      return None;
    }
    head.extend_from_slice(&buf[..n]);
    if head.windows(4).any(|w| w == b"\r\n\r\n") {
      return Some(head);
    }
  }
}

/// Send raw bytes and collect everything until the peer closes.
async fn roundtrip(addr: SocketAddr, raw: String) -> String {
  let mut stream = TcpStream::connect(addr).await.unwrap();
  stream.write_all(raw.as_bytes()).await.unwrap();
  let mut out = Vec::new();
  stream.read_to_end(&mut out).await.unwrap();
  String::from_utf8_lossy(&out).to_string()
}

/// Open a CONNECT tunnel through the proxy and consume the 200 reply.
async fn open_tunnel(proxy: SocketAddr, target: &str) -> TcpStream {
  let mut stream = TcpStream::connect(proxy).await.unwrap();
  stream
    .write_all(format!("CONNECT {t} HTTP/1.1\r\nHost: {t}\r\n\r\n", t = target).as_bytes())
    .await
    .unwrap();
  let reply = read_head(&mut stream).await.expect("no CONNECT reply");
  let reply = String::from_utf8_lossy(&reply).to_string();
  assert!(reply.starts_with("HTTP/1.1 200"), "CONNECT refused: {}", reply);
  stream
}

/// User middleware capturing the summary's proxy record for assertions.
struct CaptureVia(Arc<Mutex<Option<ProxyVia>>>);

#[async_trait]
impl Middleware for CaptureVia {
  async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> tapwire::Result<()> {
    let result = next.run(ctx).await;
    *self.0.lock().unwrap() = ctx.summary.proxy.clone();
    result
  }
}

#[tokio::test]
async fn test_ca_generation() {
  let dir = temp_ca_dir("tapwire-test-ca");
  let manager = CertificateManager::new(&dir).await;
  assert!(manager.is_ok(), "failed to create certificate manager");
  let manager = manager.unwrap();

  let ca_pem = manager.ca_cert_pem();
  assert!(ca_pem.is_ok(), "failed to get CA certificate PEM");
  let pem = ca_pem.unwrap();
  assert!(pem.contains("BEGIN CERTIFICATE"), "invalid PEM format");
  assert!(manager.ca_cert_path().exists(), "CA certificate not created");
  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_wildcard_leaf_yields_working_server_config() {
  let dir = temp_ca_dir("tapwire-test-wildcard-leaf");
  let manager = CertificateManager::new(&dir).await.unwrap();
  let names = vec!["a.example.com".to_string(), "*.example.com".to_string()];
  let (chain, key) = manager.leaf_for("*.example.com", &names).await.unwrap();
  assert_eq!(chain.len(), 2, "expected [leaf, root] chain");

  let config = rustls::ServerConfig::builder_with_provider(Arc::new(
    rustls::crypto::ring::default_provider(),
  ))
  .with_safe_default_protocol_versions()
  .unwrap()
  .with_no_client_auth()
  .with_single_cert(chain, key);
  assert!(config.is_ok(), "minted leaf unusable for a TLS listener");

  // the cached entry serves the same class again
  let (chain2, _) = manager.leaf_for("*.example.com", &names).await.unwrap();
  assert_eq!(chain2.len(), 2);
  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_plain_http_direct() {
  let origin = spawn_origin("direct-body").await;
  let (_proxy, handle) = start_proxy("tapwire-test-direct", MitmConfig::default()).await;

  let response = roundtrip(
    handle.local_addr(),
    format!(
      "GET http://{origin}/a HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n"
    ),
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
  assert!(response.ends_with("direct-body"), "got: {}", response);
  handle.shutdown().await;
}

#[tokio::test]
async fn test_plain_http_via_upstream_proxy() {
  // mock upstream proxy that records the request line it receives
  let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let upstream_addr = upstream.local_addr().unwrap();
  let seen_line = Arc::new(Mutex::new(String::new()));
  let seen = seen_line.clone();
  tokio::spawn(async move {
    loop {
      let Ok((mut stream, _)) = upstream.accept().await else {
        break;
      };
      let seen = seen.clone();
      tokio::spawn(async move {
        let Some(head) = read_head(&mut stream).await else {
          return;
        };
        let text = String::from_utf8_lossy(&head);
        *seen.lock().unwrap() = text.lines().next().unwrap_or_default().to_string();
        stream
          .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 12\r\nConnection: close\r\n\r\nvia-upstream")
          .await
          .ok();
      });
    }
  });

  let via = Arc::new(Mutex::new(None));
  let config = MitmConfig {
    upstream_proxy: Some(UpstreamProxyConfig {
      http: Some(format!("http://{}", upstream_addr).parse().unwrap()),
      ..Default::default()
    }),
    ..Default::default()
  };
  let config_dir = temp_ca_dir("tapwire-test-upstream");
  let proxy = MitmProxy::new(MitmConfig {
    ca_storage_path: config_dir,
    ..config
  })
  .await
  .unwrap()
  .with_middleware(Arc::new(CaptureVia(via.clone())));
  let handle = proxy.start("127.0.0.1:0").await.unwrap();

  let response = roundtrip(
    handle.local_addr(),
    "GET http://example.com/a HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n"
      .to_string(),
  )
  .await;
  assert!(response.ends_with("via-upstream"), "got: {}", response);

  // one upstream connection carried the absolute-form request
  let line = seen_line.lock().unwrap().clone();
  assert_eq!(line, "GET http://example.com/a HTTP/1.1");

  // the summary recorded the chain
  let via = via.lock().unwrap().clone().expect("summary.proxy not set");
  assert_eq!(via.kind, "HTTP");
  assert!(via.address.contains(&upstream_addr.to_string()));
  handle.shutdown().await;
}

#[tokio::test]
async fn test_blind_tunnel_for_non_tls_payload() {
  let (_proxy, handle) = start_proxy("tapwire-test-blind", MitmConfig::default()).await;

  let mut stream = open_tunnel(handle.local_addr(), "example.com:22").await;
  // first byte 0x53 ('S') is not a TLS record start
  stream.write_all(b"SSH-2.0-OpenSSH_9.0\r\n").await.unwrap();
  let mut out = Vec::new();
  // the inner listener sees non-HTTP bytes and closes; the client
  // observes a plain close, not a TLS handshake
  stream.read_to_end(&mut out).await.unwrap();
  assert!(out.is_empty(), "unexpected bytes through blind tunnel: {:?}", out);
  handle.shutdown().await;
}

/// TLS origin built from a second, unrelated CA.
async fn spawn_tls_origin(tag: &str, body: &'static str) -> SocketAddr {
  let dir = temp_ca_dir(tag);
  let manager = CertificateManager::new(&dir).await.unwrap();
  let (chain, key) = manager
    .leaf_for("127.0.0.1", &["127.0.0.1".to_string()])
    .await
    .unwrap();
  let config = rustls::ServerConfig::builder_with_provider(Arc::new(
    rustls::crypto::ring::default_provider(),
  ))
  .with_safe_default_protocol_versions()
  .unwrap()
  .with_no_client_auth()
  .with_single_cert(chain, key)
  .unwrap();
  let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let Ok((stream, _)) = listener.accept().await else {
        break;
      };
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        let Ok(mut tls) = acceptor.accept(stream).await else {
          return;
        };
        if read_head(&mut tls).await.is_none() {
          return;
        }
        let response = format!(
          "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
          body.len(),
          body
        );
        tls.write_all(response.as_bytes()).await.ok();
        tls.shutdown().await.ok();
      });
    }
  });
  addr
}

#[tokio::test]
async fn test_tls_interception() {
  let origin = spawn_tls_origin("tapwire-test-tls-origin", "intercepted-tls").await;
  let (proxy, handle) = start_proxy("tapwire-test-tls", MitmConfig::default()).await;

  // a client that trusts only the proxy's CA
  let ca_pem = proxy.ca_cert_pem().unwrap();
  let mut roots = rustls::RootCertStore::empty();
  for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
    roots.add(cert.unwrap()).unwrap();
  }
  let client_config = rustls::ClientConfig::builder_with_provider(Arc::new(
    rustls::crypto::ring::default_provider(),
  ))
  .with_safe_default_protocol_versions()
  .unwrap()
  .with_root_certificates(roots)
  .with_no_client_auth();
  let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

  let tunnel = open_tunnel(handle.local_addr(), &format!("127.0.0.1:{}", origin.port())).await;
  let name = rustls::pki_types::ServerName::try_from("127.0.0.1".to_string()).unwrap();
  // the proxy must present a certificate minted for the CONNECT target,
  // or this handshake fails
  let mut tls = connector.connect(name, tunnel).await.unwrap();
  tls
    .write_all(
      format!(
        "GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
        origin.port()
      )
      .as_bytes(),
    )
    .await
    .unwrap();
  let mut out = Vec::new();
  tls.read_to_end(&mut out).await.unwrap();
  let response = String::from_utf8_lossy(&out);
  assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
  assert!(response.ends_with("intercepted-tls"), "got: {}", response);
  handle.shutdown().await;
}

#[tokio::test]
async fn test_pac_direct_flow() {
  let origin = spawn_origin("pac-direct-body").await;
  let pac_server =
    spawn_origin(r#"function FindProxyForURL(url, host) { return "DIRECT"; }"#).await;

  let via = Arc::new(Mutex::new(None));
  let proxy = MitmProxy::new(MitmConfig {
    ca_storage_path: temp_ca_dir("tapwire-test-pac"),
    upstream_proxy: Some(UpstreamProxyConfig {
      pac: Some(format!("http://{}/proxy.pac", pac_server).parse().unwrap()),
      ..Default::default()
    }),
    ..Default::default()
  })
  .await
  .unwrap()
  .with_middleware(Arc::new(CaptureVia(via.clone())));
  let handle = proxy.start("127.0.0.1:0").await.unwrap();

  let response = roundtrip(
    handle.local_addr(),
    format!(
      "GET http://{origin}/x HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n"
    ),
  )
  .await;
  assert!(response.ends_with("pac-direct-body"), "got: {}", response);
  let via = via.lock().unwrap().clone().expect("summary.proxy not set");
  assert_eq!(via.kind, "PAC");
  handle.shutdown().await;
}

#[tokio::test]
async fn test_websocket_bridge() {
  use futures_util::{SinkExt, StreamExt};
  use tokio_tungstenite::tungstenite::client::IntoClientRequest;
  use tokio_tungstenite::tungstenite::Message;

  // websocket echo origin capturing the upgrade headers it receives
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let ws_addr = listener.local_addr().unwrap();
  let seen_headers = Arc::new(Mutex::new(None));
  let seen = seen_headers.clone();
  tokio::spawn(async move {
    let Ok((stream, _)) = listener.accept().await else {
      return;
    };
    let callback = {
      let seen = seen.clone();
      move |req: &tokio_tungstenite::tungstenite::handshake::server::Request,
            resp: tokio_tungstenite::tungstenite::handshake::server::Response| {
        *seen.lock().unwrap() = Some(req.headers().clone());
        Ok(resp)
      }
    };
    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
      return;
    };
    while let Some(Ok(message)) = ws.next().await {
      if message.is_text() {
        if ws.send(message).await.is_err() {
          break;
        }
      } else if message.is_close() {
        break;
      }
    }
  });

  let (_proxy, handle) = start_proxy("tapwire-test-ws", MitmConfig::default()).await;
  let tunnel = open_tunnel(handle.local_addr(), &format!("127.0.0.1:{}", ws_addr.port())).await;

  let mut request = format!("ws://127.0.0.1:{}/", ws_addr.port())
    .into_client_request()
    .unwrap();
  request
    .headers_mut()
    .insert("sec-websocket-foo", "leak".parse().unwrap());
  request
    .headers_mut()
    .insert("x-custom", "1".parse().unwrap());
  let (mut ws, _) = tokio_tungstenite::client_async(request, tunnel)
    .await
    .expect("websocket handshake through proxy failed");

  ws.send(Message::Text("hi".to_string())).await.unwrap();
  let echoed = loop {
    match ws.next().await.expect("origin hung up").unwrap() {
      Message::Text(text) => break text,
      Message::Ping(_) | Message::Pong(_) => continue,
      other => panic!("unexpected frame: {:?}", other),
    }
  };
  assert_eq!(echoed, "hi");
  ws.close(None).await.unwrap();

  // the upstream handshake regenerated every sec-websocket header
  let headers = seen_headers.lock().unwrap().clone().expect("origin saw no upgrade");
  assert!(headers.get("sec-websocket-foo").is_none(), "client sec-websocket header leaked upstream");
  assert!(headers.get("sec-websocket-key").is_some());
  assert_eq!(headers.get("x-custom").unwrap(), "1");
  handle.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
  let (_proxy, handle) = start_proxy("tapwire-test-shutdown", MitmConfig::default()).await;
  let addr = handle.local_addr();
  // serve one request before shutting down
  let origin = spawn_origin("x").await;
  let _ = roundtrip(
    addr,
    format!("GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n"),
  )
  .await;
  handle.shutdown().await;
  handle.shutdown().await;
  // the listener is gone after shutdown
  tokio::time::sleep(std::time::Duration::from_millis(50)).await;
  let connect = TcpStream::connect(addr).await;
  if let Ok(mut stream) = connect {
    stream
      .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
      .await
      .ok();
    let mut out = Vec::new();
    let n = stream.read_to_end(&mut out).await.unwrap_or(0);
    assert_eq!(n, 0, "proxy still serving after shutdown");
  }
}
