//! Connection dispatch and intercepted-request serving
//!
//! The outer listener accepts proxy-form requests and CONNECT tunnels. A
//! CONNECT is answered with `200 Connection Established`, then the first
//! tunneled byte decides the route: a TLS record start goes to the
//! per-host HTTPS listener pool, anything else to the plain inner
//! listener. Either way the tunnel is a blind byte splice over loopback,
//! registered in the CONNECT registry before the preview byte is
//! forwarded so the inner listener can bind requests back to their
//! CONNECT.

use crate::ca::CertificateManager;
use crate::codec::{self, RequestHead};
use crate::error::{Error, Result};
use crate::host;
use crate::pipeline::{Context, InterceptedRequest, InterceptedResponse, Pipeline, Protocol};
use crate::pool::TlsServerPool;
use crate::proxy::ErrorObserver;
use crate::record::RequestSummary;
use crate::registry::{ConnectInfo, ConnectRegistry};
use crate::upstream::Connector;
use crate::ws;
use http::{header, HeaderValue, Method, StatusCode};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// First tunneled byte of a TLS 1.x handshake record
const TLS_HANDSHAKE: u8 = 0x16;
/// First tunneled byte of an SSLv2 record with the length MSB set
const SSLV2_MSB: u8 = 0x80;

/// State shared by the outer listener, the plain inner listener and every
/// pool listener.
pub(crate) struct Shared {
  pub(crate) bind_ip: IpAddr,
  pub(crate) plain_port: u16,
  pub(crate) certs: Arc<CertificateManager>,
  pub(crate) registry: ConnectRegistry,
  pub(crate) pool: TlsServerPool,
  pub(crate) pipeline: Pipeline,
  pub(crate) connector: Arc<Connector>,
  pub(crate) observer: ErrorObserver,
}

pub(crate) fn spawn_outer(listener: TcpListener, shared: Arc<Shared>) -> JoinHandle<()> {
  tokio::spawn(async move {
    loop {
      match listener.accept().await {
        Ok((stream, peer)) => {
          let shared = shared.clone();
          tokio::spawn(async move {
            if let Err(e) = handle_outer(stream, peer, shared.clone()).await {
              if !e.is_connection_reset() {
                (shared.observer)(&e);
              }
            }
          });
        }
        Err(e) => {
          tracing::error!("accept failed on proxy listener: {}", e);
        }
      }
    }
  })
}

pub(crate) fn spawn_plain(
  listener: TcpListener,
  local: SocketAddr,
  shared: Arc<Shared>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    loop {
      match listener.accept().await {
        Ok((stream, peer)) => {
          let shared = shared.clone();
          tokio::spawn(async move {
            let result = serve_connection(
              BufReader::new(stream),
              Protocol::Http,
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
          });
        }
        Err(e) => {
          tracing::error!("accept failed on inner listener: {}", e);
        }
      }
    }
  })
}

/// Handle one client connection on the outer listener.
async fn handle_outer(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) -> Result<()> {
  let mut reader = BufReader::new(stream);
  loop {
    let head = match codec::read_request_head(&mut reader).await {
      Ok(Some(head)) => head,
      Ok(None) => return Ok(()),
      Err(e) => {
        reader
          .get_mut()
          .write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n")
          .await
          .ok();
        return Err(e);
      }
    };
    if head.method == Method::CONNECT {
      return handle_connect(reader, head, peer, shared).await;
    }
    if codec::is_websocket_upgrade(&head.headers) {
      return ws::bridge(reader, head, Protocol::Http, None, &shared).await;
    }
    if !serve_one(&mut reader, head, Protocol::Http, &None, &shared).await? {
      return Ok(());
    }
  }
}

/// Dispatch a CONNECT: reply 200, sniff the first tunneled byte, splice to
/// the chosen loopback listener.
async fn handle_connect(
  mut reader: BufReader<TcpStream>,
  head: RequestHead,
  peer: SocketAddr,
  shared: Arc<Shared>,
) -> Result<()> {
  let (host, port) = match host::connect_target(&head.target) {
    Ok(target) => target,
    Err(e) => {
      reader
        .get_mut()
        .write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n")
        .await
        .ok();
      return Err(e);
    }
  };
  reader
    .get_mut()
    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
    .await?;
  reader.get_mut().flush().await?;

  // preview bytes: whatever arrived with the head, else one read
  let mut preview = reader.buffer().to_vec();
  let mut client = reader.into_inner();
  if preview.is_empty() {
    let mut byte = [0u8; 1];
    match client.read(&mut byte).await {
      Ok(0) => return Ok(()),
      Ok(_) => preview.push(byte[0]),
      Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => return Ok(()),
      Err(e) => return Err(e.into()),
    }
  }

  let is_tls = matches!(preview[0], TLS_HANDSHAKE | SSLV2_MSB | 0x00);
  let target_port = if is_tls {
    shared.pool.acquire(&host, &shared).await?
  } else {
    shared.plain_port
  };

  let mut inner = TcpStream::connect((shared.bind_ip, target_port)).await?;
  let key = (inner.local_addr()?.port(), inner.peer_addr()?.port());
  shared
    .registry
    .insert(
      key,
      ConnectInfo {
        host,
        port,
        client_addr: peer,
      },
    )
    .await;
  // the registry entry exists before the preview byte reaches the listener
  let result = async {
    inner.write_all(&preview).await?;
    tokio::io::copy_bidirectional(&mut client, &mut inner).await?;
    Ok::<_, std::io::Error>(())
  }
  .await;
  shared.registry.remove(&key).await;
  match result {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => Ok(()),
    Err(e) => Err(e.into()),
  }
}

/// Serve intercepted HTTP on a loopback listener connection.
pub(crate) async fn serve_connection<S>(
  mut reader: BufReader<S>,
  protocol: Protocol,
  peer: SocketAddr,
  local: SocketAddr,
  shared: Arc<Shared>,
  first: Option<RequestHead>,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  // the accepted socket pair mirrors the dispatcher's splice key
  let connect = shared.registry.lookup(&(peer.port(), local.port())).await;
  let mut first = first;
  loop {
    let head = match first.take() {
      Some(head) => head,
      None => match codec::read_request_head(&mut reader).await {
        Ok(Some(head)) => head,
        Ok(None) => break,
        Err(e) => {
          // not HTTP; a blind tunnel ends up here and just gets a close
          tracing::debug!("closing intercepted connection: {}", e);
          break;
        }
      },
    };
    if codec::is_websocket_upgrade(&head.headers) {
      return ws::bridge(reader, head, protocol, connect, &shared).await;
    }
    if !serve_one(&mut reader, head, protocol, &connect, &shared).await? {
      break;
    }
  }
  // an orderly shutdown carries the TLS close_notify to the client
  reader.get_mut().shutdown().await.ok();
  Ok(())
}

fn wants_close(head: &RequestHead) -> bool {
  let connection = head
    .headers
    .get(header::CONNECTION)
    .and_then(|v| v.to_str().ok())
    .map(str::to_ascii_lowercase)
    .unwrap_or_default();
  if connection.contains("close") {
    return true;
  }
  head.version == http::Version::HTTP_10 && !connection.contains("keep-alive")
}

/// Serve a single request through the pipeline. Returns whether the
/// connection should be kept open.
async fn serve_one<S>(
  reader: &mut BufReader<S>,
  mut head: RequestHead,
  protocol: Protocol,
  connect: &Option<ConnectInfo>,
  shared: &Arc<Shared>,
) -> Result<bool>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  let body = codec::read_request_body(reader, &head.headers).await?;
  let close_requested = wants_close(&head);

  let parsed = host::from_request(&mut head, protocol.default_port());
  let (hostname, port) = match (connect, parsed) {
    // requests on a tunnel inherit the CONNECT's original target
    (Some(info), _) => (info.host.clone(), info.port),
    (None, Ok(target)) => target,
    (None, Err(e)) => {
      let raw = codec::encode_response(
        http::Version::HTTP_11,
        StatusCode::BAD_REQUEST,
        &http::HeaderMap::new(),
        e.to_string().as_bytes(),
      );
      reader.get_mut().write_all(&raw).await?;
      return Ok(false);
    }
  };

  let mut ctx = Context {
    protocol,
    hostname,
    port,
    client_ip: connect.as_ref().map(|info| info.client_addr.ip()),
    connect: connect.clone(),
    request: InterceptedRequest {
      method: head.method,
      target: head.target,
      version: head.version,
      headers: head.headers,
      body,
    },
    proxy: None,
    agent: None,
    summary: RequestSummary::default(),
    response: None,
  };

  let result = shared.pipeline.run(&mut ctx).await;
  let response = match result {
    Ok(()) => ctx.response.take().unwrap_or_else(|| InterceptedResponse {
      version: http::Version::HTTP_11,
      status: StatusCode::BAD_GATEWAY,
      headers: http::HeaderMap::new(),
      body: bytes::Bytes::from_static(b"no response produced"),
    }),
    Err(e) => match ctx.response.take() {
      // a middleware already converted the failure into a response
      Some(response) => response,
      None => {
        let status = e.response_status();
        (shared.observer)(&e);
        InterceptedResponse {
          version: http::Version::HTTP_11,
          status,
          headers: http::HeaderMap::new(),
          body: bytes::Bytes::from(e.to_string()),
        }
      }
    },
  };

  let mut headers = response.headers.clone();
  headers.remove(header::TRANSFER_ENCODING);
  headers.remove(header::CONNECTION);
  headers.insert(
    header::CONTENT_LENGTH,
    HeaderValue::from_str(&response.body.len().to_string())
      .map_err(|e| Error::Http(http::Error::from(e)))?,
  );
  if close_requested {
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
  }
  let raw = codec::encode_response(response.version, response.status, &headers, &response.body);
  reader.get_mut().write_all(&raw).await?;
  reader.get_mut().flush().await?;
  Ok(!close_requested)
}

#[cfg(test)]
pub(crate) async fn test_shared(tag: &str) -> Arc<Shared> {
  test_shared_with(tag, true).await
}

#[cfg(test)]
pub(crate) async fn test_shared_with(tag: &str, wildcard_certs: bool) -> Arc<Shared> {
  let dir = std::env::temp_dir().join(tag);
  let _ = std::fs::remove_dir_all(&dir);
  let certs = Arc::new(CertificateManager::new(&dir).await.unwrap());
  let connector = Arc::new(Connector::new(false, Vec::new(), None).unwrap());
  Arc::new(Shared {
    bind_ip: IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
    plain_port: 0,
    certs,
    registry: ConnectRegistry::new(),
    pool: TlsServerPool::new(wildcard_certs),
    pipeline: Pipeline::new(Vec::new()),
    connector,
    observer: Arc::new(|e| tracing::error!("proxy error: {}", e)),
  })
}
