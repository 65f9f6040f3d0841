//! WebSocket bridging
//!
//! Upgrades on an intercepted listener are peeled off the HTTP serving loop
//! and bridged to a fresh upstream WebSocket connection. The upstream
//! handshake is completed first, then the client handshake, so the client
//! socket stays paused until the upstream is open. Handshake headers in the
//! `sec-websocket*` family are never forwarded; they are regenerated on the
//! upstream side.

use crate::codec::RequestHead;
use crate::error::{Error, Result};
use crate::pipeline::Protocol;
use crate::registry::ConnectInfo;
use crate::server::Shared;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, WebSocketStream};

/// Remap reserved close codes before they reach the wire.
///
/// 1004 through 1006 must never be sent in a close frame; a peer reporting
/// one is translated to 1001 (going away).
pub(crate) fn normalize_close(frame: CloseFrame<'static>) -> CloseFrame<'static> {
  let code = u16::from(frame.code);
  if (1004..=1006).contains(&code) {
    CloseFrame {
      code: CloseCode::from(1001),
      reason: frame.reason,
    }
  } else {
    frame
  }
}

fn upstream_url(head: &RequestHead, protocol: Protocol) -> Result<String> {
  if !head.target.starts_with('/') {
    return Ok(head.target.clone());
  }
  let host = head
    .headers
    .get(http::header::HOST)
    .and_then(|v| v.to_str().ok())
    .ok_or_else(|| Error::protocol_error("websocket upgrade without Host header"))?;
  let scheme = match protocol {
    Protocol::Https => "wss",
    Protocol::Http => "ws",
  };
  Ok(format!("{}://{}{}", scheme, host, head.target))
}

/// Bridge an intercepted upgrade to the upstream WebSocket.
pub(crate) async fn bridge<S>(
  mut client: S,
  head: RequestHead,
  protocol: Protocol,
  connect: Option<ConnectInfo>,
  shared: &Shared,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  let client_key = head
    .headers
    .get("sec-websocket-key")
    .and_then(|v| v.to_str().ok())
    .map(str::to_string)
    .ok_or_else(|| Error::protocol_error("websocket upgrade without Sec-WebSocket-Key"))?;

  let mut url = upstream_url(&head, protocol)?;
  // a tunneled upgrade targets the CONNECT's original host
  if let Some(info) = &connect {
    if head.target.starts_with('/') {
      let scheme = match protocol {
        Protocol::Https => "wss",
        Protocol::Http => "ws",
      };
      url = format!("{}://{}:{}{}", scheme, info.host, info.port, head.target);
    }
  }

  let mut builder = http::Request::builder()
    .method(http::Method::GET)
    .uri(&url)
    .header(http::header::CONNECTION, "Upgrade")
    .header(http::header::UPGRADE, "websocket")
    .header(http::header::SEC_WEBSOCKET_VERSION, "13")
    .header(http::header::SEC_WEBSOCKET_KEY, generate_key());
  for (name, value) in head.headers.iter() {
    let lower = name.as_str();
    if lower.starts_with("sec-websocket")
      || lower == "connection"
      || lower == "upgrade"
      || lower == "host"
    {
      continue;
    }
    builder = builder.header(name, value);
  }
  let host = url
    .split("://")
    .nth(1)
    .and_then(|rest| rest.split('/').next())
    .unwrap_or_default()
    .to_string();
  builder = builder.header(http::header::HOST, host);
  let request = builder.body(())?;

  let connector = Connector::Rustls(shared.connector.client_config());
  let (upstream_ws, upstream_response) =
    match connect_async_tls_with_config(request, None, false, Some(connector)).await {
      Ok(pair) => pair,
      Err(e) => {
        client
          .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
          .await
          .ok();
        return Err(Error::upstream_unavailable(format!(
          "websocket upstream {} failed: {}",
          url, e
        )));
      }
    };

  // upstream is open; complete the client handshake
  let accept_key = derive_accept_key(client_key.as_bytes());
  let mut response = format!(
    "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n",
    accept_key
  );
  if let Some(proto) = upstream_response
    .headers()
    .get("sec-websocket-protocol")
    .and_then(|v| v.to_str().ok())
  {
    response.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", proto));
  }
  response.push_str("\r\n");
  client.write_all(response.as_bytes()).await?;
  client.flush().await?;

  let client_ws = WebSocketStream::from_raw_socket(client, Role::Server, None).await;
  let (mut client_tx, mut client_rx) = client_ws.split();
  let (mut upstream_tx, mut upstream_rx) = upstream_ws.split();

  // only the first close is authoritative
  let closed_by_client = AtomicBool::new(false);
  let closed_by_server = AtomicBool::new(false);

  let client_to_upstream = async {
    while let Some(message) = client_rx.next().await {
      match message {
        Ok(Message::Close(frame)) => {
          if !closed_by_server.load(Ordering::SeqCst) {
            closed_by_client.store(true, Ordering::SeqCst);
            let _ = upstream_tx
              .send(Message::Close(frame.map(normalize_close)))
              .await;
          }
          break;
        }
        Ok(message) => {
          if closed_by_server.load(Ordering::SeqCst) {
            break;
          }
          if upstream_tx.send(message).await.is_err() {
            break;
          }
        }
        Err(e) => {
          tracing::debug!("websocket client receive error: {}", e);
          break;
        }
      }
    }
    let _ = upstream_tx.close().await;
  };

  let upstream_to_client = async {
    while let Some(message) = upstream_rx.next().await {
      match message {
        Ok(Message::Close(frame)) => {
          if !closed_by_client.load(Ordering::SeqCst) {
            closed_by_server.store(true, Ordering::SeqCst);
            let _ = client_tx
              .send(Message::Close(frame.map(normalize_close)))
              .await;
          }
          break;
        }
        Ok(message) => {
          if closed_by_client.load(Ordering::SeqCst) {
            break;
          }
          if client_tx.send(message).await.is_err() {
            break;
          }
        }
        Err(e) => {
          tracing::debug!("websocket upstream receive error: {}", e);
          break;
        }
      }
    }
    let _ = client_tx.close().await;
  };

  tokio::join!(client_to_upstream, upstream_to_client);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::borrow::Cow;

  fn frame(code: u16) -> CloseFrame<'static> {
    CloseFrame {
      code: CloseCode::from(code),
      reason: Cow::Borrowed("bye"),
    }
  }

  #[test]
  fn test_reserved_codes_map_to_1001() {
    for code in 1004..=1006 {
      let mapped = normalize_close(frame(code));
      assert_eq!(u16::from(mapped.code), 1001, "code {} must map to 1001", code);
      assert_eq!(mapped.reason, "bye");
    }
  }

  #[test]
  fn test_ordinary_codes_pass_through() {
    for code in [1000, 1001, 1002, 1003, 1007, 3000] {
      let mapped = normalize_close(frame(code));
      assert_eq!(u16::from(mapped.code), code);
    }
  }
}
