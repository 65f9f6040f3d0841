//! Stream wrapper for plain and TLS connections

use std::io::Error;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// A connection that may be wrapped in TLS any number of times.
///
/// The nesting covers the TLS-in-TLS case of an `https://` upstream proxy
/// carrying an HTTPS CONNECT tunnel.
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// Plain TCP
  Tcp(TcpStream),
  /// TLS over another stream
  Tls(Box<TlsStream<MaybeTlsStream>>),
}

impl From<TcpStream> for MaybeTlsStream {
  fn from(stream: TcpStream) -> Self {
    MaybeTlsStream::Tcp(stream)
  }
}

impl From<TlsStream<MaybeTlsStream>> for MaybeTlsStream {
  fn from(stream: TlsStream<MaybeTlsStream>) -> Self {
    MaybeTlsStream::Tls(Box::new(stream))
  }
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
      MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
      MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(s) => Pin::new(s).poll_flush(cx),
      MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
      MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
    }
  }
}
