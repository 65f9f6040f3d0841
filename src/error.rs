//! Error types for the intercepting proxy

use std::io;
use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for proxy operations
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// Certificate mint or load error
  #[error("Certificate error: {0}")]
  Certificate(String),

  /// TLS configuration or ephemeral listener error
  #[error("TLS error: {0}")]
  Tls(String),

  /// HTTP building error
  #[error("HTTP error: {0}")]
  Http(http::Error),

  /// Malformed request-target or missing Host
  #[error("Protocol error: {0}")]
  Protocol(String),

  /// Chosen upstream proxy cannot be reached or PAC evaluation failed
  #[error("Upstream unavailable: {0}")]
  Upstream(String),

  /// Error thrown from user middleware
  #[error("Middleware error: {0}")]
  Middleware(String),

  /// Other errors
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("Certificate error: {}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::error!("TLS error: {}", error);
    error
  }

  /// Create a protocol error and log it
  pub fn protocol_error(msg: impl Into<String>) -> Self {
    let error = Error::Protocol(msg.into());
    tracing::error!("Protocol error: {}", error);
    error
  }

  /// Create an upstream-unavailable error and log it
  pub fn upstream_unavailable(msg: impl Into<String>) -> Self {
    let error = Error::Upstream(msg.into());
    tracing::error!("Upstream unavailable: {}", error);
    error
  }

  /// Create a middleware error and log it
  pub fn middleware_error(msg: impl Into<String>) -> Self {
    let error = Error::Middleware(msg.into());
    tracing::error!("Middleware error: {}", error);
    error
  }

  /// Create an other error and log it
  pub fn other(msg: impl Into<String>) -> Self {
    let error = Error::Other(msg.into());
    tracing::error!("Error: {}", error);
    error
  }

  /// Whether this error is a connection reset, which the proxy absorbs silently
  pub fn is_connection_reset(&self) -> bool {
    matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::ConnectionReset)
  }

  /// HTTP status used when this error terminates a response
  pub fn response_status(&self) -> http::StatusCode {
    match self {
      Error::Protocol(_) | Error::Http(_) => http::StatusCode::BAD_REQUEST,
      Error::Middleware(_) | Error::Other(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
      Error::Io(_) | Error::Certificate(_) | Error::Tls(_) | Error::Upstream(_) => {
        http::StatusCode::BAD_GATEWAY
      }
    }
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    Error::Io(value)
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    let error = Error::Http(value);
    tracing::error!("HTTP error: {}", error);
    error
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}
