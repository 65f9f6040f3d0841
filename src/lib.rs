#![deny(missing_docs)]

//! # tapwire
//!
//! A man-in-the-middle (MITM) HTTP/HTTPS/WebSocket intercepting proxy.
//!
//! A client points its proxy settings at the listening address; the proxy
//! terminates TLS toward the client with certificates minted by its own CA,
//! re-originates each request toward the true origin (optionally through an
//! HTTP, HTTPS, SOCKS or PAC-selected upstream proxy), and runs every
//! request/response pair through a middleware pipeline that may observe or
//! rewrite traffic.
//!
//! # Features
//!
//! - CONNECT dispatch with first-byte sniffing: TLS payloads are
//!   intercepted through a per-host ephemeral HTTPS listener pool with
//!   wildcard coalescing, anything else is spliced as a blind tunnel
//! - Automatic CA with persisted root and cached, wildcard-capable leaves
//! - Upstream chaining with PAC → SOCKS → HTTP(S) → direct precedence and
//!   SNI preservation on the PAC-DIRECT path
//! - WebSocket upgrades bridged frame-by-frame with close-code hygiene
//! - `(ctx, next)` middleware with built-in proxy resolution, summary
//!   logging and transparent gzip decoding
//!
//! # Example
//!
//! ```no_run
//! use tapwire::{MitmConfig, MitmProxy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let proxy = MitmProxy::new(MitmConfig::default()).await?;
//!   let handle = proxy.start("127.0.0.1:8080").await?;
//!   println!("trust this CA: {}", proxy.ca_cert_path().display());
//!   tokio::signal::ctrl_c().await?;
//!   handle.shutdown().await;
//!   Ok(())
//! }
//! ```

mod ca;
mod codec;
mod error;
mod host;
mod middleware;
/// Proxy auto-configuration support
pub mod pac;
mod pipeline;
mod pool;
mod proxy;
mod record;
mod registry;
mod server;
mod socket;
mod sysproxy;
mod tls;
mod upstream;
mod ws;

pub use ca::{CertificateAuthority, CertificateManager, MintedCert};
pub use error::{Error, Result};
pub use pipeline::{
  Context, InterceptedRequest, InterceptedResponse, Middleware, Next, Pipeline, Protocol,
};
pub use proxy::{ErrorObserver, MitmConfig, MitmProxy, ProxyHandle};
pub use record::{ProxyVia, RequestSummary};
pub use registry::{ConnectInfo, ConnectKey, ConnectRegistry};
pub use socket::MaybeTlsStream;
pub use sysproxy::{
  resolve_system_proxy, NoSystemProxy, SystemProxyDetector, UpstreamProxyConfig,
};
pub use upstream::{agent_from_uri, select_agent, Agent, Connector, HttpProxyAgent, SocksAgent};

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
