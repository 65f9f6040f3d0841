//! System upstream-proxy discovery
//!
//! Produces the per-request `{http, https, socks, pac}` upstream
//! configuration. OS-level configuration, when a detector provides one,
//! takes precedence over the `HTTP_PROXY`/`HTTPS_PROXY`/`ALL_PROXY`
//! environment variables. Resolution runs once per request so dynamic
//! changes take effect on the next request.

use http::Uri;

/// Upstream proxy configuration.
///
/// At most one of `pac | socks | protocol-matched http/https` is chosen per
/// request, in that priority order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpstreamProxyConfig {
  /// HTTP upstream, `http://host:port`
  pub http: Option<Uri>,
  /// HTTPS upstream, `https://host:port`
  pub https: Option<Uri>,
  /// SOCKS5 upstream, `socks://host:port`
  pub socks: Option<Uri>,
  /// PAC file URL, carried verbatim
  pub pac: Option<Uri>,
}

impl UpstreamProxyConfig {
  /// Whether no upstream is configured at all
  pub fn is_empty(&self) -> bool {
    self.http.is_none() && self.https.is_none() && self.socks.is_none() && self.pac.is_none()
  }
}

/// OS-level proxy configuration snapshot.
///
/// Implementations may consult platform APIs; fields they leave empty fall
/// back to the environment.
pub trait SystemProxyDetector: Send + Sync {
  /// Current OS proxy configuration
  fn snapshot(&self) -> UpstreamProxyConfig;
}

/// Detector that reports no OS-level configuration, leaving the
/// environment variables as the only source.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSystemProxy;

impl SystemProxyDetector for NoSystemProxy {
  fn snapshot(&self) -> UpstreamProxyConfig {
    UpstreamProxyConfig::default()
  }
}

/// Resolve the upstream configuration from the detector and process
/// environment.
pub fn resolve_system_proxy(detector: &dyn SystemProxyDetector) -> UpstreamProxyConfig {
  resolve_with_env(detector, |name| std::env::var(name).ok())
}

pub(crate) fn resolve_with_env<F>(
  detector: &dyn SystemProxyDetector,
  lookup: F,
) -> UpstreamProxyConfig
where
  F: Fn(&str) -> Option<String>,
{
  let os = detector.snapshot();
  let env_uri = |upper: &str, lower: &str| {
    lookup(upper)
      .or_else(|| lookup(lower))
      .filter(|v| !v.is_empty())
      .and_then(|v| match v.parse::<Uri>() {
        Ok(uri) => Some(uri),
        Err(e) => {
          tracing::debug!("ignoring unparsable {} value: {}", upper, e);
          None
        }
      })
  };
  UpstreamProxyConfig {
    http: os.http.or_else(|| env_uri("HTTP_PROXY", "http_proxy")),
    https: os.https.or_else(|| env_uri("HTTPS_PROXY", "https_proxy")),
    socks: os.socks.or_else(|| env_uri("ALL_PROXY", "all_proxy")),
    pac: os.pac,
  }
}
