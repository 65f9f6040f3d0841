//! Certificate authority for the interception listeners
//!
//! A root certificate is kept as a PEM pair under the storage directory
//! and reused across runs; unreadable or corrupt state is discarded and a
//! fresh root takes its place, since clients have to re-trust a changed
//! root either way. Leaves are minted on demand and may cover a wildcard
//! class in addition to the concrete hostname, so one ephemeral listener
//! can serve every host in the class.

use crate::error::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DnType, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Persisted root certificate, installed into client trust stores
const ROOT_CERT_FILE: &str = "root-cert.pem";
/// Persisted root key
const ROOT_KEY_FILE: &str = "root-key.pem";
/// Validity window of minted leaves
const LEAF_TTL: Duration = Duration::days(365);
/// Validity window of the root
const ROOT_TTL: Duration = Duration::days(3650);
/// Leaf backdating to absorb clock skew between proxy and client
const CLOCK_SKEW: Duration = Duration::minutes(1);
/// Minted leaves kept in memory at once
const LEAF_CACHE_CAPACITY: u64 = 512;

/// A minted key and certificate chain, `[leaf, root]`.
pub type MintedCert = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

/// Root certificate authority
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  root_der: CertificateDer<'static>,
  storage_path: PathBuf,
}

impl CertificateAuthority {
  /// Open the CA at `storage_path`, reusing a persisted root when one is
  /// there and usable, and minting a fresh root otherwise.
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();
    fs::create_dir_all(&storage_path).await?;
    let (issuer, root_der) = match Self::reload(&storage_path).await {
      Some(root) => root,
      None => Self::create(&storage_path).await?,
    };
    Ok(Self {
      issuer,
      root_der,
      storage_path,
    })
  }

  /// Pick up a previously persisted root. Returns `None` on any missing,
  /// unreadable or unparsable state; the caller regenerates over it.
  async fn reload(dir: &Path) -> Option<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let cert_pem = fs::read_to_string(dir.join(ROOT_CERT_FILE)).await.ok()?;
    let key_pem = fs::read_to_string(dir.join(ROOT_KEY_FILE)).await.ok()?;
    let root_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()?
      .ok()?;
    let key = KeyPair::from_pem(&key_pem).ok()?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key).ok()?;
    tracing::debug!("reusing persisted proxy root from {}", dir.display());
    Some((issuer, root_der))
  }

  /// Mint a new root and persist it, replacing whatever was in the
  /// directory.
  async fn create(dir: &Path) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let key = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("root key generation failed: {}", e)))?;

    let mut params = CertificateParams::default();
    params
      .distinguished_name
      .push(DnType::CommonName, "Tapwire Proxy CA");
    params
      .distinguished_name
      .push(DnType::OrganizationName, "Tapwire");
    // this root only ever signs end-entity leaves
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - CLOCK_SKEW;
    params.not_after = now + ROOT_TTL;

    let cert = params
      .self_signed(&key)
      .map_err(|e| Error::certificate_error(format!("root self-signing failed: {}", e)))?;
    let cert_pem = cert.pem();
    fs::write(dir.join(ROOT_CERT_FILE), &cert_pem).await?;
    fs::write(dir.join(ROOT_KEY_FILE), key.serialize_pem()).await?;
    tracing::info!("minted a new proxy root in {}", dir.display());

    let root_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key)
      .map_err(|e| Error::certificate_error(format!("root is unusable as issuer: {}", e)))?;
    Ok((issuer, root_der))
  }

  /// Mint a leaf certificate covering every name in `names`.
  ///
  /// The first name becomes the common name; each name is added as a DNS or
  /// IP subject alternative name. Wildcard names (`*.suffix`) are accepted.
  pub fn mint(&self, names: &[String]) -> Result<MintedCert> {
    let primary = names
      .first()
      .ok_or_else(|| Error::certificate_error("mint called without names"))?;
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());
    params
      .distinguished_name
      .push(DnType::CommonName, primary.as_str());

    let mut sans = Vec::new();
    for name in names {
      if let Ok(ip) = name.parse::<IpAddr>() {
        sans.push(SanType::IpAddress(ip));
      }
      // a DNS SAN for the textual form as well; some clients check only
      // dNSName even for IP targets
      if let Ok(dns_name) = name.as_str().try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
    }
    if sans.is_empty() {
      return Err(Error::certificate_error(format!(
        "no usable subject name in {:?}",
        names
      )));
    }
    params.subject_alt_names = sans;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - CLOCK_SKEW;
    params.not_after = now + LEAF_TTL;

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("leaf key generation failed: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("leaf signing failed: {}", e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate_error("failed to serialize leaf key"))?;
    Ok((vec![cert_der, self.root_der.clone()], key_der))
  }

  /// CA certificate in PEM format for client trust-store installation
  pub fn ca_cert_pem(&self) -> Result<String> {
    std::fs::read_to_string(self.ca_cert_path())
      .map_err(|e| Error::certificate_error(format!("failed to read root cert: {}", e)))
  }

  /// Path of the persisted CA certificate
  pub fn ca_cert_path(&self) -> PathBuf {
    self.storage_path.join(ROOT_CERT_FILE)
  }
}

/// Caching wrapper over [`CertificateAuthority`]
pub struct CertificateManager {
  ca: CertificateAuthority,
  leaf_cache: Cache<String, Arc<MintedCert>>,
}

impl CertificateManager {
  /// Create a manager with the CA at the given storage path.
  ///
  /// Cached leaves are dropped halfway through their validity window, so a
  /// re-minted leaf is always comfortably inside its own.
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let half_life = std::time::Duration::from_secs(LEAF_TTL.whole_seconds() as u64 / 2);
    Ok(Self {
      ca: CertificateAuthority::new(storage_path).await?,
      leaf_cache: Cache::builder()
        .max_capacity(LEAF_CACHE_CAPACITY)
        .time_to_live(half_life)
        .build(),
    })
  }

  /// Get or mint the leaf for `cache_key`, covering `names`.
  ///
  /// The cache key is the pool key the listener is stored under (a concrete
  /// hostname or its wildcard class).
  pub async fn leaf_for(&self, cache_key: &str, names: &[String]) -> Result<MintedCert> {
    if let Some(cached) = self.leaf_cache.get(cache_key).await {
      let (chain, key) = cached.as_ref();
      return Ok((chain.clone(), key.clone_key()));
    }
    let (chain, key) = self.ca.mint(names)?;
    self
      .leaf_cache
      .insert(cache_key.to_string(), Arc::new((chain.clone(), key.clone_key())))
      .await;
    Ok((chain, key))
  }

  /// CA certificate in PEM format
  pub fn ca_cert_pem(&self) -> Result<String> {
    self.ca.ca_cert_pem()
  }

  /// Path of the persisted CA certificate
  pub fn ca_cert_path(&self) -> PathBuf {
    self.ca.ca_cert_path()
  }
}
