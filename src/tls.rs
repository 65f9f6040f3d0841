//! rustls configuration for both sides of the intercept

use crate::error::{Error, Result};
use std::sync::Arc;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
  ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore, ServerConfig,
  SignatureScheme,
};

pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(tokio_rustls::rustls::crypto::ring::default_provider()))
}

/// Server config for an ephemeral interception listener.
pub(crate) fn server_config(
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
  ServerConfig::builder_with_provider(crypto_provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls_error(format!("invalid TLS versions: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(cert_chain, key)
    .map_err(|e| Error::tls_error(format!("failed to create TLS config: {}", e)))
}

/// Client config for re-originated connections toward origins and upstreams.
///
/// With `verify` disabled any presented certificate is accepted, which is the
/// usual stance for an interception client. With `verify` enabled only the
/// given roots are trusted.
pub(crate) fn client_config(
  verify: bool,
  roots: Vec<CertificateDer<'static>>,
) -> Result<ClientConfig> {
  let builder = ClientConfig::builder_with_provider(crypto_provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls_error(format!("invalid TLS versions: {}", e)))?;
  let config = if verify {
    let mut store = RootCertStore::empty();
    for cert in roots {
      store
        .add(cert)
        .map_err(|e| Error::tls_error(format!("invalid root certificate: {}", e)))?;
    }
    builder.with_root_certificates(store).with_no_client_auth()
  } else {
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth()
  };
  Ok(config)
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TlsError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}
