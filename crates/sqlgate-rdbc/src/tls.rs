//! TLS configuration for PostgreSQL connections
//!
//! Three transport-security variants are supported:
//! - `Disable`: plain TCP
//! - `Insecure`: encrypted, server certificate not verified
//! - `Verify`: encrypted, server certificate verified against a CA file or
//!   the webpki roots, optionally presenting a client certificate

use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::ClientConfig;

use crate::error::{Error, Result};

/// Verification parameters for [`TlsMode::Verify`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TlsVerify {
    /// CA certificate bundle (PEM); webpki roots when unset
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate (PEM) for mutual TLS
    pub client_cert_path: Option<PathBuf>,
    /// Client private key (PEM); required with `client_cert_path`
    pub client_key_path: Option<PathBuf>,
}

/// Transport security for one target
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum TlsMode {
    /// No TLS
    #[default]
    Disable,
    /// TLS without certificate verification
    Insecure,
    /// TLS with certificate verification
    Verify(TlsVerify),
}

impl TlsMode {
    /// Check if TLS is enabled
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disable)
    }

    /// Check if the server certificate is verified
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verify(_))
    }

    /// Short name used in summaries and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Insecure => "insecure",
            Self::Verify(_) => "verify",
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if let Self::Verify(verify) = self {
            if verify.client_cert_path.is_some() && verify.client_key_path.is_none() {
                return Err(
                    "client key path required when client certificate is specified".to_string(),
                );
            }
            if verify.client_key_path.is_some() && verify.client_cert_path.is_none() {
                return Err(
                    "client certificate path required when client key is specified".to_string(),
                );
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for TlsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build a rustls ClientConfig for an enabled mode; `None` for `Disable`
pub fn build_rustls_config(mode: &TlsMode) -> Result<Option<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::config(format!("TLS protocol setup failed: {e}")))?;

    let config = match mode {
        TlsMode::Disable => return Ok(None),
        TlsMode::Insecure => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification::new(
                provider,
            )))
            .with_no_client_auth(),
        TlsMode::Verify(verify) => {
            let mut root_store = rustls::RootCertStore::empty();
            match &verify.ca_cert_path {
                Some(ca_path) => {
                    for cert in load_certs(ca_path)? {
                        root_store
                            .add(cert)
                            .map_err(|e| Error::config(format!("failed to add CA cert: {e}")))?;
                    }
                }
                None => root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
            }

            let builder = builder.with_root_certificates(root_store);
            match (&verify.client_cert_path, &verify.client_key_path) {
                (Some(cert_path), Some(key_path)) => {
                    let certs = load_certs(cert_path)?;
                    let key_file = std::fs::File::open(key_path).map_err(|e| {
                        Error::config(format!(
                            "failed to open client key {}: {e}",
                            key_path.display()
                        ))
                    })?;
                    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
                        .map_err(|e| Error::config(format!("failed to parse client key: {e}")))?
                        .ok_or_else(|| Error::config("no private key found in client key file"))?;
                    builder
                        .with_client_auth_cert(certs, key)
                        .map_err(|e| Error::config(format!("failed to set client auth: {e}")))?
                }
                _ => builder.with_no_client_auth(),
            }
        }
    };

    Ok(Some(config))
}

/// Create a MakeRustlsConnect for tokio-postgres; `None` for `Disable`
pub fn make_tls_connector(
    mode: &TlsMode,
) -> Result<Option<tokio_postgres_rustls::MakeRustlsConnect>> {
    Ok(build_rustls_config(mode)?.map(tokio_postgres_rustls::MakeRustlsConnect::new))
}

fn load_certs(path: &PathBuf) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path).map_err(|e| {
        Error::config(format!("failed to open certificate {}: {e}", path.display()))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::config(format!("failed to parse certificates: {e}")))?;
    if certs.is_empty() {
        return Err(Error::config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};
    use std::sync::Arc;

    #[derive(Debug)]
    pub struct NoCertificateVerification(Arc<CryptoProvider>);

    impl NoCertificateVerification {
        pub fn new(provider: Arc<CryptoProvider>) -> Self {
            Self(provider)
        }
    }

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_mode_helpers() {
        assert!(!TlsMode::Disable.is_enabled());
        assert!(TlsMode::Insecure.is_enabled());
        assert!(!TlsMode::Insecure.is_verified());
        assert!(TlsMode::Verify(TlsVerify::default()).is_verified());
        assert_eq!(TlsMode::Insecure.to_string(), "insecure");
    }

    #[test]
    fn test_client_cert_needs_key() {
        let mode = TlsMode::Verify(TlsVerify {
            client_cert_path: Some(PathBuf::from("/path/to/cert.pem")),
            ..Default::default()
        });
        assert!(mode.validate().is_err());

        let mode = TlsMode::Verify(TlsVerify {
            client_cert_path: Some(PathBuf::from("/path/to/cert.pem")),
            client_key_path: Some(PathBuf::from("/path/to/key.pem")),
            ..Default::default()
        });
        assert!(mode.validate().is_ok());
    }

    #[test]
    fn test_build_config_per_mode() {
        assert!(build_rustls_config(&TlsMode::Disable).unwrap().is_none());
        assert!(build_rustls_config(&TlsMode::Insecure).unwrap().is_some());
        assert!(build_rustls_config(&TlsMode::Verify(TlsVerify::default()))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_missing_ca_file_is_config_error() {
        let mode = TlsMode::Verify(TlsVerify {
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        });
        let err = build_rustls_config(&mode).unwrap_err();
        assert!(err.to_string().contains("failed to open certificate"));
    }
}
