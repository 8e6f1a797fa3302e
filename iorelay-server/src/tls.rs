//! TLS material and acceptor construction.

use crate::config::TlsConfig;
use crate::error::ServerError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Server certificate chain and private key.
pub struct Certificates {
    pub chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Certificates {
    pub fn new(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { chain, key }
    }

    /// Returns a copy of the private key.
    pub fn key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }
}

impl std::fmt::Debug for Certificates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificates")
            .field("chain_len", &self.chain.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

/// TLS options beyond the server certificate.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Require and verify client certificates.
    pub require_client_cert: bool,
    /// Trust anchors for client certificates.
    pub client_ca: Vec<CertificateDer<'static>>,
}

/// Loads the server certificate and key named by the configuration.
pub fn load_certificates(config: &TlsConfig) -> Result<Certificates, ServerError> {
    let cert_path = config
        .cert_path
        .as_ref()
        .ok_or_else(|| ServerError::TlsConfig("cert_path not set".into()))?;
    let key_path = config
        .key_path
        .as_ref()
        .ok_or_else(|| ServerError::TlsConfig("key_path not set".into()))?;

    let chain = load_certs(cert_path)?;
    if chain.is_empty() {
        return Err(ServerError::TlsConfig(format!(
            "no certificates found in {:?}",
            cert_path
        )));
    }
    let key = load_private_key(key_path)?;
    Ok(Certificates::new(chain, key))
}

/// Loads mTLS options from the configuration.
pub fn load_tls_options(config: &TlsConfig) -> Result<TlsOptions, ServerError> {
    if !config.require_client_cert {
        return Ok(TlsOptions::default());
    }
    let ca_path = config
        .client_ca_path
        .as_ref()
        .ok_or_else(|| ServerError::TlsConfig("client_ca_path not set for mTLS".into()))?;
    Ok(TlsOptions {
        require_client_cert: true,
        client_ca: load_certs(ca_path)?,
    })
}

/// Builds a TLS acceptor from loaded material.
pub fn create_tls_acceptor(
    certificates: &Certificates,
    options: &TlsOptions,
) -> Result<TlsAcceptor, ServerError> {
    let builder = rustls::ServerConfig::builder();

    let server_config = if options.require_client_cert {
        if options.client_ca.is_empty() {
            return Err(ServerError::TlsConfig(
                "client certificates required but no client CA loaded".into(),
            ));
        }
        let mut root_store = RootCertStore::empty();
        for cert in &options.client_ca {
            root_store
                .add(cert.clone())
                .map_err(|e| ServerError::TlsConfig(format!("invalid client CA cert: {}", e)))?;
        }

        let client_verifier = WebPkiClientVerifier::builder(Arc::new(root_store))
            .build()
            .map_err(|e| {
                ServerError::TlsConfig(format!("failed to build client verifier: {}", e))
            })?;

        builder
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(certificates.chain.clone(), certificates.key())
    } else {
        builder
            .with_no_client_auth()
            .with_single_cert(certificates.chain.clone(), certificates.key())
    }
    .map_err(|e| ServerError::TlsConfig(format!("invalid server cert/key: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let file = File::open(path)
        .map_err(|e| ServerError::TlsConfig(format!("cannot open cert file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let file = File::open(path)
        .map_err(|e| ServerError::TlsConfig(format!("cannot open key file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| ServerError::TlsConfig(format!("invalid key file {:?}: {}", path, e)))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => {
                return Err(ServerError::TlsConfig(format!(
                    "no private key found in {:?}",
                    path
                )))
            }
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_invalid_cert_path() {
        let result = load_certs(Path::new("/nonexistent/cert.pem"));
        assert!(result.unwrap_err().to_string().contains("cannot open"));
    }

    #[test]
    fn test_load_empty_key_file() {
        let mut key_file = NamedTempFile::new().unwrap();
        key_file.write_all(b"not a valid key").unwrap();

        let result = load_private_key(key_file.path());
        assert!(result.unwrap_err().to_string().contains("no private key"));
    }

    #[test]
    fn test_load_certificates_missing_paths() {
        let config = TlsConfig {
            enabled: true,
            cert_path: None,
            key_path: Some("/some/key.pem".into()),
            ..Default::default()
        };
        let err = load_certificates(&config).unwrap_err();
        assert!(err.to_string().contains("cert_path not set"));

        let config = TlsConfig {
            enabled: true,
            cert_path: Some("/some/cert.pem".into()),
            key_path: None,
            ..Default::default()
        };
        let err = load_certificates(&config).unwrap_err();
        assert!(err.to_string().contains("key_path not set"));
    }

    #[test]
    fn test_load_certificates_empty_chain() {
        let mut cert_file = NamedTempFile::new().unwrap();
        cert_file.write_all(b"# nothing here\n").unwrap();

        let config = TlsConfig {
            enabled: true,
            cert_path: Some(cert_file.path().to_path_buf()),
            key_path: Some("/some/key.pem".into()),
            ..Default::default()
        };
        let err = load_certificates(&config).unwrap_err();
        assert!(err.to_string().contains("no certificates found"));
    }

    #[test]
    fn test_tls_options_without_mtls() {
        let options = load_tls_options(&TlsConfig::default()).unwrap();
        assert!(!options.require_client_cert);
        assert!(options.client_ca.is_empty());
    }

    #[test]
    fn test_tls_options_mtls_missing_ca() {
        let config = TlsConfig {
            enabled: true,
            require_client_cert: true,
            ..Default::default()
        };
        let err = load_tls_options(&config).unwrap_err();
        assert!(err.to_string().contains("client_ca_path not set"));
    }

    #[test]
    fn test_acceptor_rejects_mtls_without_ca() {
        let certificates = Certificates::new(
            vec![CertificateDer::from(vec![0u8; 4])],
            PrivateKeyDer::Pkcs8(vec![0u8; 4].into()),
        );
        let options = TlsOptions {
            require_client_cert: true,
            client_ca: Vec::new(),
        };
        match create_tls_acceptor(&certificates, &options) {
            Err(e) => assert!(e.to_string().contains("no client CA loaded")),
            Ok(_) => panic!("expected error"),
        }
    }

    #[test]
    fn test_acceptor_rejects_garbage_key() {
        let certificates = Certificates::new(
            vec![CertificateDer::from(vec![0u8; 4])],
            PrivateKeyDer::Pkcs8(vec![0u8; 4].into()),
        );
        match create_tls_acceptor(&certificates, &TlsOptions::default()) {
            Err(e) => assert!(e.to_string().contains("invalid server cert/key")),
            Ok(_) => panic!("expected error"),
        }
    }
}
