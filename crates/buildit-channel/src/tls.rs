//! Certificate material and rustls configuration.
//!
//! Both sides of the channel authenticate: the master presents its
//! certificate and only accepts workers whose certificate chains to the
//! configured CA bundle. There is no plaintext fallback.

use buildit_config::TlsPaths;
use rustls::crypto::{CryptoProvider, ring};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use zeroize::Zeroizing;

use crate::ChannelError;

/// PEM certificate chain, private key and trusted CA bundle.
#[derive(Clone)]
pub struct TlsMaterial {
    cert_pem: Vec<u8>,
    key_pem: Zeroizing<Vec<u8>>,
    ca_pem: Vec<u8>,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("cert_pem", &format_args!("{} bytes", self.cert_pem.len()))
            .field("key_pem", &"<redacted>")
            .field("ca_pem", &format_args!("{} bytes", self.ca_pem.len()))
            .finish()
    }
}

impl TlsMaterial {
    pub fn from_pem(
        cert_pem: impl Into<Vec<u8>>,
        key_pem: impl Into<Vec<u8>>,
        ca_pem: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            cert_pem: cert_pem.into(),
            key_pem: Zeroizing::new(key_pem.into()),
            ca_pem: ca_pem.into(),
        }
    }

    /// Read the three PEM files. Every path must be set.
    pub fn load(paths: &TlsPaths) -> Result<Self, ChannelError> {
        let (cert, key, ca) = paths.require()?;
        Ok(Self {
            cert_pem: read(cert)?,
            key_pem: Zeroizing::new(read(key)?),
            ca_pem: read(ca)?,
        })
    }

    /// Server side: present our certificate, require a client certificate
    /// signed by the trusted CA.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, ChannelError> {
        let provider = provider();
        let roots = Arc::new(self.root_store()?);
        let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider.clone())
            .build()
            .map_err(|e| ChannelError::TlsConfig(format!("client verifier: {e}")))?;

        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ChannelError::TlsConfig(e.to_string()))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.chain()?, self.key()?)
            .map_err(|e| ChannelError::TlsConfig(format!("server certificate: {e}")))?;
        Ok(Arc::new(config))
    }

    /// Client side, as used by workers: trust the CA bundle and present our
    /// certificate.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, ChannelError> {
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| ChannelError::TlsConfig(e.to_string()))?
            .with_root_certificates(self.root_store()?)
            .with_client_auth_cert(self.chain()?, self.key()?)
            .map_err(|e| ChannelError::TlsConfig(format!("client certificate: {e}")))?;
        Ok(Arc::new(config))
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor, ChannelError> {
        Ok(TlsAcceptor::from(self.server_config()?))
    }

    pub fn connector(&self) -> Result<TlsConnector, ChannelError> {
        Ok(TlsConnector::from(self.client_config()?))
    }

    fn root_store(&self) -> Result<RootCertStore, ChannelError> {
        let cas = parse_certificates(&self.ca_pem)?;
        if cas.is_empty() {
            return Err(ChannelError::Certificate("no CA certificates found".into()));
        }
        let mut roots = RootCertStore::empty();
        for ca in cas {
            roots
                .add(ca)
                .map_err(|e| ChannelError::Certificate(format!("invalid CA certificate: {e}")))?;
        }
        Ok(roots)
    }

    fn chain(&self) -> Result<Vec<CertificateDer<'static>>, ChannelError> {
        let chain = parse_certificates(&self.cert_pem)?;
        if chain.is_empty() {
            return Err(ChannelError::Certificate("no certificates found".into()));
        }
        Ok(chain)
    }

    fn key(&self) -> Result<PrivateKeyDer<'static>, ChannelError> {
        PrivateKeyDer::from_pem_slice(&self.key_pem)
            .map_err(|e| ChannelError::PrivateKey(format!("failed to parse private key: {e}")))
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn read(path: &Path) -> Result<Vec<u8>, ChannelError> {
    std::fs::read(path).map_err(|source| ChannelError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, ChannelError> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ChannelError::Certificate(format!("failed to parse certificates: {e}")))
}
