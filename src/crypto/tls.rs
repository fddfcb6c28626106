//! TLS client configuration handed to authenticators
//!
//! The tunnel core never dials the gateway itself. Authenticators use
//! [`TlsConfig::connect`] to obtain the stream they authenticate on, and the
//! same stream later carries the tunnel.

use crate::error::{Result, VpnError};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Certificate verifier used when `skip_verify` is set
#[derive(Debug)]
struct AcceptAllVerifier;

impl ServerCertVerifier for AcceptAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
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
        ]
    }
}

/// Install the process-wide rustls crypto provider selected by features.
///
/// A provider installed earlier (by us or the embedding app) is kept.
fn install_crypto_provider() {
    #[cfg(feature = "ring-crypto")]
    {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    #[cfg(all(feature = "aws-lc-crypto", not(feature = "ring-crypto")))]
    {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }
}

fn webpki_root_store() -> RootCertStore {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    root_store
}

/// TLS configuration for gateway connections
#[derive(Clone)]
pub struct TlsConfig {
    client_config: Arc<ClientConfig>,
}

impl TlsConfig {
    /// Build a configuration, verifying certificates unless `skip_verify`
    pub fn new(skip_verify: bool) -> Result<Self> {
        install_crypto_provider();

        let client_config = if skip_verify {
            log::warn!("Server certificate verification is disabled");
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAllVerifier))
                .with_no_client_auth()
        } else {
            ClientConfig::builder()
                .with_root_certificates(webpki_root_store())
                .with_no_client_auth()
        };

        Ok(Self {
            client_config: Arc::new(client_config),
        })
    }

    /// Build a configuration presenting a client certificate
    pub fn with_certificate(cert_path: &str, key_path: &str) -> Result<Self> {
        install_crypto_provider();

        let cert_file = File::open(cert_path)
            .map_err(|e| VpnError::Config(format!("Cannot open certificate file: {e}")))?;
        let key_file = File::open(key_path)
            .map_err(|e| VpnError::Config(format!("Cannot open key file: {e}")))?;

        let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| VpnError::Config(format!("Invalid certificate: {e}")))?;
        if certs.is_empty() {
            return Err(VpnError::Config("No certificate found".into()));
        }

        let private_key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
            .map_err(|e| VpnError::Config(format!("Invalid private key: {e}")))?
            .ok_or_else(|| VpnError::Config("No private key found".into()))?;

        let client_config = ClientConfig::builder()
            .with_root_certificates(webpki_root_store())
            .with_client_auth_cert(certs, private_key)
            .map_err(|e| VpnError::Config(format!("TLS config error: {e}")))?;

        Ok(Self {
            client_config: Arc::new(client_config),
        })
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client_config.clone()
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.client_config.clone())
    }

    /// Dial `host:port` and complete the TLS handshake
    pub async fn connect(&self, host: &str, port: u16) -> Result<TlsStream<TcpStream>> {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| VpnError::Network(format!("TCP connection failed: {e}")))?;
        tcp.set_nodelay(true)?;

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| VpnError::Network(format!("Invalid hostname: {e}")))?;

        self.connector()
            .connect(server_name, tcp)
            .await
            .map_err(|e| VpnError::Tls(format!("TLS handshake failed: {e}")))
    }
}

/// Name of the negotiated cipher suite, e.g. `TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384`
pub fn cipher_suite_name(conn: &ClientConnection) -> String {
    conn.negotiated_cipher_suite()
        .map(|suite| format!("{:?}", suite.suite()))
        .unwrap_or_else(|| "Unknown".to_string())
}
