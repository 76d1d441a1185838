//! # TLS Layer
//!
//! Client side TLS for the stream upgrade the core agrees to during
//! negotiation. The TCP connection already exists at that point, so this
//! module only builds the rustls configuration and wraps a stream.
//!
//! ## Trust Modes
//! - **System roots** plus an optional extra CA file (default)
//! - **Pinned**: accept exactly one certificate, by SHA-256 fingerprint.
//!   Quassel cores usually run with self-signed certificates, so this is the
//!   practical way to verify them.
//! - **Insecure**: accept anything. Testing only.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, RootCertStore, ServerName};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument, warn};

use crate::config::TlsConfig;
use crate::error::{ProtocolError, Result};

/// What was negotiated on an upgraded stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    pub protocol_version: String,
    pub cipher_suite: String,
    /// Hex SHA-256 of the core's end-entity certificate
    pub peer_cert_sha256: Option<String>,
}

impl TlsInfo {
    pub fn from_stream<S>(stream: &TlsStream<S>) -> Self {
        let (_, connection) = stream.get_ref();
        Self {
            protocol_version: connection
                .protocol_version()
                .map(|v| format!("{v:?}"))
                .unwrap_or_default(),
            cipher_suite: connection
                .negotiated_cipher_suite()
                .map(|s| format!("{:?}", s.suite()))
                .unwrap_or_default(),
            peer_cert_sha256: connection
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| to_hex(&TlsClientConfig::calculate_cert_hash(cert))),
        }
    }
}

pub struct TlsClientConfig {
    server_name: String,
    insecure: bool,
    pinned_cert_hash: Option<Vec<u8>>,
    ca_file: Option<String>,
}

impl TlsClientConfig {
    pub fn new<S: Into<String>>(server_name: S) -> Self {
        Self {
            server_name: server_name.into(),
            insecure: false,
            pinned_cert_hash: None,
            ca_file: None,
        }
    }

    /// Build from the `[tls]` section, using `default_host` when no explicit
    /// server name is configured.
    pub fn from_config(config: &TlsConfig, default_host: &str) -> Result<Self> {
        let mut tls = Self::new(
            config
                .server_name
                .clone()
                .unwrap_or_else(|| default_host.to_owned()),
        );
        if let Some(pin) = &config.pinned_sha256 {
            tls = tls.with_pinned_cert_hash(parse_fingerprint(pin)?);
        }
        if let Some(ca_file) = &config.ca_file {
            tls = tls.with_ca_file(ca_file.clone());
        }
        if config.insecure {
            tls = tls.insecure();
        }
        Ok(tls)
    }

    /// Skip certificate verification entirely.
    pub fn insecure(mut self) -> Self {
        warn!("INSECURE MODE ENABLED: Certificate verification is disabled. This should only be used for development/testing.");
        self.insecure = true;
        self
    }

    /// Accept only the certificate whose SHA-256 is `hash`.
    pub fn with_pinned_cert_hash(mut self, hash: Vec<u8>) -> Self {
        if hash.len() != 32 {
            warn!(
                "Certificate hash has unexpected length: {} (expected 32 bytes for SHA-256)",
                hash.len()
            );
        }
        self.pinned_cert_hash = Some(hash);
        self
    }

    /// Trust the CA certificates in a PEM file on top of the system roots.
    pub fn with_ca_file<S: Into<String>>(mut self, path: S) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    pub fn calculate_cert_hash(cert: &Certificate) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(&cert.0);
        hasher.finalize().to_vec()
    }

    pub fn load_client_config(&self) -> Result<ClientConfig> {
        let builder = ClientConfig::builder().with_safe_defaults();

        // A pin is stricter than any CA, it takes precedence.
        if let Some(hash) = &self.pinned_cert_hash {
            debug!("Using pinned certificate verification");
            return Ok(builder
                .with_custom_certificate_verifier(Arc::new(CertificateFingerprint {
                    fingerprint: hash.clone(),
                }))
                .with_no_client_auth());
        }

        if self.insecure {
            return Ok(builder
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
                .with_no_client_auth());
        }

        let mut root_store = RootCertStore::empty();
        let native_certs = rustls_native_certs::load_native_certs()
            .map_err(|e| ProtocolError::TlsError(format!("Failed to load native certs: {e}")))?;
        let native: Vec<Vec<u8>> = native_certs.into_iter().map(|c| c.0).collect();
        let (added, ignored) = root_store.add_parsable_certificates(&native[..]);
        debug!(added, ignored, "Loaded system root certificates");

        if let Some(path) = &self.ca_file {
            let file = File::open(path)
                .map_err(|e| ProtocolError::TlsError(format!("Failed to open CA file: {e}")))?;
            let mut reader = BufReader::new(file);
            let certs = rustls_pemfile::certs(&mut reader)
                .map_err(|_| ProtocolError::TlsError("Failed to parse CA certificate".into()))?;
            if certs.is_empty() {
                return Err(ProtocolError::TlsError(format!("No certificates found in {path}")));
            }
            for cert in certs {
                root_store.add(&Certificate(cert)).map_err(|e| {
                    ProtocolError::TlsError(format!("Failed to add cert to root store: {e}"))
                })?;
            }
        }

        Ok(builder
            .with_root_certificates(root_store)
            .with_no_client_auth())
    }

    pub fn server_name(&self) -> Result<ServerName> {
        ServerName::try_from(self.server_name.as_str())
            .map_err(|_| ProtocolError::TlsError("Invalid server name".into()))
    }

    /// Run the TLS handshake over an already connected stream.
    #[instrument(skip(self, stream), fields(server_name = %self.server_name))]
    pub async fn connect<S>(&self, stream: S) -> Result<TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let connector = TlsConnector::from(Arc::new(self.load_client_config()?));
        let domain = self.server_name()?;
        let tls_stream = connector
            .connect(domain, stream)
            .await
            .map_err(|e| ProtocolError::TlsError(format!("TLS connection failed: {e}")))?;
        let info = TlsInfo::from_stream(&tls_stream);
        debug!(
            version = %info.protocol_version,
            cipher = %info.cipher_suite,
            "TLS established"
        );
        Ok(tls_stream)
    }
}

struct CertificateFingerprint {
    fingerprint: Vec<u8>,
}

impl ServerCertVerifier for CertificateFingerprint {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if TlsClientConfig::calculate_cert_hash(end_entity) == self.fingerprint {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "Pinned certificate hash mismatch".into(),
            ))
        }
    }
}

struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Parse a hex fingerprint, with or without `:` separators.
pub fn parse_fingerprint(text: &str) -> Result<Vec<u8>> {
    let hex: Vec<u8> = text.bytes().filter(|b| *b != b':').collect();
    if hex.len() % 2 != 0 {
        return Err(ProtocolError::ConfigError(format!(
            "Fingerprint has an odd number of hex digits: {text}"
        )));
    }
    hex.chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| ProtocolError::ConfigError(format!("Invalid fingerprint: {text}")))
        })
        .collect()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
