//! TLS-wrapped Modbus TCP (client only)
//!
//! Framing is plain MBAP; the link counts as connected once the handshake
//! has completed, not when the TCP socket opens.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::{tcp, ConnectionParams, TlsParams};
use crate::error::{ModbusError, Result};

/// Accepts any server certificate. Only used with `accept_invalid_certs`.
#[derive(Debug)]
struct NoVerification;

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

fn tls_error(context: &str, err: impl std::fmt::Display) -> ModbusError {
    ModbusError::transport(format!("{}: {}", context, err))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| tls_error(&path.display().to_string(), e))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_error(&path.display().to_string(), e))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| tls_error(&path.display().to_string(), e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| tls_error(&path.display().to_string(), e))?
        .ok_or_else(|| ModbusError::transport(format!("No private key in {}", path.display())))
}

/// Build the rustls client configuration from the TLS settings
pub fn client_config(params: &TlsParams) -> Result<ClientConfig> {
    let builder = if params.accept_invalid_certs {
        warn!("TLS: server certificate verification disabled");
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
    } else {
        let ca_file = params.ca_file.as_deref().ok_or_else(|| {
            ModbusError::validation("TLS needs tls.ca_file unless tls.accept_invalid_certs is set")
        })?;
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_file)? {
            roots
                .add(cert)
                .map_err(|e| tls_error("Invalid CA certificate", e))?;
        }
        ClientConfig::builder().with_root_certificates(roots)
    };

    match (&params.cert_file, &params.key_file) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| tls_error("Invalid client certificate", e)),
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(ModbusError::validation(
            "tls.cert_file and tls.key_file must be set together",
        )),
    }
}

/// Connect TCP, then complete the TLS handshake within the connect timeout
pub async fn connect_stream(params: &ConnectionParams) -> Result<TlsStream<TcpStream>> {
    let config = client_config(&params.tls)?;
    let name = params.tls.server_name.clone().unwrap_or_else(|| params.host.clone());
    let server_name = ServerName::try_from(name.clone())
        .map_err(|e| tls_error(&format!("Invalid server name '{}'", name), e))?;

    let tcp = tcp::connect_stream(&params.host, params.port, params.connect_timeout()).await?;
    let connector = TlsConnector::from(Arc::new(config));
    debug!("TLS handshake with {}", name);

    match timeout(params.connect_timeout(), connector.connect(server_name, tcp)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(tls_error("TLS handshake failed", e)),
        Err(_) => Err(ModbusError::transport(format!(
            "TLS handshake with {} timed out",
            name
        ))),
    }
}
