//! TLS-over-TCP transport.
//!
//! Servers load certificate and key from PEM files or fall back to a
//! self-signed certificate for testing. The client connector accepts any
//! certificate - suitable for development and tests; production
//! deployments should verify against a trusted CA.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tether_core::{Protocol, Session};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{NetError, Result};
use crate::stream::{StreamTransport, spawn_read_loop};
use crate::tcp::register_client;

/// Bind a TLS-wrapped TCP listener and spawn its accept loop.
///
/// With `cert_path` and `key_path` both set the PEM files are used;
/// otherwise a self-signed certificate is generated.
pub(crate) async fn listen(
    protocol: Arc<Protocol>,
    addr: &str,
    cert_path: Option<&Path>,
    key_path: Option<&Path>,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let tls_config = match (cert_path, key_path) {
        (Some(cert), Some(key)) => load_tls_config(cert, key)?,
        _ => generate_self_signed_config()?,
    };
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|error| NetError::Config(format!("failed to bind '{addr}': {error}")))?;
    let local_addr = listener
        .local_addr()
        .map_err(|error| NetError::Transport(format!("failed to get local address: {error}")))?;

    tracing::info!("TLS server listening on {}", local_addr);

    let handle = tokio::spawn(accept_loop(listener, acceptor, protocol));
    Ok((local_addr, handle))
}

async fn accept_loop(listener: TcpListener, acceptor: TlsAcceptor, protocol: Arc<Protocol>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "accepted TCP connection for TLS");
                let acceptor = acceptor.clone();
                let protocol = protocol.clone();

                // the TLS handshake can stall; never block the accept loop
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            let (read_half, write_half) = tokio::io::split(tls_stream);
                            let transport = StreamTransport::new(write_half, false);
                            let session = protocol.create_session(transport);
                            match session.connect_session(0) {
                                Ok(()) => spawn_read_loop(read_half, protocol, session),
                                Err(error) => {
                                    tracing::warn!(%error, "accepted session refused connect");
                                }
                            }
                        }
                        Err(error) => tracing::warn!(%error, "TLS handshake failed"),
                    }
                });
            }
            Err(error) => {
                tracing::warn!(%error, "TLS accept failed");
            }
        }
    }
}

/// Open a TLS client connection.
pub(crate) async fn connect(protocol: &Arc<Protocol>, addr: &str) -> Result<Arc<Session>> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|error| NetError::Transport(format!("connect to '{addr}' failed: {error}")))?;

    let connector = TlsConnector::from(Arc::new(insecure_client_config()));
    let server_name = rustls::pki_types::ServerName::try_from("localhost".to_string())
        .map_err(|error| NetError::Config(format!("invalid server name: {error}")))?;

    let tls_stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|error| NetError::Transport(format!("TLS handshake failed: {error}")))?;

    let (read_half, write_half) = tokio::io::split(tls_stream);
    register_client(protocol, StreamTransport::new(write_half, true), read_half)
}

/// Load TLS configuration from certificate and key files.
fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<rustls::ServerConfig> {
    let cert_pem = std::fs::read(cert_path).map_err(|error| {
        NetError::Config(format!("failed to read cert '{}': {error}", cert_path.display()))
    })?;
    let key_pem = std::fs::read(key_path).map_err(|error| {
        NetError::Config(format!("failed to read key '{}': {error}", key_path.display()))
    })?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|error| NetError::Config(format!("failed to parse certificates: {error}")))?;

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|error| NetError::Config(format!("failed to parse private key: {error}")))?
        .ok_or_else(|| NetError::Config("no private key found".to_string()))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|error| NetError::Config(format!("invalid TLS config: {error}")))
}

/// Generate a self-signed certificate for testing.
fn generate_self_signed_config() -> Result<rustls::ServerConfig> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|error| NetError::Config(format!("failed to generate self-signed cert: {error}")))?;

    let cert_der = cert.cert.der().clone();
    let key_der = cert.key_pair.serialize_der();

    let cert_chain = vec![cert_der];
    let key = rustls::pki_types::PrivatePkcs8KeyDer::from(key_der);

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key.into())
        .map_err(|error| NetError::Config(format!("invalid TLS config: {error}")))?;

    tracing::warn!("Using self-signed certificate - not for production use!");

    Ok(config)
}

/// Create an insecure client config that accepts any certificate.
///
/// WARNING: Development only. Production should verify certificates.
fn insecure_client_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier))
        .with_no_client_auth()
}

/// Certificate verifier that accepts any certificate (insecure, for
/// development).
#[derive(Debug)]
struct InsecureCertVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
