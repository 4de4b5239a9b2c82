//! Transport setup: TLS upgrade and session-nonce exchange.
//!
//! This client profile intentionally skips server identity validation: the
//! stream is encrypted but any certificate is accepted.

use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use hypercosm_shared::error::Error;
use hypercosm_shared::uuid::Uuid;

/// Accepts any server certificate. Encryption without authentication.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Connects to the server and upgrades the stream to TLS.
pub async fn connect(host: &str, port: u16) -> Result<TlsStream<TcpStream>, Error> {
    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(Error::Transport)?;

    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| Error::Protocol(format!("invalid server name: {host}")))?;

    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(Error::Transport)?;
    info!(host, port, "TLS session established (server identity unchecked)");
    Ok(stream)
}

/// Exchanges 16-byte session nonces: writes a fresh identifier, then reads
/// the peer's. `write_all`/`read_exact` retry through short transfers; a
/// stream that closes mid-nonce is a fatal transport error.
pub async fn exchange_session_ids<S>(stream: &mut S) -> Result<(Uuid, Uuid), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ours = Uuid::generate();
    stream
        .write_all(&ours.to_bytes())
        .await
        .map_err(Error::Transport)?;

    let mut buf = [0u8; 16];
    stream.read_exact(&mut buf).await.map_err(Error::Transport)?;
    let theirs = Uuid::from_bytes(buf);

    debug!(client = %ours, server = %theirs, "session identifiers exchanged");
    Ok((ours, theirs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nonce_exchange_transfers_full_identifiers() {
        let (mut a, mut b) = tokio::io::duplex(64);

        let server = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            b.read_exact(&mut buf).await.unwrap();
            let client_id = Uuid::from_bytes(buf);
            let server_id = Uuid::generate();
            b.write_all(&server_id.to_bytes()).await.unwrap();
            (client_id, server_id)
        });

        let (ours, theirs) = exchange_session_ids(&mut a).await.unwrap();
        let (seen_client, server_id) = server.await.unwrap();
        assert_eq!(seen_client, ours);
        assert_eq!(theirs, server_id);
        assert_ne!(ours, theirs);
    }

    #[tokio::test]
    async fn truncated_nonce_is_fatal() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            b.read_exact(&mut buf).await.unwrap();
            // Reply with a short nonce, then close.
            b.write_all(&[1u8; 7]).await.unwrap();
            drop(b);
        });

        match exchange_session_ids(&mut a).await {
            Err(Error::Transport(_)) => {}
            other => panic!("expected transport error, got {other:?}"),
        }
    }
}
