//! TLS setup for PostgreSQL connections, derived from a server record.

use std::sync::Arc;

use rustls::ClientConfig;
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::warn;

use crate::catalog::ServerRecord;

/// How a PostgreSQL server is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsPolicy {
    /// Plain TCP.
    Disabled,
    /// TLS without certificate verification (`trust_server_cert`).
    TrustAny,
    /// TLS verified against the bundled web PKI roots.
    Verified,
}

impl TlsPolicy {
    pub fn for_server(server: &ServerRecord) -> Self {
        match (server.encrypt, server.trust_server_cert) {
            (false, _) => TlsPolicy::Disabled,
            (true, true) => TlsPolicy::TrustAny,
            (true, false) => TlsPolicy::Verified,
        }
    }

    /// Build the rustls connector; `None` when TLS is disabled.
    pub fn connector(self) -> Option<MakeRustlsConnect> {
        let config = match self {
            TlsPolicy::Disabled => return None,
            TlsPolicy::TrustAny => {
                warn!(
                    "TLS enabled without certificate verification (trust_server_cert). \
                     This is vulnerable to man-in-the-middle attacks."
                );
                ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier))
                    .with_no_client_auth()
            }
            TlsPolicy::Verified => {
                let mut root_store = rustls::RootCertStore::empty();
                root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                ClientConfig::builder()
                    .with_root_certificates(root_store)
                    .with_no_client_auth()
            }
        };
        Some(MakeRustlsConnect::new(config))
    }
}

/// Certificate verifier that accepts any certificate.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
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
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_from_record() {
        let mut server = ServerRecord::mssql(1, "pg", "app", "pw");
        assert_eq!(TlsPolicy::for_server(&server), TlsPolicy::Disabled);
        server.encrypt = true;
        assert_eq!(TlsPolicy::for_server(&server), TlsPolicy::TrustAny);
        server.trust_server_cert = false;
        assert_eq!(TlsPolicy::for_server(&server), TlsPolicy::Verified);
    }

    #[test]
    fn test_connector_presence() {
        assert!(TlsPolicy::Disabled.connector().is_none());
        assert!(TlsPolicy::TrustAny.connector().is_some());
        assert!(TlsPolicy::Verified.connector().is_some());
    }
}
