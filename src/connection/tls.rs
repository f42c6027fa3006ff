//! TLS configuration and utilities.
//!
//! Builds the rustls client configuration for `pulsar+ssl` connections:
//! trust anchors from a configured CA bundle or the bundled webpki roots,
//! an opt-out insecure mode that skips verification entirely, and client
//! certificate authentication from either the client configuration or the
//! authentication plugin.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::auth::Authenticator;
use crate::config::ClientConfiguration;
use crate::error::{Error, Result};

/// Build the TLS connector for a broker connection.
///
/// Client key material supplied by the authenticator takes precedence over
/// the paths in the client configuration.
pub(crate) fn build_tls_connector(
    config: &ClientConfiguration,
    auth: &dyn Authenticator,
) -> Result<TlsConnector> {
    let client_auth = match auth.tls_key_material() {
        Some(material) => Some((material.certificate_path, material.private_key_path)),
        None => match (
            &config.tls_certificate_file_path,
            &config.tls_private_key_file_path,
        ) {
            (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
            _ => None,
        },
    };

    let builder = if config.tls_allow_insecure_connection {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier::new()))
    } else {
        let mut roots = RootCertStore::empty();
        match &config.tls_trust_certs_file_path {
            Some(path) => {
                if !path.exists() {
                    tracing::error!(path = %path.display(), "No such trust certificate file");
                    return Err(Error::ConnectError);
                }
                for cert in load_certs(path)? {
                    roots.add(cert).map_err(|error| {
                        tracing::error!(%error, "Invalid trust certificate");
                        Error::ConnectError
                    })?;
                }
            }
            None => {
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
        }
        ClientConfig::builder().with_root_certificates(roots)
    };

    let tls_config = match client_auth {
        Some((cert_path, key_path)) => {
            if !cert_path.exists() {
                tracing::error!(path = %cert_path.display(), "No such client certificate file");
                return Err(Error::ConnectError);
            }
            let certs = load_certs(&cert_path)?;
            let key = load_private_key(&key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|error| {
                    tracing::error!(%error, "TLS client auth configuration error");
                    Error::ConnectError
                })?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(tls_config)))
}

/// Load certificates from a PEM file.
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|error| {
        tracing::error!(path = %path.display(), %error, "Failed to open certificate file");
        Error::ConnectError
    })?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|error| {
            tracing::error!(path = %path.display(), %error, "Failed to parse certificates");
            Error::ConnectError
        })?;

    if certs.is_empty() {
        tracing::error!(path = %path.display(), "No certificates found");
        return Err(Error::ConnectError);
    }

    Ok(certs)
}

/// Load a private key from a PEM file.
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|error| {
        tracing::error!(path = %path.display(), %error, "Failed to open key file");
        Error::ConnectError
    })?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader).map_err(|error| {
            tracing::error!(path = %path.display(), %error, "Failed to parse key file");
            Error::ConnectError
        })? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => {
                return Ok(PrivateKeyDer::Pkcs1(key));
            }
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => {
                return Ok(PrivateKeyDer::Pkcs8(key));
            }
            Some(rustls_pemfile::Item::Sec1Key(key)) => {
                return Ok(PrivateKeyDer::Sec1(key));
            }
            None => break,
            _ => continue,
        }
    }

    tracing::error!(path = %path.display(), "No private key found");
    Err(Error::ConnectError)
}

/// Certificate verifier that accepts any server certificate.
///
/// Only reachable through `tls_allow_insecure_connection`.
#[derive(Debug)]
struct InsecureVerifier {
    provider: Arc<CryptoProvider>,
}

impl InsecureVerifier {
    fn new() -> Self {
        InsecureVerifier {
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        }
    }
}

impl ServerCertVerifier for InsecureVerifier {
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
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
