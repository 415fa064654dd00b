//! TLS configuration from the configured CA, certificate and key files.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::options::ServerOptions;
use crate::common::error::{ServerError, ServerResult};

fn load_certs(path: &Path) -> ServerResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|_| ServerError::NoTlsCertificate)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ServerError::NoTlsCertificate)
}

fn load_key(path: &Path) -> ServerResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|_| ServerError::NoTlsKey)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|_| ServerError::NoTlsKey)?
        .ok_or(ServerError::NoTlsKey)
}

/// Acceptor for the TLS listen port and `startTLS` upgrades.
pub fn build_acceptor(options: &ServerOptions) -> ServerResult<TlsAcceptor> {
    let (cert_path, key_path) = options.with(|o| {
        (
            o.tls_cert_file.clone().ok_or(ServerError::NoTlsCertificate),
            o.tls_key_file.clone().ok_or(ServerError::NoTlsKey),
        )
    });
    let certs = load_certs(&cert_path?)?;
    let key = load_key(&key_path?)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Failure(format!("TLS config: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Connector for outgoing slave connections, trusting the configured CA.
pub fn build_connector(options: &ServerOptions) -> ServerResult<TlsConnector> {
    let ca_path = options
        .with(|o| o.tls_ca_file.clone())
        .ok_or(ServerError::NoTlsCertificate)?;

    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs(&ca_path)? {
        roots
            .add(cert)
            .map_err(|e| ServerError::Failure(format!("TLS CA: {e}")))?;
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}
