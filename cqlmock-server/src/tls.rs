//! TLS acceptors.
//!
//! Certificates come either from PEM files named in [`TlsConfig`] or from PEM
//! bytes held in memory, for tests that embed their own key pair.

use crate::config::TlsConfig;
use crate::error::ServerError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Builds an acceptor from the files named in `config`.
pub fn create_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, ServerError> {
    let cert_path = config
        .cert_path
        .as_ref()
        .ok_or_else(|| ServerError::TlsConfig("cert_path not set".into()))?;
    let key_path = config
        .key_path
        .as_ref()
        .ok_or_else(|| ServerError::TlsConfig("key_path not set".into()))?;
    let client_ca_path = match (config.require_client_cert, config.client_ca_path.as_ref()) {
        (true, None) => {
            return Err(ServerError::TlsConfig(
                "client_ca_path not set for mTLS".into(),
            ))
        }
        (true, Some(path)) => Some(path),
        (false, _) => None,
    };

    let certs = read_certs(&mut open(cert_path, "cert")?, &source(cert_path))?;
    let key = read_private_key(&mut open(key_path, "key")?, &source(key_path))?;
    let client_roots = match client_ca_path {
        Some(path) => Some(read_certs(&mut open(path, "client CA")?, &source(path))?),
        None => None,
    };

    build_acceptor(certs, key, client_roots)
}

/// Builds an acceptor from PEM-encoded certificate chain and private key.
pub fn create_tls_acceptor_from_pem(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<TlsAcceptor, ServerError> {
    let certs = read_certs(&mut &cert_pem[..], "in-memory cert")?;
    let key = read_private_key(&mut &key_pem[..], "in-memory key")?;
    build_acceptor(certs, key, None)
}

fn build_acceptor(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_roots: Option<Vec<CertificateDer<'static>>>,
) -> Result<TlsAcceptor, ServerError> {
    if certs.is_empty() {
        return Err(ServerError::TlsConfig("no certificates found".into()));
    }

    let builder = rustls::ServerConfig::builder();
    let builder = match client_roots {
        Some(roots) => {
            let mut root_store = RootCertStore::empty();
            for cert in roots {
                root_store.add(cert).map_err(|e| {
                    ServerError::TlsConfig(format!("invalid client CA cert: {}", e))
                })?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(root_store))
                .build()
                .map_err(|e| {
                    ServerError::TlsConfig(format!("failed to build client verifier: {}", e))
                })?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let server_config = builder
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::TlsConfig(format!("invalid server cert/key: {}", e)))?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn source(path: &Path) -> String {
    format!("{:?}", path)
}

fn open(path: &Path, what: &str) -> Result<BufReader<File>, ServerError> {
    File::open(path).map(BufReader::new).map_err(|e| {
        ServerError::TlsConfig(format!("cannot open {} file {:?}: {}", what, path, e))
    })
}

fn read_certs(
    reader: &mut dyn BufRead,
    source: &str,
) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    rustls_pemfile::certs(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::TlsConfig(format!("invalid cert in {}: {}", source, e)))
}

fn read_private_key(
    reader: &mut dyn BufRead,
    source: &str,
) -> Result<PrivateKeyDer<'static>, ServerError> {
    loop {
        match rustls_pemfile::read_one(reader)
            .map_err(|e| ServerError::TlsConfig(format!("invalid key in {}: {}", source, e)))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => {
                return Err(ServerError::TlsConfig(format!(
                    "no private key found in {}",
                    source
                )))
            }
            _ => continue,
        }
    }
}
