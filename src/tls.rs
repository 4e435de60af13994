//! TLS material for the handshake channel
//!
//! The agent terminates TLS itself (optionally requiring client certificates
//! signed by `tls.ca_file`); the control node presents its certificate as a
//! client identity.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;
use crate::error::{Error, Result};

/// Load certificates from a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        Error::Tls(format!("Failed to open certificate file {:?}: {}", path, e))
    })?;

    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("Failed to parse certificates from {:?}: {}", path, e)))?;

    if certs.is_empty() {
        return Err(Error::Tls(format!("No certificates found in {:?}", path)));
    }

    tracing::debug!("Loaded {} certificates from {:?}", certs.len(), path);
    Ok(certs)
}

/// Load a private key (PKCS#1, PKCS#8 or SEC1) from a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        Error::Tls(format!("Failed to open private key file {:?}: {}", path, e))
    })?;

    let mut reader = BufReader::new(file);
    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Ok(PrivateKeyDer::Sec1(key)),
            Ok(Some(_)) => continue,
            Ok(None) => {
                return Err(Error::Tls(format!("No private key found in {:?}", path)));
            }
            Err(e) => {
                return Err(Error::Tls(format!(
                    "Failed to parse private key from {:?}: {}",
                    path, e
                )));
            }
        }
    }
}

fn root_store(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| Error::Tls(format!("Invalid CA certificate in {:?}: {}", path, e)))?;
    }
    Ok(roots)
}

/// Build the agent's TLS acceptor.
///
/// Returns `None` when no certificate is configured. Client certificates are
/// required when a CA bundle is configured.
pub fn server_acceptor(config: &TlsConfig) -> Result<Option<TlsAcceptor>> {
    let (Some(cert_file), Some(key_file)) = (&config.cert_file, &config.key_file) else {
        return Ok(None);
    };
    let certs = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;

    let builder = ServerConfig::builder();
    let server_config = match &config.ca_file {
        Some(ca_file) => {
            let verifier = WebPkiClientVerifier::builder(Arc::new(root_store(ca_file)?))
                .build()
                .map_err(|e| Error::Tls(format!("Failed to build client verifier: {}", e)))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    }
    .map_err(|e| Error::Tls(format!("Invalid certificate/key pair: {}", e)))?;

    tracing::info!(
        "TLS enabled (client certificates {})",
        if config.ca_file.is_some() { "required" } else { "not required" }
    );
    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

/// Build the control node's HTTP client, with a client identity and trust
/// anchor when TLS material is configured
pub fn http_client(config: &TlsConfig, timeout: std::time::Duration) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(timeout).use_rustls_tls();

    if let (Some(cert_file), Some(key_file)) = (&config.cert_file, &config.key_file) {
        let mut pem = std::fs::read(cert_file)
            .map_err(|e| Error::Tls(format!("Failed to read {:?}: {}", cert_file, e)))?;
        pem.push(b'\n');
        pem.extend(
            std::fs::read(key_file)
                .map_err(|e| Error::Tls(format!("Failed to read {:?}: {}", key_file, e)))?,
        );
        let identity = reqwest::Identity::from_pem(&pem)
            .map_err(|e| Error::Tls(format!("Invalid client identity: {}", e)))?;
        builder = builder.identity(identity);
    }

    if let Some(ca_file) = &config.ca_file {
        let pem = std::fs::read(ca_file)
            .map_err(|e| Error::Tls(format!("Failed to read {:?}: {}", ca_file, e)))?;
        let ca = reqwest::Certificate::from_pem(&pem)
            .map_err(|e| Error::Tls(format!("Invalid CA certificate: {}", e)))?;
        builder = builder.add_root_certificate(ca);
    }

    builder
        .build()
        .map_err(|e| Error::Tls(format!("Failed to build HTTP client: {}", e)))
}
