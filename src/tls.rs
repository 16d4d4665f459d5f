//! Mutual-TLS configuration and peer identity.
//!
//! Policy: TLS 1.3 only; a client certificate signed by the configured CA
//! bundle is required; the caller's identity is the certificate's Common
//! Name. Connections with no peer certificate, the wrong CA, or an empty
//! CN are rejected before any request is read.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use x509_parser::prelude::FromDer;
use x509_parser::certificate::X509Certificate;

use crate::error::{Error, Result};

/// Certificate material for the server side of the mTLS handshake.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// Server certificate chain (PEM).
    pub cert: PathBuf,
    /// Server private key (PEM).
    pub key: PathBuf,
    /// CA bundle that client certificates must chain to (PEM).
    pub ca: PathBuf,
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs: std::io::Result<Vec<_>> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs?;
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", path.display())))
}

/// Builds the server's rustls configuration: TLS 1.3 only, client
/// certificates required and verified against the CA bundle.
pub fn server_config(opts: &TlsOptions) -> Result<Arc<ServerConfig>> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(&opts.ca)? {
        roots
            .add(cert)
            .map_err(|e| Error::Tls(format!("bad CA certificate: {e}")))?;
    }

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| Error::Tls(format!("could not build client verifier: {e}")))?;

    let config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(&opts.cert)?, load_key(&opts.key)?)
        .map_err(|e| Error::Tls(format!("bad server certificate or key: {e}")))?;

    Ok(Arc::new(config))
}

/// Extracts the caller identity from a completed handshake: the Common
/// Name of the verified peer certificate. An absent certificate or empty
/// CN rejects the connection.
pub fn peer_identity(conn: &rustls::ServerConnection) -> Result<String> {
    let certs = conn
        .peer_certificates()
        .ok_or_else(|| Error::Tls("no client certificate presented".into()))?;
    let cert = certs
        .first()
        .ok_or_else(|| Error::Tls("no client certificate presented".into()))?;

    let (_, parsed) = X509Certificate::from_der(cert.as_ref())
        .map_err(|e| Error::Tls(format!("could not parse client certificate: {e}")))?;

    let cn = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .unwrap_or("");

    if cn.is_empty() {
        return Err(Error::Tls("client certificate has no common name".into()));
    }
    Ok(cn.to_string())
}
