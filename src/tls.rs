//! Inbound TLS configuration for intercepted CONNECT sessions.

use std::io;
use std::path::Path;

use rustls_pemfile::Item;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::ServerSessionMemoryCache;
use tokio_rustls::rustls::{version, ServerConfig};

use crate::error::Result;

/// Build the server config used to terminate TLS towards proxy clients:
/// TLS 1.2 minimum, a 16-entry session cache, and ALPN advertising
/// `http/1.1` ahead of `h2` so the single-request HTTP/1.1 reader on the
/// intercept path is what well-behaved clients end up speaking.
pub(crate) fn mitm_server_config(
    cert_file: impl AsRef<Path>,
    key_file: impl AsRef<Path>,
) -> Result<ServerConfig> {
    let cert = std::fs::read(cert_file.as_ref())?;
    let certs: Vec<CertificateDer> =
        rustls_pemfile::certs(&mut cert.as_slice()).collect::<io::Result<Vec<_>>>()?;

    // Check the entire PEM file for the key in case it is not the first
    // section.
    let key = std::fs::read(key_file.as_ref())?;
    let mut keys: Vec<PrivateKeyDer> = rustls_pemfile::read_all(&mut key.as_slice())
        .filter_map(|item| match item.ok()? {
            Item::Pkcs1Key(key) => Some(PrivateKeyDer::from(key)),
            Item::Pkcs8Key(key) => Some(PrivateKeyDer::from(key)),
            Item::Sec1Key(key) => Some(PrivateKeyDer::from(key)),
            _ => None,
        })
        .collect();
    let key = match (keys.pop(), keys.is_empty()) {
        (Some(key), true) => key,
        _ => return Err(io::Error::other("private key format not supported").into()),
    };

    let mut config =
        ServerConfig::builder_with_protocol_versions(&[&version::TLS12, &version::TLS13])
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
    config.session_storage = ServerSessionMemoryCache::new(16);
    config.alpn_protocols = vec![b"http/1.1".to_vec(), b"h2".to_vec()];
    Ok(config)
}
