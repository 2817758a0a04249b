//! TLS termination for `wss://` peers.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;
use crate::error::ServerError;

/// Load the PEM certificate chain and private key into an acceptor.
pub fn load_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, ServerError> {
    let mut cert_reader = BufReader::new(File::open(&config.cert_path)?);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ServerError::NoCertificates(config.cert_path.clone()));
    }

    let mut key_reader = BufReader::new(File::open(&config.key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| ServerError::NoPrivateKey(config.key_path.clone()))?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    log::info!("Loaded TLS certificate from {}", config.cert_path.display());
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
