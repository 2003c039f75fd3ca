//! TLS acceptor creation

use log::info;
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod, SslVerifyMode};
use openssl::x509::store::{X509Lookup, X509StoreBuilder};

use crate::common::{Result, WorkerError};
use crate::config::WorkerConfig;

/// Create the TLS acceptor used for all client connections
///
/// Failure here is fatal: the worker exits nonzero before entering the
/// event loop.
pub fn create_tls_acceptor(config: &WorkerConfig) -> Result<SslAcceptor> {
    let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;

    acceptor.set_private_key_file(&config.private_key_file, SslFiletype::PEM)?;
    acceptor.set_certificate_chain_file(&config.certificate_file)?;
    acceptor.check_private_key()?;

    if let Some(ca_dir) = &config.ca_dir {
        // A hashed CA directory needs an explicit verify store; fold the CA
        // file into the same store so both locations are consulted.
        let mut store = X509StoreBuilder::new()?;
        if let Some(ca_file) = &config.ca_file {
            let lookup = store.add_lookup(X509Lookup::file())?;
            lookup.load_cert_file(ca_file, SslFiletype::PEM)?;
        }
        let dir = ca_dir
            .to_str()
            .ok_or_else(|| WorkerError::Config("ca_dir is not valid UTF-8".to_string()))?;
        let lookup = store.add_lookup(X509Lookup::hash_dir())?;
        lookup.add_dir(dir, SslFiletype::PEM)?;
        acceptor.set_verify_cert_store(store.build())?;
    } else if let Some(ca_file) = &config.ca_file {
        acceptor.set_ca_file(ca_file)?;
    }

    if config.require_client_cert {
        info!("client certificates required (will be verified)");
        acceptor.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
    } else {
        acceptor.set_verify(SslVerifyMode::NONE);
    }

    Ok(acceptor.build())
}
