use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::Config;

/// TLS acceptor for the configured certificate pair, or `None` when TLS is off.
pub fn acceptor_for(config: &Config) -> io::Result<Option<TlsAcceptor>> {
    match (config.tls_cert.as_deref(), config.tls_key.as_deref()) {
        (None, None) => Ok(None),
        (Some(cert), Some(key)) => load_tls_acceptor(Path::new(cert), Path::new(key)).map(Some),
        _ => Err(io::Error::new(
            ErrorKind::InvalidInput,
            "both SLOTBOOK_TLS_CERT and SLOTBOOK_TLS_KEY must be set, or neither",
        )),
    }
}

pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> io::Result<TlsAcceptor> {
    let certs = read_certs(cert_path)?;
    if certs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("no certificate found in {}", cert_path.display()),
        ));
    }
    let key = read_key(key_path)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn read_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)).collect()
}

fn read_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut BufReader::new(File::open(path)?))?.ok_or_else(|| {
        io::Error::new(
            ErrorKind::InvalidInput,
            format!("no private key found in {}", path.display()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(cert: Option<&str>, key: Option<&str>) -> Config {
        let mut config = Config::from_lookup(|_| None).unwrap();
        config.tls_cert = cert.map(String::from);
        config.tls_key = key.map(String::from);
        config
    }

    #[test]
    fn tls_off_without_paths() {
        assert!(acceptor_for(&config(None, None)).unwrap().is_none());
    }

    #[test]
    fn half_configured_tls_is_rejected() {
        let err = acceptor_for(&config(Some("cert.pem"), None)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(acceptor_for(&config(None, Some("key.pem"))).is_err());
    }

    #[test]
    fn empty_pem_has_no_certificate() {
        let dir = std::env::temp_dir().join("slotbook_test_tls");
        std::fs::create_dir_all(&dir).unwrap();
        let empty = dir.join("empty.pem");
        std::fs::write(&empty, "").unwrap();

        let err = load_tls_acceptor(&empty, &empty).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(read_key(&empty).is_err());
    }

    #[test]
    fn missing_files_surface_io_errors() {
        let missing = std::env::temp_dir().join("slotbook_test_tls").join("missing.pem");
        let err = load_tls_acceptor(&missing, &missing).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
