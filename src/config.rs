use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig as TlsConfig;

use crate::catalog::{Catalog, CatalogError};

/// Server settings read from `CHAIRBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    /// `None` keeps appointments in memory only.
    pub data_dir: Option<PathBuf>,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub catalog_path: Option<PathBuf>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparseable numbers fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(&format!("CHAIRBOOK_{name}")).filter(|v| !v.is_empty());
        Self {
            port: var("PORT").and_then(|s| s.parse().ok()).unwrap_or(5433),
            bind: var("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: var("DATA_DIR").map(PathBuf::from),
            password: var("PASSWORD").unwrap_or_else(|| "chairbook".into()),
            max_connections: var("MAX_CONNECTIONS").and_then(|s| s.parse().ok()).unwrap_or(256),
            compact_threshold: var("COMPACT_THRESHOLD").and_then(|s| s.parse().ok()).unwrap_or(1000),
            catalog_path: var("CATALOG").map(PathBuf::from),
            tls_cert: var("TLS_CERT"),
            tls_key: var("TLS_KEY"),
            metrics_port: var("METRICS_PORT").and_then(|s| s.parse().ok()),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Configured catalog file, or the built-in single-shop catalog.
    pub fn load_catalog(&self) -> Result<Catalog, CatalogError> {
        match &self.catalog_path {
            Some(path) => Catalog::load(path),
            None => Ok(Catalog::builtin()),
        }
    }

    pub fn load_tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let (cert_path, key_path) = match (&self.tls_cert, &self.tls_key) {
            (None, None) => return Ok(None),
            (Some(c), Some(k)) => (c, k),
            _ => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    "both CHAIRBOOK_TLS_CERT and CHAIRBOOK_TLS_KEY must be set, or neither",
                ));
            }
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?)).collect::<Result<_, _>>()?;

        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

        let mut config = TlsConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

        config.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}
