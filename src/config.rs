use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

use crate::engine::{EngineConfig, OverlapPolicy};

/// Server settings, read from `LEAVEBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "leavebook".into(),
            max_connections: 256,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            engine: EngineConfig::default(),
        }
    }
}

fn invalid(var: &str, value: &str, err: impl std::fmt::Display) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, format!("{var}={value:?}: {err}"))
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> io::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| invalid(var, &raw, e)),
        None => Ok(None),
    }
}

impl Config {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a config from any variable source. Unset variables keep their
    /// defaults; set but malformed ones are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let mut config = Config::default();

        if let Some(bind) = lookup("LEAVEBOOK_BIND") {
            config.bind = bind;
        }
        if let Some(port) = parsed(&lookup, "LEAVEBOOK_PORT")? {
            config.port = port;
        }
        if let Some(dir) = lookup("LEAVEBOOK_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(password) = lookup("LEAVEBOOK_PASSWORD") {
            config.password = password;
        }
        if let Some(n) = parsed(&lookup, "LEAVEBOOK_MAX_CONNECTIONS")? {
            config.max_connections = n;
        }
        config.metrics_port = parsed(&lookup, "LEAVEBOOK_METRICS_PORT")?;
        config.tls_cert = lookup("LEAVEBOOK_TLS_CERT").map(PathBuf::from);
        config.tls_key = lookup("LEAVEBOOK_TLS_KEY").map(PathBuf::from);
        if config.tls_cert.is_some() != config.tls_key.is_some() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both LEAVEBOOK_TLS_CERT and LEAVEBOOK_TLS_KEY must be set, or neither",
            ));
        }

        if let Some(n) = parsed(&lookup, "LEAVEBOOK_COMPACT_THRESHOLD")? {
            config.engine.compact_threshold = n;
        }
        if let Some(strict) = parsed(&lookup, "LEAVEBOOK_STRICT_MEMBERS")? {
            config.engine.reject_duplicate_members = strict;
        }
        let mut overlap = OverlapPolicy::default();
        if let Some(n) = parsed(&lookup, "LEAVEBOOK_OVERLAP_THRESHOLD")? {
            overlap.default_threshold = n;
        }
        if let Some(raw) = lookup("LEAVEBOOK_ROLE_THRESHOLDS") {
            overlap.per_role = OverlapPolicy::parse_role_thresholds(&raw)
                .map_err(|e| invalid("LEAVEBOOK_ROLE_THRESHOLDS", &raw, e))?;
        }
        config.engine.overlap = overlap;

        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("leavebook.wal")
    }

    /// The TLS acceptor for the configured certificate, if any.
    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let (Some(cert_path), Some(key_path)) = (&self.tls_cert, &self.tls_key) else {
            return Ok(None);
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;

        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

        let mut tls = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

        tls.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(tls))))
    }
}
