use std::env;
use std::fmt::Display;
use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use tracing::{info, warn};

const PREFIX: &str = "TABLEBOOK_";

/// Process configuration, read once from `TABLEBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub admin_phone: Option<String>,
    pub notifications: bool,
    pub cleanup_hour: u32,
    pub reminder_hour: u32,
}

impl Config {
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys take their default; unparsable
    /// ones are logged and also take their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(&format!("{PREFIX}{name}")).filter(|v| !v.trim().is_empty());
        Self {
            bind: get("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(get("PORT"), "PORT", 5433),
            data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("PASSWORD").unwrap_or_else(|| "tablebook".into()),
            max_connections: parse_or(get("MAX_CONNECTIONS"), "MAX_CONNECTIONS", 256),
            compact_threshold: parse_or(get("COMPACT_THRESHOLD"), "COMPACT_THRESHOLD", 1000),
            metrics_port: get("METRICS_PORT").and_then(|v| parse_opt(&v, "METRICS_PORT")),
            tls_cert: get("TLS_CERT"),
            tls_key: get("TLS_KEY"),
            admin_phone: get("ADMIN_PHONE"),
            notifications: parse_or(get("NOTIFICATIONS"), "NOTIFICATIONS", true),
            cleanup_hour: hour_or(get("CLEANUP_HOUR"), "CLEANUP_HOUR", 3),
            reminder_hour: hour_or(get("REMINDER_HOUR"), "REMINDER_HOUR", 10),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("tablebook.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// TLS acceptor from the configured PEM files, if any.
    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let (cert_path, key_path) = match (&self.tls_cert, &self.tls_key) {
            (None, None) => return Ok(None),
            (Some(c), Some(k)) => (c, k),
            _ => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    "both TABLEBOOK_TLS_CERT and TABLEBOOK_TLS_KEY must be set, or neither",
                ));
            }
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
        config.alpn_protocols = vec![b"postgresql".to_vec()];

        info!("TLS enabled with certificate {cert_path}");
        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}

fn parse_opt<T: FromStr>(value: &str, name: &str) -> Option<T>
where
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| warn!("Invalid {PREFIX}{name} value {value:?}: {e}"))
        .ok()
}

fn parse_or<T: FromStr + Display>(value: Option<String>, name: &str, default: T) -> T
where
    T::Err: Display,
{
    match value {
        Some(v) => parse_opt(&v, name).unwrap_or_else(|| {
            warn!("{PREFIX}{name}: using default {default}");
            default
        }),
        None => default,
    }
}

fn hour_or(value: Option<String>, name: &str, default: u32) -> u32 {
    let hour = parse_or(value, name, default);
    if hour > 23 {
        warn!("{PREFIX}{name}={hour} is not an hour of the day, using default {default}");
        return default;
    }
    hour
}
