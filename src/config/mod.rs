//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The etcd password is wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::time::Duration;

/// Address the HTTP front door binds to when `ETCDQ_LISTEN` is unset.
pub const DEFAULT_LISTEN: &str = "localhost:42200";

#[derive(Debug)]
pub struct Config {
    pub etcd_endpoints: Vec<String>,
    pub etcd_user: Option<String>,
    pub etcd_password: Option<SecretString>,
    pub listen: String,
    /// TTL applied to items submitted through the HTTP front door.
    pub default_ttl: Option<Duration>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let etcd_endpoints = parse_endpoints(&required_var("ETCD_ENDPOINTS")?)?;

        let default_ttl = match std::env::var("ETCDQ_DEFAULT_TTL_SECS") {
            Ok(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|_| {
                    Error::Config(format!("ETCDQ_DEFAULT_TTL_SECS is not a number: {raw:?}"))
                })?;
                Some(Duration::from_secs(secs))
            }
            Err(_) => None,
        };

        Ok(Self {
            etcd_endpoints,
            etcd_user: std::env::var("ETCD_USER").ok(),
            etcd_password: std::env::var("ETCD_PASSWORD").ok().map(SecretString::from),
            listen: std::env::var("ETCDQ_LISTEN").unwrap_or_else(|_| DEFAULT_LISTEN.to_string()),
            default_ttl,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

/// Split a comma separated endpoint list, ignoring blanks.
pub fn parse_endpoints(raw: &str) -> Result<Vec<String>> {
    let endpoints: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if endpoints.is_empty() {
        return Err(Error::Config("ETCD_ENDPOINTS lists no endpoints".to_string()));
    }
    Ok(endpoints)
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
