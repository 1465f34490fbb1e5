//! Connection parameters for the tunnel and the pool.
//!
//! Values come from the process environment (after loading a `.env` file) or from
//! any key lookup function.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::BrokerError;

pub const SSH_HOST: &str = "SSH_HOST";
pub const SSH_PORT: &str = "SSH_PORT";
pub const SSH_USER: &str = "SSH_USER";
pub const SSH_KEY_PATH: &str = "SSH_KEY_PATH";
pub const DB_USER: &str = "DB_USER";
pub const DB_PASSWORD: &str = "DB_PASSWORD";
pub const DB_NAME: &str = "DB_NAME";
pub const DB_REMOTE_HOST: &str = "DB_REMOTE_HOST";
pub const DB_REMOTE_PORT: &str = "DB_REMOTE_PORT";
pub const POOL_MIN_SIZE: &str = "POOL_MIN_SIZE";
pub const POOL_MAX_SIZE: &str = "POOL_MAX_SIZE";
pub const POOL_ACQUIRE_TIMEOUT_SECS: &str = "POOL_ACQUIRE_TIMEOUT_SECS";
pub const DB_CONNECT_TIMEOUT_SECS: &str = "DB_CONNECT_TIMEOUT_SECS";
pub const SSH_CONNECT_TIMEOUT_SECS: &str = "SSH_CONNECT_TIMEOUT_SECS";
pub const SSH_KEY_PASSPHRASE: &str = "SSH_KEY_PASSPHRASE";
pub const SSH_STRICT_HOST_KEY_CHECKING: &str = "SSH_STRICT_HOST_KEY_CHECKING";
pub const SSH_KNOWN_HOSTS: &str = "SSH_KNOWN_HOSTS";
pub const DB_TRANSLATE_PLACEHOLDERS: &str = "DB_TRANSLATE_PLACEHOLDERS";

/// Keys that must be present and non-empty, in reporting order.
pub const REQUIRED_KEYS: [&str; 7] = [
    SSH_HOST,
    SSH_PORT,
    SSH_USER,
    SSH_KEY_PATH,
    DB_USER,
    DB_PASSWORD,
    DB_NAME,
];

/// Everything the broker needs to open the tunnel and the pool.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub tunnel: TunnelConfig,
    pub database: DatabaseConfig,
    pub pool: PoolSettings,
    /// Pool-wide default for `%s` -> `$N` placeholder rewriting.
    pub translate_placeholders: bool,
}

/// SSH side of the tunnel. The key passphrase is redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub key_path: PathBuf,
    pub key_passphrase: Option<String>,
    /// Database host as seen from the SSH server.
    pub remote_host: String,
    pub remote_port: u16,
    /// Refuse host keys that are not recorded in `known_hosts`.
    pub strict_host_key_checking: bool,
    /// `known_hosts` file to check; `~/.ssh/known_hosts` when unset.
    pub known_hosts: Option<PathBuf>,
    /// Deadline for connecting, exchanging keys and authenticating.
    pub connect_timeout: Duration,
}

impl std::fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("ssh_host", &self.ssh_host)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_user", &self.ssh_user)
            .field("key_path", &self.key_path)
            .field("key_passphrase", &self.key_passphrase.as_ref().map(|_| "<redacted>"))
            .field("remote_host", &self.remote_host)
            .field("remote_port", &self.remote_port)
            .field("strict_host_key_checking", &self.strict_host_key_checking)
            .field("known_hosts", &self.known_hosts)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Database credentials. The password is redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub user: String,
    pub password: String,
    pub dbname: String,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("dbname", &self.dbname)
            .finish()
    }
}

/// Pool sizing and wait policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Connections opened eagerly when the pool is built.
    pub min_size: usize,
    pub max_size: usize,
    /// Longest a checkout may wait for a free connection; `None` waits forever.
    pub acquire_timeout: Option<Duration>,
    pub connect_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            acquire_timeout: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl PoolSettings {
    /// # Errors
    /// Returns `BrokerError::InvalidConfiguration` when `max_size` is zero or below `min_size`.
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.max_size == 0 {
            return Err(BrokerError::InvalidConfiguration(format!(
                "{POOL_MAX_SIZE} must be at least 1"
            )));
        }
        if self.min_size > self.max_size {
            return Err(BrokerError::InvalidConfiguration(format!(
                "{POOL_MIN_SIZE} ({}) exceeds {POOL_MAX_SIZE} ({})",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

impl BrokerConfig {
    /// Load `.env` (if present) and read the process environment.
    ///
    /// # Errors
    /// Returns `BrokerError::MissingConfiguration` naming every absent key, or
    /// `BrokerError::InvalidConfiguration` for unparseable values.
    pub fn from_env() -> Result<Self, BrokerError> {
        // A missing .env file is the normal case in deployed environments.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read keys from a specific dotenv file without touching the process environment.
    ///
    /// Variables already set in the environment take precedence over the file.
    ///
    /// # Errors
    /// `BrokerError::InvalidConfiguration` when the file cannot be read or parsed,
    /// otherwise the same as [`BrokerConfig::from_env`].
    pub fn from_env_file(path: impl AsRef<Path>) -> Result<Self, BrokerError> {
        let path = path.as_ref();
        let unreadable = |e: dotenvy::Error| {
            BrokerError::InvalidConfiguration(format!("cannot read {}: {e}", path.display()))
        };
        let mut file_vars = HashMap::new();
        for item in dotenvy::from_path_iter(path).map_err(unreadable)? {
            let (key, value) = item.map_err(unreadable)?;
            file_vars.insert(key, value);
        }
        Self::from_lookup(|key| std::env::var(key).ok().or_else(|| file_vars.get(key).cloned()))
    }

    /// Build a config from an arbitrary key lookup. Empty values count as missing.
    ///
    /// # Errors
    /// Same as [`BrokerConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, BrokerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let missing: Vec<&'static str> = REQUIRED_KEYS
            .iter()
            .copied()
            .filter(|&key| get(key).is_none())
            .collect();
        if !missing.is_empty() {
            tracing::error!(
                "Missing required environment variables for SSH or DB: {}",
                missing.join(", ")
            );
            return Err(BrokerError::MissingConfiguration(missing));
        }

        let required = |key: &'static str| {
            get(key).ok_or_else(|| BrokerError::MissingConfiguration(vec![key]))
        };

        let tunnel = TunnelConfig {
            ssh_host: required(SSH_HOST)?,
            ssh_port: parse_value(SSH_PORT, &required(SSH_PORT)?)?,
            ssh_user: required(SSH_USER)?,
            key_path: PathBuf::from(required(SSH_KEY_PATH)?),
            key_passphrase: get(SSH_KEY_PASSPHRASE),
            remote_host: get(DB_REMOTE_HOST).unwrap_or_else(|| "127.0.0.1".to_string()),
            remote_port: parse_or(&get, DB_REMOTE_PORT, 5432)?,
            strict_host_key_checking: flag_or(&get, SSH_STRICT_HOST_KEY_CHECKING, false)?,
            known_hosts: get(SSH_KNOWN_HOSTS).map(PathBuf::from),
            connect_timeout: Duration::from_secs(parse_or(&get, SSH_CONNECT_TIMEOUT_SECS, 15)?),
        };

        let database = DatabaseConfig {
            user: required(DB_USER)?,
            password: required(DB_PASSWORD)?,
            dbname: required(DB_NAME)?,
        };

        let defaults = PoolSettings::default();
        let acquire_secs: u64 = parse_or(&get, POOL_ACQUIRE_TIMEOUT_SECS, 30)?;
        let pool = PoolSettings {
            min_size: parse_or(&get, POOL_MIN_SIZE, defaults.min_size)?,
            max_size: parse_or(&get, POOL_MAX_SIZE, defaults.max_size)?,
            acquire_timeout: (acquire_secs > 0).then(|| Duration::from_secs(acquire_secs)),
            connect_timeout: Duration::from_secs(parse_or(&get, DB_CONNECT_TIMEOUT_SECS, 10)?),
        };
        pool.validate()?;

        let translate_placeholders = flag_or(&get, DB_TRANSLATE_PLACEHOLDERS, true)?;

        Ok(Self {
            tunnel,
            database,
            pool,
            translate_placeholders,
        })
    }

    /// Replace the pool settings.
    #[must_use]
    pub fn with_pool(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }

    /// Replace the tunnel settings.
    #[must_use]
    pub fn with_tunnel(mut self, tunnel: TunnelConfig) -> Self {
        self.tunnel = tunnel;
        self
    }

    /// Set the pool-wide placeholder translation default.
    #[must_use]
    pub fn with_translate_placeholders(mut self, enabled: bool) -> Self {
        self.translate_placeholders = enabled;
        self
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, BrokerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => parse_value(key, &raw),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, BrokerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| {
        BrokerError::InvalidConfiguration(format!("{key}={raw:?} is not valid: {e}"))
    })
}

fn flag_or<G>(get: &G, key: &str, default: bool) -> Result<bool, BrokerError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => parse_bool(&raw).ok_or_else(|| {
            BrokerError::InvalidConfiguration(format!("{key} must be true or false, got {raw:?}"))
        }),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
