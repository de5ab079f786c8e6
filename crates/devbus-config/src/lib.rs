//! Configuration for devbus device servers and tools.
//!
//! A TOML file layered under environment overrides with figment, and
//! translation into the `devbus_core` option structs. The binary adds its
//! flag-aware wrappers on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use devbus_api::{ConnectionSpec, TANGO_HOST_ENV};
use devbus_core::{ContextOptions, PollingOptions, StoreOptions};

/// Prefix of environment overrides. Nested keys are joined with `__`, as
/// in `DEVBUS_SERVER__NAME`.
pub const ENV_PREFIX: &str = "DEVBUS_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level configuration shared by servers and the CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Database address, `host:port` or `host:port,host:port`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tango_host: Option<String>,

    /// Resource file used instead of a database server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_database: Option<PathBuf>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub timeouts: Timeouts,

    #[serde(default)]
    pub lock: LockConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerConfig {
    /// `ServerName/instance`.
    #[serde(default = "default_server_name")]
    pub name: String,

    /// Prefetch the server's configuration in one call at startup.
    #[serde(default = "default_true")]
    pub use_server_cache: bool,

    #[serde(default = "default_pool_size")]
    pub polling_threads_pool_size: usize,

    /// One comma-joined device list per polling thread.
    #[serde(default)]
    pub polling_threads_pool_conf: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            use_server_cache: true,
            polling_threads_pool_size: default_pool_size(),
            polling_threads_pool_conf: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Timeouts {
    #[serde(default = "default_request_ms")]
    pub request_ms: u64,

    #[serde(default = "default_handoff_ms")]
    pub polling_handoff_ms: u64,

    #[serde(default = "default_request_ms")]
    pub access_check_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request_ms: default_request_ms(),
            polling_handoff_ms: default_handoff_ms(),
            access_check_ms: default_request_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_validity")]
    pub default_validity_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_validity_secs: default_lock_validity(),
        }
    }
}

fn default_server_name() -> String {
    "devbus/default".into()
}
fn default_true() -> bool {
    true
}
fn default_pool_size() -> usize {
    1
}
fn default_request_ms() -> u64 {
    3000
}
fn default_handoff_ms() -> u64 {
    3200
}
fn default_lock_validity() -> u64 {
    10
}

// ── Validation and translation ──────────────────────────────────────

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.server.name.split_once('/') {
            Some((server, instance))
                if !server.is_empty() && !instance.is_empty() && !instance.contains('/') => {}
            _ => {
                return Err(invalid(
                    "server.name",
                    format!("expected 'ServerName/instance', got '{}'", self.server.name),
                ));
            }
        }
        if self.server.polling_threads_pool_size == 0 {
            return Err(invalid("server.polling_threads_pool_size", "must be at least 1"));
        }
        for (field, value) in [
            ("timeouts.request_ms", self.timeouts.request_ms),
            ("timeouts.polling_handoff_ms", self.timeouts.polling_handoff_ms),
            ("timeouts.access_check_ms", self.timeouts.access_check_ms),
            ("lock.default_validity_secs", self.lock.default_validity_secs),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        if let Some(host) = &self.tango_host {
            host.parse::<ConnectionSpec>()
                .map_err(|e| invalid("tango_host", e.to_string()))?;
        }
        Ok(())
    }

    /// Where property calls go: the resource file when one is configured,
    /// the database address otherwise.
    pub fn connection_spec(&self) -> Result<ConnectionSpec, ConfigError> {
        if let Some(path) = &self.file_database {
            return Ok(ConnectionSpec::file(path));
        }
        ConnectionSpec::resolve(self.tango_host.as_deref()).map_err(|e| invalid("tango_host", e.to_string()))
    }

    pub fn to_context_options(&self, host_name: &str) -> ContextOptions {
        let handoff = Duration::from_millis(self.timeouts.polling_handoff_ms);
        let defaults = ContextOptions::default();
        ContextOptions {
            server_instance: self.server.name.clone(),
            host_name: host_name.to_owned(),
            polling: PollingOptions {
                pool_size: self.server.polling_threads_pool_size,
                handoff_timeout: handoff,
                pool_conf: self.server.polling_threads_pool_conf.clone(),
                admin_device: format!("dserver/{}", self.server.name),
            },
            interface_handoff_timeout: handoff,
            default_lock_validity: Duration::from_secs(self.lock.default_validity_secs),
            ..defaults
        }
    }

    pub fn to_store_options(&self, host_name: &str) -> StoreOptions {
        StoreOptions {
            request_timeout: Duration::from_millis(self.timeouts.request_ms),
            access_check_timeout: Duration::from_millis(self.timeouts.access_check_ms),
            client_host: host_name.to_owned(),
            ..StoreOptions::default()
        }
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("rs", "devbus", "devbus").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("devbus");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Defaults, then `path`, then `DEVBUS_*`, then `TANGO_HOST`.
pub fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .merge(Env::raw().only(&[TANGO_HOST_ENV]).map(|_| "tango_host".into()))
}

/// Load and validate the configuration from the canonical path.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load and validate the configuration from `path`. A missing file is
/// not an error; defaults and the environment still apply.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let config: Config = figment(path).extract()?;
    config.validate()?;
    Ok(config)
}

/// Load config, returning a default if loading fails.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<PathBuf, ConfigError> {
    let path = config_path();
    save_config_to(cfg, &path)?;
    Ok(path)
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use figment::Jail;
    use pretty_assertions::assert_eq;

    use super::*;

    fn load(path: &str) -> figment::error::Result<Config> {
        load_config_from(Path::new(path)).map_err(|e| e.to_string().into())
    }

    #[test]
    fn missing_file_gives_defaults() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            let config = load("absent.toml")?;
            assert_eq!(config, Config::default());
            assert_eq!(config.server.name, "devbus/default");
            assert_eq!(config.timeouts.polling_handoff_ms, 3200);
            Ok(())
        });
    }

    #[test]
    fn file_values_are_read() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "devbus.toml",
                r#"
                tango_host = "db1:10000,db2:10000"
                [server]
                name = "Motors/lab"
                polling_threads_pool_size = 2
                polling_threads_pool_conf = ["sys/tg/1,sys/tg/2"]
                [lock]
                default_validity_secs = 30
                "#,
            )?;
            let config = load("devbus.toml")?;
            assert_eq!(config.tango_host.as_deref(), Some("db1:10000,db2:10000"));
            assert_eq!(config.server.polling_threads_pool_size, 2);
            assert!(config.server.use_server_cache);
            assert_eq!(config.lock.default_validity_secs, 30);
            assert!(config.connection_spec().unwrap().is_multi_host);
            Ok(())
        });
    }

    #[test]
    fn environment_overrides_the_file() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("devbus.toml", "[server]\nname = \"Motors/lab\"\n")?;
            jail.set_env("DEVBUS_SERVER__NAME", "Motors/test");
            jail.set_env("DEVBUS_TIMEOUTS__REQUEST_MS", "500");
            jail.set_env("DEVBUS_TANGO_HOST", "env:1");
            jail.set_env("TANGO_HOST", "legacy:20000");
            let config = load("devbus.toml")?;
            assert_eq!(config.server.name, "Motors/test");
            assert_eq!(config.timeouts.request_ms, 500);
            assert_eq!(config.tango_host.as_deref(), Some("legacy:20000"));
            Ok(())
        });
    }

    #[test]
    fn bad_values_are_rejected() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("name.toml", "[server]\nname = \"NoInstance\"\n")?;
            let err = load_config_from(Path::new("name.toml")).unwrap_err();
            assert!(err.to_string().contains("server.name"), "{err}");

            jail.create_file("host.toml", "tango_host = \"nohost\"\n")?;
            let err = load_config_from(Path::new("host.toml")).unwrap_err();
            assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "tango_host"));

            jail.create_file("pool.toml", "[server]\npolling_threads_pool_size = 0\n")?;
            assert!(load_config_from(Path::new("pool.toml")).is_err());
            Ok(())
        });
    }

    #[test]
    fn saved_config_loads_back() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            let mut config = Config::default();
            config.file_database = Some(PathBuf::from("/var/lib/devbus/db.res"));
            config.server.polling_threads_pool_conf = vec!["a/b/c".into()];
            let path = jail.directory().join("nested/config.toml");
            save_config_to(&config, &path).map_err(|e| e.to_string())?;
            assert_eq!(load(path.to_str().unwrap())?, config);
            Ok(())
        });
    }

    #[test]
    fn file_database_takes_precedence() {
        let config = Config {
            tango_host: Some("db:10000".into()),
            file_database: Some(PathBuf::from("/tmp/db.res")),
            ..Config::default()
        };
        let spec = config.connection_spec().unwrap();
        assert!(spec.is_file_backed);
        assert_eq!(spec.file_path.as_deref(), Some(Path::new("/tmp/db.res")));

        let err = Config::default().connection_spec().unwrap_err();
        assert!(err.to_string().contains("TANGO_HOST is not set"), "{err}");
    }

    #[test]
    fn context_options_follow_the_config() {
        let mut config = Config::default();
        config.server.name = "Motors/lab".into();
        config.server.polling_threads_pool_size = 3;
        config.timeouts.polling_handoff_ms = 1000;
        config.lock.default_validity_secs = 5;

        let options = config.to_context_options("ctrl01");
        assert_eq!(options.server_instance, "Motors/lab");
        assert_eq!(options.host_name, "ctrl01");
        assert_eq!(options.polling.pool_size, 3);
        assert_eq!(options.polling.admin_device, "dserver/Motors/lab");
        assert_eq!(options.polling.handoff_timeout, Duration::from_millis(1000));
        assert_eq!(options.default_lock_validity, Duration::from_secs(5));

        let store = config.to_store_options("ctrl01");
        assert_eq!(store.request_timeout, Duration::from_millis(3000));
        assert_eq!(store.client_host, "ctrl01");
        assert!(store.access_control);
    }
}
