//! Configuration management for Gatekeeper.
//!
//! Settings are read from an optional YAML file and then overridden by
//! environment variables prefixed with `GATEKEEPER`, using `__` between
//! nesting levels (e.g. `GATEKEEPER__STORE__BACKEND=redis`).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ratelimit::{ClientLimit, FailurePolicy, LimitTable};
use crate::store::LocalStoreConfig;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Client limits and failure handling
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local counters
    #[default]
    Memory,
    /// Counters shared through Redis
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, used by the `redis` backend
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Bound on each Redis round trip in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Interval between sweeps of expired local counters in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// How long expired local counters linger before a sweep evicts them
    #[serde(default)]
    pub sweep_grace_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            command_timeout_ms: default_command_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            sweep_grace_secs: 0,
        }
    }
}

impl StoreConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn local_store_config(&self) -> LocalStoreConfig {
        LocalStoreConfig {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            sweep_grace: Duration::from_secs(self.sweep_grace_secs),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_command_timeout_ms() -> u64 {
    500
}

fn default_sweep_interval_secs() -> u64 {
    30
}

/// Client limits and the policy applied when the store fails.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Limit for clients without an explicit entry
    #[serde(default)]
    pub default: ClientLimit,

    /// Per-client limits
    #[serde(default)]
    pub clients: HashMap<String, ClientLimit>,

    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl LimitsConfig {
    /// Build the limit table these settings describe.
    pub fn table(&self) -> LimitTable {
        LimitTable {
            default: self.default,
            clients: self.clients.clone(),
        }
    }
}

/// Log output configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Settings {
    /// Load settings from an optional YAML file, then apply environment overrides.
    ///
    /// The `config` crate lowercases every key it reads. Client ids are
    /// case-sensitive, so the ids under `limits.clients` are read back from
    /// the file and restored after the layers are merged.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut settings: Settings = builder
            .build()
            .and_then(|raw| raw.try_deserialize())
            .map_err(|e| Error::Config(format!("Failed to load settings: {}", e)))?;

        if let Some(path) = path {
            let client_ids = client_ids_in_file(path)?;
            settings.limits.clients = restore_client_case(settings.limits.clients, &client_ids);
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings: Settings =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings that would make every decision fail.
    pub fn validate(&self) -> Result<()> {
        self.limits.table().validate()?;
        if self.store.command_timeout_ms == 0 {
            return Err(Error::Config(
                "store.command_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Only the client ids of a settings file, as written.
#[derive(Debug, Default, Deserialize)]
struct FileClientIds {
    #[serde(default)]
    limits: FileClients,
}

#[derive(Debug, Default, Deserialize)]
struct FileClients {
    #[serde(default)]
    clients: HashMap<String, serde::de::IgnoredAny>,
}

fn client_ids_in_file(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)?;
    let file: Option<FileClientIds> = serde_yaml::from_str(&contents)
        .map_err(|e| Error::Config(format!("Failed to read client ids: {}", e)))?;
    let ids: Vec<String> = file
        .map(|file| file.limits.clients.into_keys().collect())
        .unwrap_or_default();

    let mut seen = HashMap::new();
    for id in &ids {
        if let Some(other) = seen.insert(id.to_lowercase(), id) {
            return Err(Error::Config(format!(
                "client ids {:?} and {:?} differ only in case",
                other, id
            )));
        }
    }
    Ok(ids)
}

/// Re-key merged client limits with the ids as written in the file.
///
/// Keys with no file counterpart came from the environment and stay as-is.
fn restore_client_case(
    clients: HashMap<String, ClientLimit>,
    file_ids: &[String],
) -> HashMap<String, ClientLimit> {
    clients
        .into_iter()
        .map(|(key, limit)| {
            let id = file_ids
                .iter()
                .find(|id| id.to_lowercase() == key)
                .cloned()
                .unwrap_or(key);
            (id, limit)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.server.listen_addr, default_listen_addr());
        assert_eq!(settings.store.backend, StoreBackend::Memory);
        assert_eq!(settings.store.command_timeout(), Duration::from_millis(500));
        assert_eq!(
            settings.store.local_store_config().sweep_interval,
            Duration::from_secs(30)
        );
        assert_eq!(settings.limits.default, ClientLimit::default());
        assert_eq!(settings.limits.failure_policy, FailurePolicy::Open);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
server:
  listen_addr: "0.0.0.0:9000"
store:
  backend: redis
  redis_url: "redis://cache:6379"
  command_timeout_ms: 250
limits:
  failure_policy: closed
  default:
    requests: 100
    window_secs: 60
  clients:
    client-1:
      requests: 5
      window_secs: 60
logging:
  json: true
"#;
        let settings = Settings::from_yaml(yaml).unwrap();
        assert_eq!(settings.server.listen_addr.port(), 9000);
        assert_eq!(settings.store.backend, StoreBackend::Redis);
        assert_eq!(settings.store.redis_url, "redis://cache:6379");
        assert_eq!(settings.limits.failure_policy, FailurePolicy::Closed);
        assert_eq!(settings.limits.table().resolve("client-1").requests, 5);
        assert!(settings.logging.json);
    }

    #[test]
    fn test_rejects_zero_window() {
        let yaml = r#"
limits:
  default:
    requests: 10
    window_secs: 0
"#;
        let err = Settings::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    fn write_settings(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "gatekeeper-{}-{}.yaml",
            name,
            std::process::id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_file_through_config_builder() {
        let path = write_settings(
            "defaults",
            "limits:\n  default:\n    requests: 7\n    window_secs: 30\n",
        );

        let settings = Settings::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(settings.limits.default, ClientLimit::new(7, Duration::from_secs(30)));
        assert_eq!(settings.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_load_keeps_client_id_case() {
        let path = write_settings(
            "mixed-case",
            r#"
limits:
  clients:
    Client-A:
      requests: 5
      window_secs: 60
    client-b:
      requests: 9
      window_secs: 10
"#,
        );

        let settings = Settings::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        let table = settings.limits.table();
        assert_eq!(table.resolve("Client-A").requests, 5);
        assert_eq!(table.resolve("client-b").requests, 9);
        // Lookups stay case-sensitive.
        assert_eq!(table.resolve("client-a"), ClientLimit::default());
    }

    #[test]
    fn test_load_rejects_ids_differing_only_in_case() {
        let path = write_settings(
            "case-clash",
            r#"
limits:
  clients:
    Client-A:
      requests: 5
      window_secs: 60
    client-a:
      requests: 9
      window_secs: 60
"#,
        );

        let err = Settings::load(Some(&path)).unwrap_err();
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_restore_client_case_keeps_unmatched_keys() {
        let mut merged = HashMap::new();
        merged.insert("client-a".to_string(), ClientLimit::new(5, Duration::from_secs(60)));
        merged.insert("from-env".to_string(), ClientLimit::new(3, Duration::from_secs(1)));

        let restored = restore_client_case(merged, &["Client-A".to_string()]);

        assert_eq!(restored["Client-A"].requests, 5);
        assert_eq!(restored["from-env"].requests, 3);
        assert!(!restored.contains_key("client-a"));
    }
}
