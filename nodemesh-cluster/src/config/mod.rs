//! Configuration for the discovery layer
//!
//! Raw settings are a flat `key -> string` map; every typed value is derived
//! from it permissively, falling back to a default when a value is missing
//! or malformed.

pub mod reload;
pub mod tunables;

use std::collections::HashMap;
use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File};

use crate::error::{Error, Result};
use crate::logging::LoggingConfig;

pub use reload::{
    ChangeEvent, ChangeType, ConfigChange, ConfigReloader, ConfigWatcher, RemoteConfigKind,
};
pub use tunables::{ApplyMode, MemberlistConfig};

/// Environment prefix; `NODEMESH_MEM_PORT` maps to key `mem_port`
pub const ENV_PREFIX: &str = "NODEMESH";

/// Flat string settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    values: HashMap<String, String>,
}

impl Settings {
    /// Load from an optional file, overridden by `NODEMESH_*` environment variables
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).prefix_separator("_"));

        let values = builder
            .build()
            .and_then(|c| c.try_deserialize::<HashMap<String, String>>())
            .map_err(|e| Error::Configuration(format!("Failed to load settings: {e}")))?;

        Ok(Self {
            values: values
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect(),
        })
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Trimmed value for `key`; blank values count as absent
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    /// Environment variable carrying `key`
    #[must_use]
    pub fn env_var(key: &str) -> String {
        format!("{ENV_PREFIX}_{}", key.to_uppercase())
    }
}

/// Settings for the locally exposed services
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub name: String,
    /// Host peers use to reach the services; defaults to the advertise address
    pub host: String,
    pub http_port: u16,
    pub grpc_port: u16,
    pub route_root_path: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: String::new(),
            http_port: 6060,
            grpc_port: 50051,
            route_root_path: String::new(),
        }
    }
}

/// Everything a [`Cluster`](crate::Cluster) needs at startup
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub memberlist: MemberlistConfig,
    pub service: ServiceConfig,
    pub logging: LoggingConfig,
    /// Comma separated seed list
    pub seeds: String,
    pub remote_config: Option<RemoteConfigKind>,
}

impl ClusterConfig {
    /// Derive the typed configuration
    ///
    /// Only an unknown remote config backend is an error; every other
    /// malformed value falls back to its default.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let memberlist = MemberlistConfig::from_settings(settings);

        let defaults = ServiceConfig::default();
        let service = ServiceConfig {
            name: settings.get("service_name").unwrap_or_default().to_string(),
            host: settings
                .get("service_host")
                .map_or_else(|| memberlist.advertise_addr.clone(), str::to_string),
            http_port: tunables::parse_or(settings, "service_http_port", defaults.http_port),
            grpc_port: tunables::parse_or(settings, "service_grpc_port", defaults.grpc_port),
            route_root_path: settings
                .get("service_route_root_path")
                .unwrap_or_default()
                .to_string(),
        };

        let remote_config = settings
            .get("config_remote_type")
            .map(str::parse::<RemoteConfigKind>)
            .transpose()?;

        Ok(Self {
            memberlist,
            service,
            logging: LoggingConfig::from_settings(settings),
            seeds: settings.get("mem_seed").unwrap_or_default().to_string(),
            remote_config,
        })
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let memberlist = MemberlistConfig::default();
        Self {
            service: ServiceConfig {
                host: memberlist.advertise_addr.clone(),
                ..ServiceConfig::default()
            },
            memberlist,
            logging: LoggingConfig::default(),
            seeds: String::new(),
            remote_config: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_get_trims_and_skips_blank() {
        let settings = Settings::from_pairs([("a", " 1 "), ("b", "   ")]);
        assert_eq!(settings.get("a"), Some("1"));
        assert_eq!(settings.get("b"), None);
        assert_eq!(settings.get("c"), None);
    }

    #[test]
    fn test_env_var_name() {
        assert_eq!(Settings::env_var("mem_dead_timeout"), "NODEMESH_MEM_DEAD_TIMEOUT");
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("nodemesh-{}", nanoid::nanoid!(8)));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cluster.toml");
        std::fs::write(&path, "mem_probe_interval = \"2s\"\nservice_name = \"orders\"\n").unwrap();

        let settings = Settings::load(path.to_str()).unwrap();
        assert_eq!(settings.get("mem_probe_interval"), Some("2s"));
        assert_eq!(settings.get("service_name"), Some("orders"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_cluster_config_from_settings() {
        let settings = Settings::from_pairs([
            ("mem_advertise_host", "10.0.0.4"),
            ("service_name", "orders"),
            ("service_http_port", "8080"),
            ("service_grpc_port", "nope"),
            ("mem_seed", "10.0.0.1,10.0.0.2"),
        ]);
        let config = ClusterConfig::from_settings(&settings).unwrap();
        assert_eq!(config.service.name, "orders");
        assert_eq!(config.service.host, "10.0.0.4");
        assert_eq!(config.service.http_port, 8080);
        assert_eq!(config.service.grpc_port, 50051);
        assert_eq!(config.seeds, "10.0.0.1,10.0.0.2");
        assert!(config.remote_config.is_none());
    }

    #[test]
    fn test_unknown_remote_backend_is_fatal() {
        let settings = Settings::from_pairs([("config_remote_type", "zookeeper")]);
        assert!(matches!(
            ClusterConfig::from_settings(&settings),
            Err(Error::Configuration(_))
        ));

        let settings = Settings::from_pairs([("config_remote_type", "etcd")]);
        let config = ClusterConfig::from_settings(&settings).unwrap();
        assert_eq!(config.remote_config, Some(RemoteConfigKind::Etcd));
    }
}
