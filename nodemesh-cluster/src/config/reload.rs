//! Live patching of membership tunables from a remote config source

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::tunables::{ApplyMode, MemberlistConfig};
use super::Settings;
use crate::error::{Error, Result};

/// Remote keys this layer reacts to; `nodemesh.mem.dead.timeout` maps to `mem_dead_timeout`
pub const REMOTE_PREFIX: &str = "nodemesh.mem.";

/// Settings key switching the environment mirror off with `false`
pub const MIRROR_ENV_KEY: &str = "config_mirror_env";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

/// One key's change as reported by a watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub change_type: ChangeType,
}

/// Dotted key -> change
pub type ChangeEvent = HashMap<String, ConfigChange>;

/// Remote configuration backends a watcher may be registered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteConfigKind {
    Etcd,
    Nacos,
    Apollo,
}

impl FromStr for RemoteConfigKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "etcd" => Ok(Self::Etcd),
            "nacos" => Ok(Self::Nacos),
            "apollo" => Ok(Self::Apollo),
            other => Err(Error::Configuration(format!(
                "Unknown remote config backend: {other}"
            ))),
        }
    }
}

/// A remote config source that pushes change events to a reloader
pub trait ConfigWatcher: Send + Sync {
    fn kind(&self) -> RemoteConfigKind;

    fn watch(&self, reloader: Arc<ConfigReloader>) -> Result<()>;
}

/// Settings key for a dotted remote key under [`REMOTE_PREFIX`]
#[must_use]
pub fn settings_key(remote_key: &str) -> Option<String> {
    let rest = remote_key.strip_prefix(REMOTE_PREFIX)?;
    if rest.is_empty() {
        return None;
    }
    Some(format!("mem_{}", rest.replace('.', "_")).to_lowercase())
}

/// Applies remote change events to the live engine configuration
///
/// Accepted values are mirrored into the process environment unless
/// `config_mirror_env` is `false`. Writing the environment is only sound
/// while no other thread reads it (C libraries calling `getenv` included);
/// processes that cannot guarantee that turn the mirror off.
pub struct ConfigReloader {
    settings: Mutex<Settings>,
    config: Arc<RwLock<MemberlistConfig>>,
    primed: AtomicBool,
    mirror_env: bool,
}

impl ConfigReloader {
    #[must_use]
    pub fn new(settings: Settings, config: Arc<RwLock<MemberlistConfig>>) -> Self {
        let mirror_env = !matches!(
            settings.get(MIRROR_ENV_KEY).map(str::to_lowercase).as_deref(),
            Some("false" | "0" | "no" | "off")
        );
        Self {
            settings: Mutex::new(settings),
            config,
            primed: AtomicBool::new(false),
            mirror_env,
        }
    }

    #[must_use]
    pub const fn mirrors_env(&self) -> bool {
        self.mirror_env
    }

    /// Apply one change event; returns how many keys were accepted
    ///
    /// The first event after registration is the watcher's own snapshot and
    /// is discarded.
    pub fn on_change(&self, event: &ChangeEvent) -> usize {
        if !self.primed.swap(true, Ordering::AcqRel) {
            tracing::debug!(keys = event.len(), "Skipping initial config snapshot");
            return 0;
        }

        let mut keys: Vec<_> = event.keys().collect();
        keys.sort();

        let mut settings = self.settings.lock();
        let mut accepted = 0usize;
        for remote_key in keys {
            let Some(key) = settings_key(remote_key) else {
                continue;
            };
            let change = &event[remote_key];
            let env = Settings::env_var(&key);
            match (change.change_type, change.new_value.as_deref()) {
                (ChangeType::Added | ChangeType::Modified, Some(value)) => {
                    settings.set(key.clone(), value);
                    if self.mirror_env {
                        std::env::set_var(&env, value);
                    }
                }
                (ChangeType::Added | ChangeType::Modified, None) | (ChangeType::Deleted, _) => {
                    settings.remove(&key);
                    if self.mirror_env {
                        std::env::remove_var(&env);
                    }
                }
            }
            tracing::info!(
                key = %remote_key,
                old = ?change.old_value,
                new = ?change.new_value,
                change = ?change.change_type,
                "Membership setting changed"
            );
            accepted += 1;
        }

        if accepted > 0 {
            let level = {
                let mut config = self.config.write();
                let before = config.log_level.clone();
                config.apply_settings(&settings, ApplyMode::Live);
                (config.log_level != before).then(|| config.log_level.clone())
            };
            if let Some(level) = level {
                Self::apply_log_level(&level);
            }
        }
        accepted
    }

    fn apply_log_level(level: &str) {
        match crate::logging::set_membership_level(level) {
            Ok(true) => tracing::info!(level, "Membership log level changed"),
            Ok(false) => tracing::debug!(level, "No reloadable subscriber installed"),
            Err(e) => tracing::warn!(level, error = %e, "Failed to change membership log level"),
        }
    }

    /// Current live settings
    #[must_use]
    pub fn settings(&self) -> Settings {
        self.settings.lock().clone()
    }
}
