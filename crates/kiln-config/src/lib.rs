//! TOML-based settings for the Kiln daemon: one file, one struct, built-in
//! defaults for everything it doesn't define. Unlike the richer
//! multi-source/XDG configuration some sibling tools in this family carry,
//! a replication daemon has a short, flat list of knobs (bind address,
//! dataset location, replication timing) that don't benefit from
//! per-environment layering — a single `kiln.toml` plus a `--config` flag
//! is enough.

use std::fs;
use std::path::{Path, PathBuf};

use kiln_types::EvictionPolicy;
use serde::{Deserialize, Serialize};

mod error;

pub use error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bind_address: String,
    pub data_dir: PathBuf,
    pub db_count: u32,
    pub max_connections: u32,
    pub maxmemory_policy: MaxMemoryPolicy,
    pub replication: ReplicationSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:6380".to_string(),
            data_dir: PathBuf::from(".kiln/data"),
            db_count: 16,
            max_connections: 10_000,
            maxmemory_policy: MaxMemoryPolicy::default(),
            replication: ReplicationSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MaxMemoryPolicy {
    #[default]
    NoEviction,
    AllKeysLru,
    AllKeysLfu,
    VolatileLru,
    VolatileLfu,
    VolatileTtl,
    AllKeysRandom,
    VolatileRandom,
}

impl From<MaxMemoryPolicy> for EvictionPolicy {
    fn from(policy: MaxMemoryPolicy) -> Self {
        match policy {
            MaxMemoryPolicy::NoEviction => EvictionPolicy::NoEviction,
            MaxMemoryPolicy::AllKeysLru => EvictionPolicy::AllKeysLru,
            MaxMemoryPolicy::AllKeysLfu => EvictionPolicy::AllKeysLfu,
            MaxMemoryPolicy::VolatileLru => EvictionPolicy::VolatileLru,
            MaxMemoryPolicy::VolatileLfu => EvictionPolicy::VolatileLfu,
            MaxMemoryPolicy::VolatileTtl => EvictionPolicy::VolatileTtl,
            MaxMemoryPolicy::AllKeysRandom => EvictionPolicy::AllKeysRandom,
            MaxMemoryPolicy::VolatileRandom => EvictionPolicy::VolatileRandom,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationSettings {
    pub backlog_capacity: usize,
    pub replica_ack_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub diskless_sync: bool,
    pub diskless_sync_delay_secs: u64,
    pub rdb_path: PathBuf,
    /// Address this node announces to its primary via `REPLCONF ip-address`
    /// during the handshake, e.g. when the replica is behind a NAT and its
    /// outbound socket address isn't the one other replicas should dial.
    /// Empty string means "let the primary use the address it sees on the
    /// connection", matching Redis's own `replica-announce-ip` default.
    pub announce_ip: String,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            backlog_capacity: 1024 * 1024,
            replica_ack_timeout_secs: 60,
            ping_interval_secs: 10,
            diskless_sync: false,
            diskless_sync_delay_secs: 5,
            rdb_path: PathBuf::from("dump.rdb"),
            announce_ip: String::new(),
        }
    }
}

impl Settings {
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads `path` if it exists, falling back to built-in defaults
    /// otherwise — the common case for a daemon started without
    /// `--config`.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolves `data_dir` and `replication.rdb_path` against `base_dir`
    /// if they were given as relative paths.
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        let base = base_dir.as_ref();
        if self.data_dir.is_relative() {
            self.data_dir = base.join(&self.data_dir);
        }
        if self.replication.rdb_path.is_relative() {
            self.replication.rdb_path = base.join(&self.replication.rdb_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable_standalone_settings() {
        let settings = Settings::default();
        assert_eq!(settings.bind_address, "127.0.0.1:6380");
        assert_eq!(settings.db_count, 16);
        assert_eq!(settings.maxmemory_policy, MaxMemoryPolicy::NoEviction);
    }

    #[test]
    fn parses_partial_toml_with_defaults_for_the_rest() {
        let settings = Settings::from_toml_str(
            r#"
            bind_address = "0.0.0.0:7000"

            [replication]
            backlog_capacity = 2048
            "#,
        )
        .unwrap();
        assert_eq!(settings.bind_address, "0.0.0.0:7000");
        assert_eq!(settings.replication.backlog_capacity, 2048);
        assert_eq!(settings.replication.ping_interval_secs, 10);
    }

    #[test]
    fn load_or_default_falls_back_when_file_missing() {
        let settings = Settings::load_or_default("/nonexistent/kiln.toml").unwrap();
        assert_eq!(settings.bind_address, Settings::default().bind_address);
    }

    #[test]
    fn resolve_paths_joins_relative_paths_to_base() {
        let mut settings = Settings::default();
        settings.resolve_paths("/srv/kiln");
        assert_eq!(settings.data_dir, PathBuf::from("/srv/kiln/.kiln/data"));
        assert_eq!(
            settings.replication.rdb_path,
            PathBuf::from("/srv/kiln/dump.rdb")
        );
    }

    #[test]
    fn maxmemory_policy_maps_onto_kiln_types_eviction_policy() {
        let into: EvictionPolicy = MaxMemoryPolicy::AllKeysLru.into();
        assert_eq!(into, EvictionPolicy::AllKeysLru);
    }
}
