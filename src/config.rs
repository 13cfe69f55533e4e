//! Config module for ipa-fetcher

use std::{path::PathBuf, time::Duration};

use clap::{Parser, ValueEnum};

use crate::download::{DEFAULT_FAILURE_BUFFER, EngineConfig};

/// What to do when a new transfer would land on a destination that is taken
#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[clap(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Append ` (n)` to the file stem until the name is free
    #[default]
    Rename,
    /// Refuse to start the transfer
    Reject,
}

#[derive(Parser, Debug, Clone)]
pub struct StorageConfig {
    /// Directory finished packages are stored in
    #[clap(long, env = "IPAF_STORAGE_DIR", default_value_t = get_default_storage_dir())]
    pub storage_dir: String,

    /// Directory partial downloads are written to, defaults to `<storage>/.staging`
    #[clap(long, env = "IPAF_STAGING_DIR")]
    pub staging_dir: Option<String>,

    #[clap(long, env = "IPAF_COLLISION_POLICY", value_enum, default_value = "rename")]
    pub collision_policy: CollisionPolicy,

    /// Unread failure notices kept per observer
    #[clap(long, env = "IPAF_FAILURE_BUFFER", default_value_t = DEFAULT_FAILURE_BUFFER)]
    pub failure_buffer: usize,
}

#[derive(Parser, Debug, Clone)]
pub struct HttpConfig {
    #[clap(long, env = "IPAF_CONNECT_TIMEOUT_SECS", default_value = "30")]
    pub connect_timeout_secs: u64,

    /// Upper bound for a whole request, body included
    #[clap(long, env = "IPAF_TIMEOUT_SECS", default_value = "300")]
    pub timeout_secs: u64,

    #[clap(long, env = "IPAF_MAX_REDIRECTS", default_value = "10")]
    pub max_redirects: usize,

    #[clap(long, env = "IPAF_USER_AGENT", default_value = concat!("ipa-fetcher/", env!("CARGO_PKG_VERSION")))]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            timeout_secs: 300,
            max_redirects: 10,
            user_agent: concat!("ipa-fetcher/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Safely determine the default storage directory
fn get_default_storage_dir() -> String {
    dirs::document_dir()
        .or_else(dirs::home_dir)
        .map(|docs| docs.join("Downloads"))
        .and_then(|path| path.to_str().map(String::from))
        .unwrap_or_else(|| "Downloads".to_string())
}

impl StorageConfig {
    pub fn storage_path(&self) -> PathBuf {
        self.storage_dir.clone().into()
    }

    pub fn staging_path(&self) -> PathBuf {
        match &self.staging_dir {
            Some(dir) if !dir.is_empty() => dir.into(),
            _ => self.storage_path().join(".staging"),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            storage_dir: self.storage_path(),
            staging_dir: self.staging_path(),
            collision_policy: self.collision_policy,
            failure_buffer: self.failure_buffer,
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct Config {
    #[clap(flatten)]
    pub storage: StorageConfig,

    #[clap(flatten)]
    pub http: HttpConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_defaults_inside_storage() {
        let config = StorageConfig {
            storage_dir: "/data/Downloads".to_string(),
            staging_dir: None,
            collision_policy: CollisionPolicy::Rename,
            failure_buffer: DEFAULT_FAILURE_BUFFER,
        };
        assert_eq!(
            config.staging_path(),
            PathBuf::from("/data/Downloads/.staging")
        );
    }

    #[test]
    fn test_parse_flags() {
        let config = Config::parse_from([
            "ipa-fetcher",
            "--storage-dir",
            "/srv/ipa",
            "--collision-policy",
            "reject",
            "--timeout-secs",
            "60",
        ]);
        assert_eq!(config.storage.storage_path(), PathBuf::from("/srv/ipa"));
        assert_eq!(config.storage.collision_policy, CollisionPolicy::Reject);
        assert_eq!(config.http.timeout(), Duration::from_secs(60));
        assert_eq!(config.http.max_redirects, 10);
        assert_eq!(config.storage.failure_buffer, DEFAULT_FAILURE_BUFFER);

        let config = Config::parse_from(["ipa-fetcher", "--failure-buffer", "256"]);
        assert_eq!(config.storage.engine_config().failure_buffer, 256);
    }
}
