//! Configuration of a [crate::Store], loaded from YAML.
//!
//! ```yaml
//! database: /var/lib/mixclient/store.db
//! connect_timeout_ms: 1000
//! compact_after: 67108864
//! accounts:
//!   - alice
//!   - bob
//! ```

use crate::{engine, Error};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet, fs::File, num::NonZeroU64, path::Path, path::PathBuf, time::Duration,
};

fn default_connect_timeout_ms() -> u64 {
    1_000
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Path of the store's database.
    pub database: PathBuf,

    /// How long to wait for another process to release the store.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Return free pages to the filesystem once more than this many bytes are
    /// free.
    #[serde(default)]
    pub compact_after: Option<NonZeroU64>,

    /// Accounts whose partitions are created when the store is opened.
    #[serde(default)]
    pub accounts: Vec<String>,
}

impl Config {
    /// A configuration with defaults for everything but the path of the database.
    pub fn new(database: impl Into<PathBuf>) -> Self {
        Self {
            database: database.into(),
            connect_timeout_ms: default_connect_timeout_ms(),
            compact_after: None,
            accounts: Vec::new(),
        }
    }

    /// Read and validate the configuration stored at `path`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?;
        let config: Self = serde_yaml::from_reader(file)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration can be used to open a store.
    pub fn validate(&self) -> Result<(), Error> {
        if self.database.as_os_str().is_empty() {
            return Err(Error::Config("database path is empty".into()));
        }
        let mut seen = HashSet::new();
        for account in &self.accounts {
            if account.is_empty() {
                return Err(Error::Config("account name is empty".into()));
            }
            if !seen.insert(account.as_str()) {
                return Err(Error::DuplicateRegistration(account.clone()));
            }
        }
        Ok(())
    }

    /// Configuration of the underlying [engine::Engine].
    pub fn engine(&self) -> engine::Config {
        engine::Config {
            path: self.database.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            compact_after: self.compact_after,
        }
    }
}
