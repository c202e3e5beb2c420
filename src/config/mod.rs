mod basic;
mod store;

pub use basic::BasicConfig;
pub use store::StoreConfig;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// Process-level settings (see `basic` table in config.toml).
    #[serde(default)]
    pub basic: BasicConfig,

    /// Backing store and synchronization settings (see `store` table in config.toml).
    #[serde(default)]
    pub store: StoreConfig,
}

const DEFAULT_CONFIG_FILE: &str = "config.toml";

impl Config {
    /// Builds a Figment that merges defaults and a config TOML file, if present.
    pub fn figment_for(path: &Path) -> Figment {
        let figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if path.is_file() {
            figment.merge(Toml::file(path))
        } else {
            figment
        }
    }

    pub fn figment() -> Figment {
        Self::figment_for(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Loads configuration by merging defaults and the TOML file at `path` if present.
    pub fn load(path: &Path) -> Result<Self, figment::Error> {
        Self::figment_for(path).extract()
    }

    /// Loads configuration by merging defaults and `config.toml` if present.
    pub fn from_optional_toml() -> Self {
        Self::figment().extract().unwrap_or_else(|err| {
            panic!("failed to extract configuration (defaults + optional config.toml): {err}")
        })
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }
}
