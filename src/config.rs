//! Client configuration.
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. `config/default.toml` (optional)
//! 2. `config/local.toml` (optional)
//! 3. Environment variables prefixed with `PHANT_` (e.g. `PHANT_PRIVATE_KEY`)
//!
//! Keys can also come from the JSON document the service returns when a
//! stream is created, see [`ClientSettings::from_keys_file`].

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

use crate::Result;

pub const DEFAULT_BASE_URL: &str = "http://data.sparkfun.com";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ClientSettings {
    pub public_key: String,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub delete_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Field names; empty means discover them from the server.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Selects the encrypted codec when set.
    #[serde(default)]
    pub passphrase: Option<String>,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

/// Keys document handed out by the service on stream creation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeysFile {
    public_key: String,
    #[serde(default)]
    private_key: Option<String>,
    #[serde(default)]
    delete_key: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

impl ClientSettings {
    pub fn new() -> std::result::Result<Self, ConfigError> {
        Self::from_dir(Path::new("config"))
    }

    /// Load settings with `config_dir` holding `default.toml` and `local.toml`.
    pub fn from_dir(config_dir: &Path) -> std::result::Result<Self, ConfigError> {
        Self::load(config_dir, None)
    }

    /// Load layered settings, with `public_key` overriding every source when
    /// given. The files then need not name a public key.
    pub fn load(config_dir: &Path, public_key: Option<&str>) -> std::result::Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("PHANT")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("fields")
                    .try_parsing(true),
            );
        if let Some(public_key) = public_key {
            builder = builder.set_override("public_key", public_key)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn with_public_key(public_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            private_key: None,
            delete_key: None,
            base_url: default_base_url(),
            title: None,
            fields: Vec::new(),
            passphrase: None,
        }
    }

    /// Read stream keys from a JSON keys file.
    pub fn from_keys_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let keys: KeysFile = serde_json::from_str(&contents)?;
        let mut settings = Self::with_public_key(keys.public_key);
        settings.private_key = keys.private_key;
        settings.delete_key = keys.delete_key;
        settings.title = keys.title;
        Ok(settings)
    }
}
