//! Layered configuration for the batch pipeline and the HTTP gateway.
//!
//! Sources, lowest precedence first: built-in defaults, an optional TOML file
//! (`NATAL_CONFIG`, default `config/natal.toml`), then `NATAL_*` environment variables
//! with `__` separating nested keys (`NATAL_TRAINER__FOREST__N_TREES=200`).

use crate::error::ConfigError;
use crate::trainer::TrainerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "NATAL_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/natal.toml";

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_max_records() -> usize {
    crate::dataset::MAX_RECORDS
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

/// Settings of the offline pipeline.
///
/// | Key | Default | Description |
/// |-----|---------|-------------|
/// | data_dir | ./data | Directory holding every stage's input and output |
/// | max_records | 1000 | Row cap of the reduced table |
/// | use_remote | false | Consult the remote database (requires `ASTRO_DB_BASE_URL`) |
/// | trainer.* | see [`TrainerConfig`] | Holdout and forest parameters |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_max_records")]
    pub max_records: usize,
    #[serde(default)]
    pub use_remote: bool,
    #[serde(default)]
    pub trainer: TrainerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_records: default_max_records(),
            use_remote: false,
            trainer: TrainerConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let builder = config::Config::builder()
            .set_default("data_dir", "./data")?
            .set_default("max_records", default_max_records() as i64)?
            .set_default("use_remote", false)?;
        Ok(with_sources(builder, path)?.try_deserialize()?)
    }

    /// TOML rendering, suitable as a starting config file.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Settings of the HTTP gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Model bundle written by the `train` stage.
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    /// Prepared table used for similar-profile search.
    #[serde(default)]
    pub prepared_path: Option<PathBuf>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl GatewayConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let builder = config::Config::builder()
            .set_default("host", default_host())?
            .set_default("port", i64::from(default_port()))?
            .set_default("data_dir", "./data")?;
        Ok(with_sources(builder, path)?.try_deserialize()?)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn model_path(&self) -> PathBuf {
        self.model_path
            .clone()
            .unwrap_or_else(|| crate::artifacts::ArtifactPaths::new(&self.data_dir).model())
    }

    pub fn prepared_path(&self) -> PathBuf {
        self.prepared_path
            .clone()
            .unwrap_or_else(|| crate::artifacts::ArtifactPaths::new(&self.data_dir).prepared())
    }
}

/// Config file to read: explicit path, else `NATAL_CONFIG`, else the default location.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn with_sources(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
    path: Option<&Path>,
) -> Result<config::Config, ConfigError> {
    let path = config_path(path);
    let builder = if path.exists() {
        builder.add_source(config::File::from(path.as_path()))
    } else {
        builder
    };
    Ok(builder
        .add_source(
            config::Environment::with_prefix("NATAL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?)
}
