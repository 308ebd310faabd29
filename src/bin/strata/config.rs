use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata::types::Order;
use strata::{DataSourceOptions, RetryPolicy};
use thiserror::Error;

use super::OutputFormat;

/// Settings read from `config.toml`; command-line flags take precedence.
#[derive(Debug, Default)]
pub struct CliConfig {
    path: Option<PathBuf>,
    data: RawConfig,
}

impl CliConfig {
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let required = explicit.is_some();
        let path = explicit.or_else(default_config_path);
        let data = match path.as_ref() {
            Some(config_path) if config_path.exists() => read_file(config_path)?,
            Some(config_path) if required => {
                return Err(ConfigError::Missing {
                    path: config_path.clone(),
                })
            }
            _ => RawConfig::default(),
        };
        let config = Self { path, data };
        config.validate()?;
        Ok(config)
    }

    #[cfg(test)]
    fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let data = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        let config = Self { path: None, data };
        config.validate()?;
        Ok(config)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn default_order(&self) -> Result<Option<Order>, ConfigError> {
        self.data
            .explore
            .order
            .as_deref()
            .map(|raw| {
                raw.parse().map_err(|message| ConfigError::InvalidValue {
                    key: "explore.order".into(),
                    message,
                })
            })
            .transpose()
    }

    pub fn default_format(&self) -> Option<OutputFormat> {
        self.data.explore.format
    }

    /// Engine options with every configured override applied.
    pub fn data_source_options(&self) -> DataSourceOptions {
        let explore = &self.data.explore;
        let mut options = DataSourceOptions::new();
        if let Some(rows) = explore.page_size {
            options = options.page_size(rows);
        }
        for (level, rows) in &explore.level_page_sizes {
            if let Ok(level) = level.parse::<usize>() {
                options = options.level_page_size(level, *rows);
            }
        }
        let retry = &self.data.retry;
        if let Some(attempts) = retry.max_attempts {
            options = options.retry(RetryPolicy::exponential(
                attempts,
                Duration::from_millis(retry.initial_backoff_ms.unwrap_or(100)),
                Duration::from_millis(retry.max_backoff_ms.unwrap_or(2_000)),
            ));
        }
        options
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.default_order()?;
        for level in self.data.explore.level_page_sizes.keys() {
            match level.parse::<usize>() {
                Ok(n) if n >= 1 => {}
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: format!("explore.level_page_sizes.{level}"),
                        message: "level must be a positive integer".into(),
                    })
                }
            }
        }
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<RawConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RawConfig {
    #[serde(default)]
    explore: ExploreSection,
    #[serde(default)]
    retry: RetrySection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct ExploreSection {
    page_size: Option<usize>,
    #[serde(default)]
    level_page_sizes: BTreeMap<String, usize>,
    order: Option<String>,
    format: Option<OutputFormat>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RetrySection {
    max_attempts: Option<u32>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read CLI config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse CLI config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("CLI config {path} does not exist")]
    Missing { path: PathBuf },
    #[error("invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("strata").join("config.toml"))
}
