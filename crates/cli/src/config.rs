//! `.cogworks/config.toml`.
//!
//! Every section is optional; a missing file is the same as an empty one.
//! API keys left empty in the file are filled from `ANTHROPIC_API_KEY`.

use std::path::{Path, PathBuf};

use extension_api::ExtensionConfig;
use llm::AnthropicConfig;
use nodes::EngineConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::observability::LogFormat;

pub const DEFAULT_CONFIG_PATH: &str = ".cogworks/config.toml";
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub engine: EngineConfig,
    /// Producing model.
    pub llm: AnthropicConfig,
    /// Judging model. Falls back to `llm` when absent.
    pub judge: Option<AnthropicConfig>,
    /// Domain services by name.
    pub services: ExtensionConfig,
    pub paths: PathsConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub graph: PathBuf,
    pub state_dir: PathBuf,
    pub tracker_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            graph: PathBuf::from(".cogworks/pipeline.toml"),
            state_dir: PathBuf::from(".cogworks/runs"),
            tracker_dir: PathBuf::from(".cogworks/tracker"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_format: LogFormat,
    /// gRPC endpoint of an OTLP collector. Spans are only exported when set.
    pub otlp_endpoint: Option<String>,
}

impl CliConfig {
    /// Reads the file at `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Fills empty API keys from `key`.
    pub fn apply_api_key(&mut self, key: Option<String>) {
        let Some(key) = key.filter(|k| !k.trim().is_empty()) else {
            return;
        };
        if self.llm.api_key.is_empty() {
            self.llm.api_key = key.clone();
        }
        if let Some(judge) = &mut self.judge {
            if judge.api_key.is_empty() {
                judge.api_key = key;
            }
        }
    }
}
