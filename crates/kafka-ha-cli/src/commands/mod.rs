pub mod cleanup;
pub mod describe;
pub mod offsets;
pub mod run;
pub mod scenarios;
pub mod validate_config;

use anyhow::{Context, Result};
use kafka_ha_core::HarnessConfig;
use serde::Serialize;

/// Output format shared by the reporting commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
    Yaml,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "yaml" => Self::Yaml,
            _ => Self::Text,
        }
    }
}

impl OutputFormat {
    /// Print `value` as JSON or YAML. Returns false for text, which the caller renders.
    pub fn print_structured<T: Serialize>(&self, value: &T) -> Result<bool> {
        match self {
            Self::Json => println!("{}", serde_json::to_string_pretty(value)?),
            Self::Yaml => println!("{}", serde_yaml::to_string(value)?),
            Self::Text => return Ok(false),
        }
        Ok(true)
    }
}

pub async fn load_config(path: &str) -> Result<HarnessConfig> {
    HarnessConfig::load(path)
        .await
        .with_context(|| format!("Failed to load configuration from {}", path))
}
