use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

pub const MIN_MIB_FILESIZE_MB: u64 = 100;
pub const MAX_AUX_FILESIZE_MB: u64 = 5;
pub const DEFAULT_CHUNKS: (u64, u64) = (32, 256);
pub const DEFAULT_ARCHIVER: &str = "7z";
pub const SUPPORTED_AUX_EXTENSIONS: [&str; 7] =
    [".dm3", ".dm4", ".png", ".jpg", ".mib", ".tif", ".tiff"];

/// TOML defaults file. Every key is optional:
///
/// ```toml
/// [conversion]
/// min_mib_size = 100
/// max_aux_size = 20
/// chunks = [32, 256]
/// output_mode = "zstore"
/// archiver = "/usr/bin/7z"
/// aux_extensions = [".dm4", ".png"]
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub conversion: ConversionConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConversionConfig {
    pub min_mib_size: Option<u64>,
    pub max_aux_size: Option<u64>,
    pub chunks: Option<[u64; 2]>,
    pub output_mode: Option<OutputModeSetting>,
    pub overwrite: Option<bool>,
    pub vbf: Option<bool>,
    pub stack_max: Option<bool>,
    pub archiver: Option<String>,
    pub aux_extensions: Option<Vec<String>>,
}

/// Output mode as written in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputModeSetting {
    Plain,
    Zip,
    Zstore,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML configuration")
    }
}
