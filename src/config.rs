//! Assembler configuration.
//!
//! Loaded from an optional `iso-assembler.toml` next to the ledger root.
//! A missing file yields defaults; unknown fields are an error so typos
//! do not silently fall back to defaults.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const CONFIG_FILE: &str = "iso-assembler.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AssemblerConfig {
    pub live: LiveConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default, rename_all = "kebab-case")]
pub struct LiveConfig {
    /// Compression algorithm handed to the squashfs compressor.
    pub squashfs_compression: String,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            live: LiveConfig::default(),
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            squashfs_compression: "zstd".to_string(),
        }
    }
}

impl AssemblerConfig {
    /// Load `iso-assembler.toml` from `dir`, or defaults if absent.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config '{}'", path.display()))
    }
}
