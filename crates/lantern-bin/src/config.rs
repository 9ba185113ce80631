//! `lantern.toml` parsing.
//!
//! Every section and field is optional; defaults mirror the original
//! hardware target (8 KiB cache blocks, eight of them, a 30 Hz panel at full
//! brightness, a 64-entry input queue). Unknown fields are ignored so the
//! file can grow without breaking older binaries.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfigFile {
    #[serde(default = "CacheConfigFile::default_block_size")]
    pub block_size: usize,
    #[serde(default = "CacheConfigFile::default_block_count")]
    pub block_count: usize,
}

impl CacheConfigFile {
    fn default_block_size() -> usize {
        8 * 1024
    }
    fn default_block_count() -> usize {
        8
    }
}

impl Default for CacheConfigFile {
    fn default() -> Self {
        Self {
            block_size: Self::default_block_size(),
            block_count: Self::default_block_count(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DisplayConfigFile {
    #[serde(default = "DisplayConfigFile::default_refresh_hz")]
    pub refresh_hz: u32,
    #[serde(default = "DisplayConfigFile::default_brightness_pct")]
    pub brightness_pct: u8,
}

impl DisplayConfigFile {
    fn default_refresh_hz() -> u32 {
        30
    }
    fn default_brightness_pct() -> u8 {
        100
    }
}

impl Default for DisplayConfigFile {
    fn default() -> Self {
        Self {
            refresh_hz: Self::default_refresh_hz(),
            brightness_pct: Self::default_brightness_pct(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfigFile {
    #[serde(default = "InputConfigFile::default_queue_cap")]
    pub queue_cap: usize,
}

impl InputConfigFile {
    fn default_queue_cap() -> usize {
        64
    }
}

impl Default for InputConfigFile {
    fn default() -> Self {
        Self {
            queue_cap: Self::default_queue_cap(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfigFile,
    #[serde(default)]
    pub display: DisplayConfigFile,
    #[serde(default)]
    pub input: InputConfigFile,
}

/// Load the configuration file, or fall back to defaults when it does not
/// exist. A file that exists but fails to parse is an error; silently
/// ignoring a typo'd config helps nobody.
pub fn load(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config =
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let c = load(Path::new("/nonexistent/lantern.toml")).unwrap();
        assert_eq!(c.cache.block_size, 8 * 1024);
        assert_eq!(c.cache.block_count, 8);
        assert_eq!(c.display.refresh_hz, 30);
        assert_eq!(c.input.queue_cap, 64);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let c: Config = toml::from_str("[cache]\nblock_count = 4\n").unwrap();
        assert_eq!(c.cache.block_count, 4);
        assert_eq!(c.cache.block_size, 8 * 1024);
        assert_eq!(c.display.brightness_pct, 100);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let c: Config = toml::from_str("[display]\nrefresh_hz = 60\ngamma = 2.2\n").unwrap();
        assert_eq!(c.display.refresh_hz, 60);
    }
}
