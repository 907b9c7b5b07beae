//! Service configuration, constructed once at startup and injected.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// How signatures and timestamps are drawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StampConfig {
    /// Ceiling on decoded signature image bytes, inclusive.
    pub max_image_bytes: usize,
    /// Fraction of the native pixel size an image is drawn at.
    pub image_scale: f64,
    pub signature_font_size: f64,
    pub signature_color: [f64; 3],
    pub timestamp_font_size: f64,
    pub timestamp_color: [f64; 3],
    /// Distance between the signature's bottom edge and the timestamp baseline.
    pub timestamp_gap: f64,
    /// Lowest baseline the timestamp may be drawn at.
    pub timestamp_min_y: f64,
    /// chrono format string for the local signing time.
    pub timestamp_format: String,
}

impl Default for StampConfig {
    fn default() -> Self {
        Self {
            max_image_bytes: 7_000_000,
            image_scale: 0.3,
            signature_font_size: 22.0,
            // Dark blue, distinct from document ink
            signature_color: [0.0, 0.0, 0.8],
            timestamp_font_size: 8.0,
            timestamp_color: [0.5, 0.5, 0.5],
            timestamp_gap: 12.0,
            timestamp_min_y: 5.0,
            timestamp_format: "%-m/%-d/%Y, %-I:%M:%S %p".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// Every stored document path must resolve inside this directory.
    pub uploads_root: PathBuf,
    /// Lifetime of recipient signing tokens.
    pub recipient_token_ttl_days: i64,
    pub stamp: StampConfig,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            uploads_root: PathBuf::from("uploads"),
            recipient_token_ttl_days: 7,
            stamp: StampConfig::default(),
        }
    }
}

impl SigningConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: SigningConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let stamp = &self.stamp;
        if !(stamp.image_scale > 0.0 && stamp.image_scale <= 1.0) {
            return Err(invalid("stamp.image_scale", "must be in (0, 1]"));
        }
        if !(stamp.signature_font_size > 0.0) {
            return Err(invalid("stamp.signature_font_size", "must be positive"));
        }
        if !(stamp.timestamp_font_size > 0.0) {
            return Err(invalid("stamp.timestamp_font_size", "must be positive"));
        }
        if stamp.max_image_bytes == 0 {
            return Err(invalid("stamp.max_image_bytes", "must be positive"));
        }
        for (field, color) in [
            ("stamp.signature_color", stamp.signature_color),
            ("stamp.timestamp_color", stamp.timestamp_color),
        ] {
            if color.iter().any(|c| !(0.0..=1.0).contains(c)) {
                return Err(invalid(field, "channels must be in [0, 1]"));
            }
        }
        if StrftimeItems::new(&stamp.timestamp_format).any(|item| matches!(item, Item::Error)) {
            return Err(invalid("stamp.timestamp_format", "not a valid chrono format"));
        }
        if self.recipient_token_ttl_days <= 0 {
            return Err(invalid("recipient_token_ttl_days", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}
