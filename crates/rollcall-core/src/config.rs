use crate::aggregate::DEFAULT_ENROLL_SAMPLES;
use crate::frame::DEFAULT_LOW_LIGHT_THRESHOLD;
use crate::matcher::DEFAULT_MATCH_THRESHOLD;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// face-api.js recognition net output size.
pub const DEFAULT_DESCRIPTOR_LEN: usize = 128;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 500;
pub const DEFAULT_ORACLE_TIMEOUT_MS: u64 = 2000;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Shared configuration for the daemon and the CLI.
///
/// Resolution order: built-in defaults, then the TOML file named by
/// `ROLLCALL_CONFIG` (if set), then individual `ROLLCALL_*` variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum Euclidean distance for an accepted match.
    pub match_threshold: f32,
    /// Descriptor dimension required at the oracle and registry boundary.
    pub descriptor_len: usize,
    /// Minimum samples averaged into a reference descriptor.
    pub enroll_min_samples: usize,
    /// Session loop period in milliseconds.
    pub tick_interval_ms: u64,
    /// Upper bound on a single oracle call in milliseconds.
    pub oracle_timeout_ms: u64,
    /// Mean luma below which frames are reported as low light.
    pub low_light_threshold: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("attendance.db"),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            descriptor_len: DEFAULT_DESCRIPTOR_LEN,
            enroll_min_samples: DEFAULT_ENROLL_SAMPLES,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            oracle_timeout_ms: DEFAULT_ORACLE_TIMEOUT_MS,
            low_light_threshold: DEFAULT_LOW_LIGHT_THRESHOLD,
        }
    }
}

impl Settings {
    /// Load settings from the config file and environment.
    pub fn load() -> Result<Self, SettingsError> {
        let base = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => Self::from_toml_file(path)?,
            Err(_) => Self::default(),
        };
        let settings = base.with_overrides(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `ROLLCALL_*` overrides from `lookup`. Unparseable values are
    /// logged and ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(path) = lookup("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        override_parsed(&lookup, "ROLLCALL_MATCH_THRESHOLD", &mut self.match_threshold);
        override_parsed(&lookup, "ROLLCALL_DESCRIPTOR_LEN", &mut self.descriptor_len);
        override_parsed(&lookup, "ROLLCALL_ENROLL_MIN_SAMPLES", &mut self.enroll_min_samples);
        override_parsed(&lookup, "ROLLCALL_TICK_INTERVAL_MS", &mut self.tick_interval_ms);
        override_parsed(&lookup, "ROLLCALL_ORACLE_TIMEOUT_MS", &mut self.oracle_timeout_ms);
        override_parsed(&lookup, "ROLLCALL_LOW_LIGHT_THRESHOLD", &mut self.low_light_threshold);
        self
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if !(self.match_threshold.is_finite() && self.match_threshold > 0.0) {
            return Err(SettingsError::Invalid {
                key: "match_threshold",
                reason: format!("must be a positive distance, got {}", self.match_threshold),
            });
        }
        if self.descriptor_len == 0 {
            return Err(SettingsError::Invalid {
                key: "descriptor_len",
                reason: "must be non-zero".into(),
            });
        }
        if self.tick_interval_ms == 0 {
            return Err(SettingsError::Invalid {
                key: "tick_interval_ms",
                reason: "must be non-zero".into(),
            });
        }
        if self.oracle_timeout_ms == 0 {
            return Err(SettingsError::Invalid {
                key: "oracle_timeout_ms",
                reason: "must be non-zero".into(),
            });
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.oracle_timeout_ms)
    }
}

fn override_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable setting"),
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}
