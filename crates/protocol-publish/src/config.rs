//! Publisher configuration
//!
//! Provides [`PublisherConfig`], loadable from TOML and buildable in code.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Publisher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Bound on one external validation call, in milliseconds
    pub validation_timeout_ms: u64,
    /// Require a non-blank reason unless the publish is forced
    pub require_reason: bool,
    /// Root directory of the filesystem backend
    pub storage_root: PathBuf,
    /// Conformance validator endpoint
    pub validator_url: Option<String>,
}

impl PublisherConfig {
    /// Create default config
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the validation timeout
    #[must_use]
    pub fn with_validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set whether a reason is required
    #[must_use]
    pub fn with_require_reason(mut self, require: bool) -> Self {
        self.require_reason = require;
        self
    }

    /// Set the storage root
    #[must_use]
    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = root.into();
        self
    }

    /// Set the validator endpoint
    #[must_use]
    pub fn with_validator_url(mut self, url: impl Into<String>) -> Self {
        self.validator_url = Some(url.into());
        self
    }

    /// Validation timeout as a [`Duration`]
    #[inline]
    #[must_use]
    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms)
    }

    /// Parse TOML; missing keys take their defaults
    ///
    /// # Errors
    /// Returns error if the text is not valid TOML for this config or fails
    /// [`PublisherConfig::validate`]
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// Returns the first invalid field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.validation_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "validation_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.storage_root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "storage_root",
                reason: "must not be empty".to_string(),
            });
        }
        if let Some(url) = &self.validator_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid {
                    field: "validator_url",
                    reason: format!("'{url}' is not an http(s) url"),
                });
            }
        }
        Ok(())
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            validation_timeout_ms: 10_000,
            require_reason: true,
            storage_root: PathBuf::from("./data/protocols"),
            validator_url: None,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file unreadable
    #[error("cannot read {}: {source}", path.display())]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Not valid TOML for this config
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Field out of range
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Field name
        field: &'static str,
        /// What is wrong
        reason: String,
    },
}
