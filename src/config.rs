//! Configuration
//!
//! [`ControlConfig`] tunes how the control interface is reached;
//! [`TableFile`] is the on-disk description of one mapped device, read by
//! the CLI and usable by library callers alike.
//!
//! # Table File Example
//!
//! ```yaml
//! name: joined
//! uuid: 4f3c-joined
//! targets:
//!   - type: linear
//!     start: 0
//!     length: 2048
//!     backend_device: /dev/loop0
//!   - type: crypt
//!     start: 2048
//!     length: 2048
//!     backend_device: /dev/loop1
//!     key:
//!       raw: "babebabe..."
//!     flags: [allow_discards]
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::target::Target;

/// Default location of the control node.
pub const DEFAULT_CONTROL_PATH: &str = "/dev/mapper/control";

/// Initial buffer for device listings.
pub const DEFAULT_LIST_BUFFER_SIZE: usize = 16 * 1024;

/// Largest buffer a listing may grow to.
pub const DEFAULT_LIST_BUFFER_LIMIT: usize = 1024 * 1024;

// =============================================================================
// Control Configuration
// =============================================================================

/// How to reach the kernel control interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Control node path
    pub control_path: PathBuf,
    /// First list attempt uses this many bytes
    pub list_buffer_size: usize,
    /// Listing gives up once this size is exhausted
    pub list_buffer_limit: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            control_path: PathBuf::from(DEFAULT_CONTROL_PATH),
            list_buffer_size: DEFAULT_LIST_BUFFER_SIZE,
            list_buffer_limit: DEFAULT_LIST_BUFFER_LIMIT,
        }
    }
}

impl ControlConfig {
    pub fn with_control_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.control_path = path.into();
        self
    }
}

// =============================================================================
// Table Files
// =============================================================================

/// A device name plus its table, as stored in YAML or JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFile {
    pub name: String,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub read_only: bool,
    pub targets: Vec<Target>,
}

impl TableFile {
    /// Load from `path`. Files ending in `.json` are JSON, anything else YAML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let table = if is_json {
            Self::from_json(&text)
        } else {
            Self::from_yaml(&text)
        }
        .map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })?;

        debug!(
            path = %path.display(),
            name = %table.name,
            targets = table.targets.len(),
            "loaded table file"
        );
        Ok(table)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let table: Self = serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        table.validate()?;
        Ok(table)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let table: Self = serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        table.validate()?;
        Ok(table)
    }

    /// Local sanity checks. Ordering and contiguity are left to the kernel.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("device name must not be empty".to_string()));
        }
        if self.targets.is_empty() {
            return Err(Error::Config(format!(
                "table for '{}' has no targets",
                self.name
            )));
        }
        if let Some(target) = self.targets.iter().find(|t| t.length() == 0) {
            return Err(Error::Config(format!(
                "{} target at sector {} has zero length",
                target.target_type(),
                target.start()
            )));
        }
        Ok(())
    }

    /// Device size in sectors, up to the end of the furthest target.
    /// Saturates at `u64::MAX`.
    pub fn sectors(&self) -> u64 {
        self.targets
            .iter()
            .map(|t| t.start().saturating_add(t.length()))
            .max()
            .unwrap_or(0)
    }
}
