//! User Preferences
//!
//! The two switches that shape the capture policy, and a file-backed
//! store they are read from.
//!
//! Preferences are read by value once per connect attempt. Edits made
//! while the airlock is up only take effect on the next activation.
//!
//! # File format
//!
//! ```toml
//! allow_multicast_discovery = true
//! allow_local_name_resolution = false
//! ```
//!
//! Both keys default to `true` when absent.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Snapshot of the user's airlock preferences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Preferences {
    /// Let multicast discovery (mDNS, SSDP, AirPlay-style announcements)
    /// reach the LAN
    #[serde(default = "default_true")]
    pub allow_multicast_discovery: bool,
    /// Let the system resolver fall back to LAN-provided DNS servers
    #[serde(default = "default_true")]
    pub allow_local_name_resolution: bool,
}

fn default_true() -> bool {
    true
}

impl Preferences {
    /// Create a snapshot from explicit values
    pub fn new(allow_multicast_discovery: bool, allow_local_name_resolution: bool) -> Self {
        Self {
            allow_multicast_discovery,
            allow_local_name_resolution,
        }
    }

    /// Everything off: no multicast carve-out, DNS fully blackholed
    pub fn strict() -> Self {
        Self::new(false, false)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, PreferenceError> {
        toml::from_str(content).map_err(|e| PreferenceError::ParseError(e.to_string()))
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, PreferenceError> {
        serde_json::from_str(content).map_err(|e| PreferenceError::ParseError(e.to_string()))
    }

    /// Export as TOML
    pub fn to_toml(&self) -> Result<String, PreferenceError> {
        toml::to_string_pretty(self).map_err(|e| PreferenceError::SerializeError(e.to_string()))
    }

    /// Export as JSON
    pub fn to_json(&self) -> Result<String, PreferenceError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| PreferenceError::SerializeError(e.to_string()))
    }
}

impl Default for Preferences {
    fn default() -> Self {
        Self::new(true, true)
    }
}

/// Anything that can hand out a preference snapshot at connect time
pub trait PreferenceSource: Send + Sync {
    /// Read the current preferences by value
    fn snapshot(&self) -> Preferences;
}

impl PreferenceSource for Preferences {
    fn snapshot(&self) -> Preferences {
        *self
    }
}

/// On-disk format of a preference file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// Pick the format from a file extension
    pub fn from_path(path: &Path) -> Result<Self, PreferenceError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match ext {
            "toml" => Ok(ConfigFormat::Toml),
            "json" => Ok(ConfigFormat::Json),
            _ => Err(PreferenceError::UnsupportedFormat),
        }
    }
}

/// File-backed preference store
///
/// A missing file reads as the defaults. When used as a
/// [`PreferenceSource`], a malformed file is logged and also reads as the
/// defaults so that a broken file never prevents activation.
#[derive(Debug, Clone)]
pub struct PreferenceStore {
    path: PathBuf,
    format: ConfigFormat,
}

impl PreferenceStore {
    /// Open a store backed by `path` (`.toml` or `.json`)
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PreferenceError> {
        let path = path.into();
        let format = ConfigFormat::from_path(&path)?;
        Ok(Self { path, format })
    }

    /// Backing file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file, treating a missing file as defaults
    pub fn load(&self) -> Result<Preferences, PreferenceError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No preference file at {}, using defaults", self.path.display());
                return Ok(Preferences::default());
            }
            Err(e) => return Err(PreferenceError::IoError(e.to_string())),
        };

        match self.format {
            ConfigFormat::Toml => Preferences::from_toml(&content),
            ConfigFormat::Json => Preferences::from_json(&content),
        }
    }

    /// Write `preferences` to the backing file
    pub fn save(&self, preferences: &Preferences) -> Result<(), PreferenceError> {
        let content = match self.format {
            ConfigFormat::Toml => preferences.to_toml()?,
            ConfigFormat::Json => preferences.to_json()?,
        };

        std::fs::write(&self.path, content).map_err(|e| PreferenceError::IoError(e.to_string()))
    }
}

impl PreferenceSource for PreferenceStore {
    fn snapshot(&self) -> Preferences {
        match self.load() {
            Ok(preferences) => preferences,
            Err(e) => {
                warn!(
                    "Ignoring unreadable preference file {}: {}",
                    self.path.display(),
                    e
                );
                Preferences::default()
            }
        }
    }
}

/// Preference errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum PreferenceError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Unsupported preference file format")]
    UnsupportedFormat,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_allow_everything_local() {
        let prefs = Preferences::default();
        assert!(prefs.allow_multicast_discovery);
        assert!(prefs.allow_local_name_resolution);
    }

    #[test]
    fn test_missing_keys_default_to_true() {
        let prefs = Preferences::from_toml("allow_multicast_discovery = false\n").unwrap();
        assert!(!prefs.allow_multicast_discovery);
        assert!(prefs.allow_local_name_resolution);

        let prefs = Preferences::from_json("{}").unwrap();
        assert_eq!(prefs, Preferences::default());
    }

    #[test]
    fn test_store_missing_file_reads_defaults() {
        let dir = tempdir().unwrap();
        let store = PreferenceStore::open(dir.path().join("moat.toml")).unwrap();

        assert_eq!(store.load().unwrap(), Preferences::default());
    }

    #[test]
    fn test_store_save_then_snapshot() {
        let dir = tempdir().unwrap();
        let store = PreferenceStore::open(dir.path().join("moat.json")).unwrap();

        store.save(&Preferences::strict()).unwrap();
        assert_eq!(store.snapshot(), Preferences::strict());
    }

    #[test]
    fn test_malformed_file_snapshot_falls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("moat.toml");
        std::fs::write(&path, "allow_multicast_discovery = \"maybe\"").unwrap();

        let store = PreferenceStore::open(&path).unwrap();
        assert!(store.load().is_err());
        assert_eq!(store.snapshot(), Preferences::default());
    }

    #[test]
    fn test_unsupported_extension() {
        let result = PreferenceStore::open("/tmp/moat.yaml");
        assert!(matches!(result, Err(PreferenceError::UnsupportedFormat)));
    }
}
