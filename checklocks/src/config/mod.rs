//! Analyzer configuration (`checklocks.toml`)
//!
//! Every section is optional; missing keys fall back to the defaults,
//! which recognize both Go-style (`Lock`, `sync.Mutex`) and lower-case
//! (`lock`, `Mutex`) spellings.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CheckError, Result};

/// Default configuration file name looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "checklocks.toml";

/// Complete analyzer configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub locks: LockConfig,
    pub atomics: AtomicConfig,
    pub analysis: AnalysisConfig,
}

/// Which types are locks and which methods acquire/release them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    /// Types that can only be held exclusively
    pub exclusive_types: Vec<String>,
    /// Types that can be held exclusively or shared
    pub shared_types: Vec<String>,
    pub acquire: Vec<String>,
    pub release: Vec<String>,
    pub shared_acquire: Vec<String>,
    pub shared_release: Vec<String>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            exclusive_types: strings(&["Mutex", "sync.Mutex"]),
            shared_types: strings(&["RWMutex", "sync.RWMutex"]),
            acquire: strings(&["Lock", "lock"]),
            release: strings(&["Unlock", "unlock"]),
            shared_acquire: strings(&["RLock", "rlock"]),
            shared_release: strings(&["RUnlock", "runlock"]),
        }
    }
}

/// Atomic operation recognition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AtomicConfig {
    /// Package whose functions are atomic operations (`atomic.LoadInt32`)
    pub package: String,
}

impl Default for AtomicConfig {
    fn default() -> Self {
        Self {
            package: "atomic".to_string(),
        }
    }
}

/// Rule tuning
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    /// Accept a shared hold for reads of guarded and mixed fields
    pub shared_reads: bool,
    /// Worker threads for per-function analysis; 0 picks rayon's default
    pub jobs: usize,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Config {
    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| CheckError::config_error(e.to_string()))
    }

    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CheckError::io_error(format!("failed to read config {}: {e}", path.display()))
        })?;
        let config = Self::from_toml(&text)?;
        debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Explicit path if given, else `./checklocks.toml` when present, else defaults
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let local = Path::new(CONFIG_FILE_NAME);
        if local.is_file() {
            return Self::load(local);
        }
        debug!("no configuration file, using defaults");
        Ok(Self::default())
    }

    /// Classify a type name as a lock
    pub fn lock_kind(&self, type_name: &str) -> Option<crate::contract::LockKind> {
        use crate::contract::LockKind;
        if self.locks.exclusive_types.iter().any(|t| t == type_name) {
            Some(LockKind::Exclusive)
        } else if self.locks.shared_types.iter().any(|t| t == type_name) {
            Some(LockKind::ReadWrite)
        } else {
            None
        }
    }

    /// Whether `package.function` is an atomic operation, and if so
    /// whether it writes
    pub fn atomic_op(&self, package: &str, function: &str) -> Option<crate::mir::AccessKind> {
        use crate::mir::AccessKind;
        if package != self.atomics.package {
            return None;
        }
        let lower = function.to_ascii_lowercase();
        if lower.starts_with("load") {
            Some(AccessKind::Read)
        } else if ["store", "add", "swap", "compareandswap", "compare_and_swap", "and", "or"]
            .iter()
            .any(|prefix| lower.starts_with(prefix))
        {
            Some(AccessKind::Write)
        } else {
            None
        }
    }
}
