//! Record of the most recently used host executable.
//!
//! Stored as JSON in `{state_dir}/recent_executables.json`. A missing or
//! unreadable record behaves like an empty one.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ExecutableLocator;

/// File name of the record inside the state directory.
pub const RECENT_FILE: &str = "recent_executables.json";

/// One recorded executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentEntry {
    pub path: PathBuf,

    /// When the executable was last launched.
    pub last_used: DateTime<Utc>,
}

/// Most recently used executables, newest first.
#[derive(Debug)]
pub struct RecentExecutables {
    file: PathBuf,
    entries: Mutex<Vec<RecentEntry>>,
}

impl RecentExecutables {
    /// How many executables are remembered.
    pub const CAPACITY: usize = 8;

    /// Loads the record from `state_dir`.
    pub fn load(state_dir: &Path) -> Self {
        let file = state_dir.join(RECENT_FILE);
        tracing::debug!("Loading recent executables from: {}", file.display());

        let entries = match fs::read_to_string(&file) {
            Ok(contents) => match serde_json::from_str::<Vec<RecentEntry>>(&contents) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!("Ignoring corrupt recent executables file: {}", e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                tracing::warn!("Failed to read recent executables file: {}", e);
                Vec::new()
            }
        };

        Self {
            file,
            entries: Mutex::new(entries),
        }
    }

    pub fn entries(&self) -> Vec<RecentEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Moves `path` to the front of the record and saves it.
    pub fn record(&self, path: &Path) -> Result<()> {
        let snapshot = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.retain(|e| e.path != path);
            entries.insert(
                0,
                RecentEntry {
                    path: path.to_path_buf(),
                    last_used: Utc::now(),
                },
            );
            entries.truncate(Self::CAPACITY);
            entries.clone()
        };
        self.save(&snapshot)
    }

    fn save(&self, entries: &[RecentEntry]) -> Result<()> {
        if let Some(dir) = self.file.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
        }

        let contents = serde_json::to_string_pretty(entries)
            .context("Failed to serialize recent executables")?;
        fs::write(&self.file, contents)
            .with_context(|| format!("Failed to write {}", self.file.display()))?;

        tracing::debug!("Saved {} recent executable(s)", entries.len());
        Ok(())
    }
}

impl ExecutableLocator for RecentExecutables {
    fn most_recently_used(&self) -> Option<PathBuf> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .first()
            .map(|e| e.path.clone())
    }
}
