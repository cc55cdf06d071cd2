//! Update/failure summary and status notification sinks
//!
//! The engine only reports into these traits; rendering a summary or a
//! status indicator belongs to the embedding host. In-memory implementations
//! are provided for headless hosts and tests.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Receives script update and load-failure bookkeeping
pub trait UpdateSummary: Send + Sync {
    /// A loaded script was replaced by a newer (or different) version
    fn record_updated(&self, full_name: &str, previous_version: u32, version: u32);

    fn remove_updated(&self, full_name: &str);

    /// Loading the script at `path` failed
    fn record_failed(&self, path: &Path);

    fn remove_failed(&self, path: &Path);

    fn updated_count(&self) -> usize;

    fn failed_count(&self) -> usize;

    /// Show the summary to the user
    fn open(&self);

    /// Forget everything recorded so far
    fn reset(&self);
}

/// Open the summary when there is something to report
pub fn open_if_needed(summary: &dyn UpdateSummary) -> bool {
    if summary.updated_count() > 0 || summary.failed_count() > 0 {
        summary.open();
        true
    } else {
        false
    }
}

/// One recorded update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatedScript {
    pub full_name: String,
    pub previous_version: u32,
    pub version: u32,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct SummaryState {
    updated: Vec<UpdatedScript>,
    failed: BTreeSet<PathBuf>,
    opened: usize,
}

/// Update summary kept in memory
#[derive(Default)]
pub struct MemoryUpdateSummary {
    state: Mutex<SummaryState>,
}

impl MemoryUpdateSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updated(&self) -> Vec<UpdatedScript> {
        self.lock().updated.clone()
    }

    pub fn failed(&self) -> Vec<PathBuf> {
        self.lock().failed.iter().cloned().collect()
    }

    /// How many times the summary was opened
    pub fn open_count(&self) -> usize {
        self.lock().opened
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SummaryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UpdateSummary for MemoryUpdateSummary {
    fn record_updated(&self, full_name: &str, previous_version: u32, version: u32) {
        let mut state = self.lock();
        state.updated.retain(|u| u.full_name != full_name);
        state.updated.push(UpdatedScript {
            full_name: full_name.to_string(),
            previous_version,
            version,
            at: Utc::now(),
        });
    }

    fn remove_updated(&self, full_name: &str) {
        self.lock().updated.retain(|u| u.full_name != full_name);
    }

    fn record_failed(&self, path: &Path) {
        self.lock().failed.insert(path.to_path_buf());
    }

    fn remove_failed(&self, path: &Path) {
        self.lock().failed.remove(path);
    }

    fn updated_count(&self) -> usize {
        self.lock().updated.len()
    }

    fn failed_count(&self) -> usize {
        self.lock().failed.len()
    }

    fn open(&self) {
        let mut state = self.lock();
        state.opened += 1;
        tracing::info!(
            updated = state.updated.len(),
            failed = state.failed.len(),
            "Script update summary opened"
        );
    }

    fn reset(&self) {
        let mut state = self.lock();
        state.updated.clear();
        state.failed.clear();
    }
}

/// Notified whenever the number of live scripts changes
pub trait StatusSink: Send + Sync {
    fn script_count_changed(&self, count: usize);
}

/// Status sink that ignores all notifications
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatusSink;

impl StatusSink for NullStatusSink {
    fn script_count_changed(&self, _count: usize) {}
}
