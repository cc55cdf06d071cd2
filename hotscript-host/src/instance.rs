//! Live script instances
//!
//! A [`ScriptInstance`] wraps one instantiated [`Script`] together with the
//! bookkeeping the host keeps about it. Every call into script code goes
//! through [`ScriptInstance::call_hook`], which turns errors and panics into a
//! [`HookOutcome`] and logs them against the script.

use crate::main_context::panic_message;
use hotscript_api::{Controller, HookResult, Script, ScriptContext, ScriptMetadata, TaskId};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Result of one isolated hook invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Ok,
    Failed(String),
}

impl HookOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Host-side metadata kept for each instance
#[derive(Debug, Clone, Default)]
pub struct InternalData {
    pub full_name: String,
    /// File the script was loaded from or persisted to
    pub path: Option<PathBuf>,
    pub blacklisted: bool,
    /// Cleared until the first gate refresh completes
    pub allowed: bool,
    /// Whether the configuration UI for this script is open
    pub config_open: bool,
    /// Content hash of the source this instance was built from
    pub source_hash: Option<String>,
    pub overrides: BTreeMap<String, String>,
}

impl InternalData {
    pub fn new(full_name: impl Into<String>, path: Option<PathBuf>) -> Self {
        Self {
            full_name: full_name.into(),
            path,
            ..Self::default()
        }
    }
}

/// A loaded, executable script
pub struct ScriptInstance {
    full_name: String,
    metadata: ScriptMetadata,
    enabled: AtomicBool,
    internal: Mutex<InternalData>,
    controller: Mutex<Controller>,
    script: Mutex<Box<dyn Script>>,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptInstance {
    pub fn new(script: Box<dyn Script>, internal: InternalData) -> Self {
        let metadata = script.metadata().clone();
        Self {
            full_name: metadata.full_name(),
            metadata,
            enabled: AtomicBool::new(false),
            internal: Mutex::new(internal),
            controller: Mutex::new(Controller::new()),
            script: Mutex::new(script),
        }
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn metadata(&self) -> &ScriptMetadata {
        &self.metadata
    }

    pub fn version(&self) -> u32 {
        self.metadata.version
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Copy of the host-side metadata
    pub fn internal(&self) -> InternalData {
        lock(&self.internal).clone()
    }

    pub fn with_internal<R>(&self, f: impl FnOnce(&mut InternalData) -> R) -> R {
        f(&mut lock(&self.internal))
    }

    pub fn path(&self) -> Option<PathBuf> {
        lock(&self.internal).path.clone()
    }

    pub fn is_blacklisted(&self) -> bool {
        lock(&self.internal).blacklisted
    }

    pub fn is_allowed(&self) -> bool {
        lock(&self.internal).allowed
    }

    pub fn config_open(&self) -> bool {
        lock(&self.internal).config_open
    }

    pub fn set_config_open(&self, open: bool) {
        lock(&self.internal).config_open = open;
    }

    pub fn source_hash(&self) -> Option<String> {
        lock(&self.internal).source_hash.clone()
    }

    /// Auto-reset deadline currently armed by the script
    pub fn auto_reset_at(&self) -> Option<Instant> {
        lock(&self.controller).auto_reset_at()
    }

    pub fn pending_tasks(&self) -> usize {
        lock(&self.controller).pending_tasks()
    }

    pub(crate) fn auto_reset_due(&self, now: Instant) -> bool {
        lock(&self.controller).auto_reset_due(now)
    }

    pub(crate) fn take_due_tasks(&self, now: Instant) -> Vec<(TaskId, String)> {
        lock(&self.controller).take_due(now)
    }

    /// Invoke script code inside an isolating guard
    ///
    /// Errors and panics become [`HookOutcome::Failed`], logged once with the
    /// script's identity and the hook name.
    pub fn call_hook<F>(&self, hook: &'static str, now: Instant, f: F) -> HookOutcome
    where
        F: FnOnce(&mut dyn Script, &mut ScriptContext<'_>) -> HookResult,
    {
        let result = {
            let mut script = lock(&self.script);
            let mut controller = lock(&self.controller);
            panic::catch_unwind(AssertUnwindSafe(|| {
                let mut ctx = ScriptContext::new(&self.full_name, now, &mut controller);
                f(&mut **script, &mut ctx)
            }))
        };

        let outcome = match result {
            Ok(Ok(())) => HookOutcome::Ok,
            Ok(Err(e)) => HookOutcome::Failed(format!("{e:#}")),
            Err(payload) => HookOutcome::Failed(format!(
                "panicked: {}",
                panic_message(payload.as_ref())
            )),
        };

        if let HookOutcome::Failed(reason) = &outcome {
            tracing::error!(
                script = %self.full_name,
                hook,
                reason = %reason,
                "Script hook failed"
            );
        }
        outcome
    }

    /// Disabled -> Enabled. Returns false if already enabled.
    pub fn enable(&self) -> bool {
        if self.enabled.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.call_hook("on_enable", Instant::now(), |script, _| script.on_enable());
        tracing::info!(script = %self.full_name, version = self.version(), "Script enabled");
        true
    }

    /// Enabled -> Disabled. Returns false if already disabled.
    pub fn disable(&self) -> bool {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.call_hook("on_disable", Instant::now(), |script, _| script.on_disable());
        tracing::info!(script = %self.full_name, "Script disabled");
        true
    }

    /// Cancel scheduled sub-tasks, run `on_reset`, clear the auto-reset deadline
    ///
    /// The deadline is cleared even when the hook fails.
    pub fn reset(&self, now: Instant) -> HookOutcome {
        let cancelled = lock(&self.controller).cancel_schedulers();
        let outcome = self.call_hook("on_reset", now, |script, _| script.on_reset());
        lock(&self.controller).clear_auto_reset();
        tracing::debug!(script = %self.full_name, cancelled, "Script reset");
        outcome
    }

    /// Read `<dir>/<full name>.json` into the stored overrides
    ///
    /// A missing file means no overrides. Unreadable files are logged and
    /// leave the stored overrides untouched.
    pub fn load_overrides(&self, dir: &Path) {
        let path = dir.join(format!("{}.json", self.full_name));
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                lock(&self.internal).overrides.clear();
                return;
            }
            Err(e) => {
                tracing::warn!(script = %self.full_name, path = %path.display(), error = %e, "Failed to read overrides");
                return;
            }
        };
        match serde_json::from_str::<BTreeMap<String, String>>(&content) {
            Ok(overrides) => lock(&self.internal).overrides = overrides,
            Err(e) => {
                tracing::warn!(script = %self.full_name, path = %path.display(), error = %e, "Invalid overrides file");
            }
        }
    }

    /// Hand the stored overrides to the script
    pub fn apply_overrides(&self) -> HookOutcome {
        let overrides = lock(&self.internal).overrides.clone();
        self.call_hook("apply_overrides", Instant::now(), |script, _| {
            script.apply_overrides(&overrides)
        })
    }
}

impl std::fmt::Debug for ScriptInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptInstance")
            .field("full_name", &self.full_name)
            .field("version", &self.metadata.version)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
