//! Script registry
//!
//! Copy-on-write ordered list of live [`ScriptInstance`]s. Readers take a
//! snapshot and iterate it freely; every mutation builds a new list and
//! publishes it atomically. Mutations are only valid on the main context.

use crate::instance::ScriptInstance;
use crate::main_context::MainContextHandle;
use crate::summary::StatusSink;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

/// Immutable view of the registry at one point in time
pub type Snapshot = Arc<[Arc<ScriptInstance>]>;

/// Authoritative collection of live scripts
pub struct ScriptRegistry {
    scripts: RwLock<Snapshot>,
    main: MainContextHandle,
    status: Arc<dyn StatusSink>,
}

impl ScriptRegistry {
    pub fn new(main: MainContextHandle, status: Arc<dyn StatusSink>) -> Self {
        Self {
            scripts: RwLock::new(Vec::new().into()),
            main,
            status,
        }
    }

    /// Current list, in load order
    pub fn snapshot(&self) -> Snapshot {
        self.scripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, full_name: &str) -> Option<Arc<ScriptInstance>> {
        self.snapshot()
            .iter()
            .find(|s| s.full_name() == full_name)
            .cloned()
    }

    pub fn find_by_path(&self, path: &Path) -> Option<Arc<ScriptInstance>> {
        self.snapshot()
            .iter()
            .find(|s| s.path().as_deref() == Some(path))
            .cloned()
    }

    /// Append an instance
    ///
    /// Callers disable and remove any previous instance of the same name
    /// first. A leftover one is disabled and dropped here so names stay
    /// unique.
    pub fn add(&self, instance: Arc<ScriptInstance>) {
        let leftovers: Vec<_> = self
            .snapshot()
            .iter()
            .filter(|s| s.full_name() == instance.full_name())
            .cloned()
            .collect();
        for leftover in &leftovers {
            tracing::warn!(
                script = %instance.full_name(),
                "Dropping previous instance that was not removed before add"
            );
            leftover.disable();
        }
        self.mutate("add", |scripts| {
            scripts.retain(|s| s.full_name() != instance.full_name());
            scripts.push(instance);
        });
    }

    /// Remove this exact instance. Returns whether it was present.
    pub fn remove(&self, instance: &Arc<ScriptInstance>) -> bool {
        self.remove_where(|s| std::ptr::eq(s, Arc::as_ptr(instance))) > 0
    }

    /// Remove every instance matching `predicate`, returning how many went
    pub fn remove_where(&self, predicate: impl Fn(&ScriptInstance) -> bool) -> usize {
        let mut removed = 0;
        self.mutate("remove_where", |scripts| {
            let before = scripts.len();
            scripts.retain(|s| !predicate(s));
            removed = before - scripts.len();
        });
        removed
    }

    pub fn clear(&self) {
        self.mutate("clear", Vec::clear);
    }

    /// Log an error unless running on the main context
    pub(crate) fn assert_main(&self, operation: &str) -> bool {
        self.main.assert_current(operation)
    }

    fn mutate(&self, operation: &str, f: impl FnOnce(&mut Vec<Arc<ScriptInstance>>)) {
        self.main.assert_current(operation);
        let count = {
            let mut guard = self.scripts.write().unwrap_or_else(PoisonError::into_inner);
            let mut next: Vec<Arc<ScriptInstance>> = guard.iter().cloned().collect();
            f(&mut next);
            let count = next.len();
            *guard = next.into();
            count
        };
        self.status.script_count_changed(count);
    }
}
