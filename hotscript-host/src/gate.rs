//! Update / blacklist gate
//!
//! Decides which script versions may run and pulls newer versions. Until the
//! first refresh completes, freshly loaded scripts are not allowed to run.
//! A refresh downloads the blacklist, applies it on the main context, marks
//! the gate completed and then schedules downloads from the update manifests.

use crate::host::Shared;
use crate::loader::LoadRequest;
use crate::state;
use hotscript_api::ScriptMetadata;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Blocks `full_name` at `version` and below
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistEntry {
    pub full_name: String,
    pub version: u32,
}

/// One update manifest row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateEntry {
    pub full_name: String,
    pub version: u32,
    pub url: String,
}

/// Parse `name,version` rows. Anything else is logged at debug and skipped.
pub fn parse_blacklist(text: &str) -> Vec<BlacklistEntry> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim_end_matches('\r');
            let fields: Vec<&str> = line.split(',').collect();
            match fields.as_slice() {
                [name, version] => match version.parse::<u32>() {
                    Ok(version) => {
                        tracing::debug!(script = %name, version, "Found valid blacklist entry");
                        Some(BlacklistEntry {
                            full_name: name.to_string(),
                            version,
                        })
                    }
                    Err(_) => {
                        tracing::debug!(line, "Skipping invalid blacklist entry");
                        None
                    }
                },
                _ => {
                    tracing::debug!(line, "Skipping invalid blacklist entry");
                    None
                }
            }
        })
        .collect()
}

/// Parse `name,version,url[,...]` rows; extra fields are ignored
pub fn parse_update_manifest(text: &str) -> Vec<UpdateEntry> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim_end_matches('\r');
            let fields: Vec<&str> = line.split(',').collect();
            if fields.len() < 3 {
                tracing::debug!(line, "Skipping invalid update entry");
                return None;
            }
            match fields[1].parse::<u32>() {
                Ok(version) => {
                    tracing::debug!(script = %fields[0], version, url = %fields[2], "Found valid update entry");
                    Some(UpdateEntry {
                        full_name: fields[0].to_string(),
                        version,
                        url: fields[2].to_string(),
                    })
                }
                Err(_) => {
                    tracing::debug!(line, "Skipping invalid update entry");
                    None
                }
            }
        })
        .collect()
}

/// Gate state shared between the main context and background refreshes
#[derive(Debug, Default)]
pub struct UpdateGate {
    blacklist: RwLock<Arc<Vec<BlacklistEntry>>>,
    completed: AtomicBool,
    refreshing: AtomicBool,
    forced: Mutex<Vec<String>>,
}

impl UpdateGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a refresh has finished its blacklist phase
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }

    /// Current blacklist snapshot
    pub fn blacklist(&self) -> Arc<Vec<BlacklistEntry>> {
        self.blacklist
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_blacklisted(&self, metadata: &ScriptMetadata) -> bool {
        let full_name = metadata.full_name();
        self.blacklist()
            .iter()
            .any(|entry| entry.full_name == full_name && metadata.version <= entry.version)
    }

    /// Download these scripts on the next refresh whatever their version
    pub fn force_update(&self, names: impl IntoIterator<Item = String>) {
        self.forced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(names);
    }

    pub fn forced(&self) -> Vec<String> {
        self.forced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn invalidate(&self) {
        self.completed.store(false, Ordering::SeqCst);
    }

    /// A refresh may start once the previous one completed, or when forced;
    /// never while another is running
    fn try_begin(&self, force: bool) -> bool {
        (self.is_completed() || force)
            && self
                .refreshing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    fn publish_blacklist(&self, entries: Vec<BlacklistEntry>) {
        *self.blacklist.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(entries);
    }

    fn take_forced(&self) -> Vec<String> {
        std::mem::take(&mut *self.forced.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

struct RefreshGuard<'a>(&'a UpdateGate);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.refreshing.store(false, Ordering::SeqCst);
    }
}

/// What one refresh pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// False when rejected because another refresh was in flight
    pub started: bool,
    pub blacklist_loaded: bool,
    pub blacklist_entries: usize,
    pub manifests_loaded: usize,
    /// Download URLs handed to the loader
    pub scheduled: Vec<String>,
}

/// Run one refresh pass. Never fails; every network error is logged.
pub(crate) async fn refresh(shared: &Arc<Shared>, force: bool) -> RefreshReport {
    let gate = &shared.gate;
    if !gate.try_begin(force) {
        tracing::error!("Can not start new update before previous has finished");
        return RefreshReport::default();
    }
    let _guard = RefreshGuard(gate);
    let config = shared.settings.snapshot();
    let mut report = RefreshReport {
        started: true,
        ..RefreshReport::default()
    };

    gate.publish_blacklist(Vec::new());
    tracing::debug!(url = %config.blacklist_url, "Downloading blacklist");
    match shared.fetcher.get_text(&config.blacklist_url).await {
        Ok(text) => {
            let entries = parse_blacklist(&text);
            report.blacklist_loaded = true;
            report.blacklist_entries = entries.len();
            gate.publish_blacklist(entries);
        }
        Err(e) => tracing::warn!(error = %e, "Failed to download blacklist"),
    }

    let apply = shared.clone();
    if let Err(e) = shared.main.run(move || apply_blacklist(&apply)).await {
        tracing::warn!(error = %e, "Blacklist was not applied");
    }
    gate.completed.store(true, Ordering::SeqCst);

    let mut manifest = String::new();
    tracing::debug!(url = %config.update_url, "Downloading update list");
    match shared.fetcher.get_text(&config.update_url).await {
        Ok(text) => {
            manifest.push_str(&text);
            report.manifests_loaded += 1;
        }
        Err(e) => tracing::warn!(error = %e, "Failed to download update list"),
    }

    let extra = config.extra_update_urls();
    if !extra.is_empty() && !config.allow_extra_update_links {
        tracing::warn!(
            count = extra.len(),
            "Ignoring extra update links because allow_extra_update_links is off"
        );
    } else {
        for url in extra {
            tracing::warn!(
                url = %url,
                "!!! WARNING !!! Processing extra update list. Scripts listed in it are downloaded and run without a trust check"
            );
            match shared.fetcher.get_text(&url).await {
                Ok(text) => {
                    manifest.push('\n');
                    manifest.push_str(&text);
                    report.manifests_loaded += 1;
                }
                Err(e) => tracing::warn!(url = %url, error = %e, "Failed to download extra update list"),
            }
        }
    }

    let forced = gate.take_forced();
    let loaded: Vec<(String, u32)> = shared
        .registry
        .snapshot()
        .iter()
        .map(|s| (s.full_name().to_string(), s.version()))
        .collect();

    for entry in parse_update_manifest(&manifest) {
        let wanted = forced.contains(&entry.full_name)
            || loaded.iter().any(|(name, version)| {
                *name == entry.full_name && (*version < entry.version || config.force_update_all)
            });
        if wanted && !report.scheduled.contains(&entry.url) {
            tracing::debug!(script = %entry.full_name, url = %entry.url, "Adding to download list");
            report.scheduled.push(entry.url);
        }
    }

    for url in &report.scheduled {
        tracing::info!(url = %url, "Downloading script");
        fetch_and_enqueue(shared, url, true).await;
    }
    report
}

/// Download a script and hand it to the loader. Errors are logged.
pub(crate) async fn fetch_and_enqueue(shared: &Arc<Shared>, url: &str, is_first_batch: bool) -> bool {
    match shared.fetcher.get_text(url).await {
        Ok(source) => {
            shared.enqueue(LoadRequest {
                source,
                origin: None,
                is_first_batch,
                ignore_cache: true,
            });
            true
        }
        Err(e) => {
            tracing::error!(url = %url, error = %e, "Script download failed");
            false
        }
    }
}

/// Main-context half of a refresh: allow everything, flag blacklisted
/// versions, re-evaluate enable state
fn apply_blacklist(shared: &Shared) {
    let blacklist = shared.gate.blacklist();
    tracing::info!(
        entries = ?blacklist.iter().map(|e| format!("{} v{}", e.full_name, e.version)).collect::<Vec<_>>(),
        "Blacklist"
    );
    let context = shared.context();
    let disabled = shared.disabled_scripts();

    for instance in shared.registry.snapshot().iter() {
        let blacklisted = shared.gate.is_blacklisted(instance.metadata());
        instance.with_internal(|data| {
            data.allowed = true;
            data.blacklisted = blacklisted;
        });
        if blacklisted {
            tracing::info!(script = %instance.full_name(), "Script is blacklisted and will not be enabled");
        }
        state::update_state(instance, &context, &disabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_blacklist_is_permissive() {
        let entries = parse_blacklist("Foo.Bar,3\r\nbroken\nFoo.Baz,abc\nA,1,extra\n\nFoo.Qux,0\n");
        assert_eq!(
            entries,
            vec![
                BlacklistEntry {
                    full_name: "Foo.Bar".into(),
                    version: 3
                },
                BlacklistEntry {
                    full_name: "Foo.Qux".into(),
                    version: 0
                },
            ]
        );
    }

    #[test]
    fn test_parse_update_manifest() {
        let entries = parse_update_manifest(
            "Foo.Bar,2,https://github.com/PunishXIV/a.cs,comment\nFoo.Baz,x,https://b\nshort,1\n",
        );
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].full_name, "Foo.Bar");
        assert_eq!(entries[0].version, 2);
        assert_eq!(entries[0].url, "https://github.com/PunishXIV/a.cs");
    }

    #[test]
    fn test_blacklist_covers_version_and_below() {
        let gate = UpdateGate::new();
        gate.publish_blacklist(parse_blacklist("Foo.Bar,2"));

        assert!(gate.is_blacklisted(&ScriptMetadata::new("Foo", "Bar", 1)));
        assert!(gate.is_blacklisted(&ScriptMetadata::new("Foo", "Bar", 2)));
        assert!(!gate.is_blacklisted(&ScriptMetadata::new("Foo", "Bar", 3)));
        assert!(!gate.is_blacklisted(&ScriptMetadata::new("Foo", "Other", 1)));
    }

    #[test]
    fn test_refresh_guard() {
        let gate = UpdateGate::new();
        assert!(!gate.try_begin(false));
        assert!(gate.try_begin(true));
        // In flight: even forced attempts are rejected
        assert!(!gate.try_begin(true));
        drop(RefreshGuard(&gate));
        gate.completed.store(true, Ordering::SeqCst);
        assert!(gate.try_begin(false));
    }

    #[test]
    fn test_forced_list_is_taken_once() {
        let gate = UpdateGate::new();
        gate.force_update(vec!["Foo.Bar".to_string()]);
        assert_eq!(gate.take_forced(), vec!["Foo.Bar"]);
        assert!(gate.forced().is_empty());
    }
}
