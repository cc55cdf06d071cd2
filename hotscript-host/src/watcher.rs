//! Hot reload file watcher for the scripts directory
//!
//! Watches `Scripts/` recursively. A changed script file is queued for load
//! (the install replaces the live instance of the same name); a deleted one
//! is unloaded. Files whose content matches the live instance are skipped, so
//! the host persisting a download does not trigger a second load.

use crate::cache::source_hash;
use crate::host::Shared;
use crate::loader::LoadRequest;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;

/// Configuration for the script watcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Quiet period after the last event before changes are applied
    pub debounce: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
        }
    }
}

/// Errors that can occur while starting the watcher
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("Failed to initialize watcher: {0}")]
    WatcherInit(#[source] notify::Error),

    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Running watcher. Stops on [`ScriptWatcher::shutdown`] or drop.
pub struct ScriptWatcher {
    _watcher: RecommendedWatcher,
    shutdown_tx: mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
    dir: PathBuf,
}

impl ScriptWatcher {
    pub(crate) fn start(shared: Arc<Shared>, config: WatcherConfig) -> Result<Self, WatcherError> {
        let (dir, extension) = {
            let settings = shared.settings.read();
            (
                settings.scripts_dir(),
                shared.compiler.source_extension().to_string(),
            )
        };
        std::fs::create_dir_all(&dir).map_err(|source| WatcherError::Io {
            path: dir.clone(),
            source,
        })?;

        let (event_tx, event_rx) = mpsc::channel::<Event>(100);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let _ = event_tx.blocking_send(event);
                }
                Err(e) => tracing::warn!(error = %e, "Watch error"),
            }
        })
        .map_err(WatcherError::WatcherInit)?;
        watcher
            .watch(&dir, RecursiveMode::Recursive)
            .map_err(WatcherError::WatcherInit)?;
        tracing::info!(dir = %dir.display(), "Watching directory for scripts");

        let thread = thread::Builder::new()
            .name("hotscript-watcher".into())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(run(
                        shared,
                        extension,
                        config.debounce,
                        event_rx,
                        shutdown_rx,
                    )),
                    Err(e) => tracing::error!(error = %e, "Failed to build watcher runtime"),
                }
            })
            .map_err(|source| WatcherError::Io {
                path: dir.clone(),
                source,
            })?;

        Ok(Self {
            _watcher: watcher,
            shutdown_tx,
            thread: Some(thread),
            dir,
        })
    }

    /// Directory being watched
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stop watching and wait for the event thread to exit
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.shutdown_tx.try_send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ScriptWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    shared: Arc<Shared>,
    extension: String,
    debounce: Duration,
    mut event_rx: mpsc::Receiver<Event>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut host_shutdown = shared.shutdown.subscribe();
    let mut pending: Vec<PathBuf> = Vec::new();
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                tracing::info!("Script watcher shutting down");
                break;
            }
            _ = host_shutdown.changed() => break,
            Some(event) = event_rx.recv() => {
                for path in event.paths {
                    if path.extension().is_some_and(|ext| ext == extension.as_str()) {
                        if !pending.contains(&path) {
                            pending.push(path);
                        }
                        deadline = Some(tokio::time::Instant::now() + debounce);
                    }
                }
            }
            _ = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                for path in pending.drain(..) {
                    handle_file_change(&shared, path).await;
                }
                deadline = None;
            }
        }
    }
}

async fn handle_file_change(shared: &Arc<Shared>, path: PathBuf) {
    if shared.is_disposed() {
        return;
    }
    if !path.exists() {
        let unload = shared.clone();
        let target = path.clone();
        let removed = shared
            .main
            .run(move || {
                let Some(instance) = unload.registry.find_by_path(&target) else {
                    return None;
                };
                instance.disable();
                unload.registry.remove(&instance);
                Some(instance.full_name().to_string())
            })
            .await;
        if let Ok(Some(script)) = removed {
            tracing::info!(script = %script, path = %path.display(), "Script unloaded (file deleted)");
        }
        return;
    }

    let source = match std::fs::read_to_string(&path) {
        Ok(source) => source,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read changed script");
            return;
        }
    };
    let hash = source_hash(&source);
    let check = shared.clone();
    let target = path.clone();
    let unchanged = shared
        .main
        .run(move || {
            check
                .registry
                .find_by_path(&target)
                .and_then(|instance| instance.source_hash())
                .is_some_and(|live| live == hash)
        })
        .await;

    match unchanged {
        Ok(true) => tracing::debug!(path = %path.display(), "Script file unchanged, skipping"),
        Ok(false) => {
            tracing::info!(path = %path.display(), "Script file changed, reloading");
            shared.enqueue(LoadRequest::new(source).with_origin(path));
        }
        Err(e) => tracing::debug!(error = %e, "Watcher could not reach the main context"),
    }
}
