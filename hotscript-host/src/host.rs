//! Script host
//!
//! [`ScriptHost`] is built on, and bound to, the designated main thread. It
//! owns the main context and everything shared with background threads.
//! Call [`ScriptHost::pump`] every frame so background loads can install.

use crate::cache::ScriptCache;
use crate::compiler::Compiler;
use crate::config::{HostConfig, Settings};
use crate::dispatch::{self, DispatchReport};
use crate::error::HostError;
use crate::fetch::{Fetcher, HttpFetcher};
use crate::gate::{self, RefreshReport, UpdateGate};
use crate::instance::ScriptInstance;
use crate::loader::{self, LoadQueue, LoadRequest};
use crate::main_context::{MainContext, MainContextHandle};
use crate::registry::{ScriptRegistry, Snapshot};
use crate::state::{self, GameContext};
use crate::summary::{MemoryUpdateSummary, NullStatusSink, StatusSink, UpdateSummary};
use crate::trust::TrustPolicy;
use crate::watcher::{ScriptWatcher, WatcherConfig, WatcherError};
use hotscript_api::HostEvent;
use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::Instant;
use tokio::sync::watch;

/// State shared between the main context and background threads
pub(crate) struct Shared {
    pub(crate) settings: Settings,
    pub(crate) compiler: Arc<dyn Compiler>,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) cache: ScriptCache,
    pub(crate) registry: ScriptRegistry,
    pub(crate) gate: UpdateGate,
    pub(crate) loader: LoadQueue,
    pub(crate) main: MainContextHandle,
    pub(crate) summary: Arc<dyn UpdateSummary>,
    pub(crate) shutdown: watch::Sender<bool>,
    context: RwLock<GameContext>,
    disposed: AtomicBool,
    background: AtomicUsize,
}

impl Shared {
    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn context(&self) -> GameContext {
        *self.context.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn disabled_scripts(&self) -> BTreeSet<String> {
        self.settings.read().disabled_scripts.clone()
    }

    pub(crate) fn enqueue(self: &Arc<Self>, request: LoadRequest) {
        loader::enqueue(self, request);
    }

    /// Count a background thread until the returned guard drops
    pub(crate) fn begin_background(self: &Arc<Self>) -> BackgroundJob {
        self.background.fetch_add(1, Ordering::SeqCst);
        BackgroundJob(self.clone())
    }

    /// Run an async job on its own thread and current-thread runtime
    fn spawn_background<F, Fut>(self: &Arc<Self>, name: &str, job: F) -> Result<(), HostError>
    where
        F: FnOnce(Arc<Shared>) -> Fut + Send + 'static,
        Fut: Future<Output = ()>,
    {
        let guard = self.begin_background();
        let shared = self.clone();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _guard = guard;
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(job(shared)),
                    Err(e) => tracing::error!(error = %e, "Failed to build background runtime"),
                }
            })
            .map(|_| ())
            .map_err(HostError::Spawn)
    }
}

/// Keeps [`ScriptHost::is_busy`] true while a background thread runs
pub(crate) struct BackgroundJob(Arc<Shared>);

impl Drop for BackgroundJob {
    fn drop(&mut self) {
        self.0.background.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Builder for [`ScriptHost`]
pub struct ScriptHostBuilder {
    config: HostConfig,
    compiler: Option<Arc<dyn Compiler>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    summary: Option<Arc<dyn UpdateSummary>>,
    status: Option<Arc<dyn StatusSink>>,
}

impl ScriptHostBuilder {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            compiler: None,
            fetcher: None,
            summary: None,
            status: None,
        }
    }

    pub fn with_compiler(mut self, compiler: Arc<dyn Compiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_summary(mut self, summary: Arc<dyn UpdateSummary>) -> Self {
        self.summary = Some(summary);
        self
    }

    pub fn with_status_sink(mut self, status: Arc<dyn StatusSink>) -> Self {
        self.status = Some(status);
        self
    }

    /// Build the host, binding its main context to the calling thread
    pub fn build(self) -> Result<ScriptHost, HostError> {
        let compiler = match self.compiler {
            Some(compiler) => compiler,
            None => default_compiler()?,
        };
        let fetcher = self
            .fetcher
            .unwrap_or_else(|| Arc::new(HttpFetcher::new(self.config.fetch_timeout())));
        let summary = self
            .summary
            .unwrap_or_else(|| Arc::new(MemoryUpdateSummary::new()));
        let status = self.status.unwrap_or_else(|| Arc::new(NullStatusSink));

        let main = MainContext::new();
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            cache: ScriptCache::new(self.config.cache_dir()),
            settings: Settings::new(self.config),
            compiler,
            fetcher,
            registry: ScriptRegistry::new(main.handle(), status),
            gate: UpdateGate::new(),
            loader: LoadQueue::new(),
            main: main.handle(),
            summary,
            shutdown,
            context: RwLock::new(GameContext::default()),
            disposed: AtomicBool::new(false),
            background: AtomicUsize::new(0),
        });

        tracing::info!(
            root = %shared.settings.read().root_dir.display(),
            host_version = %shared.settings.read().host_version,
            "Script host ready"
        );
        Ok(ScriptHost { shared, main })
    }
}

#[cfg(feature = "wasm")]
fn default_compiler() -> Result<Arc<dyn Compiler>, HostError> {
    crate::wasm::WasmCompiler::new()
        .map(|c| Arc::new(c) as Arc<dyn Compiler>)
        .map_err(|e| HostError::Compile(crate::compiler::CompileError::Load(e.into())))
}

#[cfg(not(feature = "wasm"))]
fn default_compiler() -> Result<Arc<dyn Compiler>, HostError> {
    Err(HostError::NoCompiler)
}

/// The script lifecycle engine
pub struct ScriptHost {
    shared: Arc<Shared>,
    main: MainContext,
}

impl ScriptHost {
    pub fn builder(config: HostConfig) -> ScriptHostBuilder {
        ScriptHostBuilder::new(config)
    }

    /// Run work handed off by background threads. Call once per frame.
    pub fn pump(&self) -> usize {
        self.main.pump()
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    pub fn registry(&self) -> &ScriptRegistry {
        &self.shared.registry
    }

    /// Current registry snapshot
    pub fn scripts(&self) -> Snapshot {
        self.shared.registry.snapshot()
    }

    pub fn find(&self, full_name: &str) -> Option<Arc<ScriptInstance>> {
        self.shared.registry.find(full_name)
    }

    pub fn gate(&self) -> &UpdateGate {
        &self.shared.gate
    }

    pub fn summary(&self) -> &Arc<dyn UpdateSummary> {
        &self.shared.summary
    }

    pub fn main_context(&self) -> MainContextHandle {
        self.shared.main.clone()
    }

    /// Queue source text for compilation and install
    pub fn compile_and_load(
        &self,
        source: impl Into<String>,
        origin: Option<PathBuf>,
        is_first_batch: bool,
        ignore_cache: bool,
    ) {
        self.enqueue(LoadRequest {
            source: source.into(),
            origin,
            is_first_batch,
            ignore_cache,
        });
    }

    pub fn enqueue(&self, request: LoadRequest) {
        if self.shared.is_disposed() {
            tracing::warn!("Load requested after dispose, ignoring");
            return;
        }
        self.shared.enqueue(request);
    }

    /// Unload everything and load every script file under `Scripts/` again.
    /// Returns the number of files queued.
    pub fn reload_all(&self) -> Result<usize, HostError> {
        self.ensure_idle_worker()?;
        let (scripts_dir, extension) = {
            let config = self.shared.settings.read();
            (
                config.scripts_dir(),
                self.shared.compiler.source_extension().to_string(),
            )
        };

        self.shared.summary.reset();
        self.shared.gate.invalidate();
        for instance in self.scripts().iter() {
            instance.disable();
        }
        self.shared.registry.clear();

        std::fs::create_dir_all(&scripts_dir).map_err(|e| HostError::io(&scripts_dir, e))?;
        let mut files = Vec::new();
        collect_sources(&scripts_dir, &extension, &mut files)?;
        files.sort();

        let mut queued = 0;
        for path in files {
            match std::fs::read_to_string(&path) {
                Ok(source) => {
                    self.enqueue(LoadRequest {
                        source,
                        origin: Some(path),
                        is_first_batch: true,
                        ignore_cache: false,
                    });
                    queued += 1;
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Failed to read script file")
                }
            }
        }
        tracing::info!(queued, dir = %scripts_dir.display(), "Reloading all scripts");
        Ok(queued)
    }

    /// Unload one script and load it again from its file
    pub fn reload_script(
        &self,
        instance: &Arc<ScriptInstance>,
        ignore_cache: bool,
    ) -> Result<(), HostError> {
        self.reload(std::slice::from_ref(instance), false, ignore_cache)
    }

    /// Unload several scripts and load them again from their files
    ///
    /// Every file is read before anything is unloaded; if one can not be
    /// read, all of the scripts stay loaded.
    pub fn reload_scripts(
        &self,
        instances: &[Arc<ScriptInstance>],
        is_first_batch: bool,
    ) -> Result<(), HostError> {
        self.reload(instances, is_first_batch, false)
    }

    fn reload(
        &self,
        instances: &[Arc<ScriptInstance>],
        is_first_batch: bool,
        ignore_cache: bool,
    ) -> Result<(), HostError> {
        self.ensure_idle_worker()?;
        let mut requests = Vec::with_capacity(instances.len());
        for instance in instances {
            let path = instance
                .path()
                .ok_or_else(|| HostError::NotPersisted(instance.full_name().to_string()))?;
            let source = std::fs::read_to_string(&path).map_err(|e| HostError::io(&path, e))?;
            requests.push(
                LoadRequest::new(source)
                    .with_origin(path)
                    .first_batch(is_first_batch)
                    .ignore_cache(ignore_cache),
            );
        }
        for (instance, request) in instances.iter().zip(requests) {
            self.unload(instance);
            self.enqueue(request);
        }
        Ok(())
    }

    /// Disable and remove a script. Its file stays on disk.
    pub fn unload(&self, instance: &Arc<ScriptInstance>) -> bool {
        instance.disable();
        let removed = self.shared.registry.remove(instance);
        if removed {
            tracing::info!(script = %instance.full_name(), "Script unloaded");
        }
        removed
    }

    fn ensure_idle_worker(&self) -> Result<(), HostError> {
        if self.shared.loader.is_running() {
            tracing::warn!("Can not reload scripts while the load worker is running");
            return Err(HostError::Busy);
        }
        Ok(())
    }

    pub fn is_trusted(&self, url: &str) -> bool {
        TrustPolicy::new()
            .with_extra_prefixes(self.shared.settings.read().extra_trusted_prefixes())
            .is_trusted(url)
    }

    /// Download a script from a trusted URL in the background and load it.
    /// Returns false (and logs) when the URL is not trusted.
    pub fn download(&self, url: &str, is_first_batch: bool) -> bool {
        if !self.is_trusted(url) {
            tracing::error!(url = %url, "Refusing to download script from untrusted URL");
            return false;
        }
        let url = url.to_string();
        let spawned = self.shared.spawn_background("hotscript-download", move |shared| async move {
            gate::fetch_and_enqueue(&shared, &url, is_first_batch).await;
        });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "Failed to start download");
            return false;
        }
        true
    }

    /// Run a gate refresh on a background thread
    pub fn begin_refresh(&self, force: bool) {
        let spawned = self.shared.spawn_background("hotscript-refresh", move |shared| async move {
            let report: RefreshReport = gate::refresh(&shared, force).await;
            tracing::debug!(?report, "Refresh finished");
        });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "Failed to start refresh");
        }
    }

    /// Download these scripts on the next refresh regardless of version
    pub fn force_update(&self, names: impl IntoIterator<Item = String>) {
        self.shared.gate.force_update(names);
    }

    pub fn context(&self) -> GameContext {
        self.shared.context()
    }

    /// Territory/session change; re-evaluates every script
    pub fn set_context(&self, context: GameContext) {
        *self
            .shared
            .context
            .write()
            .unwrap_or_else(PoisonError::into_inner) = context;
        self.refresh_states();
    }

    /// Add or remove a script from the user's disabled list
    pub fn set_script_disabled(&self, full_name: &str, disabled: bool) {
        self.shared.settings.update(|config| {
            if disabled {
                config.disabled_scripts.insert(full_name.to_string());
            } else {
                config.disabled_scripts.remove(full_name);
            }
        });
        self.refresh_states();
    }

    /// Re-evaluate every script's enabled state. Returns the transitions made.
    pub fn refresh_states(&self) -> usize {
        state::update_all(
            &self.shared.registry,
            &self.shared.context(),
            &self.shared.disabled_scripts(),
        )
    }

    /// Broadcast an event to enabled scripts
    pub fn dispatch(&self, event: &HostEvent) -> DispatchReport {
        self.dispatch_at(event, Instant::now())
    }

    /// Broadcast with an explicit timestamp (deadlines compare against it)
    pub fn dispatch_at(&self, event: &HostEvent, now: Instant) -> DispatchReport {
        dispatch::dispatch(&self.shared.registry, event, now)
    }

    pub fn is_worker_running(&self) -> bool {
        self.shared.loader.is_running()
    }

    /// Worker threads started so far
    pub fn worker_spawn_count(&self) -> usize {
        self.shared.loader.spawn_count()
    }

    pub fn pending_loads(&self) -> usize {
        self.shared.loader.pending()
    }

    /// Anything queued or running in the background
    pub fn is_busy(&self) -> bool {
        self.shared.background.load(Ordering::SeqCst) > 0 || self.shared.loader.pending() > 0
    }

    /// Watch `Scripts/` and reload scripts whose files change
    pub fn watch_scripts(&self, config: WatcherConfig) -> Result<ScriptWatcher, WatcherError> {
        ScriptWatcher::start(self.shared.clone(), config)
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Stop background work and unload everything
    ///
    /// Handoffs already queued still reach the main context; they see the
    /// disposed flag and install nothing.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.shutdown.send_replace(true);
        for instance in self.scripts().iter() {
            instance.disable();
        }
        self.shared.registry.clear();
        self.main.pump();
        self.main.close();
        self.main.pump();
        tracing::info!("Script host disposed");
    }
}

impl Drop for ScriptHost {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn collect_sources(dir: &Path, extension: &str, out: &mut Vec<PathBuf>) -> Result<(), HostError> {
    let entries = std::fs::read_dir(dir).map_err(|e| HostError::io(dir, e))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_sources(&path, extension, out)?;
        } else if path.extension().is_some_and(|ext| ext == extension) {
            out.push(path);
        }
    }
    Ok(())
}
