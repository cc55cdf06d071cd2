//! Background load/compile worker
//!
//! Load requests go into an unbounded FIFO queue that any thread may feed.
//! At most one worker thread drains it at a time. The worker compiles (or
//! reads the compile cache), then hands each artifact to the main context and
//! waits for the install to finish before taking the next request. It exits
//! after an idle timeout or on host shutdown.

use crate::cache::CacheKey;
use crate::compiler::{CompileError, CompiledArtifact};
use crate::error::HostError;
use crate::host::Shared;
use crate::main_context::panic_message;
use crate::{gate, install, source_scan, summary};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use tokio::sync::mpsc;

/// A pending unit of work
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub source: String,
    /// `None` for freshly downloaded sources that are not on disk yet
    pub origin: Option<PathBuf>,
    /// Part of a batch that should end with the update summary
    pub is_first_batch: bool,
    /// Skip the cache lookup (the result is still stored)
    pub ignore_cache: bool,
}

impl LoadRequest {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            origin: None,
            is_first_batch: false,
            ignore_cache: false,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<PathBuf>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn first_batch(mut self, is_first_batch: bool) -> Self {
        self.is_first_batch = is_first_batch;
        self
    }

    pub fn ignore_cache(mut self, ignore_cache: bool) -> Self {
        self.ignore_cache = ignore_cache;
        self
    }
}

/// Queue plus single-flight worker bookkeeping
pub(crate) struct LoadQueue {
    tx: mpsc::UnboundedSender<LoadRequest>,
    // Held by the running worker, parked here otherwise
    rx: Mutex<Option<mpsc::UnboundedReceiver<LoadRequest>>>,
    pending: AtomicUsize,
    running: AtomicBool,
    spawned: AtomicUsize,
}

impl LoadQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            pending: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            spawned: AtomicUsize::new(0),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Worker threads started since the host was built
    pub(crate) fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    fn park(&self, rx: mpsc::UnboundedReceiver<LoadRequest>) {
        *self.rx.lock().unwrap_or_else(PoisonError::into_inner) = Some(rx);
    }

    fn take(&self) -> Option<mpsc::UnboundedReceiver<LoadRequest>> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Queue a request and make sure a worker is draining the queue
pub(crate) fn enqueue(shared: &Arc<Shared>, request: LoadRequest) {
    let loader = &shared.loader;
    loader.pending.fetch_add(1, Ordering::SeqCst);
    if loader.tx.send(request).is_err() {
        loader.pending.fetch_sub(1, Ordering::SeqCst);
        tracing::error!("Load queue is closed");
        return;
    }
    ensure_worker(shared);
}

fn ensure_worker(shared: &Arc<Shared>) {
    let loader = &shared.loader;
    if shared.is_disposed() {
        // No worker will run again; whoever holds the receiver clears the queue
        if let Some(mut rx) = loader.take() {
            abandon_queued(loader, &mut rx);
            loader.park(rx);
        }
        return;
    }
    if loader
        .running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }

    let job = shared.begin_background();
    let worker = shared.clone();
    let spawned = thread::Builder::new()
        .name("hotscript-loader".into())
        .spawn(move || {
            let _job = job;
            run_worker(worker);
        });

    match spawned {
        Ok(_) => {
            let count = loader.spawned.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::debug!(spawned = count, "Load worker started");
        }
        Err(e) => {
            loader.running.store(false, Ordering::SeqCst);
            tracing::error!(error = %e, "Failed to start load worker");
        }
    }
}

fn run_worker(shared: Arc<Shared>) {
    let loader = &shared.loader;
    let Some(mut rx) = loader.take() else {
        loader.running.store(false, Ordering::SeqCst);
        tracing::error!("Load worker started without the queue receiver");
        return;
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            loader.park(rx);
            loader.running.store(false, Ordering::SeqCst);
            tracing::error!(error = %e, "Failed to build load worker runtime");
            return;
        }
    };

    let first_batch = runtime.block_on(drain(&shared, &mut rx));

    loader.park(rx);
    loader.running.store(false, Ordering::SeqCst);
    tracing::debug!("Load worker idle, stopping");

    // Requests that raced the idle timeout
    if loader.pending() > 0 {
        ensure_worker(&shared);
    }
    if shared.is_disposed() {
        return;
    }

    runtime.block_on(async {
        if !shared.gate.is_completed() {
            gate::refresh(&shared, true).await;
        }
        if first_batch {
            let summary = shared.summary.clone();
            if let Err(e) = shared
                .main
                .run(move || summary::open_if_needed(summary.as_ref()))
                .await
            {
                tracing::debug!(error = %e, "Update summary not opened");
            }
        }
    });
}

/// Process requests until idle or shutdown. Returns whether any request
/// belonged to a first batch.
async fn drain(shared: &Arc<Shared>, rx: &mut mpsc::UnboundedReceiver<LoadRequest>) -> bool {
    let idle = shared.settings.read().idle_timeout();
    let mut shutdown = shared.shutdown.subscribe();
    let mut first_batch = false;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let request = tokio::select! {
            _ = shutdown.changed() => break,
            received = tokio::time::timeout(idle, rx.recv()) => match received {
                Ok(Some(request)) => request,
                Ok(None) | Err(_) => break,
            },
        };
        shared.loader.pending.fetch_sub(1, Ordering::SeqCst);
        first_batch |= request.is_first_batch;
        process(shared, request).await;
    }
    if shared.is_disposed() {
        abandon_queued(&shared.loader, rx);
    }
    first_batch
}

/// Drop everything still queued after shutdown
fn abandon_queued(loader: &LoadQueue, rx: &mut mpsc::UnboundedReceiver<LoadRequest>) {
    while let Ok(request) = rx.try_recv() {
        loader.pending.fetch_sub(1, Ordering::SeqCst);
        tracing::warn!(origin = ?request.origin, "Load request abandoned on shutdown");
    }
}

async fn process(shared: &Arc<Shared>, request: LoadRequest) {
    let LoadRequest {
        source,
        origin,
        ignore_cache,
        ..
    } = request;
    let (host_version, disable_cache) = {
        let config = shared.settings.read();
        (config.host_version.clone(), config.disable_cache)
    };
    let key = CacheKey::for_source(&source, &host_version);

    let artifact =
        match compile_cached(shared, &source, origin.as_deref(), &key, disable_cache, ignore_cache) {
            Ok(artifact) => artifact,
            Err(e) => {
                tracing::error!(origin = ?origin, error = %e, "Script compilation failed");
                if let Some(path) = origin {
                    let summary = shared.summary.clone();
                    let _ = shared.main.run(move || summary.record_failed(&path)).await;
                }
                return;
            }
        };

    if shared.is_disposed() {
        tracing::error!(fatal = true, origin = ?origin, "Host was disposed during script loading");
        return;
    }

    let install_shared = shared.clone();
    let hash = key.hash;
    let handoff = shared
        .main
        .run(move || install::handoff(&install_shared, artifact, source, hash, origin))
        .await;
    if let Err(e) = handoff {
        tracing::error!(fatal = true, error = %e, "Host was disposed during script loading");
    }
}

fn compile_cached(
    shared: &Shared,
    source: &str,
    origin: Option<&Path>,
    key: &CacheKey,
    disable_cache: bool,
    ignore_cache: bool,
) -> Result<CompiledArtifact, HostError> {
    if !disable_cache && !ignore_cache {
        match shared.cache.load(key) {
            Ok(Some(artifact)) => {
                tracing::debug!(hash = %key.hash, "Loading script from cache");
                return Ok(artifact);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Cache read failed, compiling"),
        }
    }

    let compiler = &shared.compiler;
    let module = source_scan::module_name(source, origin, compiler.script_contract());
    tracing::debug!(module = %module, origin = ?origin, "Compiling script");
    let artifact = panic::catch_unwind(AssertUnwindSafe(|| compiler.compile(source, &module, origin)))
        .map_err(|payload| CompileError::Panicked(panic_message(payload.as_ref())))??;

    if !disable_cache {
        if let Err(e) = shared.cache.store(key, &artifact) {
            tracing::warn!(error = %e, "Failed to store compiled script in cache");
        }
    }
    Ok(artifact)
}
