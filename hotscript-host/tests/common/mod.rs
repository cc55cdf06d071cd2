//! Shared fixtures for host integration tests
//!
//! `MockCompiler` understands a tiny line-based script format:
//!
//! ```text
//! namespace Test
//! class Alpha : Script
//! version 2
//! territories 100 200
//! fail on_update
//! panic on_enable
//! compile-error
//! ```

#![allow(dead_code)]

use hotscript_api::{HookResult, HostEvent, Script, ScriptContext, ScriptMetadata};
use hotscript_host::{
    CompileError, CompiledArtifact, Compiler, HostConfig, MemoryUpdateSummary, ScriptDescriptor,
    ScriptHost, StaticFetcher,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const BLACKLIST_URL: &str = "https://raw.githubusercontent.com/PunishXIV/Test/main/blacklist.csv";
pub const UPDATE_URL: &str = "https://raw.githubusercontent.com/PunishXIV/Test/main/update.csv";

pub type Journal = Arc<Mutex<Vec<String>>>;

/// Source text for a mock script
pub fn source(namespace: &str, class: &str, version: u32) -> String {
    format!("namespace {namespace}\nclass {class} : Script\nversion {version}\n")
}

#[derive(Debug, Clone, Default)]
struct Parsed {
    namespace: String,
    class: String,
    version: u32,
    territories: Option<BTreeSet<u32>>,
    fail: BTreeSet<String>,
    panic: BTreeSet<String>,
    compile_error: bool,
}

fn parse(text: &str) -> Parsed {
    let mut parsed = Parsed::default();
    for line in text.lines() {
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("namespace"), Some(ns)) => parsed.namespace = ns.to_string(),
            (Some("class"), Some(class)) => parsed.class = class.to_string(),
            (Some("version"), Some(v)) => parsed.version = v.parse().unwrap_or(0),
            (Some("territories"), first) => {
                parsed.territories = Some(
                    first
                        .into_iter()
                        .chain(words)
                        .filter_map(|t| t.parse().ok())
                        .collect(),
                )
            }
            (Some("fail"), Some(hook)) => {
                parsed.fail.insert(hook.to_string());
            }
            (Some("panic"), Some(hook)) => {
                parsed.panic.insert(hook.to_string());
            }
            (Some("compile-error"), _) => parsed.compile_error = true,
            _ => {}
        }
    }
    parsed
}

/// Script built from a mock source; journals every hook it sees
pub struct MockScript {
    metadata: ScriptMetadata,
    parsed: Parsed,
    journal: Journal,
}

impl MockScript {
    fn hook(&self, name: &str) -> HookResult {
        self.journal.lock().unwrap().push(format!(
            "{} v{} {name}",
            self.metadata.full_name(),
            self.metadata.version
        ));
        if self.parsed.panic.contains(name) {
            panic!("{name} exploded");
        }
        if self.parsed.fail.contains(name) {
            anyhow::bail!("{name} refused");
        }
        Ok(())
    }
}

impl Script for MockScript {
    fn metadata(&self) -> &ScriptMetadata {
        &self.metadata
    }

    fn on_setup(&mut self) -> HookResult {
        self.hook("on_setup")
    }

    fn on_enable(&mut self) -> HookResult {
        self.hook("on_enable")
    }

    fn on_disable(&mut self) -> HookResult {
        self.hook("on_disable")
    }

    fn on_reset(&mut self) -> HookResult {
        self.hook("on_reset")
    }

    fn on_script_updated(&mut self, previous_version: u32) -> HookResult {
        self.hook(&format!("on_script_updated {previous_version}"))
    }

    fn handle_event(&mut self, _ctx: &mut ScriptContext<'_>, event: &HostEvent) -> HookResult {
        match event {
            HostEvent::Reset => self.on_reset(),
            _ => self.hook(event.hook_name()),
        }
    }
}

/// Compiler for the mock format. The "image" is the source text itself.
pub struct MockCompiler {
    compiles: AtomicUsize,
    delay: Duration,
    journal: Journal,
}

impl MockCompiler {
    pub fn new(journal: Journal) -> Self {
        Self::with_delay(journal, Duration::ZERO)
    }

    pub fn with_delay(journal: Journal, delay: Duration) -> Self {
        Self {
            compiles: AtomicUsize::new(0),
            delay,
            journal,
        }
    }

    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

impl Compiler for MockCompiler {
    fn source_extension(&self) -> &str {
        "mock"
    }

    fn compile(
        &self,
        source: &str,
        module_name: &str,
        _origin: Option<&Path>,
    ) -> Result<CompiledArtifact, CompileError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if parse(source).compile_error {
            return Err(CompileError::Diagnostics {
                module: module_name.to_string(),
                message: "error CS1002: ; expected".to_string(),
            });
        }
        Ok(CompiledArtifact {
            image: source.as_bytes().to_vec(),
            symbols: module_name.as_bytes().to_vec(),
        })
    }

    fn load(&self, artifact: &CompiledArtifact) -> Result<Vec<ScriptDescriptor>, CompileError> {
        let text = String::from_utf8(artifact.image.clone())
            .map_err(|e| CompileError::Load(e.into()))?;
        let parsed = parse(&text);
        if parsed.class.is_empty() {
            return Ok(Vec::new());
        }
        let journal = self.journal.clone();
        Ok(vec![ScriptDescriptor::new(parsed.class.clone(), move || {
            let mut metadata =
                ScriptMetadata::new(&parsed.namespace, &parsed.class, parsed.version);
            metadata.valid_territories = parsed.territories.clone();
            Ok(Box::new(MockScript {
                metadata,
                parsed: parsed.clone(),
                journal: journal.clone(),
            }) as Box<dyn Script>)
        })])
    }
}

/// A host wired to mocks inside a temporary root
pub struct Harness {
    pub host: ScriptHost,
    pub compiler: Arc<MockCompiler>,
    pub fetcher: Arc<StaticFetcher>,
    pub summary: Arc<MemoryUpdateSummary>,
    pub journal: Journal,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(TempDir::new().unwrap(), Duration::ZERO, |_| {})
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self::build(TempDir::new().unwrap(), delay, |_| {})
    }

    pub fn with_config(configure: impl FnOnce(&mut HostConfig)) -> Self {
        Self::build(TempDir::new().unwrap(), Duration::ZERO, configure)
    }

    pub fn build(dir: TempDir, delay: Duration, configure: impl FnOnce(&mut HostConfig)) -> Self {
        let mut config = HostConfig::with_root(dir.path());
        config.blacklist_url = BLACKLIST_URL.to_string();
        config.update_url = UPDATE_URL.to_string();
        configure(&mut config);

        let journal: Journal = Arc::default();
        let compiler = Arc::new(MockCompiler::with_delay(journal.clone(), delay));
        let fetcher = Arc::new(
            StaticFetcher::new()
                .with(BLACKLIST_URL, "")
                .with(UPDATE_URL, ""),
        );
        let summary = Arc::new(MemoryUpdateSummary::new());

        let host = ScriptHost::builder(config)
            .with_compiler(compiler.clone())
            .with_fetcher(fetcher.clone())
            .with_summary(summary.clone())
            .build()
            .unwrap();

        Self {
            host,
            compiler,
            fetcher,
            summary,
            journal,
            dir,
        }
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.host.settings().read().scripts_dir()
    }

    /// Write a script file under `Scripts/`
    pub fn write_script(&self, relative: &str, text: &str) -> PathBuf {
        let path = self.scripts_dir().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, text).unwrap();
        path
    }

    pub fn load(&self, text: &str) {
        self.host.compile_and_load(text, None, false, false);
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    pub fn journal_contains(&self, entry: &str) -> bool {
        self.journal().iter().any(|e| e == entry)
    }

    /// Pump until the host is idle
    pub fn settle(&self) {
        assert!(
            pump_until(&self.host, Duration::from_secs(10), |h| !h.is_busy()),
            "host did not settle"
        );
        self.host.pump();
    }
}

/// Pump the main context until `done` holds or `timeout` passes
pub fn pump_until(host: &ScriptHost, timeout: Duration, done: impl Fn(&ScriptHost) -> bool) -> bool {
    let start = Instant::now();
    loop {
        host.pump();
        if done(host) {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
