//! Main-context half of a load: instantiate, replace, persist, set up

use crate::compiler::{CompileError, CompiledArtifact};
use crate::config::HostConfig;
use crate::error::HostError;
use crate::host::Shared;
use crate::instance::{InternalData, ScriptInstance};
use crate::state::{self, GameContext};
use hotscript_api::Script;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Install a compiled artifact, recording failures for its origin file
pub(crate) fn handoff(
    shared: &Arc<Shared>,
    artifact: CompiledArtifact,
    source: String,
    hash: String,
    origin: Option<PathBuf>,
) {
    match install(shared, &artifact, &source, &hash, origin.as_deref()) {
        Ok(names) => tracing::debug!(scripts = ?names, "Install finished"),
        Err(HostError::Disposed) => {}
        Err(e) => {
            tracing::error!(origin = ?origin, error = %e, "Failed to install script");
            if let Some(path) = &origin {
                shared.summary.record_failed(path);
            }
        }
    }
}

fn install(
    shared: &Shared,
    artifact: &CompiledArtifact,
    source: &str,
    hash: &str,
    origin: Option<&Path>,
) -> Result<Vec<String>, HostError> {
    if shared.is_disposed() {
        tracing::error!(fatal = true, origin = ?origin, "Host was disposed during script loading");
        return Err(HostError::Disposed);
    }
    shared.registry.assert_main("install");

    let descriptors = shared.compiler.load(artifact)?;
    if descriptors.is_empty() {
        return Err(CompileError::NoScripts.into());
    }

    let config = shared.settings.snapshot();
    let context = shared.context();
    let mut installed = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors {
        tracing::debug!(type_name = %descriptor.type_name(), "Instantiating script");
        let script = descriptor.instantiate().map_err(CompileError::Load)?;
        installed.push(install_one(shared, &config, &context, script, source, hash, origin)?);
    }
    Ok(installed)
}

fn install_one(
    shared: &Shared,
    config: &HostConfig,
    context: &GameContext,
    script: Box<dyn Script>,
    source: &str,
    hash: &str,
    origin: Option<&Path>,
) -> Result<String, HostError> {
    let metadata = script.metadata().clone();
    let full_name = metadata.full_name();

    let mut internal = InternalData::new(full_name.clone(), origin.map(Path::to_path_buf));
    internal.allowed = shared.gate.is_completed();
    internal.blacklisted = shared.gate.is_blacklisted(&metadata);
    internal.source_hash = Some(hash.to_string());

    let previous = shared.registry.find(&full_name);
    let previous_version = previous.as_ref().map(|p| p.version());
    if let Some(previous) = &previous {
        if let Some(path) = previous.path() {
            internal.path = Some(path);
        }
        internal.config_open = previous.config_open();
    }

    // A failed write leaves the previous version running
    let instance = Arc::new(ScriptInstance::new(script, internal));
    persist(shared, config, &instance, source, previous.is_some())?;

    if let Some(previous) = &previous {
        tracing::info!(
            script = %full_name,
            from = previous.version(),
            to = metadata.version,
            "Replacing loaded script"
        );
        previous.disable();
        shared.registry.remove(previous);
    }
    shared.registry.add(instance.clone());

    let now = Instant::now();
    instance.load_overrides(&config.overrides_dir());
    instance.call_hook("on_setup", now, |script, _| script.on_setup());
    instance.apply_overrides();

    if let Some(previous_version) = previous_version {
        instance.call_hook("on_script_updated", now, |script, _| {
            script.on_script_updated(previous_version)
        });
        shared.summary.remove_updated(&full_name);
        shared
            .summary
            .record_updated(&full_name, previous_version, metadata.version);
    }

    if let Some(origin) = origin {
        shared.summary.remove_failed(origin);
    }
    if let Some(path) = instance.path() {
        shared.summary.remove_failed(&path);
    }

    state::update_state(&instance, context, &config.disabled_scripts);
    tracing::info!(
        script = %full_name,
        version = metadata.version,
        path = ?instance.path(),
        enabled = instance.is_enabled(),
        "Script loaded"
    );
    Ok(full_name)
}

/// Write new scripts under `Scripts/<namespace>/<name>.<ext>`; rewrite the
/// file of a replaced script when its content changed
fn persist(
    shared: &Shared,
    config: &HostConfig,
    instance: &ScriptInstance,
    source: &str,
    replaced: bool,
) -> Result<(), HostError> {
    match instance.path() {
        None => {
            let metadata = instance.metadata();
            let dir = config.scripts_dir().join(&metadata.namespace);
            std::fs::create_dir_all(&dir).map_err(|e| HostError::io(&dir, e))?;
            let path = dir.join(format!(
                "{}.{}",
                metadata.name,
                shared.compiler.source_extension()
            ));
            std::fs::write(&path, source).map_err(|e| HostError::io(&path, e))?;
            tracing::info!(script = %instance.full_name(), path = %path.display(), "Script saved");
            instance.with_internal(|data| data.path = Some(path));
        }
        Some(path) if replaced => {
            let unchanged = std::fs::read_to_string(&path)
                .map(|current| current == source)
                .unwrap_or(false);
            if !unchanged {
                std::fs::write(&path, source).map_err(|e| HostError::io(&path, e))?;
                tracing::info!(script = %instance.full_name(), path = %path.display(), "Script file updated");
            }
        }
        Some(_) => {}
    }
    Ok(())
}
