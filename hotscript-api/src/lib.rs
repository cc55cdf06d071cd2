//! hotscript-api: Script contract for the hotscript runtime
//!
//! This crate defines what a script is from the host's point of view:
//! its declared metadata, the lifecycle and event hooks it may implement,
//! and the wire types shared with compiled (wasm) scripts.
//! Wasm communication uses MessagePack serialization.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub mod controller;
pub mod event;

pub use controller::{Controller, ScriptContext, TaskId};
pub use event::{
    ActionEffectSet, ActorControl, DirectorUpdateCategory, HostEvent, StatusEffect,
};

/// API version for compatibility checking
pub const API_VERSION: u32 = 1;

/// Result type returned by every script hook
pub type HookResult = anyhow::Result<()>;

/// Identity and gating information a script declares about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptMetadata {
    /// Namespace, also the directory the script is persisted under
    pub namespace: String,

    /// Short name, also the persisted file stem
    pub name: String,

    /// Monotonic script version compared against blacklist and update manifests
    pub version: u32,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub author: Option<String>,

    /// Territories the script is valid in. `None` means everywhere.
    #[serde(default)]
    pub valid_territories: Option<BTreeSet<u32>>,
}

impl ScriptMetadata {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, version: u32) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            version,
            description: None,
            author: None,
            valid_territories: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_territories(mut self, territories: impl IntoIterator<Item = u32>) -> Self {
        self.valid_territories = Some(territories.into_iter().collect());
        self
    }

    /// `namespace.name`, the key scripts are identified by everywhere
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }
}

/// Manifest exported by a compiled wasm script
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptManifest {
    /// API version for compatibility
    pub api_version: u32,

    /// Declared script metadata
    pub metadata: ScriptMetadata,
}

/// The contract every loadable script implements
///
/// All hooks default to doing nothing. A hook reports failure by returning
/// `Err`; panics are caught by the host as well. Either way the failure is
/// logged against this script only and other scripts keep receiving events.
pub trait Script: Send {
    fn metadata(&self) -> &ScriptMetadata;

    /// Called once after the instance is registered
    fn on_setup(&mut self) -> HookResult {
        Ok(())
    }

    fn on_enable(&mut self) -> HookResult {
        Ok(())
    }

    fn on_disable(&mut self) -> HookResult {
        Ok(())
    }

    /// Return to a clean state. Scheduled sub-tasks are already cancelled.
    fn on_reset(&mut self) -> HookResult {
        Ok(())
    }

    /// This instance replaced an older loaded version
    fn on_script_updated(&mut self, _previous_version: u32) -> HookResult {
        Ok(())
    }

    /// Operator-provided configuration overrides
    fn apply_overrides(&mut self, _overrides: &BTreeMap<String, String>) -> HookResult {
        Ok(())
    }

    /// A sub-task scheduled through [`ScriptContext::schedule`] came due
    fn on_scheduled(&mut self, _ctx: &mut ScriptContext<'_>, _label: &str) -> HookResult {
        Ok(())
    }

    fn on_update(&mut self, _ctx: &mut ScriptContext<'_>) -> HookResult {
        Ok(())
    }

    fn on_combat_start(&mut self, _ctx: &mut ScriptContext<'_>) -> HookResult {
        Ok(())
    }

    fn on_combat_end(&mut self, _ctx: &mut ScriptContext<'_>) -> HookResult {
        Ok(())
    }

    fn on_map_effect(
        &mut self,
        _ctx: &mut ScriptContext<'_>,
        _position: u32,
        _param1: u16,
        _param2: u16,
    ) -> HookResult {
        Ok(())
    }

    fn on_object_effect(
        &mut self,
        _ctx: &mut ScriptContext<'_>,
        _target: u32,
        _param1: u16,
        _param2: u16,
    ) -> HookResult {
        Ok(())
    }

    fn on_starting_cast(
        &mut self,
        _ctx: &mut ScriptContext<'_>,
        _source: u32,
        _cast_id: u32,
    ) -> HookResult {
        Ok(())
    }

    fn on_message(&mut self, _ctx: &mut ScriptContext<'_>, _text: &str) -> HookResult {
        Ok(())
    }

    fn on_vfx_spawn(&mut self, _ctx: &mut ScriptContext<'_>, _target: u32, _path: &str) -> HookResult {
        Ok(())
    }

    fn on_tether_create(
        &mut self,
        _ctx: &mut ScriptContext<'_>,
        _source: u32,
        _target: u32,
        _data2: u32,
        _data3: u32,
        _data5: u32,
    ) -> HookResult {
        Ok(())
    }

    fn on_tether_removal(
        &mut self,
        _ctx: &mut ScriptContext<'_>,
        _source: u32,
        _data2: u32,
        _data3: u32,
        _data5: u32,
    ) -> HookResult {
        Ok(())
    }

    fn on_director_update(
        &mut self,
        _ctx: &mut ScriptContext<'_>,
        _category: DirectorUpdateCategory,
    ) -> HookResult {
        Ok(())
    }

    fn on_phase_change(&mut self, _ctx: &mut ScriptContext<'_>, _phase: i32) -> HookResult {
        Ok(())
    }

    fn on_object_creation(&mut self, _ctx: &mut ScriptContext<'_>, _object_id: u64) -> HookResult {
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn on_action_effect(
        &mut self,
        _ctx: &mut ScriptContext<'_>,
        _action_id: u32,
        _animation_id: u16,
        _effect_type: u8,
        _source_id: u32,
        _target_id: u64,
        _damage: u32,
    ) -> HookResult {
        Ok(())
    }

    fn on_actor_control(&mut self, _ctx: &mut ScriptContext<'_>, _control: &ActorControl) -> HookResult {
        Ok(())
    }

    fn on_action_effect_event(
        &mut self,
        _ctx: &mut ScriptContext<'_>,
        _set: &ActionEffectSet,
    ) -> HookResult {
        Ok(())
    }

    fn on_gain_buff_effect(
        &mut self,
        _ctx: &mut ScriptContext<'_>,
        _source_id: u32,
        _status: &StatusEffect,
    ) -> HookResult {
        Ok(())
    }

    fn on_remove_buff_effect(
        &mut self,
        _ctx: &mut ScriptContext<'_>,
        _source_id: u32,
        _status: &StatusEffect,
    ) -> HookResult {
        Ok(())
    }

    fn on_update_buff_effect(
        &mut self,
        _ctx: &mut ScriptContext<'_>,
        _source_id: u32,
        _status: &StatusEffect,
    ) -> HookResult {
        Ok(())
    }

    /// Route an event to its hook
    ///
    /// Scripts whose hooks live elsewhere (e.g. a wasm guest with a single
    /// event entry point) override this instead of the individual hooks.
    fn handle_event(&mut self, ctx: &mut ScriptContext<'_>, event: &HostEvent) -> HookResult {
        match event {
            HostEvent::Update => self.on_update(ctx),
            HostEvent::CombatStart => self.on_combat_start(ctx),
            HostEvent::CombatEnd => self.on_combat_end(ctx),
            HostEvent::Reset => self.on_reset(),
            HostEvent::MapEffect {
                position,
                param1,
                param2,
            } => self.on_map_effect(ctx, *position, *param1, *param2),
            HostEvent::ObjectEffect {
                target,
                param1,
                param2,
            } => self.on_object_effect(ctx, *target, *param1, *param2),
            HostEvent::StartingCast { source, cast_id } => {
                self.on_starting_cast(ctx, *source, *cast_id)
            }
            HostEvent::Message { text } => self.on_message(ctx, text),
            HostEvent::VfxSpawn { target, path } => self.on_vfx_spawn(ctx, *target, path),
            HostEvent::TetherCreate {
                source,
                target,
                data2,
                data3,
                data5,
            } => self.on_tether_create(ctx, *source, *target, *data2, *data3, *data5),
            HostEvent::TetherRemoval {
                source,
                data2,
                data3,
                data5,
            } => self.on_tether_removal(ctx, *source, *data2, *data3, *data5),
            HostEvent::DirectorUpdate { category } => self.on_director_update(ctx, *category),
            HostEvent::PhaseChange { phase } => self.on_phase_change(ctx, *phase),
            HostEvent::ObjectCreation { object_id } => self.on_object_creation(ctx, *object_id),
            HostEvent::ActionEffect {
                action_id,
                animation_id,
                effect_type,
                source_id,
                target_id,
                damage,
            } => self.on_action_effect(
                ctx,
                *action_id,
                *animation_id,
                *effect_type,
                *source_id,
                *target_id,
                *damage,
            ),
            HostEvent::ActorControl(control) => self.on_actor_control(ctx, control),
            HostEvent::ActionEffectEvent(set) => self.on_action_effect_event(ctx, set),
            HostEvent::GainBuffEffect { source_id, status } => {
                self.on_gain_buff_effect(ctx, *source_id, status)
            }
            HostEvent::RemoveBuffEffect { source_id, status } => {
                self.on_remove_buff_effect(ctx, *source_id, status)
            }
            HostEvent::UpdateBuffEffect { source_id, status } => {
                self.on_update_buff_effect(ctx, *source_id, status)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    struct Recorder {
        metadata: ScriptMetadata,
        calls: Vec<String>,
    }

    impl Script for Recorder {
        fn metadata(&self) -> &ScriptMetadata {
            &self.metadata
        }

        fn on_starting_cast(
            &mut self,
            _ctx: &mut ScriptContext<'_>,
            source: u32,
            cast_id: u32,
        ) -> HookResult {
            self.calls.push(format!("cast {source} {cast_id}"));
            Ok(())
        }

        fn on_message(&mut self, _ctx: &mut ScriptContext<'_>, text: &str) -> HookResult {
            anyhow::bail!("cannot handle {text}")
        }
    }

    #[test]
    fn test_full_name() {
        let metadata = ScriptMetadata::new("Foo", "Bar", 1);
        assert_eq!(metadata.full_name(), "Foo.Bar");
        assert_eq!(ScriptMetadata::new("", "Bar", 1).full_name(), "Bar");
    }

    #[test]
    fn test_handle_event_routes_to_hook() {
        let mut script = Recorder {
            metadata: ScriptMetadata::new("Foo", "Bar", 1),
            calls: Vec::new(),
        };
        let mut controller = Controller::new();
        let mut ctx = ScriptContext::new("Foo.Bar", Instant::now(), &mut controller);

        script
            .handle_event(
                &mut ctx,
                &HostEvent::StartingCast {
                    source: 7,
                    cast_id: 31,
                },
            )
            .unwrap();
        script.handle_event(&mut ctx, &HostEvent::Update).unwrap();
        let err = script
            .handle_event(
                &mut ctx,
                &HostEvent::Message {
                    text: "hi".into(),
                },
            )
            .unwrap_err();

        assert_eq!(script.calls, vec!["cast 7 31"]);
        assert_eq!(err.to_string(), "cannot handle hi");
    }

    #[test]
    fn test_manifest_msgpack() {
        let manifest = ScriptManifest {
            api_version: API_VERSION,
            metadata: ScriptMetadata::new("Foo", "Bar", 3).with_territories([1, 2]),
        };
        let bytes = rmp_serde::to_vec_named(&manifest).unwrap();
        let decoded: ScriptManifest = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded.metadata, manifest.metadata);
    }
}
