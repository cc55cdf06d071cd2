//! Enable/disable state machine
//!
//! A script runs iff the gate allows it, it is not blacklisted, the current
//! territory matches its declaration and the user has not disabled it.

use crate::instance::ScriptInstance;
use crate::registry::ScriptRegistry;
use std::collections::BTreeSet;

/// Where the host currently is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GameContext {
    pub territory: u32,
    pub logged_in: bool,
}

impl GameContext {
    pub fn new(territory: u32, logged_in: bool) -> Self {
        Self {
            territory,
            logged_in,
        }
    }
}

/// Transition applied by [`update_state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Enabled,
    Disabled,
}

/// `None` applies everywhere; a declared set needs an active session and,
/// when non-empty, the current territory in it
pub fn territory_ok(valid_territories: Option<&BTreeSet<u32>>, context: &GameContext) -> bool {
    match valid_territories {
        None => true,
        Some(set) => context.logged_in && (set.is_empty() || set.contains(&context.territory)),
    }
}

pub fn should_enable(
    instance: &ScriptInstance,
    context: &GameContext,
    disabled: &BTreeSet<String>,
) -> bool {
    let internal = instance.internal();
    internal.allowed
        && !internal.blacklisted
        && territory_ok(instance.metadata().valid_territories.as_ref(), context)
        && !disabled.contains(instance.full_name())
}

/// Bring one instance in line with [`should_enable`]
pub fn update_state(
    instance: &ScriptInstance,
    context: &GameContext,
    disabled: &BTreeSet<String>,
) -> Option<Transition> {
    match (should_enable(instance, context, disabled), instance.is_enabled()) {
        (true, false) => instance.enable().then_some(Transition::Enabled),
        (false, true) => instance.disable().then_some(Transition::Disabled),
        _ => None,
    }
}

/// Re-evaluate every registered script. Returns the number of transitions.
pub fn update_all(
    registry: &ScriptRegistry,
    context: &GameContext,
    disabled: &BTreeSet<String>,
) -> usize {
    registry.assert_main("update_state");
    registry
        .snapshot()
        .iter()
        .filter(|instance| update_state(instance, context, disabled).is_some())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InternalData;
    use hotscript_api::{Script, ScriptMetadata};

    struct Plain(ScriptMetadata);

    impl Script for Plain {
        fn metadata(&self) -> &ScriptMetadata {
            &self.0
        }
    }

    fn instance(metadata: ScriptMetadata, allowed: bool) -> ScriptInstance {
        let mut internal = InternalData::new(metadata.full_name(), None);
        internal.allowed = allowed;
        ScriptInstance::new(Box::new(Plain(metadata)), internal)
    }

    #[test]
    fn test_territory_rules() {
        let out = GameContext::new(100, false);
        let home = GameContext::new(100, true);
        let away = GameContext::new(200, true);
        let set: BTreeSet<u32> = [100].into_iter().collect();
        let empty = BTreeSet::new();

        assert!(territory_ok(None, &out));
        assert!(!territory_ok(Some(&set), &out));
        assert!(territory_ok(Some(&set), &home));
        assert!(!territory_ok(Some(&set), &away));
        assert!(!territory_ok(Some(&empty), &out));
        assert!(territory_ok(Some(&empty), &away));
    }

    #[test]
    fn test_not_allowed_until_gate_completes() {
        let script = instance(ScriptMetadata::new("Foo", "Bar", 1), false);
        let ctx = GameContext::default();
        assert_eq!(update_state(&script, &ctx, &BTreeSet::new()), None);

        script.with_internal(|d| d.allowed = true);
        assert_eq!(
            update_state(&script, &ctx, &BTreeSet::new()),
            Some(Transition::Enabled)
        );
    }

    #[test]
    fn test_blacklisted_and_user_disabled() {
        let script = instance(ScriptMetadata::new("Foo", "Bar", 1), true);
        let ctx = GameContext::default();
        update_state(&script, &ctx, &BTreeSet::new());
        assert!(script.is_enabled());

        let disabled: BTreeSet<String> = ["Foo.Bar".to_string()].into_iter().collect();
        assert_eq!(
            update_state(&script, &ctx, &disabled),
            Some(Transition::Disabled)
        );

        script.with_internal(|d| d.blacklisted = true);
        assert!(!should_enable(&script, &ctx, &BTreeSet::new()));
    }

    #[test]
    fn test_territory_change_toggles() {
        let script = instance(
            ScriptMetadata::new("Foo", "Bar", 1).with_territories([777]),
            true,
        );
        let none = BTreeSet::new();
        assert_eq!(update_state(&script, &GameContext::new(777, false), &none), None);
        assert_eq!(
            update_state(&script, &GameContext::new(777, true), &none),
            Some(Transition::Enabled)
        );
        assert_eq!(
            update_state(&script, &GameContext::new(1, true), &none),
            Some(Transition::Disabled)
        );
    }
}
