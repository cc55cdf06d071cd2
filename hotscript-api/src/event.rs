//! Host-originated events broadcast to scripts
//!
//! Payloads are kept deliberately thin: identifiers and raw parameters as the
//! host reports them. Scripts interpret them; the runtime only routes them.

use serde::{Deserialize, Serialize};

/// Lifecycle category of a director (encounter) update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectorUpdateCategory {
    /// Encounter started
    Commence,
    /// Encounter restarted after a wipe
    Recommence,
    /// Party wiped
    Wipe,
    /// Encounter completed
    Complete,
    /// Music or barrier change, not a lifecycle transition
    Other(u32),
}

impl DirectorUpdateCategory {
    /// Whether scripts must be reset before seeing this update
    pub fn is_lifecycle_reset(&self) -> bool {
        matches!(self, Self::Commence | Self::Recommence | Self::Wipe)
    }
}

/// Status effect as reported by buff notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEffect {
    pub status_id: u32,
    pub param: u16,
    pub remaining_time: f32,
    pub source_id: u32,
}

/// Aggregated action effect (one action hitting several targets)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEffectSet {
    pub action_id: u32,
    pub source_id: u32,
    pub target_ids: Vec<u64>,
}

/// Raw actor control packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorControl {
    pub source_id: u32,
    pub command: u32,
    pub params: [u32; 6],
    pub target_id: u64,
    pub replaying: bool,
}

/// Every event kind the host can broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum HostEvent {
    /// Periodic tick
    Update,
    CombatStart,
    CombatEnd,
    /// Explicit reset request from the host
    Reset,
    MapEffect {
        position: u32,
        param1: u16,
        param2: u16,
    },
    ObjectEffect {
        target: u32,
        param1: u16,
        param2: u16,
    },
    StartingCast {
        source: u32,
        cast_id: u32,
    },
    Message {
        text: String,
    },
    VfxSpawn {
        target: u32,
        path: String,
    },
    TetherCreate {
        source: u32,
        target: u32,
        data2: u32,
        data3: u32,
        data5: u32,
    },
    TetherRemoval {
        source: u32,
        data2: u32,
        data3: u32,
        data5: u32,
    },
    DirectorUpdate {
        category: DirectorUpdateCategory,
    },
    PhaseChange {
        phase: i32,
    },
    ObjectCreation {
        object_id: u64,
    },
    ActionEffect {
        action_id: u32,
        animation_id: u16,
        effect_type: u8,
        source_id: u32,
        target_id: u64,
        damage: u32,
    },
    ActorControl(ActorControl),
    ActionEffectEvent(ActionEffectSet),
    GainBuffEffect {
        source_id: u32,
        status: StatusEffect,
    },
    RemoveBuffEffect {
        source_id: u32,
        status: StatusEffect,
    },
    UpdateBuffEffect {
        source_id: u32,
        status: StatusEffect,
    },
}

impl HostEvent {
    /// Name of the script hook this event is routed to, used in logs and reports
    pub fn hook_name(&self) -> &'static str {
        match self {
            Self::Update => "on_update",
            Self::CombatStart => "on_combat_start",
            Self::CombatEnd => "on_combat_end",
            Self::Reset => "on_reset",
            Self::MapEffect { .. } => "on_map_effect",
            Self::ObjectEffect { .. } => "on_object_effect",
            Self::StartingCast { .. } => "on_starting_cast",
            Self::Message { .. } => "on_message",
            Self::VfxSpawn { .. } => "on_vfx_spawn",
            Self::TetherCreate { .. } => "on_tether_create",
            Self::TetherRemoval { .. } => "on_tether_removal",
            Self::DirectorUpdate { .. } => "on_director_update",
            Self::PhaseChange { .. } => "on_phase_change",
            Self::ObjectCreation { .. } => "on_object_creation",
            Self::ActionEffect { .. } => "on_action_effect",
            Self::ActorControl(_) => "on_actor_control",
            Self::ActionEffectEvent(_) => "on_action_effect_event",
            Self::GainBuffEffect { .. } => "on_gain_buff_effect",
            Self::RemoveBuffEffect { .. } => "on_remove_buff_effect",
            Self::UpdateBuffEffect { .. } => "on_update_buff_effect",
        }
    }

    /// Events that put every receiving script back to a clean state before its hook runs
    pub fn resets_before_hook(&self) -> bool {
        match self {
            Self::CombatStart | Self::CombatEnd => true,
            Self::DirectorUpdate { category } => category.is_lifecycle_reset(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_director_updates_reset() {
        for category in [
            DirectorUpdateCategory::Commence,
            DirectorUpdateCategory::Recommence,
            DirectorUpdateCategory::Wipe,
        ] {
            assert!(HostEvent::DirectorUpdate { category }.resets_before_hook());
        }
        assert!(!HostEvent::DirectorUpdate {
            category: DirectorUpdateCategory::Complete
        }
        .resets_before_hook());
        assert!(!HostEvent::DirectorUpdate {
            category: DirectorUpdateCategory::Other(0x4000_0001)
        }
        .resets_before_hook());
    }

    #[test]
    fn test_combat_boundaries_reset() {
        assert!(HostEvent::CombatStart.resets_before_hook());
        assert!(HostEvent::CombatEnd.resets_before_hook());
        assert!(!HostEvent::Update.resets_before_hook());
        assert!(!HostEvent::Reset.resets_before_hook());
    }

    #[test]
    fn test_hook_names_are_distinct() {
        let starting = HostEvent::StartingCast {
            source: 1,
            cast_id: 2,
        };
        let object = HostEvent::ObjectEffect {
            target: 1,
            param1: 0,
            param2: 0,
        };
        assert_ne!(starting.hook_name(), object.hook_name());

        let status = StatusEffect {
            status_id: 1,
            param: 0,
            remaining_time: 5.0,
            source_id: 3,
        };
        let update = HostEvent::UpdateBuffEffect {
            source_id: 3,
            status: status.clone(),
        };
        let remove = HostEvent::RemoveBuffEffect {
            source_id: 3,
            status,
        };
        assert_eq!(update.hook_name(), "on_update_buff_effect");
        assert_eq!(remove.hook_name(), "on_remove_buff_effect");
    }

    #[test]
    fn test_msgpack_encoding() {
        let event = HostEvent::TetherCreate {
            source: 10,
            target: 11,
            data2: 1,
            data3: 2,
            data5: 3,
        };
        let bytes = rmp_serde::to_vec_named(&event).unwrap();
        let decoded: HostEvent = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, event);
    }
}
