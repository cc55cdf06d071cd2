//! Event dispatch
//!
//! Broadcasts a [`HostEvent`] to every enabled script in registry order. Each
//! hook call is isolated: a failing script is logged and reported, and the
//! remaining scripts still receive the event.

use crate::instance::{HookOutcome, ScriptInstance};
use crate::registry::ScriptRegistry;
use hotscript_api::HostEvent;
use std::time::Instant;

/// One failed hook call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFailure {
    pub script: String,
    pub hook: &'static str,
    pub reason: String,
}

/// What happened while dispatching one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// Hook the event routes to
    pub hook: &'static str,
    /// Enabled scripts the event was delivered to
    pub delivered: usize,
    /// Scripts reset as part of this dispatch
    pub resets: usize,
    pub failures: Vec<HookFailure>,
}

impl DispatchReport {
    fn new(hook: &'static str) -> Self {
        Self {
            hook,
            delivered: 0,
            resets: 0,
            failures: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, instance: &ScriptInstance, hook: &'static str, outcome: HookOutcome) {
        if let HookOutcome::Failed(reason) = outcome {
            self.failures.push(HookFailure {
                script: instance.full_name().to_string(),
                hook,
                reason,
            });
        }
    }

    fn reset(&mut self, instance: &ScriptInstance, now: Instant) {
        let outcome = instance.reset(now);
        self.resets += 1;
        self.record(instance, "on_reset", outcome);
    }
}

/// Deliver `event` to every enabled script
///
/// Ticks first fire due scheduled sub-tasks, then `on_update`, then reset the
/// script if its auto-reset deadline has passed. Combat boundaries and
/// encounter lifecycle updates reset the script before its hook runs.
pub fn dispatch(registry: &ScriptRegistry, event: &HostEvent, now: Instant) -> DispatchReport {
    registry.assert_main("dispatch");

    let hook = event.hook_name();
    let mut report = DispatchReport::new(hook);

    for instance in registry.snapshot().iter() {
        if !instance.is_enabled() {
            continue;
        }
        report.delivered += 1;

        match event {
            HostEvent::Reset => report.reset(instance, now),
            HostEvent::Update => {
                for (_, label) in instance.take_due_tasks(now) {
                    let outcome = instance.call_hook("on_scheduled", now, |script, ctx| {
                        script.on_scheduled(ctx, &label)
                    });
                    report.record(instance, "on_scheduled", outcome);
                }

                let outcome =
                    instance.call_hook(hook, now, |script, ctx| script.handle_event(ctx, event));
                report.record(instance, hook, outcome);

                if instance.auto_reset_due(now) {
                    report.reset(instance, now);
                }
            }
            _ => {
                if event.resets_before_hook() {
                    report.reset(instance, now);
                }
                let outcome =
                    instance.call_hook(hook, now, |script, ctx| script.handle_event(ctx, event));
                report.record(instance, hook, outcome);
            }
        }
    }

    if !report.is_clean() {
        tracing::debug!(
            hook,
            delivered = report.delivered,
            failures = report.failures.len(),
            "Dispatch finished with failures"
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InternalData;
    use crate::main_context::MainContext;
    use crate::summary::NullStatusSink;
    use hotscript_api::{
        DirectorUpdateCategory, HookResult, Script, ScriptContext, ScriptMetadata,
    };
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tracing_test::traced_test;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Probe {
        metadata: ScriptMetadata,
        journal: Journal,
        fail_update: bool,
        arm_on_combat: Option<Duration>,
    }

    impl Probe {
        fn log(&self, entry: &str) {
            self.journal
                .lock()
                .unwrap()
                .push(format!("{} {entry}", self.metadata.name));
        }
    }

    impl Script for Probe {
        fn metadata(&self) -> &ScriptMetadata {
            &self.metadata
        }

        fn on_reset(&mut self) -> HookResult {
            self.log("reset");
            Ok(())
        }

        fn on_update(&mut self, _ctx: &mut ScriptContext<'_>) -> HookResult {
            self.log("update");
            if self.fail_update {
                anyhow::bail!("update failed");
            }
            Ok(())
        }

        fn on_combat_start(&mut self, ctx: &mut ScriptContext<'_>) -> HookResult {
            self.log("combat_start");
            if let Some(delay) = self.arm_on_combat {
                ctx.schedule_reset_in(delay);
                ctx.schedule("pulse", delay / 2);
            }
            Ok(())
        }

        fn on_scheduled(&mut self, _ctx: &mut ScriptContext<'_>, label: &str) -> HookResult {
            self.log(&format!("scheduled {label}"));
            Ok(())
        }

        fn on_director_update(
            &mut self,
            _ctx: &mut ScriptContext<'_>,
            category: DirectorUpdateCategory,
        ) -> HookResult {
            self.log(&format!("director {category:?}"));
            Ok(())
        }
    }

    struct Fixture {
        _main: MainContext,
        registry: ScriptRegistry,
        journal: Journal,
    }

    impl Fixture {
        fn new() -> Self {
            let main = MainContext::new();
            let registry = ScriptRegistry::new(main.handle(), Arc::new(NullStatusSink));
            Self {
                _main: main,
                registry,
                journal: Arc::default(),
            }
        }

        fn add(&self, name: &str, fail_update: bool, arm_on_combat: Option<Duration>) -> Arc<ScriptInstance> {
            let metadata = ScriptMetadata::new("Test", name, 1);
            let probe = Probe {
                metadata: metadata.clone(),
                journal: self.journal.clone(),
                fail_update,
                arm_on_combat,
            };
            let instance = Arc::new(ScriptInstance::new(
                Box::new(probe),
                InternalData::new(metadata.full_name(), None),
            ));
            instance.enable();
            self.registry.add(instance.clone());
            instance
        }

        fn journal(&self) -> Vec<String> {
            self.journal.lock().unwrap().clone()
        }
    }

    #[traced_test]
    #[test]
    fn test_failing_script_does_not_block_others() {
        let fixture = Fixture::new();
        fixture.add("First", true, None);
        fixture.add("Second", false, None);

        let report = dispatch(&fixture.registry, &HostEvent::Update, Instant::now());

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].script, "Test.First");
        assert_eq!(report.failures[0].hook, "on_update");
        assert_eq!(fixture.journal(), vec!["First update", "Second update"]);

        logs_assert(|lines: &[&str]| {
            let errors: Vec<_> = lines.iter().filter(|line| line.contains("ERROR")).collect();
            match errors.len() {
                1 if errors[0].contains("Test.First") => Ok(()),
                n => Err(format!("expected exactly one error for Test.First, got {n}")),
            }
        });
    }

    #[test]
    fn test_disabled_scripts_are_skipped() {
        let fixture = Fixture::new();
        let off = fixture.add("Off", false, None);
        fixture.add("On", false, None);
        off.disable();

        let report = dispatch(&fixture.registry, &HostEvent::Update, Instant::now());
        assert_eq!(report.delivered, 1);
        assert_eq!(fixture.journal(), vec!["On update"]);
    }

    #[test]
    fn test_combat_start_resets_before_hook() {
        let fixture = Fixture::new();
        fixture.add("A", false, None);

        let report = dispatch(&fixture.registry, &HostEvent::CombatStart, Instant::now());
        assert_eq!(report.resets, 1);
        assert_eq!(fixture.journal(), vec!["A reset", "A combat_start"]);
    }

    #[test]
    fn test_director_lifecycle_resets() {
        let fixture = Fixture::new();
        fixture.add("A", false, None);

        dispatch(
            &fixture.registry,
            &HostEvent::DirectorUpdate {
                category: DirectorUpdateCategory::Wipe,
            },
            Instant::now(),
        );
        dispatch(
            &fixture.registry,
            &HostEvent::DirectorUpdate {
                category: DirectorUpdateCategory::Complete,
            },
            Instant::now(),
        );

        assert_eq!(
            fixture.journal(),
            vec!["A reset", "A director Wipe", "A director Complete"]
        );
    }

    #[test]
    fn test_deadline_expiry_resets_on_tick() {
        let fixture = Fixture::new();
        let instance = fixture.add("A", false, Some(Duration::from_secs(10)));
        let start = Instant::now();

        dispatch(&fixture.registry, &HostEvent::CombatStart, start);
        assert_eq!(instance.auto_reset_at(), Some(start + Duration::from_secs(10)));

        // Sub-task fires at +5s, no reset yet
        let report = dispatch(&fixture.registry, &HostEvent::Update, start + Duration::from_secs(5));
        assert_eq!(report.resets, 0);

        let report = dispatch(&fixture.registry, &HostEvent::Update, start + Duration::from_secs(11));
        assert_eq!(report.resets, 1);
        assert_eq!(instance.auto_reset_at(), None);

        assert_eq!(
            fixture.journal(),
            vec![
                "A reset",
                "A combat_start",
                "A scheduled pulse",
                "A update",
                "A update",
                "A reset",
            ]
        );
    }

    #[test]
    fn test_explicit_reset_and_combat_end_clear_deadline() {
        let fixture = Fixture::new();
        let instance = fixture.add("A", false, Some(Duration::from_secs(10)));
        let start = Instant::now();

        dispatch(&fixture.registry, &HostEvent::CombatStart, start);
        assert_eq!(instance.pending_tasks(), 1);
        let report = dispatch(&fixture.registry, &HostEvent::Reset, start);
        assert_eq!(report.resets, 1);
        assert_eq!(instance.auto_reset_at(), None);
        assert_eq!(instance.pending_tasks(), 0);

        dispatch(&fixture.registry, &HostEvent::CombatStart, start);
        dispatch(&fixture.registry, &HostEvent::CombatEnd, start);
        assert_eq!(instance.auto_reset_at(), None);
    }
}
