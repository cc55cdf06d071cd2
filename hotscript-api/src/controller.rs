//! Per-script transient runtime state
//!
//! Each script instance owns one [`Controller`]. It holds the auto-reset
//! deadline and the scheduled sub-tasks the script armed. The host cancels
//! both when the script is reset.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Identifier of a scheduled sub-task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

#[derive(Debug, Clone)]
struct ScheduledTask {
    label: String,
    fire_at: Instant,
}

/// Auto-reset deadline and scheduled sub-tasks of one script
#[derive(Debug, Default)]
pub struct Controller {
    auto_reset_at: Option<Instant>,
    tasks: BTreeMap<TaskId, ScheduledTask>,
    next_id: u64,
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a one-shot sub-task firing at `fire_at`
    pub fn schedule(&mut self, label: impl Into<String>, fire_at: Instant) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.tasks.insert(
            id,
            ScheduledTask {
                label: label.into(),
                fire_at,
            },
        );
        id
    }

    /// Cancel a single sub-task
    pub fn cancel(&mut self, id: TaskId) -> bool {
        self.tasks.remove(&id).is_some()
    }

    /// Cancel every scheduled sub-task, returning how many were dropped
    pub fn cancel_schedulers(&mut self) -> usize {
        let count = self.tasks.len();
        self.tasks.clear();
        count
    }

    /// Remove and return the sub-tasks due at `now`, earliest first
    pub fn take_due(&mut self, now: Instant) -> Vec<(TaskId, String)> {
        let mut due: Vec<(Instant, TaskId)> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.fire_at <= now)
            .map(|(id, task)| (task.fire_at, *id))
            .collect();
        due.sort();

        due.into_iter()
            .filter_map(|(_, id)| self.tasks.remove(&id).map(|task| (id, task.label)))
            .collect()
    }

    /// Number of sub-tasks still pending
    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Arm (or move) the auto-reset deadline
    pub fn arm_auto_reset(&mut self, at: Instant) {
        self.auto_reset_at = Some(at);
    }

    /// Back to "unset", i.e. never resets on its own
    pub fn clear_auto_reset(&mut self) {
        self.auto_reset_at = None;
    }

    pub fn auto_reset_at(&self) -> Option<Instant> {
        self.auto_reset_at
    }

    /// True once the armed deadline has passed
    pub fn auto_reset_due(&self, now: Instant) -> bool {
        self.auto_reset_at.is_some_and(|at| now >= at)
    }
}

/// View handed to script hooks while they run
///
/// Gives access to the script's own controller and the dispatch timestamp,
/// so hooks can arm deadlines relative to the event that triggered them.
pub struct ScriptContext<'a> {
    full_name: &'a str,
    now: Instant,
    controller: &'a mut Controller,
}

impl<'a> ScriptContext<'a> {
    pub fn new(full_name: &'a str, now: Instant, controller: &'a mut Controller) -> Self {
        Self {
            full_name,
            now,
            controller,
        }
    }

    /// Full name (`namespace.name`) of the running script
    pub fn full_name(&self) -> &str {
        self.full_name
    }

    /// Timestamp of the event being dispatched
    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn controller(&mut self) -> &mut Controller {
        self.controller
    }

    /// Reset this script automatically once `delay` has elapsed
    pub fn schedule_reset_in(&mut self, delay: Duration) {
        self.controller.arm_auto_reset(self.now + delay);
    }

    /// Schedule a sub-task delivered to `on_scheduled` after `delay`
    pub fn schedule(&mut self, label: impl Into<String>, delay: Duration) -> TaskId {
        self.controller.schedule(label, self.now + delay)
    }

    pub fn cancel(&mut self, id: TaskId) -> bool {
        self.controller.cancel(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_due_orders_by_fire_time() {
        let start = Instant::now();
        let mut controller = Controller::new();
        controller.schedule("late", start + Duration::from_millis(20));
        controller.schedule("early", start + Duration::from_millis(10));
        controller.schedule("future", start + Duration::from_secs(60));

        let due = controller.take_due(start + Duration::from_millis(30));
        let labels: Vec<_> = due.iter().map(|(_, label)| label.as_str()).collect();
        assert_eq!(labels, vec!["early", "late"]);
        assert_eq!(controller.pending_tasks(), 1);
    }

    #[test]
    fn test_cancel_schedulers() {
        let start = Instant::now();
        let mut controller = Controller::new();
        let id = controller.schedule("a", start);
        controller.schedule("b", start);

        assert!(controller.cancel(id));
        assert!(!controller.cancel(id));
        assert_eq!(controller.cancel_schedulers(), 1);
        assert!(controller.take_due(start).is_empty());
    }

    #[test]
    fn test_auto_reset_deadline() {
        let start = Instant::now();
        let mut controller = Controller::new();
        assert!(!controller.auto_reset_due(start + Duration::from_secs(3600)));

        controller.arm_auto_reset(start + Duration::from_secs(5));
        assert!(!controller.auto_reset_due(start));
        assert!(controller.auto_reset_due(start + Duration::from_secs(5)));

        controller.clear_auto_reset();
        assert_eq!(controller.auto_reset_at(), None);
    }

    #[test]
    fn test_context_schedules_relative_to_event_time() {
        let now = Instant::now();
        let mut controller = Controller::new();
        {
            let mut ctx = ScriptContext::new("Foo.Bar", now, &mut controller);
            ctx.schedule_reset_in(Duration::from_secs(2));
            ctx.schedule("tick", Duration::from_millis(500));
            assert_eq!(ctx.full_name(), "Foo.Bar");
        }
        assert_eq!(controller.auto_reset_at(), Some(now + Duration::from_secs(2)));
        assert_eq!(controller.take_due(now + Duration::from_millis(500)).len(), 1);
    }
}
