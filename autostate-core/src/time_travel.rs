//! Time travel over the global history: freeze the live machine, walk
//! recorded snapshots without firing handlers or observers, restore.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::error::FsmError;
use crate::history::TransitionRecord;
use crate::machine::{Machine, MachineInner};
use crate::types::{Context, Timestamp};

/// Live `(state, context)` snapshot captured on first entry into
/// time-travel mode, plus the history cursor.
pub(crate) struct TimeTravelFrame {
    saved_state: Option<String>,
    saved_context: Option<Context>,
    cursor: usize,
}

/// Walker over the machine's history. Obtained from
/// [`Machine::time_travel`].
pub struct TimeTravel {
    inner: Arc<MachineInner>,
}

impl TimeTravel {
    /// Jump to the history entry at `index` (0 = newest). On first entry
    /// the live state and its context are snapshotted; the jump itself
    /// runs no handlers, no observers, and records nothing. Returns the
    /// entry, or `None` when the index is out of range.
    pub fn travel_to(&self, index: usize) -> Result<Option<TransitionRecord>, FsmError> {
        let history = self
            .inner
            .history
            .clone()
            .ok_or(FsmError::HistoryDisabled)?;
        let Some(entry) = history.get(index) else {
            return Ok(None);
        };
        let target = self
            .inner
            .state(&entry.to)
            .ok_or_else(|| FsmError::UnknownState(entry.to.clone()))?;

        {
            let mut frame = self.inner.time_travel.lock().unwrap();
            if frame.is_none() {
                let live = self.inner.current_state();
                *frame = Some(TimeTravelFrame {
                    saved_state: live.as_ref().map(|s| s.name().to_string()),
                    saved_context: live.as_ref().map(|s| s.get_context()),
                    cursor: index,
                });
            } else if let Some(frame) = frame.as_mut() {
                frame.cursor = index;
            }
        }
        // Flag up before touching the pointer so deferred callbacks stay
        // suppressed from here on.
        self.inner.in_time_travel.store(true, Ordering::SeqCst);

        if let Some(ctx) = &entry.context {
            target.context_manager().replace(ctx.clone());
        }
        self.inner.set_current(Some(target));
        Ok(Some(entry))
    }

    /// Step to the next-older entry. Outside time-travel mode this enters
    /// at the newest entry. Returns `None` at the old end.
    pub fn previous(&self) -> Result<Option<TransitionRecord>, FsmError> {
        let history = self
            .inner
            .history
            .clone()
            .ok_or(FsmError::HistoryDisabled)?;
        let cursor = {
            let frame = self.inner.time_travel.lock().unwrap();
            frame.as_ref().map(|f| f.cursor)
        };
        match cursor {
            None => self.travel_to(0),
            Some(cursor) if cursor + 1 < history.len() => self.travel_to(cursor + 1),
            Some(_) => Ok(None),
        }
    }

    /// Step to the next-newer entry. Returns `None` at the new end or
    /// outside time-travel mode.
    pub fn next(&self) -> Result<Option<TransitionRecord>, FsmError> {
        let cursor = {
            let frame = self.inner.time_travel.lock().unwrap();
            frame.as_ref().map(|f| f.cursor)
        };
        match cursor {
            Some(cursor) if cursor > 0 => self.travel_to(cursor - 1),
            _ => Ok(None),
        }
    }

    /// Restore the snapshot taken on first entry and leave time-travel
    /// mode. A no-op when not traveling.
    pub fn return_to_current(&self) {
        let frame = self.inner.time_travel.lock().unwrap().take();
        let Some(frame) = frame else {
            return;
        };
        let live = frame
            .saved_state
            .as_deref()
            .and_then(|name| self.inner.state(name));
        if let (Some(state), Some(ctx)) = (&live, frame.saved_context) {
            state.context_manager().replace(ctx);
        }
        self.inner.set_current(live);
        self.inner.in_time_travel.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.inner.in_time_travel.load(Ordering::SeqCst)
    }
}

// ─── Context diff ─────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ValueChange {
    pub from: Value,
    pub to: Value,
}

/// Top-level-key diff between two contexts, stamped with the timestamps
/// of the entries they came from.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextDiff {
    pub added: BTreeMap<String, Value>,
    pub removed: BTreeMap<String, Value>,
    pub changed: BTreeMap<String, ValueChange>,
    pub from_timestamp: Timestamp,
    pub to_timestamp: Timestamp,
}

/// Diff over top-level keys. Non-object contexts diff as empty maps.
pub fn context_diff(
    old: &Context,
    new: &Context,
    from_timestamp: Timestamp,
    to_timestamp: Timestamp,
) -> ContextDiff {
    let empty = serde_json::Map::new();
    let old_map = old.as_object().unwrap_or(&empty);
    let new_map = new.as_object().unwrap_or(&empty);

    let mut added = BTreeMap::new();
    let mut removed = BTreeMap::new();
    let mut changed = BTreeMap::new();

    for (key, value) in new_map {
        match old_map.get(key) {
            None => {
                added.insert(key.clone(), value.clone());
            }
            Some(old_value) if old_value != value => {
                changed.insert(
                    key.clone(),
                    ValueChange {
                        from: old_value.clone(),
                        to: value.clone(),
                    },
                );
            }
            Some(_) => {}
        }
    }
    for (key, value) in old_map {
        if !new_map.contains_key(key) {
            removed.insert(key.clone(), value.clone());
        }
    }

    ContextDiff {
        added,
        removed,
        changed,
        from_timestamp,
        to_timestamp,
    }
}

// ─── Machine surface ──────────────────────────────────────────

impl Machine {
    pub fn time_travel(&self) -> TimeTravel {
        TimeTravel {
            inner: self.inner.clone(),
        }
    }

    pub fn travel_to_history_index(
        &self,
        index: usize,
    ) -> Result<Option<TransitionRecord>, FsmError> {
        self.time_travel().travel_to(index)
    }

    pub fn previous_history_state(&self) -> Result<Option<TransitionRecord>, FsmError> {
        self.time_travel().previous()
    }

    pub fn next_history_state(&self) -> Result<Option<TransitionRecord>, FsmError> {
        self.time_travel().next()
    }

    pub fn return_to_current_state(&self) {
        self.time_travel().return_to_current()
    }

    pub fn is_in_time_travel_mode(&self) -> bool {
        self.time_travel().is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use crate::types::{condition, AutoTransition, MachineConfig};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn walked_machine() -> (Machine, Arc<ManualScheduler>) {
        let sched = ManualScheduler::new();
        let machine = Machine::with_scheduler(
            MachineConfig {
                initial_state: Some("idle".into()),
                enable_history: true,
                ..Default::default()
            },
            sched.clone(),
        );
        machine.add_transition("idle", "active", None);
        machine.add_transition("active", "done", None);
        (machine, sched)
    }

    #[tokio::test]
    async fn travel_freezes_walks_and_restores() {
        let (machine, _) = walked_machine();
        machine.start().await.unwrap();
        machine
            .transition_with("active", json!({"step": 1}))
            .await
            .unwrap();
        machine
            .transition_with("done", json!({"step": 2}))
            .await
            .unwrap();

        // Entries newest-first: done, active, idle.
        let entry = machine.travel_to_history_index(1).unwrap().unwrap();
        assert_eq!(entry.to, "active");
        assert!(machine.is_in_time_travel_mode());
        assert_eq!(machine.current_state_name().as_deref(), Some("active"));
        assert_eq!(machine.get_context().unwrap(), json!({"step": 1}));

        // previous = older, next = newer.
        let older = machine.previous_history_state().unwrap().unwrap();
        assert_eq!(older.to, "idle");
        assert!(machine.previous_history_state().unwrap().is_none());
        let newer = machine.next_history_state().unwrap().unwrap();
        assert_eq!(newer.to, "active");

        machine.return_to_current_state();
        assert!(!machine.is_in_time_travel_mode());
        assert_eq!(machine.current_state_name().as_deref(), Some("done"));
        assert_eq!(machine.get_context().unwrap(), json!({"step": 2}));
    }

    #[tokio::test]
    async fn auto_evaluation_is_suppressed_while_traveling() {
        let (machine, _) = walked_machine();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        machine.add_transition(
            "active",
            "done",
            Some(AutoTransition::new(
                "done",
                condition(move |ctx| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    ctx["go"] == json!(true)
                }),
            )),
        );

        machine.start().await.unwrap();
        machine.transition("active").await.unwrap();
        let evaluated = calls.load(Ordering::SeqCst);

        machine.travel_to_history_index(0).unwrap().unwrap();
        // Context mutation while frozen: no evaluation, no transition.
        machine.update_context(json!({"go": true})).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), evaluated);

        // Manual transitions are refused too.
        assert!(!machine.transition("done").await.unwrap());
        assert!(!machine.can("done"));

        machine.return_to_current_state();
        assert_eq!(machine.current_state_name().as_deref(), Some("active"));
    }

    #[tokio::test]
    async fn travel_without_history_errors() {
        let sched = ManualScheduler::new();
        let machine = Machine::with_scheduler(MachineConfig::default(), sched);
        assert!(matches!(
            machine.travel_to_history_index(0),
            Err(FsmError::HistoryDisabled)
        ));
    }

    #[tokio::test]
    async fn out_of_range_index_is_none() {
        let (machine, _) = walked_machine();
        machine.start().await.unwrap();
        assert!(machine.travel_to_history_index(5).unwrap().is_none());
        assert!(!machine.is_in_time_travel_mode());
    }

    #[test]
    fn diff_over_top_level_keys() {
        let old = json!({"a": 1, "b": "x", "gone": true});
        let new = json!({"a": 1, "b": "y", "fresh": [1]});
        let diff = context_diff(&old, &new, 100, 200);

        assert_eq!(diff.added, BTreeMap::from([("fresh".into(), json!([1]))]));
        assert_eq!(diff.removed, BTreeMap::from([("gone".into(), json!(true))]));
        assert_eq!(
            diff.changed,
            BTreeMap::from([(
                "b".into(),
                ValueChange {
                    from: json!("x"),
                    to: json!("y")
                }
            )])
        );
        assert_eq!(diff.from_timestamp, 100);
        assert_eq!(diff.to_timestamp, 200);
    }
}
