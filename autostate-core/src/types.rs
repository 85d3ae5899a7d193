use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch (or virtual-clock) milliseconds.
pub type Timestamp = u64;

/// Per-state context. By convention a JSON object; the engine treats it as
/// a property map for merging and path resolution but never interprets the
/// values themselves.
pub type Context = Value;

/// Type-erased future used by every async callback seam.
pub type BoxFut<T> = BoxFuture<'static, T>;

// ─── Callback seams ───────────────────────────────────────────

/// Auto-transition predicate. Arguments are the source state's name and a
/// snapshot of its context. `Ok(true)` fires the transition, `Ok(false)`
/// does not, and `Err` is treated as a thrown condition: logged and, under
/// a retry policy, counted as a failed attempt.
pub type Condition = Arc<dyn Fn(&str, &Context) -> BoxFut<Result<bool>> + Send + Sync>;

/// Pre-filter applied before a condition is even considered. Truthy output
/// drops the transition for this pass and cancels its debounce timer.
pub type SkipPredicate = Arc<dyn Fn(&Context) -> bool + Send + Sync>;

/// Enter/exit/generic lifecycle handler. Errors are logged and swallowed.
pub type Handler = Arc<dyn Fn(HandlerArgs) -> BoxFut<Result<()>> + Send + Sync>;

/// Context equality override for the shallow-equality gate.
pub type EqualityFn = Arc<dyn Fn(&Context, &Context) -> bool + Send + Sync>;

/// Maps a recorded context to what the history should actually store.
pub type ContextFilter = Arc<dyn Fn(&Context) -> Context + Send + Sync>;

/// Context-change subscriber: `(previous, next)`. Errors are logged and do
/// not stop the remaining listeners.
pub type ContextListener = Arc<dyn Fn(&Context, &Context) -> Result<()> + Send + Sync>;

/// Metrics callback invoked by the context manager.
pub type MetricsSink = Arc<dyn Fn(MetricEvent) + Send + Sync>;

/// What happened, for the optional metrics sink.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricEvent {
    UpdateApplied,
    UpdateSkippedEqual,
    UpdateCoalesced,
    MemoHit(String),
    MemoMiss(String),
}

/// State names handed to lifecycle handlers.
#[derive(Clone, Debug)]
pub struct HandlerArgs {
    /// Source of the transition; `None` on initial entry.
    pub from: Option<String>,
    /// State being entered (for enter/generic handlers) or left for
    /// (for exit handlers).
    pub to: String,
}

/// Wrap a plain synchronous predicate over the context as a [`Condition`].
pub fn condition<F>(f: F) -> Condition
where
    F: Fn(&Context) -> bool + Send + Sync + 'static,
{
    Arc::new(move |_state, ctx| {
        let hit = f(ctx);
        Box::pin(async move { Ok(hit) })
    })
}

/// Wrap a fallible synchronous predicate (state name + context) as a
/// [`Condition`].
pub fn try_condition<F>(f: F) -> Condition
where
    F: Fn(&str, &Context) -> Result<bool> + Send + Sync + 'static,
{
    Arc::new(move |state, ctx| {
        let out = f(state, ctx);
        Box::pin(async move { out })
    })
}

/// Wrap a plain synchronous closure as a lifecycle [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&HandlerArgs) + Send + Sync + 'static,
{
    Arc::new(move |args| {
        f(&args);
        Box::pin(async move { Ok(()) })
    })
}

// ─── Retry policy ─────────────────────────────────────────────

/// Retry loop for a throwing condition. A falsy condition result stops the
/// loop immediately; only errors consume attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Wait between attempts, in milliseconds.
    #[serde(rename = "delay")]
    pub delay_ms: u64,
}

impl RetryPolicy {
    /// `max_attempts` is clamped to at least 1.
    pub fn new(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay_ms,
        }
    }
}

// ─── Evaluation policy ────────────────────────────────────────

/// When a candidate transition's condition runs within an evaluation pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EvalStrategy {
    /// Evaluate inline during the pass.
    #[default]
    Immediate,
    /// Defer to a zero-delay timer; the whole bucket runs in one callback.
    NextTick,
    /// Defer to the scheduler's idle facility, one callback per transition.
    Idle,
}

/// Per-transition evaluation gates.
#[derive(Clone, Default)]
pub struct EvalPolicy {
    /// Dotted/bracketed property paths; when non-empty, the transition is
    /// only (re-)considered if at least one path differs between the
    /// previous and the new context.
    pub watch: Vec<String>,
    /// Truthy result drops the transition before its condition runs.
    pub skip_if: Option<SkipPredicate>,
    pub strategy: EvalStrategy,
}

// ─── Auto-transition record ───────────────────────────────────

/// A conditional transition owned by a source state. Insertion order is
/// observable: it breaks priority ties and keys the per-transition
/// debounce/idle scheduling tables.
#[derive(Clone)]
pub struct AutoTransition {
    pub target: String,
    pub condition: Condition,
    /// Higher fires first. `None` falls back to the group default, then 0.
    pub priority: Option<i32>,
    /// Collapse window in milliseconds; `> 0` defers the condition to a
    /// cancel-and-replace timer regardless of strategy.
    pub debounce_ms: Option<u64>,
    pub retry: Option<RetryPolicy>,
    /// Group tag; a disabled group filters the transition out entirely.
    pub group: Option<String>,
    pub eval: EvalPolicy,
}

impl AutoTransition {
    pub fn new(target: impl Into<String>, condition: Condition) -> Self {
        Self {
            target: target.into(),
            condition,
            priority: None,
            debounce_ms: None,
            retry: None,
            group: None,
            eval: EvalPolicy::default(),
        }
    }

    /// Shorthand for a transition with a plain synchronous predicate.
    pub fn when<F>(target: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        Self::new(target, condition(f))
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn debounce(mut self, ms: u64) -> Self {
        self.debounce_ms = Some(ms);
        self
    }

    pub fn retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.retry = Some(RetryPolicy::new(max_attempts, delay_ms));
        self
    }

    pub fn group(mut self, name: impl Into<String>) -> Self {
        self.group = Some(name.into());
        self
    }

    pub fn watch<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.eval.watch.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn skip_if<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        self.eval.skip_if = Some(Arc::new(f));
        self
    }

    pub fn strategy(mut self, strategy: EvalStrategy) -> Self {
        self.eval.strategy = strategy;
        self
    }
}

impl std::fmt::Debug for AutoTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoTransition")
            .field("target", &self.target)
            .field("priority", &self.priority)
            .field("debounce_ms", &self.debounce_ms)
            .field("retry", &self.retry)
            .field("group", &self.group)
            .field("watch", &self.eval.watch)
            .field("strategy", &self.eval.strategy)
            .finish()
    }
}

// ─── Manager / machine config ─────────────────────────────────

/// Context-manager tuning.
#[derive(Clone, Default)]
pub struct StateManagerConfig {
    /// Coalesce updates into a window instead of applying each one.
    pub batch_updates: bool,
    pub batch_window_ms: u64,
    pub enable_memoization: bool,
    /// Equality gate; `None` means shallow equality over own keys.
    pub are_equal: Option<EqualityFn>,
    pub metrics: Option<MetricsSink>,
}

/// History ring tuning.
#[derive(Clone)]
pub struct HistoryOptions {
    pub max_size: usize,
    /// When false, recorded entries carry no context field at all.
    pub include_context: bool,
    /// Applied to the context at record time, and again at serialization
    /// time when requested.
    pub context_filter: Option<ContextFilter>,
}

impl Default for HistoryOptions {
    fn default() -> Self {
        Self {
            max_size: 100,
            include_context: true,
            context_filter: None,
        }
    }
}

/// Machine construction options.
#[derive(Clone, Default)]
pub struct MachineConfig {
    pub initial_state: Option<String>,
    pub enable_history: bool,
    pub history: HistoryOptions,
    pub state_manager: StateManagerConfig,
}

impl MachineConfig {
    pub fn with_initial(initial: impl Into<String>) -> Self {
        Self {
            initial_state: Some(initial.into()),
            ..Self::default()
        }
    }
}

// ─── Context helpers ──────────────────────────────────────────

/// Shallow merge: top-level keys of `partial` overwrite `base`. Merging
/// into (or from) a non-object replaces the value wholesale.
pub fn shallow_merge(base: &Context, partial: &Context) -> Context {
    match (base, partial) {
        (Value::Object(b), Value::Object(p)) => {
            let mut merged = b.clone();
            for (k, v) in p {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        _ => partial.clone(),
    }
}

/// Default equality gate: same own keys, each value equal. Non-objects
/// compare structurally.
pub fn shallow_equal(a: &Context, b: &Context) -> bool {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len() && a.iter().all(|(k, v)| b.get(k) == Some(v))
        }
        _ => a == b,
    }
}

/// Top-level keys of a partial update; empty for non-objects.
pub(crate) fn top_level_keys(partial: &Context) -> Vec<String> {
    match partial {
        Value::Object(map) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shallow_merge_overwrites_top_level() {
        let base = json!({"a": 1, "b": {"nested": true}});
        let merged = shallow_merge(&base, &json!({"b": 2, "c": 3}));
        assert_eq!(merged, json!({"a": 1, "b": 2, "c": 3}));
    }

    #[test]
    fn shallow_merge_replaces_non_objects() {
        assert_eq!(shallow_merge(&json!(1), &json!({"a": 1})), json!({"a": 1}));
        assert_eq!(shallow_merge(&json!({"a": 1}), &json!(7)), json!(7));
    }

    #[test]
    fn shallow_equal_compares_own_keys() {
        assert!(shallow_equal(&json!({"a": 1}), &json!({"a": 1})));
        assert!(!shallow_equal(&json!({"a": 1}), &json!({"a": 2})));
        assert!(!shallow_equal(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
        assert!(shallow_equal(&json!(null), &json!(null)));
    }

    #[test]
    fn retry_policy_clamps_attempts() {
        assert_eq!(RetryPolicy::new(0, 5).max_attempts, 1);
        assert_eq!(RetryPolicy::new(3, 5).max_attempts, 3);
    }

    #[test]
    fn retry_policy_wire_names() {
        let json = serde_json::to_value(RetryPolicy::new(3, 10)).unwrap();
        assert_eq!(json, json!({"maxAttempts": 3, "delay": 10}));
    }
}
