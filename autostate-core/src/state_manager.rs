//! Per-state context store: shallow merges behind an equality gate, an
//! optional coalescing window, ordered subscribers, and keyed memoized
//! derivations with dependency invalidation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;

use crate::paths::head_key;
use crate::scheduler::{Scheduler, TimerHandle};
use crate::types::{
    shallow_equal, shallow_merge, top_level_keys, BoxFut, Context, ContextListener, MetricEvent,
    StateManagerConfig,
};

/// Runs after a flush publishes a changed context: `(previous, next)`.
/// The owning state installs its evaluation trigger here so batched and
/// immediate updates share one code path.
pub(crate) type FlushHook = Arc<dyn Fn(Context, Context) -> BoxFut<()> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct MemoEntry {
    value: Value,
    deps: Vec<String>,
}

struct Inner {
    ctx: Context,
    pending: Vec<Context>,
    batch_timer: Option<TimerHandle>,
    listeners: Vec<(SubscriptionId, ContextListener)>,
    listener_seq: u64,
    memo: HashMap<String, MemoEntry>,
    flush_hook: Option<FlushHook>,
}

/// Owns one state's context value.
pub struct StateManager {
    weak: Weak<StateManager>,
    config: StateManagerConfig,
    scheduler: Arc<dyn Scheduler>,
    inner: Mutex<Inner>,
}

impl StateManager {
    pub fn new(config: StateManagerConfig, scheduler: Arc<dyn Scheduler>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            config,
            scheduler,
            inner: Mutex::new(Inner {
                ctx: Value::Object(serde_json::Map::new()),
                pending: Vec::new(),
                batch_timer: None,
                listeners: Vec::new(),
                listener_seq: 0,
                memo: HashMap::new(),
                flush_hook: None,
            }),
        })
    }

    /// Latest applied context. Pending coalesced partials are not visible
    /// until their window closes.
    pub fn get(&self) -> Context {
        self.inner.lock().unwrap().ctx.clone()
    }

    /// Merge a partial update. With batching on, the partial is queued and
    /// the window timer is armed on first pending; otherwise it applies
    /// immediately. Merging itself cannot fail.
    pub async fn set(&self, partial: Context) {
        if self.config.batch_updates {
            let arm = {
                let mut inner = self.inner.lock().unwrap();
                inner.pending.push(partial);
                inner.batch_timer.is_none()
            };
            if arm {
                self.arm_batch_timer();
            }
            self.metric(MetricEvent::UpdateCoalesced);
            return;
        }
        self.apply_with(vec![partial], true).await;
    }

    /// Close the coalescing window now: merge pending partials
    /// left-to-right, gate, publish once.
    pub async fn flush(&self) {
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(handle) = inner.batch_timer.take() {
                self.scheduler.cancel(handle);
            }
            std::mem::take(&mut inner.pending)
        };
        if !pending.is_empty() {
            self.apply_with(pending, true).await;
        }
    }

    /// Apply a run of partials as one update. Returns the `(prev, next)`
    /// pair when the equality gate let the change through.
    pub(crate) async fn apply_with(
        &self,
        partials: Vec<Context>,
        run_hook: bool,
    ) -> Option<(Context, Context)> {
        let (prev, next, changed_keys) = {
            let inner = self.inner.lock().unwrap();
            let prev = inner.ctx.clone();
            let mut next = prev.clone();
            let mut keys = Vec::new();
            for partial in &partials {
                keys.extend(top_level_keys(partial));
                next = shallow_merge(&next, partial);
            }
            (prev, next, keys)
        };

        let equal = match &self.config.are_equal {
            Some(f) => f(&prev, &next),
            None => shallow_equal(&prev, &next),
        };
        if equal {
            self.metric(MetricEvent::UpdateSkippedEqual);
            return None;
        }

        let (listeners, hook) = {
            let mut inner = self.inner.lock().unwrap();
            inner.ctx = next.clone();
            inner
                .memo
                .retain(|_, entry| {
                    !entry
                        .deps
                        .iter()
                        .any(|dep| changed_keys.iter().any(|k| k == head_key(dep)))
                });
            let listeners: Vec<ContextListener> =
                inner.listeners.iter().map(|(_, l)| l.clone()).collect();
            (listeners, inner.flush_hook.clone())
        };
        self.metric(MetricEvent::UpdateApplied);

        for listener in listeners {
            if let Err(e) = listener(&prev, &next) {
                tracing::error!(error = %e, "context listener failed");
            }
        }

        if run_hook {
            if let Some(hook) = hook {
                hook(prev.clone(), next.clone()).await;
            }
        }

        Some((prev, next))
    }

    /// Swap the context wholesale without notifying anyone. Used for
    /// atomic-batch rollback and time-travel restores; all memo entries
    /// are dropped since their inputs may no longer exist.
    pub(crate) fn replace(&self, next: Context) {
        let mut inner = self.inner.lock().unwrap();
        inner.ctx = next;
        inner.memo.clear();
    }

    /// Drop any queued partials and disarm the window timer.
    pub(crate) fn discard_pending(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.clear();
        if let Some(handle) = inner.batch_timer.take() {
            self.scheduler.cancel(handle);
        }
    }

    pub fn subscribe(&self, listener: ContextListener) -> SubscriptionId {
        let mut inner = self.inner.lock().unwrap();
        inner.listener_seq += 1;
        let id = SubscriptionId(inner.listener_seq);
        inner.listeners.push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock().unwrap();
        inner.listeners.retain(|(sid, _)| *sid != id);
    }

    pub(crate) fn set_flush_hook(&self, hook: FlushHook) {
        self.inner.lock().unwrap().flush_hook = Some(hook);
    }

    /// Memoized derivation keyed by `key`. The cached value survives until
    /// a context update touches the top-level key of any dependency, or
    /// the dependency list itself changes.
    pub fn derive<F>(&self, key: &str, f: F, deps: &[&str]) -> Value
    where
        F: FnOnce(&Context) -> Value,
    {
        if !self.config.enable_memoization {
            let ctx = self.get();
            return f(&ctx);
        }

        {
            let inner = self.inner.lock().unwrap();
            if let Some(entry) = inner.memo.get(key) {
                if entry.deps.len() == deps.len()
                    && entry.deps.iter().zip(deps).all(|(a, b)| a == b)
                {
                    let value = entry.value.clone();
                    drop(inner);
                    self.metric(MetricEvent::MemoHit(key.to_string()));
                    return value;
                }
            }
        }

        // Compute outside the lock; user code may read the context back.
        let ctx = self.get();
        let value = f(&ctx);
        self.metric(MetricEvent::MemoMiss(key.to_string()));
        let mut inner = self.inner.lock().unwrap();
        inner.memo.insert(
            key.to_string(),
            MemoEntry {
                value: value.clone(),
                deps: deps.iter().map(|d| d.to_string()).collect(),
            },
        );
        value
    }

    pub fn clear_memo(&self) {
        self.inner.lock().unwrap().memo.clear();
    }

    pub fn clear_memo_keys(&self, keys: &[&str]) {
        let mut inner = self.inner.lock().unwrap();
        for key in keys {
            inner.memo.remove(*key);
        }
    }

    fn arm_batch_timer(&self) {
        let weak = self.weak.clone();
        let handle = self.scheduler.schedule(
            self.config.batch_window_ms,
            Box::new(move || {
                Box::pin(async move {
                    if let Some(manager) = weak.upgrade() {
                        manager.flush().await;
                    }
                })
            }),
        );
        self.inner.lock().unwrap().batch_timer = Some(handle);
    }

    fn metric(&self, event: MetricEvent) {
        if let Some(sink) = &self.config.metrics {
            sink(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(config: StateManagerConfig) -> (Arc<StateManager>, Arc<ManualScheduler>) {
        let sched = ManualScheduler::new();
        let mgr = StateManager::new(config, sched.clone());
        (mgr, sched)
    }

    #[tokio::test]
    async fn set_merges_shallowly() {
        let (mgr, _) = manager(StateManagerConfig::default());
        mgr.set(json!({"a": 1})).await;
        mgr.set(json!({"b": {"deep": true}})).await;
        mgr.set(json!({"a": 2})).await;
        assert_eq!(mgr.get(), json!({"a": 2, "b": {"deep": true}}));
    }

    #[tokio::test]
    async fn equal_update_notifies_nobody() {
        let (mgr, _) = manager(StateManagerConfig::default());
        mgr.set(json!({"a": 1})).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        mgr.subscribe(Arc::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        mgr.set(json!({"a": 1})).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        mgr.set(json!({"a": 2})).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listeners_run_in_registration_order_and_errors_are_isolated() {
        let (mgr, _) = manager(StateManagerConfig::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        mgr.subscribe(Arc::new(move |_, _| {
            o1.lock().unwrap().push(1);
            anyhow::bail!("listener one blew up")
        }));
        let o2 = Arc::clone(&order);
        mgr.subscribe(Arc::new(move |_, _| {
            o2.lock().unwrap().push(2);
            Ok(())
        }));

        mgr.set(json!({"x": 1})).await;
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn unsubscribe_removes_one_listener() {
        let (mgr, _) = manager(StateManagerConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let id = mgr.subscribe(Arc::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        mgr.unsubscribe(id);
        mgr.set(json!({"x": 1})).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn batching_coalesces_into_one_notify() {
        let (mgr, sched) = manager(StateManagerConfig {
            batch_updates: true,
            batch_window_ms: 50,
            ..Default::default()
        });

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        mgr.subscribe(Arc::new(move |prev, next| {
            seen.fetch_add(1, Ordering::SeqCst);
            assert_eq!(prev, &json!({}));
            assert_eq!(next, &json!({"a": 2, "b": 3}));
            Ok(())
        }));

        mgr.set(json!({"a": 1})).await;
        mgr.set(json!({"a": 2})).await;
        mgr.set(json!({"b": 3})).await;
        // Nothing visible until the window closes.
        assert_eq!(mgr.get(), json!({}));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        sched.advance(50).await;
        assert_eq!(mgr.get(), json!({"a": 2, "b": 3}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn memo_caches_until_dependency_changes() {
        let (mgr, _) = manager(StateManagerConfig {
            enable_memoization: true,
            ..Default::default()
        });
        mgr.set(json!({"count": 2, "other": "x"})).await;

        let computes = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&computes);
        let doubled = |mgr: &StateManager, c: Arc<AtomicUsize>| {
            mgr.derive(
                "doubled",
                move |ctx| {
                    c.fetch_add(1, Ordering::SeqCst);
                    json!(ctx["count"].as_i64().unwrap_or(0) * 2)
                },
                &["count"],
            )
        };

        assert_eq!(doubled(&mgr, c.clone()), json!(4));
        assert_eq!(doubled(&mgr, c.clone()), json!(4));
        assert_eq!(computes.load(Ordering::SeqCst), 1);

        // Unrelated key: cache survives.
        mgr.set(json!({"other": "y"})).await;
        assert_eq!(doubled(&mgr, c.clone()), json!(4));
        assert_eq!(computes.load(Ordering::SeqCst), 1);

        // Dependency key: cache invalidated.
        mgr.set(json!({"count": 5})).await;
        assert_eq!(doubled(&mgr, c.clone()), json!(10));
        assert_eq!(computes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn memo_recomputes_when_deps_differ() {
        let (mgr, _) = manager(StateManagerConfig {
            enable_memoization: true,
            ..Default::default()
        });
        mgr.set(json!({"a": 1, "b": 2})).await;

        let v1 = mgr.derive("sum", |ctx| json!(ctx["a"].as_i64().unwrap()), &["a"]);
        assert_eq!(v1, json!(1));
        // Same key, different dependency list: recompute.
        let v2 = mgr.derive("sum", |ctx| json!(ctx["b"].as_i64().unwrap()), &["b"]);
        assert_eq!(v2, json!(2));
    }

    #[tokio::test]
    async fn clear_memo_keys_is_selective() {
        let (mgr, _) = manager(StateManagerConfig {
            enable_memoization: true,
            ..Default::default()
        });
        mgr.set(json!({"a": 1, "b": 2})).await;
        let computes = Arc::new(AtomicUsize::new(0));

        for key in ["ka", "kb"] {
            let c = Arc::clone(&computes);
            mgr.derive(
                key,
                move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                    json!(0)
                },
                &["a"],
            );
        }
        assert_eq!(computes.load(Ordering::SeqCst), 2);

        mgr.clear_memo_keys(&["ka"]);
        let c = Arc::clone(&computes);
        mgr.derive(
            "ka",
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                json!(0)
            },
            &["a"],
        );
        let c = Arc::clone(&computes);
        mgr.derive(
            "kb",
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                json!(0)
            },
            &["a"],
        );
        assert_eq!(computes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn metrics_sink_sees_gate_outcomes() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let (mgr, _) = manager(StateManagerConfig {
            metrics: Some(Arc::new(move |e| sink_events.lock().unwrap().push(e))),
            ..Default::default()
        });

        mgr.set(json!({"a": 1})).await;
        mgr.set(json!({"a": 1})).await;
        let seen = events.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![MetricEvent::UpdateApplied, MetricEvent::UpdateSkippedEqual]
        );
    }
}
