//! Machine-level lifecycle observers: `before` (may veto), `failed`, and
//! `after`. Handlers run in insertion order; anything they raise is logged
//! and contained here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::types::BoxFut;

/// Pre-transition handler: `(previous, target)`. Returning `false` vetoes
/// the transition. An error is logged and counts as a pass.
pub type BeforeHandler =
    Arc<dyn Fn(Option<String>, String) -> BoxFut<Result<bool>> + Send + Sync>;

/// Post-transition handler: `(previous, entered)`.
pub type AfterHandler = Arc<dyn Fn(Option<String>, String) -> BoxFut<Result<()>> + Send + Sync>;

/// Failure handler: `(current, attempted target)`.
pub type FailedHandler = Arc<dyn Fn(Option<String>, String) -> BoxFut<Result<()>> + Send + Sync>;

/// A handler plus the channel it belongs to.
pub enum Observer {
    Before(BeforeHandler),
    Failed(FailedHandler),
    After(AfterHandler),
}

impl Observer {
    /// Synchronous `before` observer from a plain predicate.
    pub fn before_fn<F>(f: F) -> Self
    where
        F: Fn(Option<&str>, &str) -> bool + Send + Sync + 'static,
    {
        Observer::Before(Arc::new(move |prev, next| {
            let pass = f(prev.as_deref(), &next);
            Box::pin(async move { Ok(pass) })
        }))
    }

    /// Synchronous `failed` observer.
    pub fn failed_fn<F>(f: F) -> Self
    where
        F: Fn(Option<&str>, &str) + Send + Sync + 'static,
    {
        Observer::Failed(Arc::new(move |prev, target| {
            f(prev.as_deref(), &target);
            Box::pin(async move { Ok(()) })
        }))
    }

    /// Synchronous `after` observer.
    pub fn after_fn<F>(f: F) -> Self
    where
        F: Fn(Option<&str>, &str) + Send + Sync + 'static,
    {
        Observer::After(Arc::new(move |prev, next| {
            f(prev.as_deref(), &next);
            Box::pin(async move { Ok(()) })
        }))
    }
}

/// Identifies a registered observer so it can be removed later.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

pub(crate) struct ObserverRegistry {
    seq: AtomicU64,
    before: Mutex<Vec<(ObserverId, BeforeHandler)>>,
    failed: Mutex<Vec<(ObserverId, FailedHandler)>>,
    after: Mutex<Vec<(ObserverId, AfterHandler)>>,
}

impl ObserverRegistry {
    pub(crate) fn new() -> Self {
        Self {
            seq: AtomicU64::new(1),
            before: Mutex::new(Vec::new()),
            failed: Mutex::new(Vec::new()),
            after: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, observer: Observer) -> ObserverId {
        let id = ObserverId(self.seq.fetch_add(1, Ordering::Relaxed));
        match observer {
            Observer::Before(h) => self.before.lock().unwrap().push((id, h)),
            Observer::Failed(h) => self.failed.lock().unwrap().push((id, h)),
            Observer::After(h) => self.after.lock().unwrap().push((id, h)),
        }
        id
    }

    /// Remove one registration. Returns false for unknown ids.
    pub(crate) fn remove(&self, id: ObserverId) -> bool {
        fn drop_from<H>(list: &Mutex<Vec<(ObserverId, H)>>, id: ObserverId) -> bool {
            let mut list = list.lock().unwrap();
            let len = list.len();
            list.retain(|(oid, _)| *oid != id);
            list.len() != len
        }
        drop_from(&self.before, id) | drop_from(&self.failed, id) | drop_from(&self.after, id)
    }

    /// Run all `before` handlers in order. Every handler runs even after a
    /// veto; the aggregate is false if any handler returned false.
    pub(crate) async fn trigger_before(&self, prev: Option<&str>, next: &str) -> bool {
        let handlers: Vec<BeforeHandler> = self
            .before
            .lock()
            .unwrap()
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        let mut pass = true;
        for handler in handlers {
            match handler(prev.map(String::from), next.to_string()).await {
                Ok(allowed) => pass &= allowed,
                Err(e) => {
                    tracing::error!(target_state = next, error = %e, "before observer failed; counting as pass");
                }
            }
        }
        pass
    }

    pub(crate) async fn trigger_after(&self, prev: Option<&str>, next: &str) {
        let handlers: Vec<AfterHandler> = self
            .after
            .lock()
            .unwrap()
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            if let Err(e) = handler(prev.map(String::from), next.to_string()).await {
                tracing::error!(entered = next, error = %e, "after observer failed");
            }
        }
    }

    pub(crate) async fn trigger_failed(&self, prev: Option<&str>, target: &str) {
        let handlers: Vec<FailedHandler> = self
            .failed
            .lock()
            .unwrap()
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            if let Err(e) = handler(prev.map(String::from), target.to_string()).await {
                tracing::error!(target_state = target, error = %e, "failed observer failed");
            }
        }
    }
}
