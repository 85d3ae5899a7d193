//! A named state: outgoing transitions, lifecycle handlers, an owned
//! context manager, and the per-mutation evaluation pipeline that decides
//! which (if any) auto-transition fires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::machine::{MachineInner, TransitionOrigin};
use crate::paths::{path_differs, PathCache};
use crate::scheduler::{ScheduledTask, Scheduler, TimerHandle};
use crate::state_manager::StateManager;
use crate::types::{
    AutoTransition, Context, EvalStrategy, Handler, HandlerArgs, RetryPolicy, StateManagerConfig,
};

/// Options for [`State::batch_update`].
#[derive(Clone, Copy, Debug, Default)]
pub struct BatchUpdateOptions {
    /// Evaluate once after the final partial instead of after each one.
    pub evaluate_after_complete: bool,
    /// Restore the pre-batch context (and clear debounce timers) if any
    /// partial is rejected.
    pub atomic: bool,
}

/// Cheap cloneable handle to a state owned by a machine.
#[derive(Clone)]
pub struct State {
    pub(crate) inner: Arc<StateInner>,
}

pub(crate) struct StateInner {
    name: String,
    machine: Weak<MachineInner>,
    scheduler: Arc<dyn Scheduler>,
    transitions: Mutex<Vec<String>>,
    autos: Mutex<Vec<AutoTransition>>,
    enter_handlers: Mutex<Vec<Handler>>,
    exit_handlers: Mutex<Vec<Handler>>,
    handlers: Mutex<Vec<Handler>>,
    manager: Arc<StateManager>,
    /// One pending debounce timer per auto-transition insertion index.
    debounce_timers: Mutex<HashMap<usize, TimerHandle>>,
    /// One pending idle callback per auto-transition insertion index.
    idle_handles: Mutex<HashMap<usize, TimerHandle>>,
    next_tick_timer: Mutex<Option<TimerHandle>>,
    last_context: Mutex<Option<Context>>,
    is_evaluating: AtomicBool,
    paths: PathCache,
}

/// An auto-transition with its group defaults resolved.
#[derive(Clone)]
struct Candidate {
    idx: usize,
    priority: i32,
    debounce: u64,
    retry: Option<RetryPolicy>,
    transition: AutoTransition,
}

enum DeferredKind {
    Debounce,
    Idle,
}

/// Resets the re-entrancy flag even if evaluation unwinds.
struct EvalGuard<'a>(&'a AtomicBool);

impl Drop for EvalGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl State {
    pub(crate) fn new(
        name: String,
        machine: Weak<MachineInner>,
        manager_config: StateManagerConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let manager = StateManager::new(manager_config, scheduler.clone());
        let inner = Arc::new(StateInner {
            name,
            machine: machine.clone(),
            scheduler,
            transitions: Mutex::new(Vec::new()),
            autos: Mutex::new(Vec::new()),
            enter_handlers: Mutex::new(Vec::new()),
            exit_handlers: Mutex::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
            manager,
            debounce_timers: Mutex::new(HashMap::new()),
            idle_handles: Mutex::new(HashMap::new()),
            next_tick_timer: Mutex::new(None),
            last_context: Mutex::new(None),
            is_evaluating: AtomicBool::new(false),
            paths: PathCache::default(),
        });

        // Every published context change funnels through this hook, which
        // is what makes batched and immediate updates evaluate identically.
        let weak_state = Arc::downgrade(&inner);
        let weak_machine = machine;
        inner.manager.set_flush_hook(Arc::new(move |prev, next| {
            let weak_state = weak_state.clone();
            let weak_machine = weak_machine.clone();
            Box::pin(async move {
                let (Some(state), Some(machine)) = (weak_state.upgrade(), weak_machine.upgrade())
                else {
                    return;
                };
                if machine.in_time_travel.load(Ordering::SeqCst) {
                    return;
                }
                if machine.current_name().as_deref() != Some(state.name.as_str()) {
                    return;
                }
                State { inner: state }.evaluate(next, Some(prev)).await;
            })
        }));

        State { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn get_context(&self) -> Context {
        self.inner.manager.get()
    }

    /// The state's context manager, for `subscribe`/`derive`/memo control.
    pub fn context_manager(&self) -> Arc<StateManager> {
        self.inner.manager.clone()
    }

    /// Context passed to the most recent evaluation pass.
    pub fn last_evaluated_context(&self) -> Option<Context> {
        self.inner.last_context.lock().unwrap().clone()
    }

    /// Merge a partial update into this state's context. If the state is
    /// current and the merge survives the equality gate, the evaluation
    /// pipeline runs against the new context.
    pub async fn update_context(&self, partial: Context) {
        self.inner.manager.set(partial).await;
    }

    /// Outgoing transition targets, in insertion order.
    pub fn transition_targets(&self) -> Vec<String> {
        self.inner.transitions.lock().unwrap().clone()
    }

    pub fn on_enter(&self, handler: Handler) {
        self.inner.enter_handlers.lock().unwrap().push(handler);
    }

    pub fn on_exit(&self, handler: Handler) {
        self.inner.exit_handlers.lock().unwrap().push(handler);
    }

    /// Generic handler fired after every completed entry into this state.
    pub fn add_handler(&self, handler: Handler) {
        self.inner.handlers.lock().unwrap().push(handler);
    }

    // ── Registration (machine-side) ──

    pub(crate) fn add_target(&self, to: &str) {
        let mut transitions = self.inner.transitions.lock().unwrap();
        if !transitions.iter().any(|t| t == to) {
            transitions.push(to.to_string());
        }
    }

    pub(crate) fn has_target(&self, to: &str) -> bool {
        self.inner.transitions.lock().unwrap().iter().any(|t| t == to)
    }

    pub(crate) fn add_auto(&self, mut auto: AutoTransition, to: &str) {
        auto.target = to.to_string();
        self.inner.autos.lock().unwrap().push(auto);
    }

    pub(crate) fn auto_transitions_snapshot(&self) -> Vec<AutoTransition> {
        self.inner.autos.lock().unwrap().clone()
    }

    /// Prune every edge pointing at `name`. Scheduling tables are keyed by
    /// auto-transition index, so removal invalidates them wholesale.
    pub(crate) fn remove_transitions_to(&self, name: &str) {
        self.inner.transitions.lock().unwrap().retain(|t| t != name);
        self.inner.autos.lock().unwrap().retain(|a| a.target != name);
        self.cancel_all_schedules();
    }

    pub(crate) fn pending_debounce_count(&self) -> usize {
        self.inner.debounce_timers.lock().unwrap().len()
    }

    pub(crate) fn pending_idle_count(&self) -> usize {
        self.inner.idle_handles.lock().unwrap().len()
    }

    // ── Lifecycle ──

    /// Entry protocol: enter handlers awaited in parallel, generic
    /// handlers in order, then one evaluation pass with no previous
    /// context.
    pub(crate) async fn trigger_enter(&self, previous: Option<String>) {
        let args = HandlerArgs {
            from: previous,
            to: self.inner.name.clone(),
        };

        let enters: Vec<Handler> = self.inner.enter_handlers.lock().unwrap().clone();
        let pending: Vec<_> = enters.iter().map(|h| h(args.clone())).collect();
        for result in futures::future::join_all(pending).await {
            if let Err(e) = result {
                tracing::error!(state = %self.inner.name, error = %e, "enter handler failed");
            }
        }

        let generics: Vec<Handler> = self.inner.handlers.lock().unwrap().clone();
        for handler in generics {
            if let Err(e) = handler(args.clone()).await {
                tracing::error!(state = %self.inner.name, error = %e, "state handler failed");
            }
        }

        let ctx = self.inner.manager.get();
        self.evaluate(ctx, None).await;
    }

    /// Exit protocol: cancel every pending schedule first so the leaving
    /// state can never fire a deferred transition after another state has
    /// become current, then run exit handlers sequentially.
    pub(crate) async fn trigger_exit(&self, next: &str) {
        self.cancel_all_schedules();

        let args = HandlerArgs {
            from: Some(self.inner.name.clone()),
            to: next.to_string(),
        };
        let exits: Vec<Handler> = self.inner.exit_handlers.lock().unwrap().clone();
        for handler in exits {
            if let Err(e) = handler(args.clone()).await {
                tracing::error!(state = %self.inner.name, error = %e, "exit handler failed");
            }
        }
    }

    pub(crate) fn cancel_all_schedules(&self) {
        for (_, handle) in self.inner.debounce_timers.lock().unwrap().drain() {
            self.inner.scheduler.cancel(handle);
        }
        for (_, handle) in self.inner.idle_handles.lock().unwrap().drain() {
            self.inner.scheduler.cancel_idle(handle);
        }
        if let Some(handle) = self.inner.next_tick_timer.lock().unwrap().take() {
            self.inner.scheduler.cancel(handle);
        }
    }

    // ── Batch update ──

    /// Apply a run of partials through the context manager. Non-object
    /// partials are rejected; under `atomic` a rejection restores the
    /// pre-batch context, clears debounce timers, and returns false.
    pub async fn batch_update(&self, partials: Vec<Context>, opts: BatchUpdateOptions) -> bool {
        let manager = &self.inner.manager;
        let before = manager.get();
        let total = partials.len();
        let mut applied = 0usize;

        for partial in partials {
            if !partial.is_object() {
                tracing::error!(state = %self.inner.name, "batch partial is not an object");
                if opts.atomic {
                    manager.replace(before.clone());
                    for (_, handle) in self.inner.debounce_timers.lock().unwrap().drain() {
                        self.inner.scheduler.cancel(handle);
                    }
                    return false;
                }
                continue;
            }
            manager
                .apply_with(vec![partial], !opts.evaluate_after_complete)
                .await;
            applied += 1;
        }

        if opts.evaluate_after_complete && applied > 0 {
            if let Some(machine) = self.inner.machine.upgrade() {
                if !machine.in_time_travel.load(Ordering::SeqCst)
                    && machine.current_name().as_deref() == Some(self.inner.name.as_str())
                {
                    let ctx = manager.get();
                    self.evaluate(ctx, Some(before)).await;
                }
            }
        }

        if opts.atomic {
            applied == total
        } else {
            applied > 0
        }
    }

    // ── Evaluation pipeline ──

    /// One evaluation pass. Returns true iff a transition fired within the
    /// pass. Re-entrant calls short-circuit to false.
    pub(crate) fn evaluate(
        &self,
        ctx: Context,
        prev: Option<Context>,
    ) -> futures::future::BoxFuture<'static, bool> {
        let state = self.clone();
        Box::pin(async move { state.evaluate_impl(ctx, prev).await })
    }

    async fn evaluate_impl(&self, ctx: Context, prev: Option<Context>) -> bool {
        let Some(machine) = self.inner.machine.upgrade() else {
            return false;
        };
        if machine.in_time_travel.load(Ordering::SeqCst) {
            return false;
        }
        if self.inner.is_evaluating.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _guard = EvalGuard(&self.inner.is_evaluating);

        *self.inner.last_context.lock().unwrap() = Some(ctx.clone());

        // Idle callbacks never survive a new pass; debounce timers do, so
        // a watched-property miss can let an armed window keep running.
        for (_, handle) in self.inner.idle_handles.lock().unwrap().drain() {
            self.inner.scheduler.cancel_idle(handle);
        }

        let mut candidates: Vec<Candidate> = {
            let autos = self.inner.autos.lock().unwrap();
            autos
                .iter()
                .enumerate()
                .filter_map(|(idx, t)| {
                    let group_cfg = match &t.group {
                        Some(g) => {
                            if !machine.group_chain_enabled(g) {
                                return None;
                            }
                            machine.group_config(g)
                        }
                        None => None,
                    };
                    let cfg = group_cfg.as_ref();
                    Some(Candidate {
                        idx,
                        priority: t
                            .priority
                            .or(cfg.and_then(|c| c.priority))
                            .unwrap_or(0),
                        debounce: t
                            .debounce_ms
                            .or(cfg.and_then(|c| c.debounce))
                            .unwrap_or(0),
                        retry: t.retry.or(cfg.and_then(|c| c.retry_config)),
                        transition: t.clone(),
                    })
                })
                .collect()
        };
        // Stable: equal priorities keep insertion order.
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut immediate = Vec::new();
        let mut debounced = Vec::new();
        let mut next_tick = Vec::new();
        let mut idle = Vec::new();

        for candidate in candidates {
            if let Some(skip) = &candidate.transition.eval.skip_if {
                if skip(&ctx) {
                    if let Some(handle) = self
                        .inner
                        .debounce_timers
                        .lock()
                        .unwrap()
                        .remove(&candidate.idx)
                    {
                        self.inner.scheduler.cancel(handle);
                    }
                    continue;
                }
            }

            if !candidate.transition.eval.watch.is_empty() {
                if let Some(prev_ctx) = &prev {
                    let changed = candidate.transition.eval.watch.iter().any(|path| {
                        let segs = self.inner.paths.get(path);
                        path_differs(prev_ctx, &ctx, &segs)
                    });
                    if !changed {
                        continue;
                    }
                }
            }

            if candidate.debounce > 0 {
                debounced.push(candidate);
            } else {
                match candidate.transition.eval.strategy {
                    EvalStrategy::Immediate => immediate.push(candidate),
                    EvalStrategy::NextTick => next_tick.push(candidate),
                    EvalStrategy::Idle => idle.push(candidate),
                }
            }
        }

        for candidate in &immediate {
            if self.eval_one(&machine, candidate, &ctx).await {
                return true;
            }
        }

        for candidate in debounced {
            self.schedule_deferred(&machine, candidate, ctx.clone(), DeferredKind::Debounce);
        }

        if !next_tick.is_empty() {
            self.schedule_next_tick(&machine, next_tick, ctx.clone());
        }

        for candidate in idle {
            self.schedule_deferred(&machine, candidate, ctx.clone(), DeferredKind::Idle);
        }

        false
    }

    /// Evaluate one candidate inline. A truthy condition requests the
    /// transition and wins the pass; errors are logged (and retried under
    /// a retry policy) and never escape.
    async fn eval_one(
        &self,
        machine: &Arc<MachineInner>,
        candidate: &Candidate,
        ctx: &Context,
    ) -> bool {
        let name = self.inner.name.as_str();
        let target = candidate.transition.target.as_str();
        let condition = &candidate.transition.condition;

        let Some(retry) = candidate.retry else {
            return match condition(name, ctx).await {
                Ok(true) => {
                    self.request_transition(machine, target).await;
                    true
                }
                Ok(false) => false,
                Err(e) => {
                    tracing::error!(state = name, target_state = target, error = %e, "condition failed");
                    false
                }
            };
        };

        for attempt in 1..=retry.max_attempts {
            match condition(name, ctx).await {
                Ok(true) => {
                    self.request_transition(machine, target).await;
                    return true;
                }
                // A falsy result stops the loop; only errors are retried.
                Ok(false) => return false,
                Err(e) => {
                    if attempt < retry.max_attempts {
                        tracing::info!(
                            state = name,
                            target_state = target,
                            attempt,
                            error = %e,
                            "condition attempt failed; retrying"
                        );
                        scheduler_sleep(self.inner.scheduler.clone(), retry.delay_ms).await;
                    } else {
                        tracing::error!(
                            state = name,
                            target_state = target,
                            attempts = retry.max_attempts,
                            error = %e,
                            "condition retries exhausted"
                        );
                    }
                }
            }
        }
        false
    }

    async fn request_transition(&self, machine: &Arc<MachineInner>, target: &str) {
        let result = machine
            .clone()
            .transition_request(target.to_string(), None, TransitionOrigin::Auto)
            .await;
        if let Err(e) = result {
            tracing::error!(
                state = %self.inner.name,
                target_state = target,
                error = %e,
                "auto transition failed"
            );
        }
    }

    /// Cancel-and-replace single-shot evaluation of one candidate. The
    /// callback re-checks that this state is still current, then evaluates
    /// the condition once against the context snapshot captured here.
    fn schedule_deferred(
        &self,
        machine: &Arc<MachineInner>,
        candidate: Candidate,
        snapshot: Context,
        kind: DeferredKind,
    ) {
        let idx = candidate.idx;
        match kind {
            DeferredKind::Debounce => {
                if let Some(prior) = self.inner.debounce_timers.lock().unwrap().remove(&idx) {
                    self.inner.scheduler.cancel(prior);
                }
            }
            DeferredKind::Idle => {
                if let Some(prior) = self.inner.idle_handles.lock().unwrap().remove(&idx) {
                    self.inner.scheduler.cancel_idle(prior);
                }
            }
        }

        let weak_machine = Arc::downgrade(machine);
        let weak_state = Arc::downgrade(&self.inner);
        let name = self.inner.name.clone();
        let target = candidate.transition.target.clone();
        let condition = candidate.transition.condition.clone();
        let is_debounce = matches!(kind, DeferredKind::Debounce);

        let task: ScheduledTask = Box::new(move || {
            Box::pin(async move {
                let (Some(machine), Some(state)) = (weak_machine.upgrade(), weak_state.upgrade())
                else {
                    return;
                };
                if is_debounce {
                    state.debounce_timers.lock().unwrap().remove(&idx);
                } else {
                    state.idle_handles.lock().unwrap().remove(&idx);
                }
                if machine.in_time_travel.load(Ordering::SeqCst) {
                    return;
                }
                if machine.current_name().as_deref() != Some(name.as_str()) {
                    return;
                }
                match condition(&name, &snapshot).await {
                    Ok(true) => {
                        let result = machine
                            .transition_request(target.clone(), None, TransitionOrigin::Auto)
                            .await;
                        if let Err(e) = result {
                            tracing::error!(state = %name, target_state = %target, error = %e, "deferred transition failed");
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(state = %name, target_state = %target, error = %e, "deferred condition failed");
                    }
                }
            })
        });

        match kind {
            DeferredKind::Debounce => {
                let handle = self.inner.scheduler.schedule(candidate.debounce, task);
                self.inner
                    .debounce_timers
                    .lock()
                    .unwrap()
                    .insert(idx, handle);
            }
            DeferredKind::Idle => {
                let handle = self.inner.scheduler.schedule_idle(task);
                self.inner.idle_handles.lock().unwrap().insert(idx, handle);
            }
        }
    }

    /// One zero-delay callback that runs the whole bucket like the
    /// immediate bucket: priority order, first hit wins.
    fn schedule_next_tick(
        &self,
        machine: &Arc<MachineInner>,
        bucket: Vec<Candidate>,
        snapshot: Context,
    ) {
        if let Some(prior) = self.inner.next_tick_timer.lock().unwrap().take() {
            self.inner.scheduler.cancel(prior);
        }

        let weak_machine = Arc::downgrade(machine);
        let weak_state = Arc::downgrade(&self.inner);

        let task: ScheduledTask = Box::new(move || {
            Box::pin(async move {
                let (Some(machine), Some(state)) = (weak_machine.upgrade(), weak_state.upgrade())
                else {
                    return;
                };
                *state.next_tick_timer.lock().unwrap() = None;
                if machine.in_time_travel.load(Ordering::SeqCst) {
                    return;
                }
                if machine.current_name().as_deref() != Some(state.name.as_str()) {
                    return;
                }
                let state = State { inner: state };
                for candidate in &bucket {
                    if state.eval_one(&machine, candidate, &snapshot).await {
                        break;
                    }
                }
            })
        });

        let handle = self.inner.scheduler.schedule(0, task);
        *self.inner.next_tick_timer.lock().unwrap() = Some(handle);
    }
}

/// Wait through the injected scheduler, so virtual clocks govern retry
/// delays too.
async fn scheduler_sleep(scheduler: Arc<dyn Scheduler>, ms: u64) {
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    scheduler.schedule(
        ms,
        Box::new(move || {
            Box::pin(async move {
                let _ = tx.send(());
            })
        }),
    );
    let _ = rx.await;
}
