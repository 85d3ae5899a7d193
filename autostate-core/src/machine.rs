//! The machine: state registry, current pointer, lifecycle observers,
//! optional global history, transition middleware, and the one code path
//! that moves the current pointer.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::FsmError;
use crate::groups::{GroupConfig, TransitionGroup};
use crate::history::{RecordArgs, TransitionHistory};
use crate::observers::{Observer, ObserverId, ObserverRegistry};
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::state::State;
use crate::time_travel::TimeTravelFrame;
use crate::types::{AutoTransition, BoxFut, Condition, Context, Handler, MachineConfig};

/// Middleware wrapped around the exit/enter sequence of every transition.
/// Returning `Ok(false)` suppresses the transition (it fails like a veto);
/// an error is logged and counts as proceed. Installation order is
/// execution order.
#[async_trait]
pub trait TransitionMiddleware: Send + Sync {
    async fn before_transition(&self, prev: Option<&str>, target: &str) -> anyhow::Result<bool>;
}

/// Who asked for the transition. The machine's own API may jump to any
/// declared state; evaluation-driven requests must follow a declared edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TransitionOrigin {
    Manual,
    Auto,
}

pub(crate) struct MachineInner {
    pub(crate) id: Uuid,
    config: MachineConfig,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    states: RwLock<HashMap<String, State>>,
    current: RwLock<Option<State>>,
    pub(crate) observers: ObserverRegistry,
    pub(crate) history: Option<Arc<TransitionHistory>>,
    groups: RwLock<HashMap<String, TransitionGroup>>,
    middleware: RwLock<Vec<Arc<dyn TransitionMiddleware>>>,
    pub(crate) in_time_travel: AtomicBool,
    pub(crate) time_travel: Mutex<Option<TimeTravelFrame>>,
}

impl MachineInner {
    pub(crate) fn current_state(&self) -> Option<State> {
        self.current.read().unwrap().clone()
    }

    pub(crate) fn current_name(&self) -> Option<String> {
        self.current
            .read()
            .unwrap()
            .as_ref()
            .map(|s| s.name().to_string())
    }

    pub(crate) fn set_current(&self, state: Option<State>) {
        *self.current.write().unwrap() = state;
    }

    pub(crate) fn state(&self, name: &str) -> Option<State> {
        self.states.read().unwrap().get(name).cloned()
    }

    /// A transition tagged with an unregistered group is not gated; a
    /// registered group must be enabled along its whole parent chain.
    pub(crate) fn group_chain_enabled(&self, name: &str) -> bool {
        let groups = self.groups.read().unwrap();
        let mut visited = Vec::new();
        let mut cursor = name.to_string();
        loop {
            let Some(group) = groups.get(&cursor) else {
                return true;
            };
            if !group.enabled {
                return false;
            }
            match &group.parent_group {
                Some(parent) if !visited.contains(parent) => {
                    visited.push(cursor);
                    cursor = parent.clone();
                }
                _ => return true,
            }
        }
    }

    pub(crate) fn group_config(&self, name: &str) -> Option<GroupConfig> {
        self.groups
            .read()
            .unwrap()
            .get(name)
            .map(|g| g.config.clone())
    }

    fn record_history(&self, args: RecordArgs) {
        if let Some(history) = &self.history {
            history.record(args);
        }
    }

    /// First group tag declared on an edge `current → target`, for history
    /// annotation.
    fn group_for_edge(current: Option<&State>, target: &str) -> Option<String> {
        current.and_then(|state| {
            state
                .auto_transitions_snapshot()
                .into_iter()
                .find(|t| t.target == target)
                .and_then(|t| t.group)
        })
    }

    /// The only path that changes `current`.
    ///
    /// Contract, in order: resolve the target (unknown → failed), check
    /// the structural edge for auto requests, run the `before` veto gate,
    /// run middleware, then exit → swap → patch → record → enter → after.
    pub(crate) fn transition_request(
        self: Arc<Self>,
        target: String,
        patch: Option<Context>,
        origin: TransitionOrigin,
    ) -> BoxFut<Result<bool, FsmError>> {
        Box::pin(async move {
            if target.is_empty() {
                return Err(FsmError::NoTarget);
            }
            if self.in_time_travel.load(std::sync::atomic::Ordering::SeqCst) {
                tracing::warn!(machine = %self.id, target_state = %target, "transition ignored while time traveling");
                return Ok(false);
            }

            let current = self.current_state();
            let current_name = current.as_ref().map(|s| s.name().to_string());
            let group = Self::group_for_edge(current.as_ref(), &target);

            let fail = |args_group: Option<String>| RecordArgs {
                from: current_name.clone(),
                to: target.clone(),
                context: current.as_ref().map(|s| s.get_context()),
                success: false,
                group: args_group,
                metadata: None,
            };

            // Resolve the target state.
            let Some(next) = self.state(&target) else {
                self.observers
                    .trigger_failed(current_name.as_deref(), &target)
                    .await;
                self.record_history(fail(None));
                return Ok(false);
            };

            // Structural edge check for evaluation-driven requests.
            if origin == TransitionOrigin::Auto {
                if let Some(cur) = &current {
                    if !cur.has_target(&target) {
                        self.observers
                            .trigger_failed(current_name.as_deref(), &target)
                            .await;
                        self.record_history(fail(group.clone()));
                        return Ok(false);
                    }
                }
            }

            // Veto gate.
            if !self
                .observers
                .trigger_before(current_name.as_deref(), &target)
                .await
            {
                self.observers
                    .trigger_failed(current_name.as_deref(), &target)
                    .await;
                self.record_history(fail(group.clone()));
                return Ok(false);
            }

            // Middleware, installation order.
            let middleware: Vec<Arc<dyn TransitionMiddleware>> =
                self.middleware.read().unwrap().clone();
            for mw in middleware {
                match mw.before_transition(current_name.as_deref(), &target).await {
                    Ok(true) => {}
                    Ok(false) => {
                        self.observers
                            .trigger_failed(current_name.as_deref(), &target)
                            .await;
                        self.record_history(fail(group.clone()));
                        return Ok(false);
                    }
                    Err(e) => {
                        tracing::error!(machine = %self.id, error = %e, "transition middleware failed; proceeding");
                    }
                }
            }

            if let Some(cur) = &current {
                cur.trigger_exit(&target).await;
            }
            self.set_current(Some(next.clone()));

            // Patch lands before enter handlers so they observe it; the
            // entry evaluation that follows covers it, so no extra pass.
            if let Some(patch) = patch {
                next.context_manager().apply_with(vec![patch], false).await;
            }

            self.record_history(RecordArgs {
                from: current_name.clone(),
                to: target.clone(),
                context: Some(next.get_context()),
                success: true,
                group,
                metadata: None,
            });

            next.trigger_enter(current_name.clone()).await;

            if current_name.is_some() {
                self.observers
                    .trigger_after(current_name.as_deref(), &target)
                    .await;
            }

            Ok(true)
        })
    }
}

/// A finite state machine with conditional, context-driven
/// auto-transitions.
#[derive(Clone)]
pub struct Machine {
    pub(crate) inner: Arc<MachineInner>,
}

impl Machine {
    /// Machine on the default tokio-backed scheduler.
    pub fn new(config: MachineConfig) -> Self {
        Self::with_scheduler(config, Arc::new(TokioScheduler::new()))
    }

    pub fn with_scheduler(config: MachineConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        let history = config
            .enable_history
            .then(|| Arc::new(TransitionHistory::new(config.history.clone(), scheduler.clone())));
        Machine {
            inner: Arc::new(MachineInner {
                id: Uuid::now_v7(),
                config,
                scheduler,
                states: RwLock::new(HashMap::new()),
                current: RwLock::new(None),
                observers: ObserverRegistry::new(),
                history,
                groups: RwLock::new(HashMap::new()),
                middleware: RwLock::new(Vec::new()),
                in_time_travel: AtomicBool::new(false),
                time_travel: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    // ── State registry ──

    /// Get or lazily create a state. Names must be non-empty and are
    /// unique per machine.
    pub fn add_state(&self, name: &str) -> State {
        if let Some(existing) = self.inner.state(name) {
            return existing;
        }
        let state = State::new(
            name.to_string(),
            Arc::downgrade(&self.inner),
            self.inner.config.state_manager.clone(),
            self.inner.scheduler.clone(),
        );
        self.inner
            .states
            .write()
            .unwrap()
            .insert(name.to_string(), state.clone());
        state
    }

    /// Alias of [`Machine::add_state`]: anchor for registering outgoing
    /// transitions from `name`.
    pub fn from(&self, name: &str) -> State {
        self.add_state(name)
    }

    pub fn get_state(&self, name: &str) -> Option<State> {
        self.inner.state(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.states.read().unwrap().contains_key(name)
    }

    pub fn state_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.states.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Remove a state and prune every edge pointing at it. Clears the
    /// current pointer if the removed state was current.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.inner.states.write().unwrap().remove(name);
        let Some(removed) = removed else {
            return false;
        };
        removed.cancel_all_schedules();
        for state in self.inner.states.read().unwrap().values() {
            state.remove_transitions_to(name);
        }
        if self.inner.current_name().as_deref() == Some(name) {
            self.inner.set_current(None);
        }
        true
    }

    /// Drop every state and the current pointer. History, observers and
    /// groups survive; clear those separately if needed.
    pub fn clear(&self) {
        let states: Vec<State> = self.inner.states.read().unwrap().values().cloned().collect();
        for state in states {
            state.cancel_all_schedules();
        }
        self.inner.states.write().unwrap().clear();
        self.inner.set_current(None);
    }

    // ── Transitions ──

    /// Declare an edge `from → to`, creating both states lazily. With an
    /// [`AutoTransition`], the edge also participates in evaluation.
    pub fn add_transition(&self, from: &str, to: &str, auto: Option<AutoTransition>) {
        let source = self.add_state(from);
        self.add_state(to);
        source.add_target(to);
        if let Some(auto) = auto {
            source.add_auto(auto, to);
        }
    }

    /// Move to `target`. Performs a structural check — the target must be
    /// a declared state — and refuses undeclared names via the failed
    /// path. Unlike auto-transitions, a manual call is not constrained to
    /// the current state's declared edges.
    pub async fn transition(&self, target: &str) -> Result<bool, FsmError> {
        self.inner
            .clone()
            .transition_request(target.to_string(), None, TransitionOrigin::Manual)
            .await
    }

    /// [`Machine::transition`] with a context patch applied to the target
    /// state before its enter handlers run.
    pub async fn transition_with(&self, target: &str, patch: Context) -> Result<bool, FsmError> {
        self.inner
            .clone()
            .transition_request(target.to_string(), Some(patch), TransitionOrigin::Manual)
            .await
    }

    /// Mirrors the structural check of [`Machine::transition`].
    pub fn can(&self, target: &str) -> bool {
        !target.is_empty()
            && self.has(target)
            && !self
                .inner
                .in_time_travel
                .load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Enter the configured initial state.
    pub async fn start(&self) -> Result<bool, FsmError> {
        let initial = self
            .inner
            .config
            .initial_state
            .clone()
            .ok_or(FsmError::NoInitialState)?;
        self.transition(&initial).await
    }

    /// Force the current pointer. Bypasses observers, handlers, and
    /// history — intended for tests only.
    pub fn set_state(&self, name: &str) -> Result<(), FsmError> {
        let state = self
            .inner
            .state(name)
            .ok_or_else(|| FsmError::UnknownState(name.to_string()))?;
        self.inner.set_current(Some(state));
        Ok(())
    }

    pub fn current_state(&self) -> Option<State> {
        self.inner.current_state()
    }

    pub fn current_state_name(&self) -> Option<String> {
        self.inner.current_name()
    }

    // ── Context conveniences ──

    /// Context of the current state.
    pub fn get_context(&self) -> Result<Context, FsmError> {
        self.inner
            .current_state()
            .map(|s| s.get_context())
            .ok_or(FsmError::NoCurrentState)
    }

    /// Merge a partial into the current state's context, triggering
    /// evaluation.
    pub async fn update_context(&self, partial: Context) -> Result<(), FsmError> {
        let current = self.inner.current_state().ok_or(FsmError::NoCurrentState)?;
        current.update_context(partial).await;
        Ok(())
    }

    // ── Observers & handlers ──

    pub fn observe(&self, observer: Observer) -> ObserverId {
        self.inner.observers.add(observer)
    }

    pub fn unobserve(&self, id: ObserverId) -> bool {
        self.inner.observers.remove(id)
    }

    /// Sugar for registering generic handlers on an existing state:
    /// `machine.when("ready")?.then(h).and(h2)`.
    pub fn when(&self, name: &str) -> Result<HandlerBinding, FsmError> {
        let state = self
            .inner
            .state(name)
            .ok_or_else(|| FsmError::UnknownState(name.to_string()))?;
        Ok(HandlerBinding { state })
    }

    pub fn install_middleware(&self, middleware: Arc<dyn TransitionMiddleware>) {
        self.inner.middleware.write().unwrap().push(middleware);
    }

    // ── History ──

    pub fn history(&self) -> Option<Arc<TransitionHistory>> {
        self.inner.history.clone()
    }

    // ── Groups ──

    /// Register (or replace) a group definition.
    pub fn define_group(&self, group: TransitionGroup) {
        self.inner
            .groups
            .write()
            .unwrap()
            .insert(group.name.clone(), group);
    }

    pub fn group(&self, name: &str) -> Option<TransitionGroup> {
        self.inner.groups.read().unwrap().get(name).cloned()
    }

    /// Flip a group's enabled flag. Disabled groups filter their member
    /// transitions out of evaluation. Returns false for unknown groups.
    pub fn set_group_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.inner.groups.write().unwrap().get_mut(name) {
            Some(group) => {
                group.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn serialize_group(&self, name: &str) -> Result<String, FsmError> {
        let group = self
            .group(name)
            .ok_or_else(|| FsmError::UnknownGroup(name.to_string()))?;
        Ok(group.to_json()?)
    }

    /// Rehydrate a group: register it and declare an auto-transition per
    /// edge. Conditions cannot serialize, so they are re-supplied in a map
    /// keyed `"from->to"` (see [`crate::groups::edge_key`]). A missing
    /// condition rejects the whole group.
    pub fn create_group_from_config(
        &self,
        group: TransitionGroup,
        conditions: &HashMap<String, Condition>,
    ) -> Result<(), FsmError> {
        let mut resolved: Vec<(String, String, Condition, Option<GroupConfig>)> = Vec::new();
        for edge in &group.transitions {
            let condition = conditions.get(&edge.key()).ok_or_else(|| {
                FsmError::GroupImport(format!("missing condition for edge {}", edge.key()))
            })?;
            resolved.push((
                edge.from.clone(),
                edge.to.clone(),
                condition.clone(),
                edge.config.clone(),
            ));
        }

        for (from, to, condition, edge_config) in resolved {
            let mut auto = AutoTransition::new(to.clone(), condition).group(group.name.clone());
            if let Some(cfg) = edge_config {
                auto.priority = cfg.priority;
                auto.debounce_ms = cfg.debounce;
                auto.retry = cfg.retry_config;
            }
            self.add_transition(&from, &to, Some(auto));
        }
        self.define_group(group);
        Ok(())
    }
}

/// Chaining handle returned by [`Machine::when`].
pub struct HandlerBinding {
    state: State,
}

impl HandlerBinding {
    pub fn then(self, handler: Handler) -> Self {
        self.state.add_handler(handler);
        self
    }

    pub fn and(self, handler: Handler) -> Self {
        self.state.add_handler(handler);
        self
    }
}
