//! Finite state machines with conditional, context-driven
//! auto-transitions.
//!
//! A machine owns named states; each state owns an opaque JSON context and
//! a list of condition-gated transitions. Mutating a state's context
//! re-evaluates its transitions under priority, debounce, watch-property
//! and skip-condition policies; the first condition that holds moves the
//! machine, firing lifecycle observers (the `before` channel may veto) and
//! optionally recording the hop in a bounded history ring that also powers
//! time travel.
//!
//! Time is injected: the default [`TokioScheduler`] runs on tokio timers,
//! while [`ManualScheduler`] gives tests a virtual clock.
//!
//! ```no_run
//! use autostate_core::{condition, AutoTransition, Machine, MachineConfig};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), autostate_core::FsmError> {
//! let machine = Machine::new(MachineConfig::with_initial("idle"));
//! machine.add_transition(
//!     "idle",
//!     "active",
//!     Some(AutoTransition::new(
//!         "active",
//!         condition(|ctx| ctx["value"].as_i64().unwrap_or(0) > 5),
//!     )),
//! );
//! machine.start().await?;
//! machine.update_context(json!({"value": 10})).await?;
//! assert_eq!(machine.current_state_name().as_deref(), Some("active"));
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod groups;
pub mod history;
pub mod machine;
pub mod observers;
mod paths;
pub mod scheduler;
pub mod state;
pub mod state_manager;
pub mod time_travel;
pub mod types;

pub use error::FsmError;
pub use groups::{edge_key, GroupConfig, GroupEdge, TransitionGroup};
pub use history::{RecordArgs, SerializeOptions, TransitionHistory, TransitionRecord};
pub use machine::{HandlerBinding, Machine, TransitionMiddleware};
pub use observers::{Observer, ObserverId};
pub use scheduler::{ManualScheduler, ScheduledTask, Scheduler, TimerHandle, TokioScheduler};
pub use state::{BatchUpdateOptions, State};
pub use state_manager::{StateManager, SubscriptionId};
pub use time_travel::{context_diff, ContextDiff, TimeTravel, ValueChange};
pub use types::{
    condition, handler, shallow_equal, shallow_merge, try_condition, AutoTransition, BoxFut,
    Condition, Context, ContextFilter, ContextListener, EqualityFn, EvalPolicy, EvalStrategy,
    Handler, HandlerArgs, HistoryOptions, MachineConfig, MetricEvent, MetricsSink, RetryPolicy,
    SkipPredicate, StateManagerConfig, Timestamp,
};
