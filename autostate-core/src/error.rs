use thiserror::Error;

/// Structural errors surfaced synchronously to callers.
///
/// Failures originating in user code (conditions, handlers, observers,
/// listeners, middleware) are never represented here — they are caught at
/// the boundary, logged, and swallowed. `FsmError` covers the request
/// surface only: bad names, missing targets, unparseable imports.
#[derive(Debug, Error)]
pub enum FsmError {
    /// A state was named that the machine does not know about.
    #[error("unknown state: {0}")]
    UnknownState(String),

    /// `transition` was called without a target state name.
    #[error("no target state specified")]
    NoTarget,

    /// An operation that needs a current state ran before any was entered.
    #[error("machine has no current state")]
    NoCurrentState,

    /// `start` was called on a machine with no initial state configured.
    #[error("no initial state configured")]
    NoInitialState,

    /// A history import entry failed validation. Carries the index of the
    /// offending entry and what was wrong with it.
    #[error("history entry {index} is malformed: {reason}")]
    HistoryImport { index: usize, reason: String },

    /// A group config failed validation or rehydration.
    #[error("group config is malformed: {0}")]
    GroupImport(String),

    /// A group was named that the machine does not know about.
    #[error("unknown group: {0}")]
    UnknownGroup(String),

    /// Machine history is disabled but a history-backed operation was called.
    #[error("history is not enabled on this machine")]
    HistoryDisabled,

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
