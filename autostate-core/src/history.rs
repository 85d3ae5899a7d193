//! Bounded, newest-first log of transition attempts.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FsmError;
use crate::scheduler::Scheduler;
use crate::types::{Context, HistoryOptions, Timestamp};

/// One recorded transition attempt. Newest entries sit at index 0.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Source state; `None` (JSON `null`) for the initial entry.
    pub from: Option<String>,
    pub to: String,
    pub timestamp: Timestamp,
    pub success: bool,
    /// Absent (not `null`) when context capture is disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, Value>>,
}

/// Inputs to [`TransitionHistory::record`]. The timestamp comes from the
/// history's clock, not the caller.
#[derive(Clone, Debug, Default)]
pub struct RecordArgs {
    pub from: Option<String>,
    pub to: String,
    pub context: Option<Context>,
    pub success: bool,
    pub group: Option<String>,
    pub metadata: Option<serde_json::Map<String, Value>>,
}

/// Options for [`TransitionHistory::to_json`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SerializeOptions {
    /// Re-apply the configured context filter to each entry's context at
    /// serialization time.
    pub apply_context_filter: bool,
}

/// Bounded newest-first ring of [`TransitionRecord`]s.
pub struct TransitionHistory {
    options: HistoryOptions,
    clock: Arc<dyn Scheduler>,
    entries: Mutex<VecDeque<TransitionRecord>>,
}

impl TransitionHistory {
    pub fn new(options: HistoryOptions, clock: Arc<dyn Scheduler>) -> Self {
        Self {
            options,
            clock,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Record an attempt. Applies the context filter, stamps the time,
    /// inserts at the front, and trims the tail to `max_size`.
    pub fn record(&self, args: RecordArgs) {
        let context = if self.options.include_context {
            args.context.map(|ctx| match &self.options.context_filter {
                Some(filter) => filter(&ctx),
                None => ctx,
            })
        } else {
            None
        };
        let record = TransitionRecord {
            from: args.from,
            to: args.to,
            timestamp: self.clock.now(),
            success: args.success,
            context,
            group: args.group,
            metadata: args.metadata,
        };
        let mut entries = self.entries.lock().unwrap();
        entries.push_front(record);
        entries.truncate(self.options.max_size);
    }

    pub fn last(&self) -> Option<TransitionRecord> {
        self.entries.lock().unwrap().front().cloned()
    }

    pub fn get(&self, index: usize) -> Option<TransitionRecord> {
        self.entries.lock().unwrap().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Snapshot, newest first.
    pub fn entries(&self) -> Vec<TransitionRecord> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    /// Entries touching `name` as source and/or target.
    pub fn for_state(&self, name: &str, as_source: bool, as_target: bool) -> Vec<TransitionRecord> {
        self.filter(|e| {
            (as_source && e.from.as_deref() == Some(name)) || (as_target && e.to == name)
        })
    }

    pub fn for_group(&self, group: &str) -> Vec<TransitionRecord> {
        self.filter(|e| e.group.as_deref() == Some(group))
    }

    pub fn successful(&self) -> Vec<TransitionRecord> {
        self.filter(|e| e.success)
    }

    pub fn failed(&self) -> Vec<TransitionRecord> {
        self.filter(|e| !e.success)
    }

    /// Entries with `t0 <= timestamp <= t1`.
    pub fn in_range(&self, t0: Timestamp, t1: Timestamp) -> Vec<TransitionRecord> {
        self.filter(|e| e.timestamp >= t0 && e.timestamp <= t1)
    }

    pub fn filter<F>(&self, f: F) -> Vec<TransitionRecord>
    where
        F: Fn(&TransitionRecord) -> bool,
    {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| f(e))
            .cloned()
            .collect()
    }

    /// True iff the log contains, in chronological order, a contiguous run
    /// of entries whose `to` values spell `sequence[1..]` and whose first
    /// entry's `from` equals `sequence[0]`.
    pub fn has_path(&self, sequence: &[&str]) -> bool {
        if sequence.len() < 2 {
            return false;
        }
        let entries = self.entries.lock().unwrap();
        let chrono: Vec<&TransitionRecord> = entries.iter().rev().collect();
        let need = sequence.len() - 1;
        if chrono.len() < need {
            return false;
        }
        for start in 0..=(chrono.len() - need) {
            let head = chrono[start];
            if head.from.as_deref() != Some(sequence[0]) {
                continue;
            }
            if (0..need).all(|j| chrono[start + j].to == sequence[j + 1]) {
                return true;
            }
        }
        false
    }

    /// States by visit count (as target or as source), descending, capped
    /// at `limit`. Ties break by name for determinism.
    pub fn most_frequent_states(&self, as_target: bool, limit: usize) -> Vec<(String, usize)> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for entry in self.entries.lock().unwrap().iter() {
            let name = if as_target {
                Some(entry.to.clone())
            } else {
                entry.from.clone()
            };
            if let Some(name) = name {
                *counts.entry(name).or_insert(0) += 1;
            }
        }
        let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);
        ranked
    }

    /// `(from, to)` pairs by occurrence count, descending, capped at
    /// `limit`. The initial entry counts under a `None` source.
    pub fn most_frequent_transitions(
        &self,
        limit: usize,
    ) -> Vec<((Option<String>, String), usize)> {
        let mut counts: HashMap<(Option<String>, String), usize> = HashMap::new();
        for entry in self.entries.lock().unwrap().iter() {
            *counts
                .entry((entry.from.clone(), entry.to.clone()))
                .or_insert(0) += 1;
        }
        let mut ranked: Vec<((Option<String>, String), usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| a.0 .0.cmp(&b.0 .0))
                .then_with(|| a.0 .1.cmp(&b.0 .1))
        });
        ranked.truncate(limit);
        ranked
    }

    pub fn to_json(&self, opts: SerializeOptions) -> Result<String, FsmError> {
        let mut snapshot = self.entries();
        if opts.apply_context_filter {
            if let Some(filter) = &self.options.context_filter {
                for entry in &mut snapshot {
                    if let Some(ctx) = &entry.context {
                        entry.context = Some(filter(ctx));
                    }
                }
            }
        }
        Ok(serde_json::to_string(&snapshot)?)
    }

    /// Import entries. `append = false` replaces the current contents;
    /// `append = true` adds the imported entries behind the existing ones
    /// (they are treated as older history). The ring is trimmed to
    /// `max_size` afterwards.
    ///
    /// Every entry is validated before anything is mutated; a malformed
    /// entry rejects the whole import with its index.
    pub fn from_json(&self, text: &str, append: bool) -> Result<(), FsmError> {
        let raw: Vec<Value> = serde_json::from_str(text)?;
        let mut imported = Vec::with_capacity(raw.len());
        for (index, value) in raw.iter().enumerate() {
            imported.push(validate_entry(index, value)?);
        }
        let mut entries = self.entries.lock().unwrap();
        if !append {
            entries.clear();
        }
        entries.extend(imported);
        entries.truncate(self.options.max_size);
        Ok(())
    }
}

fn validate_entry(index: usize, value: &Value) -> Result<TransitionRecord, FsmError> {
    let bad = |reason: &str| FsmError::HistoryImport {
        index,
        reason: reason.to_string(),
    };

    let obj = value.as_object().ok_or_else(|| bad("entry is not an object"))?;

    let to = obj
        .get("to")
        .and_then(Value::as_str)
        .ok_or_else(|| bad("`to` is not a string"))?
        .to_string();

    let from = match obj.get("from") {
        Some(Value::Null) | None => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(bad("`from` is not a string or null")),
    };

    let timestamp = match obj.get("timestamp") {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && *f >= 0.0)
                    .map(|f| f as Timestamp)
            })
            .ok_or_else(|| bad("`timestamp` is not a non-negative finite number"))?,
        _ => return Err(bad("`timestamp` is not a finite number")),
    };

    let success = obj
        .get("success")
        .and_then(Value::as_bool)
        .ok_or_else(|| bad("`success` is not a boolean"))?;

    let group = match obj.get("group") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Null) | None => None,
        Some(_) => return Err(bad("`group` is not a string")),
    };

    let metadata = match obj.get("metadata") {
        Some(Value::Object(map)) => Some(map.clone()),
        Some(Value::Null) | None => None,
        Some(_) => return Err(bad("`metadata` is not an object")),
    };

    Ok(TransitionRecord {
        from,
        to,
        timestamp,
        success,
        context: obj.get("context").cloned(),
        group,
        metadata,
    })
}
