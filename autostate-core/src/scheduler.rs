//! Injectable time: wall clock, one-shot timers, and idle callbacks.
//!
//! The evaluation engine never reads process globals for time. Everything
//! goes through [`Scheduler`], so tests swap in [`ManualScheduler`] and
//! drive debounce, next-tick, retry and idle behavior deterministically.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::Duration;

use crate::types::{BoxFut, Timestamp};

/// A deferred unit of work. Produced once, awaited by whichever scheduler
/// implementation owns the timer.
pub type ScheduledTask = Box<dyn FnOnce() -> BoxFut<()> + Send>;

/// Opaque, comparable handle for a scheduled timer or idle callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// Time capability injected into the machine.
pub trait Scheduler: Send + Sync {
    /// Current time in milliseconds.
    fn now(&self) -> Timestamp;

    /// Run `task` once after `delay_ms`.
    fn schedule(&self, delay_ms: u64, task: ScheduledTask) -> TimerHandle;

    /// Cancel a pending timer. Unknown or already-fired handles are a no-op.
    fn cancel(&self, handle: TimerHandle);

    /// Run `task` when idle. Implementations without an idle facility
    /// degrade to `schedule(1, task)` but keep an independent handle
    /// namespace so idle cancellation never touches timers.
    fn schedule_idle(&self, task: ScheduledTask) -> TimerHandle;

    /// Cancel a pending idle callback.
    fn cancel_idle(&self, handle: TimerHandle);
}

// ─── Tokio-backed default ─────────────────────────────────────

/// Production scheduler: epoch clock, `tokio::spawn` + `sleep` timers.
pub struct TokioScheduler {
    seq: AtomicU64,
    timers: Arc<Mutex<HashMap<TimerHandle, Arc<AtomicBool>>>>,
    idles: Arc<Mutex<HashMap<TimerHandle, Arc<AtomicBool>>>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(1),
            timers: Arc::new(Mutex::new(HashMap::new())),
            idles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn next_handle(&self) -> TimerHandle {
        TimerHandle(self.seq.fetch_add(1, Ordering::Relaxed))
    }

    fn spawn_timer(
        &self,
        table: &Arc<Mutex<HashMap<TimerHandle, Arc<AtomicBool>>>>,
        delay_ms: u64,
        task: ScheduledTask,
    ) -> TimerHandle {
        let handle = self.next_handle();
        let cancelled = Arc::new(AtomicBool::new(false));
        table.lock().unwrap().insert(handle, cancelled.clone());
        let table = Arc::clone(table);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            table.lock().unwrap().remove(&handle);
            if !cancelled.load(Ordering::Acquire) {
                task().await;
            }
        });
        handle
    }

    fn cancel_in(table: &Mutex<HashMap<TimerHandle, Arc<AtomicBool>>>, handle: TimerHandle) {
        if let Some(flag) = table.lock().unwrap().remove(&handle) {
            flag.store(true, Ordering::Release);
        }
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> Timestamp {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as Timestamp
    }

    fn schedule(&self, delay_ms: u64, task: ScheduledTask) -> TimerHandle {
        self.spawn_timer(&self.timers, delay_ms, task)
    }

    fn cancel(&self, handle: TimerHandle) {
        Self::cancel_in(&self.timers, handle);
    }

    fn schedule_idle(&self, task: ScheduledTask) -> TimerHandle {
        // No ambient idle source under tokio.
        self.spawn_timer(&self.idles, 1, task)
    }

    fn cancel_idle(&self, handle: TimerHandle) {
        Self::cancel_in(&self.idles, handle);
    }
}

// ─── Manual driver ────────────────────────────────────────────

struct PendingTimer {
    handle: TimerHandle,
    due: Timestamp,
    order: u64,
    task: ScheduledTask,
}

struct PendingIdle {
    handle: TimerHandle,
    order: u64,
    task: ScheduledTask,
}

struct ManualInner {
    now: Timestamp,
    seq: u64,
    timers: Vec<PendingTimer>,
    idles: Vec<PendingIdle>,
}

/// Virtual-clock scheduler. Nothing runs until the caller advances time or
/// drains the idle queue, which makes every deferred behavior observable
/// at exact instants.
pub struct ManualScheduler {
    inner: Mutex<ManualInner>,
}

impl ManualScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ManualInner {
                now: 0,
                seq: 1,
                timers: Vec::new(),
                idles: Vec::new(),
            }),
        })
    }

    /// Advance the clock by `ms`, running every timer that falls due, in
    /// deadline order (ties by scheduling order). Tasks scheduled while
    /// advancing run too if they fall inside the window.
    pub async fn advance(&self, ms: u64) {
        let target = self.inner.lock().unwrap().now + ms;
        loop {
            let next = {
                let mut inner = self.inner.lock().unwrap();
                let due_idx = inner
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.due <= target)
                    .min_by_key(|(_, t)| (t.due, t.order))
                    .map(|(i, _)| i);
                match due_idx {
                    Some(i) => {
                        let timer = inner.timers.remove(i);
                        inner.now = inner.now.max(timer.due);
                        Some(timer.task)
                    }
                    None => {
                        inner.now = target;
                        None
                    }
                }
            };
            match next {
                Some(task) => task().await,
                None => break,
            }
        }
    }

    /// Jump straight to the earliest pending timer and run it. Returns
    /// false when no timer is pending.
    async fn fire_next(&self) -> bool {
        let next = {
            let mut inner = self.inner.lock().unwrap();
            let idx = inner
                .timers
                .iter()
                .enumerate()
                .min_by_key(|(_, t)| (t.due, t.order))
                .map(|(i, _)| i);
            idx.map(|i| {
                let timer = inner.timers.remove(i);
                inner.now = inner.now.max(timer.due);
                timer.task
            })
        };
        match next {
            Some(task) => {
                task().await;
                true
            }
            None => false,
        }
    }

    /// Drain the idle queue in scheduling order, including idle callbacks
    /// queued by the callbacks themselves.
    pub async fn run_idle(&self) {
        loop {
            let next = {
                let mut inner = self.inner.lock().unwrap();
                if inner.idles.is_empty() {
                    None
                } else {
                    let idx = inner
                        .idles
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, t)| t.order)
                        .map(|(i, _)| i)
                        .unwrap();
                    Some(inner.idles.remove(idx).task)
                }
            };
            match next {
                Some(task) => task().await,
                None => break,
            }
        }
    }

    /// Await `fut` while pumping pending timers, jumping the clock to each
    /// deadline as needed. For flows that internally wait on this
    /// scheduler (e.g. retry delays).
    pub async fn drive<T>(&self, fut: impl Future<Output = T>) -> T {
        futures::pin_mut!(fut);
        loop {
            if let Poll::Ready(value) = futures::poll!(fut.as_mut()) {
                return value;
            }
            if !self.fire_next().await {
                tokio::task::yield_now().await;
            }
        }
    }

    pub fn pending_timers(&self) -> usize {
        self.inner.lock().unwrap().timers.len()
    }

    pub fn pending_idles(&self) -> usize {
        self.inner.lock().unwrap().idles.len()
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> Timestamp {
        self.inner.lock().unwrap().now
    }

    fn schedule(&self, delay_ms: u64, task: ScheduledTask) -> TimerHandle {
        let mut inner = self.inner.lock().unwrap();
        let handle = TimerHandle(inner.seq);
        let order = inner.seq;
        inner.seq += 1;
        let due = inner.now + delay_ms;
        inner.timers.push(PendingTimer {
            handle,
            due,
            order,
            task,
        });
        handle
    }

    fn cancel(&self, handle: TimerHandle) {
        let mut inner = self.inner.lock().unwrap();
        inner.timers.retain(|t| t.handle != handle);
    }

    fn schedule_idle(&self, task: ScheduledTask) -> TimerHandle {
        let mut inner = self.inner.lock().unwrap();
        let handle = TimerHandle(inner.seq);
        let order = inner.seq;
        inner.seq += 1;
        inner.idles.push(PendingIdle {
            handle,
            order,
            task,
        });
        handle
    }

    fn cancel_idle(&self, handle: TimerHandle) {
        let mut inner = self.inner.lock().unwrap();
        inner.idles.retain(|t| t.handle != handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_task(counter: &Arc<AtomicUsize>) -> ScheduledTask {
        let counter = Arc::clone(counter);
        Box::new(move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn manual_advance_runs_due_timers_in_order() {
        let sched = ManualScheduler::new();
        let fired = Arc::new(Mutex::new(Vec::new()));

        for (delay, tag) in [(200u64, "b"), (100, "a"), (300, "c")] {
            let fired = Arc::clone(&fired);
            sched.schedule(
                delay,
                Box::new(move || {
                    Box::pin(async move {
                        fired.lock().unwrap().push(tag);
                    })
                }),
            );
        }

        sched.advance(250).await;
        assert_eq!(*fired.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(sched.now(), 250);

        sched.advance(100).await;
        assert_eq!(*fired.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn manual_cancel_prevents_firing() {
        let sched = ManualScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = sched.schedule(50, counting_task(&count));
        sched.cancel(handle);
        sched.advance(100).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn manual_clock_sits_at_deadline_while_task_runs() {
        let sched = ManualScheduler::new();
        let seen: Arc<Mutex<Vec<Timestamp>>> = Arc::new(Mutex::new(Vec::new()));

        // The outer task reads the clock at its deadline and schedules a
        // follow-up that lands inside the same advance window.
        let seen_outer = Arc::clone(&seen);
        let sched_outer = Arc::clone(&sched);
        sched.schedule(
            10,
            Box::new(move || {
                Box::pin(async move {
                    seen_outer.lock().unwrap().push(sched_outer.now());
                    let seen_inner = Arc::clone(&seen_outer);
                    let sched_inner = Arc::clone(&sched_outer);
                    sched_outer.schedule(
                        5,
                        Box::new(move || {
                            Box::pin(async move {
                                seen_inner.lock().unwrap().push(sched_inner.now());
                            })
                        }),
                    );
                })
            }),
        );

        sched.advance(20).await;
        assert_eq!(*seen.lock().unwrap(), vec![10, 15]);
        assert_eq!(sched.now(), 20);
    }

    #[tokio::test]
    async fn idle_queue_is_separate_from_timers() {
        let sched = ManualScheduler::new();
        let timers = Arc::new(AtomicUsize::new(0));
        let idles = Arc::new(AtomicUsize::new(0));

        sched.schedule(10, counting_task(&timers));
        let idle_handle = sched.schedule_idle(counting_task(&idles));
        sched.schedule_idle(counting_task(&idles));

        sched.cancel_idle(idle_handle);
        sched.advance(50).await;
        assert_eq!(timers.load(Ordering::SeqCst), 1);
        assert_eq!(idles.load(Ordering::SeqCst), 0);

        sched.run_idle().await;
        assert_eq!(idles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drive_pumps_timers_until_future_resolves() {
        let sched = ManualScheduler::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<u8>();
        sched.schedule(
            500,
            Box::new(move || {
                Box::pin(async move {
                    let _ = tx.send(7);
                })
            }),
        );
        let value = sched.drive(async move { rx.await.unwrap() }).await;
        assert_eq!(value, 7);
        assert_eq!(sched.now(), 500);
    }
}
