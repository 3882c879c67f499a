/// Trailing-edge debouncer for progress notifications.
///
/// `debounce()` marks the state dirty and (re)starts a timer; the callback
/// fires once the timer runs out without another `debounce()` call.
/// `flush()` cancels the timer and fires immediately if anything changed
/// since the last delivery. Callers keep their aggregate state elsewhere
/// and read it from inside the callback, so only the latest state is ever
/// reported.
///
/// Every call site follows the same lifecycle: create at operation start,
/// `debounce()` on each internal update, `flush()` once when the operation
/// finishes (or `cancel()` when it was aborted).
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
pub struct Debouncer {
    inner: Arc<Inner>,
}

struct Inner {
    interval: Duration,
    /// Upper bound between the first undelivered `debounce()` and the
    /// callback, so continuous input cannot starve the observer.
    max_wait: Option<Duration>,
    callback: Callback,
    state: Mutex<State>,
    /// Held for the whole callback run. Taken before `state`, never after.
    delivery: Mutex<()>,
}

#[derive(Default)]
struct State {
    dirty: bool,
    first_pending: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
    closed: bool,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn delivering(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Timer expiry. Stale timers (superseded by a later `debounce()`)
    /// see a different generation and do nothing.
    fn expire(&self, generation: u64) {
        let _delivery = self.delivering();
        {
            let mut state = self.lock();
            if state.generation != generation || state.closed || !state.dirty {
                return;
            }
            state.dirty = false;
            state.first_pending = None;
            state.timer = None;
        }
        (self.callback)();
    }
}

impl Debouncer {
    pub fn new<F>(interval: Duration, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::build(interval, None, Arc::new(callback))
    }

    /// Like [`new`](Self::new), but a pending callback fires at the latest
    /// `max_wait` after the first undelivered `debounce()`.
    pub fn with_max_wait<F>(interval: Duration, max_wait: Duration, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::build(interval, Some(max_wait.max(interval)), Arc::new(callback))
    }

    fn build(interval: Duration, max_wait: Option<Duration>, callback: Callback) -> Self {
        Self {
            inner: Arc::new(Inner {
                interval,
                max_wait,
                callback,
                state: Mutex::new(State::default()),
                delivery: Mutex::new(()),
            }),
        }
    }

    /// Records a state change and restarts the quiet-period timer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn debounce(&self) {
        let mut state = self.inner.lock();
        if state.closed {
            return;
        }
        state.dirty = true;

        let now = Instant::now();
        let first = *state.first_pending.get_or_insert(now);
        let mut delay = self.inner.interval;
        if let Some(max_wait) = self.inner.max_wait {
            delay = delay.min((first + max_wait).saturating_duration_since(now));
        }

        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.generation += 1;
        let generation = state.generation;
        let inner = Arc::clone(&self.inner);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.expire(generation);
        }));
    }

    /// Cancels any pending timer and delivers synchronously if at least one
    /// `debounce()` happened since the last delivery. A no-op otherwise.
    pub fn flush(&self) {
        let _delivery = self.inner.delivering();
        let fire = {
            let mut state = self.inner.lock();
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.first_pending = None;
            std::mem::take(&mut state.dirty) && !state.closed
        };
        if fire {
            (self.inner.callback)();
        }
    }

    /// Drops any pending delivery and ignores every later `debounce()` and
    /// `flush()`. Used when the underlying operation was cancelled.
    ///
    /// Waits for a callback already in progress, so none runs once this
    /// returns. Must not be called from inside the callback.
    pub fn cancel(&self) {
        {
            let mut state = self.inner.lock();
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.dirty = false;
            state.first_pending = None;
            state.closed = true;
        }
        drop(self.inner.delivering());
    }
}
