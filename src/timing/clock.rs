//! Time sources the scheduler runs against.
//!
//! Both clocks share the same timer queue: a min-heap of deadlines plus a
//! table of live callbacks. Cancelling removes the callback from the table, so
//! a cancelled timer can never fire even if its deadline is already in the
//! heap for the current dispatch pass. Callbacks run with no lock held and may
//! register or cancel timers themselves.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CancelHandle(u64);

/// A monotonic clock that can run one-shot callbacks at a future offset.
///
/// Times are seconds. Deadlines that are strictly earlier fire first; equal
/// deadlines fire in registration order.
pub trait PlaybackClock: Send + Sync {
    fn now(&self) -> f64;

    /// Registers `callback` to run `delay` seconds from now. Negative delays
    /// are treated as zero.
    fn after(&self, delay: f64, callback: Callback) -> CancelHandle;

    /// Returns `true` if the callback was still pending.
    fn cancel(&self, handle: CancelHandle) -> bool;
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: f64,
    seq: u64,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Deadline {}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    // Reversed so BinaryHeap pops the earliest deadline.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .total_cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct TimerQueue {
    heap: BinaryHeap<Deadline>,
    callbacks: HashMap<u64, Callback>,
    next_seq: u64,
}

impl TimerQueue {
    fn insert(&mut self, at: f64, callback: Callback) -> CancelHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Deadline { at, seq });
        self.callbacks.insert(seq, callback);
        CancelHandle(seq)
    }

    fn cancel(&mut self, handle: CancelHandle) -> bool {
        self.callbacks.remove(&handle.0).is_some()
    }

    fn pop_due(&mut self, now: f64) -> Option<(f64, Callback)> {
        while let Some(top) = self.heap.peek().copied() {
            if top.at > now {
                return None;
            }
            self.heap.pop();
            if let Some(callback) = self.callbacks.remove(&top.seq) {
                return Some((top.at, callback));
            }
        }
        None
    }

    fn next_deadline(&mut self) -> Option<f64> {
        while let Some(top) = self.heap.peek() {
            if self.callbacks.contains_key(&top.seq) {
                return Some(top.at);
            }
            self.heap.pop();
        }
        None
    }

    fn pending(&self) -> usize {
        self.callbacks.len()
    }
}

fn clamp_delay(delay: f64) -> f64 {
    // f64::max discards NaN
    delay.max(0.0)
}

fn fire(callback: Callback) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!(%message, "timer callback panicked");
    }
}

struct ManualState {
    now: f64,
    queue: TimerQueue,
}

/// Virtual clock that only moves when told to.
#[derive(Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                now: 0.0,
                queue: TimerQueue::default(),
            })),
        }
    }

    /// Moves time forward to `target`, firing every due callback with `now()`
    /// set to that callback's deadline. Returns the number of callbacks fired.
    pub fn advance_to(&self, target: f64) -> usize {
        let mut fired = 0;
        loop {
            let next = {
                let mut state = self.state.lock();
                let due = state.queue.pop_due(target);
                if let Some((at, _)) = &due {
                    state.now = state.now.max(*at);
                }
                due
            };
            match next {
                Some((_, callback)) => {
                    fire(callback);
                    fired += 1;
                }
                None => break,
            }
        }
        let mut state = self.state.lock();
        state.now = state.now.max(target);
        fired
    }

    pub fn advance_by(&self, delta: f64) -> usize {
        let target = self.now() + clamp_delay(delta);
        self.advance_to(target)
    }

    pub fn pending(&self) -> usize {
        self.state.lock().queue.pending()
    }

    pub fn next_deadline(&self) -> Option<f64> {
        self.state.lock().queue.next_deadline()
    }
}

impl PlaybackClock for ManualClock {
    fn now(&self) -> f64 {
        self.state.lock().now
    }

    fn after(&self, delay: f64, callback: Callback) -> CancelHandle {
        let mut state = self.state.lock();
        let at = state.now + clamp_delay(delay);
        state.queue.insert(at, callback)
    }

    fn cancel(&self, handle: CancelHandle) -> bool {
        self.state.lock().queue.cancel(handle)
    }
}

/// Wall-clock time source. The owning event loop calls [`SystemClock::run_due`]
/// and sleeps until [`SystemClock::time_until_next`] in between.
#[derive(Clone)]
pub struct SystemClock {
    origin: Instant,
    queue: Arc<Mutex<TimerQueue>>,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            queue: Arc::new(Mutex::new(TimerQueue::default())),
        }
    }

    /// Fires every callback whose deadline has passed.
    pub fn run_due(&self) -> usize {
        let now = self.now();
        let mut fired = 0;
        loop {
            let next = self.queue.lock().pop_due(now);
            match next {
                Some((_, callback)) => {
                    fire(callback);
                    fired += 1;
                }
                None => break,
            }
        }
        fired
    }

    pub fn time_until_next(&self) -> Option<Duration> {
        let at = self.queue.lock().next_deadline()?;
        Some(Duration::from_secs_f64((at - self.now()).max(0.0)))
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().pending()
    }
}

impl PlaybackClock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn after(&self, delay: f64, callback: Callback) -> CancelHandle {
        let at = self.now() + clamp_delay(delay);
        self.queue.lock().insert(at, callback)
    }

    fn cancel(&self, handle: CancelHandle) -> bool {
        self.queue.lock().cancel(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Callback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let make = move |name: &'static str| -> Callback {
            let sink = sink.clone();
            Box::new(move || sink.lock().push(name))
        };
        (log, make)
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let clock = ManualClock::new();
        let (log, cb) = recorder();
        clock.after(2.0, cb("late"));
        clock.after(1.0, cb("early"));
        clock.after(1.0, cb("early-second"));

        assert_eq!(clock.advance_to(0.5), 0);
        assert_eq!(clock.advance_to(3.0), 3);
        assert_eq!(*log.lock(), ["early", "early-second", "late"]);
        assert_eq!(clock.now(), 3.0);
    }

    #[test]
    fn test_now_tracks_deadline_inside_callback() {
        let clock = ManualClock::new();
        let seen = Arc::new(Mutex::new(None));
        let (c, s) = (clock.clone(), seen.clone());
        clock.after(1.25, Box::new(move || *s.lock() = Some(c.now())));
        clock.advance_to(10.0);
        assert_eq!(*seen.lock(), Some(1.25));
    }

    #[test]
    fn test_cancelled_never_fires() {
        let clock = ManualClock::new();
        let (log, cb) = recorder();
        let handle = clock.after(1.0, cb("cancelled"));
        clock.after(1.0, cb("kept"));

        assert!(clock.cancel(handle));
        assert!(!clock.cancel(handle));
        clock.advance_to(2.0);
        assert_eq!(*log.lock(), ["kept"]);
        assert_eq!(clock.pending(), 0);
    }

    #[test]
    fn test_cancel_from_sibling_in_same_pass() {
        let clock = ManualClock::new();
        let (log, cb) = recorder();
        let victim = Arc::new(Mutex::new(None));

        let (c, v) = (clock.clone(), victim.clone());
        clock.after(1.0, Box::new(move || {
            if let Some(handle) = v.lock().take() {
                c.cancel(handle);
            }
        }));
        *victim.lock() = Some(clock.after(1.0, cb("victim")));

        clock.advance_to(1.0);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_reentrant_scheduling() {
        let clock = ManualClock::new();
        let (log, cb) = recorder();
        let inner = cb("inner");
        let c = clock.clone();
        clock.after(1.0, Box::new(move || {
            c.after(0.5, inner);
        }));
        assert_eq!(clock.advance_to(2.0), 2);
        assert_eq!(*log.lock(), ["inner"]);
    }

    #[test]
    fn test_negative_delay_is_immediate() {
        let clock = ManualClock::new();
        let (log, cb) = recorder();
        clock.advance_to(5.0);
        clock.after(-3.0, cb("now"));
        assert_eq!(clock.next_deadline(), Some(5.0));
        clock.advance_by(0.0);
        assert_eq!(*log.lock(), ["now"]);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let clock = ManualClock::new();
        let (log, cb) = recorder();
        clock.after(1.0, Box::new(|| panic!("boom")));
        clock.after(1.0, cb("survivor"));
        assert_eq!(clock.advance_to(1.0), 2);
        assert_eq!(*log.lock(), ["survivor"]);
    }

    #[test]
    fn test_system_clock_runs_due() {
        let clock = SystemClock::new();
        let (log, cb) = recorder();
        clock.after(0.0, cb("due"));
        let far = clock.after(3600.0, cb("far"));

        assert_eq!(clock.run_due(), 1);
        assert_eq!(*log.lock(), ["due"]);
        assert!(clock.time_until_next().is_some());
        assert!(clock.cancel(far));
        assert_eq!(clock.time_until_next(), None);
    }
}
