//! The timer wheel (§4.4): a deadline-ordered queue a strand or scheduler polls to find
//! out which deferred callbacks have come due.
//!
//! Ties are broken by insertion order rather than by address, matching the stable
//! ordering the original implementation's skip-list-backed timer queue guarantees (see
//! `ntcs_skiplist.h`): two timers scheduled for the same instant fire in the order they
//! were scheduled. A `BTreeMap` keyed by `(deadline, sequence)` gives the same ordered,
//! O(log n) insert/remove/peek-min behavior the skip list provides, without hand-rolled
//! pointer juggling.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A handle to a scheduled timer, usable to cancel it before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerId {
    deadline: InstantKey,
    sequence: u64,
}

/// `Instant` wrapped so it can be used as a `BTreeMap` key (it's already `Ord`; this
/// just gives the wrapper a name at the call site).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct InstantKey(Instant);

enum Callback {
    Once(Box<dyn FnOnce(Instant) + Send>),
    Periodic(Arc<dyn Fn(Instant) + Send + Sync>, Duration),
}

struct ScheduledTimer {
    callback: Callback,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<TimerId, ScheduledTimer>,
}

/// The shared, lockable timer wheel. A strand or the scheduler's driver thread calls
/// [`TimerWheel::advance`] once per I/O wait to fire anything due.
pub struct TimerWheel {
    inner: Mutex<Inner>,
    next_sequence: AtomicU64,
}

impl TimerWheel {
    pub fn new() -> TimerWheel {
        TimerWheel {
            inner: Mutex::new(Inner::default()),
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Schedules `callback` to run once at `deadline`.
    pub fn schedule_at(&self, deadline: Instant, callback: impl FnOnce(Instant) + Send + 'static) -> TimerId {
        self.insert(deadline, Callback::Once(Box::new(callback)))
    }

    /// Schedules `callback` to run once after `delay` elapses.
    pub fn schedule_after(&self, delay: Duration, callback: impl FnOnce(Instant) + Send + 'static) -> TimerId {
        self.schedule_at(Instant::now() + delay, callback)
    }

    /// Schedules `callback` to run every `period`, starting at `first`. Each firing
    /// re-inserts the timer for its next occurrence until cancelled.
    pub fn schedule_periodic(
        &self,
        first: Instant,
        period: Duration,
        callback: impl Fn(Instant) + Send + Sync + 'static,
    ) -> TimerId {
        self.insert(first, Callback::Periodic(Arc::new(callback), period))
    }

    fn insert(&self, deadline: Instant, callback: Callback) -> TimerId {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let id = TimerId {
            deadline: InstantKey(deadline),
            sequence,
        };

        self.inner.lock().unwrap().entries.insert(id, ScheduledTimer { callback });
        id
    }

    /// Cancels a pending timer, including the next unfired occurrence of a periodic
    /// one. Returns `false` if it already fired (for a one-shot) or was never
    /// scheduled.
    pub fn cancel(&self, id: TimerId) -> bool {
        self.inner.lock().unwrap().entries.remove(&id).is_some()
    }

    /// Removes every pending timer without running their callbacks.
    pub fn close(&self) {
        self.inner.lock().unwrap().entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// How long until the earliest pending deadline, or `None` if the wheel is empty.
    /// A caller uses this to bound the timeout it passes to the driver's `wait`.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        let inner = self.inner.lock().unwrap();
        inner.entries.keys().next().map(|id| id.deadline.0.saturating_duration_since(now))
    }

    /// Fires every timer whose deadline is `<= now`, re-inserting periodic timers for
    /// their next occurrence. Returns the number of callbacks invoked.
    ///
    /// Periodic timers that fall behind (the system was asleep, or a previous firing
    /// took too long) are re-armed for `now + period` rather than racing to replay every
    /// missed tick.
    pub fn advance(&self, now: Instant) -> usize {
        let due = {
            let mut inner = self.inner.lock().unwrap();
            let split_key = TimerId {
                deadline: InstantKey(now + Duration::from_nanos(1)),
                sequence: 0,
            };
            let later = inner.entries.split_off(&split_key);
            std::mem::replace(&mut inner.entries, later)
        };

        let count = due.len();
        let mut rearm = Vec::new();

        for (_id, timer) in due {
            match timer.callback {
                Callback::Once(f) => f(now),
                Callback::Periodic(f, period) => {
                    f(now);
                    rearm.push((now + period, Callback::Periodic(f, period)));
                }
            }
        }

        if !rearm.is_empty() {
            let mut inner = self.inner.lock().unwrap();
            for (deadline, callback) in rearm {
                let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
                let id = TimerId { deadline: InstantKey(deadline), sequence };
                inner.entries.insert(id, ScheduledTimer { callback });
            }
        }

        count
    }
}

impl Default for TimerWheel {
    fn default() -> TimerWheel {
        TimerWheel::new()
    }
}

/// Which of a timer's events (§3 "Timer") a user callback wants delivered. Mirrors
/// `epoll::Ready`'s bitset shape rather than pulling in a `bitflags` dependency for three
/// bits.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct TimerEventMask(u8);

const DEADLINE: u8 = 0b001;
const CANCELLED: u8 = 0b010;
const CLOSED: u8 = 0b100;

impl TimerEventMask {
    pub fn none() -> TimerEventMask {
        TimerEventMask(0)
    }

    pub fn deadline() -> TimerEventMask {
        TimerEventMask(DEADLINE)
    }

    pub fn cancelled() -> TimerEventMask {
        TimerEventMask(CANCELLED)
    }

    pub fn closed() -> TimerEventMask {
        TimerEventMask(CLOSED)
    }

    pub fn all() -> TimerEventMask {
        TimerEventMask(DEADLINE | CANCELLED | CLOSED)
    }

    pub fn contains(&self, other: TimerEventMask) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for TimerEventMask {
    type Output = TimerEventMask;

    fn bitor(self, other: TimerEventMask) -> TimerEventMask {
        TimerEventMask(self.0 | other.0)
    }
}

/// An event delivered to a [`Timer`]'s callback, gated by its [`TimerEventMask`].
#[derive(Debug, Clone, Copy)]
pub enum TimerEvent {
    /// The timer's deadline arrived. `drift` is how much later than the scheduled
    /// deadline the wheel actually observed it (§4.4 "drift is reported in the event").
    Deadline { deadline: Instant, drift: Duration },
    /// `cancel()` removed a still-pending timer before it fired.
    Cancelled,
    /// `close()` released the timer permanently.
    Closed,
}

/// A user-facing handle over the wheel (§6 "Timer: schedule, cancel, close"; §3 "Timer").
///
/// Unlike the raw [`TimerWheel::schedule_at`]/`schedule_periodic` closures (which this
/// type is built on), a `Timer` tracks its own pending [`TimerId`] so `cancel`/`close` can
/// find it, applies the user's [`TimerEventMask`] to suppress events the caller didn't
/// ask for, and re-arms itself for the next occurrence of a periodic schedule — keeping
/// the drift-reporting/re-arm bookkeeping described in §4.4 out of every call site that
/// just wants "fire every 30s".
pub struct Timer {
    wheel: Arc<TimerWheel>,
    mask: TimerEventMask,
    callback: Box<dyn Fn(TimerEvent) + Send + Sync>,
    pending: Mutex<Option<TimerId>>,
    closed: std::sync::atomic::AtomicBool,
}

impl Timer {
    pub fn new(
        wheel: Arc<TimerWheel>,
        mask: TimerEventMask,
        callback: impl Fn(TimerEvent) + Send + Sync + 'static,
    ) -> Arc<Timer> {
        Arc::new(Timer {
            wheel,
            mask,
            callback: Box::new(callback),
            pending: Mutex::new(None),
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Schedules (or reschedules) a one-shot firing at `deadline`.
    pub fn schedule(self: &Arc<Timer>, deadline: Instant) {
        self.arm(deadline, None);
    }

    /// Schedules a periodic firing: first at `first`, then every `period` thereafter
    /// until `cancel`/`close`.
    pub fn schedule_periodic(self: &Arc<Timer>, first: Instant, period: Duration) {
        self.arm(first, Some(period));
    }

    fn arm(self: &Arc<Timer>, deadline: Instant, period: Option<Duration>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let weak = Arc::downgrade(self);
        let id = self.wheel.schedule_at(deadline, move |now| {
            if let Some(timer) = weak.upgrade() {
                timer.fire(deadline, now, period);
            }
        });
        *self.pending.lock().unwrap() = Some(id);
    }

    fn fire(self: &Arc<Timer>, expected: Instant, now: Instant, period: Option<Duration>) {
        *self.pending.lock().unwrap() = None;
        if self.mask.contains(TimerEventMask::deadline()) {
            let drift = now.saturating_duration_since(expected);
            (self.callback)(TimerEvent::Deadline { deadline: expected, drift });
        }
        if let Some(period) = period {
            self.arm(expected + period, Some(period));
        }
    }

    /// Removes a still-pending timer. A no-op (returns `false`) if the timer already
    /// fired, was never scheduled, or was closed — per §8 "Cancellation ... if it has
    /// already entered firing state, the cancellation is a no-op".
    pub fn cancel(&self) -> bool {
        let id = match self.pending.lock().unwrap().take() {
            Some(id) => id,
            None => return false,
        };
        let cancelled = self.wheel.cancel(id);
        if cancelled && self.mask.contains(TimerEventMask::cancelled()) {
            (self.callback)(TimerEvent::Cancelled);
        }
        cancelled
    }

    /// Cancels any pending firing and permanently disables further scheduling. Safe to
    /// call more than once; only the first call announces `closed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(id) = self.pending.lock().unwrap().take() {
            self.wheel.cancel(id);
        }
        if self.mask.contains(TimerEventMask::closed()) {
            (self.callback)(TimerEvent::Closed);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fires_timers_in_deadline_then_insertion_order() {
        let wheel = TimerWheel::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let now = Instant::now();

        for i in 0..3 {
            let order = order.clone();
            wheel.schedule_at(now, move |_| order.lock().unwrap().push(i));
        }

        let fired = wheel.advance(now);
        assert_eq!(fired, 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn cancel_prevents_firing() {
        let wheel = TimerWheel::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let now = Instant::now();

        let f = fired.clone();
        let id = wheel.schedule_at(now, move |_| { f.fetch_add(1, Ordering::SeqCst); });
        assert!(wheel.cancel(id));

        wheel.advance(now);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn next_timeout_reflects_earliest_pending_deadline() {
        let wheel = TimerWheel::new();
        let now = Instant::now();
        assert!(wheel.next_timeout(now).is_none());

        wheel.schedule_at(now + Duration::from_millis(50), |_| {});
        let remaining = wheel.next_timeout(now).unwrap();
        assert!(remaining <= Duration::from_millis(50));
    }

    #[test]
    fn advance_only_fires_due_timers() {
        let wheel = TimerWheel::new();
        let now = Instant::now();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        wheel.schedule_at(now, move |_| { f.fetch_add(1, Ordering::SeqCst); });
        let f = fired.clone();
        wheel.schedule_at(now + Duration::from_secs(60), move |_| { f.fetch_add(1, Ordering::SeqCst); });

        wheel.advance(now);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(wheel.len(), 1);
    }

    #[test]
    fn periodic_timer_rearms_after_firing() {
        let wheel = TimerWheel::new();
        let now = Instant::now();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        wheel.schedule_periodic(now, Duration::from_millis(10), move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        wheel.advance(now);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(wheel.len(), 1);

        wheel.advance(now + Duration::from_millis(10));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[derive(Default)]
    struct Counts {
        deadline: AtomicUsize,
        cancelled: AtomicUsize,
        closed: AtomicUsize,
    }

    fn counting_timer(wheel: Arc<TimerWheel>, mask: TimerEventMask) -> (Arc<Timer>, Arc<Counts>) {
        let counts = Arc::new(Counts::default());
        let recorded = counts.clone();
        let timer = Timer::new(wheel, mask, move |event| match event {
            TimerEvent::Deadline { .. } => { recorded.deadline.fetch_add(1, Ordering::SeqCst); }
            TimerEvent::Cancelled => { recorded.cancelled.fetch_add(1, Ordering::SeqCst); }
            TimerEvent::Closed => { recorded.closed.fetch_add(1, Ordering::SeqCst); }
        });
        (timer, counts)
    }

    #[test]
    fn three_timer_cancellation_scenario() {
        // Spec §8 end-to-end scenario 2: schedule three timers a second apart; cancel
        // the second right after the first fires; expect deadline-count/cancelled-count
        // exactly as the scenario describes, and all three closeable afterward.
        let wheel = Arc::new(TimerWheel::new());
        let now = Instant::now();
        let mask = TimerEventMask::all();

        let (t1, c1) = counting_timer(wheel.clone(), mask);
        let (t2, c2) = counting_timer(wheel.clone(), mask);
        let (t3, c3) = counting_timer(wheel.clone(), mask);

        t1.schedule(now + Duration::from_secs(1));
        t2.schedule(now + Duration::from_secs(2));
        t3.schedule(now + Duration::from_secs(3));

        wheel.advance(now + Duration::from_secs(1));
        assert_eq!(c1.deadline.load(Ordering::SeqCst), 1);
        assert_eq!(c2.deadline.load(Ordering::SeqCst), 0);
        assert_eq!(c3.deadline.load(Ordering::SeqCst), 0);

        assert!(t2.cancel());
        assert_eq!(c2.cancelled.load(Ordering::SeqCst), 1);

        wheel.advance(now + Duration::from_secs(3));
        assert_eq!(c1.deadline.load(Ordering::SeqCst), 1);
        assert_eq!(c2.deadline.load(Ordering::SeqCst), 0);
        assert_eq!(c3.deadline.load(Ordering::SeqCst), 1);

        t1.close();
        t2.close();
        t3.close();
        assert_eq!(c1.closed.load(Ordering::SeqCst), 1);
        assert_eq!(c2.closed.load(Ordering::SeqCst), 1);
        assert_eq!(c3.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_after_firing_is_a_no_op() {
        let wheel = Arc::new(TimerWheel::new());
        let now = Instant::now();
        let (timer, counts) = counting_timer(wheel.clone(), TimerEventMask::all());

        timer.schedule(now);
        wheel.advance(now);
        assert_eq!(counts.deadline.load(Ordering::SeqCst), 1);

        assert!(!timer.cancel());
        assert_eq!(counts.cancelled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn periodic_timer_reports_drift_and_keeps_logical_schedule() {
        let wheel = Arc::new(TimerWheel::new());
        let now = Instant::now();
        let period = Duration::from_millis(10);
        let drifts = Arc::new(Mutex::new(Vec::new()));
        let recorded = drifts.clone();

        let timer = Timer::new(wheel.clone(), TimerEventMask::deadline(), move |event| {
            if let TimerEvent::Deadline { drift, .. } = event {
                recorded.lock().unwrap().push(drift);
            }
        });
        timer.schedule_periodic(now, period);

        // First firing is exactly on time.
        wheel.advance(now);
        assert_eq!(drifts.lock().unwrap().len(), 1);
        assert_eq!(drifts.lock().unwrap()[0], Duration::ZERO);

        // Second occurrence was logically due at now+period; observe it 5ms late.
        let late = now + period + Duration::from_millis(5);
        wheel.advance(late);
        assert_eq!(drifts.lock().unwrap().len(), 2);
        assert_eq!(drifts.lock().unwrap()[1], Duration::from_millis(5));

        // The next occurrence is still scheduled off the logical deadline (now+period),
        // not off when we happened to observe the previous one (`late`).
        let next_timeout = wheel.next_timeout(late).unwrap();
        assert!(next_timeout <= period);

        timer.close();
    }

    #[test]
    fn mask_suppresses_unwanted_events() {
        let wheel = Arc::new(TimerWheel::new());
        let now = Instant::now();
        let (timer, counts) = counting_timer(wheel.clone(), TimerEventMask::deadline());

        timer.schedule(now + Duration::from_secs(1));
        assert!(timer.cancel());
        assert_eq!(counts.cancelled.load(Ordering::SeqCst), 0);

        timer.close();
        assert_eq!(counts.closed.load(Ordering::SeqCst), 0);
    }
}
