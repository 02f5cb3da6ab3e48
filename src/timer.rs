//! Ordered timer set backed by a monotonic timer descriptor.
//!
//! The primary set orders timers by `(expiration, sequence)`; the active
//! index maps a timer's sequence back to its expiration so cancellation
//! does not scan. Every live timer appears in both. A timer cancelled
//! while its callback is running is recorded so a repeating timer cannot
//! resurrect itself.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::TzzeroResult;
use crate::sys;

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;
pub type TimerId = u64;

static NUM_CREATED: AtomicU64 = AtomicU64::new(0);

pub struct Timer {
    expiration: Instant,
    interval: Option<Duration>,
    sequence: u64,
    callback: TimerCallback,
}

impl Timer {
    fn new(expiration: Instant, interval: Option<Duration>, callback: TimerCallback) -> Self {
        Timer {
            expiration,
            interval,
            sequence: NUM_CREATED.fetch_add(1, Ordering::Relaxed) + 1,
            callback,
        }
    }

    pub fn run(&self) {
        (self.callback)();
    }

    pub fn repeat(&self) -> bool {
        self.interval.is_some()
    }

    pub fn sequence(&self) -> TimerId {
        self.sequence
    }

    fn restart(&mut self, now: Instant) {
        if let Some(interval) = self.interval {
            self.expiration = now + interval;
        }
    }
}

pub struct TimerQueue {
    timer_fd: RawFd,
    timers: BTreeMap<(Instant, u64), Timer>,
    active: HashMap<TimerId, Instant>,
    firing: HashSet<TimerId>,
    cancelled_while_firing: HashSet<TimerId>,
}

impl TimerQueue {
    pub fn new() -> TzzeroResult<Self> {
        Ok(TimerQueue {
            timer_fd: sys::create_timerfd()?,
            timers: BTreeMap::new(),
            active: HashMap::new(),
            firing: HashSet::new(),
            cancelled_while_firing: HashSet::new(),
        })
    }

    /// The backing descriptor; the owning loop registers it for READ.
    pub fn timer_fd(&self) -> RawFd {
        self.timer_fd
    }

    /// Drain the descriptor after it fires.
    pub fn handle_read(&self) {
        sys::read_timerfd(self.timer_fd);
    }

    pub fn add_timer(
        &mut self,
        delay: Duration,
        interval: Option<Duration>,
        callback: TimerCallback,
    ) -> TimerId {
        let now = Instant::now();
        let timer = Timer::new(now + delay, interval, callback);
        let id = timer.sequence;

        let earliest_changed = self
            .timers
            .first_key_value()
            .map_or(true, |((when, _), _)| timer.expiration < *when);

        self.active.insert(id, timer.expiration);
        self.timers.insert((timer.expiration, id), timer);

        if earliest_changed {
            sys::arm_timerfd(self.timer_fd, delay);
        }

        id
    }

    pub fn cancel(&mut self, id: TimerId) {
        if let Some(when) = self.active.remove(&id) {
            self.timers.remove(&(when, id));
        } else if self.firing.contains(&id) {
            self.cancelled_while_firing.insert(id);
        }
    }

    /// Milliseconds until the earliest timer, clamped at zero; -1 when
    /// the set is empty (poll without timeout).
    pub fn next_timeout_ms(&self) -> i32 {
        match self.timers.first_key_value() {
            None => -1,
            Some(((when, _), _)) => {
                let delta = when.saturating_duration_since(Instant::now());
                delta.as_millis().min(i32::MAX as u128) as i32
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Remove and return every timer due at `now`. The returned timers
    /// are marked as firing until `restart_expired` is called.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Timer> {
        self.cancelled_while_firing.clear();

        let remaining = self.timers.split_off(&(now, u64::MAX));
        let expired = std::mem::replace(&mut self.timers, remaining);

        let mut out = Vec::with_capacity(expired.len());
        for (_, timer) in expired {
            self.active.remove(&timer.sequence);
            self.firing.insert(timer.sequence);
            out.push(timer);
        }
        out
    }

    /// Reinsert repeating timers that were not cancelled from their own
    /// callback, then re-arm the descriptor to the new earliest.
    pub fn restart_expired(&mut self, expired: Vec<Timer>, now: Instant) {
        for mut timer in expired {
            if timer.repeat() && !self.cancelled_while_firing.contains(&timer.sequence) {
                timer.restart(now);
                self.active.insert(timer.sequence, timer.expiration);
                self.timers.insert((timer.expiration, timer.sequence), timer);
            }
        }

        self.firing.clear();
        self.cancelled_while_firing.clear();

        if let Some(((when, _), _)) = self.timers.first_key_value() {
            sys::arm_timerfd(self.timer_fd, when.saturating_duration_since(Instant::now()));
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        sys::close_fd(self.timer_fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn noop() -> TimerCallback {
        Arc::new(|| {})
    }

    #[test]
    fn expired_partition_respects_order() {
        let mut queue = TimerQueue::new().unwrap();
        let early = queue.add_timer(Duration::ZERO, None, noop());
        let late = queue.add_timer(Duration::from_secs(3600), None, noop());

        let expired = queue.take_expired(Instant::now() + Duration::from_millis(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].sequence(), early);

        queue.restart_expired(expired, Instant::now());
        assert!(!queue.is_empty());
        queue.cancel(late);
        assert!(queue.is_empty());
    }

    #[test]
    fn one_shot_is_destroyed_after_firing() {
        let mut queue = TimerQueue::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let count_cb = Arc::clone(&count);
        queue.add_timer(
            Duration::ZERO,
            None,
            Arc::new(move || {
                count_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let now = Instant::now() + Duration::from_millis(1);
        let expired = queue.take_expired(now);
        for t in &expired {
            t.run();
        }
        queue.restart_expired(expired, now);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
        assert_eq!(queue.next_timeout_ms(), -1);
    }

    #[test]
    fn repeating_timer_is_reinserted() {
        let mut queue = TimerQueue::new().unwrap();
        queue.add_timer(Duration::ZERO, Some(Duration::from_millis(50)), noop());

        let now = Instant::now() + Duration::from_millis(1);
        let expired = queue.take_expired(now);
        assert_eq!(expired.len(), 1);
        queue.restart_expired(expired, now);
        assert!(!queue.is_empty());
    }

    #[test]
    fn cancel_while_firing_suppresses_reinsertion() {
        let mut queue = TimerQueue::new().unwrap();
        let id = queue.add_timer(Duration::ZERO, Some(Duration::from_millis(50)), noop());

        let now = Instant::now() + Duration::from_millis(1);
        let expired = queue.take_expired(now);
        // Cancellation arrives while the callback is running.
        queue.cancel(id);
        queue.restart_expired(expired, now);
        assert!(queue.is_empty());
    }

    #[test]
    fn cancel_unknown_id_is_harmless() {
        let mut queue = TimerQueue::new().unwrap();
        queue.cancel(9999);
        assert!(queue.is_empty());
    }
}
