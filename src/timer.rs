use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

static NUM_CREATED: AtomicI64 = AtomicI64::new(0);

/// A process-global monotonically increasing sequence, assigned to every
/// `Timer` at construction. Cancellation handles carry `(deadline, seq)`
/// so a freed-and-reused slot in the active set can't be cancelled by a
/// stale handle.
pub type Sequence = i64;

pub type TimerCallback = Box<dyn FnMut() + Send>;

/// A scheduled callback: an absolute deadline, an optional repeat
/// interval (zero means one-shot), and the callback itself.
///
/// `callback` is an `Option` so the `TimerQueue` can temporarily take
/// ownership of it while the timer fires — the callback runs with no
/// lock held on the queue (see `TimerQueue::begin_expire`/`finish_expire`),
/// since a callback that reschedules itself (the `Connector`'s retry
/// timer is the motivating case) must be able to call back into the
/// queue without re-entering its own lock.
pub struct Timer {
    callback: Option<TimerCallback>,
    deadline: Instant,
    interval: Duration,
    repeating: bool,
    sequence: Sequence,
}

impl Timer {
    pub fn new(callback: TimerCallback, deadline: Instant, interval: Duration) -> Timer {
        let sequence = NUM_CREATED.fetch_add(1, Ordering::Relaxed);
        Timer {
            callback: Some(callback),
            deadline,
            interval,
            repeating: interval > Duration::from_secs(0),
            sequence,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    pub fn is_repeating(&self) -> bool {
        self.repeating
    }

    pub fn run(&mut self) {
        if let Some(cb) = self.callback.as_mut() {
            cb()
        }
    }

    /// Removes and returns the callback, leaving the timer's other
    /// fields (deadline, sequence, slab slot) untouched so its `TimerId`
    /// stays valid across the fire.
    pub fn take_callback(&mut self) -> TimerCallback {
        self.callback
            .take()
            .expect("timer callback taken twice before being restored")
    }

    pub fn set_callback(&mut self, callback: TimerCallback) {
        self.callback = Some(callback);
    }

    /// Recomputes `deadline` as `now + interval`. Only meaningful for a
    /// repeating timer; called after it fires and is about to be
    /// reinserted.
    pub fn restart(&mut self, now: Instant) {
        if self.repeating {
            self.deadline = now + self.interval;
        } else {
            self.deadline = now;
        }
    }
}

/// An opaque, cancellable reference to a scheduled timer.
///
/// `key` is the timer's slot in the owning `TimerQueue`'s slab — the
/// Rust analog of a raw timer pointer in a "(pointer, sequence)"
/// cancellation pair. Slab slots are reused after removal exactly the
/// way a freed C++ object's address can be reused by the allocator, so
/// `sequence` is carried alongside it to detect a stale handle pointing
/// at a slot that has since been recycled for a different timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId {
    pub(crate) key: usize,
    pub(crate) sequence: Sequence,
}

impl TimerId {
    pub(crate) fn new(key: usize, sequence: Sequence) -> TimerId {
        TimerId { key, sequence }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_increases_across_timers() {
        let now = Instant::now();
        let a = Timer::new(Box::new(|| {}), now, Duration::from_secs(0));
        let b = Timer::new(Box::new(|| {}), now, Duration::from_secs(0));
        assert!(b.sequence() > a.sequence());
    }

    #[test]
    fn restart_advances_repeating_timer_by_interval() {
        let now = Instant::now();
        let mut timer = Timer::new(Box::new(|| {}), now, Duration::from_millis(50));
        let first_deadline = timer.deadline();
        timer.restart(now + Duration::from_millis(50));
        assert!(timer.deadline() > first_deadline);
    }

    #[test]
    fn one_shot_is_not_repeating() {
        let now = Instant::now();
        let timer = Timer::new(Box::new(|| {}), now, Duration::from_secs(0));
        assert!(!timer.is_repeating());
    }
}
