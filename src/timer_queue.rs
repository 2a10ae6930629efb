use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

use slab::Slab;

use crate::sys::timerfd::TimerFd;
use crate::timer::{Sequence, Timer, TimerCallback, TimerId};

/// Two ordered sets over the same pool of timers, plus the timerfd that
/// makes the earliest deadline a readiness source.
///
/// `primary` is a min-heap on `(deadline, key)`; popping it yields every
/// timer whose deadline has passed, cheapest-first. `active` is a
/// `(key, sequence)` set used for O(log n) cancellation lookups without
/// scanning the heap. Timers themselves live in `timers`, a `Slab` whose
/// key index doubles as the "pointer" half of a `TimerId` — see
/// `timer::TimerId`'s doc comment for why a slab is the right Rust analog
/// here.
pub struct TimerQueue {
    timers: Slab<Timer>,
    primary: BinaryHeap<Reverse<(Instant, usize)>>,
    active: HashSet<(usize, Sequence)>,
    cancelling: HashSet<(usize, Sequence)>,
    currently_firing: bool,
    timer_fd: TimerFd,
}

impl TimerQueue {
    pub fn new() -> std::io::Result<TimerQueue> {
        Ok(TimerQueue {
            timers: Slab::new(),
            primary: BinaryHeap::new(),
            active: HashSet::new(),
            cancelling: HashSet::new(),
            currently_firing: false,
            timer_fd: TimerFd::new()?,
        })
    }

    pub fn timer_fd(&self) -> &TimerFd {
        &self.timer_fd
    }

    /// The nearest deadline among all live timers, if any. Used by the
    /// `EventLoop` to derive its next poll timeout.
    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.primary.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Schedules `callback` to run at `deadline`, repeating every
    /// `interval` thereafter unless `interval` is zero. Reprograms the
    /// timerfd if this timer becomes the new earliest deadline.
    pub fn add_timer(
        &mut self,
        callback: TimerCallback,
        deadline: Instant,
        interval: Duration,
    ) -> std::io::Result<TimerId> {
        let previous_earliest = self.earliest_deadline();

        let timer = Timer::new(callback, deadline, interval);
        let sequence = timer.sequence();
        let key = self.timers.insert(timer);

        self.primary.push(Reverse((deadline, key)));
        self.active.insert((key, sequence));

        if previous_earliest.map_or(true, |earliest| deadline < earliest) {
            self.reset_timer_fd(deadline)?;
        }

        Ok(TimerId::new(key, sequence))
    }

    /// Cancels a previously scheduled timer. If it has already fired and
    /// is currently being dispatched (from inside its own callback, for
    /// a repeating timer), records it in the cancelling set instead of
    /// mutating the timer, so the dispatch loop skips its reinsertion.
    /// Idempotent: cancelling an already-cancelled or unknown handle is a
    /// no-op.
    pub fn cancel(&mut self, id: TimerId) {
        if self.active.remove(&(id.key, id.sequence)) {
            if self.timers.contains(id.key) {
                self.timers.remove(id.key);
            }
            return;
        }

        if self.currently_firing {
            self.cancelling.insert((id.key, id.sequence));
        }
    }

    /// Called when the timerfd becomes readable. Drains it and pops every
    /// expired timer's `(key, sequence, callback)`, taking the callback out
    /// of each `Timer` so the caller can run them with no lock held on
    /// whatever guards this `TimerQueue` — a callback that reschedules
    /// itself (or cancels another timer) must be able to call back into
    /// the owning `EventLoop` without re-entering that lock. Pair with
    /// `finish_expire` after running the callbacks.
    ///
    /// Marks the queue as "currently firing" for the duration between this
    /// call and the matching `finish_expire`, so a `cancel()` of one of
    /// these timers made from inside its own callback is deferred into the
    /// cancelling set instead of racing the reinsertion logic.
    pub fn begin_expire(&mut self, now: Instant) -> std::io::Result<Vec<(usize, Sequence, TimerCallback)>> {
        self.timer_fd.read()?;

        let expired = self.pop_expired(now);
        self.cancelling.clear();
        self.currently_firing = true;

        let mut taken = Vec::with_capacity(expired.len());
        for (key, sequence) in expired {
            if let Some(timer) = self.timers.get_mut(key) {
                taken.push((key, sequence, timer.take_callback()));
            }
        }
        Ok(taken)
    }

    /// Completes a `begin_expire`/run-callbacks/`finish_expire` cycle:
    /// restores each callback, reinserts repeating timers that weren't
    /// cancelled from inside their own callback during this fire, drops
    /// the rest, and reprograms the timerfd to the new earliest deadline.
    pub fn finish_expire(
        &mut self,
        expired: Vec<(usize, Sequence, TimerCallback)>,
        now: Instant,
    ) -> std::io::Result<()> {
        for (key, sequence, callback) in expired {
            if self.cancelling.contains(&(key, sequence)) {
                self.timers.remove(key);
                continue;
            }
            let timer = &mut self.timers[key];
            timer.set_callback(callback);
            if timer.is_repeating() {
                timer.restart(now);
                let new_deadline = timer.deadline();
                self.primary.push(Reverse((new_deadline, key)));
                self.active.insert((key, sequence));
            } else {
                self.timers.remove(key);
            }
        }

        self.currently_firing = false;
        self.cancelling.clear();

        if let Some(deadline) = self.earliest_deadline() {
            self.reset_timer_fd(deadline)?;
        }

        Ok(())
    }

    /// Removes and returns the `(key, sequence)` of every timer whose
    /// deadline is `<= now`, also erasing them from the active set. Stale
    /// heap entries (cancelled timers whose slab slot is already gone,
    /// or superseded entries left behind by an earlier reinsertion) are
    /// discarded rather than treated as expired.
    fn pop_expired(&mut self, now: Instant) -> Vec<(usize, Sequence)> {
        let mut expired = Vec::new();

        while let Some(&Reverse((deadline, key))) = self.primary.peek() {
            if deadline > now {
                break;
            }
            self.primary.pop();

            let Some(timer) = self.timers.get(key) else {
                continue;
            };
            if timer.deadline() != deadline {
                // Stale heap entry superseded by a later reinsertion for
                // the same key; the live entry is still in the heap.
                continue;
            }

            let sequence = timer.sequence();
            if self.active.remove(&(key, sequence)) {
                expired.push((key, sequence));
            }
        }

        expired
    }

    fn reset_timer_fd(&self, deadline: Instant) -> std::io::Result<()> {
        let now = Instant::now();
        let delay = deadline.saturating_duration_since(now).max(Duration::from_nanos(1));
        self.timer_fd.set_time(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn cancel_before_fire_prevents_callback() {
        let mut queue = TimerQueue::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();

        let id = queue
            .add_timer(
                Box::new(move || {
                    fired2.fetch_add(1, Ordering::SeqCst);
                }),
                Instant::now() + Duration::from_secs(60),
                Duration::from_secs(0),
            )
            .unwrap();

        queue.cancel(id);
        queue.cancel(id); // idempotent

        let expired = queue.pop_expired(Instant::now() + Duration::from_secs(120));
        assert!(expired.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn expired_timer_is_popped_in_deadline_order() {
        let mut queue = TimerQueue::new().unwrap();
        let now = Instant::now();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let o1 = order.clone();
        queue
            .add_timer(
                Box::new(move || o1.lock().unwrap().push('A')),
                now + Duration::from_millis(100),
                Duration::from_secs(0),
            )
            .unwrap();

        let o2 = order.clone();
        queue
            .add_timer(
                Box::new(move || o2.lock().unwrap().push('B')),
                now + Duration::from_millis(50),
                Duration::from_secs(0),
            )
            .unwrap();

        let expired = queue.pop_expired(now + Duration::from_millis(150));
        assert_eq!(expired.len(), 2);

        for (key, _) in &expired {
            queue.timers[*key].run();
        }
        assert_eq!(*order.lock().unwrap(), vec!['B', 'A']);
    }

    /// Regression test for the `Connector` retry deadlock: a one-shot
    /// timer's callback reschedules another timer on the *same* queue.
    /// `begin_expire` must have released any exclusive access before the
    /// callback runs, so this `add_timer` call (made from "inside" the
    /// firing timer, simulated here by calling it between `begin_expire`
    /// and `finish_expire`) doesn't have to contend with anything.
    #[test]
    fn callback_can_schedule_a_new_timer_on_the_same_queue() {
        let mut queue = TimerQueue::new().unwrap();
        let now = Instant::now();
        let rescheduled = Arc::new(AtomicUsize::new(0));

        queue
            .add_timer(
                Box::new(|| {}),
                now + Duration::from_millis(10),
                Duration::from_secs(0),
            )
            .unwrap();

        let mut expired = queue.begin_expire(now + Duration::from_millis(50)).unwrap();
        assert_eq!(expired.len(), 1);

        // Run the callback, then — simulating what the real callback
        // does — immediately schedule a follow-up timer on the same
        // queue while `finish_expire` hasn't run yet.
        for (_key, _seq, cb) in expired.iter_mut() {
            cb();
        }
        let rescheduled2 = rescheduled.clone();
        queue
            .add_timer(
                Box::new(move || {
                    rescheduled2.fetch_add(1, Ordering::SeqCst);
                }),
                now + Duration::from_millis(60),
                Duration::from_secs(0),
            )
            .unwrap();

        queue.finish_expire(expired, now + Duration::from_millis(50)).unwrap();

        let expired2 = queue.begin_expire(now + Duration::from_millis(200)).unwrap();
        assert_eq!(expired2.len(), 1);
        let mut expired2 = expired2;
        for (_key, _seq, cb) in expired2.iter_mut() {
            cb();
        }
        queue.finish_expire(expired2, now + Duration::from_millis(200)).unwrap();

        assert_eq!(rescheduled.load(Ordering::SeqCst), 1);
    }
}
