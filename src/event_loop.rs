use std::collections::{HashMap, HashSet};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::backend::{self, Backend};
use crate::channel::{Channel, SharedChannel};
use crate::ready::Ready;
use crate::timer::TimerId;
use crate::timer_queue::TimerQueue;
use crate::token::Token;
use crate::wakeup::Wakeup;

type Functor = Box<dyn FnOnce() + Send + 'static>;

/// Everything a non-owner thread is allowed to touch: the quit flag, the
/// pending-functors queue and its own mutex, the wakeup fd, and the
/// thread id recorded at construction. Kept apart from `Inner` so that a
/// callback running during dispatch can call `queue_in_loop` without
/// trying to re-lock the mutex the dispatch loop is itself holding.
struct Shared {
    owner_thread: ThreadId,
    quit: AtomicBool,
    calling_pending_functors: AtomicBool,
    pending_functors: Mutex<Vec<Functor>>,
    wakeup: Wakeup,
}

/// State that must only ever be touched on the owner thread. Guarded by a
/// mutex anyway (not `RefCell`) purely so `EventLoop` can be `Send` and
/// handed to other threads for the handful of operations that are safe
/// from anywhere (see `Shared`); in practice the lock is never contended,
/// the same single-writer idiom `Channel` itself relies on.
struct Inner {
    backend: Box<dyn Backend>,
    backend_fds: HashSet<RawFd>,
    channels: HashMap<Token, SharedChannel>,
    next_token: usize,
    timer_queue: TimerQueue,
    active_events: Vec<(Token, Ready)>,
    default_timeout: Duration,
}

impl Inner {
    fn next_timeout(&self) -> Duration {
        const MAX_TIMEOUT: Duration = Duration::from_secs(35 * 60);
        match self.timer_queue.earliest_deadline() {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(MAX_TIMEOUT),
            None => self.default_timeout,
        }
    }
}

/// The owner-thread event-dispatch engine: poll the readiness backend,
/// dispatch every channel that fired, then run queued cross-thread work,
/// repeat until `quit()`.
///
/// Cheaply `Clone`-able — every clone shares the same backend, channel
/// table and timer queue via `Arc`. Components (`TcpConnection`,
/// `Acceptor`, `Connector`) hold a clone as their "owning loop" reference
/// instead of a borrow, which is what lets `TcpConnection::send` and
/// `EventLoop::{run_in_loop, queue_in_loop, wakeup, cancel, quit}` be
/// called from any thread while every other method asserts it is running
/// on the owner thread.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<Shared>,
    inner: Arc<Mutex<Inner>>,
}

impl EventLoop {
    pub fn new() -> io::Result<EventLoop> {
        let backend = backend::choose()?;
        let timer_queue = TimerQueue::new()?;
        let wakeup = Wakeup::new()?;

        let shared = Arc::new(Shared {
            owner_thread: thread::current().id(),
            quit: AtomicBool::new(false),
            calling_pending_functors: AtomicBool::new(false),
            pending_functors: Mutex::new(Vec::new()),
            wakeup,
        });

        let inner = Arc::new(Mutex::new(Inner {
            backend,
            backend_fds: HashSet::new(),
            channels: HashMap::new(),
            next_token: 0,
            timer_queue,
            active_events: Vec::with_capacity(64),
            default_timeout: Duration::from_secs(10),
        }));

        let event_loop = EventLoop { shared, inner };
        event_loop.register_wakeup_channel()?;
        event_loop.register_timer_channel()?;
        Ok(event_loop)
    }

    fn register_wakeup_channel(&self) -> io::Result<()> {
        let fd = self.shared.wakeup.event_fd().as_raw_fd();
        let channel = Channel::new(fd);
        let shared = self.shared.clone();
        {
            let mut ch = channel.lock().unwrap();
            ch.set_read_callback(move |_now| {
                if let Err(e) = shared.wakeup.drain() {
                    log::warn!("failed to drain wakeup fd: {}", e);
                }
            });
            ch.enable_reading();
        }
        self.register_channel(channel);
        Ok(())
    }

    fn register_timer_channel(&self) -> io::Result<()> {
        let fd = {
            let inner = self.inner.lock().unwrap();
            inner.timer_queue.timer_fd().as_raw_fd()
        };
        let channel = Channel::new(fd);
        let inner = self.inner.clone();
        {
            let mut ch = channel.lock().unwrap();
            ch.set_read_callback(move |now| {
                // `begin_expire`/`finish_expire` bracket the actual
                // callback invocations below: the `Inner` lock is held
                // only for the bookkeeping on either side, never while a
                // timer callback runs. A callback that reschedules itself
                // (`Connector`'s retry timer) calls back into
                // `EventLoop::run_after`/`cancel`, which need this same
                // lock — holding it across the callback would deadlock.
                let expired = {
                    let mut inner = inner.lock().unwrap();
                    match inner.timer_queue.begin_expire(now) {
                        Ok(expired) => expired,
                        Err(e) => {
                            log::warn!("timer queue expiration read failed: {}", e);
                            return;
                        }
                    }
                };

                let mut expired = expired;
                for (_key, _sequence, callback) in expired.iter_mut() {
                    callback();
                }

                let mut inner = inner.lock().unwrap();
                if let Err(e) = inner.timer_queue.finish_expire(expired, now) {
                    log::warn!("timer queue reinsertion failed: {}", e);
                }
            });
            ch.enable_reading();
        }
        self.register_channel(channel);
        Ok(())
    }

    /// True if called from the thread that constructed this loop.
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.owner_thread
    }

    /// Panics in debug builds, logs and continues in release — an
    /// off-owner-thread mutation is a programmer error, not something to
    /// silently tolerate in development.
    fn assert_in_loop_thread(&self) {
        if self.is_in_loop_thread() {
            return;
        }
        if cfg!(debug_assertions) {
            panic!(
                "EventLoop operation attempted from thread {:?}, but this loop is owned by {:?}",
                thread::current().id(),
                self.shared.owner_thread
            );
        }
        log::error!(
            "EventLoop operation attempted from non-owner thread {:?} (owner {:?}); ignoring",
            thread::current().id(),
            self.shared.owner_thread
        );
    }

    /// Sets the poll timeout used when no timer is pending. Owner-thread
    /// only; call right after construction (`poll_timeout_ms` in
    /// `TcpServerConfig`/`ConnectorConfig`).
    pub fn set_default_timeout(&self, timeout: Duration) {
        self.assert_in_loop_thread();
        self.inner.lock().unwrap().default_timeout = timeout;
    }

    /// Registers `channel` with this loop, assigning it a `Token`. The
    /// channel's interest mask at the time of the call (usually empty) is
    /// synced to the backend via `update_channel`.
    pub fn register_channel(&self, channel: SharedChannel) -> Token {
        self.assert_in_loop_thread();
        let token = {
            let mut inner = self.inner.lock().unwrap();
            let token = Token(inner.next_token);
            inner.next_token += 1;
            inner.channels.insert(token, channel.clone());
            token
        };
        {
            let mut ch = channel.lock().unwrap();
            ch.set_token(token);
            ch.set_registered(true);
        }
        self.update_channel(&channel);
        token
    }

    /// Reconciles the backend's record of `channel`'s interest mask with
    /// its current one. Must be called after any `enable_reading` /
    /// `disable_writing` / etc. call on a registered channel.
    pub fn update_channel(&self, channel: &SharedChannel) {
        self.assert_in_loop_thread();
        let (fd, token, requested, none_event) = {
            let ch = channel.lock().unwrap();
            (
                ch.fd(),
                ch.token().expect("channel must be registered before update_channel"),
                ch.requested(),
                ch.is_none_event(),
            )
        };

        let mut inner = self.inner.lock().unwrap();
        if none_event {
            if inner.backend_fds.remove(&fd) {
                if let Err(e) = inner.backend.remove(fd) {
                    log::warn!("backend.remove failed for fd {}: {}", fd, e);
                }
            }
        } else if inner.backend_fds.contains(&fd) {
            if let Err(e) = inner.backend.modify(fd, token, requested) {
                log::warn!("backend.modify failed for fd {}: {}", fd, e);
            }
        } else {
            match inner.backend.add(fd, token, requested) {
                Ok(()) => {
                    inner.backend_fds.insert(fd);
                }
                Err(e) => log::warn!("backend.add failed for fd {}: {}", fd, e),
            }
        }
    }

    /// Ends `channel`'s registration entirely: stops watching its fd and
    /// forgets its `Token`. Called once a connection/acceptor/connector is
    /// certain it will never touch the fd again.
    pub fn remove_channel(&self, channel: &SharedChannel) {
        self.assert_in_loop_thread();
        let (fd, token) = {
            let ch = channel.lock().unwrap();
            (ch.fd(), ch.token())
        };
        let mut inner = self.inner.lock().unwrap();
        if inner.backend_fds.remove(&fd) {
            if let Err(e) = inner.backend.remove(fd) {
                log::warn!("backend.remove failed for fd {}: {}", fd, e);
            }
        }
        if let Some(token) = token {
            inner.channels.remove(&token);
        }
    }

    /// Runs `f` synchronously if already on the owner thread; otherwise
    /// forwards to `queue_in_loop`. Callable from any thread.
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Queues `f` to run at the tail of the current or next loop
    /// iteration. Wakes the loop unless the caller is the owner thread and
    /// is not itself currently draining pending functors — in that case
    /// the functor will already be picked up before this iteration blocks
    /// on `poll` again. Callable from any thread.
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        {
            let mut pending = self.shared.pending_functors.lock().unwrap();
            pending.push(Box::new(f));
        }
        if !self.is_in_loop_thread()
            || self.shared.calling_pending_functors.load(Ordering::Acquire)
        {
            if let Err(e) = self.shared.wakeup.wakeup() {
                log::warn!("failed to wake event loop: {}", e);
            }
        }
    }

    /// Schedules `callback` to run once at `deadline`. Owner-thread only.
    pub fn run_at(&self, deadline: Instant, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.assert_in_loop_thread();
        let mut inner = self.inner.lock().unwrap();
        inner
            .timer_queue
            .add_timer(Box::new(callback), deadline, Duration::from_secs(0))
            .expect("failed to arm timerfd")
    }

    /// Schedules `callback` to run once after `delay`. Owner-thread only.
    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.run_at(Instant::now() + delay, callback)
    }

    /// Schedules `callback` to run every `interval`, starting after one
    /// `interval`. Owner-thread only.
    pub fn run_every(&self, interval: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.assert_in_loop_thread();
        let mut inner = self.inner.lock().unwrap();
        inner
            .timer_queue
            .add_timer(Box::new(callback), Instant::now() + interval, interval)
            .expect("failed to arm timerfd")
    }

    /// Cancels a timer by handle. Race-free when called on the owner
    /// thread; posted as a functor otherwise. Idempotent.
    pub fn cancel(&self, id: TimerId) {
        if self.is_in_loop_thread() {
            self.inner.lock().unwrap().timer_queue.cancel(id);
        } else {
            let this = self.clone();
            self.queue_in_loop(move || {
                this.inner.lock().unwrap().timer_queue.cancel(id);
            });
        }
    }

    /// Requests the loop stop after its current iteration. Callable from
    /// any thread; wakes the loop if called from elsewhere so the flag is
    /// observed promptly instead of waiting out the poll timeout.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            if let Err(e) = self.shared.wakeup.wakeup() {
                log::warn!("failed to wake event loop for quit: {}", e);
            }
        }
    }

    /// Forces the next (or current) `poll` to return promptly. Callable
    /// from any thread.
    pub fn wakeup(&self) -> io::Result<()> {
        self.shared.wakeup.wakeup()
    }

    /// Runs iterations until `quit()` is observed. Owner-thread only.
    pub fn run(&self) -> io::Result<()> {
        self.assert_in_loop_thread();
        self.shared.quit.store(false, Ordering::Release);
        while !self.shared.quit.load(Ordering::Acquire) {
            self.run_once()?;
        }
        Ok(())
    }

    /// One poll-dispatch-drain cycle. Exposed for tests that want precise
    /// control over how many iterations run.
    pub fn run_once(&self) -> io::Result<()> {
        let now;
        let mut active;
        {
            let mut inner = self.inner.lock().unwrap();
            inner.active_events.clear();
            let timeout = inner.next_timeout();
            if let Err(e) = inner.backend.poll(&mut inner.active_events, Some(timeout)) {
                log::warn!("readiness backend failed: {}", e);
            }
            now = Instant::now();
            active = std::mem::take(&mut inner.active_events);
        }

        for (token, ready) in active.drain(..) {
            let channel = {
                let inner = self.inner.lock().unwrap();
                inner.channels.get(&token).cloned()
            };
            if let Some(channel) = channel {
                let mut ch = channel.lock().unwrap();
                ch.set_returned(ready);
                ch.handle_event(now);
            }
        }

        {
            let mut inner = self.inner.lock().unwrap();
            inner.active_events = active;
        }

        self.run_pending_functors();
        Ok(())
    }

    /// Swaps the pending-functors queue into a local vector under the
    /// mutex, releases it, then invokes each functor. Bounds the critical
    /// section and lets functors themselves call `queue_in_loop` without
    /// deadlocking; a functor queued during this drain runs next
    /// iteration, never this one.
    fn run_pending_functors(&self) {
        let functors = {
            let mut pending = self.shared.pending_functors.lock().unwrap();
            std::mem::take(&mut *pending)
        };

        self.shared
            .calling_pending_functors
            .store(true, Ordering::Release);
        for f in functors {
            f();
        }
        self.shared
            .calling_pending_functors
            .store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    #[test]
    fn run_in_loop_on_owner_thread_runs_synchronously() {
        let event_loop = EventLoop::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        event_loop.run_in_loop(move || ran2.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn queue_in_loop_from_other_thread_runs_on_owner_thread() {
        let event_loop = EventLoop::new().unwrap();
        let owner = thread::current().id();
        let seen_thread = Arc::new(Mutex::new(None));

        let loop_clone = event_loop.clone();
        let seen = seen_thread.clone();
        let barrier = Arc::new(Barrier::new(2));
        let barrier2 = barrier.clone();

        let handle = thread::spawn(move || {
            barrier2.wait();
            loop_clone.queue_in_loop(move || {
                *seen.lock().unwrap() = Some(thread::current().id());
            });
            loop_clone.quit();
        });

        barrier.wait();
        event_loop.run().unwrap();
        handle.join().unwrap();

        assert_eq!(*seen_thread.lock().unwrap(), Some(owner));
    }

    #[test]
    fn run_after_fires_in_deadline_order() {
        let event_loop = EventLoop::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        event_loop.run_after(Duration::from_millis(100), move || {
            o1.lock().unwrap().push('A');
        });

        let o2 = order.clone();
        event_loop.run_after(Duration::from_millis(50), move || {
            o2.lock().unwrap().push('B');
        });

        let loop_clone = event_loop.clone();
        event_loop.run_after(Duration::from_millis(200), move || {
            loop_clone.quit();
        });

        event_loop.run().unwrap();
        assert_eq!(*order.lock().unwrap(), vec!['B', 'A']);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let event_loop = EventLoop::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();

        let id = event_loop.run_after(Duration::from_millis(50), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        event_loop.cancel(id);

        let loop_clone = event_loop.clone();
        event_loop.run_after(Duration::from_millis(100), move || {
            loop_clone.quit();
        });

        event_loop.run().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
