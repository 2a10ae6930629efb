use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::event_loop::EventLoop;
use crate::event_loop_thread::EventLoopThread;

/// Round-robin pool of worker loops, one `EventLoopThread` apiece.
/// Mirrors `EventLoopThreadPool` from the original reference material:
/// the pool itself owns no fds, it only hands out `EventLoop` clones for
/// `TcpServer` to dispatch new connections onto.
pub struct EventLoopThreadPool {
    threads: Vec<EventLoopThread>,
    loops: Vec<EventLoop>,
    next: AtomicUsize,
}

impl EventLoopThreadPool {
    /// Spawns `num_threads` worker loops, each with its default poll
    /// timeout set to `poll_timeout`. `num_threads == 0` is valid:
    /// `next_loop()` then returns the caller's own loop, matching
    /// muduo's single-threaded degenerate case (`numThreads_ == 0`).
    pub fn new(base_loop: &EventLoop, num_threads: usize, poll_timeout: Duration) -> io::Result<EventLoopThreadPool> {
        let mut threads = Vec::with_capacity(num_threads);
        let mut loops = Vec::with_capacity(num_threads);

        for i in 0..num_threads {
            let thread = EventLoopThread::new();
            thread.set_thread_init_callback(move |lp| {
                lp.set_default_timeout(poll_timeout);
                log::debug!("reev worker loop {} started", i);
            });
            let event_loop = thread.start()?;
            loops.push(event_loop);
            threads.push(thread);
        }

        let _ = base_loop;
        Ok(EventLoopThreadPool {
            threads,
            loops,
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Picks the next worker loop in round-robin order, or `fallback` if
    /// the pool has no worker threads of its own.
    pub fn next_loop(&self, fallback: &EventLoop) -> EventLoop {
        if self.loops.is_empty() {
            return fallback.clone();
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[i].clone()
    }

    pub fn all_loops(&self) -> &[EventLoop] {
        &self.loops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pool_falls_back_to_caller_loop() {
        let base = EventLoop::new().unwrap();
        let pool = EventLoopThreadPool::new(&base, 0, Duration::from_secs(10)).unwrap();
        assert!(pool.is_empty());
        let picked = pool.next_loop(&base);
        assert!(picked.is_in_loop_thread());
    }

    #[test]
    fn round_robins_across_worker_loops() {
        let base = EventLoop::new().unwrap();
        let pool = EventLoopThreadPool::new(&base, 3, Duration::from_secs(10)).unwrap();
        assert_eq!(pool.len(), 3);

        let first = pool.next_loop(&base);
        let second = pool.next_loop(&base);
        let third = pool.next_loop(&base);
        let fourth = pool.next_loop(&base);

        assert!(!first.is_in_loop_thread());
        assert!(!second.is_in_loop_thread());
        assert!(!third.is_in_loop_thread());
        // Cycles back to the first worker after `len()` picks.
        assert_eq!(fourth.is_in_loop_thread(), first.is_in_loop_thread());
    }
}
