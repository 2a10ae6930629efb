use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::event_loop::EventLoop;

type InitCallback = Box<dyn FnOnce(&EventLoop) + Send + 'static>;

struct Shared {
    event_loop: Mutex<Option<EventLoop>>,
    condvar: Condvar,
}

/// Spawns one OS thread that constructs and runs a single `EventLoop` to
/// completion, then joins it on drop. Grounded in muduo's
/// `EventLoopThread`: the constructing thread blocks in `start()` until
/// the loop thread has built its `EventLoop` and handed a clone back, so
/// no caller ever observes a half-constructed loop.
pub struct EventLoopThread {
    shared: Arc<Shared>,
    init_callback: Mutex<Option<InitCallback>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoopThread {
    pub fn new() -> EventLoopThread {
        EventLoopThread {
            shared: Arc::new(Shared {
                event_loop: Mutex::new(None),
                condvar: Condvar::new(),
            }),
            init_callback: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Registers a callback run once on the worker thread, immediately
    /// after its `EventLoop` is constructed but before `run()` is
    /// entered — the hook a `TcpServer` uses to install the per-loop
    /// `poll_timeout_ms` via `set_default_timeout`.
    pub fn set_thread_init_callback(&self, cb: impl FnOnce(&EventLoop) + Send + 'static) {
        *self.init_callback.lock().unwrap() = Some(Box::new(cb));
    }

    /// Spawns the worker thread and blocks until its `EventLoop` exists,
    /// returning a clone that is safe to hand to other threads.
    pub fn start(&self) -> io::Result<EventLoop> {
        let shared = self.shared.clone();
        let init_callback = self.init_callback.lock().unwrap().take();

        let handle = thread::Builder::new()
            .name("reev-worker".into())
            .spawn(move || {
                let event_loop = match EventLoop::new() {
                    Ok(event_loop) => event_loop,
                    Err(e) => {
                        log::error!("event loop thread: failed to construct event loop: {}", e);
                        return;
                    }
                };

                if let Some(cb) = init_callback {
                    cb(&event_loop);
                }

                {
                    let mut slot = shared.event_loop.lock().unwrap();
                    *slot = Some(event_loop.clone());
                    shared.condvar.notify_all();
                }

                if let Err(e) = event_loop.run() {
                    log::error!("event loop thread: run() failed: {}", e);
                }
            })?;

        *self.handle.lock().unwrap() = Some(handle);

        let mut slot = self.shared.event_loop.lock().unwrap();
        while slot.is_none() {
            slot = self.shared.condvar.wait(slot).unwrap();
        }
        Ok(slot.clone().expect("event loop set under the same lock"))
    }
}

impl Default for EventLoopThread {
    fn default() -> EventLoopThread {
        EventLoopThread::new()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(event_loop) = self.shared.event_loop.lock().unwrap().clone() {
            event_loop.quit();
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn start_hands_back_a_running_loop() {
        let thread = EventLoopThread::new();
        let event_loop = thread.start().unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        event_loop.run_in_loop(move || ran2.store(true, Ordering::SeqCst));

        // run_in_loop from off the owner thread posts and wakes; give the
        // worker a moment to drain its pending functors.
        std::thread::sleep(Duration::from_millis(50));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn thread_init_callback_runs_before_loop_is_handed_back() {
        let thread = EventLoopThread::new();
        let seen = Arc::new(AtomicBool::new(false));
        let seen2 = seen.clone();
        thread.set_thread_init_callback(move |_lp| {
            seen2.store(true, Ordering::SeqCst);
        });
        let _event_loop = thread.start().unwrap();
        assert!(seen.load(Ordering::SeqCst));
    }
}
