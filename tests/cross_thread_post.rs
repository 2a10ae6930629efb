//! End-to-end scenario 4: cross-thread post.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reev::EventLoopThread;

#[test]
fn run_in_loop_from_another_thread_executes_exactly_once_on_the_owner() {
    let _ = env_logger::builder().is_test(true).try_init();

    let thread = EventLoopThread::new();
    let event_loop = thread.start().unwrap();

    let ran_count = Arc::new(AtomicUsize::new(0));
    let ran_on_owner = Arc::new(AtomicBool::new(false));

    let ran_count_clone = ran_count.clone();
    let ran_on_owner_clone = ran_on_owner.clone();
    let loop_for_check = event_loop.clone();
    event_loop.run_in_loop(move || {
        ran_count_clone.fetch_add(1, Ordering::SeqCst);
        ran_on_owner_clone.store(loop_for_check.is_in_loop_thread(), Ordering::SeqCst);
    });

    // This call itself runs on the test's own thread, which is never the
    // owner thread captured at `EventLoop::new()` inside the worker.
    std::thread::sleep(Duration::from_millis(50));

    assert_eq!(ran_count.load(Ordering::SeqCst), 1);
    assert!(ran_on_owner.load(Ordering::SeqCst));
}

#[test]
fn queue_in_loop_preserves_fifo_order_across_threads() {
    let _ = env_logger::builder().is_test(true).try_init();

    let thread = EventLoopThread::new();
    let event_loop = thread.start().unwrap();

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    for i in 0..10 {
        let order = order.clone();
        event_loop.queue_in_loop(move || order.lock().unwrap().push(i));
    }

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
}
