//! End-to-end scenario 5: connector back-off.
//!
//! Uses short retry bounds (rather than the 500ms/30s production
//! defaults, already covered by `connector.rs`'s own unit test for the
//! doubling schedule) so the test converges quickly: a connector is
//! pointed at a port nothing is listening on, retries a few times, and
//! then a real acceptor is bound to that same port — which `stop()`
//! should pre-empt if called first, and which the connector should
//! otherwise eventually reach.

use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reev::{Acceptor, Connector, EventLoopThread};

#[test]
fn connector_retries_until_a_listener_appears() {
    let _ = env_logger::builder().is_test(true).try_init();

    // Reserve a port, then immediately free it: connect attempts against
    // it fail with ECONNREFUSED until we rebind it below.
    let probe = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let thread = EventLoopThread::new();
    let event_loop = thread.start().unwrap();

    let connector = Connector::with_retry_bounds(
        event_loop.clone(),
        addr,
        Duration::from_millis(20),
        Duration::from_millis(40),
    );

    let connected = Arc::new(AtomicUsize::new(0));
    let connected_clone = connected.clone();
    connector.set_new_connection_callback(move |_socket| {
        connected_clone.fetch_add(1, Ordering::SeqCst);
    });
    connector.start();

    // Give it a couple of failed retries against the closed port before a
    // listener shows up.
    std::thread::sleep(Duration::from_millis(90));
    assert_eq!(connected.load(Ordering::SeqCst), 0);

    let loop_for_acceptor = event_loop.clone();
    event_loop.run_in_loop(move || {
        let acceptor = Acceptor::new(loop_for_acceptor.clone(), addr, false).unwrap();
        acceptor.set_new_connection_callback(|_socket, _peer| {});
        acceptor.listen().unwrap();
        std::mem::forget(acceptor);
    });

    std::thread::sleep(Duration::from_millis(200));
    assert!(connected.load(Ordering::SeqCst) >= 1);
}

#[test]
fn stop_cancels_the_pending_retry() {
    let _ = env_logger::builder().is_test(true).try_init();

    let probe = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let thread = EventLoopThread::new();
    let event_loop = thread.start().unwrap();

    let connector = Connector::with_retry_bounds(
        event_loop.clone(),
        addr,
        Duration::from_millis(500),
        Duration::from_secs(1),
    );
    let connected = Arc::new(AtomicUsize::new(0));
    let connected_clone = connected.clone();
    connector.set_new_connection_callback(move |_socket| {
        connected_clone.fetch_add(1, Ordering::SeqCst);
    });
    connector.start();

    std::thread::sleep(Duration::from_millis(50));
    connector.stop();

    // Now bind a listener; the stopped connector must not reconnect.
    let loop_for_acceptor = event_loop.clone();
    event_loop.run_in_loop(move || {
        let acceptor = Acceptor::new(loop_for_acceptor.clone(), addr, false).unwrap();
        acceptor.set_new_connection_callback(|_socket, _peer| {});
        acceptor.listen().unwrap();
        std::mem::forget(acceptor);
    });

    std::thread::sleep(Duration::from_millis(700));
    assert_eq!(connected.load(Ordering::SeqCst), 0);
}
