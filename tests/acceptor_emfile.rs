//! End-to-end scenario 6: acceptor EMFILE recovery.
//!
//! Lowers the process's open-file-descriptor limit to a small number,
//! opens enough client connections to exhaust it, and checks the
//! listening socket is still alive and accepts a further connection once
//! some of those fds are closed.

use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use reev::{EventLoopThread, TcpServer, TcpServerConfig};

/// Lowers `RLIMIT_NOFILE` for this process to `soft`, keeping the
/// previous hard limit. Returns the previous limit so the caller can
/// restore it — other tests in this binary share the process's fd table.
fn lower_nofile_limit(soft: u64) -> libc::rlimit {
    unsafe {
        let mut previous: libc::rlimit = std::mem::zeroed();
        libc::getrlimit(libc::RLIMIT_NOFILE, &mut previous);
        let new_limit = libc::rlimit {
            rlim_cur: soft,
            rlim_max: previous.rlim_max,
        };
        libc::setrlimit(libc::RLIMIT_NOFILE, &new_limit);
        previous
    }
}

fn restore_nofile_limit(previous: libc::rlimit) {
    unsafe {
        libc::setrlimit(libc::RLIMIT_NOFILE, &previous);
    }
}

#[test]
fn listener_keeps_accepting_after_emfile() {
    let _ = env_logger::builder().is_test(true).try_init();

    let up_count = Arc::new(AtomicUsize::new(0));
    let (addr_tx, addr_rx) = mpsc::channel();
    let thread = EventLoopThread::new();
    {
        let up_count = up_count.clone();
        thread.set_thread_init_callback(move |event_loop| {
            let server = TcpServer::new(
                event_loop.clone(),
                "127.0.0.1:0".parse().unwrap(),
                TcpServerConfig::default(),
            )
            .unwrap();
            server.set_connection_callback(move |_conn, is_up| {
                if is_up {
                    up_count.fetch_add(1, Ordering::SeqCst);
                }
            });
            server.start().unwrap();
            addr_tx.send(server.local_addr()).unwrap();
            std::mem::forget(server);
        });
    }
    let _event_loop = thread.start().unwrap();
    let addr = addr_rx.recv().unwrap();

    // Leave headroom for the handful of fds the runtime already has open
    // (stdio, the listening socket, epoll fd, eventfd, timerfd) — pick a
    // soft limit tight enough that opening a dozen client sockets drives
    // this process into EMFILE.
    let previous = lower_nofile_limit(40);

    let mut clients = Vec::new();
    for _ in 0..60 {
        match TcpStream::connect(addr) {
            Ok(stream) => clients.push(stream),
            Err(_) => break,
        }
    }
    assert!(!clients.is_empty(), "expected at least one successful connect before EMFILE");

    std::thread::sleep(Duration::from_millis(100));
    let up_before_drop = up_count.load(Ordering::SeqCst);

    // Free half the client fds, then confirm the listener accepts again.
    let half = clients.len() / 2;
    clients.truncate(clients.len() - half.max(1));
    std::thread::sleep(Duration::from_millis(50));

    let reconnected = TcpStream::connect(addr);
    restore_nofile_limit(previous);

    assert!(reconnected.is_ok(), "listener should still accept after freeing fds");
    std::thread::sleep(Duration::from_millis(100));
    assert!(up_count.load(Ordering::SeqCst) > up_before_drop);
}
