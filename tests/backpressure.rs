//! End-to-end scenario 2: back-pressure trip.
//!
//! The server pushes a payload larger than the kernel's socket send
//! buffer to a client that reads it back slowly, so the connection's
//! *output* buffer (the one `high_watermark` actually measures) backs up
//! past the threshold before draining.

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use reev::{EventLoopThread, TcpServer, TcpServerConfig};

#[test]
fn large_server_write_trips_high_watermark_then_drains() {
    let _ = env_logger::builder().is_test(true).try_init();

    let high_watermark_hits = Arc::new(AtomicUsize::new(0));
    let max_size_seen = Arc::new(AtomicUsize::new(0));
    let write_complete = Arc::new(AtomicUsize::new(0));

    let payload_len = 4 * 1024 * 1024;

    let (addr_tx, addr_rx) = mpsc::channel();
    let thread = EventLoopThread::new();
    {
        let high_watermark_hits = high_watermark_hits.clone();
        let max_size_seen = max_size_seen.clone();
        let write_complete = write_complete.clone();
        thread.set_thread_init_callback(move |event_loop| {
            let config = TcpServerConfig::default().high_watermark(16);
            let server =
                TcpServer::new(event_loop.clone(), "127.0.0.1:0".parse().unwrap(), config).unwrap();

            server.set_connection_callback(move |conn, is_up| {
                if is_up {
                    conn.send(&vec![b'x'; payload_len]);
                }
            });
            server.set_high_watermark_callback(move |_conn, size| {
                high_watermark_hits.fetch_add(1, Ordering::SeqCst);
                max_size_seen.fetch_max(size, Ordering::SeqCst);
            });
            server.set_write_complete_callback(move |_conn| {
                write_complete.fetch_add(1, Ordering::SeqCst);
            });

            server.start().unwrap();
            addr_tx.send(server.local_addr()).unwrap();
            std::mem::forget(server);
        });
    }
    let _event_loop = thread.start().unwrap();
    let addr = addr_rx.recv().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    // Let the server's first write blow past its socket buffer and queue
    // the rest internally before we drain anything.
    std::thread::sleep(Duration::from_millis(100));

    let mut total = 0;
    let mut scratch = vec![0u8; 64 * 1024];
    while total < payload_len {
        let n = client.read(&mut scratch).unwrap();
        assert!(n > 0, "server closed before sending the full payload");
        total += n;
    }

    std::thread::sleep(Duration::from_millis(100));

    assert!(high_watermark_hits.load(Ordering::SeqCst) >= 1);
    assert!(max_size_seen.load(Ordering::SeqCst) >= 16);
    assert_eq!(write_complete.load(Ordering::SeqCst), 1);
}
