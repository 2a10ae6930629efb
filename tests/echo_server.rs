//! End-to-end scenario 1: echo server, single message.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use reev::event_loop_thread::EventLoopThread;
use reev::{TcpServer, TcpServerConfig};

#[test]
fn single_message_roundtrip_emits_up_message_write_complete_down() {
    let _ = env_logger::builder().is_test(true).try_init();

    let up = Arc::new(AtomicUsize::new(0));
    let messages = Arc::new(AtomicUsize::new(0));
    let write_complete = Arc::new(AtomicUsize::new(0));
    let down = Arc::new(AtomicUsize::new(0));

    let (addr_tx, addr_rx) = mpsc::channel();
    let thread = EventLoopThread::new();
    {
        let up = up.clone();
        let messages = messages.clone();
        let write_complete = write_complete.clone();
        let down = down.clone();
        thread.set_thread_init_callback(move |event_loop| {
            let server = TcpServer::new(
                event_loop.clone(),
                "127.0.0.1:0".parse().unwrap(),
                TcpServerConfig::default(),
            )
            .unwrap();

            server.set_connection_callback(move |_conn, is_up| {
                if is_up {
                    up.fetch_add(1, Ordering::SeqCst);
                } else {
                    down.fetch_add(1, Ordering::SeqCst);
                }
            });
            server.set_message_callback(move |conn, buf, _now| {
                messages.fetch_add(1, Ordering::SeqCst);
                let body = buf.retrieve_all_as_vec();
                assert_eq!(body, b"hello");
                conn.send(&body);
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
    client.write_all(b"hello").unwrap();
    client.shutdown(std::net::Shutdown::Write).unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).unwrap();
    assert_eq!(response, b"hello");
    drop(client);

    std::thread::sleep(Duration::from_millis(100));

    assert_eq!(up.load(Ordering::SeqCst), 1);
    assert_eq!(messages.load(Ordering::SeqCst), 1);
    assert_eq!(write_complete.load(Ordering::SeqCst), 1);
    assert_eq!(down.load(Ordering::SeqCst), 1);
}
