use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::config::TcpServerConfig;
use crate::event_loop::EventLoop;
use crate::event_loop_thread_pool::EventLoopThreadPool;
use crate::inet_addr::InetAddr;
use crate::sys::socket::Socket;
use crate::tcp_connection::TcpConnection;

type ConnectionCallback = Box<dyn FnMut(&Arc<TcpConnection>, bool) + Send>;
type MessageCallback = Box<dyn FnMut(&Arc<TcpConnection>, &mut Buffer, Instant) + Send>;
type WriteCompleteCallback = Box<dyn FnMut(&Arc<TcpConnection>) + Send>;
type HighWatermarkCallback = Box<dyn FnMut(&Arc<TcpConnection>, usize) + Send>;

/// Owns the acceptor and a pool of worker loops, assigning every accepted
/// fd to a `TcpConnection` round-robined across the pool.
///
/// Held behind `Arc` (built with `Arc::new_cyclic`, same reason as
/// `TcpConnection`): the acceptor's new-connection callback and every
/// connection's close callback need a handle back to the server, and
/// that handle must be weak so the server, its connections, and its
/// acceptor don't form a reference cycle.
pub struct TcpServer {
    accept_loop: EventLoop,
    listen_addr: SocketAddr,
    name: String,
    config: TcpServerConfig,
    acceptor: Mutex<Option<Arc<Acceptor>>>,
    pool: Mutex<Option<EventLoopThreadPool>>,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    next_conn_id: AtomicUsize,
    started: AtomicBool,
    weak_self: Weak<TcpServer>,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    message_callback: Mutex<Option<MessageCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    high_watermark_callback: Mutex<Option<HighWatermarkCallback>>,
}

impl TcpServer {
    /// Builds a server bound to `addr`. `accept_loop` both runs the
    /// acceptor and, when `config.num_threads == 0`, serves every
    /// connection itself (the single-threaded degenerate case). Does
    /// not start listening — call `start()`.
    pub fn new(accept_loop: EventLoop, addr: SocketAddr, config: TcpServerConfig) -> io::Result<Arc<TcpServer>> {
        let name = format!("{}", addr);
        Ok(Arc::new_cyclic(|weak_self| TcpServer {
            accept_loop,
            listen_addr: addr,
            name,
            config,
            acceptor: Mutex::new(None),
            pool: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicUsize::new(1),
            started: AtomicBool::new(false),
            weak_self: weak_self.clone(),
            connection_callback: Mutex::new(None),
            message_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
            high_watermark_callback: Mutex::new(None),
        }))
    }

    pub fn set_connection_callback(&self, cb: impl FnMut(&Arc<TcpConnection>, bool) + Send + 'static) {
        *self.connection_callback.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl FnMut(&Arc<TcpConnection>, &mut Buffer, Instant) + Send + 'static,
    ) {
        *self.message_callback.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn set_write_complete_callback(&self, cb: impl FnMut(&Arc<TcpConnection>) + Send + 'static) {
        *self.write_complete_callback.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn set_high_watermark_callback(&self, cb: impl FnMut(&Arc<TcpConnection>, usize) + Send + 'static) {
        *self.high_watermark_callback.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Spawns the worker pool (if `config.num_threads > 0`) and starts
    /// the acceptor listening. Idempotent: a second call is a no-op.
    /// Must be called on `accept_loop`'s owner thread, before that
    /// thread calls `accept_loop.run()`.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let pool = EventLoopThreadPool::new(&self.accept_loop, self.config.num_threads, self.config.poll_timeout)?;
        *self.pool.lock().unwrap() = Some(pool);

        // `num_threads == 0` means `accept_loop` also serves connections,
        // so its own default timeout needs the same treatment the pool
        // gives its worker loops.
        if self.config.num_threads == 0 {
            self.accept_loop.set_default_timeout(self.config.poll_timeout);
        }

        let acceptor = Acceptor::new(self.accept_loop.clone(), self.listen_addr, self.config.reuse_port)?;
        let weak_self = self.weak_self.clone();
        acceptor.set_new_connection_callback(move |socket, peer_addr| {
            if let Some(server) = weak_self.upgrade() {
                server.new_connection(socket, peer_addr);
            }
        });
        acceptor.listen()?;
        *self.acceptor.lock().unwrap() = Some(acceptor);

        log::info!("TcpServer listening on {}", self.listen_addr);
        Ok(())
    }

    /// Runs on `accept_loop` (the acceptor's read callback runs there).
    /// Picks the next worker loop, builds the connection, records it in
    /// the map (mutated only from this loop), and posts
    /// `connect_established` onto the worker loop.
    fn new_connection(self: &Arc<Self>, socket: Socket, peer_addr: SocketAddr) {
        if self.config.tcp_no_delay {
            if let Err(e) = socket.set_nodelay(true) {
                log::warn!("TcpServer: set_nodelay failed: {}", e);
            }
        }
        if self.config.keep_alive {
            if let Err(e) = socket.set_keepalive(true) {
                log::warn!("TcpServer: set_keepalive failed: {}", e);
            }
        }

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                log::warn!("TcpServer: failed to read local_addr of accepted socket: {}", e);
                return;
            }
        };

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, peer_addr, id);

        let pool = self.pool.lock().unwrap();
        let worker_loop = pool
            .as_ref()
            .expect("new_connection called before start()")
            .next_loop(&self.accept_loop);
        drop(pool);

        let connection = TcpConnection::new(
            worker_loop.clone(),
            conn_name.clone(),
            socket,
            InetAddr::new(local_addr),
            InetAddr::new(peer_addr),
        );
        connection.set_high_watermark(self.config.high_watermark);
        self.wire_user_callbacks(&connection);
        self.wire_close_callback(&connection, &worker_loop);

        self.connections.lock().unwrap().insert(conn_name, connection.clone());

        worker_loop.run_in_loop(move || connection.connect_established());
    }

    fn wire_user_callbacks(&self, connection: &Arc<TcpConnection>) {
        if self.connection_callback.lock().unwrap().is_some() {
            let server_cb = self.weak_self.clone();
            connection.set_connection_callback(move |conn, up| {
                if let Some(server) = server_cb.upgrade() {
                    if let Some(cb) = server.connection_callback.lock().unwrap().as_mut() {
                        cb(conn, up);
                    }
                }
            });
        }
        if self.message_callback.lock().unwrap().is_some() {
            let server_cb = self.weak_self.clone();
            connection.set_message_callback(move |conn, buf, now| {
                if let Some(server) = server_cb.upgrade() {
                    if let Some(cb) = server.message_callback.lock().unwrap().as_mut() {
                        cb(conn, buf, now);
                    }
                }
            });
        }
        if self.write_complete_callback.lock().unwrap().is_some() {
            let server_cb = self.weak_self.clone();
            connection.set_write_complete_callback(move |conn| {
                if let Some(server) = server_cb.upgrade() {
                    if let Some(cb) = server.write_complete_callback.lock().unwrap().as_mut() {
                        cb(conn);
                    }
                }
            });
        }
        if self.high_watermark_callback.lock().unwrap().is_some() {
            let server_cb = self.weak_self.clone();
            connection.set_high_watermark_callback(move |conn, size| {
                if let Some(server) = server_cb.upgrade() {
                    if let Some(cb) = server.high_watermark_callback.lock().unwrap().as_mut() {
                        cb(conn, size);
                    }
                }
            });
        }
    }

    /// Installs the internal close hook: when the connection goes down,
    /// forget it from the map on `accept_loop`, then post
    /// `connect_destroyed` onto its own worker loop. Two separate hops
    /// so the connection is never destroyed mid-callback.
    fn wire_close_callback(&self, connection: &Arc<TcpConnection>, worker_loop: &EventLoop) {
        let weak_self = self.weak_self.clone();
        let worker_loop = worker_loop.clone();
        connection.set_server_close_callback(move |conn| {
            let conn = conn.clone();
            let worker_loop = worker_loop.clone();
            if let Some(server) = weak_self.upgrade() {
                server.accept_loop.run_in_loop(move || {
                    server.connections.lock().unwrap().remove(conn.name());
                    worker_loop.queue_in_loop(move || conn.connect_destroyed());
                });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop_thread::EventLoopThread;
    use std::io::{Read, Write};
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    fn ephemeral_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    /// The loop's owner thread is pinned at construction, so
    /// both `TcpServer::new`/`start` and the subsequent `run()` must
    /// happen on `EventLoopThread`'s worker thread — the test only talks
    /// to the server afterward through thread-safe APIs.
    #[test]
    fn echo_single_message_roundtrip() {
        let up_count = Arc::new(StdAtomicUsize::new(0));
        let down_count = Arc::new(StdAtomicUsize::new(0));
        let up2 = up_count.clone();
        let down2 = down_count.clone();

        let (addr_tx, addr_rx) = mpsc::channel();
        let accept_thread = EventLoopThread::new();
        accept_thread.set_thread_init_callback(move |event_loop| {
            let server =
                TcpServer::new(event_loop.clone(), ephemeral_addr(), TcpServerConfig::default()).unwrap();
            server.set_connection_callback(move |_conn, up| {
                if up {
                    up2.fetch_add(1, Ordering::SeqCst);
                } else {
                    down2.fetch_add(1, Ordering::SeqCst);
                }
            });
            server.set_message_callback(|conn, buf, _now| {
                let echoed = buf.retrieve_all_as_vec();
                conn.send(&echoed);
            });
            server.start().unwrap();
            addr_tx.send(server.local_addr()).unwrap();
            // Keep the server alive for the worker thread's lifetime.
            std::mem::forget(server);
        });
        let _accept_loop = accept_thread.start().unwrap();
        let addr = addr_rx.recv().unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"hello").unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert_eq!(response, b"hello");

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(up_count.load(Ordering::SeqCst), 1);
        assert_eq!(down_count.load(Ordering::SeqCst), 1);
    }
}
