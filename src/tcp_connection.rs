use std::any::Any;
use std::io;
use std::net::Shutdown;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use crate::buffer::Buffer;
use crate::channel::{Channel, SharedChannel};
use crate::event_loop::EventLoop;
use crate::inet_addr::InetAddr;
use crate::sys::socket::Socket;

/// Output-buffer size at which the high-watermark callback fires, absent
/// an explicit `set_high_watermark` call.
pub const DEFAULT_HIGH_WATERMARK: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

type ConnectionCallback = Box<dyn FnMut(&Arc<TcpConnection>, bool) + Send>;
type MessageCallback = Box<dyn FnMut(&Arc<TcpConnection>, &mut Buffer, Instant) + Send>;
type WriteCompleteCallback = Box<dyn FnMut(&Arc<TcpConnection>) + Send>;
type HighWatermarkCallback = Box<dyn FnMut(&Arc<TcpConnection>, usize) + Send>;
type CloseCallback = Box<dyn FnMut(&Arc<TcpConnection>) + Send>;

/// One accepted or connected socket's read/write state machine.
///
/// ```text
/// connecting --(connect_established)--> connected
/// connected  --(shutdown)--------------> disconnecting
/// connected|disconnecting --(close)----> disconnected
/// ```
///
/// Always held behind `Arc`. `weak_self` lets every handler hand user
/// callbacks a strong `&Arc<TcpConnection>` without the constructor
/// needing to know the `Arc` it will be wrapped in up front
/// (`Arc::new_cyclic`), and the channel's `tie` is a weak handle to this
/// same `Arc`, promoted to strong only for the span of one dispatch — the
/// same mechanism `Channel`'s own `tie` uses to break the
/// connection/channel reference cycle.
pub struct TcpConnection {
    event_loop: EventLoop,
    name: String,
    state: Mutex<State>,
    socket: Socket,
    channel: SharedChannel,
    local_addr: InetAddr,
    peer_addr: InetAddr,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    high_watermark: AtomicUsize,
    weak_self: Weak<TcpConnection>,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    message_callback: Mutex<Option<MessageCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    high_watermark_callback: Mutex<Option<HighWatermarkCallback>>,
    close_callback: Mutex<Option<CloseCallback>>,
    /// Not user-facing: `TcpServer`'s hook to forget this connection from
    /// its map once it goes down (the two-step removal `TcpServer`
    /// runs between the accept loop and the worker loop).
    server_close_callback: Mutex<Option<CloseCallback>>,
}

impl TcpConnection {
    pub fn new(
        event_loop: EventLoop,
        name: String,
        socket: Socket,
        local_addr: InetAddr,
        peer_addr: InetAddr,
    ) -> Arc<TcpConnection> {
        Arc::new_cyclic(|weak_self| {
            let fd = socket.as_raw_fd();
            let channel = Channel::new(fd);

            {
                let mut ch = channel.lock().unwrap();
                let w = weak_self.clone();
                ch.set_read_callback(move |now| {
                    if let Some(conn) = w.upgrade() {
                        conn.handle_read(now);
                    }
                });
                let w = weak_self.clone();
                ch.set_write_callback(move || {
                    if let Some(conn) = w.upgrade() {
                        conn.handle_write();
                    }
                });
                let w = weak_self.clone();
                ch.set_close_callback(move || {
                    if let Some(conn) = w.upgrade() {
                        conn.handle_close();
                    }
                });
                let w = weak_self.clone();
                ch.set_error_callback(move || {
                    if let Some(conn) = w.upgrade() {
                        conn.handle_error();
                    }
                });
            }

            TcpConnection {
                event_loop,
                name,
                state: Mutex::new(State::Connecting),
                socket,
                channel,
                local_addr,
                peer_addr,
                input_buffer: Mutex::new(Buffer::new()),
                output_buffer: Mutex::new(Buffer::new()),
                high_watermark: AtomicUsize::new(DEFAULT_HIGH_WATERMARK),
                weak_self: weak_self.clone(),
                connection_callback: Mutex::new(None),
                message_callback: Mutex::new(None),
                write_complete_callback: Mutex::new(None),
                high_watermark_callback: Mutex::new(None),
                close_callback: Mutex::new(None),
                server_close_callback: Mutex::new(None),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The loop this connection is pinned to. Used by `TcpServer` to post
    /// `connect_destroyed` back onto the right thread after erasing the
    /// connection from its own map after erasing it from `TcpServer`'s.
    pub(crate) fn event_loop(&self) -> EventLoop {
        self.event_loop.clone()
    }

    pub fn local_addr(&self) -> InetAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> InetAddr {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        *self.state.lock().unwrap() == State::Connected
    }

    pub fn set_high_watermark(&self, bytes: usize) {
        self.high_watermark.store(bytes, Ordering::Release);
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

    pub fn set_high_watermark_callback(
        &self,
        cb: impl FnMut(&Arc<TcpConnection>, usize) + Send + 'static,
    ) {
        *self.high_watermark_callback.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl FnMut(&Arc<TcpConnection>) + Send + 'static) {
        *self.close_callback.lock().unwrap() = Some(Box::new(cb));
    }

    pub(crate) fn set_server_close_callback(&self, cb: impl FnMut(&Arc<TcpConnection>) + Send + 'static) {
        *self.server_close_callback.lock().unwrap() = Some(Box::new(cb));
    }

    /// Adopts the fd into the owner loop: registers the channel, ties it
    /// to this connection's own lifetime, enables reading, and announces
    /// "up" to the user. Must run on the owner loop (posted there by
    /// `TcpServer` via `run_in_loop`).
    pub fn connect_established(self: &Arc<Self>) {
        *self.state.lock().unwrap() = State::Connected;

        self.event_loop.register_channel(self.channel.clone());
        {
            let mut ch = self.channel.lock().unwrap();
            let tie: Weak<dyn Any + Send + Sync> = self.weak_self.clone();
            ch.set_tie(tie);
            ch.enable_reading();
        }
        self.event_loop.update_channel(&self.channel);

        if let Some(cb) = self.connection_callback.lock().unwrap().as_mut() {
            cb(self, true);
        }
    }

    /// Called by `TcpServer` once this connection has been erased from
    /// its map. Idempotent with `handle_close`; only tears down the
    /// channel registration.
    pub fn connect_destroyed(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == State::Connected {
                *state = State::Disconnected;
                self.channel.lock().unwrap().disable_all();
                self.event_loop.update_channel(&self.channel);
            }
        }
        self.event_loop.remove_channel(&self.channel);
    }

    fn handle_read(self: &Arc<Self>, receive_time: Instant) {
        let result = self.input_buffer.lock().unwrap().read_fd(&self.socket);
        match result {
            Ok(0) => self.handle_close(),
            Ok(_n) => {
                if let Some(cb) = self.message_callback.lock().unwrap().as_mut() {
                    let mut input = self.input_buffer.lock().unwrap();
                    cb(self, &mut input, receive_time);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(_e) => self.handle_error(),
        }
    }

    fn handle_write(self: &Arc<Self>) {
        if !self.channel.lock().unwrap().is_writing() {
            return;
        }

        let write_result = {
            let output = self.output_buffer.lock().unwrap();
            self.socket.write(output.peek())
        };

        match write_result {
            Ok(n) => {
                self.output_buffer.lock().unwrap().retrieve(n);
                if self.output_buffer.lock().unwrap().is_empty() {
                    self.channel.lock().unwrap().disable_writing();
                    self.event_loop.update_channel(&self.channel);
                    self.queue_write_complete();

                    if *self.state.lock().unwrap() == State::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                log::warn!("TcpConnection {}: write failed: {}", self.name, e);
            }
        }
    }

    /// Idempotent: a connection already `Disconnected` returns without
    /// firing the down callbacks a second time.
    fn handle_close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == State::Disconnected {
                return;
            }
            *state = State::Disconnected;
        }
        self.channel.lock().unwrap().disable_all();
        self.event_loop.update_channel(&self.channel);

        if let Some(cb) = self.connection_callback.lock().unwrap().as_mut() {
            cb(self, false);
        }

        if let Some(cb) = self.close_callback.lock().unwrap().as_mut() {
            cb(self);
        }
        if let Some(cb) = self.server_close_callback.lock().unwrap().as_mut() {
            cb(self);
        }
    }

    fn handle_error(self: &Arc<Self>) {
        match self.socket.take_error() {
            Ok(Some(err)) => log::warn!("TcpConnection {}: SO_ERROR: {}", self.name, err),
            Ok(None) => log::warn!("TcpConnection {}: spurious error event", self.name),
            Err(e) => log::warn!("TcpConnection {}: failed to read SO_ERROR: {}", self.name, e),
        }
    }

    /// Queues the write-complete callback (if any) for the tail of this
    /// iteration, matching `handle_write`'s obligation not to invoke user
    /// code synchronously from inside event dispatch.
    fn queue_write_complete(self: &Arc<Self>) {
        if self.write_complete_callback.lock().unwrap().is_some() {
            let this = self.clone();
            self.event_loop.queue_in_loop(move || {
                if let Some(cb) = this.write_complete_callback.lock().unwrap().as_mut() {
                    cb(&this);
                }
            });
        }
    }

    /// Sends `data`. Safe from any thread: on the owner loop, writes are
    /// attempted immediately; off it, `data` is copied into an owned
    /// `Vec` before being handed to `run_in_loop`, since the borrow ends
    /// at this call site.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let owned = data.to_vec();
            let this = self.clone();
            self.event_loop.run_in_loop(move || this.send_in_loop(&owned));
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        if *self.state.lock().unwrap() == State::Disconnected {
            log::warn!("TcpConnection {}: send on a disconnected connection, dropping", self.name);
            return;
        }

        let was_writing = self.channel.lock().unwrap().is_writing();
        let mut remainder: &[u8] = data;
        let mut fault = false;

        if !was_writing && self.output_buffer.lock().unwrap().is_empty() {
            match self.socket.write(data) {
                Ok(n) => {
                    remainder = &data[n..];
                    if remainder.is_empty() {
                        self.queue_write_complete();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    fault = true;
                    log::warn!("TcpConnection {}: write failed: {}", self.name, e);
                }
            }
        }

        if fault || remainder.is_empty() {
            return;
        }

        let (old_len, new_len) = {
            let mut output = self.output_buffer.lock().unwrap();
            let old_len = output.readable_len();
            output.append(remainder);
            (old_len, output.readable_len())
        };

        let high_watermark = self.high_watermark.load(Ordering::Acquire);
        if new_len >= high_watermark && old_len < high_watermark {
            if let Some(cb) = self.high_watermark_callback.lock().unwrap().as_mut() {
                cb(self, new_len);
            }
        }

        if !was_writing {
            self.channel.lock().unwrap().enable_writing();
            self.event_loop.update_channel(&self.channel);
        }
    }

    /// Begins a graceful close: half-closes the write side once the
    /// output buffer has drained, or immediately if it's already empty.
    pub fn shutdown(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if *state == State::Connected {
            *state = State::Disconnecting;
            drop(state);
            let this = self.clone();
            self.event_loop.run_in_loop(move || this.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(self: &Arc<Self>) {
        if !self.channel.lock().unwrap().is_writing() {
            if let Err(e) = self.socket.shutdown(Shutdown::Write) {
                log::warn!("TcpConnection {}: shutdown(Write) failed: {}", self.name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn loopback_pair() -> (Socket, Socket) {
        let (a, b) = Socket::pair(libc::AF_UNIX, libc::SOCK_STREAM).unwrap();
        (a, b)
    }

    #[test]
    fn connect_established_enables_reading_and_fires_up() {
        let event_loop = EventLoop::new().unwrap();
        let (a, _b) = loopback_pair();
        let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
        let conn = TcpConnection::new(
            event_loop,
            "test-conn-1".to_string(),
            a,
            InetAddr::new(addr),
            InetAddr::new(addr),
        );

        let up_seen = Arc::new(AtomicBool::new(false));
        let up_seen2 = up_seen.clone();
        conn.set_connection_callback(move |_c, up| {
            if up {
                up_seen2.store(true, Ordering::SeqCst);
            }
        });

        conn.connect_established();
        assert!(up_seen.load(Ordering::SeqCst));
        assert!(conn.connected());
        assert!(conn.channel.lock().unwrap().is_reading());
    }

    #[test]
    fn send_after_connected_on_owner_thread_writes_directly() {
        let event_loop = EventLoop::new().unwrap();
        let (a, b) = loopback_pair();
        let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
        let conn = TcpConnection::new(
            event_loop,
            "test-conn-2".to_string(),
            a,
            InetAddr::new(addr),
            InetAddr::new(addr),
        );
        conn.connect_established();
        conn.send(b"hello");

        let mut buf = [0u8; 16];
        let n = b.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }
}
