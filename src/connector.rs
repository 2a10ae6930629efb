use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::channel::{Channel, SharedChannel};
use crate::event_loop::EventLoop;
use crate::sys::socket::Socket;
use crate::timer::TimerId;

pub const DEFAULT_INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Disconnected,
    Connecting,
    Connected,
}

/// Doubles `current`, capped at `max`. Pulled out as a free function so
/// the backoff schedule is testable without
/// a real socket or clock.
fn next_retry_delay(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(
            libc::ECONNREFUSED
                | libc::ENETUNREACH
                | libc::EADDRINUSE
                | libc::EADDRNOTAVAIL
                | libc::EINTR
                | libc::EISCONN
                | libc::ETIMEDOUT
                | libc::ECONNRESET
        )
    )
}

struct Shared {
    event_loop: EventLoop,
    server_addr: SocketAddr,
    should_connect: AtomicBool,
    state: Mutex<State>,
    channel: Mutex<Option<SharedChannel>>,
    retry_delay: Mutex<Duration>,
    retry_timer: Mutex<Option<TimerId>>,
    initial_retry_delay: Duration,
    max_retry_delay: Duration,
    new_connection_callback: Mutex<Option<Box<dyn FnMut(Socket) + Send>>>,
}

/// Nonblocking connect with exponential back-off retry.
///
/// `start`/`stop` are the only entry points a caller touches directly;
/// everything else happens through callbacks registered with the owner
/// loop, each capturing an `Arc<Shared>` rather than `&Connector` so they
/// keep working after the `Connector` handle itself is dropped, as long
/// as `stop()` was called first (mirroring `shared_from_this()` in the
/// muduo original).
pub struct Connector {
    shared: Arc<Shared>,
}

impl Connector {
    pub fn new(event_loop: EventLoop, server_addr: SocketAddr) -> Connector {
        Connector::with_retry_bounds(
            event_loop,
            server_addr,
            DEFAULT_INITIAL_RETRY_DELAY,
            DEFAULT_MAX_RETRY_DELAY,
        )
    }

    pub fn with_retry_bounds(
        event_loop: EventLoop,
        server_addr: SocketAddr,
        initial_retry_delay: Duration,
        max_retry_delay: Duration,
    ) -> Connector {
        Connector {
            shared: Arc::new(Shared {
                event_loop,
                server_addr,
                should_connect: AtomicBool::new(false),
                state: Mutex::new(State::Disconnected),
                channel: Mutex::new(None),
                retry_delay: Mutex::new(initial_retry_delay),
                retry_timer: Mutex::new(None),
                initial_retry_delay,
                max_retry_delay,
                new_connection_callback: Mutex::new(None),
            }),
        }
    }

    pub fn set_new_connection_callback(&self, cb: impl FnMut(Socket) + Send + 'static) {
        *self.shared.new_connection_callback.lock().unwrap() = Some(Box::new(cb));
    }

    /// Begins connecting. Safe to call from any thread; the actual
    /// connect attempt always runs on the owner loop.
    pub fn start(&self) {
        self.shared.should_connect.store(true, Ordering::Release);
        let shared = self.shared.clone();
        self.shared
            .event_loop
            .run_in_loop(move || Shared::connect_in_loop(&shared));
    }

    /// Cooperatively stops: marks "do not connect," cancels any pending
    /// retry timer, and if currently connecting, tears the channel and fd
    /// down from the owner loop.
    pub fn stop(&self) {
        self.shared.should_connect.store(false, Ordering::Release);
        let shared = self.shared.clone();
        self.shared.event_loop.run_in_loop(move || {
            if let Some(id) = shared.retry_timer.lock().unwrap().take() {
                shared.event_loop.cancel(id);
            }
            let mut state = shared.state.lock().unwrap();
            if *state == State::Connecting {
                if let Some(channel) = shared.channel.lock().unwrap().take() {
                    shared.event_loop.remove_channel(&channel);
                }
                *state = State::Disconnected;
            }
        });
    }
}

impl Shared {
    fn connect_in_loop(shared: &Arc<Shared>) {
        if !shared.should_connect.load(Ordering::Acquire) {
            return;
        }

        let socket = match Socket::new(&shared.server_addr, libc::SOCK_STREAM) {
            Ok(s) => s,
            Err(e) => {
                log::error!("connector: failed to create socket: {}", e);
                return;
            }
        };

        match socket.connect(&shared.server_addr) {
            Ok(true) => Shared::connecting(shared, socket),
            Ok(false) => Shared::watch_connecting(shared, socket),
            Err(e) if is_retryable(&e) => {
                log::debug!("connector: retryable connect failure: {}", e);
                Shared::retry(shared);
            }
            Err(e) => {
                log::error!("connector: hard connect failure, giving up: {}", e);
            }
        }
    }

    /// Registers the connecting fd for writability so `handle_write` is
    /// invoked once the kernel resolves the connect attempt.
    fn watch_connecting(shared: &Arc<Shared>, socket: Socket) {
        *shared.state.lock().unwrap() = State::Connecting;

        let fd = socket.as_raw_fd();
        let channel = Channel::new(fd);

        let shared_clone = shared.clone();
        let socket = Arc::new(Mutex::new(Some(socket)));
        let socket_clone = socket.clone();
        channel.lock().unwrap().set_write_callback(move || {
            if let Some(socket) = socket_clone.lock().unwrap().take() {
                Shared::handle_write(&shared_clone, socket);
            }
        });

        channel.lock().unwrap().enable_writing();
        shared.event_loop.register_channel(channel.clone());
        *shared.channel.lock().unwrap() = Some(channel);
    }

    fn handle_write(shared: &Arc<Shared>, socket: Socket) {
        if *shared.state.lock().unwrap() != State::Connecting {
            return;
        }

        if let Some(channel) = shared.channel.lock().unwrap().take() {
            shared.event_loop.remove_channel(&channel);
        }

        match socket.take_error() {
            Ok(None) => {
                let self_connect = matches!(
                    (socket.local_addr(), socket.peer_addr()),
                    (Ok(local), Ok(peer)) if local == peer
                );
                if self_connect {
                    log::warn!("connector: detected self-connect, retrying");
                    Shared::retry(shared);
                } else {
                    Shared::connecting(shared, socket);
                }
            }
            Ok(Some(e)) => {
                log::debug!("connector: SO_ERROR after connect: {}", e);
                Shared::retry(shared);
            }
            Err(e) => {
                log::warn!("connector: failed to read SO_ERROR: {}", e);
                Shared::retry(shared);
            }
        }
    }

    fn connecting(shared: &Arc<Shared>, socket: Socket) {
        *shared.state.lock().unwrap() = State::Connected;
        *shared.retry_delay.lock().unwrap() = shared.initial_retry_delay;
        if let Some(cb) = shared.new_connection_callback.lock().unwrap().as_mut() {
            cb(socket);
        }
    }

    fn retry(shared: &Arc<Shared>) {
        *shared.state.lock().unwrap() = State::Disconnected;
        if !shared.should_connect.load(Ordering::Acquire) {
            return;
        }

        let delay = *shared.retry_delay.lock().unwrap();
        let shared_clone = shared.clone();
        let id = shared.event_loop.run_after(delay, move || {
            Shared::connect_in_loop(&shared_clone);
        });
        *shared.retry_timer.lock().unwrap() = Some(id);

        let mut retry_delay = shared.retry_delay.lock().unwrap();
        *retry_delay = next_retry_delay(*retry_delay, shared.max_retry_delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_up_to_cap() {
        let mut delay = DEFAULT_INITIAL_RETRY_DELAY;
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(delay);
            delay = next_retry_delay(delay, DEFAULT_MAX_RETRY_DELAY);
        }
        assert_eq!(
            seen,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000),
                Duration::from_millis(8000),
                Duration::from_millis(16000),
                Duration::from_secs(30),
                Duration::from_secs(30),
            ]
        );
    }

    #[test]
    fn retryable_errors_are_classified() {
        assert!(is_retryable(&io::Error::from_raw_os_error(libc::ECONNREFUSED)));
        assert!(!is_retryable(&io::Error::from_raw_os_error(libc::EACCES)));
    }
}
