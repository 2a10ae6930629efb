use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex};

use crate::channel::{Channel, SharedChannel};
use crate::event_loop::EventLoop;
use crate::sys::socket::Socket;

const LISTEN_BACKLOG: i32 = 1024;

/// Owns the listening socket and its channel. Runs `accept(2)` to
/// exhaustion on every readable event, so one epoll notification for a
/// burst of simultaneous connects drains all of them without waiting for
/// the next poll.
pub struct Acceptor {
    event_loop: EventLoop,
    socket: Socket,
    channel: SharedChannel,
    /// Held open against `/dev/null` so an `EMFILE` has a spare fd slot to
    /// free before accepting (and immediately closing) the connection the
    /// kernel would otherwise report as forever-readable.
    spare_fd: Mutex<Option<File>>,
    new_connection_callback: Mutex<Option<Box<dyn FnMut(Socket, SocketAddr) + Send>>>,
}

impl Acceptor {
    /// Creates a nonblocking listening socket bound to `addr`. Does not
    /// start listening yet — call `listen()` once the new-connection
    /// callback is wired up.
    pub fn new(event_loop: EventLoop, addr: SocketAddr, reuse_port: bool) -> io::Result<Arc<Acceptor>> {
        let socket = Socket::new(&addr, libc::SOCK_STREAM)?;
        socket.set_reuseaddr(true)?;
        if reuse_port {
            socket.set_reuseport(true)?;
        }
        socket.bind(&addr)?;

        let fd = socket.as_raw_fd();
        let channel = Channel::new(fd);

        let acceptor = Arc::new(Acceptor {
            event_loop,
            socket,
            channel: channel.clone(),
            spare_fd: Mutex::new(File::open("/dev/null").ok()),
            new_connection_callback: Mutex::new(None),
        });

        let weak = Arc::downgrade(&acceptor);
        channel.lock().unwrap().set_read_callback(move |_now| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });

        acceptor.event_loop.register_channel(channel);
        Ok(acceptor)
    }

    pub fn set_new_connection_callback(&self, cb: impl FnMut(Socket, SocketAddr) + Send + 'static) {
        *self.new_connection_callback.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Starts listening and enables the read callback. Must be called
    /// once, on the acceptor's owner loop.
    pub fn listen(&self) -> io::Result<()> {
        self.socket.listen(LISTEN_BACKLOG)?;
        self.channel.lock().unwrap().enable_reading();
        self.event_loop.update_channel(&self.channel);
        Ok(())
    }

    /// Drains every pending connection. On `EMFILE`, recovers by
    /// releasing the spare fd, accept-then-close the one
    /// pending connection the freed slot makes acceptable, and reopen the
    /// spare so the next exhaustion can recover the same way.
    fn handle_read(&self) {
        loop {
            match self.socket.accept() {
                Ok((conn, addr)) => {
                    if let Some(cb) = self.new_connection_callback.lock().unwrap().as_mut() {
                        cb(conn, addr);
                    }
                }
                Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                    log::warn!("acceptor: EMFILE, recovering via spare fd");
                    *self.spare_fd.lock().unwrap() = None;
                    let _ = self.socket.accept();
                    *self.spare_fd.lock().unwrap() = File::open("/dev/null").ok();
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("acceptor: accept failed: {}", e);
                    break;
                }
            }
        }
    }
}
