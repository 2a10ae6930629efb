use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use crate::ready::Ready;
use crate::token::Token;

type ReadCallback = Box<dyn FnMut(Instant) + Send>;
type EventCallback = Box<dyn FnMut() + Send>;

/// The registration of one fd with one loop.
///
/// Shared (`Arc<Mutex<_>>`) between the component that owns it
/// (`TcpConnection`, `Acceptor`, `Connector`, `TimerQueue`, `Wakeup`) and
/// the owning `EventLoop`'s channel table. In practice the mutex is only
/// ever touched from the owner loop's thread — the same single-writer,
/// uncontended-by-construction idiom the pending-functors queue uses — but
/// a plain `Rc<RefCell<_>>` would make any component embedding a `Channel`
/// unable to hand out a `Send` handle, which `TcpConnection::send` needs.
pub struct Channel {
    fd: RawFd,
    requested: Ready,
    returned: Ready,
    read_callback: Option<ReadCallback>,
    write_callback: Option<EventCallback>,
    close_callback: Option<EventCallback>,
    error_callback: Option<EventCallback>,
    tie: Option<Weak<dyn Any + Send + Sync>>,
    registered: bool,
    token: Option<Token>,
}

pub type SharedChannel = Arc<Mutex<Channel>>;

impl Channel {
    pub fn new(fd: RawFd) -> SharedChannel {
        Arc::new(Mutex::new(Channel {
            fd,
            requested: Ready::empty(),
            returned: Ready::empty(),
            read_callback: None,
            write_callback: None,
            close_callback: None,
            error_callback: None,
            tie: None,
            registered: false,
            token: None,
        }))
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The `EventLoop`'s back-reference for this channel, assigned on
    /// first registration. `None` before that.
    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub(crate) fn set_token(&mut self, token: Token) {
        self.token = Some(token);
    }

    pub fn requested(&self) -> Ready {
        self.requested
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn set_registered(&mut self, registered: bool) {
        self.registered = registered;
    }

    pub fn set_read_callback(&mut self, cb: impl FnMut(Instant) + Send + 'static) {
        self.read_callback = Some(Box::new(cb));
    }

    pub fn set_write_callback(&mut self, cb: impl FnMut() + Send + 'static) {
        self.write_callback = Some(Box::new(cb));
    }

    pub fn set_close_callback(&mut self, cb: impl FnMut() + Send + 'static) {
        self.close_callback = Some(Box::new(cb));
    }

    pub fn set_error_callback(&mut self, cb: impl FnMut() + Send + 'static) {
        self.error_callback = Some(Box::new(cb));
    }

    /// Installs a weak handle to the object whose lifetime must span
    /// dispatch of this channel's callbacks (see `handle_event`).
    pub fn set_tie(&mut self, tie: Weak<dyn Any + Send + Sync>) {
        self.tie = Some(tie);
    }

    pub fn enable_reading(&mut self) {
        self.requested.insert(Ready::readable());
    }

    pub fn disable_reading(&mut self) {
        self.requested.remove(Ready::readable());
    }

    pub fn enable_writing(&mut self) {
        self.requested.insert(Ready::writable());
    }

    pub fn disable_writing(&mut self) {
        self.requested.remove(Ready::writable());
    }

    pub fn disable_all(&mut self) {
        self.requested = Ready::empty();
    }

    pub fn is_writing(&self) -> bool {
        self.requested.is_writable()
    }

    pub fn is_reading(&self) -> bool {
        self.requested.is_readable()
    }

    pub fn is_none_event(&self) -> bool {
        self.requested.is_empty()
    }

    pub fn set_returned(&mut self, ready: Ready) {
        self.returned = ready;
    }

    /// Dispatches callbacks for the last-reported `returned` mask, in the
    /// order spec'd: hang-up-without-readable-data fires close (and only
    /// close — not read); error fires error; readable fires read;
    /// writable fires write. Deliberately does *not* fire the read
    /// callback on a bare hang-up: `is_readable()` already covers
    /// hangup-with-pending-data, so adding `is_hup()` here would double
    /// dispatch a pure hangup through both close (above) and read
    /// (`read_fd` returning 0, itself another close). `tie` is promoted
    /// to a local strong reference first, so the owning object survives
    /// for the whole call even if a callback causes it to be dropped
    /// elsewhere.
    pub fn handle_event(&mut self, receive_time: Instant) {
        let _guard = self.tie.as_ref().and_then(Weak::upgrade);

        let ready = self.returned;

        if ready.is_hup() && !ready.is_readable() {
            if let Some(cb) = self.close_callback.as_mut() {
                cb();
            }
        }

        if ready.is_error() {
            if let Some(cb) = self.error_callback.as_mut() {
                cb();
            }
        }

        if ready.is_readable() {
            if let Some(cb) = self.read_callback.as_mut() {
                cb(receive_time);
            }
        }

        if ready.is_writable() {
            if let Some(cb) = self.write_callback.as_mut() {
                cb();
            }
        }
    }
}
