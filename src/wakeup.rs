use std::io;

use crate::sys::eventfd::EventFd;

/// A fd that becomes readable when written, used to force the readiness
/// backend's blocking wait to return promptly from any thread. Owned by
/// the `EventLoop`; registered for read with a callback that just drains
/// the counter (the wakeup itself carries no payload — it exists purely
/// to unblock `poll`/`epoll_wait` so the loop can observe that its
/// pending-functors queue or quit flag changed).
pub struct Wakeup {
    event_fd: EventFd,
}

impl Wakeup {
    pub fn new() -> io::Result<Wakeup> {
        Ok(Wakeup {
            event_fd: EventFd::new()?,
        })
    }

    pub fn event_fd(&self) -> &EventFd {
        &self.event_fd
    }

    /// Writes a single nonzero word, making the fd readable.
    pub fn wakeup(&self) -> io::Result<()> {
        self.event_fd.write(1)
    }

    /// Drains the pending wakeup signal. Safe to call even if nothing is
    /// pending (returns `Ok(())`).
    pub fn drain(&self) -> io::Result<()> {
        self.event_fd.read()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wakeup_then_drain() {
        let w = Wakeup::new().unwrap();
        w.wakeup().unwrap();
        w.drain().unwrap();
    }
}
