use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use super::fd::FileDesc;

const EFD_CLOEXEC: i32 = libc::EFD_CLOEXEC;
const EFD_NONBLOCK: i32 = libc::EFD_NONBLOCK;

/// `eventfd(2)` as a readiness-backend-registerable counter. Used by the
/// cross-thread wakeup and by the `Waker`-style self-signal in general:
/// writing a nonzero 8-byte word makes the fd readable; reading drains it.
#[derive(Debug)]
pub struct EventFd {
    inner: FileDesc,
}

impl EventFd {
    pub fn new() -> io::Result<EventFd> {
        let fd = syscall!(eventfd(0, EFD_CLOEXEC | EFD_NONBLOCK))?;
        Ok(EventFd {
            inner: unsafe { FileDesc::new(fd) },
        })
    }

    /// Returns `Ok(0)` (rather than an error) when nothing was pending and
    /// the fd is nonblocking, mirroring the drain-on-wakeup usage pattern.
    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        match (&self.inner).read_exact(&mut buf) {
            Ok(()) => Ok(u64::from_ne_bytes(buf)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub fn write(&self, val: u64) -> io::Result<()> {
        let buf = val.to_ne_bytes();
        match (&self.inner).write_all(&buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.raw()
    }
}

#[cfg(test)]
mod tests {
    use super::EventFd;

    #[test]
    fn write_and_read() {
        let eventfd = EventFd::new().unwrap();
        eventfd.write(123).unwrap();
        let count = eventfd.read().unwrap();
        assert_eq!(123, count);
    }

    #[test]
    fn read_with_nothing_pending_returns_zero() {
        let eventfd = EventFd::new().unwrap();
        assert_eq!(eventfd.read().unwrap(), 0);
    }
}
