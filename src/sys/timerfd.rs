use std::io::{self, Read};
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::time::Duration;

use super::fd::FileDesc;

/// `timerfd(2)` bound to `CLOCK_MONOTONIC`, used by the timer queue to wake
/// the reactor at the next scheduled deadline instead of a busy poll timeout.
#[derive(Debug)]
pub struct TimerFd {
    inner: FileDesc,
}

fn duration_to_timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    }
}

impl TimerFd {
    pub fn new() -> io::Result<TimerFd> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_CLOEXEC | libc::TFD_NONBLOCK
        ))?;
        Ok(TimerFd {
            inner: unsafe { FileDesc::new(fd) },
        })
    }

    /// Arms the timer to fire once after `delay`, relative to now. A zero
    /// `delay` disarms it (per `timerfd_settime(2)`).
    pub fn set_time(&self, delay: Duration) -> io::Result<()> {
        let new_value = libc::itimerspec {
            it_interval: duration_to_timespec(Duration::from_secs(0)),
            it_value: duration_to_timespec(delay),
        };
        let mut old_value: libc::itimerspec = unsafe { mem::zeroed() };
        syscall!(timerfd_settime(
            self.inner.raw(),
            0,
            &new_value,
            &mut old_value
        ))?;
        Ok(())
    }

    /// Reads and drains the expiration counter: the number of times the
    /// timer has fired since it was armed or last read. `Ok(0)` when
    /// nothing is pending (the fd is nonblocking).
    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        match (&self.inner).read_exact(&mut buf) {
            Ok(()) => Ok(u64::from_ne_bytes(buf)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

impl FromRawFd for TimerFd {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        TimerFd {
            inner: FileDesc::new(fd),
        }
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.raw()
    }
}

impl IntoRawFd for TimerFd {
    fn into_raw_fd(self) -> RawFd {
        self.inner.into_raw()
    }
}
