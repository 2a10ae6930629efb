use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

/// Raw `epoll_create1`/`epoll_ctl`/`epoll_wait` bindings. `token` is an
/// opaque `u64` the backend stuffs into `epoll_event.u64`; this layer does
/// not know or care what it means.
pub struct RawEpoll {
    epfd: RawFd,
}

impl RawEpoll {
    pub fn new() -> io::Result<RawEpoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(RawEpoll { epfd })
    }

    pub fn add(&self, fd: RawFd, token: u64, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event { events, u64: token };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev))?;
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, token: u64, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event { events, u64: token };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut ev))?;
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev))?;
        Ok(())
    }

    /// Waits up to `timeout` and fills `events` (which is grown in place,
    /// doubling, capped at 4096, if the previous call filled it entirely).
    /// `EINTR` is treated as "no events": the caller sees an empty slice.
    pub fn wait(
        &self,
        events: &mut Vec<libc::epoll_event>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        const MAX_CAPACITY: usize = 4096;

        if events.len() == events.capacity() && events.capacity() < MAX_CAPACITY {
            let new_cap = (events.capacity() * 2).clamp(64, MAX_CAPACITY);
            events.reserve(new_cap - events.capacity());
        }

        let timeout_ms = timeout
            .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);

        let cap = events.capacity();
        let cnt = match syscall!(epoll_wait(
            self.epfd,
            events.as_mut_ptr(),
            cap as i32,
            timeout_ms
        )) {
            Ok(cnt) => cnt,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => return Err(e),
        };

        unsafe { events.set_len(cnt as usize) };
        Ok(cnt as usize)
    }
}

impl AsRawFd for RawEpoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for RawEpoll {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}
