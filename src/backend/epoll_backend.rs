use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use slab::Slab;

use super::Backend;
use crate::ready::Ready;
use crate::sys::epoll::RawEpoll;
use crate::token::Token;

fn ready_to_events(interest: Ready) -> u32 {
    let mut events = 0u32;
    if interest.is_readable() {
        events |= libc::EPOLLIN as u32;
    }
    if interest.is_writable() {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

fn events_to_ready(events: u32) -> Ready {
    let mut ready = Ready::empty();
    if events & (libc::EPOLLIN as u32) != 0 {
        ready.insert(Ready::readable());
    }
    if events & (libc::EPOLLOUT as u32) != 0 {
        ready.insert(Ready::writable());
    }
    if events & (libc::EPOLLERR as u32) != 0 {
        ready.insert(Ready::error());
    }
    if events & (libc::EPOLLHUP as u32) != 0 {
        ready.insert(Ready::hup());
    }
    ready
}

/// Readiness backend over `epoll(7)`. A `slab::Slab` holds the
/// `(fd, Token)` record for every registered fd; its key doubles as the
/// `u64` epoll stuffs into `epoll_event` and hands back on `wait`, so a
/// fired event is translated back to a `Token` in O(1) with no extra
/// allocation.
pub struct EpollBackend {
    epoll: RawEpoll,
    records: Slab<(RawFd, Token)>,
    fd_to_key: HashMap<RawFd, usize>,
    raw_events: Vec<libc::epoll_event>,
}

impl EpollBackend {
    pub fn new() -> io::Result<EpollBackend> {
        Ok(EpollBackend {
            epoll: RawEpoll::new()?,
            records: Slab::new(),
            fd_to_key: HashMap::new(),
            raw_events: Vec::with_capacity(64),
        })
    }
}

impl Backend for EpollBackend {
    fn add(&mut self, fd: i32, token: Token, interest: Ready) -> io::Result<()> {
        let key = self.records.insert((fd, token));
        self.fd_to_key.insert(fd, key);
        if let Err(e) = self.epoll.add(fd, key as u64, ready_to_events(interest)) {
            self.records.remove(key);
            self.fd_to_key.remove(&fd);
            return Err(e);
        }
        Ok(())
    }

    fn modify(&mut self, fd: i32, token: Token, interest: Ready) -> io::Result<()> {
        let key = *self
            .fd_to_key
            .get(&fd)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        self.records[key] = (fd, token);
        self.epoll.modify(fd, key as u64, ready_to_events(interest))
    }

    fn remove(&mut self, fd: i32) -> io::Result<()> {
        if let Some(key) = self.fd_to_key.remove(&fd) {
            self.records.remove(key);
            self.epoll.delete(fd)?;
        }
        Ok(())
    }

    fn poll(
        &mut self,
        events: &mut Vec<(Token, Ready)>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let n = self.epoll.wait(&mut self.raw_events, timeout)?;
        for raw in &self.raw_events[..n] {
            let key = raw.u64 as usize;
            if let Some(&(_, token)) = self.records.get(key) {
                events.push((token, events_to_ready(raw.events)));
            }
        }
        Ok(n)
    }
}
