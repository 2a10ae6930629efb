use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::Backend;
use crate::ready::Ready;
use crate::sys::poll as raw_poll;
use crate::token::Token;

fn ready_to_events(interest: Ready) -> libc::c_short {
    let mut events = 0;
    if interest.is_readable() {
        events |= libc::POLLIN;
    }
    if interest.is_writable() {
        events |= libc::POLLOUT;
    }
    events
}

fn revents_to_ready(revents: libc::c_short) -> Ready {
    let mut ready = Ready::empty();
    if revents & libc::POLLIN != 0 {
        ready.insert(Ready::readable());
    }
    if revents & libc::POLLOUT != 0 {
        ready.insert(Ready::writable());
    }
    if revents & libc::POLLERR != 0 {
        ready.insert(Ready::error());
    }
    if revents & libc::POLLHUP != 0 {
        ready.insert(Ready::hup());
    }
    ready
}

/// Readiness backend over `poll(2)`: a flat array of `pollfd`s rather than
/// a kernel-side interest set. Removing an fd doesn't shrink the array
/// (that would shift every index after it mid-scan); instead the slot's
/// fd is negated, a poll(2) idiom for "ignore this slot" (`pollfd.fd < 0`
/// is skipped by the kernel and comes back with `revents == 0`), and the
/// slot index is pushed onto a free list for the next `add` to reuse.
pub struct PollBackend {
    fds: Vec<libc::pollfd>,
    tokens: Vec<Token>,
    fd_to_slot: HashMap<RawFd, usize>,
    free_slots: Vec<usize>,
}

impl PollBackend {
    pub fn new() -> PollBackend {
        PollBackend {
            fds: Vec::new(),
            tokens: Vec::new(),
            fd_to_slot: HashMap::new(),
            free_slots: Vec::new(),
        }
    }
}

impl Default for PollBackend {
    fn default() -> Self {
        PollBackend::new()
    }
}

impl Backend for PollBackend {
    fn add(&mut self, fd: i32, token: Token, interest: Ready) -> io::Result<()> {
        let pollfd = raw_poll::pollfd(fd, ready_to_events(interest));
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.fds[slot] = pollfd;
                self.tokens[slot] = token;
                slot
            }
            None => {
                self.fds.push(pollfd);
                self.tokens.push(token);
                self.fds.len() - 1
            }
        };
        self.fd_to_slot.insert(fd, slot);
        Ok(())
    }

    fn modify(&mut self, fd: i32, token: Token, interest: Ready) -> io::Result<()> {
        let slot = *self
            .fd_to_slot
            .get(&fd)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        self.fds[slot].events = ready_to_events(interest);
        self.tokens[slot] = token;
        Ok(())
    }

    fn remove(&mut self, fd: i32) -> io::Result<()> {
        if let Some(slot) = self.fd_to_slot.remove(&fd) {
            self.fds[slot].fd = -fd - 1;
            self.free_slots.push(slot);
        }
        Ok(())
    }

    fn poll(
        &mut self,
        events: &mut Vec<(Token, Ready)>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        if self.fds.is_empty() {
            if let Some(d) = timeout {
                std::thread::sleep(d);
            }
            return Ok(0);
        }

        let n = raw_poll::poll(&mut self.fds, timeout)?;
        if n <= 0 {
            return Ok(0);
        }

        let mut found = 0;
        for (slot, pollfd) in self.fds.iter().enumerate() {
            if pollfd.fd < 0 || pollfd.revents == 0 {
                continue;
            }
            events.push((self.tokens[slot], revents_to_ready(pollfd.revents)));
            found += 1;
            if found == n as usize {
                break;
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::eventfd::EventFd;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn add_and_poll_readable() {
        let efd = EventFd::new().unwrap();
        efd.write(1).unwrap();

        let mut backend = PollBackend::new();
        backend
            .add(efd.as_raw_fd(), Token(7), Ready::readable())
            .unwrap();

        let mut events = Vec::new();
        let n = backend
            .poll(&mut events, Some(Duration::from_millis(100)))
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(events[0].0, Token(7));
        assert!(events[0].1.is_readable());
    }

    #[test]
    fn remove_stops_reporting() {
        let efd = EventFd::new().unwrap();
        efd.write(1).unwrap();

        let mut backend = PollBackend::new();
        backend
            .add(efd.as_raw_fd(), Token(1), Ready::readable())
            .unwrap();
        backend.remove(efd.as_raw_fd()).unwrap();

        let mut events = Vec::new();
        let n = backend
            .poll(&mut events, Some(Duration::from_millis(50)))
            .unwrap();
        assert_eq!(n, 0);
    }
}
