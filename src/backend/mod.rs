//! Pluggable readiness backends.
//!
//! An `EventLoop` doesn't know whether it's waking up on `epoll_wait(2)` or
//! `poll(2)`; it only knows it handed some fds interest masks and gets back
//! a list of `(Token, Ready)` pairs. `epoll_backend` and `poll_backend`
//! implement the two styles muduo's `Poller`/`EPollPoller` split describes;
//! which one a given `EventLoop` uses is decided once at construction time
//! (see [`choose`]).

use std::io;
use std::time::Duration;

use crate::ready::Ready;
use crate::token::Token;

mod epoll_backend;
mod poll_backend;

pub use epoll_backend::EpollBackend;
pub use poll_backend::PollBackend;

/// One fd's worth of (de)registration plus the combined wait-and-report
/// step every concrete backend must implement.
pub trait Backend {
    /// Start watching `fd` under `token` for the readiness in `interest`.
    fn add(&mut self, fd: i32, token: Token, interest: Ready) -> io::Result<()>;

    /// Replace the interest mask previously registered for `fd`.
    fn modify(&mut self, fd: i32, token: Token, interest: Ready) -> io::Result<()>;

    /// Stop watching `fd`. Idempotent: removing an fd not currently
    /// registered is not an error.
    fn remove(&mut self, fd: i32) -> io::Result<()>;

    /// Block for at most `timeout` (or indefinitely if `None`), appending
    /// every `(Token, Ready)` pair that fired to `events`. Returns the
    /// number appended.
    fn poll(
        &mut self,
        events: &mut Vec<(Token, Ready)>,
        timeout: Option<Duration>,
    ) -> io::Result<usize>;
}

/// Picks the epoll backend on Linux, falling back to poll when the
/// `REEV_FORCE_BACKEND` environment variable is set to `"poll"` or the
/// `force-poll-backend` feature is compiled in.
pub fn choose() -> io::Result<Box<dyn Backend>> {
    let forced = std::env::var("REEV_FORCE_BACKEND").unwrap_or_default();

    if cfg!(feature = "force-poll-backend") || forced == "poll" {
        log::debug!("selecting poll(2) backend");
        return Ok(Box::new(PollBackend::new()));
    }

    log::debug!("selecting epoll(2) backend");
    Ok(Box::new(EpollBackend::new()?))
}
