//! Thin bindings to the OS facilities the reactor needs: an owning fd
//! wrapper, a socket wrapper, epoll, poll(2), eventfd and timerfd.
//!
//! Every other module in the crate goes through here rather than calling
//! `libc` directly, so the unsafe surface stays in one place.

/// Execute a libc call that signals failure with `-1`, turning it into an
/// `io::Result`. Defined before the modules that use it.
#[allow(unused_macros)]
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub mod fd;
pub mod socket;
pub mod epoll;
pub mod poll;
pub mod eventfd;
pub mod timerfd;

pub use fd::FileDesc;
pub use socket::Socket;
