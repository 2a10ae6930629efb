use std::io::{self, Error, ErrorKind};
use std::mem;
use std::net::{Shutdown, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, RawFd};

use libc::{c_int, c_void, sockaddr, socklen_t};

use super::fd::FileDesc;

fn setsockopt<T>(fd: RawFd, level: c_int, name: c_int, payload: T) -> io::Result<()> {
    let payload = &payload as *const T as *const c_void;
    syscall!(setsockopt(
        fd,
        level,
        name,
        payload,
        mem::size_of::<T>() as socklen_t
    ))?;
    Ok(())
}

fn getsockopt<T: Copy>(fd: RawFd, level: c_int, name: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as socklen_t;
    syscall!(getsockopt(
        fd,
        level,
        name,
        &mut slot as *mut _ as *mut _,
        &mut len
    ))?;
    assert_eq!(len as usize, mem::size_of::<T>());
    Ok(slot)
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage, len: usize) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            assert!(len >= mem::size_of::<libc::sockaddr_in>());
            let addr: libc::sockaddr_in =
                unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = u32::from_be(addr.sin_addr.s_addr);
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip.into(), port)))
        }
        libc::AF_INET6 => {
            assert!(len >= mem::size_of::<libc::sockaddr_in6>());
            let addr: libc::sockaddr_in6 =
                unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = addr.sin6_addr.s6_addr;
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip.into(),
                port,
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(Error::new(ErrorKind::InvalidInput, "unsupported address family")),
    }
}

fn addr_to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        match addr {
            SocketAddr::V4(a) => {
                let storage = &mut storage as *mut _ as *mut libc::sockaddr_in;
                (*storage).sin_family = libc::AF_INET as libc::sa_family_t;
                (*storage).sin_port = a.port().to_be();
                (*storage).sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                };
                (
                    mem::transmute::<libc::sockaddr_storage, libc::sockaddr_storage>(
                        *(storage as *const libc::sockaddr_storage),
                    ),
                    mem::size_of::<libc::sockaddr_in>() as socklen_t,
                )
            }
            SocketAddr::V6(a) => {
                let storage = &mut storage as *mut _ as *mut libc::sockaddr_in6;
                (*storage).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*storage).sin6_port = a.port().to_be();
                (*storage).sin6_addr = libc::in6_addr {
                    s6_addr: a.ip().octets(),
                };
                (*storage).sin6_flowinfo = a.flowinfo();
                (*storage).sin6_scope_id = a.scope_id();
                (
                    mem::transmute::<libc::sockaddr_storage, libc::sockaddr_storage>(
                        *(storage as *const libc::sockaddr_storage),
                    ),
                    mem::size_of::<libc::sockaddr_in6>() as socklen_t,
                )
            }
        }
    }
}

/// An owning, close-on-drop socket. Always created nonblocking and
/// close-on-exec so the reactor never has to worry about a registered fd
/// blocking the loop or leaking across `exec`.
#[derive(Debug)]
pub struct Socket(FileDesc);

impl Socket {
    pub fn new(addr: &SocketAddr, ty: c_int) -> io::Result<Socket> {
        let fam = match addr {
            SocketAddr::V4(..) => libc::AF_INET,
            SocketAddr::V6(..) => libc::AF_INET6,
        };
        Socket::new_raw(fam, ty)
    }

    fn new_raw(fam: c_int, ty: c_int) -> io::Result<Socket> {
        match syscall!(socket(fam, ty | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK, 0)) {
            Ok(fd) => return Ok(Socket(unsafe { FileDesc::new(fd) })),
            Err(ref e) if e.raw_os_error() == Some(libc::EINVAL) => {}
            Err(e) => return Err(e),
        }

        let fd = syscall!(socket(fam, ty, 0))?;
        let fd = unsafe { FileDesc::new(fd) };
        fd.set_cloexec()?;
        fd.set_nonblocking(true)?;
        Ok(Socket(fd))
    }

    /// `socketpair(2)` for the cross-thread wakeup self-pipe fallback.
    pub fn pair(fam: c_int, ty: c_int) -> io::Result<(Socket, Socket)> {
        let mut fds = [0, 0];
        match syscall!(socketpair(
            fam,
            ty | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            0,
            fds.as_mut_ptr()
        )) {
            Ok(_) => {
                return Ok((
                    Socket(unsafe { FileDesc::new(fds[0]) }),
                    Socket(unsafe { FileDesc::new(fds[1]) }),
                ))
            }
            Err(ref e) if e.raw_os_error() == Some(libc::EINVAL) => {}
            Err(e) => return Err(e),
        }

        syscall!(socketpair(fam, ty, 0, fds.as_mut_ptr()))?;
        let a = unsafe { FileDesc::new(fds[0]) };
        let b = unsafe { FileDesc::new(fds[1]) };
        a.set_cloexec()?;
        a.set_nonblocking(true)?;
        b.set_cloexec()?;
        b.set_nonblocking(true)?;
        Ok((Socket(a), Socket(b)))
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = addr_to_sockaddr(addr);
        syscall!(bind(
            self.as_raw_fd(),
            &storage as *const _ as *const sockaddr,
            len
        ))?;
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        syscall!(listen(self.as_raw_fd(), backlog))?;
        Ok(())
    }

    /// Start a nonblocking connect. Returns `Ok(true)` if the connection
    /// completed immediately (rare, usually loopback), `Ok(false)` if it is
    /// in progress (`EINPROGRESS`) and writability must be awaited, or an
    /// error for anything else. The caller (the Connector) decides which
    /// errors are retryable.
    pub fn connect(&self, addr: &SocketAddr) -> io::Result<bool> {
        let (storage, len) = addr_to_sockaddr(addr);
        match syscall!(connect(
            self.as_raw_fd(),
            &storage as *const _ as *const sockaddr,
            len
        )) {
            Ok(_) => Ok(true),
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Accept with close-on-exec and nonblocking requested atomically via
    /// `accept4`, falling back to `accept` + separate flag-setting on
    /// kernels without it (`ENOSYS`).
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;
        let storage_ptr = &mut storage as *mut _ as *mut sockaddr;
        let len_ptr = &mut len as *mut socklen_t;

        let res = syscall!(accept4(
            self.as_raw_fd(),
            storage_ptr,
            len_ptr,
            libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK
        ));

        let fd = match res {
            Ok(fd) => fd,
            Err(ref e) if e.raw_os_error() == Some(libc::ENOSYS) => {
                let fd = syscall!(accept(self.as_raw_fd(), storage_ptr, len_ptr))?;
                let desc = unsafe { FileDesc::new(fd) };
                desc.set_cloexec()?;
                desc.set_nonblocking(true)?;
                return Ok((Socket(desc), sockaddr_to_addr(&storage, len as usize)?));
            }
            Err(e) => return Err(e),
        };

        Ok((
            Socket(unsafe { FileDesc::new(fd) }),
            sockaddr_to_addr(&storage, len as usize)?,
        ))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        unsafe {
            let mut storage: libc::sockaddr_storage = mem::zeroed();
            let mut len = mem::size_of_val(&storage) as socklen_t;
            syscall!(getsockname(
                self.as_raw_fd(),
                &mut storage as *mut _ as *mut sockaddr,
                &mut len
            ))?;
            sockaddr_to_addr(&storage, len as usize)
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        unsafe {
            let mut storage: libc::sockaddr_storage = mem::zeroed();
            let mut len = mem::size_of_val(&storage) as socklen_t;
            syscall!(getpeername(
                self.as_raw_fd(),
                &mut storage as *mut _ as *mut sockaddr,
                &mut len
            ))?;
            sockaddr_to_addr(&storage, len as usize)
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = syscall!(recv(
            self.as_raw_fd(),
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            0
        ))?;
        Ok(n as usize)
    }

    /// Two-iovec scatter read: the first targets `bufs[0]` (the buffer's
    /// writable tail), the second a caller-owned scratch area.
    pub fn readv(&self, bufs: &mut [std::io::IoSliceMut<'_>]) -> io::Result<usize> {
        let n = syscall!(readv(
            self.as_raw_fd(),
            bufs.as_ptr() as *const libc::iovec,
            bufs.len() as c_int
        ))?;
        Ok(n as usize)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = syscall!(send(
            self.as_raw_fd(),
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL
        ))?;
        Ok(n as usize)
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let how = match how {
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        syscall!(shutdown(self.as_raw_fd(), how))?;
        Ok(())
    }

    pub fn set_reuseaddr(&self, on: bool) -> io::Result<()> {
        setsockopt(self.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, on as c_int)
    }

    pub fn set_reuseport(&self, on: bool) -> io::Result<()> {
        setsockopt(self.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEPORT, on as c_int)
    }

    pub fn set_keepalive(&self, on: bool) -> io::Result<()> {
        setsockopt(self.as_raw_fd(), libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as c_int)
    }

    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        setsockopt(self.as_raw_fd(), libc::IPPROTO_TCP, libc::TCP_NODELAY, on as c_int)
    }

    pub fn nodelay(&self) -> io::Result<bool> {
        let raw: c_int = getsockopt(self.as_raw_fd(), libc::IPPROTO_TCP, libc::TCP_NODELAY)?;
        Ok(raw != 0)
    }

    /// `SO_ERROR`: the pending asynchronous error, consumed on read. Used
    /// after a nonblocking connect becomes writable to tell success from
    /// failure, and after any read/write error to log the real errno.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let raw: c_int = getsockopt(self.as_raw_fd(), libc::SOL_SOCKET, libc::SO_ERROR)?;
        if raw == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(raw)))
        }
    }

    pub fn try_clone(&self) -> io::Result<Socket> {
        Ok(Socket(self.0.try_clone()?))
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}
