// src/syscalls.rs
//
// Thin wrappers over the raw syscall surface. Everything here is
// non-blocking; WouldBlock is reported as `Ok(None)` so callers can
// re-register interest instead of treating it as a failure.
use std::io;
use std::mem;
use std::ptr;

use libc::{c_int, c_void, socklen_t};

use crate::error::EngineResult;

pub use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, epoll_event};

/// Upper bound for one sendfile invocation; large files go out in
/// bounded chunks so a single connection cannot monopolize a worker.
pub const FILE_CHUNK_SIZE: usize = 64 * 1024;

// ---- Socket Operations ----

/// Create a non-blocking TCP listener bound to `host:port`.
/// TCP_NODELAY is set on the listener and inherited by accepted sockets.
pub fn create_listen_socket(host: &str, port: u16, backlog: i32) -> EngineResult<c_int> {
    let addr_str = format!("{}:{}", host, port);
    let addr: std::net::SocketAddr = addr_str
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let domain = match addr {
        std::net::SocketAddr::V4(_) => libc::AF_INET,
        std::net::SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        // Inherited by every accepted socket, so no per-accept setsockopt.
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        bind_addr(fd, &addr)?;

        if libc::listen(fd, backlog) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

fn bind_addr(fd: c_int, addr: &std::net::SocketAddr) -> EngineResult<()> {
    unsafe {
        match addr {
            std::net::SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                if libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ) < 0
                {
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
                }
            }
            std::net::SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                if libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ) < 0
                {
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }
}

/// Accept one pending connection. `Ok(None)` means the accept queue is
/// drained; callers loop until they see it.
pub fn accept_connection(listen_fd: c_int) -> EngineResult<Option<c_int>> {
    unsafe {
        let fd = libc::accept4(
            listen_fd,
            ptr::null_mut(),
            ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(fd))
        }
    }
}

// ---- Epoll Operations ----

pub struct Epoll {
    fd: c_int,
}

impl Epoll {
    pub fn new() -> EngineResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    fn event_mask(interests: i32, oneshot: bool, edge: bool) -> u32 {
        let mut events = interests as u32;
        if oneshot {
            events |= libc::EPOLLONESHOT as u32;
        }
        if edge {
            events |= libc::EPOLLET as u32;
        }
        events
    }

    pub fn add(
        &self,
        fd: c_int,
        token: u64,
        interests: i32,
        oneshot: bool,
        edge: bool,
    ) -> EngineResult<()> {
        let mut event = epoll_event {
            events: Self::event_mask(interests, oneshot, edge),
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    /// Re-arm a one-shot registration (or change its interest set).
    pub fn modify(
        &self,
        fd: c_int,
        token: u64,
        interests: i32,
        oneshot: bool,
        edge: bool,
    ) -> EngineResult<()> {
        let mut event = epoll_event {
            events: Self::event_mask(interests, oneshot, edge),
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: c_int) -> EngineResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Wait for events. An interrupted wait reports zero events so the
    /// caller's loop simply retries; any other failure is fatal to the loop.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> EngineResult<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );

            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }

            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Non-blocking I/O ----

/// Read once. `Ok(None)` = would block, `Ok(Some(0))` = peer closed.
pub fn read_nonblocking(fd: c_int, buf: &mut [u8]) -> EngineResult<Option<usize>> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

/// Write once. `Ok(None)` = would block.
pub fn write_nonblocking(fd: c_int, buf: &[u8]) -> EngineResult<Option<usize>> {
    unsafe {
        let res = libc::send(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        );
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

/// Vectored write: multiple buffers in a single syscall (max 8 segments).
pub fn writev_nonblocking(fd: c_int, bufs: &[&[u8]]) -> EngineResult<Option<usize>> {
    if bufs.is_empty() {
        return Ok(Some(0));
    }

    let mut iovecs: [libc::iovec; 8] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(8);

    for i in 0..iov_count {
        iovecs[i] = libc::iovec {
            iov_base: bufs[i].as_ptr() as *mut c_void,
            iov_len: bufs[i].len(),
        };
    }

    unsafe {
        let res = libc::writev(fd, iovecs.as_ptr(), iov_count as c_int);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

/// Zero-copy file-to-socket transfer of at most one chunk, starting at
/// `*offset`. The kernel advances `offset` by the bytes it moved.
pub fn sendfile_chunk(
    out_fd: c_int,
    in_fd: c_int,
    offset: &mut i64,
    remaining: u64,
) -> EngineResult<Option<usize>> {
    let count = remaining.min(FILE_CHUNK_SIZE as u64) as usize;
    unsafe {
        let res = libc::sendfile(out_fd, in_fd, offset as *mut libc::off_t, count);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

// ---- Reactor Wake Pipe ----

/// Non-blocking pipe used to wake a reactor out of its wait call.
/// Returns (read_fd, write_fd).
pub fn create_wake_pipe() -> EngineResult<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok((fds[0], fds[1]))
}

/// Post one wake byte. A full pipe means wakes are already pending, so
/// the byte can be dropped without losing a wakeup.
pub fn send_wake(pipe_write_fd: c_int) {
    let byte = [1u8];
    unsafe {
        libc::write(pipe_write_fd, byte.as_ptr() as *const c_void, 1);
    }
}

/// Drain all pending wake bytes.
pub fn drain_wake(pipe_read_fd: c_int) {
    let mut buf = [0u8; 256];
    loop {
        match read_nonblocking(pipe_read_fd, &mut buf) {
            Ok(Some(n)) if n > 0 => continue,
            _ => break,
        }
    }
}
