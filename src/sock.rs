// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Thin wrappers around the socket and pipe system calls the proxy needs.
//! Everything returns `io::Result`; callers decide which failures are
//! survivable and which abort the process.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

//==============================================================================
// Helpers
//==============================================================================

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_size(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn sockaddr_in_of(addr: &SocketAddrV4) -> libc::sockaddr_in {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    // `s_addr` is in network byte order; the octets already are.
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.ip().octets()),
    };
    sin
}

fn sockaddr_in_to_addr(sin: &libc::sockaddr_in) -> SocketAddrV4 {
    let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
    SocketAddrV4::new(ip, u16::from_be(sin.sin_port))
}

//==============================================================================
// Sockets
//==============================================================================

/// Creates a non-blocking IPv4 stream socket.
pub fn socket_stream() -> io::Result<OwnedFd> {
    let fd = cvt(unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Creates a blocking IPv4 stream socket; the listener wants `accept` to
/// block.
pub fn socket_stream_blocking() -> io::Result<OwnedFd> {
    let fd = cvt(unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn set_sockopt_one(fd: RawFd, level: libc::c_int, optname: libc::c_int) -> io::Result<()> {
    let one: libc::c_int = 1;
    cvt(unsafe {
        libc::setsockopt(
            fd,
            level,
            optname,
            &one as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

pub fn set_tcp_nodelay(fd: RawFd) -> io::Result<()> {
    set_sockopt_one(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY)
}

pub fn set_reuse_addr(fd: RawFd) -> io::Result<()> {
    set_sockopt_one(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR)
}

/// Outcome of `connect()` on a non-blocking socket.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectStart {
    /// The three-way handshake finished synchronously (loopback, mostly).
    Done,
    /// The handshake is in flight; completion is signaled by
    /// write-readiness and classified by `so_error()`.
    InProgress,
}

pub fn connect(fd: RawFd, addr: &SocketAddrV4) -> io::Result<ConnectStart> {
    let sin = sockaddr_in_of(addr);
    let ret = unsafe {
        libc::connect(
            fd,
            &sin as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret == 0 {
        return Ok(ConnectStart::Done);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        Ok(ConnectStart::InProgress)
    } else {
        Err(err)
    }
}

/// Reads and clears the pending socket error (`SO_ERROR`).
pub fn so_error(fd: RawFd) -> io::Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    })?;
    Ok(err as i32)
}

pub fn bind(fd: RawFd, addr: &SocketAddrV4) -> io::Result<()> {
    let sin = sockaddr_in_of(addr);
    cvt(unsafe {
        libc::bind(
            fd,
            &sin as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

pub fn listen(fd: RawFd, backlog: usize) -> io::Result<()> {
    cvt(unsafe { libc::listen(fd, backlog as libc::c_int) })?;
    Ok(())
}

/// Accepts one connection; the returned socket is non-blocking.
pub fn accept(fd: RawFd) -> io::Result<(OwnedFd, SocketAddrV4)> {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let conn = cvt(unsafe {
        libc::accept4(
            fd,
            &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK,
        )
    })?;
    Ok((unsafe { OwnedFd::from_raw_fd(conn) }, sockaddr_in_to_addr(&sin)))
}

pub fn local_addr(fd: RawFd) -> io::Result<SocketAddrV4> {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockname(
            fd,
            &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    })?;
    Ok(sockaddr_in_to_addr(&sin))
}

fn shutdown(fd: RawFd, how: libc::c_int) -> io::Result<()> {
    match cvt(unsafe { libc::shutdown(fd, how) }) {
        Ok(_) => Ok(()),
        // The peer may have reset the connection already.
        Err(ref e) if e.raw_os_error() == Some(libc::ENOTCONN) => Ok(()),
        Err(e) => Err(e),
    }
}

pub fn shutdown_read(fd: RawFd) -> io::Result<()> {
    shutdown(fd, libc::SHUT_RD)
}

pub fn shutdown_write(fd: RawFd) -> io::Result<()> {
    shutdown(fd, libc::SHUT_WR)
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    cvt_size(unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) })
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    cvt_size(unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) })
}

/// Zero-byte send used to probe whether `fd` would accept a write at all
/// without consuming anything from a pipe on the way.
pub fn send_probe(fd: RawFd) -> io::Result<()> {
    cvt_size(unsafe { libc::send(fd, std::ptr::null(), 0, libc::MSG_NOSIGNAL) })?;
    Ok(())
}

//==============================================================================
// Pipes
//==============================================================================

/// Creates an anonymous pipe; `(read_end, write_end)`.
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [-1, -1];
    cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    Ok((unsafe { OwnedFd::from_raw_fd(fds[0]) }, unsafe {
        OwnedFd::from_raw_fd(fds[1])
    }))
}

/// Resizes a pipe's kernel buffer; returns the actual capacity, which the
/// kernel rounds up to a page multiple.
pub fn set_pipe_size(fd: RawFd, size_bytes: usize) -> io::Result<usize> {
    let cap = cvt(unsafe { libc::fcntl(fd, libc::F_SETPIPE_SZ, size_bytes as libc::c_int) })?;
    Ok(cap as usize)
}

/// Moves up to `len` bytes from `from` to `to` without copying through user
/// space. One of the two descriptors must be a pipe.
pub fn splice(from: RawFd, to: RawFd, len: usize) -> io::Result<usize> {
    use std::ptr;
    cvt_size(unsafe {
        libc::splice(
            from,
            ptr::null_mut(),
            to,
            ptr::null_mut(),
            len,
            libc::SPLICE_F_NONBLOCK | libc::SPLICE_F_MOVE,
        )
    })
}

/// Number of unread bytes sitting in a pipe (`FIONREAD`).
pub fn pipe_len(fd: RawFd) -> io::Result<usize> {
    let mut n: libc::c_int = 0;
    cvt(unsafe { libc::ioctl(fd, libc::FIONREAD, &mut n as *mut libc::c_int) })?;
    Ok(n as usize)
}

pub fn would_block(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK))
}

//==============================================================================
// Process
//==============================================================================

/// A tunnel peer closing its socket must not kill the proxy.
pub fn ignore_sigpipe() {
    unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
}

/// Raises (or lowers) the soft limit on open descriptors. Each tunnel costs
/// six: two sockets plus two pipes of two descriptors each.
pub fn set_max_open_files(limit: u64) -> io::Result<()> {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    cvt(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) })?;
    lim.rlim_cur = limit as libc::rlim_t;
    cvt(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &lim) })?;
    Ok(())
}
