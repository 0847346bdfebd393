//! Socket helpers shared by the server and the client.

use libc::{
    IPPROTO_TCP, MSG_DONTWAIT, SO_ERROR, SO_LINGER, SO_REUSEADDR, SOL_SOCKET, TCP_NODELAY,
    c_int, c_void, sockaddr, sockaddr_in, socklen_t,
};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::RawFd;

#[cfg(target_os = "linux")]
const SEND_FLAGS: c_int = MSG_DONTWAIT | libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: c_int = MSG_DONTWAIT;

pub(crate) fn sockaddr_from(ip: Ipv4Addr, port: u16) -> sockaddr_in {
    let mut addr: sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = u32::from(ip).to_be();
    addr
}

pub(crate) fn sockaddr_to_socketaddr(addr: &sockaddr_in) -> SocketAddr {
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    SocketAddr::V4(SocketAddrV4::new(ip, port))
}

pub(crate) fn is_would_block(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK
    )
}

fn cvt(ret: c_int) -> io::Result<c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

pub(crate) fn tcp_socket() -> io::Result<RawFd> {
    cvt(unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, IPPROTO_TCP) })
}

fn setsockopt<T>(fd: RawFd, level: c_int, name: c_int, value: &T) -> io::Result<()> {
    cvt(unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const c_void,
            mem::size_of::<T>() as socklen_t,
        )
    })
    .map(|_| ())
}

pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) }).map(|_| ())
}

pub(crate) fn set_nodelay(fd: RawFd) -> io::Result<()> {
    setsockopt(fd, IPPROTO_TCP, TCP_NODELAY, &(1 as c_int))
}

pub(crate) fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    setsockopt(fd, SOL_SOCKET, SO_REUSEADDR, &(1 as c_int))
}

pub(crate) fn set_linger(fd: RawFd, seconds: c_int) -> io::Result<()> {
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: seconds,
    };
    setsockopt(fd, SOL_SOCKET, SO_LINGER, &linger)
}

/// Pending error on a socket (`SO_ERROR`), 0 if none.
pub(crate) fn take_socket_error(fd: RawFd) -> io::Result<c_int> {
    let mut error: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;

    cvt(unsafe {
        libc::getsockopt(
            fd,
            SOL_SOCKET,
            SO_ERROR,
            &mut error as *mut c_int as *mut c_void,
            &mut len,
        )
    })?;

    Ok(error)
}

pub(crate) fn bind(fd: RawFd, ip: Ipv4Addr, port: u16) -> io::Result<()> {
    let addr = sockaddr_from(ip, port);
    cvt(unsafe {
        libc::bind(
            fd,
            &addr as *const sockaddr_in as *const sockaddr,
            mem::size_of::<sockaddr_in>() as socklen_t,
        )
    })
    .map(|_| ())
}

pub(crate) fn listen(fd: RawFd, backlog: usize) -> io::Result<()> {
    cvt(unsafe { libc::listen(fd, backlog.min(c_int::MAX as usize) as c_int) }).map(|_| ())
}

pub(crate) fn accept(fd: RawFd) -> io::Result<RawFd> {
    cvt(unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) })
}

/// Starts a connect; `Ok(true)` if it completed immediately.
pub(crate) fn start_connect(fd: RawFd, ip: Ipv4Addr, port: u16) -> io::Result<bool> {
    let addr = sockaddr_from(ip, port);
    let ret = unsafe {
        libc::connect(
            fd,
            &addr as *const sockaddr_in as *const sockaddr,
            mem::size_of::<sockaddr_in>() as socklen_t,
        )
    };

    if ret == 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        return Ok(false);
    }

    Err(err)
}

pub(crate) fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut addr: sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_in>() as socklen_t;

    cvt(unsafe { libc::getpeername(fd, &mut addr as *mut sockaddr_in as *mut sockaddr, &mut len) })?;

    Ok(sockaddr_to_socketaddr(&addr))
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut addr: sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_in>() as socklen_t;

    cvt(unsafe { libc::getsockname(fd, &mut addr as *mut sockaddr_in as *mut sockaddr, &mut len) })?;

    Ok(sockaddr_to_socketaddr(&addr))
}

/// Non-blocking receive. `Ok(0)` means the peer shut down.
pub(crate) fn recv_nonblocking(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let ret = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), MSG_DONTWAIT) };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(ret as usize)
}

/// Non-blocking send; never raises `SIGPIPE` where the platform allows it.
pub(crate) fn send_nonblocking(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let ret = unsafe { libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), SEND_FLAGS) };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(ret as usize)
}
