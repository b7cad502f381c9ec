//! Thin unsafe layer over the socket syscalls.
//!
//! Every descriptor is created non-blocking and close-on-exec; blocking
//! behavior is the scheduler's job, not the kernel's. All functions
//! return `io::Error` straight from errno.

use libc::{c_int, c_void, sockaddr, sockaddr_in, sockaddr_in6, sockaddr_storage, sockaddr_un, socklen_t};
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn cvt(ret: isize) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn cvt_i(ret: c_int) -> io::Result<c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// A destination address: internet or filesystem.
#[derive(Debug, Clone)]
pub(crate) enum SockAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl SockAddr {
    pub fn unix(path: &Path) -> io::Result<SockAddr> {
        let bytes = path.as_os_str().as_bytes();
        let capacity = mem::size_of::<sockaddr_un>() - mem::size_of::<libc::sa_family_t>();
        if bytes.len() >= capacity {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "socket path too long",
            ));
        }
        Ok(SockAddr::Unix(path.to_path_buf()))
    }

    fn to_raw(&self) -> (sockaddr_storage, socklen_t) {
        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let len = match self {
            SockAddr::Inet(SocketAddr::V4(v4)) => {
                let sin = sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: v4.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(v4.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                unsafe {
                    std::ptr::write(&mut storage as *mut _ as *mut sockaddr_in, sin);
                }
                mem::size_of::<sockaddr_in>()
            }
            SockAddr::Inet(SocketAddr::V6(v6)) => {
                let sin6 = sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: v6.port().to_be(),
                    sin6_flowinfo: v6.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: v6.ip().octets(),
                    },
                    sin6_scope_id: v6.scope_id(),
                };
                unsafe {
                    std::ptr::write(&mut storage as *mut _ as *mut sockaddr_in6, sin6);
                }
                mem::size_of::<sockaddr_in6>()
            }
            SockAddr::Unix(path) => {
                let mut sun: sockaddr_un = unsafe { mem::zeroed() };
                sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
                let bytes = path.as_os_str().as_bytes();
                for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
                    *dst = *src as libc::c_char;
                }
                unsafe {
                    std::ptr::write(&mut storage as *mut _ as *mut sockaddr_un, sun);
                }
                mem::size_of::<libc::sa_family_t>() + bytes.len() + 1
            }
        };
        (storage, len as socklen_t)
    }
}

fn addr_from_raw(storage: &sockaddr_storage, len: socklen_t) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET if len as usize >= mem::size_of::<sockaddr_in>() => {
            let sin = unsafe { &*(storage as *const _ as *const sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 if len as usize >= mem::size_of::<sockaddr_in6>() => {
            let sin6 = unsafe { &*(storage as *const _ as *const sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Creates a non-blocking, close-on-exec socket.
pub(crate) fn socket(domain: c_int, ty: c_int) -> io::Result<RawFd> {
    let fd = cvt_i(unsafe { libc::socket(domain, ty, 0) })?;
    if let Err(e) = set_nonblocking_cloexec(fd) {
        close(fd);
        return Err(e);
    }
    Ok(fd)
}

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = cvt_i(libc::fcntl(fd, libc::F_GETFL))?;
        cvt_i(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
        let fd_flags = cvt_i(libc::fcntl(fd, libc::F_GETFD))?;
        cvt_i(libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC))?;
    }
    Ok(())
}

pub(crate) fn connect(fd: RawFd, addr: &SockAddr) -> io::Result<()> {
    let (storage, len) = addr.to_raw();
    cvt_i(unsafe { libc::connect(fd, &storage as *const _ as *const sockaddr, len) })?;
    Ok(())
}

pub(crate) fn bind(fd: RawFd, addr: &SockAddr) -> io::Result<()> {
    let (storage, len) = addr.to_raw();
    cvt_i(unsafe { libc::bind(fd, &storage as *const _ as *const sockaddr, len) })?;
    Ok(())
}

pub(crate) fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    cvt(unsafe { libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), libc::MSG_NOSIGNAL) })
}

pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    cvt(unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) })
}

/// Non-blocking peek: copies queued bytes without consuming them.
pub(crate) fn peek(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    cvt(unsafe {
        libc::recv(
            fd,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    })
}

pub(crate) fn send_to(fd: RawFd, buf: &[u8], addr: &SockAddr) -> io::Result<usize> {
    let (storage, len) = addr.to_raw();
    cvt(unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
            &storage as *const _ as *const sockaddr,
            len,
        )
    })
}

pub(crate) fn recv_from(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut addr_len = mem::size_of::<sockaddr_storage>() as socklen_t;
    let n = cvt(unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            0,
            &mut storage as *mut _ as *mut sockaddr,
            &mut addr_len,
        )
    })?;
    Ok((n, addr_from_raw(&storage, addr_len)))
}

/// Local address the socket is bound to, when it is an internet one.
pub(crate) fn local_addr(fd: RawFd) -> io::Result<Option<SocketAddr>> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;
    cvt_i(unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut sockaddr, &mut len)
    })?;
    Ok(addr_from_raw(&storage, len))
}

/// Consumes and returns the pending error on the socket, if any.
pub(crate) fn take_socket_error(fd: RawFd) -> io::Result<Option<i32>> {
    let mut err: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;
    cvt_i(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut c_void,
            &mut len,
        )
    })?;
    Ok(if err == 0 { None } else { Some(err) })
}

pub(crate) fn set_buffer_size(fd: RawFd, size: usize) -> io::Result<()> {
    let value = size as c_int;
    for opt in [libc::SO_SNDBUF, libc::SO_RCVBUF] {
        cvt_i(unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                &value as *const _ as *const c_void,
                mem::size_of::<c_int>() as socklen_t,
            )
        })?;
    }
    Ok(())
}

pub(crate) fn set_nodelay(fd: RawFd, enabled: bool) -> io::Result<()> {
    let value: c_int = enabled as c_int;
    cvt_i(unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &value as *const _ as *const c_void,
            mem::size_of::<c_int>() as socklen_t,
        )
    })?;
    Ok(())
}

pub(crate) fn close(fd: RawFd) {
    unsafe {
        let _ = libc::close(fd);
    }
}

/// Blocking readiness wait for direct-mode descriptors. Returns false on
/// timeout.
pub(crate) fn poll_one(fd: RawFd, readable: bool, timeout: Option<Duration>) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: if readable { libc::POLLIN } else { libc::POLLOUT },
        revents: 0,
    };
    let millis = match timeout {
        Some(t) => t.as_millis().min(c_int::MAX as u128) as c_int,
        None => -1,
    };
    loop {
        match cvt_i(unsafe { libc::poll(&mut pfd, 1, millis) }) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Zero-copy file-to-socket transfer. Returns bytes sent from `offset`.
#[cfg(target_os = "linux")]
pub(crate) fn sendfile(out_fd: RawFd, in_fd: RawFd, offset: &mut i64, count: usize) -> io::Result<usize> {
    cvt(unsafe { libc::sendfile(out_fd, in_fd, offset as *mut i64, count) })
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn sendfile(out_fd: RawFd, in_fd: RawFd, offset: &mut i64, count: usize) -> io::Result<usize> {
    let mut buf = [0u8; 16 * 1024];
    let want = count.min(buf.len());
    let read = cvt(unsafe {
        libc::pread(
            in_fd,
            buf.as_mut_ptr() as *mut c_void,
            want,
            *offset as libc::off_t,
        )
    })?;
    if read == 0 {
        return Ok(0);
    }
    let sent = send(out_fd, &buf[..read])?;
    *offset += sent as i64;
    Ok(sent)
}

pub(crate) fn inet_addr(ip: IpAddr, port: u16) -> SockAddr {
    SockAddr::Inet(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inet_round_trip() {
        let addr = SockAddr::Inet("127.0.0.1:8080".parse().unwrap());
        let (storage, len) = addr.to_raw();
        assert_eq!(
            addr_from_raw(&storage, len),
            Some("127.0.0.1:8080".parse().unwrap())
        );

        let addr = SockAddr::Inet("[::1]:443".parse().unwrap());
        let (storage, len) = addr.to_raw();
        assert_eq!(addr_from_raw(&storage, len), Some("[::1]:443".parse().unwrap()));
    }

    #[test]
    fn unix_path_bounds() {
        assert!(SockAddr::unix(Path::new("/tmp/sock")).is_ok());
        let long = "x".repeat(200);
        assert!(SockAddr::unix(Path::new(&long)).is_err());
    }
}
