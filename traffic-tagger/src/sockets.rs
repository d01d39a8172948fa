use std::{
    io, mem,
    os::fd::{AsRawFd, BorrowedFd},
};

// Not exported by every libc target; value from asm-generic/socket.h.
const SO_COOKIE: libc::c_int = 57;

/// What the tagger needs to know about a socket before charging it.
pub trait SocketProbe: Send + Sync {
    fn family(&self, socket: BorrowedFd<'_>) -> io::Result<i32>;
    fn protocol(&self, socket: BorrowedFd<'_>) -> io::Result<i32>;
    /// Kernel socket cookie. Never zero on success.
    fn cookie(&self, socket: BorrowedFd<'_>) -> io::Result<u64>;
}

/// [`SocketProbe`] reading `SOL_SOCKET` options from the kernel.
#[derive(Clone, Copy, Debug, Default)]
pub struct KernelSockets;

fn getsockopt<T: Copy + Default>(socket: BorrowedFd<'_>, option: libc::c_int) -> io::Result<T> {
    let mut value = T::default();
    let mut len = mem::size_of::<T>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            option,
            &mut value as *mut T as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

impl SocketProbe for KernelSockets {
    fn family(&self, socket: BorrowedFd<'_>) -> io::Result<i32> {
        getsockopt::<libc::c_int>(socket, libc::SO_DOMAIN)
    }

    fn protocol(&self, socket: BorrowedFd<'_>) -> io::Result<i32> {
        getsockopt::<libc::c_int>(socket, libc::SO_PROTOCOL)
    }

    fn cookie(&self, socket: BorrowedFd<'_>) -> io::Result<u64> {
        match getsockopt::<u64>(socket, SO_COOKIE)? {
            0 => Err(io::Error::from_raw_os_error(libc::ENOENT)),
            cookie => Ok(cookie),
        }
    }
}

pub fn is_supported_family(family: i32) -> bool {
    family == libc::AF_INET || family == libc::AF_INET6
}

/// Only these are seen by the socket-destroy listener that reaps stale tags.
pub fn is_supported_protocol(protocol: i32) -> bool {
    protocol == libc::IPPROTO_TCP || protocol == libc::IPPROTO_UDP
}

#[cfg(test)]
mod tests {
    use std::{
        net::{TcpListener, UdpSocket},
        os::{fd::AsFd, unix::net::UnixDatagram},
    };

    use super::*;

    #[test]
    fn reads_family_and_protocol_of_inet_sockets() {
        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let tcp = TcpListener::bind("127.0.0.1:0").unwrap();
        let probe = KernelSockets;
        assert_eq!(probe.family(udp.as_fd()).unwrap(), libc::AF_INET);
        assert_eq!(probe.protocol(udp.as_fd()).unwrap(), libc::IPPROTO_UDP);
        assert_eq!(probe.protocol(tcp.as_fd()).unwrap(), libc::IPPROTO_TCP);
    }

    #[test]
    fn unix_sockets_are_not_supported() {
        let (a, _b) = UnixDatagram::pair().unwrap();
        let family = KernelSockets.family(a.as_fd()).unwrap();
        assert_eq!(family, libc::AF_UNIX);
        assert!(!is_supported_family(family));
    }

    #[test]
    fn supported_sets() {
        assert!(is_supported_family(libc::AF_INET6));
        assert!(!is_supported_family(libc::AF_PACKET));
        assert!(is_supported_protocol(libc::IPPROTO_UDP));
        assert!(!is_supported_protocol(libc::IPPROTO_SCTP));
    }
}
