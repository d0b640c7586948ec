//! UDP sockets with the extras RTP reception needs.
//!
//! A receive socket is bound to a port on the any-address with `SO_REUSEADDR`
//! so several sessions can share it; sessions are then told apart by the
//! packet's destination address, which plain `recv_from` does not expose. On
//! Linux the socket enables `IP_PKTINFO` and `SO_TIMESTAMPNS` and receives
//! through `recvmsg`, yielding the destination address and a kernel arrival
//! timestamp per datagram. Elsewhere reception falls back to `recv_from` with
//! the bound local address as the destination and a monotonic clock sample as
//! the arrival time.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::util::monotonic_ns;

/// One received datagram with its addressing metadata.
#[derive(Debug, Clone, Copy)]
pub struct RecvInfo {
    pub len: usize,
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    /// Arrival time in nanoseconds. Kernel receive timestamp when available,
    /// otherwise a monotonic clock sample. Only differences between
    /// consecutive values are meaningful.
    pub recv_time_ns: u64,
}

#[derive(Debug)]
pub struct UdpSocketExt {
    socket: UdpSocket,
    local_port: u16,
}

impl UdpSocketExt {
    /// Opens a non-blocking receive socket on `(any, port)` with address
    /// reuse and destination-address reception enabled.
    pub fn bind_receiver(port: u16) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SockAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)))?;
        socket.set_nonblocking(true)?;

        let socket: UdpSocket = socket.into();
        #[cfg(target_os = "linux")]
        linux::enable_recv_metadata(&socket)?;

        Ok(Self {
            socket,
            local_port: port,
        })
    }

    /// Opens a non-blocking send socket on an ephemeral port, optionally
    /// bound to an interface address, with multicast loopback disabled.
    pub fn open_sender(interface: Option<Ipv4Addr>) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        let bind_address = interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
        socket.bind(&SockAddr::from(SocketAddrV4::new(bind_address, 0)))?;
        socket.set_nonblocking(true)?;
        socket.set_multicast_loop_v4(false)?;

        let socket: UdpSocket = socket.into();
        let local_port = match socket.local_addr()? {
            SocketAddr::V4(address) => address.port(),
            SocketAddr::V6(address) => address.port(),
        };

        Ok(Self { socket, local_port })
    }

    /// Receives one datagram without blocking. `ErrorKind::WouldBlock` means
    /// no data was available.
    pub fn recv_extended(&self, buf: &mut [u8]) -> io::Result<RecvInfo> {
        #[cfg(target_os = "linux")]
        {
            linux::recv_extended(&self.socket, self.local_port, buf)
        }
        #[cfg(not(target_os = "linux"))]
        {
            let (len, src) = self.socket.recv_from(buf)?;
            let src = match src {
                SocketAddr::V4(address) => address,
                SocketAddr::V6(_) => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            };
            let dst = match self.socket.local_addr() {
                Ok(SocketAddr::V4(address)) => address,
                _ => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.local_port),
            };
            Ok(RecvInfo {
                len,
                src,
                dst,
                recv_time_ns: monotonic_ns(),
            })
        }
    }

    pub fn send_to(&self, data: &[u8], dst: SocketAddrV4) -> io::Result<usize> {
        self.socket.send_to(data, dst)
    }

    pub fn join_multicast(&self, group: Ipv4Addr, interface: Ipv4Addr) -> io::Result<()> {
        self.socket.join_multicast_v4(&group, &interface)
    }

    pub fn leave_multicast(&self, group: Ipv4Addr, interface: Ipv4Addr) -> io::Result<()> {
        self.socket.leave_multicast_v4(&group, &interface)
    }

    /// Selects the interface outgoing multicast packets leave through.
    pub fn set_multicast_outbound_interface(&self, interface: Ipv4Addr) -> io::Result<()> {
        socket2::SockRef::from(&self.socket).set_multicast_if_v4(&interface)
    }

    /// Applies `ttl` to both unicast and multicast transmission.
    pub fn set_ttl_all(&self, ttl: u8) -> io::Result<()> {
        self.socket.set_ttl(ttl as u32)?;
        self.socket.set_multicast_ttl_v4(ttl as u32)
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::mem;
    use std::os::unix::io::AsRawFd;

    pub fn enable_recv_metadata(socket: &UdpSocket) -> io::Result<()> {
        let fd = socket.as_raw_fd();
        set_option(fd, libc::IPPROTO_IP, libc::IP_PKTINFO, 1)?;
        // Arrival timestamps are best effort; reception works without them.
        let _ = set_option(fd, libc::SOL_SOCKET, libc::SO_TIMESTAMPNS, 1);
        Ok(())
    }

    fn set_option(fd: libc::c_int, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
        let result = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                &value as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn recv_extended(socket: &UdpSocket, local_port: u16, buf: &mut [u8]) -> io::Result<RecvInfo> {
        let fd = socket.as_raw_fd();

        let mut src_storage: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        // Room for in_pktinfo and a timespec control message, with headers.
        let mut control = [0u64; 16];

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = &mut src_storage as *mut libc::sockaddr_in as *mut libc::c_void;
        msg.msg_namelen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = mem::size_of_val(&control) as _;

        let received = unsafe { libc::recvmsg(fd, &mut msg, 0) };
        if received < 0 {
            return Err(io::Error::last_os_error());
        }

        let src = SocketAddrV4::new(
            Ipv4Addr::from(u32::from_be(src_storage.sin_addr.s_addr)),
            u16::from_be(src_storage.sin_port),
        );

        let mut dst_address = Ipv4Addr::UNSPECIFIED;
        let mut recv_time_ns = None;

        let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        while !cmsg.is_null() {
            let header = unsafe { &*cmsg };
            if header.cmsg_level == libc::IPPROTO_IP && header.cmsg_type == libc::IP_PKTINFO {
                let info = unsafe { &*(libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo) };
                dst_address = Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr));
            } else if header.cmsg_level == libc::SOL_SOCKET && header.cmsg_type == libc::SCM_TIMESTAMPNS {
                let time = unsafe { &*(libc::CMSG_DATA(cmsg) as *const libc::timespec) };
                recv_time_ns = Some(time.tv_sec as u64 * 1_000_000_000 + time.tv_nsec as u64);
            }
            cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
        }

        Ok(RecvInfo {
            len: received as usize,
            src,
            dst: SocketAddrV4::new(dst_address, local_port),
            recv_time_ns: recv_time_ns.unwrap_or_else(monotonic_ns),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_datagram_reports_addresses() {
        let port = {
            // Find a free port by binding an ephemeral socket first.
            let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let receiver = UdpSocketExt::bind_receiver(port).unwrap();
        let sender = UdpSocketExt::open_sender(None).unwrap();

        let dst = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        sender.send_to(&[1, 2, 3], dst).unwrap();

        let mut buf = [0u8; 64];
        let mut attempts = 0;
        let info = loop {
            match receiver.recv_extended(&mut buf) {
                Ok(info) => break info,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    attempts += 1;
                    assert!(attempts < 1000, "datagram never arrived");
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => panic!("recv failed: {e}"),
            }
        };

        assert_eq!(info.len, 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(info.dst.port(), port);
        assert_eq!(info.src.ip(), &Ipv4Addr::LOCALHOST);
        #[cfg(target_os = "linux")]
        assert_eq!(info.dst.ip(), &Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn would_block_when_idle() {
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        let receiver = UdpSocketExt::bind_receiver(port).unwrap();
        let mut buf = [0u8; 16];
        match receiver.recv_extended(&mut buf) {
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::WouldBlock),
            Ok(_) => panic!("expected WouldBlock"),
        }
    }
}
