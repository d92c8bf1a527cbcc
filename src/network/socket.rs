//! Non-blocking socket primitives on top of `socket2`.
//!
//! Every socket handed to a transceiver or acceptor is created here in
//! non-blocking mode. Helpers return typed [`TransportError`]s so callers
//! never look at raw error codes.

use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::{self, Result, TransportError};
use crate::instance::{BufferKind, ProtocolInstance};
use crate::network::address;

/// Creates a non-blocking TCP or UDP socket for the family of `address`.
pub fn create_socket(udp: bool, address: &SocketAddr) -> Result<Socket> {
    let (kind, protocol) = if udp {
        (Type::DGRAM, Protocol::UDP)
    } else {
        (Type::STREAM, Protocol::TCP)
    };

    let socket = Socket::new(Domain::for_address(*address), kind, Some(protocol))
        .map_err(error::socket_error)?;
    socket.set_nonblocking(true).map_err(error::socket_error)?;

    if !udp {
        socket.set_tcp_nodelay(true).map_err(error::socket_error)?;
        socket.set_keepalive(true).map_err(error::socket_error)?;
    }
    Ok(socket)
}

/// Creates a socket for a server bind, accepting IPv4 peers on an IPv6
/// wildcard bind.
pub fn create_server_socket(udp: bool, address: &SocketAddr) -> Result<Socket> {
    let socket = create_socket(udp, address)?;
    if address.is_ipv6() && address.ip().is_unspecified() {
        socket.set_only_v6(false).map_err(error::socket_error)?;
    }
    Ok(socket)
}

pub fn set_reuse_address(socket: &Socket, reuse: bool) -> Result<()> {
    socket.set_reuse_address(reuse).map_err(error::socket_error)
}

/// Binds `socket` and returns the effective local address (the kernel
/// picks the port when `address` has port 0).
pub fn do_bind(socket: &Socket, address: &SocketAddr) -> Result<SocketAddr> {
    socket
        .bind(&SockAddr::from(*address))
        .map_err(error::socket_error)?;
    local_address(socket).ok_or_else(|| TransportError::Socket {
        source: io::Error::other("bound socket has no local address"),
    })
}

pub fn do_listen(socket: &Socket, backlog: i32) -> Result<()> {
    socket.listen(backlog).map_err(error::socket_error)
}

/// Starts a non-blocking connect, binding `source` first when set.
///
/// Returns `true` when the connection completed immediately and `false`
/// when it is in progress.
pub fn do_connect(socket: &Socket, address: &SocketAddr, source: Option<IpAddr>) -> Result<bool> {
    if let Some(source) = source {
        do_bind(socket, &SocketAddr::new(source, 0))?;
    }

    loop {
        match socket.connect(&SockAddr::from(*address)) {
            Ok(()) => return Ok(true),
            Err(e) if error::interrupted(&e) => continue,
            Err(e) if error::connect_in_progress(&e) => return Ok(false),
            Err(e) => return Err(error::classify_connect_error(e)),
        }
    }
}

/// Completes a connect started by [`do_connect`] once the socket reported
/// write readiness.
///
/// A socket connected to itself (possible on loopback when the target port
/// lies in the ephemeral range) is reported as refused.
pub fn do_finish_connect(socket: &Socket) -> Result<()> {
    if let Some(e) = socket.take_error().map_err(error::socket_error)? {
        return Err(error::classify_connect_error(e));
    }

    let local = local_address(socket);
    let remote = remote_address(socket);
    if local.is_some() && local == remote {
        return Err(TransportError::ConnectionRefused {
            source: io::Error::from_raw_os_error(libc::ECONNREFUSED),
        });
    }
    Ok(())
}

/// True once a connect in progress has either completed or failed, i.e.
/// the socket polls writable.
pub fn connect_settled(socket: &Socket) -> Result<bool> {
    let mut entry = libc::pollfd {
        fd: socket.as_raw_fd(),
        events: libc::POLLOUT,
        revents: 0,
    };
    // SAFETY: one valid pollfd, zero timeout.
    let result = unsafe { libc::poll(&mut entry, 1, 0) };
    if result < 0 {
        let e = io::Error::last_os_error();
        if error::interrupted(&e) {
            return Ok(false);
        }
        return Err(error::socket_error(e));
    }
    Ok(result > 0)
}

/// Accepts one pending connection. `None` means no connection is pending.
pub fn do_accept(socket: &Socket) -> Result<Option<Socket>> {
    loop {
        match socket.accept() {
            Ok((accepted, _)) => {
                accepted.set_nonblocking(true).map_err(error::socket_error)?;
                accepted.set_tcp_nodelay(true).map_err(error::socket_error)?;
                accepted.set_keepalive(true).map_err(error::socket_error)?;
                return Ok(Some(accepted));
            }
            Err(e) if error::interrupted(&e) => continue,
            Err(e) if error::would_block(&e) => return Ok(None),
            Err(e) if error::connection_lost(&e) => return Ok(None),
            Err(e) => return Err(error::socket_error(e)),
        }
    }
}

pub fn local_address(socket: &Socket) -> Option<SocketAddr> {
    socket.local_addr().ok().and_then(|a| a.as_socket())
}

pub fn remote_address(socket: &Socket) -> Option<SocketAddr> {
    socket.peer_addr().ok().and_then(|a| a.as_socket())
}

/// Receives into `buf`.
pub fn recv(socket: &Socket, buf: &mut [u8]) -> io::Result<usize> {
    socket.recv(as_uninit(buf))
}

/// Receives one datagram into `buf` and returns the sender.
pub fn recv_from(socket: &Socket, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
    let (count, from) = socket.recv_from(as_uninit(buf))?;
    Ok((count, from.as_socket()))
}

/// Sends from `buf` without raising `SIGPIPE` on a closed peer.
pub fn send(socket: &Socket, buf: &[u8]) -> io::Result<usize> {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    let flags = libc::MSG_NOSIGNAL;
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    let flags = 0;
    socket.send_with_flags(buf, flags)
}

pub fn send_to(socket: &Socket, buf: &[u8], address: &SocketAddr) -> io::Result<usize> {
    socket.send_to(buf, &SockAddr::from(*address))
}

fn as_uninit(buf: &mut [u8]) -> &mut [MaybeUninit<u8>] {
    // SAFETY: `u8` and `MaybeUninit<u8>` share layout and the kernel only
    // writes initialized bytes.
    unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) }
}

/// Applies the requested receive and send buffer sizes, warning (once per
/// distinct request) when the OS granted less than asked.
pub fn set_buffer_sizes(
    socket: &Socket,
    instance: &ProtocolInstance,
    rcv_size: Option<i32>,
    snd_size: Option<i32>,
) -> Result<()> {
    if let Some(requested) = rcv_size {
        socket
            .set_recv_buffer_size(requested as usize)
            .map_err(error::socket_error)?;
        let granted = socket.recv_buffer_size().map_err(error::socket_error)?;
        if (granted as i64) < requested as i64 {
            instance.buffer_size_adjusted(BufferKind::Receive, requested, granted as i32);
        }
    }

    if let Some(requested) = snd_size {
        socket
            .set_send_buffer_size(requested as usize)
            .map_err(error::socket_error)?;
        let granted = socket.send_buffer_size().map_err(error::socket_error)?;
        if (granted as i64) < requested as i64 {
            instance.buffer_size_adjusted(BufferKind::Send, requested, granted as i32);
        }
    }
    Ok(())
}

/// Buffer size as the OS option expects it, saturating at `i32::MAX`.
pub(crate) fn buffer_size_request(size: usize) -> i32 {
    i32::try_from(size).unwrap_or(i32::MAX)
}

pub fn recv_buffer_size(socket: &Socket) -> usize {
    socket.recv_buffer_size().unwrap_or(0)
}

pub fn send_buffer_size(socket: &Socket) -> usize {
    socket.send_buffer_size().unwrap_or(0)
}

/// Joins multicast `group` on `interface` (a name or numeric address,
/// empty for the default interface).
pub fn set_mcast_group(socket: &Socket, group: &IpAddr, interface: &str) -> Result<()> {
    let (v4_interface, index) = address::interface_address(interface);
    match group {
        IpAddr::V4(group) => socket
            .join_multicast_v4(group, &v4_interface.unwrap_or(Ipv4Addr::UNSPECIFIED))
            .map_err(error::socket_error),
        IpAddr::V6(group) => socket
            .join_multicast_v6(group, index)
            .map_err(error::socket_error),
    }
}

/// Selects the outgoing interface for multicast datagrams.
pub fn set_mcast_interface(socket: &Socket, interface: &str, ipv6: bool) -> Result<()> {
    let (v4_interface, index) = address::interface_address(interface);
    if ipv6 {
        socket
            .set_multicast_if_v6(index)
            .map_err(error::socket_error)
    } else {
        socket
            .set_multicast_if_v4(&v4_interface.unwrap_or(Ipv4Addr::UNSPECIFIED))
            .map_err(error::socket_error)
    }
}

pub fn set_mcast_ttl(socket: &Socket, ttl: u32, ipv6: bool) -> Result<()> {
    if ipv6 {
        socket
            .set_multicast_hops_v6(ttl)
            .map_err(error::socket_error)
    } else {
        socket
            .set_multicast_ttl_v4(ttl)
            .map_err(error::socket_error)
    }
}

pub fn is_multicast(address: &SocketAddr) -> bool {
    address.ip().is_multicast()
}

/// Wildcard address of the family of `address`, used to bind a multicast
/// listener.
pub fn any_address_like(address: &SocketAddr) -> SocketAddr {
    let ip = match address {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, address.port())
}

/// Human readable description of a connected socket, optionally going
/// through a proxy.
pub fn describe(socket: &Socket, proxy: Option<&SocketAddr>, target: Option<&SocketAddr>) -> String {
    let local = local_address(socket)
        .map(|a| address::addr_to_string(&a))
        .unwrap_or_else(|| "<not bound>".to_string());
    let mut description = format!("local address = {local}");

    match proxy {
        Some(proxy) => {
            description.push_str(&format!(
                "\nproxy address = {}",
                address::addr_to_string(proxy)
            ));
            if let Some(target) = target {
                description.push_str(&format!(
                    "\nremote address = {}",
                    address::addr_to_string(target)
                ));
            }
        }
        None => {
            let remote = remote_address(socket)
                .map(|a| address::addr_to_string(&a))
                .unwrap_or_else(|| "<not connected>".to_string());
            description.push_str(&format!("\nremote address = {remote}"));
        }
    }
    description
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_size_request_saturates() {
        assert_eq!(buffer_size_request(65536), 65536);
        assert_eq!(buffer_size_request(i32::MAX as usize), i32::MAX);
        assert_eq!(buffer_size_request(usize::MAX), i32::MAX);
    }
}
