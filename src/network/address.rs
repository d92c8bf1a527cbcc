//! Address resolution and formatting helpers.
//!
//! Resolution has two speeds: a non-blocking pass that only accepts numeric
//! literals, used on the caller's thread, and a blocking pass through the
//! system resolver, used by the host resolver thread.

use std::ffi::CStr;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use crate::error::{Result, TransportError};

/// IP families a runtime is allowed to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolSupport {
    Ipv4,
    Ipv6,
    Both,
}

impl ProtocolSupport {
    pub fn allows(self, address: &IpAddr) -> bool {
        match (self, address) {
            (Self::Both, _) => true,
            (Self::Ipv4, IpAddr::V4(_)) => true,
            (Self::Ipv6, IpAddr::V6(_)) => true,
            _ => false,
        }
    }
}

/// Resolves `host` to the socket addresses a client may connect to.
///
/// An empty host resolves to the loopback addresses of the enabled
/// families. When `can_block` is false only numeric literals are resolved
/// and an empty list means "needs a DNS lookup".
///
/// # Errors
/// Returns [`TransportError::DnsFailure`] when a blocking lookup fails or
/// yields no address of an enabled family.
pub fn get_addresses(
    host: &str,
    port: u16,
    protocol: ProtocolSupport,
    prefer_ipv6: bool,
    can_block: bool,
) -> Result<Vec<SocketAddr>> {
    let mut addresses = Vec::new();

    if host.is_empty() {
        if protocol != ProtocolSupport::Ipv6 {
            addresses.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
        }
        if protocol != ProtocolSupport::Ipv4 {
            addresses.push(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port));
        }
        sort_by_preference(&mut addresses, prefer_ipv6);
        return Ok(addresses);
    }

    if let Some(ip) = parse_numeric(host) {
        if !protocol.allows(&ip) {
            return Err(TransportError::DnsFailure {
                host: host.to_string(),
                reason: "address family not enabled".to_string(),
            });
        }
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    if !can_block {
        return Ok(addresses);
    }

    let resolved = (host, port)
        .to_socket_addrs()
        .map_err(|error| TransportError::DnsFailure {
            host: host.to_string(),
            reason: error.to_string(),
        })?;

    for address in resolved {
        if protocol.allows(&address.ip()) && !addresses.contains(&address) {
            addresses.push(address);
        }
    }

    if addresses.is_empty() {
        return Err(TransportError::DnsFailure {
            host: host.to_string(),
            reason: "no address of an enabled family".to_string(),
        });
    }

    sort_by_preference(&mut addresses, prefer_ipv6);
    Ok(addresses)
}

/// Resolves the address a server socket binds to. An empty host is the
/// wildcard address of the widest enabled family.
pub fn get_address_for_server(
    host: &str,
    port: u16,
    protocol: ProtocolSupport,
    prefer_ipv6: bool,
    can_block: bool,
) -> Result<SocketAddr> {
    if host.is_empty() {
        let ip = if protocol == ProtocolSupport::Ipv4 {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        };
        return Ok(SocketAddr::new(ip, port));
    }

    get_addresses(host, port, protocol, prefer_ipv6, can_block)?
        .into_iter()
        .next()
        .ok_or_else(|| TransportError::DnsFailure {
            host: host.to_string(),
            reason: "no address".to_string(),
        })
}

/// Parses a numeric IP literal, accepting bracketed IPv6 and a `%scope`
/// suffix on link-local IPv6 addresses.
pub fn parse_numeric(host: &str) -> Option<IpAddr> {
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let host = host.split('%').next().unwrap_or(host);
    host.parse().ok()
}

/// True for an empty host or an unspecified address literal.
pub fn is_wildcard(host: &str) -> bool {
    host.is_empty() || parse_numeric(host).is_some_and(|ip| ip.is_unspecified())
}

/// Orders addresses so the preferred family comes first, keeping the
/// resolver's order within a family.
fn sort_by_preference(addresses: &mut [SocketAddr], prefer_ipv6: bool) {
    addresses.sort_by_key(|address| address.is_ipv6() != prefer_ipv6);
}

/// Formats an IP address the way endpoint strings carry it (IPv6 without
/// brackets).
pub fn ip_to_string(ip: &IpAddr) -> String {
    ip.to_string()
}

/// Formats `address:port`, bracketing IPv6 addresses.
pub fn addr_to_string(address: &SocketAddr) -> String {
    address.to_string()
}

pub fn addrs_to_string(addresses: &[SocketAddr]) -> String {
    addresses
        .iter()
        .map(addr_to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Returns the numeric addresses of the local interfaces of the enabled
/// families. Loopback addresses are only included when requested or when
/// no other address exists.
pub fn local_addresses(protocol: ProtocolSupport, include_loopback: bool) -> Vec<IpAddr> {
    let all = interface_addresses()
        .into_iter()
        .map(|(_, ip)| ip)
        .filter(|ip| protocol.allows(ip))
        .filter(|ip| !matches!(ip, IpAddr::V6(v6) if is_link_local_v6(v6)))
        .collect::<Vec<_>>();

    let mut result: Vec<IpAddr> = Vec::new();
    for ip in all.iter().filter(|ip| include_loopback || !ip.is_loopback()) {
        if !result.contains(ip) {
            result.push(*ip);
        }
    }

    if result.is_empty() && !include_loopback {
        for ip in all.iter().filter(|ip| ip.is_loopback()) {
            if !result.contains(ip) {
                result.push(*ip);
            }
        }
    }
    result
}

/// Returns the hosts a wildcard endpoint expands to. A concrete host
/// returns an empty list.
pub fn hosts_for_endpoint_expand(
    host: &str,
    protocol: ProtocolSupport,
    include_loopback: bool,
) -> Vec<String> {
    if !is_wildcard(host) {
        return Vec::new();
    }

    let protocol = match parse_numeric(host) {
        Some(IpAddr::V4(_)) => ProtocolSupport::Ipv4,
        _ => protocol,
    };

    local_addresses(protocol, include_loopback)
        .iter()
        .map(ip_to_string)
        .collect()
}

/// Resolves a multicast interface given either as a numeric address or an
/// interface name. Returns the IPv4 address and the interface index.
pub fn interface_address(name: &str) -> (Option<Ipv4Addr>, u32) {
    if name.is_empty() {
        return (None, 0);
    }
    if let Some(ip) = parse_numeric(name) {
        return match ip {
            IpAddr::V4(v4) => (Some(v4), 0),
            IpAddr::V6(v6) => (None, index_for_address(&v6)),
        };
    }

    let v4 = interface_addresses()
        .into_iter()
        .find_map(|(interface, ip)| match ip {
            IpAddr::V4(v4) if interface == name => Some(v4),
            _ => None,
        });

    let index = match std::ffi::CString::new(name) {
        Ok(cname) => unsafe { libc::if_nametoindex(cname.as_ptr()) },
        Err(_) => 0,
    };
    (v4, index)
}

fn index_for_address(address: &Ipv6Addr) -> u32 {
    interface_addresses()
        .into_iter()
        .find(|(_, ip)| *ip == IpAddr::V6(*address))
        .and_then(|(interface, _)| std::ffi::CString::new(interface).ok())
        .map(|cname| unsafe { libc::if_nametoindex(cname.as_ptr()) })
        .unwrap_or(0)
}

fn is_link_local_v6(address: &Ipv6Addr) -> bool {
    (address.segments()[0] & 0xffc0) == 0xfe80
}

/// Lists `(interface name, address)` pairs of the host's interfaces that
/// are up.
fn interface_addresses() -> Vec<(String, IpAddr)> {
    let mut result = Vec::new();
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();

    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return result;
    }

    let mut current = head;
    while !current.is_null() {
        let entry = unsafe { &*current };
        current = entry.ifa_next;

        if entry.ifa_addr.is_null() || entry.ifa_flags & libc::IFF_UP as u32 == 0 {
            continue;
        }

        let name = unsafe { CStr::from_ptr(entry.ifa_name) }
            .to_string_lossy()
            .into_owned();

        let family = unsafe { (*entry.ifa_addr).sa_family } as i32;
        let ip = match family {
            libc::AF_INET => {
                let addr = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in) };
                IpAddr::V4(Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)))
            }
            libc::AF_INET6 => {
                let addr = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in6) };
                IpAddr::V6(Ipv6Addr::from(addr.sin6_addr.s6_addr))
            }
            _ => continue,
        };
        result.push((name, ip));
    }

    unsafe { libc::freeifaddrs(head) };
    result
}
