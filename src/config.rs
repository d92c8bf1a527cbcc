//! Configuration source and the typed transport settings derived from it.
//!
//! [`Properties`] is a plain string key/value store, loadable from
//! `key = value` text. [`TransportConfig`] is the typed snapshot the
//! transports read at runtime; it is built once from properties and shared
//! behind an `Arc`.

use std::collections::BTreeMap;
use std::net::IpAddr;

use tracing::warn;

use crate::error::{Result, TransportError};
use crate::network::address::ProtocolSupport;

pub const DEFAULT_PROTOCOL: &str = "Transport.Default.Protocol";
pub const DEFAULT_HOST: &str = "Transport.Default.Host";
pub const DEFAULT_TIMEOUT: &str = "Transport.Default.Timeout";
pub const DEFAULT_SOURCE_ADDRESS: &str = "Transport.Default.SourceAddress";
pub const IPV4: &str = "Transport.IPv4";
pub const IPV6: &str = "Transport.IPv6";
pub const PREFER_IPV6: &str = "Transport.PreferIPv6Address";
pub const TCP_BACKLOG: &str = "Transport.TCP.Backlog";
pub const TCP_RCV_SIZE: &str = "Transport.TCP.RcvSize";
pub const TCP_SND_SIZE: &str = "Transport.TCP.SndSize";
pub const UDP_RCV_SIZE: &str = "Transport.UDP.RcvSize";
pub const UDP_SND_SIZE: &str = "Transport.UDP.SndSize";
pub const SOCKS_PROXY_HOST: &str = "Transport.SOCKSProxyHost";
pub const SOCKS_PROXY_PORT: &str = "Transport.SOCKSProxyPort";
pub const HTTP_PROXY_HOST: &str = "Transport.HTTPProxyHost";
pub const HTTP_PROXY_PORT: &str = "Transport.HTTPProxyPort";
pub const TRACE_NETWORK: &str = "Transport.Trace.Network";

/// String key/value configuration source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `key = value` lines. Blank lines and lines starting with `#`
    /// are ignored; a line without `=` is an error.
    pub fn parse(text: &str) -> Result<Self> {
        let mut properties = Self::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(TransportError::Config(format!(
                    "line {}: expected `key = value', found `{line}'",
                    index + 1
                )));
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(TransportError::Config(format!(
                    "line {}: empty property key",
                    index + 1
                )));
            }
            properties.set(key, value.trim());
        }
        Ok(properties)
    }

    /// Sets a property; an empty value removes it.
    pub fn set(&mut self, key: &str, value: &str) {
        if value.is_empty() {
            self.entries.remove(key);
        } else {
            self.entries.insert(key.to_string(), value.to_string());
        }
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    /// Reads an integer property. A non-numeric value logs a warning and
    /// yields the default.
    pub fn get_int_or(&self, key: &str, default: i32) -> i32 {
        match self.get(key) {
            None => default,
            Some(value) => value.parse().unwrap_or_else(|_| {
                warn!(
                    property = key,
                    value, "numeric property set to non-numeric value, using default {default}"
                );
                default
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Typed transport settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Protocol substituted for `default` in endpoint strings.
    pub default_protocol: String,
    /// Host used by client endpoints that do not specify `-h`.
    pub default_host: String,
    /// Timeout in milliseconds for TCP endpoints without `-t`; `-1` is
    /// infinite.
    pub default_timeout: i32,
    /// Source address bound by client endpoints without `--sourceAddress`.
    pub default_source_address: Option<IpAddr>,
    pub protocol_support: ProtocolSupport,
    pub prefer_ipv6: bool,
    pub tcp_backlog: i32,
    /// Requested TCP receive buffer size, `None` keeps the OS default.
    pub tcp_rcv_size: Option<i32>,
    pub tcp_snd_size: Option<i32>,
    pub udp_rcv_size: Option<i32>,
    pub udp_snd_size: Option<i32>,
    /// SOCKS4 proxy host and port for outgoing TCP connections.
    pub socks_proxy: Option<(String, u16)>,
    /// HTTP `CONNECT` proxy host and port for outgoing TCP connections.
    pub http_proxy: Option<(String, u16)>,
    pub network_trace_level: i32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default_protocol: "tcp".to_string(),
            default_host: String::new(),
            default_timeout: 60_000,
            default_source_address: None,
            protocol_support: ProtocolSupport::Both,
            prefer_ipv6: false,
            tcp_backlog: libc::SOMAXCONN,
            tcp_rcv_size: None,
            tcp_snd_size: None,
            udp_rcv_size: None,
            udp_snd_size: None,
            socks_proxy: None,
            http_proxy: None,
            network_trace_level: 0,
        }
    }
}

impl TransportConfig {
    /// Builds the typed settings from a property set.
    ///
    /// # Errors
    /// Returns [`TransportError::Config`] when both IP families are
    /// disabled, the default source address is not a numeric IP address,
    /// both proxy kinds are configured, or a proxy port is out of range.
    pub fn from_properties(properties: &Properties) -> Result<Self> {
        let defaults = Self::default();

        let ipv4 = properties.get_int_or(IPV4, 1) > 0;
        let ipv6 = properties.get_int_or(IPV6, 1) > 0;
        let protocol_support = match (ipv4, ipv6) {
            (true, true) => ProtocolSupport::Both,
            (true, false) => ProtocolSupport::Ipv4,
            (false, true) => ProtocolSupport::Ipv6,
            (false, false) => {
                return Err(TransportError::Config(
                    "both IPv4 and IPv6 support are disabled".to_string(),
                ));
            }
        };

        let default_source_address = match properties.get(DEFAULT_SOURCE_ADDRESS) {
            None => None,
            Some(value) => Some(value.parse::<IpAddr>().map_err(|_| {
                TransportError::Config(format!(
                    "invalid IP address set for {DEFAULT_SOURCE_ADDRESS}: `{value}'"
                ))
            })?),
        };

        let mut default_timeout = properties.get_int_or(DEFAULT_TIMEOUT, defaults.default_timeout);
        if default_timeout < 1 && default_timeout != -1 {
            warn!(
                property = DEFAULT_TIMEOUT,
                value = default_timeout,
                "invalid default timeout, using {}",
                defaults.default_timeout
            );
            default_timeout = defaults.default_timeout;
        }

        let socks_proxy = proxy_setting(properties, SOCKS_PROXY_HOST, SOCKS_PROXY_PORT)?;
        let http_proxy = proxy_setting(properties, HTTP_PROXY_HOST, HTTP_PROXY_PORT)?;
        if socks_proxy.is_some() && http_proxy.is_some() {
            return Err(TransportError::Config(
                "only one of the SOCKS and HTTP proxies can be configured".to_string(),
            ));
        }

        Ok(Self {
            default_protocol: properties.get_or(DEFAULT_PROTOCOL, &defaults.default_protocol),
            default_host: properties.get_or(DEFAULT_HOST, ""),
            default_timeout,
            default_source_address,
            protocol_support,
            prefer_ipv6: properties.get_int_or(PREFER_IPV6, 0) > 0,
            tcp_backlog: properties.get_int_or(TCP_BACKLOG, defaults.tcp_backlog),
            tcp_rcv_size: size_setting(properties, TCP_RCV_SIZE),
            tcp_snd_size: size_setting(properties, TCP_SND_SIZE),
            udp_rcv_size: size_setting(properties, UDP_RCV_SIZE),
            udp_snd_size: size_setting(properties, UDP_SND_SIZE),
            socks_proxy,
            http_proxy,
            network_trace_level: properties.get_int_or(TRACE_NETWORK, 0),
        })
    }
}

fn size_setting(properties: &Properties, key: &str) -> Option<i32> {
    match properties.get_int_or(key, 0) {
        size if size > 0 => Some(size),
        _ => None,
    }
}

fn proxy_setting(
    properties: &Properties,
    host_key: &str,
    port_key: &str,
) -> Result<Option<(String, u16)>> {
    let Some(host) = properties.get(host_key) else {
        return Ok(None);
    };
    let port = properties.get_int_or(port_key, 1080);
    let port = u16::try_from(port)
        .map_err(|_| TransportError::Config(format!("{port_key} value {port} out of range")))?;
    Ok(Some((host.to_string(), port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_skips_comments_and_trims() {
        let properties = Properties::parse(
            "# transport settings\n\nTransport.TCP.Backlog = 16\n  Transport.Default.Host=localhost  \n",
        )
        .unwrap();
        assert_eq!(properties.len(), 2);
        assert_eq!(properties.get_int_or(TCP_BACKLOG, 0), 16);
        assert_eq!(properties.get(DEFAULT_HOST), Some("localhost"));
    }

    #[test]
    fn parse_rejects_lines_without_separator() {
        assert!(matches!(
            Properties::parse("Transport.IPv4"),
            Err(TransportError::Config(_))
        ));
    }

    #[test]
    fn non_numeric_integer_falls_back_to_default() {
        let properties = Properties::new().with(TCP_BACKLOG, "many");
        assert_eq!(properties.get_int_or(TCP_BACKLOG, 7), 7);
    }

    #[test]
    fn protocol_support_follows_family_switches() {
        let config = TransportConfig::from_properties(&Properties::new()).unwrap();
        assert_eq!(config.protocol_support, ProtocolSupport::Both);

        let config =
            TransportConfig::from_properties(&Properties::new().with(IPV6, "0")).unwrap();
        assert_eq!(config.protocol_support, ProtocolSupport::Ipv4);

        let both_off = Properties::new().with(IPV6, "0").with(IPV4, "0");
        assert!(TransportConfig::from_properties(&both_off).is_err());
    }

    #[test]
    fn proxies_are_mutually_exclusive() {
        let properties = Properties::new()
            .with(SOCKS_PROXY_HOST, "socks.local")
            .with(HTTP_PROXY_HOST, "http.local");
        assert!(TransportConfig::from_properties(&properties).is_err());

        let properties = Properties::new()
            .with(HTTP_PROXY_HOST, "http.local")
            .with(HTTP_PROXY_PORT, "3128");
        let config = TransportConfig::from_properties(&properties).unwrap();
        assert_eq!(config.http_proxy, Some(("http.local".to_string(), 3128)));
    }

    #[test]
    fn invalid_source_address_is_rejected() {
        let properties = Properties::new().with(DEFAULT_SOURCE_ADDRESS, "not-an-ip");
        assert!(TransportConfig::from_properties(&properties).is_err());
    }
}
