//! Runtime context objects.
//!
//! [`TransportInstance`] is the per-runtime root: it owns the endpoint
//! factory registry, the host resolver, the selector and the typed
//! configuration. Each registered transport gets a [`ProtocolInstance`]
//! that endpoints, connectors and transceivers of that transport share.
//! The protocol instance refers back to its runtime through a `Weak`
//! handle, so dropping the runtime never leaks through an endpoint kept
//! alive elsewhere.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::endpoint::factory::EndpointFactory;
use crate::endpoint::manager::EndpointFactoryManager;
use crate::endpoint::{self, Endpoint};
use crate::error::{Result, TransportError};
use crate::network::address::ProtocolSupport;
use crate::network::proxy::NetworkProxy;
use crate::observer::TransportObserver;
use crate::resolver::{ConnectorsCallback, EndpointHostResolver};
use crate::selector::{EventSelector, Selector};
use crate::stream::InputStream;

/// Target of connection tracing events.
pub(crate) const NETWORK: &str = "rpc_transport::network";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Receive,
    Send,
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Receive => "receive",
            Self::Send => "send",
        })
    }
}

/// Per-transport context shared by an endpoint family.
pub struct ProtocolInstance {
    type_id: i16,
    protocol: String,
    secure: bool,
    config: Arc<TransportConfig>,
    transport: Weak<TransportInstance>,
}

impl fmt::Debug for ProtocolInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolInstance")
            .field("type_id", &self.type_id)
            .field("protocol", &self.protocol)
            .field("secure", &self.secure)
            .finish()
    }
}

impl ProtocolInstance {
    pub(crate) fn new(
        transport: Weak<TransportInstance>,
        config: Arc<TransportConfig>,
        type_id: i16,
        protocol: &str,
        secure: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            type_id,
            protocol: protocol.to_string(),
            secure,
            config,
            transport,
        })
    }

    /// Creates a protocol instance bound to no runtime. Endpoints created
    /// from it parse, marshal and connect to numeric addresses, but host
    /// name resolution fails with [`TransportError::Destroyed`].
    pub fn detached(
        config: Arc<TransportConfig>,
        type_id: i16,
        protocol: &str,
        secure: bool,
    ) -> Arc<Self> {
        Self::new(Weak::new(), config, type_id, protocol, secure)
    }

    pub fn type_id(&self) -> i16 {
        self.type_id
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn config(&self) -> &Arc<TransportConfig> {
        &self.config
    }

    pub fn trace_level(&self) -> i32 {
        self.config.network_trace_level
    }

    pub fn protocol_support(&self) -> ProtocolSupport {
        self.config.protocol_support
    }

    pub fn prefer_ipv6(&self) -> bool {
        self.config.prefer_ipv6
    }

    pub fn default_host(&self) -> &str {
        &self.config.default_host
    }

    pub fn default_source_address(&self) -> Option<IpAddr> {
        self.config.default_source_address
    }

    pub fn transport(&self) -> Option<Arc<TransportInstance>> {
        self.transport.upgrade()
    }

    /// Hands a host lookup to the runtime's resolver. Without a live
    /// runtime the callback fails immediately.
    pub(crate) fn resolve(
        &self,
        host: &str,
        port: u16,
        endpoint: Arc<Endpoint>,
        callback: ConnectorsCallback,
    ) {
        match self.transport.upgrade() {
            Some(transport) => transport.resolver().resolve(host, port, endpoint, callback),
            None => {
                if let Some(ip) = crate::network::address::parse_numeric(host)
                    && self.protocol_support().allows(&ip)
                {
                    let address = std::net::SocketAddr::new(ip, port);
                    callback(Ok(endpoint.connectors(&[address], None)));
                } else {
                    callback(Err(TransportError::Destroyed));
                }
            }
        }
    }

    pub(crate) fn buffer_size_adjusted(&self, kind: BufferKind, requested: i32, granted: i32) {
        match self.transport.upgrade() {
            Some(transport) => transport.warn_buffer_size(self, kind, requested, granted),
            None => warn!(
                protocol = %self.protocol,
                "{kind} buffer size: requested size of {requested} adjusted to {granted}"
            ),
        }
    }
}

/// Root object of one transport runtime.
pub struct TransportInstance {
    config: Arc<TransportConfig>,
    factories: EndpointFactoryManager,
    resolver: EndpointHostResolver,
    selector: Selector,
    proxy: Option<NetworkProxy>,
    observer: Option<Arc<dyn TransportObserver>>,
    buffer_warnings: Mutex<HashMap<(i16, BufferKind), i32>>,
    destroyed: AtomicBool,
}

impl TransportInstance {
    /// Creates a runtime with the built-in `tcp`, `udp` and `ws` factories
    /// registered but not yet initialized. Use
    /// [`TransportBuilder`](crate::TransportBuilder) unless extra factories
    /// must be added by hand.
    pub(crate) fn new(
        config: TransportConfig,
        observer: Option<Arc<dyn TransportObserver>>,
    ) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let proxy = match (&config.socks_proxy, &config.http_proxy) {
            (Some((host, port)), _) => Some(NetworkProxy::socks(host.clone(), *port)),
            (None, Some((host, port))) => Some(NetworkProxy::http(host.clone(), *port)),
            (None, None) => None,
        };

        let resolver = EndpointHostResolver::new(config.clone(), proxy.clone(), observer.clone())?;
        let selector = Selector::new()?;

        let transport = Arc::new(Self {
            config,
            factories: EndpointFactoryManager::new(),
            resolver,
            selector,
            proxy,
            observer,
            buffer_warnings: Mutex::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
        });

        let tcp = transport.protocol_instance(endpoint::TCP_ENDPOINT_TYPE, "tcp", false);
        transport.factories.add(EndpointFactory::tcp(tcp))?;
        let udp = transport.protocol_instance(endpoint::UDP_ENDPOINT_TYPE, "udp", false);
        transport.factories.add(EndpointFactory::udp(udp))?;
        let ws = transport.protocol_instance(endpoint::WS_ENDPOINT_TYPE, "ws", false);
        transport
            .factories
            .add(EndpointFactory::ws(ws, endpoint::TCP_ENDPOINT_TYPE))?;

        debug!(
            protocol_support = ?transport.config.protocol_support,
            proxy = transport.proxy.as_ref().map(NetworkProxy::name),
            "transport instance created"
        );
        Ok(transport)
    }

    /// Creates the protocol instance of a transport registered on this
    /// runtime.
    pub fn protocol_instance(
        self: &Arc<Self>,
        type_id: i16,
        protocol: &str,
        secure: bool,
    ) -> Arc<ProtocolInstance> {
        ProtocolInstance::new(
            Arc::downgrade(self),
            self.config.clone(),
            type_id,
            protocol,
            secure,
        )
    }

    pub fn config(&self) -> &Arc<TransportConfig> {
        &self.config
    }

    pub fn factories(&self) -> &EndpointFactoryManager {
        &self.factories
    }

    pub fn resolver(&self) -> &EndpointHostResolver {
        &self.resolver
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn network_proxy(&self) -> Option<&NetworkProxy> {
        self.proxy.as_ref()
    }

    pub fn observer(&self) -> Option<&Arc<dyn TransportObserver>> {
        self.observer.as_ref()
    }

    /// Parses an endpoint string. `Ok(None)` means no factory handles the
    /// protocol named by the string.
    pub fn create_endpoint(&self, text: &str, adapter: bool) -> Result<Option<Arc<Endpoint>>> {
        if self.is_destroyed() {
            return Err(TransportError::Destroyed);
        }
        self.factories.create(text, adapter, &self.config.default_protocol)
    }

    /// Decodes an endpoint written by [`Endpoint::stream_write`].
    pub fn read_endpoint(&self, stream: &mut InputStream) -> Result<Arc<Endpoint>> {
        if self.is_destroyed() {
            return Err(TransportError::Destroyed);
        }
        self.factories.read(stream)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Shuts the runtime down: fails queued lookups, joins the resolver
    /// thread, drops the factories and closes the selector. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.resolver.destroy();
        self.factories.destroy();
        self.selector.destroy();
        debug!("transport instance destroyed");
    }

    /// Logs a buffer size adjustment, once per transport, direction and
    /// requested size.
    pub(crate) fn warn_buffer_size(
        &self,
        instance: &ProtocolInstance,
        kind: BufferKind,
        requested: i32,
        granted: i32,
    ) {
        let mut warnings = self.buffer_warnings.lock();
        let key = (instance.type_id(), kind);
        if warnings.get(&key) == Some(&requested) {
            return;
        }
        warnings.insert(key, requested);
        warn!(
            protocol = instance.protocol(),
            "{kind} buffer size: requested size of {requested} adjusted to {granted}"
        );
    }
}

impl Drop for TransportInstance {
    fn drop(&mut self) {
        self.destroy();
    }
}
