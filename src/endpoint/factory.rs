//! Endpoint factories, one per registered transport type.
//!
//! Layered factories are built in two steps: they are registered knowing
//! only the type id of their carrier, and
//! [`initialize`](EndpointFactory::initialize) later looks that carrier up
//! and clones it bound to the layered transport's protocol instance. The
//! "is layered" capability is the [`EndpointFactory::Ws`] variant itself.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::endpoint::manager::EndpointFactoryManager;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::instance::ProtocolInstance;
use crate::stream::InputStream;
use crate::tcp::endpoint::TcpEndpoint;
use crate::udp::endpoint::UdpEndpoint;
use crate::ws::endpoint::WsEndpoint;

pub enum EndpointFactory {
    Tcp(Arc<ProtocolInstance>),
    Udp(Arc<ProtocolInstance>),
    Ws(LayeredEndpointFactory),
    Underlying(UnderlyingEndpointFactory),
}

/// A WebSocket factory over the carrier registered for `underlying_type`.
pub struct LayeredEndpointFactory {
    instance: Arc<ProtocolInstance>,
    underlying_type: i16,
    underlying: OnceLock<Box<EndpointFactory>>,
}

/// Registers a layered transport under its own type id but over a
/// different carrier, e.g. `wss` as WebSocket over an encrypted stream.
///
/// On initialization the factory registered for `layered_type` is cloned
/// with this factory's protocol instance and `underlying_type` as carrier.
/// If that factory is not layered this factory stays empty and creates
/// nothing.
pub struct UnderlyingEndpointFactory {
    instance: Arc<ProtocolInstance>,
    layered_type: i16,
    underlying_type: i16,
    factory: OnceLock<Box<EndpointFactory>>,
}

impl EndpointFactory {
    pub fn tcp(instance: Arc<ProtocolInstance>) -> Self {
        Self::Tcp(instance)
    }

    pub fn udp(instance: Arc<ProtocolInstance>) -> Self {
        Self::Udp(instance)
    }

    pub fn ws(instance: Arc<ProtocolInstance>, underlying_type: i16) -> Self {
        Self::Ws(LayeredEndpointFactory {
            instance,
            underlying_type,
            underlying: OnceLock::new(),
        })
    }

    pub fn underlying(
        instance: Arc<ProtocolInstance>,
        layered_type: i16,
        underlying_type: i16,
    ) -> Self {
        Self::Underlying(UnderlyingEndpointFactory {
            instance,
            layered_type,
            underlying_type,
            factory: OnceLock::new(),
        })
    }

    pub fn instance(&self) -> &Arc<ProtocolInstance> {
        match self {
            Self::Tcp(instance) | Self::Udp(instance) => instance,
            Self::Ws(layered) => &layered.instance,
            Self::Underlying(underlying) => &underlying.instance,
        }
    }

    pub fn type_id(&self) -> i16 {
        self.instance().type_id()
    }

    pub fn protocol(&self) -> &str {
        self.instance().protocol()
    }

    pub fn is_layered(&self) -> bool {
        matches!(self, Self::Ws(_))
    }

    /// Resolves carrier factories through `manager`. A carrier that is not
    /// registered leaves the factory unable to create endpoints.
    pub fn initialize(&self, manager: &EndpointFactoryManager) {
        match self {
            Self::Tcp(_) | Self::Udp(_) => {}
            Self::Ws(layered) => {
                if layered.underlying.get().is_some() {
                    return;
                }
                let Some(carrier) = manager.get(layered.underlying_type) else {
                    debug!(
                        protocol = layered.instance.protocol(),
                        underlying_type = layered.underlying_type,
                        "no carrier factory registered"
                    );
                    return;
                };
                if let Some(clone) = carrier.clone_with(layered.instance.clone()) {
                    let _ = layered.underlying.set(Box::new(clone));
                }
            }
            Self::Underlying(underlying) => {
                if underlying.factory.get().is_some() {
                    return;
                }
                let Some(layered) = manager.get(underlying.layered_type) else {
                    return;
                };
                if let Some(factory) = layered
                    .clone_with_underlying(underlying.instance.clone(), underlying.underlying_type)
                {
                    factory.initialize(manager);
                    let _ = underlying.factory.set(Box::new(factory));
                }
            }
        }
    }

    /// A copy of this factory producing endpoints bound to `instance`.
    /// `None` for factories that cannot be rebound.
    pub fn clone_with(&self, instance: Arc<ProtocolInstance>) -> Option<Self> {
        match self {
            Self::Tcp(_) => Some(Self::Tcp(instance)),
            Self::Udp(_) => Some(Self::Udp(instance)),
            Self::Ws(layered) => Some(Self::ws(instance, layered.underlying_type)),
            Self::Underlying(_) => None,
        }
    }

    /// A copy of a layered factory over a different carrier. `None` for
    /// non-layered factories.
    pub fn clone_with_underlying(
        &self,
        instance: Arc<ProtocolInstance>,
        underlying_type: i16,
    ) -> Option<Self> {
        match self {
            Self::Ws(_) => Some(Self::ws(instance, underlying_type)),
            _ => None,
        }
    }

    /// Creates an endpoint from option tokens, consuming the ones it
    /// recognizes. `Ok(None)` when a layered factory has no carrier.
    pub fn create(&self, args: &mut Vec<String>, adapter: bool) -> Result<Option<Endpoint>> {
        match self {
            Self::Tcp(instance) => {
                TcpEndpoint::parse(instance.clone(), args, adapter).map(|e| Some(Endpoint::Tcp(e)))
            }
            Self::Udp(instance) => {
                UdpEndpoint::parse(instance.clone(), args, adapter).map(|e| Some(Endpoint::Udp(e)))
            }
            Self::Ws(layered) => {
                let Some(carrier) = layered.underlying.get() else {
                    return Ok(None);
                };
                let Some(delegate) = carrier.create(args, adapter)? else {
                    return Ok(None);
                };
                let ws = WsEndpoint::parse(layered.instance.clone(), Arc::new(delegate), args)?;
                Ok(Some(Endpoint::Ws(ws)))
            }
            Self::Underlying(underlying) => match underlying.factory.get() {
                Some(factory) => factory.create(args, adapter),
                None => Ok(None),
            },
        }
    }

    /// Decodes an endpoint body from an open encapsulation.
    pub fn read(&self, stream: &mut InputStream) -> Result<Option<Endpoint>> {
        match self {
            Self::Tcp(instance) => {
                TcpEndpoint::read(instance.clone(), stream).map(|e| Some(Endpoint::Tcp(e)))
            }
            Self::Udp(instance) => {
                UdpEndpoint::read(instance.clone(), stream).map(|e| Some(Endpoint::Udp(e)))
            }
            Self::Ws(layered) => {
                let Some(carrier) = layered.underlying.get() else {
                    return Ok(None);
                };
                let Some(delegate) = carrier.read(stream)? else {
                    return Ok(None);
                };
                let ws = WsEndpoint::read(layered.instance.clone(), Arc::new(delegate), stream)?;
                Ok(Some(Endpoint::Ws(ws)))
            }
            Self::Underlying(underlying) => match underlying.factory.get() {
                Some(factory) => factory.read(stream),
                None => Ok(None),
            },
        }
    }
}

impl fmt::Debug for EndpointFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, carrier) = match self {
            Self::Tcp(_) => ("tcp", None),
            Self::Udp(_) => ("udp", None),
            Self::Ws(layered) => ("ws", Some(layered.underlying_type)),
            Self::Underlying(underlying) => ("underlying", Some(underlying.underlying_type)),
        };
        f.debug_struct("EndpointFactory")
            .field("kind", &kind)
            .field("type_id", &self.type_id())
            .field("protocol", &self.protocol())
            .field("carrier", &carrier)
            .finish()
    }
}
