//! Fluent builder for [`TransportInstance`] construction.

use std::fmt;
use std::sync::Arc;

use crate::config::{Properties, TransportConfig};
use crate::endpoint::factory::EndpointFactory;
use crate::error::Result;
use crate::instance::TransportInstance;
use crate::observer::TransportObserver;

type FactoryInit = Box<dyn FnOnce(&Arc<TransportInstance>) -> EndpointFactory>;

/// Builder for a transport runtime.
///
/// The built-in `tcp`, `udp` and `ws` transports are always registered.
/// Extra factories (for instance `wss` as an underlying factory over a
/// secure carrier) are added with [`factory`](Self::factory) and all
/// layered factories are initialized once every factory is known.
///
/// # Example
/// ```ignore
/// let transport = TransportBuilder::new()
///     .properties(Properties::new().with("Transport.Trace.Network", "2"))
///     .build()?;
/// let endpoint = transport.create_endpoint("ws -h localhost -p 4062 -r /rpc", false)?;
/// ```
pub struct TransportBuilder {
    config: Option<TransportConfig>,
    properties: Properties,
    observer: Option<Arc<dyn TransportObserver>>,
    factories: Vec<FactoryInit>,
}

impl Default for TransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            properties: Properties::new(),
            observer: None,
            factories: Vec::new(),
        }
    }

    /// Settings read through [`TransportConfig::from_properties`]. Ignored
    /// when [`config`](Self::config) is also given.
    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn TransportObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Registers an additional factory, built once the runtime exists so
    /// it can create its protocol instance.
    pub fn factory(
        mut self,
        init: impl FnOnce(&Arc<TransportInstance>) -> EndpointFactory + 'static,
    ) -> Self {
        self.factories.push(Box::new(init));
        self
    }

    /// Creates the runtime, registers every factory and initializes the
    /// layered ones.
    ///
    /// # Errors
    /// Returns [`TransportError::Config`](crate::TransportError::Config) for
    /// invalid properties,
    /// [`TransportError::InvalidState`](crate::TransportError::InvalidState)
    /// for a duplicate factory type and
    /// [`TransportError::Socket`](crate::TransportError::Socket) if the
    /// selector cannot be created.
    pub fn build(self) -> Result<Arc<TransportInstance>> {
        let config = match self.config {
            Some(config) => config,
            None => TransportConfig::from_properties(&self.properties)?,
        };

        let transport = TransportInstance::new(config, self.observer)?;
        for init in self.factories {
            transport.factories().add(init(&transport))?;
        }
        transport.factories().initialize();
        Ok(transport)
    }
}

impl fmt::Debug for TransportBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportBuilder")
            .field("config", &self.config)
            .field("properties", &self.properties.len())
            .field("factories", &self.factories.len())
            .finish()
    }
}
