//! Registry of endpoint factories and entry point for endpoint parsing and
//! decoding.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::endpoint::factory::EndpointFactory;
use crate::endpoint::opaque::OpaqueEndpoint;
use crate::endpoint::{self, Endpoint};
use crate::error::{Result, TransportError};
use crate::stream::{InputStream, OutputStream};

#[derive(Debug, Default)]
pub struct EndpointFactoryManager {
    factories: RwLock<Vec<Arc<EndpointFactory>>>,
}

impl EndpointFactoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory.
    ///
    /// # Errors
    /// Returns [`TransportError::InvalidState`] if a factory for the same
    /// type id is already registered.
    pub fn add(&self, factory: EndpointFactory) -> Result<()> {
        let mut factories = self.factories.write();
        if factories.iter().any(|f| f.type_id() == factory.type_id()) {
            return Err(TransportError::InvalidState(format!(
                "endpoint factory for type {} ({}) already registered",
                factory.type_id(),
                factory.protocol()
            )));
        }
        factories.push(Arc::new(factory));
        Ok(())
    }

    pub fn get(&self, type_id: i16) -> Option<Arc<EndpointFactory>> {
        self.factories
            .read()
            .iter()
            .find(|f| f.type_id() == type_id)
            .cloned()
    }

    pub fn get_by_protocol(&self, protocol: &str) -> Option<Arc<EndpointFactory>> {
        self.factories
            .read()
            .iter()
            .find(|f| f.protocol() == protocol)
            .cloned()
    }

    /// Resolves the carriers of layered factories. Call once every factory
    /// is registered; calling again is harmless.
    pub fn initialize(&self) {
        let snapshot = self.factories.read().clone();
        for factory in &snapshot {
            factory.initialize(self);
        }
    }

    /// Parses an endpoint string.
    ///
    /// `default` as protocol name stands for `default_protocol`. `Ok(None)`
    /// means no factory handles the protocol. An `opaque` endpoint whose
    /// type has a factory is decoded into the real endpoint.
    pub fn create(
        &self,
        text: &str,
        adapter: bool,
        default_protocol: &str,
    ) -> Result<Option<Arc<Endpoint>>> {
        let text = text.trim();
        if text.is_empty() {
            return Err(TransportError::parse("value has no non-whitespace characters"));
        }
        let mut args = endpoint::tokenize(text)
            .ok_or_else(|| TransportError::parse(format!("mismatched quote in endpoint `{text}'")))?;
        if args.is_empty() {
            return Err(TransportError::parse("value has no non-whitespace characters"));
        }

        let mut protocol = args.remove(0);
        if protocol == "default" {
            protocol = default_protocol.to_string();
        }

        if let Some(factory) = self.get_by_protocol(&protocol) {
            let Some(endpoint) = factory.create(&mut args, adapter)? else {
                return Ok(None);
            };
            if !args.is_empty() {
                return Err(endpoint::unrecognized(&args, text));
            }
            return Ok(Some(Arc::new(endpoint)));
        }

        if protocol == "opaque" {
            let opaque = OpaqueEndpoint::parse(&mut args)?;
            if !args.is_empty() {
                return Err(endpoint::unrecognized(&args, text));
            }

            if let Some(factory) = self.get(opaque.type_id()) {
                let mut out = OutputStream::new();
                Endpoint::Opaque(opaque.clone()).stream_write(&mut out);
                let mut input = InputStream::new(out.finished());
                input.read_i16()?;
                input.start_encapsulation()?;
                let decoded = factory.read(&mut input)?;
                input.end_encapsulation()?;
                if let Some(decoded) = decoded {
                    return Ok(Some(Arc::new(decoded)));
                }
            }
            return Ok(Some(Arc::new(Endpoint::Opaque(opaque))));
        }

        Ok(None)
    }

    /// Decodes an endpoint: type id, then an encapsulation holding the
    /// body. Types without a factory decode as opaque endpoints.
    pub fn read(&self, stream: &mut InputStream) -> Result<Arc<Endpoint>> {
        let type_id = stream.read_i16()?;
        stream.start_encapsulation()?;

        let decoded = match self.get(type_id) {
            Some(factory) => factory.read(stream)?,
            None => None,
        };
        let endpoint = match decoded {
            Some(endpoint) => endpoint,
            None => Endpoint::Opaque(OpaqueEndpoint::read(type_id, stream)?),
        };

        stream.end_encapsulation()?;
        Ok(Arc::new(endpoint))
    }

    pub fn write(&self, endpoint: &Endpoint, stream: &mut OutputStream) {
        endpoint.stream_write(stream);
    }

    /// Drops every factory. Endpoints already created stay valid.
    pub fn destroy(&self) {
        self.factories.write().clear();
    }
}
