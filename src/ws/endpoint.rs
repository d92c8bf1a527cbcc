//! WebSocket endpoint, layered over any registered stream transport.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::endpoint::{Endpoint, parse_options, quote_if_needed};
use crate::error::{Result, TransportError};
use crate::instance::ProtocolInstance;
use crate::stream::{InputStream, OutputStream};

#[derive(Debug, Clone)]
pub struct WsEndpoint {
    pub(crate) instance: Arc<ProtocolInstance>,
    pub(crate) delegate: Arc<Endpoint>,
    resource: String,
}

impl WsEndpoint {
    /// Wraps an already parsed underlying endpoint and consumes `-r`.
    pub(crate) fn parse(
        instance: Arc<ProtocolInstance>,
        delegate: Arc<Endpoint>,
        args: &mut Vec<String>,
    ) -> Result<Self> {
        let mut resource = String::new();
        parse_options(instance.protocol(), args, |option, argument, endpoint| {
            if option != "-r" {
                return Ok(false);
            }
            if argument.is_empty() {
                return Err(TransportError::parse(format!(
                    "no argument provided for -r option in endpoint {endpoint}"
                )));
            }
            resource = argument.to_string();
            Ok(true)
        })?;

        Ok(Self {
            instance,
            delegate,
            resource,
        })
    }

    /// Decodes the resource written after the underlying body.
    pub(crate) fn read(
        instance: Arc<ProtocolInstance>,
        delegate: Arc<Endpoint>,
        stream: &mut InputStream,
    ) -> Result<Self> {
        let resource = stream.read_string()?;
        Ok(Self {
            instance,
            delegate,
            resource,
        })
    }

    pub(crate) fn write(&self, stream: &mut OutputStream) {
        self.delegate.write_body(stream);
        stream.write_string(&self.resource);
    }

    pub(crate) fn options(&self, out: &mut String) {
        out.push_str(&self.delegate.options());
        if !self.resource.is_empty() {
            out.push_str(" -r ");
            out.push_str(&quote_if_needed(&self.resource));
        }
    }

    pub fn instance(&self) -> &Arc<ProtocolInstance> {
        &self.instance
    }

    pub fn delegate(&self) -> &Arc<Endpoint> {
        &self.delegate
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Same resource over a different underlying endpoint.
    pub(crate) fn with_delegate(&self, delegate: Arc<Endpoint>) -> Self {
        Self {
            delegate,
            ..self.clone()
        }
    }

    /// `host:port` of the underlying endpoint, sent as the HTTP `Host`.
    pub(crate) fn http_host(&self) -> String {
        match self.delegate.ip() {
            Some(ip) if ip.host().contains(':') => format!("[{}]:{}", ip.host(), ip.port()),
            Some(ip) => format!("{}:{}", ip.host(), ip.port()),
            None => String::new(),
        }
    }

    fn key(&self) -> (&Endpoint, &str) {
        (&self.delegate, &self.resource)
    }
}

impl PartialEq for WsEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for WsEndpoint {}

impl PartialOrd for WsEndpoint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WsEndpoint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

impl Hash for WsEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}
