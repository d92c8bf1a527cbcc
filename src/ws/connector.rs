use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::connector::Connector;
use crate::error::Result;
use crate::instance::ProtocolInstance;
use crate::transceiver::Transceiver;
use crate::ws::transceiver::WsTransceiver;

/// Connects through the carrier connector, then upgrades to WebSocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    instance: Arc<ProtocolInstance>,
    delegate: Box<Connector>,
    host: String,
    resource: String,
}

impl WsConnector {
    pub(crate) fn new(
        instance: Arc<ProtocolInstance>,
        delegate: Connector,
        host: String,
        resource: String,
    ) -> Self {
        Self {
            instance,
            delegate: Box::new(delegate),
            host,
            resource,
        }
    }

    pub fn delegate(&self) -> &Connector {
        &self.delegate
    }

    pub fn type_id(&self) -> i16 {
        self.instance.type_id()
    }

    pub(crate) fn connect(&self) -> Result<Box<dyn Transceiver>> {
        let delegate = self.delegate.connect()?;
        Ok(Box::new(WsTransceiver::client(
            self.instance.clone(),
            delegate,
            self.host.clone(),
            self.resource.clone(),
        )))
    }

    fn key(&self) -> (i16, &Connector, &str) {
        (self.instance.type_id(), &self.delegate, &self.resource)
    }
}

impl fmt::Display for WsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.delegate, f)
    }
}

impl PartialEq for WsConnector {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for WsConnector {}

impl PartialOrd for WsConnector {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WsConnector {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

impl Hash for WsConnector {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}
