use std::os::fd::RawFd;
use std::sync::Arc;

use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::instance::ProtocolInstance;
use crate::transceiver::{Acceptor, AcceptorState, Transceiver};
use crate::ws::transceiver::WsTransceiver;

/// Accepts through the carrier acceptor; every accepted transceiver
/// expects an HTTP upgrade request.
pub struct WsAcceptor {
    endpoint: Arc<Endpoint>,
    instance: Arc<ProtocolInstance>,
    delegate: Box<dyn Acceptor>,
}

impl WsAcceptor {
    pub(crate) fn new(
        endpoint: Arc<Endpoint>,
        instance: Arc<ProtocolInstance>,
        delegate: Box<dyn Acceptor>,
    ) -> Self {
        Self {
            endpoint,
            instance,
            delegate,
        }
    }
}

impl Acceptor for WsAcceptor {
    fn fd(&self) -> RawFd {
        self.delegate.fd()
    }

    fn listen(&mut self) -> Result<Arc<Endpoint>> {
        let delegate = self.delegate.listen()?;
        if let Endpoint::Ws(ws) = self.endpoint.as_ref() {
            self.endpoint = Arc::new(Endpoint::Ws(ws.with_delegate(delegate)));
        }
        Ok(self.endpoint.clone())
    }

    fn accept(&mut self) -> Result<Option<Box<dyn Transceiver>>> {
        Ok(self.delegate.accept()?.map(|delegate| {
            Box::new(WsTransceiver::server(self.instance.clone(), delegate)) as Box<dyn Transceiver>
        }))
    }

    fn close(&mut self) {
        self.delegate.close();
    }

    fn protocol(&self) -> &str {
        self.instance.protocol()
    }

    fn state(&self) -> AcceptorState {
        self.delegate.state()
    }

    fn endpoint(&self) -> Arc<Endpoint> {
        self.endpoint.clone()
    }

    fn describe(&self) -> String {
        self.delegate.describe()
    }

    fn to_detail_string(&self) -> String {
        self.delegate.to_detail_string()
    }
}
