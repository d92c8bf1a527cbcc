//! Asynchronous host name resolution.
//!
//! [`EndpointHostResolver`] owns one worker thread and a FIFO of pending
//! lookups. Numeric hosts are answered inline on the caller's thread when
//! no network proxy is configured; everything else is queued and resolved
//! with a blocking lookup on the worker. Every request gets exactly one
//! callback, including the ones still queued when the resolver is
//! destroyed, which fail with [`TransportError::Destroyed`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::config::TransportConfig;
use crate::connector::Connector;
use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::instance::NETWORK;
use crate::network::address;
use crate::network::proxy::NetworkProxy;
use crate::observer::{ThreadState, TransportObserver};

/// Continuation of [`Endpoint::connectors_async`]. Invoked once, with the
/// connectors or with the reason the lookup failed.
pub type ConnectorsCallback = Box<dyn FnOnce(Result<Vec<Connector>>) + Send>;

const THREAD_NAME: &str = "rpc-transport-resolver";

struct ResolveRequest {
    host: String,
    port: u16,
    endpoint: Arc<Endpoint>,
    callback: ConnectorsCallback,
}

#[derive(Default)]
struct State {
    queue: VecDeque<ResolveRequest>,
    destroyed: bool,
}

struct Shared {
    state: Mutex<State>,
    available: Condvar,
    config: Arc<TransportConfig>,
    proxy: Option<NetworkProxy>,
    observer: Option<Arc<dyn TransportObserver>>,
}

pub struct EndpointHostResolver {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl EndpointHostResolver {
    /// Starts the worker thread.
    ///
    /// # Errors
    /// Returns [`TransportError::InvalidState`] if the thread cannot be
    /// spawned.
    pub fn new(
        config: Arc<TransportConfig>,
        proxy: Option<NetworkProxy>,
        observer: Option<Arc<dyn TransportObserver>>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            available: Condvar::new(),
            config,
            proxy,
            observer,
        });

        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(THREAD_NAME.to_string())
                .spawn(move || shared.run())
                .map_err(|e| {
                    TransportError::InvalidState(format!("cannot start {THREAD_NAME} thread: {e}"))
                })?
        };
        let worker_id = worker.thread().id();

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
            worker_id,
        })
    }

    /// Resolves `host:port` and builds the connectors of `endpoint`.
    ///
    /// Without a network proxy a numeric host (or the empty host, meaning
    /// loopback) is answered before this call returns. Otherwise the
    /// request is queued and `callback` runs on the resolver thread.
    pub fn resolve(
        &self,
        host: &str,
        port: u16,
        endpoint: Arc<Endpoint>,
        callback: ConnectorsCallback,
    ) {
        if self.shared.proxy.is_none() {
            let config = &self.shared.config;
            match address::get_addresses(
                host,
                port,
                config.protocol_support,
                config.prefer_ipv6,
                false,
            ) {
                Ok(addresses) if !addresses.is_empty() => {
                    callback(Ok(endpoint.connectors(&addresses, None)));
                    return;
                }
                Ok(_) => {}
                Err(error) => {
                    callback(Err(error));
                    return;
                }
            }
        }

        let mut state = self.shared.state.lock();
        if state.destroyed {
            drop(state);
            callback(Err(TransportError::Destroyed));
            return;
        }
        state.queue.push_back(ResolveRequest {
            host: host.to_string(),
            port,
            endpoint,
            callback,
        });
        drop(state);
        self.shared.available.notify_one();
    }

    /// Number of lookups waiting for the worker.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Stops the worker. Queued requests fail with
    /// [`TransportError::Destroyed`]; a lookup already running completes
    /// normally. Idempotent.
    pub fn destroy(&self) {
        let pending = {
            let mut state = self.shared.state.lock();
            state.destroyed = true;
            std::mem::take(&mut state.queue)
        };
        self.shared.available.notify_all();

        if !pending.is_empty() {
            debug!(count = pending.len(), "failing queued host lookups");
        }
        for request in pending {
            (request.callback)(Err(TransportError::Destroyed));
        }

        // The last runtime handle may be dropped from a callback running on
        // the worker itself.
        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(worker) = self.worker.lock().take()
            && worker.join().is_err()
        {
            warn!("{THREAD_NAME} thread panicked");
        }
    }
}

impl Drop for EndpointHostResolver {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for EndpointHostResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointHostResolver")
            .field("pending", &self.pending())
            .field("proxy", &self.shared.proxy)
            .finish()
    }
}

impl Shared {
    fn run(&self) {
        loop {
            let request = {
                let mut state = self.state.lock();
                while state.queue.is_empty() && !state.destroyed {
                    self.available.wait(&mut state);
                }
                if state.destroyed {
                    break;
                }
                match state.queue.pop_front() {
                    Some(request) => request,
                    None => continue,
                }
            };

            self.set_thread_state(ThreadState::Idle, ThreadState::InUseForOther);
            self.process(request);
            self.set_thread_state(ThreadState::InUseForOther, ThreadState::Idle);
        }

        // Requests queued between the last pop and `destroy` taking the
        // queue are failed by `destroy` itself.
        debug!("{THREAD_NAME} thread terminated");
    }

    fn process(&self, request: ResolveRequest) {
        let ResolveRequest {
            host,
            port,
            endpoint,
            callback,
        } = request;

        if let Some(observer) = &self.observer {
            observer.lookup_started(&endpoint);
        }

        let result = self.lookup(&host, port, &endpoint);

        if let Some(observer) = &self.observer {
            if let Err(error) = &result {
                observer.lookup_failed(&endpoint, error);
            }
            observer.lookup_detached(&endpoint);
        }

        if let Err(error) = &result
            && self.config.network_trace_level >= 1
        {
            debug!(
                target: NETWORK,
                %error,
                "failed to resolve {} host `{}'",
                endpoint.protocol(),
                host
            );
        }
        callback(result);
    }

    fn lookup(&self, host: &str, port: u16, endpoint: &Endpoint) -> Result<Vec<Connector>> {
        let mut protocol = self.config.protocol_support;
        let proxy = match &self.proxy {
            Some(proxy) => {
                let resolved = proxy.resolve_host(protocol, self.config.prefer_ipv6)?;
                protocol = resolved.protocol_support(protocol);
                Some(resolved)
            }
            None => None,
        };

        let addresses =
            address::get_addresses(host, port, protocol, self.config.prefer_ipv6, true)?;

        if self.config.network_trace_level >= 2 {
            trace!(
                target: NETWORK,
                "trying to establish {} connection to `{}:{}'\naddresses = {}",
                endpoint.protocol(),
                host,
                port,
                address::addrs_to_string(&addresses)
            );
        }

        Ok(endpoint.connectors(&addresses, proxy.as_ref()))
    }

    fn set_thread_state(&self, previous: ThreadState, current: ThreadState) {
        if let Some(observer) = &self.observer {
            observer.thread_state_changed(THREAD_NAME, previous, current);
        }
    }
}
