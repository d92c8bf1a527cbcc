use std::os::fd::RawFd;
use std::sync::Arc;

use tracing::debug;

use crate::buffer::Buffer;
use crate::error::{Result, TransportError};
use crate::instance::{NETWORK, ProtocolInstance};
use crate::network::stream_socket::{StreamSocket, StreamState};
use crate::operation::SocketOperation;
use crate::transceiver::{ConnectionInfo, Transceiver, TransceiverState};

/// Stream transceiver over a plain TCP socket.
#[derive(Debug)]
pub struct TcpTransceiver {
    instance: Arc<ProtocolInstance>,
    stream: StreamSocket,
    connection_id: String,
    adapter_name: String,
    incoming: bool,
    closing: bool,
}

impl TcpTransceiver {
    /// Client side; the connect is in progress inside `stream`.
    pub(crate) fn connecting(
        instance: Arc<ProtocolInstance>,
        stream: StreamSocket,
        connection_id: String,
    ) -> Self {
        Self {
            instance,
            stream,
            connection_id,
            adapter_name: String::new(),
            incoming: false,
            closing: false,
        }
    }

    /// Server side, wrapping an accepted socket.
    pub(crate) fn accepted(
        instance: Arc<ProtocolInstance>,
        stream: StreamSocket,
        adapter_name: &str,
    ) -> Self {
        Self {
            instance,
            stream,
            connection_id: String::new(),
            adapter_name: adapter_name.to_string(),
            incoming: true,
            closing: false,
        }
    }
}

impl Transceiver for TcpTransceiver {
    fn fd(&self) -> RawFd {
        self.stream.fd()
    }

    fn initialize(
        &mut self,
        _read_buf: &mut Buffer,
        _write_buf: &mut Buffer,
    ) -> Result<SocketOperation> {
        let was_connected = self.stream.is_connected();
        let operation = self.stream.connect().inspect_err(|error| {
            if self.instance.trace_level() >= 2 {
                debug!(
                    target: NETWORK,
                    %error,
                    "failed to establish {} connection\n{}",
                    self.instance.protocol(),
                    self.stream
                );
            }
        })?;

        if !was_connected && operation.is_none() && self.instance.trace_level() >= 1 {
            debug!(
                target: NETWORK,
                "established {} connection\n{}",
                self.instance.protocol(),
                self.stream
            );
        }
        Ok(operation)
    }

    fn closing(&mut self, initiator: bool, _reason: Option<&TransportError>) -> SocketOperation {
        self.closing = true;
        // The initiator waits for the peer to close its end first.
        if initiator {
            SocketOperation::READ
        } else {
            SocketOperation::NONE
        }
    }

    fn close(&mut self) {
        if self.stream.state() != StreamState::Closed && self.instance.trace_level() >= 1 {
            debug!(
                target: NETWORK,
                "closing {} connection\n{}",
                self.instance.protocol(),
                self.stream
            );
        }
        self.stream.close();
    }

    fn write(&mut self, buf: &mut Buffer) -> Result<SocketOperation> {
        self.stream.write(buf)
    }

    fn read(&mut self, buf: &mut Buffer) -> Result<SocketOperation> {
        self.stream.read(buf)
    }

    fn protocol(&self) -> &str {
        self.instance.protocol()
    }

    fn state(&self) -> TransceiverState {
        match self.stream.state() {
            StreamState::NeedConnect => TransceiverState::NeedConnect,
            StreamState::ConnectPending | StreamState::ProxyWrite | StreamState::ProxyRead => {
                TransceiverState::ConnectPending
            }
            StreamState::Connected if self.closing => TransceiverState::Closing,
            StreamState::Connected => TransceiverState::Connected,
            StreamState::Closed => TransceiverState::Closed,
        }
    }

    fn describe(&self) -> String {
        self.stream.description().to_string()
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            protocol: self.instance.protocol().to_string(),
            incoming: self.incoming,
            adapter_name: self.adapter_name.clone(),
            connection_id: self.connection_id.clone(),
            local_address: self.stream.local_address(),
            remote_address: self.stream.remote_address(),
            rcv_size: self.stream.recv_buffer_size(),
            snd_size: self.stream.send_buffer_size(),
            ..ConnectionInfo::default()
        }
    }

    fn set_buffer_size(&mut self, rcv_size: usize, snd_size: usize) -> Result<()> {
        self.stream.set_buffer_size(rcv_size, snd_size)
    }
}
