//! WebSocket transceiver layered over a stream transceiver.
//!
//! The HTTP upgrade is exchanged during `initialize`, after the wrapped
//! transceiver finished its own handshake. Each buffer handed to `write`
//! is sent as one binary frame; `read` strips frame headers and hands the
//! payload bytes back, answering pings and close frames on the way.

use std::fmt::Write as _;
use std::os::fd::RawFd;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::buffer::Buffer;
use crate::error::{Result, TransportError};
use crate::instance::{NETWORK, ProtocolInstance};
use crate::network::http::{self, HttpMessage, StartLine};
use crate::operation::SocketOperation;
use crate::transceiver::{ConnectionInfo, Transceiver, TransceiverState};
use crate::ws::frame::{self, FrameHeader};

/// Sub-protocol announced in `Sec-WebSocket-Protocol`.
pub const WS_PROTOCOL: &str = "rpc.transport";

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const WS_VERSION: &str = "13";

const READ_CHUNK: usize = 4096;
const MAX_HANDSHAKE: usize = 16 * 1024;

/// `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Delegate,
    UpgradeWrite,
    UpgradeRead,
    Opened,
    Closed,
}

/// Payload still expected for the data frame being read.
#[derive(Debug, Clone, Copy)]
struct InFrame {
    remaining: u64,
    mask: Option<[u8; 4]>,
    offset: u64,
}

pub struct WsTransceiver {
    instance: Arc<ProtocolInstance>,
    delegate: Box<dyn Transceiver>,
    incoming: bool,
    host: String,
    resource: String,
    key: String,
    phase: Phase,
    headers: Vec<(String, String)>,
    /// Bytes pulled off the wrapped transceiver and not consumed yet.
    raw_in: Vec<u8>,
    in_frame: Option<InFrame>,
    /// Bytes being written: a control frame, a data frame or the upgrade.
    wire: Buffer,
    data_in_flight: bool,
    control_out: Vec<u8>,
    /// A queued control frame could not be flushed from `read`.
    control_pending: bool,
    closing: bool,
    close_sent: bool,
    close_received: bool,
}

impl WsTransceiver {
    pub(crate) fn client(
        instance: Arc<ProtocolInstance>,
        delegate: Box<dyn Transceiver>,
        host: String,
        resource: String,
    ) -> Self {
        Self::new(instance, delegate, false, host, resource)
    }

    pub(crate) fn server(instance: Arc<ProtocolInstance>, delegate: Box<dyn Transceiver>) -> Self {
        Self::new(instance, delegate, true, String::new(), String::new())
    }

    fn new(
        instance: Arc<ProtocolInstance>,
        delegate: Box<dyn Transceiver>,
        incoming: bool,
        host: String,
        resource: String,
    ) -> Self {
        Self {
            instance,
            delegate,
            incoming,
            host,
            resource,
            key: String::new(),
            phase: Phase::Delegate,
            headers: Vec::new(),
            raw_in: Vec::new(),
            in_frame: None,
            wire: Buffer::new(),
            data_in_flight: false,
            control_out: Vec::new(),
            control_pending: false,
            closing: false,
            close_sent: false,
            close_received: false,
        }
    }

    /// Clients mask every frame they send; servers never do.
    fn outgoing_mask(&self) -> Result<Option<[u8; 4]>> {
        if self.incoming {
            Ok(None)
        } else {
            frame::random_bytes().map(Some)
        }
    }

    /// Pulls available bytes from the wrapped transceiver. Returns false
    /// when nothing could be read without blocking.
    fn fill_raw(&mut self) -> Result<bool> {
        let mut chunk = Buffer::with_len(READ_CHUNK);
        self.delegate.read(&mut chunk)?;
        let count = chunk.position();
        self.raw_in.extend_from_slice(chunk.filled());
        Ok(count > 0)
    }

    /// Writes `wire` until drained. `NONE` once everything went out.
    fn flush_wire(&mut self) -> Result<SocketOperation> {
        loop {
            if self.wire.is_full() {
                if self.control_out.is_empty() {
                    self.wire.clear();
                    return Ok(SocketOperation::NONE);
                }
                self.wire.reset(std::mem::take(&mut self.control_out));
            }
            let operation = self.delegate.write(&mut self.wire)?;
            if !operation.is_none() {
                return Ok(operation);
            }
        }
    }

    fn build_request(&mut self) -> Result<()> {
        let key: [u8; 16] = frame::random_bytes()?;
        self.key = STANDARD.encode(key);
        let resource = if self.resource.is_empty() {
            "/"
        } else {
            self.resource.as_str()
        };

        let mut request = String::new();
        let _ = write!(
            request,
            "GET {resource} HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Protocol: {WS_PROTOCOL}\r\n\
             Sec-WebSocket-Version: {WS_VERSION}\r\n\
             Sec-WebSocket-Key: {}\r\n\r\n",
            self.host, self.key
        );
        self.wire.reset(request.into_bytes());
        Ok(())
    }

    /// Reads until a complete HTTP head is buffered. `None` means the
    /// caller must wait for more input.
    fn read_head(&mut self) -> Result<Option<HttpMessage>> {
        loop {
            if let Some(end) = http::header_end(&self.raw_in) {
                let message = HttpMessage::parse(&self.raw_in[..end])?;
                self.raw_in.drain(..end);
                return Ok(Some(message));
            }
            if self.raw_in.len() > MAX_HANDSHAKE {
                return Err(TransportError::protocol("WebSocket handshake too large"));
            }
            if !self.fill_raw()? {
                return Ok(None);
            }
        }
    }

    fn check_response(&self, response: &HttpMessage) -> Result<()> {
        if response.status() != Some(101) {
            return Err(TransportError::protocol(format!(
                "unexpected status {:?} in WebSocket upgrade response",
                response.status()
            )));
        }
        if !response.header_has_token("Upgrade", "websocket") {
            return Err(TransportError::protocol("missing `Upgrade: websocket' in response"));
        }
        if !response.header_has_token("Connection", "upgrade") {
            return Err(TransportError::protocol("missing `Connection: Upgrade' in response"));
        }
        if let Some(protocol) = response.header("Sec-WebSocket-Protocol")
            && protocol != WS_PROTOCOL
        {
            return Err(TransportError::protocol(format!(
                "server selected unknown sub-protocol `{protocol}'"
            )));
        }
        match response.header("Sec-WebSocket-Accept") {
            Some(accept) if accept == accept_key(&self.key) => Ok(()),
            _ => Err(TransportError::protocol("invalid Sec-WebSocket-Accept value")),
        }
    }

    /// Validates an upgrade request and returns the response to send.
    fn answer_request(request: &HttpMessage) -> Result<String> {
        match &request.start {
            StartLine::Request {
                method, version, ..
            } if method == "GET" && *version >= (1, 1) => {}
            _ => {
                return Err(TransportError::protocol(
                    "WebSocket upgrade must be an HTTP/1.1 GET request",
                ));
            }
        }
        if !request.header_has_token("Upgrade", "websocket") {
            return Err(TransportError::protocol("missing `Upgrade: websocket' in request"));
        }
        if !request.header_has_token("Connection", "upgrade") {
            return Err(TransportError::protocol("missing `Connection: Upgrade' in request"));
        }
        if request.header("Sec-WebSocket-Version") != Some(WS_VERSION) {
            return Err(TransportError::protocol("unsupported WebSocket version"));
        }
        if request.header("Sec-WebSocket-Protocol").is_some()
            && !request.header_has_token("Sec-WebSocket-Protocol", WS_PROTOCOL)
        {
            return Err(TransportError::protocol(format!(
                "client did not offer the `{WS_PROTOCOL}' sub-protocol"
            )));
        }
        let key = request
            .header("Sec-WebSocket-Key")
            .ok_or_else(|| TransportError::protocol("missing Sec-WebSocket-Key"))?;

        Ok(format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Protocol: {WS_PROTOCOL}\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(key)
        ))
    }

    fn opened(&mut self) {
        self.phase = Phase::Opened;
        if self.instance.trace_level() >= 1 {
            debug!(
                target: NETWORK,
                "{} connection HTTP upgrade {}\n{}",
                self.instance.protocol(),
                if self.incoming { "accepted" } else { "completed" },
                self.delegate.describe()
            );
        }
    }

    fn queue_control(&mut self, opcode: u8, payload: &[u8]) -> Result<()> {
        let mask = self.outgoing_mask()?;
        self.control_out
            .extend_from_slice(&frame::encode_frame(opcode, payload, mask));
        Ok(())
    }

    /// Sends queued control frames unless a data frame is half written.
    fn flush_control(&mut self) -> Result<SocketOperation> {
        if self.data_in_flight {
            return Ok(SocketOperation::WRITE);
        }
        self.flush_wire()
    }

    /// Flushes control frames queued while reading and remembers whether
    /// the caller still has to wait for `WRITE`.
    fn flush_pending_control(&mut self) -> Result<SocketOperation> {
        let operation = self.flush_control()?;
        self.control_pending = !operation.is_none();
        Ok(operation)
    }

    fn handle_control(&mut self, opcode: u8, payload: &[u8]) -> Result<()> {
        match opcode {
            frame::OP_PING => {
                self.queue_control(frame::OP_PONG, payload)?;
                self.flush_pending_control()?;
                Ok(())
            }
            frame::OP_PONG => Ok(()),
            frame::OP_CLOSE => {
                self.close_received = true;
                let code = match payload {
                    [high, low, ..] => u16::from_be_bytes([*high, *low]),
                    _ => frame::CLOSURE_NORMAL,
                };
                if self.instance.trace_level() >= 2 {
                    debug!(
                        target: NETWORK,
                        code,
                        "received {} close frame\n{}",
                        self.instance.protocol(),
                        self.delegate.describe()
                    );
                }
                if !self.close_sent {
                    self.close_sent = true;
                    let replied = self
                        .queue_control(frame::OP_CLOSE, &code.to_be_bytes())
                        .and_then(|()| self.flush_pending_control());
                    if let Err(error) = replied {
                        debug!(
                            target: NETWORK,
                            %error,
                            "cannot answer {} close frame\n{}",
                            self.instance.protocol(),
                            self.delegate.describe()
                        );
                    }
                }
                Err(TransportError::ConnectionLost { source: None })
            }
            other => Err(TransportError::protocol(format!(
                "unsupported control frame opcode {other:#x}"
            ))),
        }
    }

    /// Consumes one frame header (and a whole control frame) from
    /// `raw_in`. Returns false when more bytes are needed.
    fn next_frame(&mut self) -> Result<bool> {
        let Some((header, header_len)) = FrameHeader::decode(&self.raw_in)? else {
            return Ok(false);
        };

        match (self.incoming, header.mask.is_some()) {
            (true, false) => return Err(TransportError::protocol("client frame is not masked")),
            (false, true) => return Err(TransportError::protocol("server frame is masked")),
            _ => {}
        }

        if header.is_control() {
            let total = header_len + header.payload_len as usize;
            if self.raw_in.len() < total {
                return Ok(false);
            }
            let mut payload: Vec<u8> = self.raw_in[header_len..total].to_vec();
            if let Some(mask) = header.mask {
                frame::apply_mask(&mut payload, mask, 0);
            }
            self.raw_in.drain(..total);
            self.handle_control(header.opcode, &payload)?;
            return Ok(true);
        }

        match header.opcode {
            frame::OP_BINARY | frame::OP_CONTINUATION => {}
            frame::OP_TEXT => {
                return Err(TransportError::protocol("text frames are not supported"));
            }
            other => {
                return Err(TransportError::protocol(format!(
                    "unsupported frame opcode {other:#x}"
                )));
            }
        }

        self.raw_in.drain(..header_len);
        if header.payload_len > 0 {
            self.in_frame = Some(InFrame {
                remaining: header.payload_len,
                mask: header.mask,
                offset: 0,
            });
        }
        Ok(true)
    }
}

impl Transceiver for WsTransceiver {
    fn fd(&self) -> RawFd {
        self.delegate.fd()
    }

    fn initialize(&mut self, read_buf: &mut Buffer, write_buf: &mut Buffer) -> Result<SocketOperation> {
        loop {
            match self.phase {
                Phase::Delegate => {
                    let operation = self.delegate.initialize(read_buf, write_buf)?;
                    if !operation.is_none() {
                        return Ok(operation);
                    }
                    if self.incoming {
                        self.phase = Phase::UpgradeRead;
                    } else {
                        self.build_request()?;
                        self.phase = Phase::UpgradeWrite;
                    }
                }
                Phase::UpgradeWrite => {
                    let operation = self.flush_wire()?;
                    if !operation.is_none() {
                        return Ok(operation);
                    }
                    if self.incoming {
                        self.opened();
                    } else {
                        self.phase = Phase::UpgradeRead;
                    }
                }
                Phase::UpgradeRead => {
                    let Some(message) = self.read_head()? else {
                        return Ok(SocketOperation::READ);
                    };
                    self.headers = message.headers().to_vec();
                    if self.incoming {
                        let response = Self::answer_request(&message)?;
                        self.wire.reset(response.into_bytes());
                        self.phase = Phase::UpgradeWrite;
                    } else {
                        self.check_response(&message)?;
                        self.opened();
                    }
                }
                Phase::Opened => return Ok(SocketOperation::NONE),
                Phase::Closed => {
                    return Err(TransportError::InvalidState(
                        "initialize on a closed transceiver".to_string(),
                    ));
                }
            }
        }
    }

    fn closing(&mut self, initiator: bool, reason: Option<&TransportError>) -> SocketOperation {
        self.closing = true;
        if self.phase == Phase::Opened && !self.close_sent {
            let code = match reason {
                None => frame::CLOSURE_NORMAL,
                Some(TransportError::Protocol { .. }) => frame::CLOSURE_PROTOCOL_ERROR,
                Some(_) => frame::CLOSURE_SHUTDOWN,
            };
            self.close_sent = true;
            if let Err(error) = self.queue_control(frame::OP_CLOSE, &code.to_be_bytes()) {
                debug!(target: NETWORK, %error, "cannot queue {} close frame", self.instance.protocol());
            }
        }

        let pending = matches!(self.flush_control(), Ok(operation) if !operation.is_none());
        let delegate = self.delegate.closing(initiator && !self.close_received, reason);
        if pending {
            SocketOperation::WRITE
        } else {
            delegate
        }
    }

    fn close(&mut self) {
        self.delegate.close();
        self.phase = Phase::Closed;
        self.raw_in.clear();
        self.wire.clear();
        self.control_out.clear();
    }

    fn write(&mut self, buf: &mut Buffer) -> Result<SocketOperation> {
        loop {
            if self.wire.is_full() {
                self.wire.clear();
                if self.data_in_flight {
                    self.data_in_flight = false;
                    buf.set_position(buf.len());
                }
                if !self.control_out.is_empty() {
                    self.wire.reset(std::mem::take(&mut self.control_out));
                } else if buf.is_full() {
                    self.control_pending = false;
                    return Ok(SocketOperation::NONE);
                } else if self.close_sent || self.phase == Phase::Closed {
                    return Err(TransportError::ConnectionLost { source: None });
                } else if self.phase != Phase::Opened {
                    return Err(TransportError::InvalidState(
                        "write before the WebSocket upgrade completed".to_string(),
                    ));
                } else {
                    let mask = self.outgoing_mask()?;
                    self.wire
                        .reset(frame::encode_frame(frame::OP_BINARY, buf.remaining_slice(), mask));
                    self.data_in_flight = true;
                }
            }

            let operation = self.delegate.write(&mut self.wire)?;
            if !operation.is_none() {
                return Ok(operation);
            }
        }
    }

    fn read(&mut self, buf: &mut Buffer) -> Result<SocketOperation> {
        loop {
            if buf.is_full() {
                return Ok(SocketOperation::NONE);
            }

            if let Some(mut in_frame) = self.in_frame {
                if !self.raw_in.is_empty() {
                    let count = (in_frame.remaining.min(self.raw_in.len() as u64) as usize)
                        .min(buf.remaining());
                    let target = &mut buf.remaining_mut()[..count];
                    target.copy_from_slice(&self.raw_in[..count]);
                    if let Some(mask) = in_frame.mask {
                        frame::apply_mask(target, mask, in_frame.offset);
                    }
                    self.raw_in.drain(..count);
                    buf.advance(count);

                    in_frame.remaining -= count as u64;
                    in_frame.offset += count as u64;
                    self.in_frame = (in_frame.remaining > 0).then_some(in_frame);
                    continue;
                }
            } else if self.next_frame()? {
                continue;
            }

            if !self.fill_raw()? {
                if self.control_pending {
                    let operation = self.flush_pending_control()?;
                    return Ok(SocketOperation::READ | operation);
                }
                return Ok(SocketOperation::READ);
            }
        }
    }

    fn has_pending_data(&self) -> bool {
        let buffered = match self.in_frame {
            Some(_) => !self.raw_in.is_empty(),
            None => matches!(FrameHeader::decode(&self.raw_in), Ok(Some(_)) | Err(_)),
        };
        (self.phase == Phase::Opened && buffered) || self.delegate.has_pending_data()
    }

    fn protocol(&self) -> &str {
        self.instance.protocol()
    }

    fn state(&self) -> TransceiverState {
        match self.phase {
            Phase::Closed => TransceiverState::Closed,
            _ if self.closing => TransceiverState::Closing,
            Phase::Delegate => self.delegate.state(),
            Phase::UpgradeWrite | Phase::UpgradeRead => TransceiverState::ConnectPending,
            Phase::Opened => TransceiverState::Connected,
        }
    }

    fn describe(&self) -> String {
        self.delegate.describe()
    }

    fn to_detail_string(&self) -> String {
        self.delegate.to_detail_string()
    }

    fn info(&self) -> ConnectionInfo {
        let underlying = self.delegate.info();
        ConnectionInfo {
            protocol: self.instance.protocol().to_string(),
            incoming: underlying.incoming,
            adapter_name: underlying.adapter_name.clone(),
            connection_id: underlying.connection_id.clone(),
            local_address: underlying.local_address,
            remote_address: underlying.remote_address,
            rcv_size: underlying.rcv_size,
            snd_size: underlying.snd_size,
            headers: self.headers.clone(),
            underlying: Some(Box::new(underlying)),
            ..ConnectionInfo::default()
        }
    }

    fn check_send_size(&self, buf: &Buffer) -> Result<()> {
        self.delegate.check_send_size(buf)
    }

    fn set_buffer_size(&mut self, rcv_size: usize, snd_size: usize) -> Result<()> {
        self.delegate.set_buffer_size(rcv_size, snd_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc_sample() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn request_without_key_is_rejected() {
        let head = b"GET / HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\n\
                     Connection: Upgrade\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let request = HttpMessage::parse(head).unwrap();
        assert!(WsTransceiver::answer_request(&request).is_err());
    }

    #[test]
    fn request_with_foreign_protocol_is_rejected() {
        let head = b"GET / HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\n\
                     Connection: keep-alive, Upgrade\r\nSec-WebSocket-Version: 13\r\n\
                     Sec-WebSocket-Protocol: chat\r\nSec-WebSocket-Key: abc\r\n\r\n";
        let request = HttpMessage::parse(head).unwrap();
        assert!(WsTransceiver::answer_request(&request).is_err());
    }

    #[test]
    fn response_carries_accept_key() {
        let head = b"GET /chat HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\n\
                     Connection: Upgrade\r\nSec-WebSocket-Version: 13\r\n\
                     Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
        let request = HttpMessage::parse(head).unwrap();
        let response = WsTransceiver::answer_request(&request).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 "));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    }
}
