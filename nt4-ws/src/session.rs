use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::errors::{Error, Result};
use crate::frame::{
    encode_frame, max_fragment_payload, parse_frame, CloseCode, Frame, Opcode,
    DEFAULT_MAX_PACKET_SIZE,
};
use crate::handshake;
use crate::stream::{is_timeout, LineReader, Transport};

const READ_CHUNK: usize = 4096;

/// Supported message formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

impl MessageKind {
    fn opcode(self) -> Opcode {
        match self {
            MessageKind::Text => Opcode::Text,
            MessageKind::Binary => Opcode::Binary,
        }
    }
}

/// A data frame as delivered to the handler. While a fragmented message is
/// in flight the handler sees the accumulated payload with
/// `is_fragment == true`; completion arrives with `is_fragment == false`.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageFrame {
    pub is_fragment: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Receive-loop callbacks. Pings are answered internally and never reach
/// the handler.
pub trait SessionHandler {
    fn on_message(&mut self, frame: &MessageFrame);
    fn on_pong(&mut self, _payload: &[u8]) {}
    fn on_close(&mut self, _code: u16, _reason: &str) {}
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Frames larger than this (header included) are fragmented.
    pub max_packet_size: usize,
    /// How long a send blocks on the send mutex before giving up.
    pub send_timeout: Duration,
    /// Receive-loop poll interval; also bounds how fast a disconnect is
    /// noticed.
    pub read_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            send_timeout: Duration::from_millis(1000),
            read_timeout: Duration::from_millis(1000),
        }
    }
}

/// The write half of a session. Cheap to share; every send serializes on
/// the internal mutex so bytes from one call stay contiguous on the wire.
pub struct MessageSender<T> {
    writer: Mutex<T>,
    /// Second handle to the same socket, used to break a blocked peer
    /// without waiting on the send mutex.
    ctrl: T,
    masking: bool,
    config: SessionConfig,
    connected: AtomicBool,
    close_sent: AtomicBool,
}

impl<T: Transport> MessageSender<T> {
    fn new(writer: T, ctrl: T, masking: bool, config: SessionConfig) -> Self {
        MessageSender {
            writer: Mutex::new(writer),
            ctrl,
            masking,
            config,
            connected: AtomicBool::new(true),
            close_sent: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn close_was_sent(&self) -> bool {
        self.close_sent.load(Ordering::SeqCst)
    }

    /// Drops the transport. Safe from any thread; the receive loop exits
    /// on its next tick.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.ctrl.shutdown();
        }
    }

    /// Sends one message, fragmenting as needed. Returns false when not
    /// connected, when the send mutex cannot be acquired in time, or on a
    /// transport error.
    pub fn send(&self, payload: &[u8], kind: MessageKind) -> bool {
        self.send_data(kind.opcode(), payload)
    }

    pub fn ping(&self, payload: &[u8]) -> bool {
        self.send_control(Opcode::Ping, payload)
    }

    pub(crate) fn pong(&self, payload: &[u8]) -> bool {
        self.send_control(Opcode::Pong, payload)
    }

    /// Sends the Close frame once; later calls are no-ops. The session
    /// finishes the handshake when the peer's Close arrives.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        if self.close_sent.swap(true, Ordering::SeqCst) {
            return false;
        }
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        self.send_control(Opcode::Close, &payload)
    }

    fn mask_key(&self) -> Option<[u8; 4]> {
        if self.masking {
            Some(rand::random())
        } else {
            None
        }
    }

    fn send_control(&self, opcode: Opcode, payload: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        let mut writer = match self.writer.try_lock_for(self.config.send_timeout) {
            Some(writer) => writer,
            None => return false,
        };
        let wire = encode_frame(opcode, true, self.mask_key(), payload);
        self.write_wire(&mut writer, &wire)
    }

    fn send_data(&self, opcode: Opcode, payload: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        let mut writer = match self.writer.try_lock_for(self.config.send_timeout) {
            Some(writer) => writer,
            None => return false,
        };

        let budget = max_fragment_payload(self.config.max_packet_size, self.masking);
        if payload.len() <= budget {
            let wire = encode_frame(opcode, true, self.mask_key(), payload);
            return self.write_wire(&mut writer, &wire);
        }

        // First fragment keeps the opcode, the rest are continuations,
        // each with its own mask.
        let mut offset = 0;
        let mut first = true;
        while offset < payload.len() {
            let end = (offset + budget).min(payload.len());
            let fin = end == payload.len();
            let chunk_opcode = if first { opcode } else { Opcode::Continuation };
            let wire = encode_frame(chunk_opcode, fin, self.mask_key(), &payload[offset..end]);
            if !self.write_wire(&mut writer, &wire) {
                return false;
            }
            offset = end;
            first = false;
        }
        true
    }

    fn write_wire(&self, writer: &mut T, wire: &[u8]) -> bool {
        match writer.write_all(wire) {
            Ok(()) => true,
            Err(err) => {
                debug!("send failed, marking disconnected: {}", err);
                self.connected.store(false, Ordering::SeqCst);
                false
            }
        }
    }
}

/// How the message loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseState {
    /// The close handshake completed with the peer's code and reason.
    Graceful { code: u16, reason: String },
    /// The transport dropped without a close handshake.
    Abnormal,
}

impl CloseState {
    pub fn code(&self) -> u16 {
        match self {
            CloseState::Graceful { code, .. } => *code,
            CloseState::Abnormal => CloseCode::ClosedAbnormally as u16,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            CloseState::Graceful { reason, .. } => reason,
            CloseState::Abnormal => "",
        }
    }
}

/// One WebSocket connection. The owner drives `run_message_loop` on its
/// thread; everything else talks to the connection through the shared
/// [`MessageSender`].
pub struct WebSocket<T: Transport> {
    reader: T,
    buf: Vec<u8>,
    sender: Arc<MessageSender<T>>,
    /// Opcode and accumulated payload of a fragmented message in flight.
    current: Option<(Opcode, Vec<u8>)>,
    peer_close: Option<(u16, String)>,
    protocol: String,
}

impl<T: Transport> WebSocket<T> {
    /// Wraps an accepted connection whose server handshake already ran.
    /// `leftover` carries any bytes read past the handshake. Server side
    /// never masks.
    pub fn accept(transport: T, leftover: Vec<u8>, config: SessionConfig) -> Result<Self> {
        transport.set_read_timeout(Some(config.read_timeout))?;
        let writer = transport.try_clone()?;
        let ctrl = transport.try_clone()?;
        Ok(WebSocket {
            reader: transport,
            buf: leftover,
            sender: Arc::new(MessageSender::new(writer, ctrl, false, config)),
            current: None,
            peer_close: None,
            protocol: String::new(),
        })
    }

    /// Performs the client handshake over an established transport.
    /// Client side masks all outbound payloads.
    pub fn connect(
        transport: T,
        host: &str,
        path: &str,
        protocols: &[String],
        config: SessionConfig,
    ) -> Result<Self> {
        transport.set_read_timeout(Some(Duration::from_secs(5)))?;
        let mut reader = LineReader::new(transport);
        let protocol = handshake::client_handshake(&mut reader, host, path, protocols)?;
        let (transport, leftover) = reader.into_parts();

        transport.set_read_timeout(Some(config.read_timeout))?;
        let writer = transport.try_clone()?;
        let ctrl = transport.try_clone()?;
        Ok(WebSocket {
            reader: transport,
            buf: leftover,
            sender: Arc::new(MessageSender::new(writer, ctrl, true, config)),
            current: None,
            peer_close: None,
            protocol,
        })
    }

    /// The subprotocol the server accepted (client side; empty if none).
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn sender(&self) -> Arc<MessageSender<T>> {
        Arc::clone(&self.sender)
    }

    pub fn is_connected(&self) -> bool {
        self.sender.is_connected()
    }

    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.sender.close(code, reason)
    }

    /// Runs the receive loop on the calling thread until the connection
    /// ends, dispatching frames to `handler`.
    pub fn run_message_loop<H: SessionHandler>(&mut self, handler: &mut H) -> CloseState {
        while self.sender.is_connected() && self.peer_close.is_none() {
            match self.next_frame() {
                Ok(Some(frame)) => {
                    if let Err(err) = self.handle_frame(frame, handler) {
                        debug!("closing connection: {}", err);
                        self.sender.disconnect();
                        break;
                    }
                }
                Ok(None) => continue,
                Err(Error::Closed) => {
                    self.sender.disconnect();
                    break;
                }
                Err(err) => {
                    debug!("receive failed: {}", err);
                    self.sender.disconnect();
                    break;
                }
            }
        }

        match self.peer_close.take() {
            Some((code, reason)) => CloseState::Graceful { code, reason },
            None => CloseState::Abnormal,
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if !self.buf.is_empty() {
                enum Step {
                    Parsed(usize, Frame),
                    Incomplete,
                }
                let step = match parse_frame::<(&[u8], nom::error::ErrorKind)>(&self.buf) {
                    Ok((rest, frame)) => Step::Parsed(self.buf.len() - rest.len(), frame),
                    Err(nom::Err::Incomplete(_)) => Step::Incomplete,
                    Err(_) => return Err(Error::Protocol("invalid frame header")),
                };
                if let Step::Parsed(consumed, frame) = step {
                    self.buf.drain(..consumed);
                    return Ok(Some(frame));
                }
            }

            let mut chunk = [0u8; READ_CHUNK];
            match self.reader.read(&mut chunk) {
                Ok(0) => return Err(Error::Closed),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(ref err) if is_timeout(err) => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn handle_frame<H: SessionHandler>(&mut self, frame: Frame, handler: &mut H) -> Result<()> {
        if frame.opcode.is_control() && !frame.fin {
            return Err(Error::Protocol("fragmented control frame"));
        }

        if !frame.fin {
            match frame.opcode {
                Opcode::Continuation => match self.current.as_mut() {
                    Some((_, payload)) => payload.extend_from_slice(&frame.payload),
                    None => return Err(Error::Protocol("continuation without a fragment")),
                },
                _ => self.current = Some((frame.opcode, frame.payload)),
            }

            let (opcode, payload) = self.current.as_ref().expect("fragment in flight");
            handler.on_message(&MessageFrame {
                is_fragment: true,
                opcode: *opcode,
                payload: payload.clone(),
            });
            return Ok(());
        }

        match frame.opcode {
            Opcode::Continuation => {
                let (opcode, mut payload) = self
                    .current
                    .take()
                    .ok_or(Error::Protocol("continuation without a fragment"))?;
                payload.extend_from_slice(&frame.payload);
                handler.on_message(&MessageFrame {
                    is_fragment: false,
                    opcode,
                    payload,
                });
            }
            Opcode::Text | Opcode::Binary => {
                handler.on_message(&MessageFrame {
                    is_fragment: false,
                    opcode: frame.opcode,
                    payload: frame.payload,
                });
            }
            Opcode::Ping => {
                trace!("ping ({} bytes)", frame.payload.len());
                self.sender.pong(&frame.payload);
            }
            Opcode::Pong => handler.on_pong(&frame.payload),
            Opcode::Close => {
                let (code, reason) = parse_close_payload(&frame.payload);
                if !self.sender.close_was_sent() {
                    // Passive close: echo the status before dropping.
                    self.sender.close(code, &reason);
                }
                self.peer_close = Some((code, reason.clone()));
                handler.on_close(code, &reason);
                self.sender.disconnect();
            }
        }
        Ok(())
    }
}

fn parse_close_payload(payload: &[u8]) -> (u16, String) {
    if payload.len() >= 2 {
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
        (code, reason)
    } else {
        (CloseCode::NoStatus as u16, String::new())
    }
}

#[cfg(test)]
mod tests {
    use nom::error::ErrorKind;

    use crate::stream::testing::MockTransport;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        messages: Vec<MessageFrame>,
        pongs: Vec<Vec<u8>>,
        closes: Vec<(u16, String)>,
    }

    impl SessionHandler for Recorder {
        fn on_message(&mut self, frame: &MessageFrame) {
            self.messages.push(frame.clone());
        }

        fn on_pong(&mut self, payload: &[u8]) {
            self.pongs.push(payload.to_vec());
        }

        fn on_close(&mut self, code: u16, reason: &str) {
            self.closes.push((code, reason.to_owned()));
        }
    }

    fn session_over(chunks: Vec<Vec<u8>>) -> (WebSocket<MockTransport>, MockTransport) {
        let transport = MockTransport::new(chunks);
        let ws = WebSocket::accept(transport.clone(), Vec::new(), SessionConfig::default())
            .expect("accept");
        (ws, transport)
    }

    fn parse_written(mut bytes: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        while !bytes.is_empty() {
            let (rest, frame) =
                parse_frame::<(&[u8], ErrorKind)>(bytes).expect("valid frame written");
            frames.push(frame);
            bytes = rest;
        }
        frames
    }

    #[test]
    fn ping_is_answered_with_matching_pong() {
        let ping = encode_frame(Opcode::Ping, true, Some([1, 2, 3, 4]), b"marco");
        let (mut ws, transport) = session_over(vec![ping]);
        let mut handler = Recorder::default();

        let state = ws.run_message_loop(&mut handler);

        assert_eq!(state, CloseState::Abnormal);
        let written = transport.written();
        let frames = parse_written(&written);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, Opcode::Pong);
        assert_eq!(frames[0].payload, b"marco");
        assert!(handler.messages.is_empty());
    }

    #[test]
    fn fragments_reassemble_in_order() {
        let chunks = vec![
            encode_frame(Opcode::Text, false, None, b"He"),
            encode_frame(Opcode::Continuation, false, None, b"ll"),
            encode_frame(Opcode::Continuation, true, None, b"o"),
        ];
        let (mut ws, _transport) = session_over(chunks);
        let mut handler = Recorder::default();
        ws.run_message_loop(&mut handler);

        assert_eq!(handler.messages.len(), 3);
        assert!(handler.messages[0].is_fragment);
        assert_eq!(handler.messages[0].payload, b"He");
        assert!(handler.messages[1].is_fragment);
        assert_eq!(handler.messages[1].payload, b"Hell");
        assert!(!handler.messages[2].is_fragment);
        assert_eq!(handler.messages[2].opcode, Opcode::Text);
        assert_eq!(handler.messages[2].payload, b"Hello");
    }

    #[test]
    fn control_frames_interleave_with_fragments() {
        let chunks = vec![
            encode_frame(Opcode::Binary, false, None, &[1, 2]),
            encode_frame(Opcode::Ping, true, None, b"x"),
            encode_frame(Opcode::Continuation, true, None, &[3]),
        ];
        let (mut ws, transport) = session_over(chunks);
        let mut handler = Recorder::default();
        ws.run_message_loop(&mut handler);

        let complete: Vec<_> = handler.messages.iter().filter(|m| !m.is_fragment).collect();
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].payload, vec![1, 2, 3]);

        let frames = parse_written(&transport.written());
        assert_eq!(frames[0].opcode, Opcode::Pong);
    }

    #[test]
    fn passive_close_echoes_and_reports() {
        let mut payload = 1001u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        let close = encode_frame(Opcode::Close, true, None, &payload);

        let (mut ws, transport) = session_over(vec![close]);
        let mut handler = Recorder::default();
        let state = ws.run_message_loop(&mut handler);

        assert_eq!(
            state,
            CloseState::Graceful {
                code: 1001,
                reason: "bye".to_owned()
            }
        );
        assert_eq!(handler.closes, vec![(1001, "bye".to_owned())]);

        let frames = parse_written(&transport.written());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, Opcode::Close);
        assert_eq!(&frames[0].payload[..2], &1001u16.to_be_bytes());
        assert!(transport.is_shutdown());
    }

    #[test]
    fn active_close_completes_on_peer_echo() {
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"done");
        let echo = encode_frame(Opcode::Close, true, None, &payload);

        let (mut ws, transport) = session_over(vec![echo]);
        ws.close(1000, "done");
        let mut handler = Recorder::default();
        let state = ws.run_message_loop(&mut handler);

        assert_eq!(state.code(), 1000);
        // only our original close frame went out, no echo of the echo
        let frames = parse_written(&transport.written());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, Opcode::Close);
    }

    #[test]
    fn bad_opcode_disconnects() {
        let (mut ws, transport) = session_over(vec![vec![0x83, 0x00]]);
        let mut handler = Recorder::default();
        let state = ws.run_message_loop(&mut handler);

        assert_eq!(state, CloseState::Abnormal);
        assert!(transport.is_shutdown());
        assert!(handler.closes.is_empty());
    }

    #[test]
    fn oversized_sends_are_fragmented() {
        let transport = MockTransport::new(vec![]);
        let config = SessionConfig {
            max_packet_size: 16,
            ..Default::default()
        };
        let ws = WebSocket::accept(transport.clone(), Vec::new(), config).unwrap();
        let payload: Vec<u8> = (0..100u8).collect();

        assert!(ws.sender().send(&payload, MessageKind::Binary));

        let frames = parse_written(&transport.written());
        assert!(frames.len() > 1);
        assert_eq!(frames[0].opcode, Opcode::Binary);
        assert!(!frames[0].fin);
        for frame in &frames[1..frames.len() - 1] {
            assert_eq!(frame.opcode, Opcode::Continuation);
            assert!(!frame.fin);
        }
        let last = frames.last().unwrap();
        assert_eq!(last.opcode, Opcode::Continuation);
        assert!(last.fin);

        let reassembled: Vec<u8> = frames.iter().flat_map(|f| f.payload.clone()).collect();
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn sends_after_disconnect_return_false() {
        let transport = MockTransport::new(vec![]);
        let ws =
            WebSocket::accept(transport.clone(), Vec::new(), SessionConfig::default()).unwrap();
        let sender = ws.sender();
        sender.disconnect();
        assert!(!sender.send(b"late", MessageKind::Text));
        assert!(!sender.ping(b""));
    }
}
