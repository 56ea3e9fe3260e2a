mod errors;
mod frame;
mod handshake;
mod server;
mod session;
mod stream;

pub use crate::errors::{Error, Result};
pub use crate::frame::{
    encode_frame, mask_payload, max_fragment_payload, parse_frame, CloseCode, Frame, FrameHeader,
    Opcode, WriteTo, DEFAULT_MAX_PACKET_SIZE,
};
pub use crate::handshake::{accept_key, UpgradeRequest, WS_PROTOCOL_GUID};
pub use crate::server::{
    ClientEntry, DispatchOp, Guid, WsServer, WsServerConfig, WsServerHandler,
};
pub use crate::session::{
    CloseState, MessageFrame, MessageKind, MessageSender, SessionConfig, SessionHandler,
    WebSocket,
};
pub use crate::stream::{LineReader, Transport};
