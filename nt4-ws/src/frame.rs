use core::convert::TryFrom;
use core::mem;

use bitflags::bitflags;
use bytes::BufMut;
use derive_more::Display;
use nom::{
    bytes::streaming::take,
    combinator::{cond, map, map_res},
    error::ParseError,
    number::streaming::{be_u16, be_u64, be_u8},
    IResult,
};
use num_enum::TryFromPrimitive;

/// Default outbound packet budget; one frame (header included) is kept at
/// or under this and larger payloads are fragmented. Matches a typical
/// Ethernet TCP MSS.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1460;

bitflags! {
    /// The high nibble of the first header byte.
    pub struct FrameFlags: u8 {
        const FIN  = 0b1000_0000;
        const RSV1 = 0b0100_0000;
        const RSV2 = 0b0010_0000;
        const RSV3 = 0b0001_0000;
    }
}

const OPCODE_MASK: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LEN7_MASK: u8 = 0x7F;
const LEN16_ESCAPE: u8 = 126;
const LEN64_ESCAPE: u8 = 127;

/// Dataframe opcodes. Anything else on the wire is fatal to the
/// connection.
#[repr(u8)]
#[derive(Debug, Eq, PartialEq, Copy, Clone, Hash, TryFromPrimitive)]
pub enum Opcode {
    /// Part of a series of fragments
    Continuation = 0x0,
    /// Text message frame
    Text = 0x1,
    /// Binary message frame
    Binary = 0x2,
    /// Connection close control frame
    Close = 0x8,
    /// Ping control frame
    Ping = 0x9,
    /// Pong (response) control frame
    Pong = 0xA,
}

impl Opcode {
    pub fn is_control(self) -> bool {
        match self {
            Opcode::Close | Opcode::Ping | Opcode::Pong => true,
            _ => false,
        }
    }
}

/// Close status codes.
#[repr(u16)]
#[derive(Debug, Eq, PartialEq, Copy, Clone, TryFromPrimitive, Display)]
pub enum CloseCode {
    #[display(fmt = "normal closure")]
    NormalClosure = 1000,
    #[display(fmt = "going away")]
    GoingAway = 1001,
    #[display(fmt = "protocol error")]
    ProtocolError = 1002,
    #[display(fmt = "unsupported format")]
    UnsupportedFormat = 1003,
    #[display(fmt = "no status")]
    NoStatus = 1005,
    #[display(fmt = "closed abnormally")]
    ClosedAbnormally = 1006,
    #[display(fmt = "unexpected data")]
    UnexpectedData = 1007,
    #[display(fmt = "message violation")]
    MessageViolation = 1008,
    #[display(fmt = "message too long")]
    MessageTooLong = 1009,
    #[display(fmt = "missing extension")]
    MissingExtension = 1010,
    #[display(fmt = "unexpected condition")]
    UnexpectedCondition = 1011,
    #[display(fmt = "TLS failed")]
    TlsFailed = 1015,
}

/// One decoded frame, already unmasked.
#[derive(Debug, PartialEq, Clone)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Parses a complete frame from the front of `input`. Streaming: returns
/// `Incomplete` until the whole frame is buffered, an error on a bad
/// opcode.
pub fn parse_frame<'a, E: ParseError<&'a [u8]>>(input: &'a [u8]) -> IResult<&'a [u8], Frame, E> {
    let (input, (flags, opcode)) = map_res(
        be_u8,
        |b| -> Result<_, num_enum::TryFromPrimitiveError<Opcode>> {
            let flags = FrameFlags::from_bits_truncate(b);
            let opcode = Opcode::try_from(b & OPCODE_MASK)?;
            Ok((flags, opcode))
        },
    )(input)?;

    let (input, len_byte) = be_u8(input)?;
    let masked = len_byte & MASK_BIT != 0;

    let (input, payload_len) = match len_byte & LEN7_MASK {
        LEN16_ESCAPE => map(be_u16, u64::from)(input)?,
        LEN64_ESCAPE => be_u64(input)?,
        n => (input, u64::from(n)),
    };

    let (input, masking_key) = cond(masked, take(4usize))(input)?;
    let (input, payload) = take(payload_len as usize)(input)?;

    let mut payload = payload.to_vec();
    if let Some(key) = masking_key {
        mask_payload(&mut payload, [key[0], key[1], key[2], key[3]]);
    }

    Ok((
        input,
        Frame {
            fin: flags.contains(FrameFlags::FIN),
            opcode,
            payload,
        },
    ))
}

/// XORs the payload with the masking key; applying it twice with the same
/// key restores the original bytes.
pub fn mask_payload(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// A trait for objects which can be written to byte-oriented sinks.
pub trait WriteTo {
    /// Gets the size of this object.
    fn size(&self) -> usize;

    /// Writes this object to the given byte-oriented sink.
    fn write_to<T: BufMut>(&self, buf: &mut T);
}

/// The wire header for one outbound frame.
#[derive(Debug, PartialEq, Clone)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: Opcode,
    pub masking_key: Option<[u8; 4]>,
    pub payload_len: usize,
}

impl FrameHeader {
    fn len7(&self) -> u8 {
        if self.payload_len > u16::max_value() as usize {
            LEN64_ESCAPE
        } else if self.payload_len > 125 {
            LEN16_ESCAPE
        } else {
            self.payload_len as u8
        }
    }
}

impl WriteTo for FrameHeader {
    fn size(&self) -> usize {
        mem::size_of::<u16>()
            + match self.len7() {
                LEN64_ESCAPE => mem::size_of::<u64>(),
                LEN16_ESCAPE => mem::size_of::<u16>(),
                _ => 0,
            }
            + self.masking_key.map_or(0, |key| key.len())
    }

    fn write_to<T: BufMut>(&self, buf: &mut T) {
        let mut b0 = self.opcode as u8;
        if self.fin {
            b0 |= FrameFlags::FIN.bits();
        }
        buf.put_u8(b0);

        let len7 = self.len7();
        let mut b1 = len7;
        if self.masking_key.is_some() {
            b1 |= MASK_BIT;
        }
        buf.put_u8(b1);

        match len7 {
            LEN64_ESCAPE => buf.put_u64(self.payload_len as u64),
            LEN16_ESCAPE => buf.put_u16(self.payload_len as u16),
            _ => {}
        }

        if let Some(key) = self.masking_key {
            buf.put_slice(&key);
        }
    }
}

/// Builds the complete wire bytes for one frame, masking the payload if a
/// key is given.
pub fn encode_frame(
    opcode: Opcode,
    fin: bool,
    masking_key: Option<[u8; 4]>,
    payload: &[u8],
) -> Vec<u8> {
    let header = FrameHeader {
        fin,
        opcode,
        masking_key,
        payload_len: payload.len(),
    };

    let mut buf = Vec::with_capacity(header.size() + payload.len());
    header.write_to(&mut buf);

    let start = buf.len();
    buf.extend_from_slice(payload);
    if let Some(key) = masking_key {
        mask_payload(&mut buf[start..], key);
    }

    buf
}

/// The largest payload a single frame may carry so that the whole frame
/// (header, length escape, masking key, payload) stays within
/// `max_packet`.
pub fn max_fragment_payload(max_packet: usize, masked: bool) -> usize {
    let mask = if masked { 4 } else { 0 };

    let small = max_packet.saturating_sub(2 + mask);
    if small <= 125 {
        return small;
    }
    let medium = max_packet.saturating_sub(4 + mask);
    if medium <= u16::max_value() as usize {
        return medium;
    }
    max_packet.saturating_sub(10 + mask)
}

#[cfg(test)]
mod tests {
    use nom::error::ErrorKind;

    use super::*;

    type ParseResult<'a> = IResult<&'a [u8], Frame, (&'a [u8], ErrorKind)>;

    #[test]
    fn parse_unmasked_text() {
        let res: ParseResult = parse_frame(b"\x81\x02hi");
        assert_eq!(
            res,
            Ok((
                &b""[..],
                Frame {
                    fin: true,
                    opcode: Opcode::Text,
                    payload: b"hi".to_vec(),
                }
            ))
        );
    }

    #[test]
    fn parse_masked_text() {
        let mut payload = b"hi".to_vec();
        mask_payload(&mut payload, [1, 2, 3, 4]);
        let mut wire = vec![0x81, 0x82, 1, 2, 3, 4];
        wire.extend_from_slice(&payload);

        let res: ParseResult = parse_frame(&wire);
        let (rest, frame) = res.unwrap();
        assert!(rest.is_empty());
        assert_eq!(frame.payload, b"hi");
    }

    #[test]
    fn parse_extended_lengths() {
        let payload = vec![0xAB; 300];
        let wire = encode_frame(Opcode::Binary, true, None, &payload);
        assert_eq!(&wire[..4], &[0x82, 126, 0x01, 0x2C]);
        let res: ParseResult = parse_frame(&wire);
        assert_eq!(res.unwrap().1.payload, payload);

        let payload = vec![0xCD; 70_000];
        let wire = encode_frame(Opcode::Binary, true, None, &payload);
        assert_eq!(wire[1], 127);
        assert_eq!(&wire[2..10], &70_000u64.to_be_bytes());
        let res: ParseResult = parse_frame(&wire);
        assert_eq!(res.unwrap().1.payload.len(), 70_000);
    }

    #[test]
    fn parse_needs_more_data() {
        let wire = encode_frame(Opcode::Binary, true, None, &[0u8; 64]);
        for cut in &[1usize, 2, 10, 65] {
            let res: ParseResult = parse_frame(&wire[..*cut]);
            assert!(res.unwrap_err().is_incomplete(), "cut at {}", cut);
        }
    }

    #[test]
    fn bad_opcode_is_an_error() {
        let res: ParseResult = parse_frame(b"\x83\x00");
        match res {
            Err(nom::Err::Error(_)) => {}
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn masking_is_involutive() {
        let original: Vec<u8> = (0..=255).collect();
        let key = [0xDE, 0xAD, 0xBE, 0xEF];
        let mut masked = original.clone();
        mask_payload(&mut masked, key);
        assert_ne!(masked, original);
        mask_payload(&mut masked, key);
        assert_eq!(masked, original);
    }

    #[test]
    fn masked_round_trip() {
        let payload = b"the sample payload".to_vec();
        let wire = encode_frame(Opcode::Text, true, Some([9, 8, 7, 6]), &payload);
        let res: ParseResult = parse_frame(&wire);
        assert_eq!(res.unwrap().1.payload, payload);
    }

    #[test]
    fn header_size_matches_written_bytes() {
        for (len, masked) in &[(0usize, false), (125, true), (126, false), (70_000, true)] {
            let header = FrameHeader {
                fin: true,
                opcode: Opcode::Binary,
                masking_key: if *masked { Some([0; 4]) } else { None },
                payload_len: *len,
            };
            let mut buf = Vec::new();
            header.write_to(&mut buf);
            assert_eq!(buf.len(), header.size());
        }
    }

    #[test]
    fn fragment_budget_is_respected() {
        for &max_packet in &[16usize, 131, 1460, 100_000] {
            for &masked in &[false, true] {
                let payload_len = max_fragment_payload(max_packet, masked);
                let wire = encode_frame(
                    Opcode::Binary,
                    false,
                    if masked { Some([1, 2, 3, 4]) } else { None },
                    &vec![0u8; payload_len],
                );
                assert!(
                    wire.len() <= max_packet,
                    "{} > {} (masked: {})",
                    wire.len(),
                    max_packet,
                    masked
                );
            }
        }
    }
}
