//! WebSocket frame codec (RFC 6455 §5), without a WebSocket library.
//!
//! Wire format:
//! `[FIN|RSV|opcode: u8][MASK|len7: u8][ext len: 0, 2 or 8 bytes][mask key: 0 or 4 bytes][payload]`
//!
//! The server only ever produces single, unmasked, FIN-terminated frames.
//! Inbound frames are decoded incrementally: a partial frame at the end of a
//! read stays buffered until the rest of it arrives.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Frame opcode values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }
}

/// Which peer wrote the frames a decoder reads.
///
/// Client-to-server frames must be masked and server-to-client frames must
/// not be; a decoder rejects frames that break the rule for its direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;

/// Largest length that fits in the 7-bit field.
const INLINE_MAX: usize = 125;
/// First length that needs the 64-bit extension.
const EXT64_MIN: usize = 65536;

/// Default maximum inbound payload (16 MiB). Prevents OOM on malformed data.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("client frame is not masked")]
    UnmaskedClientFrame,

    #[error("server frame is masked")]
    MaskedServerFrame,

    #[error("frame payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: u64, max: usize },

    #[error("reserved opcode: 0x{0:x}")]
    ReservedOpcode(u8),
}

/// A single decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub fin: bool,
    pub mask: Option<[u8; 4]>,
    /// Payload with masking already removed.
    pub payload: Bytes,
}

/// Size of the header `encode` writes for a payload of `len` bytes.
fn header_len(len: usize) -> usize {
    if len <= INLINE_MAX {
        2
    } else if len < EXT64_MIN {
        4
    } else {
        10
    }
}

fn put_header(buf: &mut BytesMut, opcode: Opcode, len: usize, mask_bit: u8) {
    buf.put_u8(FIN_BIT | opcode as u8);
    if len <= INLINE_MAX {
        buf.put_u8(mask_bit | len as u8);
    } else if len < EXT64_MIN {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(len as u64);
    }
}

/// Encode a server-to-client frame: FIN set, never masked.
pub fn encode(opcode: Opcode, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(header_len(payload.len()) + payload.len());
    put_header(&mut buf, opcode, payload.len(), 0);
    buf.put_slice(payload);
    buf.freeze()
}

/// Encode a text frame.
pub fn text(payload: impl AsRef<[u8]>) -> Bytes {
    encode(Opcode::Text, payload.as_ref())
}

/// Encode a close frame carrying a status code and optional reason.
pub fn close(code: u16, reason: &str) -> Bytes {
    let mut payload = BytesMut::with_capacity(2 + reason.len());
    payload.put_u16(code);
    payload.put_slice(reason.as_bytes());
    encode(Opcode::Close, &payload)
}

/// Encode a client-to-server frame masked with `mask`.
pub fn encode_masked(opcode: Opcode, payload: &[u8], mask: [u8; 4]) -> Bytes {
    let mut buf = BytesMut::with_capacity(header_len(payload.len()) + 4 + payload.len());
    put_header(&mut buf, opcode, payload.len(), MASK_BIT);
    buf.put_slice(&mask);
    let start = buf.len();
    buf.put_slice(payload);
    apply_mask(&mut buf[start..], mask);
    buf.freeze()
}

/// XOR `data` in place with the cycling 4-byte mask. Applying it twice is
/// the identity.
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Counts of frames the decoder consumed without surfacing them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IgnoredFrames {
    pub continuation: u64,
    pub binary: u64,
    pub close: u64,
    pub ping: u64,
    pub pong: u64,
}

/// Incremental frame decoder.
///
/// Only text payloads are surfaced. Binary, ping, pong, close and
/// continuation frames are consumed, logged and counted in
/// [`IgnoredFrames`]; none of them is answered. A close frame additionally
/// sets [`FrameDecoder::close_received`].
#[derive(Debug)]
pub struct FrameDecoder {
    direction: Direction,
    max_payload: usize,
    buf: BytesMut,
    ignored: IgnoredFrames,
    close_received: bool,
}

impl FrameDecoder {
    pub fn new(direction: Direction) -> Self {
        Self::with_max_payload(direction, DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(direction: Direction, max_payload: usize) -> Self {
        Self {
            direction,
            max_payload,
            buf: BytesMut::new(),
            ignored: IgnoredFrames::default(),
            close_received: false,
        }
    }

    /// Append `chunk` and return every complete text payload now available,
    /// in wire order. An incomplete trailing frame stays buffered.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, FrameError> {
        self.buf.extend_from_slice(chunk);
        let mut messages = Vec::new();
        while let Some(frame) = self.next_frame()? {
            match frame.opcode {
                Opcode::Text => {
                    if !frame.fin {
                        tracing::debug!("text frame without FIN; fragments are not reassembled");
                    }
                    messages.push(frame.payload);
                }
                other => self.record_ignored(other, frame.payload.len()),
            }
        }
        Ok(messages)
    }

    /// Parse one frame off the front of the buffer, or `None` if the buffer
    /// does not yet hold a complete frame.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let b0 = self.buf[0];
        let b1 = self.buf[1];

        if b0 & RSV_BITS != 0 {
            tracing::debug!(byte = b0, "reserved bits set; no extensions are negotiated");
        }
        let opcode_byte = b0 & 0x0F;
        let opcode = Opcode::from_u8(opcode_byte).ok_or(FrameError::ReservedOpcode(opcode_byte))?;
        let fin = b0 & FIN_BIT != 0;
        let masked = b1 & MASK_BIT != 0;

        match (self.direction, masked) {
            (Direction::ClientToServer, false) => return Err(FrameError::UnmaskedClientFrame),
            (Direction::ServerToClient, true) => return Err(FrameError::MaskedServerFrame),
            _ => {}
        }

        let (len, mut offset) = match b1 & 0x7F {
            126 => {
                if self.buf.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([self.buf[2], self.buf[3]]) as u64, 4)
            }
            127 => {
                if self.buf.len() < 10 {
                    return Ok(None);
                }
                let mut ext = [0u8; 8];
                ext.copy_from_slice(&self.buf[2..10]);
                (u64::from_be_bytes(ext), 10)
            }
            n => (n as u64, 2),
        };

        if len > self.max_payload as u64 {
            return Err(FrameError::PayloadTooLarge {
                len,
                max: self.max_payload,
            });
        }
        let len = len as usize;

        let mask = if masked {
            if self.buf.len() < offset + 4 {
                return Ok(None);
            }
            let mut key = [0u8; 4];
            key.copy_from_slice(&self.buf[offset..offset + 4]);
            offset += 4;
            Some(key)
        } else {
            None
        };

        if self.buf.len() < offset + len {
            return Ok(None);
        }

        self.buf.advance(offset);
        let mut payload = self.buf.split_to(len);
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            opcode,
            fin,
            mask,
            payload: payload.freeze(),
        }))
    }

    fn record_ignored(&mut self, opcode: Opcode, len: usize) {
        tracing::debug!(?opcode, len, "ignoring non-text frame");
        match opcode {
            Opcode::Continuation => self.ignored.continuation += 1,
            Opcode::Binary => self.ignored.binary += 1,
            Opcode::Close => {
                self.ignored.close += 1;
                self.close_received = true;
            }
            Opcode::Ping => self.ignored.ping += 1,
            Opcode::Pong => self.ignored.pong += 1,
            Opcode::Text => {}
        }
    }

    /// Whether a close frame has been consumed.
    pub fn close_received(&self) -> bool {
        self.close_received
    }

    pub fn ignored(&self) -> IgnoredFrames {
        self.ignored
    }

    /// Number of bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    fn payload_of(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn opcode_round_trip() {
        for op in [
            Opcode::Continuation,
            Opcode::Text,
            Opcode::Binary,
            Opcode::Close,
            Opcode::Ping,
            Opcode::Pong,
        ] {
            assert_eq!(Opcode::from_u8(op as u8), Some(op));
        }
        assert_eq!(Opcode::from_u8(0x3), None);
        assert_eq!(Opcode::from_u8(0xF), None);
    }

    #[test]
    fn encode_header_size_classes() {
        assert_eq!(encode(Opcode::Text, &payload_of(0)).len(), 2);
        assert_eq!(encode(Opcode::Text, &payload_of(125)).len(), 2 + 125);
        assert_eq!(encode(Opcode::Text, &payload_of(126)).len(), 4 + 126);
        assert_eq!(encode(Opcode::Text, &payload_of(65535)).len(), 4 + 65535);
        assert_eq!(encode(Opcode::Text, &payload_of(65536)).len(), 10 + 65536);
    }

    #[test]
    fn encode_sets_fin_and_never_masks() {
        let frame = encode(Opcode::Text, b"hi");
        assert_eq!(frame[0], 0x81);
        assert_eq!(frame[1], 0x02);
        assert_eq!(&frame[2..], b"hi");

        let big = encode(Opcode::Binary, &payload_of(300));
        assert_eq!(big[0], 0x82);
        assert_eq!(big[1], 126);
        assert_eq!(u16::from_be_bytes([big[2], big[3]]), 300);
    }

    #[test]
    fn round_trip_across_length_classes() {
        for len in [0usize, 1, 125, 126, 65535, 65536, 2_000_000] {
            let payload = payload_of(len);
            let mut decoder = FrameDecoder::new(Direction::ServerToClient);
            let messages = decoder.decode(&encode(Opcode::Text, &payload)).unwrap();
            assert_eq!(messages.len(), 1, "len {len}");
            assert_eq!(messages[0].as_ref(), payload.as_slice(), "len {len}");
            assert_eq!(decoder.buffered(), 0);
        }
    }

    #[test]
    fn masked_round_trip_across_length_classes() {
        for len in [0usize, 1, 125, 126, 65535, 65536] {
            let payload = payload_of(len);
            let mut decoder = FrameDecoder::new(Direction::ClientToServer);
            let messages = decoder
                .decode(&encode_masked(Opcode::Text, &payload, MASK))
                .unwrap();
            assert_eq!(messages.len(), 1, "len {len}");
            assert_eq!(messages[0].as_ref(), payload.as_slice(), "len {len}");
        }
    }

    #[test]
    fn masking_is_an_involution() {
        let keys = [[0, 0, 0, 0], [0xff, 0xff, 0xff, 0xff], MASK, [1, 2, 3, 4]];
        let payloads: [&[u8]; 4] = [b"", b"a", b"hello world", &[0u8, 255, 128, 7, 9, 11, 13]];
        for key in keys {
            for payload in payloads {
                let mut data = payload.to_vec();
                apply_mask(&mut data, key);
                apply_mask(&mut data, key);
                assert_eq!(data, payload);
            }
        }
    }

    #[test]
    fn masked_frame_payload_differs_on_the_wire() {
        let frame = encode_masked(Opcode::Text, b"secret", MASK);
        assert_eq!(frame[1] & MASK_BIT, MASK_BIT);
        assert_eq!(&frame[2..6], &MASK);
        assert_ne!(&frame[6..], b"secret");
    }

    #[test]
    fn decodes_multiple_frames_in_order() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode_masked(Opcode::Text, b"first", MASK));
        wire.extend_from_slice(&encode_masked(Opcode::Text, b"second", [9, 8, 7, 6]));
        wire.extend_from_slice(&encode_masked(Opcode::Text, &payload_of(400), MASK));

        let mut decoder = FrameDecoder::new(Direction::ClientToServer);
        let messages = decoder.decode(&wire).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], Bytes::from("first"));
        assert_eq!(messages[1], Bytes::from("second"));
        assert_eq!(messages[2].as_ref(), payload_of(400).as_slice());
    }

    #[test]
    fn retains_partial_trailing_header() {
        let first = encode_masked(Opcode::Text, b"one", MASK);
        let second = encode_masked(Opcode::Text, &payload_of(1000), MASK);

        let mut wire = first.to_vec();
        wire.extend_from_slice(&second[..3]);

        let mut decoder = FrameDecoder::new(Direction::ClientToServer);
        let messages = decoder.decode(&wire).unwrap();
        assert_eq!(messages, vec![Bytes::from("one")]);
        assert_eq!(decoder.buffered(), 3);

        let messages = decoder.decode(&second[3..]).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].as_ref(), payload_of(1000).as_slice());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn retains_partial_payload_byte_by_byte() {
        let wire = encode_masked(Opcode::Text, b"drip fed", MASK);
        let mut decoder = FrameDecoder::new(Direction::ClientToServer);
        for byte in &wire[..wire.len() - 1] {
            assert!(decoder.decode(std::slice::from_ref(byte)).unwrap().is_empty());
        }
        let messages = decoder.decode(&wire[wire.len() - 1..]).unwrap();
        assert_eq!(messages, vec![Bytes::from("drip fed")]);
    }

    #[test]
    fn rejects_unmasked_client_frame() {
        let mut decoder = FrameDecoder::new(Direction::ClientToServer);
        let err = decoder.decode(&encode(Opcode::Text, b"plain")).unwrap_err();
        assert_eq!(err, FrameError::UnmaskedClientFrame);
    }

    #[test]
    fn rejects_masked_server_frame() {
        let mut decoder = FrameDecoder::new(Direction::ServerToClient);
        let err = decoder
            .decode(&encode_masked(Opcode::Text, b"x", MASK))
            .unwrap_err();
        assert_eq!(err, FrameError::MaskedServerFrame);
    }

    #[test]
    fn rejects_oversized_declared_length() {
        let mut decoder = FrameDecoder::with_max_payload(Direction::ServerToClient, 100);
        let err = decoder.decode(&encode(Opcode::Text, &payload_of(101))).unwrap_err();
        assert_eq!(err, FrameError::PayloadTooLarge { len: 101, max: 100 });
    }

    #[test]
    fn rejects_reserved_opcode() {
        let mut decoder = FrameDecoder::new(Direction::ServerToClient);
        let err = decoder.decode(&[0x83, 0x00]).unwrap_err();
        assert_eq!(err, FrameError::ReservedOpcode(0x3));
    }

    #[test]
    fn non_text_frames_are_consumed_and_counted() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode_masked(Opcode::Ping, b"p", MASK));
        wire.extend_from_slice(&encode_masked(Opcode::Binary, b"\x00\x01", MASK));
        wire.extend_from_slice(&encode_masked(Opcode::Text, b"kept", MASK));
        wire.extend_from_slice(&encode_masked(Opcode::Pong, b"", MASK));

        let mut decoder = FrameDecoder::new(Direction::ClientToServer);
        let messages = decoder.decode(&wire).unwrap();
        assert_eq!(messages, vec![Bytes::from("kept")]);
        let ignored = decoder.ignored();
        assert_eq!(ignored.ping, 1);
        assert_eq!(ignored.binary, 1);
        assert_eq!(ignored.pong, 1);
        assert!(!decoder.close_received());
    }

    #[test]
    fn close_frame_sets_flag() {
        let mut decoder = FrameDecoder::new(Direction::ClientToServer);
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        let messages = decoder
            .decode(&encode_masked(Opcode::Close, &payload, MASK))
            .unwrap();
        assert!(messages.is_empty());
        assert!(decoder.close_received());
        assert_eq!(decoder.ignored().close, 1);
    }

    #[test]
    fn close_helper_encodes_status_code() {
        let mut decoder = FrameDecoder::new(Direction::ServerToClient);
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.buf.extend_from_slice(&close(1000, "done"));
        let parsed = decoder.next_frame().unwrap().unwrap();
        assert_eq!(parsed.opcode, Opcode::Close);
        assert_eq!(&parsed.payload[..2], &1000u16.to_be_bytes());
        assert_eq!(&parsed.payload[2..], b"done");
    }
}
