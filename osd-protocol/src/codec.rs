/// Read and write implementations for debug packets
use std::io::Write;

use crate::{
    error::{DecodeError, EncodeError, Malformed},
    protocol::{Flags, ModuleAddress, Packet, PacketClass},
};

/// Size of the fixed packet header in bytes: address (bytes 0-1), class in the low and flags in
/// the high nibble of byte 2, sequence (bytes 3-4), payload length (bytes 5-6), all little endian
pub const HEADER_LEN: usize = 7;
/// The largest payload the length field can express
pub const MAX_PAYLOAD: usize = u16::MAX as usize;
/// Size of the length prefix that stream transports put in front of each packet
pub const FRAME_PREFIX_LEN: usize = 2;

impl Packet {
    /// Number of bytes this packet occupies on the wire (without stream framing)
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn write_to(&self, writer: &mut impl Write, mtu: usize) -> Result<(), EncodeError> {
        let max = mtu.min(MAX_PAYLOAD);
        if self.payload.len() > max {
            return Err(EncodeError::OversizedPayload {
                max,
                got: self.payload.len(),
            });
        }
        let mut header = [0u8; HEADER_LEN];
        header[0..2].copy_from_slice(&self.address.raw().to_le_bytes());
        header[2] = self.class.to_raw() | (self.flags.raw() << 4);
        header[3..5].copy_from_slice(&self.sequence.to_le_bytes());
        header[5..7].copy_from_slice(&(self.payload.len() as u16).to_le_bytes());
        writer.write_all(&header)?;
        writer.write_all(&self.payload)?;
        Ok(())
    }

    /// Encodes the packet, refusing payloads larger than `mtu`.
    pub fn encode(&self, mtu: usize) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.write_to(&mut out, mtu)?;
        Ok(out)
    }

    /// Decodes the first packet in `buf`.
    ///
    /// Returns the packet and the number of bytes consumed.
    /// If `buf` holds only part of a packet, [`DecodeError::Incomplete`] tells how many
    /// more bytes are required.
    pub fn decode(buf: &[u8]) -> Result<(Packet, usize), DecodeError> {
        Packet::decode_bounded(buf, MAX_PAYLOAD)
    }

    /// Like [`Packet::decode`], but rejects payloads larger than `max_payload`.
    pub fn decode_bounded(buf: &[u8], max_payload: usize) -> Result<(Packet, usize), DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::Incomplete {
                needed: HEADER_LEN - buf.len(),
            });
        }
        let payload_len = u16::from_le_bytes([buf[5], buf[6]]) as usize;
        let frame_len = HEADER_LEN + payload_len;
        if buf.len() < frame_len {
            return Err(DecodeError::Incomplete {
                needed: frame_len - buf.len(),
            });
        }

        let raw_class = buf[2] & 0x0F;
        let class = PacketClass::from_raw(raw_class).ok_or(DecodeError::Malformed {
            reason: Malformed::UnknownClass(raw_class),
            frame_len,
        })?;
        if payload_len > max_payload {
            return Err(DecodeError::Malformed {
                reason: Malformed::Oversized {
                    max: max_payload,
                    got: payload_len,
                },
                frame_len,
            });
        }

        let packet = Packet {
            address: ModuleAddress::from_raw(u16::from_le_bytes([buf[0], buf[1]])),
            class,
            flags: Flags::from_raw(buf[2] >> 4),
            sequence: u16::from_le_bytes([buf[3], buf[4]]),
            payload: buf[HEADER_LEN..frame_len].to_vec(),
        };
        Ok((packet, frame_len))
    }

    /// Decodes a buffer that must contain exactly one packet, as delivered by datagram transports.
    /// A truncated buffer is reported as incomplete, surplus bytes as malformed.
    pub fn decode_exact(buf: &[u8], max_payload: usize) -> Result<Packet, DecodeError> {
        let (packet, consumed) = Packet::decode_bounded(buf, max_payload)?;
        if consumed != buf.len() {
            return Err(DecodeError::Malformed {
                reason: Malformed::TrailingBytes(buf.len() - consumed),
                frame_len: buf.len(),
            });
        }
        Ok(packet)
    }
}

/// Writes `packet` with the length prefix used by stream transports.
pub fn write_framed(packet: &Packet, writer: &mut impl Write, mtu: usize) -> Result<(), EncodeError> {
    // the length prefix must also cover the header
    let max = mtu.min(MAX_PAYLOAD - HEADER_LEN);
    if packet.payload.len() > max {
        return Err(EncodeError::OversizedPayload {
            max,
            got: packet.payload.len(),
        });
    }
    writer.write_all(&(packet.encoded_len() as u16).to_le_bytes())?;
    packet.write_to(writer, mtu)
}

#[cfg(feature = "tokio")]
pub use stream::PacketCodec;

#[cfg(feature = "tokio")]
mod stream {
    use std::io;

    use bytes::{Buf, BufMut, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    use super::*;

    /// Stream codec that frames packets with a `u16` little endian length prefix.
    ///
    /// Decoding yields `Result<Packet, DecodeError>` items: a malformed packet is consumed and
    /// reported, and the stream continues with the next frame.
    #[derive(Debug, Clone)]
    pub struct PacketCodec {
        mtu: usize,
    }

    impl PacketCodec {
        pub fn new(mtu: usize) -> PacketCodec {
            PacketCodec {
                mtu: mtu.min(MAX_PAYLOAD),
            }
        }

        pub fn mtu(&self) -> usize {
            self.mtu
        }
    }

    impl Default for PacketCodec {
        fn default() -> Self {
            PacketCodec::new(MAX_PAYLOAD)
        }
    }

    impl Decoder for PacketCodec {
        type Item = Result<Packet, DecodeError>;
        type Error = io::Error;

        fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
            if src.len() < FRAME_PREFIX_LEN {
                return Ok(None);
            }
            let frame_len = u16::from_le_bytes([src[0], src[1]]) as usize;
            if src.len() < FRAME_PREFIX_LEN + frame_len {
                src.reserve(FRAME_PREFIX_LEN + frame_len - src.len());
                return Ok(None);
            }
            src.advance(FRAME_PREFIX_LEN);
            let frame = src.split_to(frame_len);
            let result = match Packet::decode_exact(&frame, self.mtu) {
                // A frame shorter than its header declares cannot be resumed
                Err(DecodeError::Incomplete { .. }) => Err(DecodeError::Malformed {
                    reason: Malformed::Truncated,
                    frame_len,
                }),
                other => other,
            };
            Ok(Some(result))
        }
    }

    impl Encoder<Packet> for PacketCodec {
        type Error = EncodeError;

        fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
            dst.reserve(FRAME_PREFIX_LEN + item.encoded_len());
            write_framed(&item, &mut dst.writer(), self.mtu)
        }
    }
}
