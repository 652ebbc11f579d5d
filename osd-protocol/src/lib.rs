//! # OSD Protocol Library
//!
//! This crate implements the wire format of the Open SoC Debug (OSD) packet interconnect,
//! which connects a debug host to the debug modules of a system-on-chip.
//!
//! ## Overview
//!
//! Debug modules (trace sources, memory access points, the subnet control module, ...)
//! are addressed individually. All traffic between the host and a module travels as
//! debug packets with a fixed header and a variable payload. This library allows you to:
//!
//! - Encode and decode packets, resumably for streaming transports
//! - Frame packets for stream transports (with the `tokio` feature, as a `tokio_util` codec)
//! - Describe modules and interpret the standard register map
//! - Build and parse the payloads of register, memory, discovery and trace packets
//!
//! ## Packet Classes
//!
//! - `CONTROL`: register access and module control
//! - `EVENT`: events a module pushes without being asked (e.g. trace)
//! - `DATA_REQUEST` / `DATA_RESPONSE`: memory access
//! - `DISCOVERY`: probing and describing modules
//!
//! ## Basic Usage
//!
//! ### Encoding a Packet
//!
//! ```
//! use osd_protocol::{ModuleAddress, Packet, PacketClass};
//! use osd_protocol::payload::{RegisterRequest, RegisterWidth};
//!
//! let request = RegisterRequest::Read { register: 0x0001, width: RegisterWidth::W16 };
//! let packet = Packet::new(ModuleAddress::new(0, 2), PacketClass::Control, request.to_payload())
//!     .with_sequence(1);
//! let bytes = packet.encode(1024).expect("payload fits the MTU");
//! assert_eq!(bytes, b"\x02\x00\x00\x01\x00\x04\x00\x00\x10\x01\x00");
//! ```
//!
//! ### Decoding from a Stream
//!
//! ```
//! use osd_protocol::{Packet, error::DecodeError};
//!
//! let bytes = b"\x02\x00\x00\x01\x00\x04\x00\x00\x10\x01\x00";
//! // Only part of the packet arrived so far
//! assert_eq!(Packet::decode(&bytes[..5]), Err(DecodeError::Incomplete { needed: 2 }));
//! let (packet, consumed) = Packet::decode(bytes).expect("Packet should decode");
//! assert_eq!(consumed, bytes.len());
//! assert_eq!(packet.sequence, 1);
//! ```
//!
//! ## Packet Format
//!
//! All fields are little endian.
//!
//! | bytes | field |
//! |-------|-------|
//! | 0..2  | module address |
//! | 2     | class (low nibble), flags (high nibble) |
//! | 3..5  | sequence |
//! | 5..7  | payload length |
//! | 7..   | payload |
//!
//! Stream transports prefix each packet with its total encoded length as `u16`.
//!
//! ## Error Handling
//!
//! Decoding reports [`error::DecodeError`]; a malformed packet carries its length so that
//! a stream decoder can skip it and continue. Encoding reports [`error::EncodeError`].

pub mod protocol;
pub use protocol::*;
pub mod codec;
pub mod error;
pub mod module;
pub mod payload;
