//! Payload layouts carried inside packets of the different classes.
use crate::error::PayloadError;

/// Width of a register access
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RegisterWidth {
    W16,
    W32,
    W64,
    W128,
}

impl RegisterWidth {
    pub const fn bits(self) -> u8 {
        match self {
            RegisterWidth::W16 => 16,
            RegisterWidth::W32 => 32,
            RegisterWidth::W64 => 64,
            RegisterWidth::W128 => 128,
        }
    }

    pub const fn bytes(self) -> usize {
        self.bits() as usize / 8
    }

    pub fn from_bits(bits: u8) -> Result<RegisterWidth, PayloadError> {
        match bits {
            16 => Ok(RegisterWidth::W16),
            32 => Ok(RegisterWidth::W32),
            64 => Ok(RegisterWidth::W64),
            128 => Ok(RegisterWidth::W128),
            other => Err(PayloadError::InvalidWidth(other)),
        }
    }

    /// Encodes `value` truncated to this width, little endian.
    pub fn encode_value(self, value: u128) -> Vec<u8> {
        value.to_le_bytes()[..self.bytes()].to_vec()
    }

    pub fn decode_value(self, bytes: &[u8]) -> Result<u128, PayloadError> {
        PayloadError::check_len(bytes, self.bytes())?;
        let mut buf = [0u8; 16];
        buf[..self.bytes()].copy_from_slice(&bytes[..self.bytes()]);
        Ok(u128::from_le_bytes(buf))
    }
}

/// A register access carried in a CONTROL packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RegisterRequest {
    Read {
        register: u16,
        width: RegisterWidth,
    },
    Write {
        register: u16,
        width: RegisterWidth,
        value: u128,
    },
}

impl RegisterRequest {
    const OP_READ: u8 = 0;
    const OP_WRITE: u8 = 1;
    const HEADER_LEN: usize = 4;

    pub fn register(&self) -> u16 {
        match self {
            RegisterRequest::Read { register, .. } | RegisterRequest::Write { register, .. } => {
                *register
            }
        }
    }

    pub fn width(&self) -> RegisterWidth {
        match self {
            RegisterRequest::Read { width, .. } | RegisterRequest::Write { width, .. } => *width,
        }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::HEADER_LEN + self.width().bytes());
        match self {
            RegisterRequest::Read { register, width } => {
                out.push(Self::OP_READ);
                out.push(width.bits());
                out.extend_from_slice(&register.to_le_bytes());
            }
            RegisterRequest::Write {
                register,
                width,
                value,
            } => {
                out.push(Self::OP_WRITE);
                out.push(width.bits());
                out.extend_from_slice(&register.to_le_bytes());
                out.extend_from_slice(&width.encode_value(*value));
            }
        }
        out
    }

    pub fn from_payload(payload: &[u8]) -> Result<RegisterRequest, PayloadError> {
        PayloadError::check_len(payload, Self::HEADER_LEN)?;
        let width = RegisterWidth::from_bits(payload[1])?;
        let register = u16::from_le_bytes([payload[2], payload[3]]);
        match payload[0] {
            Self::OP_READ => Ok(RegisterRequest::Read { register, width }),
            Self::OP_WRITE => Ok(RegisterRequest::Write {
                register,
                width,
                value: width.decode_value(&payload[Self::HEADER_LEN..])?,
            }),
            other => Err(PayloadError::InvalidOpcode(other)),
        }
    }
}

/// A memory access carried in a DATA_REQUEST packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MemoryRequest {
    Read { address: u64, len: u16 },
    Write { address: u64, data: Vec<u8> },
}

impl MemoryRequest {
    const OP_READ: u8 = 0;
    const OP_WRITE: u8 = 1;
    /// Opcode and target address
    pub const HEADER_LEN: usize = 9;

    pub fn to_payload(&self) -> Vec<u8> {
        match self {
            MemoryRequest::Read { address, len } => {
                let mut out = Vec::with_capacity(Self::HEADER_LEN + 2);
                out.push(Self::OP_READ);
                out.extend_from_slice(&address.to_le_bytes());
                out.extend_from_slice(&len.to_le_bytes());
                out
            }
            MemoryRequest::Write { address, data } => {
                let mut out = Vec::with_capacity(Self::HEADER_LEN + data.len());
                out.push(Self::OP_WRITE);
                out.extend_from_slice(&address.to_le_bytes());
                out.extend_from_slice(data);
                out
            }
        }
    }

    pub fn from_payload(payload: &[u8]) -> Result<MemoryRequest, PayloadError> {
        PayloadError::check_len(payload, Self::HEADER_LEN)?;
        let mut addr = [0u8; 8];
        addr.copy_from_slice(&payload[1..Self::HEADER_LEN]);
        let address = u64::from_le_bytes(addr);
        let rest = &payload[Self::HEADER_LEN..];
        match payload[0] {
            Self::OP_READ => {
                PayloadError::check_len(payload, Self::HEADER_LEN + 2)?;
                Ok(MemoryRequest::Read {
                    address,
                    len: u16::from_le_bytes([rest[0], rest[1]]),
                })
            }
            Self::OP_WRITE => Ok(MemoryRequest::Write {
                address,
                data: rest.to_vec(),
            }),
            other => Err(PayloadError::InvalidOpcode(other)),
        }
    }
}

/// The answer of a module to the discovery broadcast.
///
/// Subnet control modules announce how many module slots their subnet has.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ProbeReply {
    pub topology_size: Option<u16>,
}

impl ProbeReply {
    pub fn to_payload(&self) -> Vec<u8> {
        match self.topology_size {
            Some(size) => size.to_le_bytes().to_vec(),
            None => Vec::new(),
        }
    }

    pub fn from_payload(payload: &[u8]) -> ProbeReply {
        let topology_size = match payload {
            [lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])),
            _ => None,
        };
        ProbeReply { topology_size }
    }
}

/// A contiguous range of target memory
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    pub base: u64,
    pub size: u64,
}

impl MemoryRegion {
    pub fn contains(&self, address: u64, len: u64) -> bool {
        address >= self.base
            && address
                .checked_add(len)
                .is_some_and(|end| end <= self.base.saturating_add(self.size))
    }
}

/// Metadata a memory access module attaches to its descriptor.
///
/// Layout: data width u16, address width u16, then one (base u64, size u64) pair per region.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MemoryLayout {
    pub data_width: u16,
    pub addr_width: u16,
    pub regions: Vec<MemoryRegion>,
}

impl MemoryLayout {
    const HEADER_LEN: usize = 4;
    const REGION_LEN: usize = 16;

    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::HEADER_LEN + self.regions.len() * Self::REGION_LEN);
        out.extend_from_slice(&self.data_width.to_le_bytes());
        out.extend_from_slice(&self.addr_width.to_le_bytes());
        for region in &self.regions {
            out.extend_from_slice(&region.base.to_le_bytes());
            out.extend_from_slice(&region.size.to_le_bytes());
        }
        out
    }

    pub fn from_payload(payload: &[u8]) -> Result<MemoryLayout, PayloadError> {
        PayloadError::check_len(payload, Self::HEADER_LEN)?;
        let regions = &payload[Self::HEADER_LEN..];
        if regions.len() % Self::REGION_LEN != 0 {
            return Err(PayloadError::TooShort {
                expected: Self::HEADER_LEN + regions.len().next_multiple_of(Self::REGION_LEN),
                got: payload.len(),
            });
        }
        let regions = regions
            .chunks_exact(Self::REGION_LEN)
            .map(|chunk| {
                let (base, size) = chunk.split_at(8);
                MemoryRegion {
                    base: u64::from_le_bytes(base.try_into().unwrap_or_default()),
                    size: u64::from_le_bytes(size.try_into().unwrap_or_default()),
                }
            })
            .collect();
        Ok(MemoryLayout {
            data_width: u16::from_le_bytes([payload[0], payload[1]]),
            addr_width: u16::from_le_bytes([payload[2], payload[3]]),
            regions,
        })
    }
}

/// Event emitted by a system trace module: a software-written value with an id.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StmEvent {
    pub timestamp: u32,
    pub id: u16,
    pub value: u64,
}

impl StmEvent {
    const HEADER_LEN: usize = 6;

    /// Encodes the event for a module with an `xlen` bit wide value register.
    pub fn to_payload(&self, xlen: u16) -> Vec<u8> {
        let value_len = if xlen <= 32 { 4 } else { 8 };
        let mut out = Vec::with_capacity(Self::HEADER_LEN + value_len);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.value.to_le_bytes()[..value_len]);
        out
    }

    pub fn from_payload(payload: &[u8]) -> Result<StmEvent, PayloadError> {
        PayloadError::check_len(payload, Self::HEADER_LEN + 4)?;
        let mut value = [0u8; 8];
        let value_bytes = &payload[Self::HEADER_LEN..];
        let n = value_bytes.len().min(8);
        value[..n].copy_from_slice(&value_bytes[..n]);
        Ok(StmEvent {
            timestamp: u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
            id: u16::from_le_bytes([payload[4], payload[5]]),
            value: u64::from_le_bytes(value),
        })
    }
}

/// Event emitted by a core trace module: control flow of a CPU core.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CtmEvent {
    pub timestamp: u32,
    pub pc: u64,
    pub kind: u8,
}

impl CtmEvent {
    pub const KIND_CALL: u8 = 0;
    pub const KIND_RETURN: u8 = 1;
    pub const KIND_EXCEPTION: u8 = 2;

    const ENCODED_LEN: usize = 13;

    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.pc.to_le_bytes());
        out.push(self.kind);
        out
    }

    pub fn from_payload(payload: &[u8]) -> Result<CtmEvent, PayloadError> {
        PayloadError::check_len(payload, Self::ENCODED_LEN)?;
        let mut pc = [0u8; 8];
        pc.copy_from_slice(&payload[4..12]);
        Ok(CtmEvent {
            timestamp: u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
            pc: u64::from_le_bytes(pc),
            kind: payload[12],
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_write_layout() {
        let req = RegisterRequest::Write {
            register: 0x0203,
            width: RegisterWidth::W32,
            value: 0xAABB_CCDD,
        };
        assert_eq!(
            req.to_payload(),
            vec![1, 32, 0x03, 0x02, 0xDD, 0xCC, 0xBB, 0xAA]
        );
        assert_eq!(RegisterRequest::from_payload(&req.to_payload()), Ok(req));
    }

    #[test]
    fn register_value_is_truncated_to_width() {
        assert_eq!(RegisterWidth::W16.encode_value(0x1_2345), vec![0x45, 0x23]);
        assert_eq!(RegisterWidth::W16.decode_value(&[0x45, 0x23]), Ok(0x2345));
    }

    #[test]
    fn invalid_register_request() {
        assert_eq!(
            RegisterRequest::from_payload(&[0, 24, 0, 0]),
            Err(PayloadError::InvalidWidth(24))
        );
        assert_eq!(
            RegisterRequest::from_payload(&[9, 16, 0, 0]),
            Err(PayloadError::InvalidOpcode(9))
        );
        assert!(RegisterRequest::from_payload(&[1, 64, 0, 0, 1, 2]).is_err());
    }

    #[test]
    fn memory_read_layout() {
        let req = MemoryRequest::Read {
            address: 0x8000_0000,
            len: 16,
        };
        let payload = req.to_payload();
        assert_eq!(payload.len(), MemoryRequest::HEADER_LEN + 2);
        assert_eq!(MemoryRequest::from_payload(&payload), Ok(req));
    }

    #[test]
    fn memory_layout_lists_regions() {
        let layout = MemoryLayout {
            data_width: 32,
            addr_width: 32,
            regions: vec![
                MemoryRegion { base: 0, size: 0x1000 },
                MemoryRegion {
                    base: 0x8000_0000,
                    size: 0x100,
                },
            ],
        };
        let payload = layout.to_payload();
        assert_eq!(payload.len(), 4 + 2 * 16);
        assert_eq!(MemoryLayout::from_payload(&payload), Ok(layout.clone()));
        assert!(MemoryLayout::from_payload(&payload[..5]).is_err());
        assert!(layout.regions[1].contains(0x8000_00F0, 0x10));
        assert!(!layout.regions[1].contains(0x8000_00F0, 0x11));
    }

    #[test]
    fn probe_reply_topology() {
        assert_eq!(ProbeReply::from_payload(&[]).topology_size, None);
        let reply = ProbeReply {
            topology_size: Some(5),
        };
        assert_eq!(ProbeReply::from_payload(&reply.to_payload()), reply);
    }

    #[test]
    fn stm_event_narrow_value() {
        let event = StmEvent {
            timestamp: 100,
            id: 7,
            value: 0xFFFF_FFFF_1234_5678,
        };
        let payload = event.to_payload(32);
        assert_eq!(payload.len(), 10);
        let parsed = StmEvent::from_payload(&payload).unwrap();
        assert_eq!(parsed.value, 0x1234_5678);
        assert_eq!(StmEvent::from_payload(&event.to_payload(64)).unwrap(), event);
    }

    #[test]
    fn ctm_event() {
        let event = CtmEvent {
            timestamp: 3,
            pc: 0x2000_0400,
            kind: CtmEvent::KIND_RETURN,
        };
        assert_eq!(CtmEvent::from_payload(&event.to_payload()), Ok(event));
        assert!(CtmEvent::from_payload(&[0; 12]).is_err());
    }
}
