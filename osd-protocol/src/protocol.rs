use std::fmt::Display;

/// Address of a debug module on the interconnect.
///
/// The upper 6 bits select the subnet, the lower 10 bits the module within that subnet.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ModuleAddress(u16);

impl ModuleAddress {
    const LOCAL_BITS: u32 = 10;
    const LOCAL_MASK: u16 = (1 << Self::LOCAL_BITS) - 1;
    const SUBNET_MASK: u8 = (1 << 6) - 1;

    /// Addresses every module of every subnet.
    pub const BROADCAST: ModuleAddress = ModuleAddress(0xFFFF);
    /// The subnet control module of subnet 0.
    pub const SCM: ModuleAddress = ModuleAddress(0);
    /// The address the host occupies on subnet 0.
    pub const HOST: ModuleAddress = ModuleAddress(1);

    /// Creates an address from subnet and local index. Excess bits are masked off.
    pub const fn new(subnet: u8, local: u16) -> ModuleAddress {
        ModuleAddress(
            ((subnet & Self::SUBNET_MASK) as u16) << Self::LOCAL_BITS | (local & Self::LOCAL_MASK),
        )
    }

    pub const fn from_raw(raw: u16) -> ModuleAddress {
        ModuleAddress(raw)
    }

    pub const fn raw(&self) -> u16 {
        self.0
    }

    /// The subnet, which is also the number of interconnect hops from the host.
    pub const fn subnet(&self) -> u8 {
        (self.0 >> Self::LOCAL_BITS) as u8
    }

    /// Index of the module within its subnet
    pub const fn local(&self) -> u16 {
        self.0 & Self::LOCAL_MASK
    }

    pub const fn is_broadcast(&self) -> bool {
        self.0 == Self::BROADCAST.0
    }
}

impl Display for ModuleAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_broadcast() {
            write!(f, "*")
        } else {
            write!(f, "{}.{}", self.subnet(), self.local())
        }
    }
}

impl From<u16> for ModuleAddress {
    fn from(value: u16) -> Self {
        ModuleAddress(value)
    }
}

/// The class of a packet decides how the host routes it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PacketClass {
    /// Register access and module control
    Control,
    /// Unsolicited events pushed by a module (e.g. trace)
    Event,
    /// Memory access requested by the host
    DataRequest,
    /// Answer to a [`PacketClass::DataRequest`]
    DataResponse,
    /// Probing and describing modules
    Discovery,
}

impl PacketClass {
    pub const fn to_raw(self) -> u8 {
        match self {
            PacketClass::Control => 0,
            PacketClass::Event => 1,
            PacketClass::DataRequest => 2,
            PacketClass::DataResponse => 3,
            PacketClass::Discovery => 4,
        }
    }

    pub const fn from_raw(raw: u8) -> Option<PacketClass> {
        match raw {
            0 => Some(PacketClass::Control),
            1 => Some(PacketClass::Event),
            2 => Some(PacketClass::DataRequest),
            3 => Some(PacketClass::DataResponse),
            4 => Some(PacketClass::Discovery),
            _ => None,
        }
    }

    /// The class a module answers a request of this class with.
    /// Returns `None` for classes that are not answered.
    pub const fn response_class(self) -> Option<PacketClass> {
        match self {
            PacketClass::Control => Some(PacketClass::Control),
            PacketClass::DataRequest => Some(PacketClass::DataResponse),
            PacketClass::Discovery => Some(PacketClass::Discovery),
            PacketClass::Event | PacketClass::DataResponse => None,
        }
    }
}

impl Display for PacketClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PacketClass::Control => "CONTROL",
            PacketClass::Event => "EVENT",
            PacketClass::DataRequest => "DATA_REQUEST",
            PacketClass::DataResponse => "DATA_RESPONSE",
            PacketClass::Discovery => "DISCOVERY",
        };
        f.write_str(name)
    }
}

/// The four flag bits of a packet header.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// The packet is addressed to all modules
    pub const BROADCAST: Flags = Flags(0b0001);
    /// The packet answers a request from the host
    pub const REPLY: Flags = Flags(0b0010);
    /// The module failed to carry out the request
    pub const ERROR: Flags = Flags(0b0100);

    const MASK: u8 = 0b1111;

    /// Creates flags from the raw nibble. Reserved bits are kept.
    pub const fn from_raw(raw: u8) -> Flags {
        Flags(raw & Self::MASK)
    }

    pub const fn raw(&self) -> u8 {
        self.0
    }

    pub const fn contains(&self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Self) -> Self::Output {
        Flags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0
    }
}

/// A debug packet as exchanged between the host and a module.
///
/// `address` always names the module: for packets sent by the host it is the destination,
/// for packets received by the host it is the module the packet originates from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    pub address: ModuleAddress,
    pub class: PacketClass,
    pub flags: Flags,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(address: ModuleAddress, class: PacketClass, payload: Vec<u8>) -> Packet {
        Packet {
            address,
            class,
            flags: Flags::NONE,
            sequence: 0,
            payload,
        }
    }

    pub fn with_flags(mut self, flags: Flags) -> Packet {
        self.flags = flags;
        self
    }

    pub fn with_sequence(mut self, sequence: u16) -> Packet {
        self.sequence = sequence;
        self
    }

    /// Builds the answer to this packet: same address and sequence, the matching response
    /// class and the [`Flags::REPLY`] flag.
    pub fn reply(&self, payload: Vec<u8>) -> Packet {
        Packet {
            address: self.address,
            class: self.class.response_class().unwrap_or(self.class),
            flags: Flags::REPLY,
            sequence: self.sequence,
            payload,
        }
    }

    /// Like [`Packet::reply`], but flagged as failed.
    pub fn error_reply(&self) -> Packet {
        let mut reply = self.reply(Vec::new());
        reply.flags |= Flags::ERROR;
        reply
    }

    pub fn is_reply(&self) -> bool {
        self.flags.contains(Flags::REPLY)
    }

    pub fn is_error(&self) -> bool {
        self.flags.contains(Flags::ERROR)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn address_parts() {
        let addr = ModuleAddress::new(3, 17);
        assert_eq!(addr.subnet(), 3);
        assert_eq!(addr.local(), 17);
        assert_eq!(addr.raw(), (3 << 10) | 17);
        assert_eq!(addr.to_string(), "3.17");
        assert_eq!(ModuleAddress::BROADCAST.to_string(), "*");
    }

    #[test]
    fn address_masks_excess_bits() {
        let addr = ModuleAddress::new(0xFF, 0xFFFF);
        assert_eq!(addr.subnet(), 63);
        assert_eq!(addr.local(), 1023);
    }

    #[test]
    fn class_raw_values() {
        for raw in 0..5 {
            assert_eq!(PacketClass::from_raw(raw).unwrap().to_raw(), raw);
        }
        assert_eq!(PacketClass::from_raw(5), None);
        assert_eq!(PacketClass::from_raw(15), None);
    }

    #[test]
    fn reply_keeps_sequence() {
        let request = Packet::new(ModuleAddress::new(0, 4), PacketClass::DataRequest, vec![1])
            .with_sequence(77);
        let reply = request.reply(vec![2, 3]);
        assert_eq!(reply.class, PacketClass::DataResponse);
        assert_eq!(reply.sequence, 77);
        assert!(reply.is_reply());
        assert!(!reply.is_error());
        assert!(request.error_reply().is_error());
    }
}
