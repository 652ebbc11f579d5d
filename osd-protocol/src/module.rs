//! Module descriptors, well-known module types and the standard register map.
use std::fmt::Display;

use crate::{error::PayloadError, protocol::ModuleAddress};

/// Registers every debug module implements, followed by the registers of the subnet
/// control module.
pub mod reg {
    pub const MOD_VENDOR: u16 = 0x0000;
    pub const MOD_TYPE: u16 = 0x0001;
    pub const MOD_VERSION: u16 = 0x0002;
    /// Control and status
    pub const MOD_CS: u16 = 0x0003;
    pub const MOD_CS_ACTIVE: u16 = 1 << 0;
    /// Address that events of this module are sent to
    pub const MOD_EVENT_DEST: u16 = 0x0004;
    pub const MOD_EVENT_DEST_MASK: u16 = (1 << 10) - 1;

    pub const SCM_SYSTEM_VENDOR_ID: u16 = 0x0200;
    pub const SCM_SYSTEM_DEVICE_ID: u16 = 0x0201;
    pub const SCM_NUM_MOD: u16 = 0x0202;
    pub const SCM_MAX_PKT_LEN: u16 = 0x0203;
    pub const SCM_SYSRST: u16 = 0x0204;
    pub const SCM_SYSRST_SYS_RST: u16 = 1 << 0;
    pub const SCM_SYSRST_CPU_RST: u16 = 1 << 1;
}

/// Standard module types
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ModuleType {
    /// Subnet Control Module
    Scm,
    /// Device Emulation Module UART
    DemUart,
    /// Memory Access Module
    Mam,
    /// System Trace Module
    Stm,
    /// Core Trace Module
    Ctm,
}

impl ModuleType {
    pub const fn id(self) -> u16 {
        match self {
            ModuleType::Scm => 0x0001,
            ModuleType::DemUart => 0x0002,
            ModuleType::Mam => 0x0003,
            ModuleType::Stm => 0x0004,
            ModuleType::Ctm => 0x0005,
        }
    }

    pub const fn from_id(id: u16) -> Option<ModuleType> {
        match id {
            0x0001 => Some(ModuleType::Scm),
            0x0002 => Some(ModuleType::DemUart),
            0x0003 => Some(ModuleType::Mam),
            0x0004 => Some(ModuleType::Stm),
            0x0005 => Some(ModuleType::Ctm),
            _ => None,
        }
    }

    pub const fn short_name(self) -> &'static str {
        match self {
            ModuleType::Scm => "SCM",
            ModuleType::DemUart => "DEM_UART",
            ModuleType::Mam => "MAM",
            ModuleType::Stm => "STM",
            ModuleType::Ctm => "CTM",
        }
    }

    pub const fn long_name(self) -> &'static str {
        match self {
            ModuleType::Scm => "Subnet Control Module",
            ModuleType::DemUart => "Device Emulation Module UART",
            ModuleType::Mam => "Memory Access Module",
            ModuleType::Stm => "System Trace Module",
            ModuleType::Ctm => "Core Trace Module",
        }
    }

    /// The capabilities a module of this type is expected to have.
    pub const fn default_capabilities(self) -> Capabilities {
        match self {
            ModuleType::Scm => Capabilities(Capabilities::REGISTERS.0 | Capabilities::CONTROL.0),
            ModuleType::DemUart => Capabilities::REGISTERS,
            ModuleType::Mam => Capabilities(Capabilities::REGISTERS.0 | Capabilities::MEMORY.0),
            ModuleType::Stm | ModuleType::Ctm => {
                Capabilities(Capabilities::REGISTERS.0 | Capabilities::TRACE.0)
            }
        }
    }
}

/// Known module vendors
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Vendor {
    Osd,
    Optimsoc,
    LowRisc,
}

impl Vendor {
    pub const fn id(self) -> u16 {
        match self {
            Vendor::Osd => 0x0001,
            Vendor::Optimsoc => 0x0002,
            Vendor::LowRisc => 0x0003,
        }
    }

    pub const fn from_id(id: u16) -> Option<Vendor> {
        match id {
            0x0001 => Some(Vendor::Osd),
            0x0002 => Some(Vendor::Optimsoc),
            0x0003 => Some(Vendor::LowRisc),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Vendor::Osd => "The Open SoC Debug Project",
            Vendor::Optimsoc => "The OpTiMSoC Project",
            Vendor::LowRisc => "LowRISC",
        }
    }
}

/// What a module is able to do
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Capabilities(u16);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    /// Controls the system (reset, module activation)
    pub const CONTROL: Capabilities = Capabilities(1 << 0);
    /// Gives access to target memory
    pub const MEMORY: Capabilities = Capabilities(1 << 1);
    /// Emits trace events
    pub const TRACE: Capabilities = Capabilities(1 << 2);
    /// Has the standard register map
    pub const REGISTERS: Capabilities = Capabilities(1 << 3);

    pub const fn from_raw(raw: u16) -> Capabilities {
        Capabilities(raw)
    }

    pub const fn raw(&self) -> u16 {
        self.0
    }

    pub const fn contains(&self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Self) -> Self::Output {
        Capabilities(self.0 | rhs.0)
    }
}

/// Static description of a debug module, collected during discovery.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModuleDescriptor {
    address: ModuleAddress,
    vendor: u16,
    module_type: u16,
    version: u16,
    capabilities: Capabilities,
    metadata: Vec<u8>,
}

impl ModuleDescriptor {
    /// Size of the fixed part of an encoded descriptor
    pub const ENCODED_LEN: usize = 8;

    pub fn new(
        address: ModuleAddress,
        vendor: u16,
        module_type: u16,
        version: u16,
        capabilities: Capabilities,
    ) -> ModuleDescriptor {
        ModuleDescriptor {
            address,
            vendor,
            module_type,
            version,
            capabilities,
            metadata: Vec::new(),
        }
    }

    /// Descriptor of a standard module from the OSD vendor
    pub fn standard(address: ModuleAddress, module_type: ModuleType) -> ModuleDescriptor {
        ModuleDescriptor::new(
            address,
            Vendor::Osd.id(),
            module_type.id(),
            0,
            module_type.default_capabilities(),
        )
    }

    pub fn with_metadata(mut self, metadata: Vec<u8>) -> ModuleDescriptor {
        self.metadata = metadata;
        self
    }

    pub fn address(&self) -> ModuleAddress {
        self.address
    }

    pub fn vendor(&self) -> u16 {
        self.vendor
    }

    pub fn type_id(&self) -> u16 {
        self.module_type
    }

    /// The standard type, if the type identifier is a known one
    pub fn module_type(&self) -> Option<ModuleType> {
        ModuleType::from_id(self.module_type)
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Vendor-specific data following the fixed descriptor fields
    pub fn metadata(&self) -> &[u8] {
        &self.metadata
    }

    /// Encodes everything except the address, which travels in the packet header.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN + self.metadata.len());
        out.extend_from_slice(&self.vendor.to_le_bytes());
        out.extend_from_slice(&self.module_type.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.capabilities.raw().to_le_bytes());
        out.extend_from_slice(&self.metadata);
        out
    }

    pub fn from_payload(
        address: ModuleAddress,
        payload: &[u8],
    ) -> Result<ModuleDescriptor, PayloadError> {
        PayloadError::check_len(payload, Self::ENCODED_LEN)?;
        let word = |i: usize| u16::from_le_bytes([payload[i], payload[i + 1]]);
        Ok(ModuleDescriptor {
            address,
            vendor: word(0),
            module_type: word(2),
            version: word(4),
            capabilities: Capabilities::from_raw(word(6)),
            metadata: payload[Self::ENCODED_LEN..].to_vec(),
        })
    }
}

impl Display for ModuleDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let type_name = self
            .module_type()
            .map(ModuleType::short_name)
            .unwrap_or("UNKNOWN");
        write!(
            f,
            "{} {}:{:#06x} (vendor {:#06x}, v{})",
            self.address, type_name, self.module_type, self.vendor, self.version
        )
    }
}
