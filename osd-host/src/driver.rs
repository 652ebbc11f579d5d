//! # Module Drivers
//!
//! Typed access to the modules of a session. The driver of a module is chosen once, from its
//! descriptor, when it is requested from the session. A driver only knows the address of its
//! module and the router of the session, so it is cheap to create and to clone.
use std::sync::Arc;

use osd_protocol::{
    ModuleAddress, Packet, PacketClass,
    module::{Capabilities, ModuleDescriptor, ModuleType},
    payload::{RegisterRequest, RegisterWidth},
};

use crate::{
    error::RequestError,
    router::{Response, Router},
};

pub mod control;
pub mod memory;
pub mod trace;

pub use control::{ControlDriver, SystemInfo};
pub use memory::MemoryDriver;
pub use trace::{EventStream, StreamWarning, TraceData, TraceDriver, TraceEvent, TraceItem};

/// Register access to a single module. Every driver offers it.
#[derive(Clone)]
pub struct RegisterAccess {
    address: ModuleAddress,
    router: Arc<Router>,
}

impl RegisterAccess {
    pub fn new(address: ModuleAddress, router: Arc<Router>) -> RegisterAccess {
        RegisterAccess { address, router }
    }

    pub fn address(&self) -> ModuleAddress {
        self.address
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub async fn read_register(
        &self,
        register: u16,
        width: RegisterWidth,
    ) -> Result<u128, RequestError> {
        let request = RegisterRequest::Read { register, width };
        let reply = self.call(PacketClass::Control, request.to_payload()).await?;
        width
            .decode_value(&reply.payload)
            .map_err(|source| RequestError::InvalidResponse {
                address: self.address,
                source,
            })
    }

    /// Reads a 16 bit register, the width of every register in the base map
    pub async fn read_u16(&self, register: u16) -> Result<u16, RequestError> {
        let value = self.read_register(register, RegisterWidth::W16).await?;
        Ok(value as u16)
    }

    pub async fn write_register(
        &self,
        register: u16,
        width: RegisterWidth,
        value: u128,
    ) -> Result<(), RequestError> {
        let request = RegisterRequest::Write {
            register,
            width,
            value,
        };
        self.call(PacketClass::Control, request.to_payload())
            .await
            .map(|_| ())
    }

    pub async fn write_u16(&self, register: u16, value: u16) -> Result<(), RequestError> {
        self.write_register(register, RegisterWidth::W16, value.into())
            .await
    }

    /// Sends a request and waits for the answer. An error flagged answer becomes
    /// [`RequestError::DeviceError`].
    pub(crate) async fn call(
        &self,
        class: PacketClass,
        payload: Vec<u8>,
    ) -> Result<Packet, RequestError> {
        let response = self.router.call(self.address, class, payload).await?;
        check_reply(self.address, response)
    }
}

pub(crate) fn check_reply(address: ModuleAddress, response: Response) -> Result<Packet, RequestError> {
    if response.packet.is_error() {
        log::warn!("Module {} answered request {} with an error", address, response.packet.sequence);
        return Err(RequestError::DeviceError(address));
    }
    Ok(response.packet)
}

/// Driver for modules without specialised support: register access and raw requests.
#[derive(Clone)]
pub struct GenericDriver {
    registers: RegisterAccess,
}

impl GenericDriver {
    pub fn registers(&self) -> &RegisterAccess {
        &self.registers
    }

    /// Sends an arbitrary request to the module.
    pub async fn request(
        &self,
        class: PacketClass,
        payload: Vec<u8>,
    ) -> Result<Response, RequestError> {
        self.registers
            .router
            .call(self.registers.address, class, payload)
            .await
    }
}

/// The driver of a module, chosen by its type
#[derive(Clone)]
pub enum ModuleDriver {
    Control(ControlDriver),
    Memory(MemoryDriver),
    Trace(TraceDriver),
    Generic(GenericDriver),
}

impl ModuleDriver {
    /// Picks the driver for a module. Unknown module types are matched by their capabilities.
    pub fn for_descriptor(descriptor: &ModuleDescriptor, router: Arc<Router>) -> ModuleDriver {
        let registers = RegisterAccess::new(descriptor.address(), router);
        let capabilities = descriptor.capabilities();
        match descriptor.module_type() {
            Some(ModuleType::Scm) => ModuleDriver::Control(ControlDriver::new(registers)),
            Some(ModuleType::Mam) => {
                ModuleDriver::Memory(MemoryDriver::new(registers, descriptor.metadata()))
            }
            Some(module_type @ (ModuleType::Stm | ModuleType::Ctm)) => {
                ModuleDriver::Trace(TraceDriver::new(registers, Some(module_type)))
            }
            _ if capabilities.contains(Capabilities::CONTROL) => {
                ModuleDriver::Control(ControlDriver::new(registers))
            }
            _ if capabilities.contains(Capabilities::MEMORY) => {
                ModuleDriver::Memory(MemoryDriver::new(registers, descriptor.metadata()))
            }
            _ if capabilities.contains(Capabilities::TRACE) => {
                ModuleDriver::Trace(TraceDriver::new(registers, None))
            }
            _ => ModuleDriver::Generic(GenericDriver { registers }),
        }
    }

    pub fn registers(&self) -> &RegisterAccess {
        match self {
            ModuleDriver::Control(driver) => driver.registers(),
            ModuleDriver::Memory(driver) => driver.registers(),
            ModuleDriver::Trace(driver) => driver.registers(),
            ModuleDriver::Generic(driver) => driver.registers(),
        }
    }

    pub fn address(&self) -> ModuleAddress {
        self.registers().address()
    }

    pub async fn read_register(
        &self,
        register: u16,
        width: RegisterWidth,
    ) -> Result<u128, RequestError> {
        self.registers().read_register(register, width).await
    }

    pub async fn write_register(
        &self,
        register: u16,
        width: RegisterWidth,
        value: u128,
    ) -> Result<(), RequestError> {
        self.registers().write_register(register, width, value).await
    }

    pub fn as_control(&self) -> Option<&ControlDriver> {
        match self {
            ModuleDriver::Control(driver) => Some(driver),
            _ => None,
        }
    }

    pub fn as_memory(&self) -> Option<&MemoryDriver> {
        match self {
            ModuleDriver::Memory(driver) => Some(driver),
            _ => None,
        }
    }

    pub fn as_trace(&self) -> Option<&TraceDriver> {
        match self {
            ModuleDriver::Trace(driver) => Some(driver),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ModuleDriver::Control(_) => "control",
            ModuleDriver::Memory(_) => "memory",
            ModuleDriver::Trace(_) => "trace",
            ModuleDriver::Generic(_) => "generic",
        }
    }
}
