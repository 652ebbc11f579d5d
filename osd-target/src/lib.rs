//! # OSD Target
//!
//! A simulated Open SoC Debug target. It answers the host side of the protocol the way a real
//! debug interconnect would and is used to test hosts and to try out tools without hardware.
//!
//! ## Architecture
//!
//! - **[`DebugModule`] Trait**: the behaviour of one debug module (registers, memory, events)
//! - **[`modules`]**: built-in subnet control, memory access and trace modules
//! - **[`Target`]**: owns the modules, answers discovery and dispatches packets by address
//! - **[`server::Server`]**: exposes a target over TCP, UDP, an in-memory link or a simulated
//!   scan chain
//!
//! ## Basic Usage
//!
//! ```ignore
//! use osd_protocol::ModuleAddress;
//! use osd_target::{Target, modules::{Mam, Scm}, server::Builder};
//!
//! let mut target = Target::new();
//! target.add(Scm::new(ModuleAddress::SCM, 0x1, 0x2))?;
//! target.add(Mam::new(ModuleAddress::new(0, 2), 0, 4096))?;
//!
//! let server = Builder::new().build(target);
//! server.listen("127.0.0.1:9537").await?;
//! ```
//!
//! ## Logging
//!
//! This crate uses the `log` crate. Client connections are logged at `info` level, every
//! handled packet at `debug` and raw packets at `trace`.
use osd_protocol::{
    module::ModuleDescriptor,
    payload::{MemoryRequest, RegisterWidth},
};
use thiserror::Error;

pub mod modules;
pub mod server;
pub mod target;

pub use target::Target;

/// Why a module refused a request. Answered with an error-flagged reply.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ModuleError {
    #[error("register {0:#06x} does not exist")]
    UnknownRegister(u16),
    #[error("register {0:#06x} is read-only")]
    ReadOnly(u16),
    #[error("{len} bytes at {address:#x} are outside of the memory")]
    OutOfRange { address: u64, len: u64 },
    #[error("request is not supported by this module")]
    Unsupported,
}

/// Properties of the whole target that modules may report
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SystemContext {
    pub num_modules: u16,
    pub max_packet_len: u16,
}

/// Behaviour of a single debug module.
///
/// The base registers (vendor, type, version, control/status and event destination) are
/// handled by the [`Target`]. A module only implements its own registers.
pub trait DebugModule: Send {
    /// Identity of the module, including its address
    fn descriptor(&self) -> ModuleDescriptor;

    fn read_register(
        &mut self,
        register: u16,
        width: RegisterWidth,
        system: &SystemContext,
    ) -> Result<u128, ModuleError>;

    fn write_register(
        &mut self,
        register: u16,
        width: RegisterWidth,
        value: u128,
    ) -> Result<(), ModuleError>;

    /// Handles a memory request and returns the reply payload.
    fn handle_data(&mut self, request: MemoryRequest) -> Result<Vec<u8>, ModuleError> {
        let _ = request;
        Err(ModuleError::Unsupported)
    }

    /// Takes the event payloads the module produced since the last call.
    /// Only called while the module is active.
    fn poll_events(&mut self) -> Vec<Vec<u8>> {
        Vec::new()
    }
}
