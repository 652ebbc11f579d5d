use osd_protocol::{ModuleAddress, module::reg};

use super::RegisterAccess;
use crate::error::RequestError;

/// What the subnet control module reports about the system under debug
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SystemInfo {
    pub vendor_id: u16,
    pub device_id: u16,
    pub num_modules: u16,
    pub max_packet_len: u16,
}

/// Driver of a subnet control module (SCM)
#[derive(Clone)]
pub struct ControlDriver {
    registers: RegisterAccess,
}

impl ControlDriver {
    pub(crate) fn new(registers: RegisterAccess) -> ControlDriver {
        ControlDriver { registers }
    }

    pub fn registers(&self) -> &RegisterAccess {
        &self.registers
    }

    /// Reads the system identification registers. The reads are issued together.
    pub async fn system_info(&self) -> Result<SystemInfo, RequestError> {
        let (vendor_id, device_id, num_modules, max_packet_len) = tokio::try_join!(
            self.registers.read_u16(reg::SCM_SYSTEM_VENDOR_ID),
            self.registers.read_u16(reg::SCM_SYSTEM_DEVICE_ID),
            self.registers.read_u16(reg::SCM_NUM_MOD),
            self.registers.read_u16(reg::SCM_MAX_PKT_LEN),
        )?;
        Ok(SystemInfo {
            vendor_id,
            device_id,
            num_modules,
            max_packet_len,
        })
    }

    /// Pulses the system reset.
    pub async fn reset_system(&self) -> Result<(), RequestError> {
        log::info!("Resetting system");
        self.registers
            .write_u16(reg::SCM_SYSRST, reg::SCM_SYSRST_SYS_RST)
            .await?;
        self.registers.write_u16(reg::SCM_SYSRST, 0).await
    }

    /// Holds all CPUs in reset.
    pub async fn stop_cpus(&self) -> Result<(), RequestError> {
        self.registers
            .write_u16(reg::SCM_SYSRST, reg::SCM_SYSRST_CPU_RST)
            .await
    }

    /// Releases the CPUs from reset.
    pub async fn start_cpus(&self) -> Result<(), RequestError> {
        self.registers.write_u16(reg::SCM_SYSRST, 0).await
    }

    /// Pulses the CPU reset.
    pub async fn reset_cpus(&self) -> Result<(), RequestError> {
        log::info!("Resetting CPUs");
        self.stop_cpus().await?;
        self.start_cpus().await
    }

    /// Sets the ACTIVE bit of another module.
    pub async fn activate(&self, address: ModuleAddress) -> Result<(), RequestError> {
        self.set_active(address, true).await
    }

    /// Clears the ACTIVE bit of another module. A stalled module stops emitting events.
    pub async fn stall(&self, address: ModuleAddress) -> Result<(), RequestError> {
        self.set_active(address, false).await
    }

    async fn set_active(&self, address: ModuleAddress, active: bool) -> Result<(), RequestError> {
        let router = self.registers.router();
        router.descriptor(address)?;
        let value = if active { reg::MOD_CS_ACTIVE } else { 0 };
        RegisterAccess::new(address, router.clone())
            .write_u16(reg::MOD_CS, value)
            .await
    }
}
