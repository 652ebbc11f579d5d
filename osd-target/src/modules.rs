//! Built-in debug modules
use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
};

use osd_protocol::{
    ModuleAddress,
    module::{ModuleDescriptor, ModuleType, reg},
    payload::{CtmEvent, MemoryLayout, MemoryRegion, MemoryRequest, RegisterWidth, StmEvent},
};

use crate::{DebugModule, ModuleError, SystemContext};

/// How often the system and the CPUs were reset through the subnet control module
#[derive(Debug, Default)]
pub struct ResetCounters {
    system: AtomicU32,
    cpu: AtomicU32,
}

impl ResetCounters {
    pub fn system(&self) -> u32 {
        self.system.load(Ordering::Relaxed)
    }

    pub fn cpu(&self) -> u32 {
        self.cpu.load(Ordering::Relaxed)
    }
}

/// Subnet control module
pub struct Scm {
    address: ModuleAddress,
    vendor_id: u16,
    device_id: u16,
    sysrst: u16,
    resets: Arc<ResetCounters>,
}

impl Scm {
    pub fn new(address: ModuleAddress, vendor_id: u16, device_id: u16) -> Scm {
        Scm {
            address,
            vendor_id,
            device_id,
            sysrst: 0,
            resets: Arc::default(),
        }
    }

    pub fn resets(&self) -> Arc<ResetCounters> {
        self.resets.clone()
    }
}

impl DebugModule for Scm {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::standard(self.address, ModuleType::Scm)
    }

    fn read_register(
        &mut self,
        register: u16,
        _width: RegisterWidth,
        system: &SystemContext,
    ) -> Result<u128, ModuleError> {
        let value = match register {
            reg::SCM_SYSTEM_VENDOR_ID => self.vendor_id,
            reg::SCM_SYSTEM_DEVICE_ID => self.device_id,
            reg::SCM_NUM_MOD => system.num_modules,
            reg::SCM_MAX_PKT_LEN => system.max_packet_len,
            reg::SCM_SYSRST => self.sysrst,
            other => return Err(ModuleError::UnknownRegister(other)),
        };
        Ok(value.into())
    }

    fn write_register(
        &mut self,
        register: u16,
        _width: RegisterWidth,
        value: u128,
    ) -> Result<(), ModuleError> {
        match register {
            reg::SCM_SYSRST => {
                let value = value as u16;
                let raised = value & !self.sysrst;
                if raised & reg::SCM_SYSRST_SYS_RST != 0 {
                    log::info!("System reset");
                    self.resets.system.fetch_add(1, Ordering::Relaxed);
                }
                if raised & reg::SCM_SYSRST_CPU_RST != 0 {
                    log::info!("CPU reset");
                    self.resets.cpu.fetch_add(1, Ordering::Relaxed);
                }
                self.sysrst = value;
                Ok(())
            }
            reg::SCM_SYSTEM_VENDOR_ID
            | reg::SCM_SYSTEM_DEVICE_ID
            | reg::SCM_NUM_MOD
            | reg::SCM_MAX_PKT_LEN => Err(ModuleError::ReadOnly(register)),
            other => Err(ModuleError::UnknownRegister(other)),
        }
    }
}

/// Memory access module backed by a byte buffer
pub struct Mam {
    address: ModuleAddress,
    base: u64,
    memory: Vec<u8>,
}

impl Mam {
    pub fn new(address: ModuleAddress, base: u64, size: usize) -> Mam {
        Mam {
            address,
            base,
            memory: vec![0; size],
        }
    }

    fn range(&self, address: u64, len: usize) -> Result<std::ops::Range<usize>, ModuleError> {
        let out_of_range = ModuleError::OutOfRange {
            address,
            len: len as u64,
        };
        let start = address
            .checked_sub(self.base)
            .and_then(|offset| usize::try_from(offset).ok())
            .ok_or(out_of_range.clone())?;
        let end = start.checked_add(len).ok_or(out_of_range.clone())?;
        if end > self.memory.len() {
            return Err(out_of_range);
        }
        Ok(start..end)
    }
}

impl DebugModule for Mam {
    fn descriptor(&self) -> ModuleDescriptor {
        let layout = MemoryLayout {
            data_width: 32,
            addr_width: 64,
            regions: vec![MemoryRegion {
                base: self.base,
                size: self.memory.len() as u64,
            }],
        };
        ModuleDescriptor::standard(self.address, ModuleType::Mam).with_metadata(layout.to_payload())
    }

    fn read_register(
        &mut self,
        register: u16,
        _width: RegisterWidth,
        _system: &SystemContext,
    ) -> Result<u128, ModuleError> {
        Err(ModuleError::UnknownRegister(register))
    }

    fn write_register(
        &mut self,
        register: u16,
        _width: RegisterWidth,
        _value: u128,
    ) -> Result<(), ModuleError> {
        Err(ModuleError::UnknownRegister(register))
    }

    fn handle_data(&mut self, request: MemoryRequest) -> Result<Vec<u8>, ModuleError> {
        match request {
            MemoryRequest::Read { address, len } => {
                let range = self.range(address, len.into())?;
                Ok(self.memory[range].to_vec())
            }
            MemoryRequest::Write { address, data } => {
                let range = self.range(address, data.len())?;
                self.memory[range].copy_from_slice(&data);
                Ok(Vec::new())
            }
        }
    }
}

/// Queue of events waiting to be emitted by a trace module. Cheap to clone.
#[derive(Debug)]
pub struct EventQueue<T> {
    events: Arc<Mutex<VecDeque<T>>>,
}

impl<T> Clone for EventQueue<T> {
    fn clone(&self) -> Self {
        EventQueue {
            events: self.events.clone(),
        }
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        EventQueue {
            events: Arc::default(),
        }
    }
}

impl<T> EventQueue<T> {
    pub fn push(&self, event: T) {
        self.lock().push_back(event);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn drain(&self) -> Vec<T> {
        self.lock().drain(..).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// System trace module
pub struct Stm {
    address: ModuleAddress,
    xlen: u16,
    queue: EventQueue<StmEvent>,
}

impl Stm {
    /// `xlen` is the width of the traced values in bits
    pub fn new(address: ModuleAddress, xlen: u16) -> Stm {
        Stm {
            address,
            xlen,
            queue: EventQueue::default(),
        }
    }

    pub fn queue(&self) -> EventQueue<StmEvent> {
        self.queue.clone()
    }
}

impl DebugModule for Stm {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::standard(self.address, ModuleType::Stm)
            .with_metadata(self.xlen.to_le_bytes().to_vec())
    }

    fn read_register(
        &mut self,
        register: u16,
        _width: RegisterWidth,
        _system: &SystemContext,
    ) -> Result<u128, ModuleError> {
        Err(ModuleError::UnknownRegister(register))
    }

    fn write_register(
        &mut self,
        register: u16,
        _width: RegisterWidth,
        _value: u128,
    ) -> Result<(), ModuleError> {
        Err(ModuleError::UnknownRegister(register))
    }

    fn poll_events(&mut self) -> Vec<Vec<u8>> {
        self.queue
            .drain()
            .iter()
            .map(|event| event.to_payload(self.xlen))
            .collect()
    }
}

/// Core trace module
pub struct Ctm {
    address: ModuleAddress,
    queue: EventQueue<CtmEvent>,
}

impl Ctm {
    pub fn new(address: ModuleAddress) -> Ctm {
        Ctm {
            address,
            queue: EventQueue::default(),
        }
    }

    pub fn queue(&self) -> EventQueue<CtmEvent> {
        self.queue.clone()
    }
}

impl DebugModule for Ctm {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::standard(self.address, ModuleType::Ctm)
    }

    fn read_register(
        &mut self,
        register: u16,
        _width: RegisterWidth,
        _system: &SystemContext,
    ) -> Result<u128, ModuleError> {
        Err(ModuleError::UnknownRegister(register))
    }

    fn write_register(
        &mut self,
        register: u16,
        _width: RegisterWidth,
        _value: u128,
    ) -> Result<(), ModuleError> {
        Err(ModuleError::UnknownRegister(register))
    }

    fn poll_events(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain().iter().map(CtmEvent::to_payload).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SYSTEM: SystemContext = SystemContext {
        num_modules: 3,
        max_packet_len: 64,
    };

    #[test]
    fn scm_counts_reset_edges() {
        let mut scm = Scm::new(ModuleAddress::SCM, 1, 2);
        let resets = scm.resets();
        let w = RegisterWidth::W16;
        scm.write_register(reg::SCM_SYSRST, w, reg::SCM_SYSRST_CPU_RST.into())
            .unwrap();
        scm.write_register(reg::SCM_SYSRST, w, reg::SCM_SYSRST_CPU_RST.into())
            .unwrap();
        scm.write_register(reg::SCM_SYSRST, w, 0).unwrap();
        scm.write_register(reg::SCM_SYSRST, w, reg::SCM_SYSRST_SYS_RST.into())
            .unwrap();
        assert_eq!(resets.cpu(), 1);
        assert_eq!(resets.system(), 1);
        assert_eq!(scm.read_register(reg::SCM_NUM_MOD, w, &SYSTEM), Ok(3));
        assert_eq!(
            scm.write_register(reg::SCM_NUM_MOD, w, 1),
            Err(ModuleError::ReadOnly(reg::SCM_NUM_MOD))
        );
    }

    #[test]
    fn mam_checks_bounds() {
        let mut mam = Mam::new(ModuleAddress::new(0, 2), 0x1000, 16);
        mam.handle_data(MemoryRequest::Write {
            address: 0x1004,
            data: vec![1, 2, 3],
        })
        .unwrap();
        assert_eq!(
            mam.handle_data(MemoryRequest::Read {
                address: 0x1003,
                len: 5
            }),
            Ok(vec![0, 1, 2, 3, 0])
        );
        assert!(matches!(
            mam.handle_data(MemoryRequest::Read {
                address: 0xFFF,
                len: 1
            }),
            Err(ModuleError::OutOfRange { .. })
        ));
        assert!(
            mam.handle_data(MemoryRequest::Read {
                address: 0x100F,
                len: 2
            })
            .is_err()
        );
        let layout = MemoryLayout::from_payload(mam.descriptor().metadata()).unwrap();
        assert_eq!(layout.regions, vec![MemoryRegion { base: 0x1000, size: 16 }]);
    }

    #[test]
    fn trace_modules_drain_their_queue() {
        let mut stm = Stm::new(ModuleAddress::new(0, 3), 32);
        let queue = stm.queue();
        queue.push(StmEvent {
            timestamp: 1,
            id: 2,
            value: 3,
        });
        assert_eq!(queue.len(), 1);
        assert_eq!(stm.poll_events().len(), 1);
        assert!(queue.is_empty());
        assert!(stm.poll_events().is_empty());
    }
}
