use std::collections::VecDeque;

use osd_protocol::{
    PacketClass,
    error::PayloadError,
    payload::{MemoryLayout, MemoryRequest},
};

use super::{RegisterAccess, check_reply};
use crate::{error::RequestError, router::PendingRequest};

/// Driver of a memory access module (MAM).
///
/// Transfers are split into packets that fit the MTU. Up to `max_pending_per_module` packets
/// of one transfer are in flight at once.
#[derive(Clone)]
pub struct MemoryDriver {
    registers: RegisterAccess,
    layout: Option<MemoryLayout>,
}

impl MemoryDriver {
    pub(crate) fn new(registers: RegisterAccess, metadata: &[u8]) -> MemoryDriver {
        let layout = if metadata.is_empty() {
            None
        } else {
            match MemoryLayout::from_payload(metadata) {
                Ok(layout) => Some(layout),
                Err(e) => {
                    log::warn!(
                        "Ignoring memory layout of module {}: {}",
                        registers.address(),
                        e
                    );
                    None
                }
            }
        };
        MemoryDriver { registers, layout }
    }

    pub fn registers(&self) -> &RegisterAccess {
        &self.registers
    }

    /// Memory layout announced by the module, if any
    pub fn layout(&self) -> Option<&MemoryLayout> {
        self.layout.as_ref()
    }

    fn window(&self) -> usize {
        self.registers.router().config().max_pending_per_module.max(1)
    }

    pub async fn read(&self, address: u64, len: usize) -> Result<Vec<u8>, RequestError> {
        let chunk_len = self.registers.router().mtu().min(u16::MAX as usize).max(1);
        log::debug!(
            "Reading {} bytes at {:#x} from module {}",
            len,
            address,
            self.registers.address()
        );
        let mut data = Vec::with_capacity(len);
        let mut in_flight: VecDeque<(PendingRequest, usize)> = VecDeque::new();
        let mut offset = 0;
        while offset < len {
            if in_flight.len() == self.window()
                && let Some((pending, expected)) = in_flight.pop_front()
            {
                data.extend(self.finish_read(pending, expected).await?);
            }
            let n = chunk_len.min(len - offset);
            let request = MemoryRequest::Read {
                address: address.wrapping_add(offset as u64),
                len: n as u16,
            };
            let pending = self
                .registers
                .router()
                .request(
                    self.registers.address(),
                    PacketClass::DataRequest,
                    request.to_payload(),
                )
                .await?;
            in_flight.push_back((pending, n));
            offset += n;
        }
        while let Some((pending, expected)) = in_flight.pop_front() {
            data.extend(self.finish_read(pending, expected).await?);
        }
        Ok(data)
    }

    async fn finish_read(
        &self,
        pending: PendingRequest,
        expected: usize,
    ) -> Result<Vec<u8>, RequestError> {
        let packet = check_reply(self.registers.address(), pending.wait().await?)?;
        if packet.payload.len() != expected {
            return Err(RequestError::InvalidResponse {
                address: self.registers.address(),
                source: PayloadError::TooShort {
                    expected,
                    got: packet.payload.len(),
                },
            });
        }
        Ok(packet.payload)
    }

    pub async fn write(&self, address: u64, data: &[u8]) -> Result<(), RequestError> {
        let chunk_len = self
            .registers
            .router()
            .mtu()
            .saturating_sub(MemoryRequest::HEADER_LEN)
            .max(1);
        log::debug!(
            "Writing {} bytes at {:#x} to module {}",
            data.len(),
            address,
            self.registers.address()
        );
        let mut in_flight = VecDeque::new();
        for (i, chunk) in data.chunks(chunk_len).enumerate() {
            if in_flight.len() == self.window()
                && let Some(pending) = in_flight.pop_front()
            {
                self.finish_write(pending).await?;
            }
            let request = MemoryRequest::Write {
                address: address.wrapping_add((i * chunk_len) as u64),
                data: chunk.to_vec(),
            };
            in_flight.push_back(
                self.registers
                    .router()
                    .request(
                        self.registers.address(),
                        PacketClass::DataRequest,
                        request.to_payload(),
                    )
                    .await?,
            );
        }
        while let Some(pending) = in_flight.pop_front() {
            self.finish_write(pending).await?;
        }
        Ok(())
    }

    async fn finish_write(&self, pending: PendingRequest) -> Result<(), RequestError> {
        check_reply(self.registers.address(), pending.wait().await?).map(|_| ())
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use osd_protocol::{
        ModuleAddress,
        module::{ModuleDescriptor, ModuleType},
        payload::MemoryRegion,
    };

    use super::*;
    use crate::driver::{ModuleDriver, mock};

    const MAM: ModuleAddress = ModuleAddress::new(0, 2);

    fn memory_router(memory: Arc<Mutex<Vec<u8>>>) -> Arc<crate::router::Router> {
        let layout = MemoryLayout {
            data_width: 32,
            addr_width: 32,
            regions: vec![MemoryRegion { base: 0, size: 1024 }],
        };
        let descriptor =
            ModuleDescriptor::standard(MAM, ModuleType::Mam).with_metadata(layout.to_payload());
        mock::start(vec![descriptor], move |request| {
            let mut memory = memory.lock().unwrap();
            match MemoryRequest::from_payload(&request.payload) {
                Ok(MemoryRequest::Read { address, len }) => {
                    let start = address as usize;
                    match memory.get(start..start + len as usize) {
                        Some(data) => vec![request.reply(data.to_vec())],
                        None => vec![request.error_reply()],
                    }
                }
                Ok(MemoryRequest::Write { address, data }) => {
                    let start = address as usize;
                    match memory.get_mut(start..start + data.len()) {
                        Some(target) => {
                            target.copy_from_slice(&data);
                            vec![request.reply(Vec::new())]
                        }
                        None => vec![request.error_reply()],
                    }
                }
                Err(_) => vec![request.error_reply()],
            }
        })
    }

    fn driver(router: Arc<crate::router::Router>) -> MemoryDriver {
        let descriptor = router.descriptor(MAM).unwrap().clone();
        match ModuleDriver::for_descriptor(&descriptor, router) {
            ModuleDriver::Memory(driver) => driver,
            _ => panic!("expected a memory driver"),
        }
    }

    #[tokio::test]
    async fn transfers_span_many_packets() {
        let memory = Arc::new(Mutex::new(vec![0u8; 1024]));
        let driver = driver(memory_router(memory.clone()));
        assert_eq!(driver.layout().unwrap().regions[0].size, 1024);

        // larger than mtu * max_pending, so the window has to slide
        let data: Vec<u8> = (0..600).map(|i| i as u8).collect();
        driver.write(100, &data).await.unwrap();
        assert_eq!(&memory.lock().unwrap()[100..700], &data[..]);
        assert_eq!(driver.read(100, 600).await.unwrap(), data);
    }

    #[tokio::test]
    async fn out_of_range_access_is_device_error() {
        let memory = Arc::new(Mutex::new(vec![0u8; 1024]));
        let driver = driver(memory_router(memory));
        assert!(matches!(
            driver.read(1000, 100).await,
            Err(RequestError::DeviceError(a)) if a == MAM
        ));
        assert!(matches!(
            driver.write(1020, &[0; 8]).await,
            Err(RequestError::DeviceError(_))
        ));
    }
}
