use osd_protocol::{
    ModuleAddress, Packet, PacketClass,
    module::{ModuleType, reg},
    payload::{CtmEvent, StmEvent},
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use super::RegisterAccess;
use crate::error::RequestError;

/// Driver of a trace module (STM or CTM)
#[derive(Clone)]
pub struct TraceDriver {
    registers: RegisterAccess,
    module_type: Option<ModuleType>,
}

impl TraceDriver {
    pub(crate) fn new(registers: RegisterAccess, module_type: Option<ModuleType>) -> TraceDriver {
        TraceDriver {
            registers,
            module_type,
        }
    }

    pub fn registers(&self) -> &RegisterAccess {
        &self.registers
    }

    /// Directs the events of the module to the host and activates it.
    pub async fn start(&self) -> Result<(), RequestError> {
        let host = self.registers.router().config().host_address;
        self.registers
            .write_u16(reg::MOD_EVENT_DEST, host.raw() & reg::MOD_EVENT_DEST_MASK)
            .await?;
        self.registers
            .write_u16(reg::MOD_CS, reg::MOD_CS_ACTIVE)
            .await?;
        log::info!("Trace module {} started", self.registers.address());
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), RequestError> {
        self.registers.write_u16(reg::MOD_CS, 0).await?;
        log::info!("Trace module {} stopped", self.registers.address());
        Ok(())
    }

    /// Subscribes to the events of the module. Only events arriving after this call are seen.
    pub fn events(&self) -> Result<EventStream, RequestError> {
        let router = self.registers.router();
        Ok(EventStream {
            source: self.registers.address(),
            module_type: self.module_type,
            receiver: router.subscribe(self.registers.address())?,
            shutdown: router.shutdown_token(),
            last_sequence: None,
            held_back: None,
        })
    }
}

/// Decoded content of a trace event
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TraceData {
    System(StmEvent),
    Core(CtmEvent),
    /// Event of a module whose format is unknown
    Raw(Vec<u8>),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TraceEvent {
    pub source: ModuleAddress,
    pub sequence: u16,
    pub data: TraceData,
}

/// Irregularities reported inline in an [`EventStream`]
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StreamWarning {
    /// The consumer fell behind and this many events were lost
    Lagged(u64),
    /// Events were lost on the way from the module
    SequenceGap { expected: u16, got: u16 },
    /// An event could not be decoded and was skipped
    Undecodable { sequence: u16 },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TraceItem {
    Event(TraceEvent),
    Warning(StreamWarning),
}

/// Events of one trace module.
///
/// Warnings are yielded inline, the stream only ends when the session is torn down. A stream
/// belongs to the session it was created in; after reconnecting, a new stream has to be
/// requested from the new session.
pub struct EventStream {
    source: ModuleAddress,
    module_type: Option<ModuleType>,
    receiver: broadcast::Receiver<Packet>,
    shutdown: CancellationToken,
    last_sequence: Option<u16>,
    held_back: Option<TraceItem>,
}

impl EventStream {
    pub fn source(&self) -> ModuleAddress {
        self.source
    }

    /// Waits for the next event or warning. `None` once the session is gone.
    pub async fn next(&mut self) -> Option<TraceItem> {
        if let Some(item) = self.held_back.take() {
            return Some(item);
        }
        loop {
            let received = tokio::select! {
                biased;
                received = self.receiver.recv() => received,
                _ = self.shutdown.cancelled() => return None,
            };
            match received {
                Ok(packet) if packet.class == PacketClass::Event => {
                    return Some(self.accept(packet));
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(lost)) => {
                    log::warn!("Event stream of module {} lost {} events", self.source, lost);
                    self.last_sequence = None;
                    return Some(TraceItem::Warning(StreamWarning::Lagged(lost)));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    fn accept(&mut self, packet: Packet) -> TraceItem {
        let expected = self.last_sequence.map(|s| s.wrapping_add(1));
        self.last_sequence = Some(packet.sequence);
        let item = match self.decode(&packet) {
            Some(data) => TraceItem::Event(TraceEvent {
                source: self.source,
                sequence: packet.sequence,
                data,
            }),
            None => TraceItem::Warning(StreamWarning::Undecodable {
                sequence: packet.sequence,
            }),
        };
        match expected {
            Some(expected) if expected != packet.sequence => {
                log::warn!(
                    "Event stream of module {} skipped from {} to {}",
                    self.source,
                    expected,
                    packet.sequence
                );
                self.held_back = Some(item);
                TraceItem::Warning(StreamWarning::SequenceGap {
                    expected,
                    got: packet.sequence,
                })
            }
            _ => item,
        }
    }

    fn decode(&self, packet: &Packet) -> Option<TraceData> {
        let decoded = match self.module_type {
            Some(ModuleType::Stm) => StmEvent::from_payload(&packet.payload).map(TraceData::System),
            Some(ModuleType::Ctm) => CtmEvent::from_payload(&packet.payload).map(TraceData::Core),
            _ => return Some(TraceData::Raw(packet.payload.clone())),
        };
        match decoded {
            Ok(data) => Some(data),
            Err(e) => {
                log::warn!(
                    "Undecodable event {} from module {}: {}",
                    packet.sequence,
                    self.source,
                    e
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use osd_protocol::module::ModuleDescriptor;

    use super::*;
    use crate::{driver::mock, router::Router};

    const STM: ModuleAddress = ModuleAddress::new(0, 3);

    fn stm_router() -> Arc<Router> {
        mock::start(
            vec![ModuleDescriptor::standard(STM, ModuleType::Stm)],
            |request| vec![request.reply(Vec::new())],
        )
    }

    fn event(sequence: u16, id: u16) -> Packet {
        let payload = StmEvent {
            timestamp: 10,
            id,
            value: 0xAB,
        }
        .to_payload(32);
        Packet::new(STM, PacketClass::Event, payload).with_sequence(sequence)
    }

    fn dispatch(router: &Router, packet: &Packet) {
        router.dispatch(&packet.encode(mock::MTU).unwrap());
    }

    #[tokio::test]
    async fn events_are_decoded_in_order() {
        let router = stm_router();
        let driver = TraceDriver::new(RegisterAccess::new(STM, router.clone()), Some(ModuleType::Stm));
        driver.start().await.unwrap();
        let mut stream = driver.events().unwrap();
        dispatch(&router, &event(0, 1));
        dispatch(&router, &event(1, 2));
        for (sequence, id) in [(0, 1), (1, 2)] {
            assert_eq!(
                stream.next().await,
                Some(TraceItem::Event(TraceEvent {
                    source: STM,
                    sequence,
                    data: TraceData::System(StmEvent {
                        timestamp: 10,
                        id,
                        value: 0xAB
                    }),
                }))
            );
        }
    }

    #[tokio::test]
    async fn lost_and_broken_events_are_reported_inline() {
        let router = stm_router();
        let driver = TraceDriver::new(RegisterAccess::new(STM, router.clone()), Some(ModuleType::Stm));
        let mut stream = driver.events().unwrap();
        dispatch(&router, &event(0, 1));
        dispatch(&router, &event(3, 2));
        dispatch(
            &router,
            &Packet::new(STM, PacketClass::Event, vec![1, 2]).with_sequence(4),
        );
        assert!(matches!(stream.next().await, Some(TraceItem::Event(_))));
        assert_eq!(
            stream.next().await,
            Some(TraceItem::Warning(StreamWarning::SequenceGap {
                expected: 1,
                got: 3
            }))
        );
        assert!(matches!(
            stream.next().await,
            Some(TraceItem::Event(TraceEvent { sequence: 3, .. }))
        ));
        assert_eq!(
            stream.next().await,
            Some(TraceItem::Warning(StreamWarning::Undecodable { sequence: 4 }))
        );
    }

    #[tokio::test]
    async fn slow_consumer_sees_lag_warning() {
        let router = stm_router();
        let driver = TraceDriver::new(RegisterAccess::new(STM, router.clone()), Some(ModuleType::Stm));
        let mut stream = driver.events().unwrap();
        // capacity of the mock router is 16
        for sequence in 0..20 {
            dispatch(&router, &event(sequence, 0));
        }
        assert_eq!(
            stream.next().await,
            Some(TraceItem::Warning(StreamWarning::Lagged(4)))
        );
        assert!(matches!(
            stream.next().await,
            Some(TraceItem::Event(TraceEvent { sequence: 4, .. }))
        ));
    }

    #[tokio::test]
    async fn stream_ends_at_teardown() {
        let router = stm_router();
        let driver = TraceDriver::new(RegisterAccess::new(STM, router.clone()), Some(ModuleType::Stm));
        let mut stream = driver.events().unwrap();
        dispatch(&router, &event(0, 1));
        router.teardown();
        // what was already received is still handed out
        assert!(matches!(stream.next().await, Some(TraceItem::Event(_))));
        assert_eq!(stream.next().await, None);
    }
}
