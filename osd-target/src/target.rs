use std::collections::BTreeMap;

use osd_protocol::{
    Flags, ModuleAddress, Packet, PacketClass,
    module::{ModuleDescriptor, reg},
    payload::{MemoryRequest, ProbeReply, RegisterRequest, RegisterWidth},
};

use crate::{DebugModule, ModuleError, SystemContext};

/// Something went wrong while assembling a target.
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("address {0} is already taken")]
    AddressTaken(ModuleAddress),
    #[error("address {0} is reserved")]
    ReservedAddress(ModuleAddress),
    #[error("no module at address {0}")]
    NoModule(ModuleAddress),
}

struct Slot {
    module: Box<dyn DebugModule>,
    descriptor: ModuleDescriptor,
    control: u16,
    event_dest: u16,
    event_sequence: u16,
    /// Never answers anything
    silent: bool,
}

impl Slot {
    fn is_active(&self) -> bool {
        self.control & reg::MOD_CS_ACTIVE != 0
    }
}

/// A debug interconnect with its modules.
///
/// Packets are dispatched to the module they are addressed to. The answer carries the address
/// of the answering module, the REPLY flag and the sequence of the request.
pub struct Target {
    slots: BTreeMap<ModuleAddress, Slot>,
    /// Additional addresses a module announces itself under
    aliases: Vec<(ModuleAddress, ModuleAddress)>,
    max_packet_len: u16,
}

impl Default for Target {
    fn default() -> Self {
        Target::new()
    }
}

impl Target {
    pub fn new() -> Target {
        Target {
            slots: BTreeMap::new(),
            aliases: Vec::new(),
            max_packet_len: 1024,
        }
    }

    /// Largest payload the target reports in its subnet control module
    pub fn with_max_packet_len(mut self, len: u16) -> Target {
        self.max_packet_len = len;
        self
    }

    pub fn add(&mut self, module: impl DebugModule + 'static) -> Result<ModuleAddress, TargetError> {
        let descriptor = module.descriptor();
        let address = descriptor.address();
        if address.is_broadcast() {
            return Err(TargetError::ReservedAddress(address));
        }
        if self.slots.contains_key(&address) {
            return Err(TargetError::AddressTaken(address));
        }
        log::debug!("Adding module {}", descriptor);
        self.slots.insert(
            address,
            Slot {
                module: Box::new(module),
                descriptor,
                control: 0,
                event_dest: 0,
                event_sequence: 0,
                silent: false,
            },
        );
        Ok(address)
    }

    /// Makes a module ignore every packet, as if it were stuck.
    pub fn silence(&mut self, address: ModuleAddress) -> Result<(), TargetError> {
        self.slots
            .get_mut(&address)
            .ok_or(TargetError::NoModule(address))?
            .silent = true;
        Ok(())
    }

    /// Makes a module answer the discovery probe a second time under `alias`. Used to stage a
    /// misconfigured interconnect where two modules claim the same address.
    pub fn announce_as(
        &mut self,
        address: ModuleAddress,
        alias: ModuleAddress,
    ) -> Result<(), TargetError> {
        if !self.slots.contains_key(&address) {
            return Err(TargetError::NoModule(address));
        }
        self.aliases.push((address, alias));
        Ok(())
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleDescriptor> {
        self.slots.values().map(|slot| &slot.descriptor)
    }

    fn system(&self) -> SystemContext {
        SystemContext {
            num_modules: self.slots.len() as u16,
            max_packet_len: self.max_packet_len,
        }
    }

    /// Number of module slots in `subnet`: one past the highest local address in use,
    /// counting the host slot as in use.
    fn topology_size(&self, subnet: u8) -> u16 {
        let highest = self
            .slots
            .keys()
            .copied()
            .chain(std::iter::once(ModuleAddress::HOST))
            .filter(|a| a.subnet() == subnet)
            .map(|a| a.local())
            .max()
            .unwrap_or(0);
        highest + 1
    }

    /// Handles one packet from the host and returns the answers.
    pub fn handle(&mut self, packet: Packet) -> Vec<Packet> {
        log::debug!(
            "Handling {} packet {} for {}",
            packet.class,
            packet.sequence,
            packet.address
        );
        if packet.class == PacketClass::Discovery
            && (packet.address.is_broadcast() || packet.flags.contains(Flags::BROADCAST))
        {
            return self.answer_probe(&packet);
        }
        let system = self.system();
        let Some(slot) = self.slots.get_mut(&packet.address) else {
            log::debug!("No module at {}, dropping packet", packet.address);
            return Vec::new();
        };
        if slot.silent {
            return Vec::new();
        }
        let reply = match packet.class {
            PacketClass::Discovery => Ok(slot.descriptor.to_payload()),
            PacketClass::Control => RegisterRequest::from_payload(&packet.payload)
                .map_err(|e| {
                    log::warn!("Invalid register request: {}", e);
                    ModuleError::Unsupported
                })
                .and_then(|request| Self::access_register(slot, request, &system)),
            PacketClass::DataRequest => MemoryRequest::from_payload(&packet.payload)
                .map_err(|e| {
                    log::warn!("Invalid memory request: {}", e);
                    ModuleError::Unsupported
                })
                .and_then(|request| slot.module.handle_data(request)),
            PacketClass::Event | PacketClass::DataResponse => {
                log::debug!("Ignoring {} packet from host", packet.class);
                return Vec::new();
            }
        };
        match reply {
            Ok(payload) => vec![packet.reply(payload)],
            Err(e) => {
                log::debug!("Module {} refused request: {}", packet.address, e);
                vec![packet.error_reply()]
            }
        }
    }

    fn answer_probe(&self, probe: &Packet) -> Vec<Packet> {
        let announce = |address: ModuleAddress, slot: &Slot| {
            let topology_size = (slot.descriptor.module_type()
                == Some(osd_protocol::module::ModuleType::Scm))
            .then(|| self.topology_size(address.subnet()));
            Packet::new(
                address,
                PacketClass::Discovery,
                ProbeReply { topology_size }.to_payload(),
            )
            .with_flags(Flags::REPLY)
            .with_sequence(probe.sequence)
        };
        let mut replies: Vec<Packet> = self
            .slots
            .iter()
            .filter(|(_, slot)| !slot.silent)
            .map(|(address, slot)| announce(*address, slot))
            .collect();
        for (address, alias) in &self.aliases {
            if let Some(slot) = self.slots.get(address) {
                replies.push(announce(*alias, slot));
            }
        }
        log::debug!("Answering probe with {} module(s)", replies.len());
        replies
    }

    fn access_register(
        slot: &mut Slot,
        request: RegisterRequest,
        system: &SystemContext,
    ) -> Result<Vec<u8>, ModuleError> {
        match request {
            RegisterRequest::Read { register, width } => {
                let value = match register {
                    reg::MOD_VENDOR => slot.descriptor.vendor().into(),
                    reg::MOD_TYPE => slot.descriptor.type_id().into(),
                    reg::MOD_VERSION => slot.descriptor.version().into(),
                    reg::MOD_CS => slot.control.into(),
                    reg::MOD_EVENT_DEST => slot.event_dest.into(),
                    _ => slot.module.read_register(register, width, system)?,
                };
                Ok(width.encode_value(value))
            }
            RegisterRequest::Write {
                register,
                width,
                value,
            } => {
                match register {
                    reg::MOD_VENDOR | reg::MOD_TYPE | reg::MOD_VERSION => {
                        return Err(ModuleError::ReadOnly(register));
                    }
                    reg::MOD_CS => {
                        slot.control = value as u16;
                        log::info!(
                            "Module {} is now {}",
                            slot.descriptor.address(),
                            if slot.is_active() { "active" } else { "stalled" }
                        );
                    }
                    reg::MOD_EVENT_DEST => {
                        slot.event_dest = value as u16 & reg::MOD_EVENT_DEST_MASK;
                    }
                    _ => slot.module.write_register(register, width, value)?,
                }
                Ok(Vec::new())
            }
        }
    }

    /// Collects the events of all active modules.
    pub fn poll_events(&mut self) -> Vec<Packet> {
        let mut events = Vec::new();
        for (address, slot) in &mut self.slots {
            if slot.silent || !slot.is_active() {
                continue;
            }
            for payload in slot.module.poll_events() {
                let sequence = slot.event_sequence;
                slot.event_sequence = slot.event_sequence.wrapping_add(1);
                log::trace!(
                    "Module {} emits event {} to {}",
                    address,
                    sequence,
                    ModuleAddress::from_raw(slot.event_dest)
                );
                events.push(
                    Packet::new(*address, PacketClass::Event, payload).with_sequence(sequence),
                );
            }
        }
        events
    }

    /// Reads a register the way the host would, bypassing the wire. For tests and the CLI.
    pub fn read_register(
        &mut self,
        address: ModuleAddress,
        register: u16,
    ) -> Result<u16, ModuleError> {
        let system = self.system();
        let slot = self
            .slots
            .get_mut(&address)
            .ok_or(ModuleError::Unsupported)?;
        let payload = Self::access_register(
            slot,
            RegisterRequest::Read {
                register,
                width: RegisterWidth::W16,
            },
            &system,
        )?;
        Ok(u16::from_le_bytes([payload[0], payload[1]]))
    }
}

#[cfg(test)]
mod test {
    use osd_protocol::payload::StmEvent;

    use super::*;
    use crate::modules::{Mam, Scm, Stm};

    const MAM: ModuleAddress = ModuleAddress::new(0, 2);
    const STM: ModuleAddress = ModuleAddress::new(0, 3);

    fn probe() -> Packet {
        Packet::new(ModuleAddress::BROADCAST, PacketClass::Discovery, Vec::new())
            .with_flags(Flags::BROADCAST)
            .with_sequence(5)
    }

    #[test]
    fn probe_is_answered_by_every_module() {
        let mut target = Target::new();
        target.add(Scm::new(ModuleAddress::SCM, 1, 1)).unwrap();
        target.add(Mam::new(MAM, 0, 64)).unwrap();
        let replies = target.handle(probe());
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|r| r.is_reply() && r.sequence == 5));
        assert_eq!(
            ProbeReply::from_payload(&replies[0].payload).topology_size,
            Some(3)
        );
        assert_eq!(ProbeReply::from_payload(&replies[1].payload).topology_size, None);
    }

    #[test]
    fn duplicate_module_is_rejected() {
        let mut target = Target::new();
        target.add(Mam::new(MAM, 0, 64)).unwrap();
        assert!(matches!(
            target.add(Mam::new(MAM, 0, 64)),
            Err(TargetError::AddressTaken(_))
        ));
    }

    #[test]
    fn base_registers_are_served() {
        let mut target = Target::new();
        target.add(Stm::new(STM, 32)).unwrap();
        let write = RegisterRequest::Write {
            register: reg::MOD_EVENT_DEST,
            width: RegisterWidth::W16,
            value: 0xFFFF,
        };
        let reply = target.handle(Packet::new(STM, PacketClass::Control, write.to_payload()));
        assert!(!reply[0].is_error());
        assert_eq!(
            target.read_register(STM, reg::MOD_EVENT_DEST),
            Ok(reg::MOD_EVENT_DEST_MASK)
        );
        assert_eq!(target.read_register(STM, reg::MOD_TYPE), Ok(4));

        let bad = RegisterRequest::Read {
            register: 0x300,
            width: RegisterWidth::W16,
        };
        let reply = target.handle(Packet::new(STM, PacketClass::Control, bad.to_payload()));
        assert!(reply[0].is_error());
    }

    #[test]
    fn events_flow_only_while_active() {
        let mut target = Target::new();
        let stm = Stm::new(STM, 32);
        let queue = stm.queue();
        target.add(stm).unwrap();
        let event = StmEvent {
            timestamp: 0,
            id: 1,
            value: 2,
        };
        queue.push(event);
        assert!(target.poll_events().is_empty());

        let activate = RegisterRequest::Write {
            register: reg::MOD_CS,
            width: RegisterWidth::W16,
            value: reg::MOD_CS_ACTIVE.into(),
        };
        target.handle(Packet::new(STM, PacketClass::Control, activate.to_payload()));
        let events = target.poll_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].address, STM);
        assert_eq!(StmEvent::from_payload(&events[0].payload), Ok(event));
    }

    #[test]
    fn silent_and_aliased_modules() {
        let mut target = Target::new();
        target.add(Scm::new(ModuleAddress::SCM, 1, 1)).unwrap();
        target.add(Mam::new(MAM, 0, 64)).unwrap();
        target.silence(MAM).unwrap();
        target.announce_as(ModuleAddress::SCM, MAM).unwrap();
        let replies = target.handle(probe());
        let announced: Vec<_> = replies.iter().map(|r| r.address).collect();
        assert_eq!(announced, vec![ModuleAddress::SCM, MAM]);
        assert!(
            target
                .handle(Packet::new(MAM, PacketClass::Discovery, Vec::new()))
                .is_empty()
        );
    }
}
