//! # Discovery
//!
//! Finds the modules reachable through a freshly connected [`Link`] and fills the [`Registry`].
//!
//! Discovery runs through `Idle -> Probing -> Enumerating -> Finalized`. Any transport error or
//! a topology inconsistency (two modules claiming one address) ends in `Failed`.
//!
//! 1. **Probing** broadcasts a DISCOVERY packet and collects answers until the probe window
//!    closes. No answer at all means an empty topology, which is not an error.
//! 2. **Enumerating** asks each address chosen by the [`EnumerationPolicy`] to describe itself.
//!    A module that stays silent after all retries is recorded as [`DegradedModule`] and
//!    discovery carries on.
//! 3. **Finalized** seals the registry.
use std::{collections::BTreeMap, fmt::Debug};

use bytes::Bytes;
use osd_protocol::{
    Flags, ModuleAddress, Packet, PacketClass,
    error::PayloadError,
    module::ModuleDescriptor,
    payload::ProbeReply,
};
use tokio::time::Instant;

use crate::{
    config::Config,
    error::{ConnectError, TransportError},
    registry::Registry,
    transport::Link,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DiscoveryState {
    Idle,
    Probing,
    Enumerating,
    Finalized,
    Failed,
}

/// Why a module ended up degraded
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DegradeReason {
    NoResponse,
    ErrorReply,
    InvalidDescriptor(PayloadError),
}

/// A module that was expected during enumeration but could not be described.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DegradedModule {
    pub address: ModuleAddress,
    pub attempts: u32,
    pub reason: DegradeReason,
}

/// Answers collected while probing
#[derive(Clone, Debug, Default)]
pub struct ProbeResult {
    responders: BTreeMap<ModuleAddress, ProbeReply>,
}

impl ProbeResult {
    pub fn insert(&mut self, address: ModuleAddress, reply: ProbeReply) -> Result<(), ConnectError> {
        if self.responders.insert(address, reply).is_some() {
            return Err(ConnectError::DuplicateAddress(address));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.responders.is_empty()
    }

    /// Responding modules ordered by subnet, then local index
    pub fn responders(&self) -> impl Iterator<Item = (ModuleAddress, ProbeReply)> + '_ {
        self.responders.iter().map(|(a, r)| (*a, *r))
    }
}

/// Decides in which order, and which, addresses are enumerated.
///
/// The addressing scheme is defined by the physical topology, hence it is pluggable.
pub trait EnumerationPolicy: Debug + Send + Sync {
    fn plan(&self, probe: &ProbeResult, host: ModuleAddress) -> Vec<ModuleAddress>;
}

/// Walks every module slot a subnet control module announced, in chain order, followed by any
/// responder outside the announced range. Slots that did not answer the probe are still asked,
/// so that missing modules are reported as degraded.
#[derive(Copy, Clone, Debug, Default)]
pub struct ChainOrder;

impl EnumerationPolicy for ChainOrder {
    fn plan(&self, probe: &ProbeResult, host: ModuleAddress) -> Vec<ModuleAddress> {
        let mut sizes: BTreeMap<u8, u16> = BTreeMap::new();
        for (address, reply) in probe.responders() {
            let size = sizes.entry(address.subnet()).or_default();
            *size = (*size).max(reply.topology_size.unwrap_or(0));
        }
        let mut plan = Vec::new();
        for (&subnet, &size) in &sizes {
            plan.extend((0..size).map(|local| ModuleAddress::new(subnet, local)));
            plan.extend(
                probe
                    .responders()
                    .map(|(address, _)| address)
                    .filter(|a| a.subnet() == subnet && a.local() >= size),
            );
        }
        plan.retain(|a| *a != host);
        plan
    }
}

/// Enumerates responders only, breadth first by hop count (subnet), then local index.
#[derive(Copy, Clone, Debug, Default)]
pub struct HopOrder;

impl EnumerationPolicy for HopOrder {
    fn plan(&self, probe: &ProbeResult, host: ModuleAddress) -> Vec<ModuleAddress> {
        probe
            .responders()
            .map(|(address, _)| address)
            .filter(|a| *a != host)
            .collect()
    }
}

/// Result of a finalized discovery
#[derive(Debug)]
pub struct DiscoveryReport {
    pub registry: Registry,
}

impl DiscoveryReport {
    /// Modules that could not be described. These are warnings, not errors.
    pub fn degraded(&self) -> &[DegradedModule] {
        self.registry.degraded()
    }
}

/// Runs discovery over a link that is not yet used by a router.
pub struct Discovery<'a> {
    link: &'a mut Link,
    config: &'a Config,
    state: DiscoveryState,
    sequence: u16,
}

impl<'a> Discovery<'a> {
    pub fn new(link: &'a mut Link, config: &'a Config) -> Discovery<'a> {
        Discovery {
            link,
            config,
            state: DiscoveryState::Idle,
            sequence: 0,
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    /// Runs all phases and returns the sealed registry.
    pub async fn run(&mut self) -> Result<DiscoveryReport, ConnectError> {
        match self.run_phases().await {
            Ok(registry) => {
                self.state = DiscoveryState::Finalized;
                log::info!(
                    "Discovery finished: {} module(s), {} degraded",
                    registry.all().len(),
                    registry.degraded().len()
                );
                Ok(DiscoveryReport { registry })
            }
            Err(e) => {
                log::error!("Discovery failed in state {:?}: {}", self.state, e);
                self.state = DiscoveryState::Failed;
                Err(e)
            }
        }
    }

    async fn run_phases(&mut self) -> Result<Registry, ConnectError> {
        let mut registry = Registry::new();

        self.state = DiscoveryState::Probing;
        let probe = self.probe().await?;
        if probe.is_empty() {
            log::info!("No module answered the probe, topology is empty");
            registry.finalize();
            return Ok(registry);
        }

        self.state = DiscoveryState::Enumerating;
        let plan = self.config.enumeration.plan(&probe, self.config.host_address);
        log::debug!("Enumerating {} address(es): {:?}", plan.len(), plan);
        for address in plan {
            self.enumerate_module(address, &mut registry).await?;
        }
        registry.finalize();
        Ok(registry)
    }

    async fn probe(&mut self) -> Result<ProbeResult, ConnectError> {
        let sequence = self.next_sequence();
        let probe = Packet::new(ModuleAddress::BROADCAST, PacketClass::Discovery, Vec::new())
            .with_flags(Flags::BROADCAST)
            .with_sequence(sequence);
        self.send(&probe).await?;

        let mut result = ProbeResult::default();
        let deadline = Instant::now() + self.config.discovery_timeout;
        while let Some(packet) = self.receive_until(deadline).await? {
            if packet.class != PacketClass::Discovery || packet.sequence != sequence {
                log::debug!("Ignoring {} packet from {} while probing", packet.class, packet.address);
                continue;
            }
            let reply = ProbeReply::from_payload(&packet.payload);
            log::debug!("Module {} answered the probe ({:?})", packet.address, reply);
            result.insert(packet.address, reply)?;
        }
        Ok(result)
    }

    async fn enumerate_module(
        &mut self,
        address: ModuleAddress,
        registry: &mut Registry,
    ) -> Result<(), ConnectError> {
        let attempts = self.config.retry_count + 1;
        for attempt in 1..=attempts {
            let sequence = self.next_sequence();
            let request = Packet::new(address, PacketClass::Discovery, Vec::new())
                .with_sequence(sequence);
            self.send(&request).await?;

            let deadline = Instant::now() + self.config.timeout;
            while let Some(packet) = self.receive_until(deadline).await? {
                if packet.class != PacketClass::Discovery
                    || packet.sequence != sequence
                    || !packet.is_reply()
                {
                    log::debug!("Ignoring stray {} packet from {}", packet.class, packet.address);
                    continue;
                }
                if packet.is_error() {
                    log::warn!("Module {} refused to describe itself", address);
                    return registry.record_degraded(DegradedModule {
                        address,
                        attempts: attempt,
                        reason: DegradeReason::ErrorReply,
                    });
                }
                if packet.address != address {
                    log::warn!(
                        "Module {} answered a describe request sent to {}",
                        packet.address,
                        address
                    );
                }
                return match ModuleDescriptor::from_payload(packet.address, &packet.payload) {
                    Ok(descriptor) => registry.register(descriptor),
                    Err(e) => {
                        log::warn!("Module {} sent an invalid descriptor: {}", address, e);
                        registry.record_degraded(DegradedModule {
                            address,
                            attempts: attempt,
                            reason: DegradeReason::InvalidDescriptor(e),
                        })
                    }
                };
            }
            log::debug!(
                "Module {} did not answer describe request (attempt {}/{})",
                address,
                attempt,
                attempts
            );
        }
        log::warn!("Module {} did not respond, marking it degraded", address);
        registry.record_degraded(DegradedModule {
            address,
            attempts,
            reason: DegradeReason::NoResponse,
        })
    }

    async fn send(&self, packet: &Packet) -> Result<(), ConnectError> {
        let bytes = packet.encode(self.link.mtu())?;
        log::trace!("Sending discovery packet: {:02x?}", &bytes[..]);
        self.link.send(Bytes::from(bytes)).await?;
        Ok(())
    }

    /// Receives the next well-formed packet before `deadline`.
    /// Returns `None` once the deadline passed.
    async fn receive_until(&mut self, deadline: Instant) -> Result<Option<Packet>, ConnectError> {
        loop {
            let frame = match tokio::time::timeout_at(deadline, self.link.receive()).await {
                Err(_elapsed) => return Ok(None),
                Ok(None) => return Err(TransportError::Closed.into()),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(frame))) => frame,
            };
            match Packet::decode_exact(&frame, self.link.mtu()) {
                Ok(packet) => return Ok(Some(packet)),
                Err(e) => log::warn!("Dropping packet during discovery: {}", e),
            }
        }
    }

    fn next_sequence(&mut self) -> u16 {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        sequence
    }
}
