//! Helpers shared by the integration tests: a demo target with handles into its modules, and
//! a scripted peer for tests that need full control over the wire.
use std::{
    net::SocketAddr,
    sync::{Arc, Once},
    time::Duration,
};

use bytes::Bytes;
use osd_host::{Builder, Config, Link};
use osd_protocol::{
    Flags, ModuleAddress, Packet, PacketClass,
    module::ModuleDescriptor,
    payload::{CtmEvent, ProbeReply, StmEvent},
};
use osd_target::{
    Target,
    modules::{Ctm, EventQueue, Mam, ResetCounters, Scm, Stm},
    server::{self, Server},
};
use tokio::net::{TcpListener, UdpSocket};

pub const MTU: usize = 256;
pub const MAM: ModuleAddress = ModuleAddress::new(0, 2);
pub const STM: ModuleAddress = ModuleAddress::new(0, 3);
pub const CTM: ModuleAddress = ModuleAddress::new(0, 4);
pub const MEMORY_SIZE: usize = 4096;

static LOGGER: Once = Once::new();

/// Routes log output of the crates under test through the test harness.
pub fn init_logging() {
    LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// A target with SCM, MAM, STM and CTM plus handles to drive it
pub struct Demo {
    pub server: Server,
    pub resets: Arc<ResetCounters>,
    pub stm_events: EventQueue<StmEvent>,
    pub ctm_events: EventQueue<CtmEvent>,
}

impl Demo {
    pub fn new() -> Demo {
        Demo::with(|_| ())
    }

    /// Builds the demo target and lets `tweak` modify it before it is served.
    pub fn with(tweak: impl FnOnce(&mut Target)) -> Demo {
        init_logging();
        let scm = Scm::new(ModuleAddress::SCM, 0x1, 0x2);
        let stm = Stm::new(STM, 64);
        let ctm = Ctm::new(CTM);
        let resets = scm.resets();
        let (stm_events, ctm_events) = (stm.queue(), ctm.queue());

        let mut target = Target::new().with_max_packet_len(MTU as u16);
        target.add(scm).unwrap();
        target.add(Mam::new(MAM, 0, MEMORY_SIZE)).unwrap();
        target.add(stm).unwrap();
        target.add(ctm).unwrap();
        tweak(&mut target);

        let server = server::Builder::new()
            .mtu(MTU)
            .event_poll_interval(Duration::from_millis(2))
            .build(target);
        Demo {
            server,
            resets,
            stm_events,
            ctm_events,
        }
    }

    pub async fn spawn_tcp(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = self.server.clone();
        tokio::spawn(async move { server.serve_tcp(listener).await });
        addr
    }

    pub async fn spawn_udp(&self) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let server = self.server.clone();
        tokio::spawn(async move { server.serve_udp(socket).await });
        addr
    }

    /// Serves the target on an in-memory link and returns the host end.
    pub fn link(&self) -> Link {
        let (host, target) = Link::pair(MTU);
        self.server.serve_link(target);
        host
    }
}

impl Default for Demo {
    fn default() -> Self {
        Demo::new()
    }
}

/// Session settings with short timeouts
pub fn builder() -> Builder {
    Builder::new()
        .mtu(MTU)
        .timeout(Duration::from_millis(300))
        .discovery_timeout(Duration::from_millis(100))
        .retry_count(1)
}

pub fn config() -> Config {
    builder().build()
}

/// The far end of a link, scripted by the test
pub struct Peer {
    link: Link,
}

impl Peer {
    pub fn new(link: Link) -> Peer {
        Peer { link }
    }

    /// Creates a connected host link and peer.
    pub fn pair() -> (Link, Peer) {
        init_logging();
        let (host, peer) = Link::pair(MTU);
        (host, Peer::new(peer))
    }

    pub async fn next_packet(&mut self) -> Packet {
        let frame = self.link.receive().await.unwrap().unwrap();
        Packet::decode_exact(&frame, MTU).unwrap()
    }

    pub async fn send(&self, packet: &Packet) {
        self.send_raw(packet.encode(MTU).unwrap()).await;
    }

    pub async fn send_raw(&self, frame: Vec<u8>) {
        self.link.send(Bytes::from(frame)).await.unwrap();
    }

    /// Answers the probe and the describe requests for `modules`.
    pub async fn answer_discovery(&mut self, modules: &[ModuleDescriptor]) {
        let probe = self.next_packet().await;
        assert!(probe.flags.contains(Flags::BROADCAST));
        for module in modules {
            let reply = Packet::new(
                module.address(),
                PacketClass::Discovery,
                ProbeReply::default().to_payload(),
            )
            .with_flags(Flags::REPLY)
            .with_sequence(probe.sequence);
            self.send(&reply).await;
        }
        for _ in modules {
            let describe = self.next_packet().await;
            let module = modules
                .iter()
                .find(|m| m.address() == describe.address)
                .unwrap();
            self.send(&describe.reply(module.to_payload())).await;
        }
    }

    pub fn close(mut self) {
        self.link.close();
    }
}
