use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use osd_host::transport::{Link, ScanChain};
use osd_protocol::{
    Packet,
    codec::{HEADER_LEN, PacketCodec},
    error::EncodeError,
};
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs, UdpSocket},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::codec::Framed;

use crate::Target;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Largest payload the target accepts and emits
    pub mtu: usize,
    /// A client that neither sends nor receives anything for this long is disconnected
    pub read_write_timeout: Duration,
    /// How often the modules are asked for new events
    pub event_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mtu: 1024,
            read_write_timeout: Duration::from_secs(30),
            event_poll_interval: Duration::from_millis(10),
        }
    }
}

/// Builder to create a [Server] instance and modify configuration options
///
/// # Example
///
/// ```ignore
/// use osd_target::server::Builder;
/// use std::time::Duration;
///
/// let server = Builder::new()
///     .mtu(256)
///     .rw_timeout(Duration::from_secs(20))
///     .build(target);
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Set the largest payload exchanged in one packet
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    /// Set the TCP read and write timeout
    pub fn rw_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_write_timeout = timeout;
        self
    }

    pub fn event_poll_interval(mut self, interval: Duration) -> Self {
        self.config.event_poll_interval = interval;
        self
    }

    /// Build and return the server
    pub fn build(self, target: Target) -> Server {
        Server::new(target, self.config)
    }
}

/// Exposes a [`Target`] to hosts. All transports of one server share the same target.
#[derive(Clone)]
pub struct Server {
    target: Arc<Mutex<Target>>,
    config: Config,
}

impl Server {
    pub fn new(target: Target, config: Config) -> Server {
        Server {
            target: Arc::new(Mutex::new(target)),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared handle to the target, e.g. to inspect it while it is served
    pub fn target(&self) -> Arc<Mutex<Target>> {
        self.target.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Target> {
        self.target.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn event_ticker(&self) -> tokio::time::Interval {
        let mut ticker = tokio::time::interval(self.config.event_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    pub async fn listen(&self, addr: impl ToSocketAddrs) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_tcp(listener).await
    }

    /// Accepts clients on `listener`. Every client is served by its own task.
    pub async fn serve_tcp(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Server listening for connections on {}", listener.local_addr()?);
        loop {
            match listener.accept().await {
                Ok((tcp, addr)) => {
                    log::info!("New client connection from {}", addr);
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_client(tcp).await {
                            log::error!("Client error: {}", e);
                        }
                        log::info!("Client {} disconnected", addr);
                    });
                }
                Err(e) => log::error!("Connection error: {}", e),
            }
        }
    }

    async fn handle_client(&self, tcp: TcpStream) -> Result<(), ServerError> {
        tcp.set_nodelay(true)?;
        let mut framed = Framed::new(tcp, PacketCodec::new(self.config.mtu));
        let mut events = self.event_ticker();
        let mut deadline = Instant::now() + self.config.read_write_timeout;

        loop {
            let outgoing = tokio::select! {
                frame = framed.next() => match frame {
                    None => break,
                    Some(Err(e))
                        if e.kind() == ErrorKind::ConnectionAborted
                            || e.kind() == ErrorKind::ConnectionReset =>
                    {
                        break;
                    } // Client disconnected
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(Err(e))) => {
                        log::warn!("Dropping malformed packet: {}", e);
                        continue;
                    }
                    Some(Ok(Ok(packet))) => {
                        log::trace!("Received {:?}", packet);
                        self.lock().handle(packet)
                    }
                },
                _ = events.tick() => self.lock().poll_events(),
                _ = tokio::time::sleep_until(deadline) => {
                    log::error!("Client timeout, closing connection");
                    break;
                }
            };
            if outgoing.is_empty() {
                continue;
            }
            for packet in outgoing {
                tokio::time::timeout(self.config.read_write_timeout, framed.send(packet))
                    .await
                    .map_err(|_| io::Error::from(ErrorKind::TimedOut))??;
            }
            deadline = Instant::now() + self.config.read_write_timeout;
        }
        Ok(())
    }

    /// Answers datagrams on `socket`. Events go to the peer that sent the latest packet.
    pub async fn serve_udp(&self, socket: UdpSocket) -> Result<(), ServerError> {
        log::info!("Server answering datagrams on {}", socket.local_addr()?);
        let mut buf = vec![0u8; HEADER_LEN + self.config.mtu + 1];
        let mut events = self.event_ticker();
        let mut peer: Option<SocketAddr> = None;
        loop {
            let (outgoing, to) = tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    let (len, from) = received?;
                    peer = Some(from);
                    match Packet::decode_exact(&buf[..len], self.config.mtu) {
                        Ok(packet) => (self.lock().handle(packet), from),
                        Err(e) => {
                            log::warn!("Dropping malformed datagram from {}: {}", from, e);
                            continue;
                        }
                    }
                }
                _ = events.tick() => match peer {
                    Some(peer) => (self.lock().poll_events(), peer),
                    None => continue,
                },
            };
            for packet in outgoing {
                socket.send_to(&packet.encode(self.config.mtu)?, to).await?;
            }
        }
    }

    /// Serves the target on an in-memory link until the link is closed.
    pub fn serve_link(&self, mut link: Link) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            let mut events = server.event_ticker();
            loop {
                let outgoing = tokio::select! {
                    frame = link.receive() => match frame {
                        Some(Ok(frame)) => match Packet::decode_exact(&frame, server.config.mtu) {
                            Ok(packet) => server.lock().handle(packet),
                            Err(e) => {
                                log::warn!("Dropping malformed packet: {}", e);
                                continue;
                            }
                        },
                        _ => break,
                    },
                    _ = events.tick() => server.lock().poll_events(),
                };
                for packet in outgoing {
                    let sent = match packet.encode(server.config.mtu) {
                        Ok(bytes) => link.send(Bytes::from(bytes)).await.is_ok(),
                        Err(e) => {
                            log::error!("Failed to encode packet: {}", e);
                            true
                        }
                    };
                    if !sent {
                        return;
                    }
                }
            }
            log::debug!("Link closed");
        })
    }

    /// A scan chain backend that shifts packets straight into this target
    pub fn scan_chain(&self) -> TargetChain {
        TargetChain {
            server: self.clone(),
        }
    }
}

/// Simulated scan chain in front of a [`Target`]
pub struct TargetChain {
    server: Server,
}

impl TargetChain {
    fn encode_all(&self, packets: Vec<Packet>) -> io::Result<Vec<Vec<u8>>> {
        packets
            .iter()
            .map(|p| p.encode(self.server.config.mtu).map_err(io::Error::other))
            .collect()
    }
}

impl ScanChain for TargetChain {
    fn exchange(&mut self, request: &[u8]) -> io::Result<Vec<Vec<u8>>> {
        let replies = match Packet::decode_exact(request, self.server.config.mtu) {
            Ok(packet) => self.server.lock().handle(packet),
            Err(e) => {
                log::warn!("Dropping malformed packet shifted into the chain: {}", e);
                Vec::new()
            }
        };
        self.encode_all(replies)
    }

    fn poll(&mut self) -> io::Result<Vec<Vec<u8>>> {
        let events = self.server.lock().poll_events();
        self.encode_all(events)
    }
}

#[cfg(test)]
mod test {
    use osd_protocol::{
        ModuleAddress, PacketClass,
        payload::{MemoryRequest, RegisterRequest, RegisterWidth},
    };

    use super::*;
    use crate::modules::{Mam, Scm};

    const MAM: ModuleAddress = ModuleAddress::new(0, 2);

    fn server() -> Server {
        let mut target = Target::new();
        target.add(Scm::new(ModuleAddress::SCM, 1, 2)).unwrap();
        target.add(Mam::new(MAM, 0, 32)).unwrap();
        Builder::new().mtu(64).build(target)
    }

    #[tokio::test]
    async fn tcp_client_gets_replies() {
        let server = server();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = server.clone();
        tokio::spawn(async move { serving.serve_tcp(listener).await });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, PacketCodec::new(64));
        let read = RegisterRequest::Read {
            register: osd_protocol::module::reg::SCM_SYSTEM_DEVICE_ID,
            width: RegisterWidth::W16,
        };
        framed
            .send(Packet::new(ModuleAddress::SCM, PacketClass::Control, read.to_payload()).with_sequence(9))
            .await
            .unwrap();
        let reply = framed.next().await.unwrap().unwrap().unwrap();
        assert!(reply.is_reply());
        assert_eq!(reply.sequence, 9);
        assert_eq!(reply.payload, vec![2, 0]);
    }

    #[tokio::test]
    async fn udp_datagrams_are_answered() {
        let server = server();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move { server.serve_udp(socket).await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(addr).await.unwrap();
        let write = MemoryRequest::Write {
            address: 4,
            data: vec![1, 2],
        };
        let request = Packet::new(MAM, PacketClass::DataRequest, write.to_payload());
        client.send(&request.encode(64).unwrap()).await.unwrap();
        let mut buf = [0u8; 128];
        let len = client.recv(&mut buf).await.unwrap();
        let reply = Packet::decode_exact(&buf[..len], 64).unwrap();
        assert_eq!(reply.class, PacketClass::DataResponse);
        assert!(!reply.is_error());
    }

    #[tokio::test]
    async fn scan_chain_shifts_into_target() {
        let mut chain = server().scan_chain();
        let request = Packet::new(MAM, PacketClass::Discovery, Vec::new());
        let replies = chain.exchange(&request.encode(64).unwrap()).unwrap();
        assert_eq!(replies.len(), 1);
        assert!(chain.exchange(&[1, 2, 3]).unwrap().is_empty());
        assert!(chain.poll().unwrap().is_empty());
    }
}
