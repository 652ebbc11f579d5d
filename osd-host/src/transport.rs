//! # Transport Adapters
//!
//! Every transport is turned into a [`Link`]: a sender half accepting encoded packets and a
//! receiver half yielding them as a lazy sequence. Discovery and routing are written against
//! [`Link`] only, so the variants below are interchangeable:
//!
//! - [`Link::tcp`]: reliable byte stream, each packet framed with a `u16` length prefix
//! - [`Link::udp`]: unreliable datagrams, one packet per datagram
//! - [`Link::scan_chain`]: blocking [`ScanChain`] backend, strictly one operation in flight
//! - [`Link::pair`]: in-memory duplex for in-process targets and tests
use std::{io, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use osd_protocol::codec::{FRAME_PREFIX_LEN, HEADER_LEN};
use tokio::{
    net::{TcpStream, UdpSocket},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::{config::TransportConfig, error::TransportError};

const CHANNEL_DEPTH: usize = 64;
const SCAN_CHAIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// The kind of channel underneath a [`Link`]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransportKind {
    Stream,
    Datagram,
    ScanChain,
    Memory,
}

/// Blocking backend of a scan chain, e.g. a JTAG adapter.
///
/// The backend is only ever driven by one operation at a time.
pub trait ScanChain: Send + 'static {
    /// Shifts one encoded packet into the chain and returns the packets shifted out in exchange.
    fn exchange(&mut self, request: &[u8]) -> io::Result<Vec<Vec<u8>>>;

    /// Shifts the chain without a request to collect packets the target emitted on its own.
    fn poll(&mut self) -> io::Result<Vec<Vec<u8>>>;
}

/// Sending half of a [`Link`]. Cheap to clone.
#[derive(Clone, Debug)]
pub struct LinkSender {
    tx: mpsc::Sender<Bytes>,
}

impl LinkSender {
    pub async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        self.tx.send(frame).await.map_err(|_| TransportError::Closed)
    }
}

/// Receiving half of a [`Link`]
#[derive(Debug)]
pub struct LinkReceiver {
    rx: mpsc::Receiver<Result<Bytes, TransportError>>,
}

impl LinkReceiver {
    /// Waits for the next frame. `None` means the transport was closed.
    pub async fn receive(&mut self) -> Option<Result<Bytes, TransportError>> {
        self.rx.recv().await
    }
}

/// Owns the background tasks of a transport. Closing or dropping it shuts the transport down.
#[derive(Debug, Default)]
pub struct LinkGuard {
    tasks: Vec<JoinHandle<()>>,
}

impl LinkGuard {
    pub fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for LinkGuard {
    fn drop(&mut self) {
        self.close();
    }
}

/// A connected transport
#[derive(Debug)]
pub struct Link {
    kind: TransportKind,
    mtu: usize,
    sender: LinkSender,
    receiver: LinkReceiver,
    guard: LinkGuard,
}

impl Link {
    /// Opens the transport described by `config`.
    pub async fn open(config: &TransportConfig, mtu: usize) -> Result<Link, TransportError> {
        match config {
            TransportConfig::Tcp { addr } => Link::tcp(addr, mtu).await,
            TransportConfig::Udp { bind, remote } => Link::udp(bind, remote, mtu).await,
            TransportConfig::ScanChain(backend) => {
                let backend = backend
                    .lock()
                    .map_err(|_| TransportError::Closed)?
                    .take()
                    .ok_or(TransportError::Closed)?;
                Ok(Link::scan_chain(backend, mtu))
            }
        }
    }

    pub async fn tcp(addr: &str, mtu: usize) -> Result<Link, TransportError> {
        log::debug!("Connecting to {} via TCP", addr);
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        log::info!("Connected to {}", addr);
        Ok(Link::from_stream(stream, mtu))
    }

    /// Wraps an established byte stream. Packets are framed with a little endian `u16` length.
    ///
    /// Any frame the prefix can describe is passed on, including packets above the MTU. Those
    /// are dropped by the router like every other malformed packet; only a broken stream ends
    /// the link.
    pub fn from_stream(stream: TcpStream, mtu: usize) -> Link {
        let (read_half, write_half) = stream.into_split();
        let mut frames_in = FramedRead::new(read_half, frame_codec());
        let mut frames_out = FramedWrite::new(write_half, frame_codec());
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_DEPTH);

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = frames_out.send(frame).await {
                    log::error!("Failed to write frame: {}", e);
                    break;
                }
            }
            log::debug!("Stream writer finished");
        });
        let reader = tokio::spawn(async move {
            while let Some(frame) = frames_in.next().await {
                let item = frame.map(|b| b.freeze()).map_err(TransportError::from);
                let failed = item.is_err();
                if in_tx.send(item).await.is_err() || failed {
                    break;
                }
            }
            log::debug!("Stream reader finished");
        });

        Link::assemble(TransportKind::Stream, mtu, out_tx, in_rx, vec![writer, reader])
    }

    pub async fn udp(bind: &str, remote: &str, mtu: usize) -> Result<Link, TransportError> {
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(remote).await?;
        log::info!(
            "Exchanging datagrams between {} and {}",
            socket.local_addr()?,
            remote
        );
        let socket = Arc::new(socket);
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_DEPTH);

        let send_socket = socket.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = send_socket.send(&frame).await {
                    log::error!("Failed to send datagram: {}", e);
                    break;
                }
            }
        });
        let reader = tokio::spawn(async move {
            // one spare byte detects datagrams that exceed the limit
            let mut buf = vec![0u8; HEADER_LEN + mtu + 1];
            loop {
                let item = match socket.recv(&mut buf).await {
                    Ok(len) => Ok(Bytes::copy_from_slice(&buf[..len])),
                    Err(e) => Err(TransportError::from(e)),
                };
                let failed = item.is_err();
                if in_tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(Link::assemble(
            TransportKind::Datagram,
            mtu,
            out_tx,
            in_rx,
            vec![writer, reader],
        ))
    }

    /// Drives a blocking scan chain backend. Outgoing packets are exchanged one at a time,
    /// between exchanges the chain is polled for packets the target emitted on its own.
    pub fn scan_chain(backend: Box<dyn ScanChain>, mtu: usize) -> Link {
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_DEPTH);

        let driver = tokio::spawn(async move {
            let mut backend = Some(backend);
            let mut poll = tokio::time::interval(SCAN_CHAIN_POLL_INTERVAL);
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                let request = tokio::select! {
                    frame = out_rx.recv() => Some(frame),
                    _ = poll.tick() => None,
                };
                let request = match request {
                    Some(Some(frame)) => Some(frame),
                    Some(None) => break,
                    None => None,
                };
                let Some(mut chain) = backend.take() else {
                    break;
                };
                let joined = tokio::task::spawn_blocking(move || {
                    let result = match &request {
                        Some(frame) => chain.exchange(frame),
                        None => chain.poll(),
                    };
                    (chain, result)
                })
                .await;
                let (chain, result) = match joined {
                    Ok(done) => done,
                    Err(e) => {
                        log::error!("Scan chain operation panicked: {}", e);
                        let _ = in_tx.send(Err(TransportError::Closed)).await;
                        break;
                    }
                };
                backend = Some(chain);
                match result {
                    Ok(replies) => {
                        for reply in replies {
                            if in_tx.send(Ok(Bytes::from(reply))).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        log::error!("Scan chain operation failed: {}", e);
                        let _ = in_tx.send(Err(TransportError::Io(e))).await;
                        break;
                    }
                }
            }
            log::debug!("Scan chain driver finished");
        });

        Link::assemble(TransportKind::ScanChain, mtu, out_tx, in_rx, vec![driver])
    }

    /// Creates two connected in-memory links. What is sent on one is received on the other.
    pub fn pair(mtu: usize) -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
        let (b_tx, b_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
        let (a_in_tx, a_in_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (b_in_tx, b_in_rx) = mpsc::channel(CHANNEL_DEPTH);
        let forward_a = tokio::spawn(forward(a_rx, b_in_tx));
        let forward_b = tokio::spawn(forward(b_rx, a_in_tx));
        (
            Link::assemble(TransportKind::Memory, mtu, a_tx, a_in_rx, vec![forward_a]),
            Link::assemble(TransportKind::Memory, mtu, b_tx, b_in_rx, vec![forward_b]),
        )
    }

    fn assemble(
        kind: TransportKind,
        mtu: usize,
        tx: mpsc::Sender<Bytes>,
        rx: mpsc::Receiver<Result<Bytes, TransportError>>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Link {
        Link {
            kind,
            mtu,
            sender: LinkSender { tx },
            receiver: LinkReceiver { rx },
            guard: LinkGuard { tasks },
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        self.sender.send(frame).await
    }

    pub async fn receive(&mut self) -> Option<Result<Bytes, TransportError>> {
        self.receiver.receive().await
    }

    /// Shuts the transport down. Pending receives return `None` afterwards.
    pub fn close(&mut self) {
        self.guard.close();
    }

    pub fn into_parts(self) -> (LinkSender, LinkReceiver, LinkGuard) {
        (self.sender, self.receiver, self.guard)
    }
}

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(FRAME_PREFIX_LEN)
        .little_endian()
        .max_frame_length(u16::MAX as usize)
        .new_codec()
}

async fn forward(mut from: mpsc::Receiver<Bytes>, to: mpsc::Sender<Result<Bytes, TransportError>>) {
    while let Some(frame) = from.recv().await {
        if to.send(Ok(frame)).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn pair_is_duplex() {
        let (mut a, mut b) = Link::pair(64);
        a.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(b.receive().await.unwrap().unwrap(), Bytes::from_static(b"ping"));
        b.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(a.receive().await.unwrap().unwrap(), Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn closed_pair_ends_receiver() {
        let (mut a, mut b) = Link::pair(64);
        a.close();
        drop(a);
        assert!(b.receive().await.is_none());
    }

    #[tokio::test]
    async fn tcp_frames_survive_partial_reads() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // two frames, written in awkward pieces
            let data = [3u8, 0, b'a', b'b', b'c', 1, 0, b'z'];
            for chunk in data.chunks(3) {
                socket.write_all(chunk).await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        let mut link = Link::tcp(&addr.to_string(), 64).await.unwrap();
        assert_eq!(link.kind(), TransportKind::Stream);
        assert_eq!(&link.receive().await.unwrap().unwrap()[..], b"abc");
        assert_eq!(&link.receive().await.unwrap().unwrap()[..], b"z");
    }

    #[tokio::test]
    async fn tcp_passes_frames_above_the_mtu() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut data = vec![100u8, 0];
            data.extend([0xAB; 100]);
            data.extend([1, 0, b'z']);
            socket.write_all(&data).await.unwrap();
            socket.flush().await.unwrap();
        });
        let mut link = Link::tcp(&addr.to_string(), 16).await.unwrap();
        assert_eq!(link.receive().await.unwrap().unwrap().len(), 100);
        assert_eq!(&link.receive().await.unwrap().unwrap()[..], b"z");
    }

    struct Echo {
        polls: usize,
    }

    impl ScanChain for Echo {
        fn exchange(&mut self, request: &[u8]) -> io::Result<Vec<Vec<u8>>> {
            Ok(vec![request.to_vec()])
        }

        fn poll(&mut self) -> io::Result<Vec<Vec<u8>>> {
            self.polls += 1;
            if self.polls == 1 {
                Ok(vec![b"event".to_vec()])
            } else {
                Ok(Vec::new())
            }
        }
    }

    #[tokio::test]
    async fn scan_chain_exchanges_and_polls() {
        let mut link = Link::scan_chain(Box::new(Echo { polls: 0 }), 64);
        let mut seen = Vec::new();
        link.send(Bytes::from_static(b"req")).await.unwrap();
        for _ in 0..2 {
            seen.push(link.receive().await.unwrap().unwrap());
        }
        seen.sort();
        assert_eq!(
            seen,
            vec![Bytes::from_static(b"event"), Bytes::from_static(b"req")]
        );
    }
}
