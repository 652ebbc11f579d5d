//! # Session Router
//!
//! Routes requests to modules and answers back to the waiting drivers.
//!
//! Every registered module gets a *lane*. A lane owns the outbound sequence counter of its
//! module, a fixed set of slots for pending requests and the subscribers of its events. Lanes
//! are created once the registry is sealed and are never added or removed afterwards, so
//! finding a lane needs no lock. Each lane is locked on its own; a slow module never holds up
//! traffic to the others.
//!
//! ## Ordering
//!
//! Answers of one module are handed out in the order the requests were issued. An answer that
//! overtakes an earlier one is parked in its slot until the earlier answer arrives, or until
//! the earlier request times out. In the latter case the parked answer is delivered with a
//! [`SequenceGap`] warning. Deadlines start when a request is issued, independent of when its
//! issuer starts waiting.
//!
//! ## Backpressure
//!
//! A lane admits at most `max_pending_per_module` outstanding requests. Issuing another one
//! waits until a slot is free.
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use osd_protocol::{
    ModuleAddress, Packet, PacketClass, error::EncodeError, module::ModuleDescriptor,
};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, broadcast, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    error::{NotFound, RequestError, SequenceGap},
    registry::Registry,
    transport::{LinkReceiver, LinkSender},
};

/// An answer delivered to a driver
#[derive(Debug, Clone)]
pub struct Response {
    pub packet: Packet,
    /// Set when earlier answers of the same module were skipped
    pub gap: Option<SequenceGap>,
}

/// Router settings derived from the session [`Config`]
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub timeout: Duration,
    pub max_pending_per_module: usize,
    pub mtu: usize,
    pub event_capacity: usize,
    pub host_address: ModuleAddress,
}

impl From<&Config> for RouterConfig {
    fn from(config: &Config) -> Self {
        RouterConfig {
            timeout: config.timeout,
            max_pending_per_module: config.max_pending_per_module,
            mtu: config.mtu,
            event_capacity: config.event_capacity,
            host_address: config.host_address,
        }
    }
}

type Completion = oneshot::Sender<Result<Response, RequestError>>;
type Answer = oneshot::Receiver<Result<Response, RequestError>>;

struct Slot {
    sequence: u16,
    expected: PacketClass,
    deadline: Instant,
    completion: Completion,
    /// Answer that arrived before an earlier one
    parked: Option<Packet>,
}

struct LaneState {
    next_sequence: u16,
    /// Fixed number of slots, one per admitted request
    slots: Vec<Option<Slot>>,
    /// Sequences of outstanding requests in issue order
    order: VecDeque<u16>,
    /// Requests timed out while later ones were outstanding
    gap: Option<SequenceGap>,
    closed: bool,
}

impl LaneState {
    fn slot_index(&self, sequence: u16) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.sequence == sequence))
    }

    fn take_slot(&mut self, sequence: u16) -> Option<Slot> {
        let index = self.slot_index(sequence)?;
        self.order.retain(|s| *s != sequence);
        self.slots[index].take()
    }
}

struct Lane {
    address: ModuleAddress,
    timeout: Duration,
    state: Mutex<LaneState>,
    permits: Arc<Semaphore>,
    events: broadcast::Sender<Packet>,
}

impl Lane {
    fn new(address: ModuleAddress, config: &RouterConfig) -> Lane {
        let (events, _) = broadcast::channel(config.event_capacity);
        Lane {
            address,
            timeout: config.timeout,
            state: Mutex::new(LaneState {
                next_sequence: 0,
                slots: (0..config.max_pending_per_module).map(|_| None).collect(),
                order: VecDeque::with_capacity(config.max_pending_per_module),
                gap: None,
                closed: false,
            }),
            permits: Arc::new(Semaphore::new(config.max_pending_per_module)),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LaneState> {
        // A poisoned lane still holds consistent slots, every critical section is panic free
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserves a sequence and, if an answer is expected, a slot with its deadline.
    fn admit(
        &self,
        expected: Option<PacketClass>,
    ) -> Result<(u16, Option<(Answer, Instant)>), RequestError> {
        let mut state = self.lock();
        if state.closed {
            return Err(RequestError::Disconnected);
        }
        let sequence = state.next_sequence;
        state.next_sequence = state.next_sequence.wrapping_add(1);
        let Some(expected) = expected else {
            return Ok((sequence, None));
        };
        // Holding a permit guarantees a free slot
        let Some(index) = state.slots.iter().position(Option::is_none) else {
            return Err(RequestError::Disconnected);
        };
        let (completion, rx) = oneshot::channel();
        let deadline = Instant::now() + self.timeout;
        state.slots[index] = Some(Slot {
            sequence,
            expected,
            deadline,
            completion,
            parked: None,
        });
        state.order.push_back(sequence);
        Ok((sequence, Some((rx, deadline))))
    }

    /// Offers an inbound packet to the pending requests.
    /// Returns the packet back if no request was waiting for it.
    fn deliver(&self, packet: Packet) -> Option<Packet> {
        let mut state = self.lock();
        // requests past their deadline no longer accept answers
        Self::settle(self.address, &mut state, Instant::now());
        let matching = state.slot_index(packet.sequence).filter(|&i| {
            state.slots[i]
                .as_ref()
                .is_some_and(|s| s.expected == packet.class && s.parked.is_none())
        });
        match matching {
            Some(index) => {
                if let Some(slot) = state.slots[index].as_mut() {
                    slot.parked = Some(packet);
                }
                Self::settle(self.address, &mut state, Instant::now());
                None
            }
            None => Some(packet),
        }
    }

    /// Resolves requests from the front of the issue order: parked answers are handed out,
    /// requests whose deadline is not after `now` time out. Stops at the first request that
    /// is still live, so no answer ever overtakes an earlier request.
    fn settle(address: ModuleAddress, state: &mut LaneState, now: Instant) {
        while let Some(&front) = state.order.front() {
            let Some(index) = state.slot_index(front) else {
                state.order.pop_front();
                continue;
            };
            let Some(slot) = state.slots[index].as_ref() else {
                state.order.pop_front();
                continue;
            };
            if slot.parked.is_none() && slot.deadline > now {
                break;
            }
            state.order.pop_front();
            let Some(slot) = state.slots[index].take() else {
                continue;
            };
            match slot.parked {
                Some(packet) => {
                    let gap = state.gap.take();
                    if let Some(gap) = &gap {
                        log::warn!("{}", gap);
                    }
                    log::trace!("Delivering answer {} of module {}", packet.sequence, address);
                    // The requester may have gone away in the meantime; the answer is dropped then
                    let _ = slot.completion.send(Ok(Response { packet, gap }));
                }
                None => {
                    log::warn!("Request {} to module {} timed out", slot.sequence, address);
                    if !state.order.is_empty() {
                        state.gap = Some(match state.gap.take() {
                            Some(gap) => SequenceGap {
                                skipped: gap.skipped.saturating_add(1),
                                ..gap
                            },
                            None => SequenceGap {
                                address,
                                first_missing: slot.sequence,
                                skipped: 1,
                            },
                        });
                    }
                    let _ = slot.completion.send(Err(RequestError::Timeout {
                        address,
                        sequence: slot.sequence,
                    }));
                }
            }
        }
        if state.order.is_empty() {
            // nothing left that could overtake the skipped requests
            state.gap = None;
        }
    }

    /// Times out every request issued no later than the one expiring at `deadline`.
    fn expire(&self, deadline: Instant) {
        let mut state = self.lock();
        Self::settle(self.address, &mut state, deadline.max(Instant::now()));
    }

    /// Removes a request on behalf of its issuer.
    fn abandon(&self, sequence: u16) {
        let mut state = self.lock();
        if state.take_slot(sequence).is_some() {
            log::debug!("Request {} to module {} cancelled", sequence, self.address);
        }
        Self::settle(self.address, &mut state, Instant::now());
    }

    fn close(&self) -> usize {
        let slots: Vec<Slot> = {
            let mut state = self.lock();
            state.closed = true;
            state.order.clear();
            state.slots.iter_mut().filter_map(Option::take).collect()
        };
        self.permits.close();
        let count = slots.len();
        for slot in slots {
            let _ = slot.completion.send(Err(RequestError::Disconnected));
        }
        count
    }
}

/// A request that has been sent and awaits its answer.
///
/// Dropping it, or calling [`PendingRequest::cancel`], withdraws the request and frees its slot.
pub struct PendingRequest {
    lane: Arc<Lane>,
    sequence: u16,
    rx: Answer,
    deadline: Instant,
    resolved: bool,
    _permit: OwnedSemaphorePermit,
}

impl PendingRequest {
    /// Identifier of the request, unique among the outstanding requests of its module
    pub fn id(&self) -> u16 {
        self.sequence
    }

    pub fn address(&self) -> ModuleAddress {
        self.lane.address
    }

    /// Waits for the answer, at most until the request timeout counted from issuing it.
    pub async fn wait(mut self) -> Result<Response, RequestError> {
        if self.resolved {
            // already handed out by try_response
            return Err(RequestError::Disconnected);
        }
        let result = match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RequestError::Disconnected),
            Err(_elapsed) => {
                self.lane.expire(self.deadline);
                match self.rx.try_recv() {
                    Ok(result) => result,
                    Err(oneshot::error::TryRecvError::Closed) => Err(RequestError::Disconnected),
                    Err(oneshot::error::TryRecvError::Empty) => {
                        self.lane.abandon(self.sequence);
                        Err(RequestError::Timeout {
                            address: self.lane.address,
                            sequence: self.sequence,
                        })
                    }
                }
            }
        };
        self.resolved = true;
        result
    }

    /// Returns the answer if it was already delivered, without waiting.
    pub fn try_response(&mut self) -> Option<Result<Response, RequestError>> {
        match self.rx.try_recv() {
            Ok(result) => {
                self.resolved = true;
                Some(result)
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.resolved = true;
                Some(Err(RequestError::Disconnected))
            }
        }
    }

    /// Like [`PendingRequest::wait`], but gives up with [`RequestError::Cancelled`] once
    /// `cancel` fires. The request is withdrawn in that case.
    pub async fn wait_or_cancel(self, cancel: &CancellationToken) -> Result<Response, RequestError> {
        tokio::select! {
            result = self.wait() => result,
            _ = cancel.cancelled() => Err(RequestError::Cancelled),
        }
    }

    /// Withdraws the request. If the answer already arrived it is discarded.
    pub fn cancel(self) {
        drop(self)
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if !self.resolved {
            self.lane.abandon(self.sequence);
        }
    }
}

/// Dispatches packets between module drivers and the transport.
pub struct Router {
    lanes: HashMap<ModuleAddress, Arc<Lane>>,
    registry: Arc<Registry>,
    sender: LinkSender,
    config: RouterConfig,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Router {
    pub fn new(registry: Arc<Registry>, sender: LinkSender, config: RouterConfig) -> Router {
        let lanes = registry
            .all()
            .iter()
            .map(|desc| (desc.address(), Arc::new(Lane::new(desc.address(), &config))))
            .collect();
        Router {
            lanes,
            registry,
            sender,
            config,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Looks up the descriptor of a module
    pub fn descriptor(&self, address: ModuleAddress) -> Result<&ModuleDescriptor, NotFound> {
        self.registry.lookup(address)
    }

    /// Largest payload a single packet may carry
    pub fn mtu(&self) -> usize {
        self.config.mtu
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Cancelled when the session is torn down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn lane(&self, address: ModuleAddress) -> Result<&Arc<Lane>, NotFound> {
        self.lanes.get(&address).ok_or(NotFound(address))
    }

    /// Sends a request and registers it as pending. Waits while the module already has the
    /// maximum number of outstanding requests.
    pub async fn request(
        &self,
        address: ModuleAddress,
        class: PacketClass,
        payload: Vec<u8>,
    ) -> Result<PendingRequest, RequestError> {
        let lane = self.lane(address)?.clone();
        let expected = class.response_class().ok_or(RequestError::Unsupported {
            address,
            operation: "requests without an answer",
        })?;
        self.check_payload(&payload)?;

        let permit = lane
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RequestError::Disconnected)?;
        let (sequence, slot) = lane.admit(Some(expected))?;
        let Some((rx, deadline)) = slot else {
            return Err(RequestError::Disconnected);
        };
        let pending = PendingRequest {
            lane,
            sequence,
            rx,
            deadline,
            resolved: false,
            _permit: permit,
        };

        let packet = Packet::new(address, class, payload).with_sequence(sequence);
        log::debug!("Sending {} request {} to module {}", class, sequence, address);
        self.transmit(&packet).await?;
        Ok(pending)
    }

    /// Sends a request and waits for its answer.
    pub async fn call(
        &self,
        address: ModuleAddress,
        class: PacketClass,
        payload: Vec<u8>,
    ) -> Result<Response, RequestError> {
        self.request(address, class, payload).await?.wait().await
    }

    /// Sends a packet that is not answered.
    pub async fn post(
        &self,
        address: ModuleAddress,
        class: PacketClass,
        payload: Vec<u8>,
    ) -> Result<(), RequestError> {
        let lane = self.lane(address)?;
        self.check_payload(&payload)?;
        let (sequence, _) = lane.admit(None)?;
        self.transmit(&Packet::new(address, class, payload).with_sequence(sequence))
            .await
    }

    /// Subscribes to the packets a module sends without being asked.
    pub fn subscribe(&self, address: ModuleAddress) -> Result<broadcast::Receiver<Packet>, NotFound> {
        Ok(self.lane(address)?.events.subscribe())
    }

    fn check_payload(&self, payload: &[u8]) -> Result<(), RequestError> {
        if payload.len() > self.config.mtu {
            return Err(EncodeError::OversizedPayload {
                max: self.config.mtu,
                got: payload.len(),
            }
            .into());
        }
        Ok(())
    }

    async fn transmit(&self, packet: &Packet) -> Result<(), RequestError> {
        if self.is_closed() {
            return Err(RequestError::Disconnected);
        }
        let bytes = packet.encode(self.config.mtu)?;
        log::trace!("Outbound packet: {:02x?}", &bytes[..]);
        if let Err(e) = self.sender.send(Bytes::from(bytes)).await {
            log::error!("Transport failed while sending: {}", e);
            self.teardown();
            return Err(RequestError::Disconnected);
        }
        Ok(())
    }

    /// Handles one frame received from the transport. Malformed packets are dropped here.
    pub fn dispatch(&self, frame: &[u8]) {
        let packet = match Packet::decode_exact(frame, self.config.mtu) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("Dropping malformed packet ({} bytes): {}", frame.len(), e);
                log::trace!("Malformed packet: {:02x?}", frame);
                return;
            }
        };
        let Ok(lane) = self.lane(packet.address) else {
            log::warn!(
                "Dropping {} packet from unknown module {}",
                packet.class,
                packet.address
            );
            return;
        };
        let unmatched = if packet.is_reply() {
            lane.deliver(packet)
        } else {
            Some(packet)
        };
        if let Some(packet) = unmatched {
            if packet.class != PacketClass::Event {
                log::debug!(
                    "Unsolicited {} packet {} from module {}",
                    packet.class,
                    packet.sequence,
                    packet.address
                );
            }
            // No subscriber is not an error, events are simply not consumed then
            let _ = lane.events.send(packet);
        }
    }

    /// Resolves every pending request with [`RequestError::Disconnected`] and ends all event
    /// subscriptions. Further requests fail immediately.
    pub fn teardown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        let resolved: usize = self.lanes.values().map(|lane| lane.close()).sum();
        log::info!(
            "Session torn down, {} pending request(s) resolved as disconnected",
            resolved
        );
    }
}

/// Feeds frames from the transport into the router until the transport fails or the router
/// is torn down. A transport failure tears the router down.
pub async fn receive_loop(router: Arc<Router>, mut receiver: LinkReceiver) {
    let shutdown = router.shutdown_token();
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = receiver.receive() => frame,
        };
        match frame {
            Some(Ok(frame)) => router.dispatch(&frame),
            Some(Err(e)) => {
                log::error!("Transport failed: {}", e);
                router.teardown();
                break;
            }
            None => {
                log::info!("Transport closed");
                router.teardown();
                break;
            }
        }
    }
    log::debug!("Receive loop finished");
}

#[cfg(test)]
mod test {
    use osd_protocol::module::{ModuleDescriptor, ModuleType};

    use super::*;
    use crate::transport::{Link, LinkGuard};

    const MODULE: ModuleAddress = ModuleAddress::new(0, 2);

    struct Harness {
        router: Arc<Router>,
        target: Link,
        _host: (LinkReceiver, LinkGuard),
    }

    fn harness(config: RouterConfig) -> Harness {
        let mut registry = Registry::new();
        registry
            .register(ModuleDescriptor::standard(MODULE, ModuleType::Mam))
            .unwrap();
        registry.finalize();
        let (host, target) = Link::pair(config.mtu);
        let (sender, receiver, guard) = host.into_parts();
        Harness {
            router: Arc::new(Router::new(Arc::new(registry), sender, config)),
            target,
            _host: (receiver, guard),
        }
    }

    fn config() -> RouterConfig {
        RouterConfig {
            timeout: Duration::from_millis(200),
            max_pending_per_module: 4,
            mtu: 64,
            event_capacity: 8,
            host_address: ModuleAddress::HOST,
        }
    }

    async fn next_request(target: &mut Link) -> Packet {
        let frame = target.receive().await.unwrap().unwrap();
        Packet::decode_exact(&frame, 64).unwrap()
    }

    #[tokio::test]
    async fn answers_reach_their_request() {
        let Harness {
            router,
            mut target,
            _host,
        } = harness(config());
        let pending = router
            .request(MODULE, PacketClass::Control, vec![1, 2])
            .await
            .unwrap();
        let request = next_request(&mut target).await;
        assert_eq!(request.sequence, pending.id());
        router.dispatch(&request.reply(vec![9]).encode(64).unwrap());
        let response = pending.wait().await.unwrap();
        assert_eq!(response.packet.payload, vec![9]);
        assert!(response.gap.is_none());
    }

    #[tokio::test]
    async fn unknown_module_is_not_found() {
        let Harness {
            router,
            target: _target,
            _host,
        } = harness(config());
        let missing = ModuleAddress::new(0, 9);
        assert!(matches!(
            router.request(missing, PacketClass::Control, Vec::new()).await,
            Err(RequestError::NotFound(NotFound(a))) if a == missing
        ));
    }

    #[tokio::test]
    async fn oversized_request_fails_fast() {
        let Harness {
            router,
            target: _target,
            _host,
        } = harness(config());
        assert!(matches!(
            router.request(MODULE, PacketClass::DataRequest, vec![0; 65]).await,
            Err(RequestError::Encode(EncodeError::OversizedPayload { max: 64, got: 65 }))
        ));
    }

    #[tokio::test]
    async fn timeout_skips_gap_and_warns() {
        let Harness {
            router,
            mut target,
            _host,
        } = harness(config());
        let first = router
            .request(MODULE, PacketClass::Control, Vec::new())
            .await
            .unwrap();
        let second = router
            .request(MODULE, PacketClass::Control, Vec::new())
            .await
            .unwrap();
        let _lost = next_request(&mut target).await;
        let answered = next_request(&mut target).await;
        router.dispatch(&answered.reply(vec![2]).encode(64).unwrap());

        assert!(matches!(
            first.wait().await,
            Err(RequestError::Timeout { sequence: 0, .. })
        ));
        let second = second.wait().await.unwrap();
        assert_eq!(second.packet.payload, vec![2]);
        let gap = second.gap.expect("gap must be reported");
        assert_eq!(gap.first_missing, 0);
        assert_eq!(gap.skipped, 1);
    }

    #[tokio::test]
    async fn later_waiter_never_overtakes_earlier_request() {
        let Harness {
            router,
            mut target,
            _host,
        } = harness(config());
        let first = router
            .request(MODULE, PacketClass::Control, Vec::new())
            .await
            .unwrap();
        let mut second = router
            .request(MODULE, PacketClass::Control, Vec::new())
            .await
            .unwrap();
        let _lost = next_request(&mut target).await;
        let answered = next_request(&mut target).await;
        router.dispatch(&answered.reply(vec![2]).encode(64).unwrap());
        assert!(second.try_response().is_none(), "answer must wait for the first request");

        // the second issuer waits first; its answer still follows the first request
        let second = second.wait().await.unwrap();
        assert_eq!(second.packet.payload, vec![2]);
        let gap = second.gap.expect("gap must be reported");
        assert_eq!((gap.first_missing, gap.skipped), (0, 1));
        assert!(matches!(
            first.wait().await,
            Err(RequestError::Timeout { sequence: 0, .. })
        ));
    }

    #[tokio::test]
    async fn deadline_counts_from_issue() {
        let Harness {
            router,
            mut target,
            _host,
        } = harness(config());
        let pending = router
            .request(MODULE, PacketClass::Control, Vec::new())
            .await
            .unwrap();
        let request = next_request(&mut target).await;
        tokio::time::sleep(config().timeout + Duration::from_millis(50)).await;
        let mut events = router.subscribe(MODULE).unwrap();
        router.dispatch(&request.reply(vec![1]).encode(64).unwrap());

        let started = Instant::now();
        assert!(matches!(
            pending.wait().await,
            Err(RequestError::Timeout { sequence: 0, .. })
        ));
        assert!(started.elapsed() < config().timeout);
        // the late answer is no longer matched
        assert_eq!(events.recv().await.unwrap().payload, vec![1]);
    }

    #[tokio::test]
    async fn gap_counts_every_skipped_request() {
        let Harness {
            router,
            mut target,
            _host,
        } = harness(config());
        let mut pending = Vec::new();
        for _ in 0..3 {
            pending.push(
                router
                    .request(MODULE, PacketClass::Control, Vec::new())
                    .await
                    .unwrap(),
            );
        }
        for _ in 0..2 {
            next_request(&mut target).await;
        }
        let answered = next_request(&mut target).await;
        router.dispatch(&answered.reply(vec![3]).encode(64).unwrap());

        let last = pending.pop().unwrap().wait().await.unwrap();
        let gap = last.gap.expect("gap must be reported");
        assert_eq!((gap.first_missing, gap.skipped), (0, 2));
        for (sequence, request) in pending.into_iter().enumerate() {
            assert!(matches!(
                request.wait().await,
                Err(RequestError::Timeout { sequence: s, .. }) if s as usize == sequence
            ));
        }
    }

    #[tokio::test]
    async fn idle_lane_forgets_gap() {
        let Harness {
            router,
            mut target,
            _host,
        } = harness(config());
        let first = router
            .request(MODULE, PacketClass::Control, Vec::new())
            .await
            .unwrap();
        let second = router
            .request(MODULE, PacketClass::Control, Vec::new())
            .await
            .unwrap();
        assert!(second.wait().await.is_err());
        assert!(first.wait().await.is_err());

        let third = router
            .request(MODULE, PacketClass::Control, Vec::new())
            .await
            .unwrap();
        for _ in 0..2 {
            next_request(&mut target).await;
        }
        let request = next_request(&mut target).await;
        router.dispatch(&request.reply(vec![3]).encode(64).unwrap());
        assert!(third.wait().await.unwrap().gap.is_none());
    }

    #[tokio::test]
    async fn cancelled_request_frees_its_slot() {
        let mut cfg = config();
        cfg.max_pending_per_module = 1;
        let Harness {
            router,
            mut target,
            _host,
        } = harness(cfg);
        let first = router
            .request(MODULE, PacketClass::Control, Vec::new())
            .await
            .unwrap();
        first.cancel();
        let second = router
            .request(MODULE, PacketClass::Control, Vec::new())
            .await
            .unwrap();
        let cancelled = next_request(&mut target).await;
        let live = next_request(&mut target).await;
        // the late answer to the cancelled request is discarded
        router.dispatch(&cancelled.reply(vec![1]).encode(64).unwrap());
        router.dispatch(&live.reply(vec![2]).encode(64).unwrap());
        assert_eq!(second.wait().await.unwrap().packet.payload, vec![2]);
    }

    #[tokio::test]
    async fn cancel_token_withdraws_request() {
        let Harness {
            router,
            target: _target,
            _host,
        } = harness(config());
        let token = CancellationToken::new();
        let pending = router
            .request(MODULE, PacketClass::Control, Vec::new())
            .await
            .unwrap();
        token.cancel();
        assert!(matches!(
            pending.wait_or_cancel(&token).await,
            Err(RequestError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn malformed_packet_is_dropped() {
        let Harness {
            router,
            mut target,
            _host,
        } = harness(config());
        let pending = router
            .request(MODULE, PacketClass::Control, Vec::new())
            .await
            .unwrap();
        let request = next_request(&mut target).await;
        let mut corrupt = request.reply(vec![1]).encode(64).unwrap();
        corrupt[2] = 0x0F;
        router.dispatch(&corrupt);
        router.dispatch(&[0x02, 0x00]);
        router.dispatch(&request.reply(vec![7]).encode(64).unwrap());
        assert_eq!(pending.wait().await.unwrap().packet.payload, vec![7]);
    }

    #[tokio::test]
    async fn unmatched_packets_become_events() {
        let Harness {
            router,
            target: _target,
            _host,
        } = harness(config());
        let mut events = router.subscribe(MODULE).unwrap();
        let event = Packet::new(MODULE, PacketClass::Event, vec![5]).with_sequence(3);
        router.dispatch(&event.encode(64).unwrap());
        assert_eq!(events.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn teardown_rejects_new_requests() {
        let Harness {
            router,
            target: _target,
            _host,
        } = harness(config());
        router.teardown();
        assert!(router.is_closed());
        assert!(matches!(
            router.request(MODULE, PacketClass::Control, Vec::new()).await,
            Err(RequestError::Disconnected)
        ));
    }
}
