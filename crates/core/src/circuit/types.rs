use super::crypto::{HopCryptoState, HopHandshake};
use super::flow_control::{ReceiveWindow, SendWindow};
use super::queue::{CellInterceptor, CellKind, CellQueue, QueuedCell};
use super::relay::RelayHandler;
use super::stream::{IncomingStream, Stream};
use crate::cell::{
    begin_body, destroy_reason, parse_handshake_reply, Cell, CellCommand, Extend2,
    HandshakeRequest, LinkSpecifier, RelayCell, RelayCommand, HTYPE_X25519,
};
use crate::directory::RouterDirectory;
use crate::lock;
use crate::network::PhysicalConnection;
use onionpath_common::{
    flow, protocol, routing, ClientConfig, OnionError, Result, RouterDescriptor, RouterIdentity,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Circuit id, scoped to one physical connection
pub type CircuitId = u32;

/// Lifecycle of a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Hops are still being added
    Building,

    /// Every planned hop answered; streams may be attached
    Established,

    /// Soft-closed: existing streams drain, no new ones
    Closing,

    /// Torn down
    Closed,
}

/// Notifications published to pool subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitEvent {
    Built {
        circ_id: CircuitId,
        route: Vec<RouterIdentity>,
        setup: Duration,
    },
    Extended {
        circ_id: CircuitId,
        router: RouterIdentity,
    },
    Closed {
        circ_id: CircuitId,
        reason: Option<u8>,
    },
}

/// Per-circuit tunables taken from `ClientConfig`
#[derive(Debug, Clone)]
pub struct CircuitParams {
    /// Bounded wait for every handshake and stream reply
    pub queue_timeout: Duration,

    /// Hard-close once the last stream detaches
    pub auto_close_on_last_stream: bool,

    /// Soft-close once failures exceed this share of streams carried
    pub stream_failure_ratio: f64,
}

impl CircuitParams {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            queue_timeout: config.queue_timeout(),
            auto_close_on_last_stream: config.auto_close_on_last_stream,
            stream_failure_ratio: config.stream_failure_ratio,
        }
    }
}

impl Default for CircuitParams {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    streams: HashMap<u16, Arc<Stream>>,
    next_stream_id: u16,
    relay_early_left: u8,
    setup: Option<Duration>,
    stream_delay_total: Duration,
    stream_delays: u32,
    failures: u32,
    streams_carried: u32,
    ranking: f64,
    destroy_reason: Option<u8>,
    acceptor: Option<mpsc::UnboundedSender<IncomingStream>>,
    ports_served: HashSet<u16>,
}

/// A multi-hop path through relays, multiplexed on its first hop's connection.
///
/// Hops are added one at a time (`create_first_hop`, then `extend_to` for
/// each further router). Outbound relay cells are sealed by the target hop
/// and layered from that hop back to the first; inbound cells are peeled
/// from the first hop onward until one hop recognizes them.
pub struct Circuit {
    id: CircuitId,
    connection: Arc<PhysicalConnection>,
    directory: Arc<dyn RouterDirectory>,
    params: CircuitParams,
    /// Hop crypto, first hop first. Held while sealing and queueing a cell
    /// so the keystream order matches the wire order.
    hops: Mutex<Vec<HopCryptoState>>,
    route: Mutex<Vec<RouterDescriptor>>,
    inner: Mutex<CircuitInner>,
    queue: CellQueue,
    send_window: SendWindow,
    recv_window: ReceiveWindow,
    events: broadcast::Sender<CircuitEvent>,
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &format_args!("{:#010x}", self.id))
            .field("state", &self.state())
            .field("hops", &self.route_established())
            .finish()
    }
}

impl Circuit {
    fn new(
        id: CircuitId,
        connection: Arc<PhysicalConnection>,
        directory: Arc<dyn RouterDirectory>,
        params: CircuitParams,
        events: broadcast::Sender<CircuitEvent>,
    ) -> Self {
        let queue = CellQueue::new();
        queue.add_interceptor(CellInterceptor::DropPadding);
        Self {
            id,
            connection,
            directory,
            params,
            hops: Mutex::new(Vec::new()),
            route: Mutex::new(Vec::new()),
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Building,
                streams: HashMap::new(),
                next_stream_id: 1,
                relay_early_left: protocol::RELAY_EARLY_BUDGET,
                setup: None,
                stream_delay_total: Duration::ZERO,
                stream_delays: 0,
                failures: 0,
                streams_carried: 0,
                ranking: 0.0,
                destroy_reason: None,
                acceptor: None,
                ports_served: HashSet::new(),
            }),
            queue,
            send_window: SendWindow::new(
                flow::CIRCUIT_WINDOW_START,
                flow::CIRCUIT_WINDOW_INCREMENT,
            ),
            recv_window: ReceiveWindow::new(
                flow::CIRCUIT_WINDOW_START,
                flow::CIRCUIT_WINDOW_INCREMENT,
            ),
            events,
        }
    }

    /// Register a new, empty circuit on `connection`
    pub fn open(
        connection: &Arc<PhysicalConnection>,
        directory: Arc<dyn RouterDirectory>,
        params: CircuitParams,
        events: broadcast::Sender<CircuitEvent>,
    ) -> Result<Arc<Self>> {
        connection.register_circuit(|id| {
            Arc::new(Self::new(id, connection.clone(), directory, params, events))
        })
    }

    pub fn id(&self) -> CircuitId {
        self.id
    }

    pub fn connection(&self) -> &Arc<PhysicalConnection> {
        &self.connection
    }

    pub fn state(&self) -> CircuitState {
        lock(&self.inner).state
    }

    pub fn is_established(&self) -> bool {
        self.state() == CircuitState::Established
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Closing or closed: no new streams will be accepted
    pub fn is_soft_closed(&self) -> bool {
        matches!(self.state(), CircuitState::Closing | CircuitState::Closed)
    }

    /// Routers whose hop handshake completed, first hop first
    pub fn route(&self) -> Vec<RouterDescriptor> {
        lock(&self.route).clone()
    }

    pub fn route_ids(&self) -> Vec<RouterIdentity> {
        lock(&self.route).iter().map(|r| r.identity).collect()
    }

    /// Number of hops with completed key exchange, virtual hops included
    pub fn route_established(&self) -> usize {
        lock(&self.hops).len()
    }

    pub fn exit(&self) -> Option<RouterDescriptor> {
        lock(&self.route).last().cloned()
    }

    /// Lower is better
    pub fn ranking(&self) -> f64 {
        lock(&self.inner).ranking
    }

    pub fn setup_duration(&self) -> Option<Duration> {
        lock(&self.inner).setup
    }

    pub fn stream_count(&self) -> usize {
        lock(&self.inner).streams.len()
    }

    pub fn streams_carried(&self) -> u32 {
        lock(&self.inner).streams_carried
    }

    pub fn failures(&self) -> u32 {
        lock(&self.inner).failures
    }

    pub fn has_served_port(&self, port: u16) -> bool {
        lock(&self.inner).ports_served.contains(&port)
    }

    pub fn relay_early_remaining(&self) -> u8 {
        lock(&self.inner).relay_early_left
    }

    /// Reason carried by the DESTROY that closed this circuit, if any
    pub fn destroy_reason(&self) -> Option<u8> {
        lock(&self.inner).destroy_reason
    }

    pub fn stream(&self, id: u16) -> Option<Arc<Stream>> {
        lock(&self.inner).streams.get(&id).cloned()
    }

    /// Send a link-level cell on this circuit's id
    pub fn send_cell(&self, mut cell: Cell) -> Result<()> {
        if self.is_closed() {
            return Err(OnionError::CircuitClosed);
        }
        cell.circ_id = self.id;
        self.connection.send_cell(cell)
    }

    /// Seal `cell` for `hop` (the last hop when `None`) and send it
    pub fn send_relay_cell(&self, cell: &RelayCell, hop: Option<usize>, early: bool) -> Result<()> {
        if self.is_closed() {
            return Err(OnionError::CircuitClosed);
        }
        let mut payload = cell.encode()?;

        let mut hops = lock(&self.hops);
        let target = match hop {
            Some(index) if index < hops.len() => index,
            Some(index) => {
                return Err(OnionError::internal(format!(
                    "hop {} out of range for {} hops",
                    index,
                    hops.len()
                )))
            }
            None => hops
                .len()
                .checked_sub(1)
                .ok_or_else(|| OnionError::protocol("circuit has no hops"))?,
        };

        hops[target].seal_outbound(&mut payload);
        for state in hops[..=target].iter_mut().rev() {
            state.encrypt_outbound(&mut payload);
        }
        self.connection
            .send_cell(Cell::relay(self.id, payload, early))
    }

    /// Entry point for every cell the demultiplexer routes to this circuit
    pub fn process_cell(self: &Arc<Self>, cell: Cell) {
        match cell.command {
            CellCommand::Created | CellCommand::CreatedFast | CellCommand::Created2 => {
                self.queue.push(QueuedCell::Created {
                    command: cell.command,
                    payload: cell.payload,
                });
            }
            CellCommand::Relay | CellCommand::RelayEarly => self.process_relay(cell),
            CellCommand::Destroy => self.handle_destroy(cell.reason()),
            other => debug!("Ignoring {} on circuit {:#010x}", other, self.id),
        }
    }

    fn process_relay(self: &Arc<Self>, cell: Cell) {
        let mut payload = match cell.relay_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Circuit {:#010x}: {}", self.id, e);
                self.protocol_violation();
                return;
            }
        };

        let recognized_by = {
            let mut hops = lock(&self.hops);
            let mut found = None;
            for (index, state) in hops.iter_mut().enumerate() {
                state.decrypt_inbound(&mut payload);
                if state.recognize_inbound(&payload) {
                    found = Some(index);
                    break;
                }
            }
            found
        };

        let Some(hop) = recognized_by else {
            warn!("Unrecognized relay cell on circuit {:#010x}", self.id);
            self.protocol_violation();
            return;
        };

        match RelayCell::decode(&payload) {
            Ok(relay) => RelayHandler::new(self).handle(hop, relay),
            Err(e) => {
                warn!("Circuit {:#010x}: {}", self.id, e);
                self.protocol_violation();
            }
        }
    }

    /// Handshake with the router this circuit's connection leads to
    pub async fn create_first_hop(&self, router: &RouterDescriptor, fast: bool) -> Result<()> {
        if self.route_established() != 0 {
            return Err(OnionError::internal("first hop already created"));
        }

        let handshake = if fast {
            HopHandshake::client_fast()
        } else {
            HopHandshake::client_x25519()
        };
        let cell = if fast {
            Cell::new(self.id, CellCommand::CreateFast, handshake.onion_skin())?
        } else {
            let request = HandshakeRequest {
                htype: HTYPE_X25519,
                hdata: handshake.onion_skin(),
            };
            Cell::new(self.id, CellCommand::Create2, request.encode())?
        };
        self.send_cell(cell)?;

        let reply = self
            .queue
            .receive(CellKind::Created, self.params.queue_timeout)
            .await?;
        let QueuedCell::Created { command, payload } = reply else {
            return Err(OnionError::internal("created receive returned a relay cell"));
        };
        let hdata = match (fast, command) {
            (true, CellCommand::CreatedFast) => payload,
            (false, CellCommand::Created2) => parse_handshake_reply(&payload)?,
            (_, other) => return Err(OnionError::unexpected("CREATED", other.to_string())),
        };

        let state = handshake.complete(&hdata)?;
        self.push_hop(Some(router.clone()), state);
        debug!(
            "Circuit {:#010x}: first hop {} ready ({})",
            self.id,
            router.identity,
            if fast { "fast" } else { "x25519" }
        );
        Ok(())
    }

    /// Add `router` after the current last hop with an EXTEND2
    pub async fn extend_to(&self, router: &RouterDescriptor) -> Result<()> {
        self.consume_relay_early()?;

        let handshake = HopHandshake::client_x25519();
        let body = Extend2 {
            link_specifiers: LinkSpecifier::for_router(router),
            handshake: HandshakeRequest {
                htype: HTYPE_X25519,
                hdata: handshake.onion_skin(),
            },
        }
        .encode();
        self.send_relay_cell(&RelayCell::control(RelayCommand::Extend2, body), None, true)?;

        let reply = self
            .queue
            .receive(
                CellKind::Relay(RelayCommand::Extended2),
                self.params.queue_timeout,
            )
            .await?;
        let QueuedCell::Relay { cell, .. } = reply else {
            return Err(OnionError::internal("relay receive returned a created cell"));
        };

        let hdata = parse_handshake_reply(&cell.data)?;
        let state = handshake.complete(&hdata)?;
        self.push_hop(Some(router.clone()), state);
        debug!(
            "Circuit {:#010x}: extended to {} ({} hops)",
            self.id,
            router.identity,
            self.route_established()
        );
        Ok(())
    }

    /// Append one more hop to an established circuit
    pub async fn extend(&self, fingerprint: &RouterIdentity) -> Result<()> {
        {
            let inner = lock(&self.inner);
            if inner.state != CircuitState::Established {
                return Err(OnionError::CircuitClosed);
            }
            if inner.relay_early_left == 0 {
                return Err(OnionError::ExtensionRejected(
                    "relay-early budget exhausted".to_string(),
                ));
            }
        }
        if self.route_ids().contains(fingerprint) {
            return Err(OnionError::ExtensionRejected(format!(
                "{} is already in the path",
                fingerprint
            )));
        }

        let router = self
            .directory
            .router(fingerprint)
            .ok_or_else(|| OnionError::ServerNotFound(fingerprint.to_hex()))?;

        if let Err(e) = self.extend_to(&router).await {
            warn!(
                "Extending circuit {:#010x} to {} failed: {}",
                self.id, fingerprint, e
            );
            self.close(true);
            return Err(e);
        }

        self.emit(CircuitEvent::Extended {
            circ_id: self.id,
            router: router.identity,
        });
        Ok(())
    }

    fn consume_relay_early(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.state == CircuitState::Closed {
            return Err(OnionError::CircuitClosed);
        }
        if inner.relay_early_left == 0 {
            return Err(OnionError::ExtensionRejected(
                "relay-early budget exhausted".to_string(),
            ));
        }
        inner.relay_early_left -= 1;
        Ok(())
    }

    fn push_hop(&self, router: Option<RouterDescriptor>, state: HopCryptoState) {
        lock(&self.hops).push(state);
        if let Some(router) = router {
            lock(&self.route).push(router);
        }
    }

    /// Add a hop that is not a relay, e.g. the far end of a rendezvous
    pub fn append_virtual_hop(&self, state: HopCryptoState) -> Result<()> {
        if self.is_closed() {
            return Err(OnionError::CircuitClosed);
        }
        self.push_hop(None, state);
        debug!(
            "Circuit {:#010x}: virtual hop appended ({:?} role)",
            self.id,
            lock(&self.hops).last().map(|h| h.role())
        );
        Ok(())
    }

    /// Record the setup time, compute the first ranking and publish `Built`
    pub fn mark_established(&self, setup: Duration) {
        {
            let mut inner = lock(&self.inner);
            if inner.state != CircuitState::Building {
                return;
            }
            inner.state = CircuitState::Established;
            inner.setup = Some(setup);
            recompute_ranking(&mut inner);
        }
        let route = self.route_ids();
        info!(
            "Circuit {:#010x} established through {} hops in {:?}",
            self.id,
            route.len(),
            setup
        );
        self.emit(CircuitEvent::Built {
            circ_id: self.id,
            route,
            setup,
        });
    }

    /// Reserve the lowest free stream id at or after the rolling counter
    pub fn assign_stream_id<F>(&self, make: F) -> Result<Arc<Stream>>
    where
        F: FnOnce(u16) -> Arc<Stream>,
    {
        let mut inner = lock(&self.inner);
        match inner.state {
            CircuitState::Established => {}
            CircuitState::Building => {
                return Err(OnionError::protocol("circuit is not established yet"))
            }
            CircuitState::Closing | CircuitState::Closed => return Err(OnionError::CircuitClosed),
        }

        let start = inner.next_stream_id;
        let id = (0..=u16::MAX)
            .map(|offset| start.wrapping_add(offset))
            .find(|id| *id != 0 && !inner.streams.contains_key(id))
            .ok_or(OnionError::NoFreeStreamIds)?;

        inner.next_stream_id = id.wrapping_add(1).max(1);
        inner.streams_carried += 1;
        let stream = make(id);
        inner.streams.insert(id, stream.clone());
        Ok(stream)
    }

    /// Register a stream the far end opened; `None` if the id is taken
    pub(crate) fn admit_stream(self: &Arc<Self>, id: u16, hop: usize) -> Option<Arc<Stream>> {
        let mut inner = lock(&self.inner);
        if inner.state != CircuitState::Established || inner.streams.contains_key(&id) {
            return None;
        }
        let stream = Arc::new(Stream::new(id, hop, Arc::downgrade(self)));
        stream.mark_connected();
        inner.streams.insert(id, stream.clone());
        inner.streams_carried += 1;
        Some(stream)
    }

    /// Detach a stream; may finish a soft close or trigger auto-close
    pub fn remove_stream(&self, id: u16) {
        let close_now = {
            let mut inner = lock(&self.inner);
            if inner.streams.remove(&id).is_none() {
                return;
            }
            inner.streams.is_empty()
                && (self.params.auto_close_on_last_stream
                    || inner.state == CircuitState::Closing)
        };
        if close_now {
            debug!("Circuit {:#010x}: last stream gone, closing", self.id);
            self.teardown(None, Some(destroy_reason::FINISHED));
        }
    }

    /// Open a stream to `target:port` through the last hop
    pub async fn open_stream(self: &Arc<Self>, target: &str, port: u16) -> Result<Arc<Stream>> {
        let hop = self
            .route_established()
            .checked_sub(1)
            .ok_or_else(|| OnionError::protocol("circuit has no hops"))?;
        let stream =
            self.assign_stream_id(|id| Arc::new(Stream::new(id, hop, Arc::downgrade(self))))?;

        let started = Instant::now();
        let begin = RelayCell::new(RelayCommand::Begin, stream.id(), begin_body(target, port));
        let result = match self.send_relay_cell(&begin, Some(hop), false) {
            Ok(()) => stream.wait_connected(self.params.queue_timeout).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.record_stream_success(started.elapsed(), port);
                debug!(
                    "Circuit {:#010x}: stream {} to {}:{} connected",
                    self.id,
                    stream.id(),
                    target,
                    port
                );
                Ok(stream)
            }
            Err(e) => {
                debug!(
                    "Circuit {:#010x}: stream to {}:{} failed: {}",
                    self.id, target, port, e
                );
                stream.force_close();
                self.report_stream_failure();
                self.remove_stream(stream.id());
                Err(e)
            }
        }
    }

    fn record_stream_success(&self, delay: Duration, port: u16) {
        let mut inner = lock(&self.inner);
        inner.stream_delay_total += delay;
        inner.stream_delays += 1;
        inner.ports_served.insert(port);
        recompute_ranking(&mut inner);
    }

    /// Count a failed stream; repeated failures soft-close the circuit
    pub fn report_stream_failure(&self) {
        let soft_close = {
            let mut inner = lock(&self.inner);
            inner.failures += 1;
            recompute_ranking(&mut inner);
            let carried = inner.streams_carried.max(1) as f64;
            inner.state == CircuitState::Established
                && inner.failures as f64 > self.params.stream_failure_ratio * carried
        };
        if soft_close {
            info!(
                "Circuit {:#010x}: too many stream failures, soft-closing",
                self.id
            );
            self.close(false);
        }
    }

    /// Admit streams opened by the far end (rendezvous service side)
    pub fn accept_streams(&self) -> mpsc::UnboundedReceiver<IncomingStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = lock(&self.inner);
        if inner.state != CircuitState::Closed {
            inner.acceptor = Some(tx);
        }
        rx
    }

    pub(crate) fn acceptor(&self) -> Option<mpsc::UnboundedSender<IncomingStream>> {
        lock(&self.inner).acceptor.clone()
    }

    /// Subscribe to INTRODUCE2 cells arriving on this circuit
    pub fn introductions(&self) -> mpsc::UnboundedReceiver<QueuedCell> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.queue.add_interceptor(CellInterceptor::Forward {
            commands: vec![RelayCommand::Introduce2],
            sink: tx,
        });
        rx
    }

    /// Wait for the next circuit-level cell of kind `expected`
    pub async fn receive(&self, expected: CellKind) -> Result<QueuedCell> {
        self.queue.receive(expected, self.params.queue_timeout).await
    }

    pub(crate) fn queue(&self) -> &CellQueue {
        &self.queue
    }

    pub(crate) fn send_window(&self) -> &SendWindow {
        &self.send_window
    }

    pub(crate) fn recv_window(&self) -> &ReceiveWindow {
        &self.recv_window
    }

    /// Close the circuit.
    ///
    /// A soft close (`force == false`) refuses new streams and tears down
    /// once the open ones drain. A hard close ends every stream now and
    /// sends DESTROY to the first hop only. Idempotent.
    pub fn close(&self, force: bool) {
        if !force {
            let drained = {
                let mut inner = lock(&self.inner);
                match inner.state {
                    CircuitState::Closed => return,
                    CircuitState::Closing if !inner.streams.is_empty() => return,
                    _ => {}
                }
                inner.state = CircuitState::Closing;
                inner.streams.is_empty()
            };
            if !drained {
                debug!("Circuit {:#010x} draining before close", self.id);
                return;
            }
        }
        self.teardown(None, Some(destroy_reason::REQUESTED));
    }

    /// The peer destroyed the circuit
    pub fn handle_destroy(&self, reason: u8) {
        info!(
            "Circuit {:#010x} destroyed by peer (reason {})",
            self.id, reason
        );
        self.teardown(Some(reason), None);
    }

    /// The underlying connection went away
    pub fn handle_transport_closed(&self) {
        self.teardown(Some(destroy_reason::CHANNEL_CLOSED), None);
    }

    pub(crate) fn protocol_violation(&self) {
        self.teardown(
            Some(destroy_reason::PROTOCOL),
            Some(destroy_reason::PROTOCOL),
        );
    }

    fn teardown(&self, recorded: Option<u8>, send_destroy: Option<u8>) {
        let streams: Vec<Arc<Stream>> = {
            let mut inner = lock(&self.inner);
            if inner.state == CircuitState::Closed {
                return;
            }
            inner.state = CircuitState::Closed;
            inner.destroy_reason = recorded;
            inner.acceptor = None;
            inner.streams.drain().map(|(_, stream)| stream).collect()
        };

        for stream in &streams {
            stream.force_close();
        }
        if let Some(reason) = send_destroy {
            if let Err(e) = self.connection.send_cell(Cell::destroy(self.id, reason)) {
                debug!("Circuit {:#010x}: DESTROY not sent: {}", self.id, e);
            }
        }
        self.queue.close(recorded);
        self.send_window.close();
        self.connection.remove_circuit(self.id);

        info!(
            "Circuit {:#010x} closed ({} streams ended)",
            self.id,
            streams.len()
        );
        self.emit(CircuitEvent::Closed {
            circ_id: self.id,
            reason: recorded,
        });
    }

    fn emit(&self, event: CircuitEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Weighted mean of setup time and stream delays, doubled per failure
fn recompute_ranking(inner: &mut CircuitInner) {
    let setup_ms = inner
        .setup
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0);
    let delays_ms = inner.stream_delay_total.as_secs_f64() * 1000.0;
    let mean = (routing::SETUP_TIME_WEIGHT * setup_ms + delays_ms)
        / (routing::SETUP_TIME_WEIGHT + inner.stream_delays as f64);
    inner.ranking = mean * 2f64.powi(inner.failures.min(64) as i32);
}
