//! In-process relays for tests
//!
//! `MockNetwork` is a `Connector` whose connections end in a task that
//! plays every hop of every circuit built over them: it answers
//! CREATE_FAST/CREATE2 and EXTEND2 with real handshakes, runs the layered
//! crypto, opens streams at whichever hop receives a BEGIN and echoes their
//! data back with SENDMEs.

use crate::cell::{
    destroy_reason, end_reason, handshake_reply_body, parse_begin, read_cell,
    read_versions, write_cell, write_versions, Cell, CellCommand, CellError, Extend2,
    HandshakeRequest, RelayCell, RelayCommand,
};
use crate::circuit::{Circuit, CircuitEvent, CircuitParams, HandshakeKind, HopCryptoState};
use crate::directory::StaticDirectory;
use crate::lock;
use crate::network::PhysicalConnection;
use crate::transport::{BoxedCellStream, Connector};
use async_trait::async_trait;
use onionpath_common::{
    flow, protocol, ExitPolicy, OnionError, Result, RouterDescriptor, RouterFlags, RouterIdentity,
};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc};

/// Guard- and exit-capable relay `i` at `addr:9001`
pub fn router(i: u8, addr: &str) -> RouterDescriptor {
    let ip: IpAddr = addr.parse().expect("test address");
    RouterDescriptor::new(
        RouterIdentity::from_bytes([i + 1; 20]),
        format!("relay{}", i),
        SocketAddr::new(ip, 9001),
    )
    .with_flags(RouterFlags::relay().with_guard().with_exit())
    .with_exit_policy(ExitPolicy::accept_all())
}

/// `n` unrelated relays, one per /16
pub fn routers(n: usize) -> Vec<RouterDescriptor> {
    (0..n)
        .map(|i| router(i as u8, &format!("10.{}.0.1", i)))
        .collect()
}

/// How a simulated relay misbehaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Completes the link handshake but never answers CREATE or EXTEND2
    Silent,
    /// Flips a bit of the key confirmation in its handshake reply
    CorruptHandshake,
    /// Refuses connections; extending to it yields TRUNCATED
    Unreachable,
    /// Sends neither SENDMEs nor echoes at the exit
    WithholdSendme,
    /// Answers its first `n` EXTEND2 cells with TRUNCATED
    FailExtends(u32),
    /// Ignores its first `n` EXTEND2 cells
    IgnoreExtends(u32),
}

enum LinkEvent {
    FromClient(Cell),
    ClientGone,
    Inject(Cell),
    SendRelay {
        circ_id: u32,
        hop: usize,
        cell: RelayCell,
    },
    HangUp,
}

#[derive(Default)]
struct Shared {
    behaviours: HashMap<RouterIdentity, Behaviour>,
    extends_refused: HashMap<RouterIdentity, u32>,
    links: HashMap<RouterIdentity, Vec<mpsc::UnboundedSender<LinkEvent>>>,
    connections: HashMap<RouterIdentity, usize>,
    destroys: HashMap<RouterIdentity, usize>,
    last_relay: HashMap<RouterIdentity, RelayCell>,
}

impl Shared {
    fn behaviour(&self, id: &RouterIdentity) -> Option<Behaviour> {
        self.behaviours.get(id).copied()
    }
}

pub struct MockNetwork {
    routers: Arc<HashMap<RouterIdentity, RouterDescriptor>>,
    shared: Arc<Mutex<Shared>>,
}

impl MockNetwork {
    pub fn new(routers: Vec<RouterDescriptor>) -> Self {
        Self {
            routers: Arc::new(routers.into_iter().map(|r| (r.identity, r)).collect()),
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    pub fn set_behaviour(&self, id: RouterIdentity, behaviour: Behaviour) {
        lock(&self.shared).behaviours.insert(id, behaviour);
    }

    pub fn set_unreachable(&self, id: RouterIdentity) {
        self.set_behaviour(id, Behaviour::Unreachable);
    }

    /// Drop every live link to `id` from the relay side
    pub fn hang_up(&self, id: RouterIdentity) {
        self.broadcast(&id, || LinkEvent::HangUp);
    }

    /// Write a raw cell to the client on every live link to `id`
    pub fn inject(&self, id: RouterIdentity, cell: Cell) {
        self.broadcast(&id, || LinkEvent::Inject(cell.clone()));
    }

    /// Originate `cell` at hop `hop` of circuit `circ_id` on links to `id`
    pub fn send_relay(&self, id: RouterIdentity, circ_id: u32, hop: usize, cell: RelayCell) {
        self.broadcast(&id, || LinkEvent::SendRelay {
            circ_id,
            hop,
            cell: cell.clone(),
        });
    }

    /// Connections ever accepted for `id`
    pub fn connection_count(&self, id: &RouterIdentity) -> usize {
        lock(&self.shared).connections.get(id).copied().unwrap_or(0)
    }

    /// DESTROY cells received on links to `id`
    pub fn destroys_seen(&self, id: &RouterIdentity) -> usize {
        lock(&self.shared).destroys.get(id).copied().unwrap_or(0)
    }

    /// Latest relay cell any hop recognized on links to `id`
    pub fn last_relay_from_client(&self, id: &RouterIdentity) -> Option<RelayCell> {
        lock(&self.shared).last_relay.get(id).cloned()
    }

    /// Poll `condition` until it holds; panics after five seconds
    pub async fn wait_for(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn broadcast(&self, id: &RouterIdentity, event: impl Fn() -> LinkEvent) {
        let mut shared = lock(&self.shared);
        if let Some(links) = shared.links.get_mut(id) {
            links.retain(|tx| tx.send(event()).is_ok());
        }
    }
}

#[async_trait]
impl Connector for MockNetwork {
    async fn connect(&self, router: &RouterDescriptor) -> Result<BoxedCellStream> {
        let id = router.identity;
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut shared = lock(&self.shared);
            if !self.routers.contains_key(&id)
                || shared.behaviour(&id) == Some(Behaviour::Unreachable)
            {
                return Err(OnionError::transport(format!("{} is unreachable", id)));
            }
            shared.links.entry(id).or_default().push(tx.clone());
            *shared.connections.entry(id).or_default() += 1;
        }

        let (client, server) = tokio::io::duplex(64 * 1024);
        let relay = MockRelay {
            identity: id,
            routers: self.routers.clone(),
            shared: self.shared.clone(),
            circuits: HashMap::new(),
        };
        tokio::spawn(relay.run(server, tx, rx));
        Ok(Box::new(client))
    }
}

struct MockHop {
    identity: RouterIdentity,
    state: HopCryptoState,
}

#[derive(Default)]
struct MockCircuit {
    hops: Vec<MockHop>,
    data_received: u32,
    streams: HashMap<u16, u32>,
}

impl MockCircuit {
    /// Seal at `hop` and add the backward layers down to the first hop
    fn originate(&mut self, circ_id: u32, hop: usize, cell: &RelayCell) -> Option<Cell> {
        if hop >= self.hops.len() {
            return None;
        }
        let mut payload = cell.encode().ok()?;
        self.hops[hop].state.seal_outbound(&mut payload);
        for layer in self.hops[..=hop].iter_mut().rev() {
            layer.state.encrypt_outbound(&mut payload);
        }
        Some(Cell::relay(circ_id, payload, false))
    }
}

/// The relay side of one link
struct MockRelay {
    identity: RouterIdentity,
    routers: Arc<HashMap<RouterIdentity, RouterDescriptor>>,
    shared: Arc<Mutex<Shared>>,
    circuits: HashMap<u32, MockCircuit>,
}

impl MockRelay {
    async fn run(
        mut self,
        stream: DuplexStream,
        events_tx: mpsc::UnboundedSender<LinkEvent>,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let (mut reader, mut writer) = tokio::io::split(stream);
        if link_handshake(&mut reader, &mut writer).await.is_err() {
            return;
        }

        // read_cell is not cancel safe, so reads get their own task
        let read_task = tokio::spawn(async move {
            loop {
                match read_cell(&mut reader).await {
                    Ok(Some(cell)) => {
                        if events_tx.send(LinkEvent::FromClient(cell)).is_err() {
                            break;
                        }
                    }
                    _ => {
                        let _ = events_tx.send(LinkEvent::ClientGone);
                        break;
                    }
                }
            }
        });

        'link: while let Some(event) = events.recv().await {
            let outgoing = match event {
                LinkEvent::FromClient(cell) => self.on_cell(cell),
                LinkEvent::Inject(cell) => vec![cell],
                LinkEvent::SendRelay { circ_id, hop, cell } => self
                    .circuits
                    .get_mut(&circ_id)
                    .and_then(|circuit| circuit.originate(circ_id, hop, &cell))
                    .into_iter()
                    .collect(),
                LinkEvent::ClientGone | LinkEvent::HangUp => break,
            };
            for cell in outgoing {
                if write_cell(&mut writer, &cell).await.is_err() {
                    break 'link;
                }
            }
        }

        read_task.abort();
        let _ = writer.shutdown().await;
    }

    fn behaviour(&self, id: &RouterIdentity) -> Option<Behaviour> {
        lock(&self.shared).behaviour(id)
    }

    fn on_cell(&mut self, cell: Cell) -> Vec<Cell> {
        match cell.command {
            CellCommand::CreateFast => self
                .create(cell.circ_id, HandshakeKind::Fast, &cell.payload)
                .into_iter()
                .collect(),
            CellCommand::Create2 => match HandshakeRequest::decode(&cell.payload) {
                Ok((request, _)) => self
                    .create(cell.circ_id, HandshakeKind::X25519, &request.hdata)
                    .into_iter()
                    .collect(),
                Err(_) => Vec::new(),
            },
            CellCommand::Relay | CellCommand::RelayEarly => self.relay(cell),
            CellCommand::Destroy => {
                *lock(&self.shared).destroys.entry(self.identity).or_default() += 1;
                self.circuits.remove(&cell.circ_id);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn create(&mut self, circ_id: u32, kind: HandshakeKind, skin: &[u8]) -> Option<Cell> {
        let behaviour = self.behaviour(&self.identity);
        if behaviour == Some(Behaviour::Silent) {
            return None;
        }
        let (state, mut reply) = HopCryptoState::respond(kind, skin).ok()?;
        if behaviour == Some(Behaviour::CorruptHandshake) {
            corrupt(&mut reply);
        }
        self.circuits.insert(
            circ_id,
            MockCircuit {
                hops: vec![MockHop {
                    identity: self.identity,
                    state,
                }],
                ..MockCircuit::default()
            },
        );
        let (command, body) = match kind {
            HandshakeKind::Fast => (CellCommand::CreatedFast, reply),
            HandshakeKind::X25519 => (CellCommand::Created2, handshake_reply_body(&reply)),
        };
        Cell::new(circ_id, command, body).ok()
    }

    fn relay(&mut self, cell: Cell) -> Vec<Cell> {
        let circ_id = cell.circ_id;
        let Some(circuit) = self.circuits.get_mut(&circ_id) else {
            return Vec::new();
        };
        let Ok(mut payload) = cell.relay_payload() else {
            return Vec::new();
        };

        let mut recognized = None;
        for (index, hop) in circuit.hops.iter_mut().enumerate() {
            hop.state.decrypt_inbound(&mut payload);
            if hop.state.recognize_inbound(&payload) {
                recognized = Some(index);
                break;
            }
        }
        let Some(hop) = recognized else {
            return Vec::new();
        };
        let Ok(relay) = RelayCell::decode(&payload) else {
            return Vec::new();
        };
        lock(&self.shared)
            .last_relay
            .insert(self.identity, relay.clone());

        let replies = handle_at_hop(&self.shared, &self.routers, circuit, hop, relay);
        replies
            .iter()
            .filter_map(|reply| circuit.originate(circ_id, hop, reply))
            .collect()
    }
}

/// What hop `hop` answers to a relay cell addressed to it
fn handle_at_hop(
    shared: &Mutex<Shared>,
    routers: &HashMap<RouterIdentity, RouterDescriptor>,
    circuit: &mut MockCircuit,
    hop: usize,
    cell: RelayCell,
) -> Vec<RelayCell> {
    let here = circuit.hops[hop].identity;
    let truncated = || {
        vec![RelayCell::control(
            RelayCommand::Truncated,
            vec![destroy_reason::CONNECTFAILED],
        )]
    };

    match cell.command {
        RelayCommand::Extend2 => {
            {
                let mut shared = lock(shared);
                match shared.behaviour(&here) {
                    Some(Behaviour::FailExtends(limit)) => {
                        let failed = shared.extends_refused.entry(here).or_default();
                        if *failed < limit {
                            *failed += 1;
                            return truncated();
                        }
                    }
                    Some(Behaviour::IgnoreExtends(limit)) => {
                        let ignored = shared.extends_refused.entry(here).or_default();
                        if *ignored < limit {
                            *ignored += 1;
                            return Vec::new();
                        }
                    }
                    _ => {}
                }
            }
            let Ok(extend) = Extend2::decode(&cell.data) else {
                return truncated();
            };
            let Some(target) = extend.legacy_id().filter(|id| routers.contains_key(id)) else {
                return truncated();
            };
            let behaviour = lock(shared).behaviour(&target);
            match behaviour {
                Some(Behaviour::Unreachable) => return truncated(),
                Some(Behaviour::Silent) => return Vec::new(),
                _ => {}
            }
            let Ok((state, mut reply)) =
                HopCryptoState::respond(HandshakeKind::X25519, &extend.handshake.hdata)
            else {
                return truncated();
            };
            if behaviour == Some(Behaviour::CorruptHandshake) {
                corrupt(&mut reply);
            }
            circuit.hops.push(MockHop {
                identity: target,
                state,
            });
            vec![RelayCell::control(
                RelayCommand::Extended2,
                handshake_reply_body(&reply),
            )]
        }
        RelayCommand::Begin => match parse_begin(&cell.data) {
            Ok((host, _)) if host == "refuse.example" => vec![RelayCell::new(
                RelayCommand::End,
                cell.stream_id,
                vec![end_reason::CONNECTREFUSED],
            )],
            Ok(_) => {
                circuit.streams.insert(cell.stream_id, 0);
                vec![RelayCell::new(
                    RelayCommand::Connected,
                    cell.stream_id,
                    Vec::new(),
                )]
            }
            Err(_) => vec![RelayCell::new(
                RelayCommand::End,
                cell.stream_id,
                vec![end_reason::TORPROTOCOL],
            )],
        },
        RelayCommand::Data => {
            circuit.data_received += 1;
            let Some(received) = circuit.streams.get_mut(&cell.stream_id) else {
                return Vec::new();
            };
            *received += 1;
            if lock(shared).behaviour(&here) == Some(Behaviour::WithholdSendme) {
                return Vec::new();
            }

            let mut replies = Vec::new();
            if circuit.data_received % flow::CIRCUIT_WINDOW_INCREMENT == 0 {
                replies.push(RelayCell::control(RelayCommand::Sendme, Vec::new()));
            }
            if *received % flow::STREAM_WINDOW_INCREMENT == 0 {
                replies.push(RelayCell::new(
                    RelayCommand::Sendme,
                    cell.stream_id,
                    Vec::new(),
                ));
            }
            replies.push(RelayCell::new(RelayCommand::Data, cell.stream_id, cell.data));
            replies
        }
        RelayCommand::End => {
            circuit.streams.remove(&cell.stream_id);
            Vec::new()
        }
        _ => Vec::new(),
    }
}

fn corrupt(reply: &mut [u8]) {
    if let Some(last) = reply.last_mut() {
        *last ^= 0x01;
    }
}

/// Relay half of the link handshake; the client's NETINFO arrives later
async fn link_handshake(
    reader: &mut ReadHalf<DuplexStream>,
    writer: &mut WriteHalf<DuplexStream>,
) -> std::result::Result<(), CellError> {
    read_versions(reader).await?;
    write_versions(writer, &[protocol::LINK_VERSION]).await?;
    write_cell(writer, &Cell::netinfo(IpAddr::V4(Ipv4Addr::LOCALHOST))).await?;
    writer.flush().await?;
    Ok(())
}

/// A mock network of `n` relays plus the plumbing circuits need
pub struct TestNetwork {
    pub routers: Vec<RouterDescriptor>,
    pub mock: Arc<MockNetwork>,
    pub directory: Arc<StaticDirectory>,
    pub events: broadcast::Sender<CircuitEvent>,
    params: CircuitParams,
}

impl TestNetwork {
    pub fn new(n: usize) -> Self {
        let routers = routers(n);
        let (events, _) = broadcast::channel(64);
        Self {
            mock: Arc::new(MockNetwork::new(routers.clone())),
            directory: Arc::new(StaticDirectory::new(routers.clone())),
            routers,
            events,
            params: CircuitParams {
                queue_timeout: Duration::from_millis(300),
                ..CircuitParams::default()
            },
        }
    }

    pub fn with_params(mut self, params: CircuitParams) -> Self {
        self.params = params;
        self
    }

    pub fn ids(&self, indices: &[usize]) -> Vec<RouterIdentity> {
        indices.iter().map(|&i| self.routers[i].identity).collect()
    }

    pub async fn open_connection(&self, index: usize) -> Arc<PhysicalConnection> {
        PhysicalConnection::open(
            self.routers[index].clone(),
            self.mock.as_ref(),
            Duration::from_secs(5),
        )
        .await
        .expect("mock connection")
    }

    /// A fresh, unbuilt circuit on `connection`
    pub fn circuit_on(&self, connection: &Arc<PhysicalConnection>) -> Arc<Circuit> {
        Circuit::open(
            connection,
            self.directory.clone(),
            self.params.clone(),
            self.events.clone(),
        )
        .expect("circuit id")
    }

    /// Build a circuit through `hops` by hand, closing it if any step fails
    pub async fn build_circuit(&self, hops: &[usize], fast: bool) -> Result<Arc<Circuit>> {
        let started = Instant::now();
        let connection = self.open_connection(hops[0]).await;
        let circuit = self.circuit_on(&connection);

        let result = async {
            circuit
                .create_first_hop(&self.routers[hops[0]], fast)
                .await?;
            for &index in &hops[1..] {
                circuit.extend_to(&self.routers[index]).await?;
            }
            Ok::<(), OnionError>(())
        }
        .await;

        match result {
            Ok(()) => {
                circuit.mark_established(started.elapsed());
                Ok(circuit)
            }
            Err(e) => {
                circuit.close(true);
                Err(e)
            }
        }
    }
}
