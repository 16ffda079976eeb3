use super::demux::ConnectionDemultiplexer;
use crate::cell::{read_cell, read_versions, write_cell, write_versions, Cell, CellCommand};
use crate::circuit::Circuit;
use crate::lock;
use crate::transport::{BoxedCellStream, Connector};
use onionpath_common::{protocol, OnionError, Result, RouterDescriptor, RouterIdentity};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Client-originated circuit ids carry the high bit
const CIRC_ID_INITIATOR_BIT: u32 = 0x8000_0000;

/// Attempts at drawing an unused circuit id before giving up
const MAX_CIRC_ID_ATTEMPTS: usize = 64;

enum Outbound {
    Cell(Cell),
    Shutdown,
}

/// One link to a relay, shared by every circuit whose first hop it is.
///
/// Cells are written by a dedicated writer task fed through a channel so
/// that senders never block on the socket; a `ConnectionDemultiplexer`
/// task owns the read half. The connection tears itself down when its
/// last circuit is removed.
pub struct PhysicalConnection {
    router: RouterDescriptor,
    outbound: mpsc::UnboundedSender<Outbound>,
    circuits: Mutex<HashMap<u32, Arc<Circuit>>>,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PhysicalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalConnection")
            .field("router", &self.router.identity)
            .field("circuits", &self.circuit_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PhysicalConnection {
    /// Connect to `router` and run the link handshake
    pub async fn open(
        router: RouterDescriptor,
        connector: &dyn Connector,
        timeout: Duration,
    ) -> Result<Arc<Self>> {
        debug!("Opening connection to {} ({})", router.identity, router.nickname);

        let stream = tokio::time::timeout(timeout, connector.connect(&router))
            .await
            .map_err(|_| OnionError::transport(format!("connect to {} timed out", router.identity)))??;
        let (mut reader, mut writer) = tokio::io::split(stream);

        tokio::time::timeout(timeout, link_handshake(&router, &mut reader, &mut writer))
            .await
            .map_err(|_| {
                OnionError::transport(format!("link handshake with {} timed out", router.identity))
            })??;

        let (outbound, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            router,
            outbound,
            circuits: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            reader: Mutex::new(None),
        });

        tokio::spawn(write_loop(writer, rx, Arc::downgrade(&connection)));
        let demux = ConnectionDemultiplexer::new(Arc::downgrade(&connection));
        *lock(&connection.reader) = Some(tokio::spawn(demux.run(reader)));

        info!("Connected to {}", connection.router.identity);
        Ok(connection)
    }

    pub fn router(&self) -> &RouterDescriptor {
        &self.router
    }

    pub fn identity(&self) -> RouterIdentity {
        self.router.identity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue a cell for the writer task
    pub fn send_cell(&self, cell: Cell) -> Result<()> {
        if self.is_closed() {
            return Err(OnionError::transport(format!(
                "connection to {} is closed",
                self.router.identity
            )));
        }
        self.outbound
            .send(Outbound::Cell(cell))
            .map_err(|_| OnionError::transport("connection writer has stopped"))
    }

    /// Reserve a fresh circuit id and register the circuit built for it
    pub fn register_circuit<F>(&self, make: F) -> Result<Arc<Circuit>>
    where
        F: FnOnce(u32) -> Arc<Circuit>,
    {
        let mut circuits = lock(&self.circuits);
        if self.is_closed() {
            return Err(OnionError::transport(format!(
                "connection to {} is closed",
                self.router.identity
            )));
        }

        let mut rng = rand::thread_rng();
        let id = (0..MAX_CIRC_ID_ATTEMPTS)
            .map(|_| rng.gen::<u32>() | CIRC_ID_INITIATOR_BIT)
            .find(|id| !circuits.contains_key(id))
            .ok_or_else(|| OnionError::internal("no free circuit id on connection"))?;

        let circuit = make(id);
        circuits.insert(id, circuit.clone());
        debug!("Registered circuit {:#010x} on {}", id, self.router.identity);
        Ok(circuit)
    }

    pub fn circuit(&self, id: u32) -> Option<Arc<Circuit>> {
        lock(&self.circuits).get(&id).cloned()
    }

    pub fn circuit_count(&self) -> usize {
        lock(&self.circuits).len()
    }

    /// Detach a circuit; the connection closes once none remain
    pub fn remove_circuit(&self, id: u32) {
        let now_empty = {
            let mut circuits = lock(&self.circuits);
            circuits.remove(&id);
            circuits.is_empty()
        };
        if now_empty {
            debug!("Last circuit left {}, closing connection", self.router.identity);
            self.close();
        }
    }

    /// Stop both tasks and tear down every circuit still registered.
    ///
    /// Idempotent. Cells already queued are flushed before the writer exits.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.outbound.send(Outbound::Shutdown);
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }

        let orphans: Vec<Arc<Circuit>> = lock(&self.circuits).drain().map(|(_, c)| c).collect();
        if !orphans.is_empty() {
            warn!(
                "Connection to {} closed with {} circuits attached",
                self.router.identity,
                orphans.len()
            );
        }
        for circuit in orphans {
            circuit.handle_transport_closed();
        }
        info!("Closed connection to {}", self.router.identity);
    }
}

impl Drop for PhysicalConnection {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
    }
}

/// VERSIONS exchange, then wait for the responder's NETINFO and answer it
async fn link_handshake<R, W>(router: &RouterDescriptor, reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_versions(writer, &[protocol::LINK_VERSION]).await?;
    let offered = read_versions(reader).await?;
    if !offered.contains(&protocol::LINK_VERSION) {
        return Err(OnionError::protocol(format!(
            "{} offers link versions {:?}, need {}",
            router.identity,
            offered,
            protocol::LINK_VERSION
        )));
    }

    loop {
        let cell = read_cell(reader)
            .await?
            .ok_or_else(|| OnionError::transport("connection closed during link setup"))?;
        match cell.command {
            CellCommand::Netinfo => break,
            CellCommand::Certs | CellCommand::AuthChallenge => {
                debug!("Skipping {} from {}", cell.command, router.identity)
            }
            command if command.is_padding() => {}
            other => return Err(OnionError::unexpected("NETINFO", other.to_string())),
        }
    }

    write_cell(writer, &Cell::netinfo(router.address)).await?;
    writer.flush().await?;
    Ok(())
}

async fn write_loop(
    mut writer: WriteHalf<BoxedCellStream>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    connection: Weak<PhysicalConnection>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            Outbound::Cell(cell) => {
                if let Err(e) = write_cell(&mut writer, &cell).await {
                    warn!("Write failed: {}", e);
                    if let Some(connection) = connection.upgrade() {
                        connection.close();
                    }
                    break;
                }
            }
            Outbound::Shutdown => break,
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockNetwork, TestNetwork};

    #[tokio::test]
    async fn test_open_completes_link_handshake() {
        let net = TestNetwork::new(3);
        let conn = PhysicalConnection::open(
            net.routers[0].clone(),
            net.mock.as_ref(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(!conn.is_closed());
        assert_eq!(conn.identity(), net.routers[0].identity);
    }

    #[tokio::test]
    async fn test_unreachable_router_fails_to_open() {
        let net = TestNetwork::new(3);
        net.mock.set_unreachable(net.routers[1].identity);
        let err = PhysicalConnection::open(
            net.routers[1].clone(),
            net.mock.as_ref(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_circuit_ids_are_initiator_ids_and_unique() {
        let net = TestNetwork::new(3);
        let conn = PhysicalConnection::open(
            net.routers[0].clone(),
            net.mock.as_ref(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..32 {
            let circuit = net.circuit_on(&conn);
            assert_ne!(circuit.id(), 0);
            assert!(circuit.id() & CIRC_ID_INITIATOR_BIT != 0);
            assert!(seen.insert(circuit.id()));
        }
        assert_eq!(conn.circuit_count(), 32);
    }

    #[tokio::test]
    async fn test_removing_last_circuit_closes_connection() {
        let net = TestNetwork::new(3);
        let conn = PhysicalConnection::open(
            net.routers[0].clone(),
            net.mock.as_ref(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let a = net.circuit_on(&conn);
        let b = net.circuit_on(&conn);

        conn.remove_circuit(a.id());
        assert!(!conn.is_closed());
        conn.remove_circuit(b.id());
        assert!(conn.is_closed());
        assert!(conn.send_cell(Cell::padding()).is_err());
    }

    #[tokio::test]
    async fn test_close_tears_down_attached_circuits() {
        let net = TestNetwork::new(3);
        let conn = PhysicalConnection::open(
            net.routers[0].clone(),
            net.mock.as_ref(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let circuit = net.circuit_on(&conn);

        conn.close();
        conn.close();
        assert!(circuit.is_closed());
        assert_eq!(conn.circuit_count(), 0);
    }

    #[tokio::test]
    async fn test_peer_hangup_closes_connection() {
        let net = TestNetwork::new(3);
        let conn = PhysicalConnection::open(
            net.routers[0].clone(),
            net.mock.as_ref(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let circuit = net.circuit_on(&conn);

        net.mock.hang_up(net.routers[0].identity);
        MockNetwork::wait_for(|| conn.is_closed()).await;
        assert!(circuit.is_closed());
    }
}
