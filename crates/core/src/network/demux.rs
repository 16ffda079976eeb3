use super::PhysicalConnection;
use crate::cell::{read_cell, Cell, CellCommand};
use std::sync::Weak;
use tokio::io::AsyncRead;
use tracing::{debug, info, trace};

/// Single reader of one physical connection.
///
/// Decodes cells in arrival order and hands each to the circuit whose id
/// it carries. Relay cells are further routed to streams by the circuit.
pub struct ConnectionDemultiplexer {
    connection: Weak<PhysicalConnection>,
}

impl ConnectionDemultiplexer {
    pub fn new(connection: Weak<PhysicalConnection>) -> Self {
        Self { connection }
    }

    /// Read until the transport fails or the connection goes away
    pub async fn run<R>(self, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            match read_cell(&mut reader).await {
                Ok(Some(cell)) => {
                    if !self.dispatch(cell) {
                        return;
                    }
                }
                Ok(None) => {
                    debug!("Peer closed the connection");
                    break;
                }
                Err(e) => {
                    info!("Connection read failed: {}", e);
                    break;
                }
            }
        }

        if let Some(connection) = self.connection.upgrade() {
            connection.close();
        }
    }

    /// Route one cell; returns false once the connection is gone
    fn dispatch(&self, cell: Cell) -> bool {
        if cell.command.is_padding() {
            trace!("Dropping padding");
            return true;
        }

        match cell.command {
            CellCommand::Versions
            | CellCommand::Netinfo
            | CellCommand::Certs
            | CellCommand::AuthChallenge
            | CellCommand::Authenticate
            | CellCommand::PaddingNegotiate => {
                debug!("Ignoring late {} cell", cell.command);
                return true;
            }
            _ => {}
        }

        let Some(connection) = self.connection.upgrade() else {
            return false;
        };
        let Some(circuit) = connection.circuit(cell.circ_id) else {
            debug!(
                "Discarding {} for unknown circuit {:#010x} on {}",
                cell.command,
                cell.circ_id,
                connection.identity()
            );
            return true;
        };
        drop(connection);

        if cell.command == CellCommand::Destroy {
            circuit.handle_destroy(cell.reason());
        } else {
            circuit.process_cell(cell);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::destroy_reason;
    use crate::testing::{MockNetwork, TestNetwork};
    use std::time::Duration;

    #[tokio::test]
    async fn test_destroy_closes_target_circuit_only() {
        let net = TestNetwork::new(3);
        let conn = net.open_connection(0).await;
        let doomed = net.circuit_on(&conn);
        let survivor = net.circuit_on(&conn);

        net.mock.inject(
            net.routers[0].identity,
            Cell::destroy(doomed.id(), destroy_reason::PROTOCOL),
        );
        MockNetwork::wait_for(|| doomed.is_closed()).await;

        assert_eq!(doomed.destroy_reason(), Some(destroy_reason::PROTOCOL));
        assert!(!survivor.is_closed());
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_unknown_circuit_and_padding_are_discarded() {
        let net = TestNetwork::new(3);
        let conn = net.open_connection(0).await;
        let circuit = net.circuit_on(&conn);

        net.mock.inject(net.routers[0].identity, Cell::padding());
        net.mock.inject(
            net.routers[0].identity,
            Cell::destroy(circuit.id() ^ 0x1, destroy_reason::FINISHED),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!circuit.is_closed());
        assert!(!conn.is_closed());
    }
}
