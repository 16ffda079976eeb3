use super::queue::QueuedCell;
use super::stream::{IncomingStream, Stream};
use super::types::Circuit;
use crate::cell::{end_reason, parse_begin, RelayCell, RelayCommand};
use std::sync::Arc;
use tracing::{debug, warn};

/// Only this INTRODUCE2 version is handled
const INTRODUCE_VERSION: u8 = 2;

/// Where a recognized relay cell goes
#[derive(Debug)]
pub enum RelayAction {
    /// Deliver to an open stream
    Stream(Arc<Stream>),

    /// BEGIN for a new stream on an accepting circuit
    Admit,

    /// Circuit-level SENDME refilling the send window
    CircuitSendme,

    /// Circuit-level cell for the queue and its interceptors
    Queue,

    /// Discard, with the reason logged
    Discard(&'static str),
}

/// Routes recognized relay cells to streams or to the circuit
pub struct RelayHandler<'a> {
    circuit: &'a Arc<Circuit>,
}

impl<'a> RelayHandler<'a> {
    pub fn new(circuit: &'a Arc<Circuit>) -> Self {
        Self { circuit }
    }

    pub fn classify(&self, cell: &RelayCell) -> RelayAction {
        if cell.stream_id != 0 {
            if let Some(stream) = self.circuit.stream(cell.stream_id) {
                return RelayAction::Stream(stream);
            }
            if cell.command == RelayCommand::Begin && self.circuit.acceptor().is_some() {
                return RelayAction::Admit;
            }
            return RelayAction::Discard("unknown stream");
        }

        match cell.command {
            RelayCommand::Sendme => RelayAction::CircuitSendme,
            RelayCommand::Introduce2 => match cell.data.first() {
                Some(&INTRODUCE_VERSION) => RelayAction::Queue,
                _ => RelayAction::Discard("unsupported INTRODUCE2 version"),
            },
            RelayCommand::Data | RelayCommand::Begin | RelayCommand::Connected => {
                RelayAction::Discard("stream command without a stream id")
            }
            _ => RelayAction::Queue,
        }
    }

    /// Handle a cell recognized by hop `hop`
    pub fn handle(&self, hop: usize, cell: RelayCell) {
        let circ_id = self.circuit.id();

        if cell.command == RelayCommand::Data {
            match self.circuit.recv_window().on_data() {
                Ok(true) => self.send_circuit_sendme(hop),
                Ok(false) => {}
                Err(e) => {
                    warn!("Circuit {:#010x}: {}", circ_id, e);
                    self.circuit.protocol_violation();
                    return;
                }
            }
        }

        match self.classify(&cell) {
            RelayAction::Stream(stream) => stream.process_cell(cell),
            RelayAction::Admit => self.admit(hop, cell),
            RelayAction::CircuitSendme => {
                if let Err(e) = self.circuit.send_window().on_sendme() {
                    warn!("Circuit {:#010x}: {}", circ_id, e);
                    self.circuit.protocol_violation();
                }
            }
            RelayAction::Queue => self.circuit.queue().push(QueuedCell::Relay { hop, cell }),
            RelayAction::Discard(why) => debug!(
                "Circuit {:#010x}: dropping {} from hop {} ({})",
                circ_id, cell.command, hop, why
            ),
        }
    }

    fn send_circuit_sendme(&self, hop: usize) {
        let sendme = RelayCell::control(RelayCommand::Sendme, Vec::new());
        if let Err(e) = self.circuit.send_relay_cell(&sendme, Some(hop), false) {
            debug!("Circuit {:#010x}: SENDME not sent: {}", self.circuit.id(), e);
        }
    }

    /// Accept a stream the far end opened
    fn admit(&self, hop: usize, cell: RelayCell) {
        let refuse = |reason: u8| {
            let end = RelayCell::new(RelayCommand::End, cell.stream_id, vec![reason]);
            let _ = self.circuit.send_relay_cell(&end, Some(hop), false);
        };

        let (target, port) = match parse_begin(&cell.data) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("Circuit {:#010x}: bad BEGIN: {}", self.circuit.id(), e);
                refuse(end_reason::TORPROTOCOL);
                return;
            }
        };
        let (Some(acceptor), Some(stream)) = (
            self.circuit.acceptor(),
            self.circuit.admit_stream(cell.stream_id, hop),
        ) else {
            refuse(end_reason::RESOURCELIMIT);
            return;
        };

        let connected = RelayCell::new(RelayCommand::Connected, stream.id(), Vec::new());
        if let Err(e) = self.circuit.send_relay_cell(&connected, Some(hop), false) {
            debug!("Circuit {:#010x}: CONNECTED not sent: {}", self.circuit.id(), e);
            stream.force_close();
            self.circuit.remove_stream(stream.id());
            return;
        }

        let incoming = IncomingStream {
            stream: stream.clone(),
            target,
            port,
        };
        if acceptor.send(incoming).is_err() {
            stream.close();
        }
    }
}
