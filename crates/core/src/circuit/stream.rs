/// Logical byte streams multiplexed on a circuit
///
/// A stream owns no crypto: its cells ride the hop ciphers of the circuit
/// and are addressed to one hop (the exit, or the far end of a rendezvous).

use super::flow_control::{ReceiveWindow, SendWindow};
use super::types::Circuit;
use crate::cell::{end_reason, RelayCell, RelayCommand};
use crate::lock;
use onionpath_common::{flow, protocol, OnionError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A stream the far end opened on an accepting circuit
#[derive(Debug)]
pub struct IncomingStream {
    pub stream: Arc<Stream>,
    pub target: String,
    pub port: u16,
}

#[derive(Debug, Default)]
struct Inbox {
    data: VecDeque<Vec<u8>>,
    connected: bool,
    ended: Option<u8>,
    closed: bool,
}

pub struct Stream {
    id: u16,
    hop: usize,
    circuit: Weak<Circuit>,
    inbox: Mutex<Inbox>,
    notify: Notify,
    send_window: SendWindow,
    recv_window: ReceiveWindow,
    end_sent: AtomicBool,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("hop", &self.hop)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Stream {
    pub fn new(id: u16, hop: usize, circuit: Weak<Circuit>) -> Self {
        Self {
            id,
            hop,
            circuit,
            inbox: Mutex::new(Inbox::default()),
            notify: Notify::new(),
            send_window: SendWindow::new(
                flow::STREAM_WINDOW_START,
                flow::STREAM_WINDOW_INCREMENT,
            ),
            recv_window: ReceiveWindow::new(
                flow::STREAM_WINDOW_START,
                flow::STREAM_WINDOW_INCREMENT,
            ),
            end_sent: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Index of the hop this stream talks to
    pub fn hop(&self) -> usize {
        self.hop
    }

    pub fn is_closed(&self) -> bool {
        let inbox = lock(&self.inbox);
        inbox.closed || inbox.ended.is_some()
    }

    /// Reason from the peer's END, if it sent one
    pub fn end_reason(&self) -> Option<u8> {
        lock(&self.inbox).ended
    }

    fn circuit(&self) -> Result<Arc<Circuit>> {
        self.circuit.upgrade().ok_or(OnionError::CircuitClosed)
    }

    pub(crate) fn mark_connected(&self) {
        lock(&self.inbox).connected = true;
        self.notify.notify_waiters();
    }

    /// Handle a relay cell addressed to this stream
    pub(crate) fn process_cell(&self, cell: RelayCell) {
        match cell.command {
            RelayCommand::Data => {
                match self.recv_window.on_data() {
                    Ok(true) => self.send_control(RelayCommand::Sendme, Vec::new()),
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Stream {}: {}", self.id, e);
                        self.end_locally(end_reason::TORPROTOCOL);
                        return;
                    }
                }
                lock(&self.inbox).data.push_back(cell.data);
                self.notify.notify_waiters();
            }
            RelayCommand::Connected => self.mark_connected(),
            RelayCommand::End => {
                let reason = cell.reason();
                debug!("Stream {} ended by peer (reason {})", self.id, reason);
                lock(&self.inbox).ended = Some(reason);
                // The peer already closed its side
                self.end_sent.store(true, Ordering::Release);
                self.send_window.close();
                self.notify.notify_waiters();
                if let Ok(circuit) = self.circuit() {
                    circuit.remove_stream(self.id);
                }
            }
            RelayCommand::Sendme => {
                if let Err(e) = self.send_window.on_sendme() {
                    warn!("Stream {}: {}", self.id, e);
                    self.end_locally(end_reason::TORPROTOCOL);
                }
            }
            other => debug!("Stream {}: ignoring {}", self.id, other),
        }
    }

    /// Wait for CONNECTED, failing on END or timeout
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inbox = lock(&self.inbox);
                if let Some(reason) = inbox.ended {
                    return Err(OnionError::StreamEnded { reason });
                }
                if inbox.closed {
                    return Err(OnionError::CircuitClosed);
                }
                if inbox.connected {
                    return Ok(());
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(OnionError::NoAnswer(timeout.as_millis() as u64));
            }
        }
    }

    /// Send `data` as DATA cells, waiting on circuit and stream windows
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(protocol::RELAY_DATA_LEN) {
            if self.is_closed() {
                return Err(OnionError::CircuitClosed);
            }
            let circuit = self.circuit()?;
            self.send_window.acquire().await?;
            if let Err(e) = circuit.send_window().acquire().await {
                self.send_window.release();
                return Err(e);
            }
            let cell = RelayCell::new(RelayCommand::Data, self.id, chunk.to_vec());
            if let Err(e) = circuit.send_relay_cell(&cell, Some(self.hop), false) {
                circuit.send_window().release();
                self.send_window.release();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Next chunk of data in arrival order; `None` once the stream ended
    pub async fn recv(&self) -> Result<Option<Vec<u8>>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inbox = lock(&self.inbox);
                if let Some(chunk) = inbox.data.pop_front() {
                    return Ok(Some(chunk));
                }
                if inbox.ended.is_some() || inbox.closed {
                    return Ok(None);
                }
            }

            notified.await;
        }
    }

    /// Send END once and detach from the circuit
    pub fn close(&self) {
        if !self.end_sent.swap(true, Ordering::AcqRel) {
            self.send_control(RelayCommand::End, vec![end_reason::DONE]);
        }
        self.mark_closed();
        if let Ok(circuit) = self.circuit() {
            circuit.remove_stream(self.id);
        }
    }

    /// Close without telling the peer; used when the circuit goes away
    pub(crate) fn force_close(&self) {
        self.end_sent.store(true, Ordering::Release);
        self.mark_closed();
    }

    fn end_locally(&self, reason: u8) {
        if !self.end_sent.swap(true, Ordering::AcqRel) {
            self.send_control(RelayCommand::End, vec![reason]);
        }
        self.mark_closed();
        if let Ok(circuit) = self.circuit() {
            circuit.remove_stream(self.id);
        }
    }

    fn mark_closed(&self) {
        lock(&self.inbox).closed = true;
        self.send_window.close();
        self.notify.notify_waiters();
    }

    fn send_control(&self, command: RelayCommand, data: Vec<u8>) {
        let Ok(circuit) = self.circuit() else {
            return;
        };
        let cell = RelayCell::new(command, self.id, data);
        if let Err(e) = circuit.send_relay_cell(&cell, Some(self.hop), false) {
            debug!("Stream {}: {} not sent: {}", self.id, command, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Behaviour, TestNetwork};

    #[tokio::test]
    async fn test_large_payload_is_chunked_and_reassembled() {
        let net = TestNetwork::new(3);
        let circuit = net.build_circuit(&[0, 1, 2], true).await.unwrap();
        let stream = circuit.open_stream("example.com", 80).await.unwrap();

        let payload: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
        stream.send(&payload).await.unwrap();

        let mut echoed = Vec::new();
        while echoed.len() < payload.len() {
            echoed.extend(stream.recv().await.unwrap().unwrap());
        }
        assert_eq!(echoed, payload);
    }

    #[tokio::test]
    async fn test_send_blocks_without_sendme() {
        let net = TestNetwork::new(3);
        net.mock
            .set_behaviour(net.routers[2].identity, Behaviour::WithholdSendme);
        let circuit = net.build_circuit(&[0, 1, 2], true).await.unwrap();
        let stream = circuit.open_stream("example.com", 80).await.unwrap();

        let window = flow::STREAM_WINDOW_START as usize;
        let filler = vec![0u8; protocol::RELAY_DATA_LEN * window];
        stream.send(&filler).await.unwrap();

        let blocked = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.send(b"one more").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!blocked.is_finished());

        circuit.close(true);
        assert!(blocked.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_send_keeps_the_circuit_window() {
        let net = TestNetwork::new(3);
        net.mock
            .set_behaviour(net.routers[2].identity, Behaviour::WithholdSendme);
        let circuit = net.build_circuit(&[0, 1, 2], true).await.unwrap();
        let stream = circuit.open_stream("example.com", 80).await.unwrap();

        let window = flow::STREAM_WINDOW_START as usize;
        let filler = vec![0u8; protocol::RELAY_DATA_LEN * window];
        stream.send(&filler).await.unwrap();
        let before = circuit.send_window().value();

        let blocked = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.send(b"x").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        stream.close();

        assert!(blocked.await.unwrap().is_err());
        assert_eq!(circuit.send_window().value(), before);
        assert!(!circuit.is_closed());
    }

    #[tokio::test]
    async fn test_peer_end_finishes_recv() {
        let net = TestNetwork::new(3);
        let circuit = net.build_circuit(&[0, 1, 2], true).await.unwrap();
        let stream = circuit.open_stream("example.com", 80).await.unwrap();

        net.mock.send_relay(
            net.routers[0].identity,
            circuit.id(),
            2,
            RelayCell::new(RelayCommand::End, stream.id(), vec![end_reason::DONE]),
        );
        assert_eq!(stream.recv().await.unwrap(), None);
        assert_eq!(stream.end_reason(), Some(end_reason::DONE));
        assert_eq!(circuit.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_close_detaches_once() {
        let net = TestNetwork::new(3);
        let circuit = net.build_circuit(&[0, 1, 2], true).await.unwrap();
        let stream = circuit.open_stream("example.com", 80).await.unwrap();

        stream.close();
        stream.close();
        assert!(stream.is_closed());
        assert!(stream.send(b"late").await.is_err());
        assert_eq!(circuit.stream_count(), 0);
        assert!(!circuit.is_closed());
    }
}
