use crate::cell::{CellCommand, RelayCell, RelayCommand};
use onionpath_common::{OnionError, Result};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::debug;

/// A cell delivered to a circuit after link-level demultiplexing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedCell {
    /// CREATED, CREATED_FAST or CREATED2 answering the first hop
    Created { command: CellCommand, payload: Vec<u8> },
    /// Relay cell recognized by hop `hop`
    Relay { hop: usize, cell: RelayCell },
}

impl QueuedCell {
    fn describe(&self) -> String {
        match self {
            Self::Created { command, .. } => command.to_string(),
            Self::Relay { cell, .. } => cell.command.to_string(),
        }
    }

    pub fn relay_command(&self) -> Option<RelayCommand> {
        match self {
            Self::Relay { cell, .. } => Some(cell.command),
            Self::Created { .. } => None,
        }
    }
}

/// What a blocked receiver is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Created,
    Relay(RelayCommand),
    Any,
}

impl CellKind {
    fn matches(&self, cell: &QueuedCell) -> bool {
        match (self, cell) {
            (Self::Any, _) => true,
            (Self::Created, QueuedCell::Created { .. }) => true,
            (Self::Relay(expected), QueuedCell::Relay { cell, .. }) => *expected == cell.command,
            _ => false,
        }
    }
}

impl std::fmt::Display for CellKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Relay(cmd) => write!(f, "{}", cmd),
            Self::Any => write!(f, "any cell"),
        }
    }
}

/// Handlers that may claim a cell before it reaches the queue
#[derive(Debug)]
pub enum CellInterceptor {
    /// Hand relay cells with one of `commands` to a subscriber
    Forward {
        commands: Vec<RelayCommand>,
        sink: mpsc::UnboundedSender<QueuedCell>,
    },
    /// Swallow circuit-level DROP cells
    DropPadding,
}

impl CellInterceptor {
    /// Claim the cell, or hand it back untouched
    fn try_claim(&mut self, cell: QueuedCell) -> std::result::Result<(), QueuedCell> {
        match self {
            Self::Forward { commands, sink } => match cell.relay_command() {
                Some(cmd) if commands.contains(&cmd) => sink.send(cell).map_err(|err| err.0),
                _ => Err(cell),
            },
            Self::DropPadding => match cell.relay_command() {
                Some(RelayCommand::Drop) => Ok(()),
                _ => Err(cell),
            },
        }
    }

    fn is_stale(&self) -> bool {
        match self {
            Self::Forward { sink, .. } => sink.is_closed(),
            Self::DropPadding => false,
        }
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    cells: VecDeque<QueuedCell>,
    interceptors: Vec<CellInterceptor>,
    closed: bool,
    destroy_reason: Option<u8>,
}

/// Per-circuit FIFO mailbox with typed, bounded-wait receive
#[derive(Debug, Default)]
pub struct CellQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl CellQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_interceptor(&self, interceptor: CellInterceptor) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.closed {
                return;
            }
            inner.interceptors.push(interceptor);
        }
    }

    /// Offer the cell to interceptors in registration order, else enqueue it
    pub fn push(&self, cell: QueuedCell) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.closed {
            debug!("Dropping {} for closed queue", cell.describe());
            return;
        }

        inner.interceptors.retain(|i| !i.is_stale());
        let mut cell = cell;
        for interceptor in inner.interceptors.iter_mut() {
            match interceptor.try_claim(cell) {
                Ok(()) => return,
                Err(unclaimed) => cell = unclaimed,
            }
        }

        inner.cells.push_back(cell);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Wait for the next cell, which must be of kind `expected`.
    ///
    /// The head cell is consumed whether or not it matches.
    pub async fn receive(&self, expected: CellKind, timeout: Duration) -> Result<QueuedCell> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_take(expected) {
                return result;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // A cell may have raced the deadline
                return self
                    .try_take(expected)
                    .unwrap_or(Err(OnionError::NoAnswer(timeout.as_millis() as u64)));
            }
        }
    }

    fn try_take(&self, expected: CellKind) -> Option<Result<QueuedCell>> {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return Some(Err(OnionError::internal("cell queue lock poisoned"))),
        };
        if inner.closed {
            return Some(Err(match inner.destroy_reason {
                Some(reason) => OnionError::Destroyed { reason },
                None => OnionError::CircuitClosed,
            }));
        }

        let cell = inner.cells.pop_front()?;
        if expected.matches(&cell) {
            return Some(Ok(cell));
        }

        Some(Err(match &cell {
            QueuedCell::Relay { cell, .. } if cell.command == RelayCommand::End => {
                OnionError::StreamEnded {
                    reason: cell.reason(),
                }
            }
            QueuedCell::Relay { cell, .. } if cell.command == RelayCommand::Truncated => {
                OnionError::Truncated {
                    reason: cell.reason(),
                }
            }
            other => OnionError::unexpected(expected.to_string(), other.describe()),
        }))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.cells.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().map(|inner| inner.closed).unwrap_or(true)
    }

    /// Drain pending cells, release interceptors and fail every receiver.
    ///
    /// Idempotent; the first reason recorded wins.
    pub fn close(&self, destroy_reason: Option<u8>) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.destroy_reason = destroy_reason;
            inner.cells.clear();
            inner.interceptors.clear();
        }
        self.notify.notify_waiters();
    }
}
