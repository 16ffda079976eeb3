pub mod cell;
pub mod circuit;
pub mod directory;
pub mod guard;
pub mod network;
pub mod transport;

#[cfg(test)]
mod testing;

use std::sync::{Mutex, MutexGuard};

pub use cell::{Cell, CellCommand, CellError, RelayCell, RelayCommand};

// Re-export circuit types
pub use circuit::{
    Circuit, CircuitBuilder, CircuitEvent, CircuitId, CircuitParams, CircuitPool, CircuitState,
    CryptoError, HandshakeKind, HopCryptoState, HopRole, IncomingStream, NodeUsage, RouteBuilder,
    RouteRequestProperties, Stream,
};

pub use directory::{RouterDirectory, StaticDirectory};
pub use guard::{GuardEntry, GuardSelector, GuardStore, JsonFileGuardStore, MemoryGuardStore};
pub use network::{ConnectionRegistry, PhysicalConnection};
pub use transport::{BoxedCellStream, CellStream, Connector, TcpConnector};

/// Lock a std mutex, recovering the data if a panicking holder poisoned it.
///
/// Guards taken through this are never held across an `.await`.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
