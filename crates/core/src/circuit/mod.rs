mod builder;
mod crypto;
mod flow_control;
mod path_selection;
mod pool;
mod queue;
mod relay;
mod stream;
mod types;

pub use builder::CircuitBuilder;
pub use crypto::{CryptoError, HandshakeKind, HopCryptoState, HopHandshake, HopRole};
pub use flow_control::{ReceiveWindow, SendWindow};
pub use path_selection::{NodeUsage, RouteBuilder, RouteRequestProperties};
pub use pool::CircuitPool;
pub use queue::{CellInterceptor, CellKind, CellQueue, QueuedCell};
pub use relay::{RelayAction, RelayHandler};
pub use stream::{IncomingStream, Stream};
pub use types::{Circuit, CircuitEvent, CircuitId, CircuitParams, CircuitState};
