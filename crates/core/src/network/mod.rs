/// Physical connections and link-level cell routing
///
/// - `PhysicalConnection`: one link to a relay, its writer task and its circuit map
/// - `ConnectionRegistry`: at most one connection per relay identity
/// - `ConnectionDemultiplexer`: the single reader feeding circuits

mod connection;
mod demux;
mod registry;

pub use connection::PhysicalConnection;
pub use demux::ConnectionDemultiplexer;
pub use registry::ConnectionRegistry;
