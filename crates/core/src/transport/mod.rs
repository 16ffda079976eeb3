/// Transport seam for physical connections
///
/// The engine speaks cells over any ordered byte stream a `Connector`
/// hands it; securing that stream is the connector's job.

mod connector;

pub use connector::{BoxedCellStream, CellStream, Connector, TcpConnector};
