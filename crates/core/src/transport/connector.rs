use async_trait::async_trait;
use onionpath_common::{OnionError, Result, RouterDescriptor};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Byte stream a physical connection runs over
pub trait CellStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> CellStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedCellStream = Box<dyn CellStream>;

/// Opens the byte stream to a relay's OR port
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, router: &RouterDescriptor) -> Result<BoxedCellStream>;
}

/// Plain TCP connector for lab networks
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(
            onionpath_common::protocol::CONNECTION_TIMEOUT_SECS,
        ))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, router: &RouterDescriptor) -> Result<BoxedCellStream> {
        let addr = router.socket_addr();
        debug!("Connecting to {} at {}", router.identity, addr);

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| OnionError::transport(format!("connect to {} timed out", addr)))?
            .map_err(|e| OnionError::transport(format!("connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onionpath_common::RouterIdentity;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connector_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = RouterDescriptor::new(RouterIdentity::from_bytes([1; 20]), "local", addr);

        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            socket.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let stream = TcpConnector::default().connect(&router).await.unwrap();
        drop(stream);
        assert!(accept.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tcp_connector_reports_refusal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let router = RouterDescriptor::new(RouterIdentity::from_bytes([2; 20]), "gone", addr);

        let err = TcpConnector::new(Duration::from_secs(2))
            .connect(&router)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, OnionError::Transport(_)));
    }
}
