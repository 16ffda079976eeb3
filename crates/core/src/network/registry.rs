use super::PhysicalConnection;
use crate::lock;
use crate::transport::Connector;
use onionpath_common::{protocol, Result, RouterDescriptor, RouterIdentity};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::debug;

/// At most one live connection per relay identity.
///
/// Entries are weak: circuits keep their connection alive, and a connection
/// that loses its last circuit closes itself and is pruned here.
pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    connections: Mutex<HashMap<RouterIdentity, Weak<PhysicalConnection>>>,
    /// Serializes concurrent opens toward the same relay
    opening: Mutex<HashMap<RouterIdentity, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_timeout(
            connector,
            Duration::from_secs(protocol::CONNECTION_TIMEOUT_SECS),
        )
    }

    pub fn with_timeout(connector: Arc<dyn Connector>, connect_timeout: Duration) -> Self {
        Self {
            connector,
            connect_timeout,
            connections: Mutex::new(HashMap::new()),
            opening: Mutex::new(HashMap::new()),
        }
    }

    /// Live connection to `identity`, if one is registered
    pub fn get(&self, identity: &RouterIdentity) -> Option<Arc<PhysicalConnection>> {
        lock(&self.connections)
            .get(identity)
            .and_then(Weak::upgrade)
            .filter(|conn| !conn.is_closed())
    }

    /// Reuse the live connection to `router` or open a new one
    pub async fn get_or_open(&self, router: &RouterDescriptor) -> Result<Arc<PhysicalConnection>> {
        if let Some(conn) = self.get(&router.identity) {
            return Ok(conn);
        }

        let gate = lock(&self.opening)
            .entry(router.identity)
            .or_default()
            .clone();
        let _opening = gate.lock().await;

        // Someone else may have finished opening while we waited
        if let Some(conn) = self.get(&router.identity) {
            return Ok(conn);
        }

        let result =
            PhysicalConnection::open(router.clone(), self.connector.as_ref(), self.connect_timeout)
                .await;
        // Publish before releasing the gate so late callers find the connection
        if let Ok(conn) = &result {
            lock(&self.connections).insert(router.identity, Arc::downgrade(conn));
        }
        lock(&self.opening).remove(&router.identity);
        result
    }

    /// Forget closed or dropped connections, returning how many went away
    pub fn prune(&self) -> usize {
        let mut connections = lock(&self.connections);
        let before = connections.len();
        connections.retain(|_, weak| weak.upgrade().map_or(false, |conn| !conn.is_closed()));
        let pruned = before - connections.len();
        if pruned > 0 {
            debug!("Pruned {} idle connections", pruned);
        }
        pruned
    }

    /// Close every live connection and the circuits riding on them
    pub fn close_all(&self) {
        let live: Vec<Arc<PhysicalConnection>> = lock(&self.connections)
            .drain()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();
        for conn in live {
            conn.close();
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.connections)
            .values()
            .filter(|weak| weak.upgrade().map_or(false, |conn| !conn.is_closed()))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
