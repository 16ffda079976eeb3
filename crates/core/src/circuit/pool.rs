/// Reuse-or-build entry point for circuits
///
/// The pool owns every circuit it hands out, the per-relay usage counters
/// and the connection registry. A request is served, in order of
/// preference, by an established circuit that fits it, by extending an
/// unused circuit to a pinned exit, or by racing several fresh builds.

use super::builder::CircuitBuilder;
use super::path_selection::{NodeUsage, RouteBuilder, RouteRequestProperties};
use super::types::{Circuit, CircuitEvent};
use crate::directory::RouterDirectory;
use crate::guard::{GuardSelector, GuardStore};
use crate::lock;
use crate::network::ConnectionRegistry;
use crate::transport::Connector;
use onionpath_common::{routing, ClientConfig, OnionError, Result, RouterIdentity};
use rand::distributions::{Distribution, WeightedIndex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Floor for the maintenance tick; a zero interval only disables throttling
const MIN_MAINTENANCE_TICK: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct PooledCircuit {
    circuit: Arc<Circuit>,
    /// Relays counted in `NodeUsage` for this circuit
    route: Vec<RouterIdentity>,
    exclusive: bool,
    /// Being extended for some request; not available to others
    extending: bool,
}

pub struct CircuitPool {
    config: ClientConfig,
    directory: Arc<dyn RouterDirectory>,
    registry: Arc<ConnectionRegistry>,
    guards: Arc<GuardSelector>,
    usage: Arc<NodeUsage>,
    builder: Arc<CircuitBuilder>,
    circuits: Mutex<Vec<PooledCircuit>>,
    events: broadcast::Sender<CircuitEvent>,
    shut_down: AtomicBool,
    shutdown_signal: Notify,
    background_builds: Arc<Semaphore>,
    last_background_build: Mutex<Option<Instant>>,
    maintenance_task: Mutex<Option<JoinHandle<()>>>,
}

impl CircuitPool {
    pub async fn new(
        config: ClientConfig,
        directory: Arc<dyn RouterDirectory>,
        connector: Arc<dyn Connector>,
        guard_store: Arc<dyn GuardStore>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let guards = Arc::new(
            GuardSelector::load(config.guards.clone(), directory.clone(), guard_store).await?,
        );
        let usage = Arc::new(NodeUsage::new());
        let routes = Arc::new(RouteBuilder::new(
            directory.clone(),
            guards.clone(),
            usage.clone(),
            config.max_circuits_per_node,
        ));
        let registry = Arc::new(ConnectionRegistry::new(connector));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let builder = Arc::new(CircuitBuilder::new(
            config.clone(),
            directory.clone(),
            registry.clone(),
            routes,
            guards.clone(),
            events.clone(),
        ));

        Ok(Arc::new(Self {
            background_builds: Arc::new(Semaphore::new(config.max_background_builds)),
            config,
            directory,
            registry,
            guards,
            usage,
            builder,
            circuits: Mutex::new(Vec::new()),
            events,
            shut_down: AtomicBool::new(false),
            shutdown_signal: Notify::new(),
            last_background_build: Mutex::new(None),
            maintenance_task: Mutex::new(None),
        }))
    }

    /// Circuit lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.events.subscribe()
    }

    pub fn guards(&self) -> &Arc<GuardSelector> {
        &self.guards
    }

    pub fn node_usage(&self) -> &Arc<NodeUsage> {
        &self.usage
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn circuits(&self) -> Vec<Arc<Circuit>> {
        lock(&self.circuits)
            .iter()
            .map(|pooled| pooled.circuit.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.circuits).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// A circuit fit for `props`, reused when allowed, built otherwise.
    ///
    /// An `exclusive` circuit is never handed to another request.
    pub async fn provide_circuit(
        &self,
        props: &RouteRequestProperties,
        exclusive: bool,
    ) -> Result<Arc<Circuit>> {
        if self.is_shut_down() {
            return Err(OnionError::Interrupted);
        }
        self.prune();

        if !exclusive {
            if let Some(circuit) = self.reuse(props) {
                debug!("Reusing circuit {:#010x}", circuit.id());
                return Ok(circuit);
            }
        }
        if let Some(circuit) = self.extend_unused(props, exclusive).await {
            return Ok(circuit);
        }
        self.build_parallel(props, exclusive).await
    }

    /// Pick among fitting established circuits.
    ///
    /// Circuits that already carried a stream to the requested port win,
    /// lowest ranking first; otherwise lower rankings are favoured at random.
    fn reuse(&self, props: &RouteRequestProperties) -> Option<Arc<Circuit>> {
        let candidates: Vec<Arc<Circuit>> = lock(&self.circuits)
            .iter()
            .filter(|pooled| !pooled.exclusive && !pooled.extending)
            .map(|pooled| pooled.circuit.clone())
            .collect();

        let fitting: Vec<Arc<Circuit>> = candidates
            .into_iter()
            .filter(|c| c.is_established() && !c.is_soft_closed())
            .filter(|c| c.stream_count() < self.config.streams_per_circuit)
            .filter(|c| {
                self.directory
                    .is_route_compatible(&c.route(), props, props.hidden_service)
            })
            .collect();
        if fitting.is_empty() {
            return None;
        }

        if let Some((_, port)) = props.exit_target {
            let served = fitting
                .iter()
                .filter(|c| c.has_served_port(port))
                .min_by(|a, b| a.ranking().total_cmp(&b.ranking()));
            if let Some(circuit) = served {
                return Some(circuit.clone());
            }
        }

        let weights: Vec<f64> = fitting
            .iter()
            .map(|c| 1.0 / (1.0 + c.ranking().max(0.0)))
            .collect();
        match WeightedIndex::new(&weights) {
            Ok(dist) => Some(fitting[dist.sample(&mut rand::thread_rng())].clone()),
            Err(_) => fitting.first().cloned(),
        }
    }

    /// Extend a circuit that never carried a stream to the pinned exit
    async fn extend_unused(
        &self,
        props: &RouteRequestProperties,
        exclusive: bool,
    ) -> Option<Arc<Circuit>> {
        let exit_id = props.exit_node?;
        let exit = self.directory.router(&exit_id)?;
        let related = self.directory.exclude_related_nodes(&exit);

        let circuit = {
            let mut circuits = lock(&self.circuits);
            let pooled = circuits.iter_mut().find(|pooled| {
                let c = &pooled.circuit;
                !pooled.exclusive
                    && !pooled.extending
                    && c.is_established()
                    && !c.is_soft_closed()
                    && c.streams_carried() == 0
                    && c.stream_count() == 0
                    && c.relay_early_remaining() > 0
                    && pooled.route.len() < routing::MAX_CIRCUIT_LENGTH
                    && pooled.route.iter().all(|id| !related.contains(id))
                    && pooled.route.iter().all(|id| !props.excluded.contains(id))
            })?;
            pooled.extending = true;
            pooled.circuit.clone()
        };

        let result = circuit.extend(&exit_id).await;
        {
            let mut circuits = lock(&self.circuits);
            if let Some(pooled) = circuits
                .iter_mut()
                .find(|pooled| Arc::ptr_eq(&pooled.circuit, &circuit))
            {
                pooled.extending = false;
                if result.is_ok() {
                    pooled.route.push(exit_id);
                    pooled.exclusive = exclusive;
                    self.usage.increment([&exit_id]);
                }
            }
        }

        match result {
            Ok(()) => {
                info!(
                    "Extended idle circuit {:#010x} to exit {}",
                    circuit.id(),
                    exit_id
                );
                Some(circuit)
            }
            Err(e) => {
                debug!("Could not extend idle circuit to {}: {}", exit_id, e);
                None
            }
        }
    }

    /// Race `parallel_builds` attempts; the first success wins
    async fn build_parallel(
        &self,
        props: &RouteRequestProperties,
        exclusive: bool,
    ) -> Result<Arc<Circuit>> {
        let shutdown = self.shutdown_signal.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();
        if self.is_shut_down() {
            return Err(OnionError::Interrupted);
        }

        let mut attempts = JoinSet::new();
        for _ in 0..self.config.parallel_builds.max(1) {
            let builder = self.builder.clone();
            let props = props.clone();
            attempts.spawn(async move { builder.build(&props).await });
        }

        let mut winner: Option<Arc<Circuit>> = None;
        let mut last_error = None;
        loop {
            let joined = tokio::select! {
                _ = &mut shutdown => {
                    attempts.abort_all();
                    return Err(OnionError::Interrupted);
                }
                joined = attempts.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            match joined {
                Ok(Ok(circuit)) if winner.is_none() => {
                    attempts.abort_all();
                    winner = Some(circuit);
                }
                // Finished before the abort landed; keep it for later requests
                Ok(Ok(extra)) => self.adopt(extra, false),
                Ok(Err(e)) => {
                    debug!("Build attempt failed: {}", e);
                    last_error = Some(e);
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => last_error = Some(OnionError::internal(e.to_string())),
            }
        }

        match winner {
            Some(circuit) => {
                self.adopt(circuit.clone(), exclusive);
                Ok(circuit)
            }
            None => {
                let error = last_error
                    .unwrap_or_else(|| OnionError::NoRouteFound("no build attempts ran".into()));
                warn!("Every build attempt failed: {}", error);
                Err(error)
            }
        }
    }

    fn adopt(&self, circuit: Arc<Circuit>, exclusive: bool) {
        if self.is_shut_down() {
            circuit.close(true);
            return;
        }
        let route = circuit.route_ids();
        self.usage.increment(&route);
        lock(&self.circuits).push(PooledCircuit {
            circuit,
            route,
            exclusive,
            extending: false,
        });
    }

    /// Forget closed circuits and connections, releasing usage counters
    pub fn prune(&self) -> usize {
        let removed: Vec<PooledCircuit> = {
            let mut circuits = lock(&self.circuits);
            let (closed, open): (Vec<_>, Vec<_>) = circuits
                .drain(..)
                .partition(|pooled| pooled.circuit.is_closed());
            *circuits = open;
            closed
        };
        for pooled in &removed {
            self.usage.decrement(&pooled.route);
        }
        self.registry.prune();
        if !removed.is_empty() {
            debug!("Pruned {} closed circuits", removed.len());
        }
        removed.len()
    }

    fn idle_count(&self) -> usize {
        lock(&self.circuits)
            .iter()
            .filter(|pooled| !pooled.exclusive && !pooled.extending)
            .filter(|pooled| {
                let c = &pooled.circuit;
                c.is_established() && !c.is_soft_closed() && c.stream_count() == 0
            })
            .count()
    }

    /// Prune, then start background builds until `min_idle_circuits` are
    /// ready or in flight. Runs at most once per build interval.
    pub fn maintain(self: &Arc<Self>) {
        if self.is_shut_down() {
            return;
        }
        self.prune();

        {
            let mut last = lock(&self.last_background_build);
            let interval = self.config.background_build_interval();
            if last.map_or(false, |at| at.elapsed() < interval) {
                return;
            }
            *last = Some(Instant::now());
        }

        let in_flight =
            self.config.max_background_builds - self.background_builds.available_permits();
        let missing = self
            .config
            .min_idle_circuits
            .saturating_sub(self.idle_count() + in_flight);
        for _ in 0..missing {
            let Ok(permit) = self.background_builds.clone().try_acquire_owned() else {
                break;
            };
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                let _permit = permit;
                let props = RouteRequestProperties::from_config(&pool.config);
                match pool.builder.build(&props).await {
                    Ok(circuit) => {
                        debug!("Background circuit {:#010x} ready", circuit.id());
                        pool.adopt(circuit, false);
                    }
                    Err(e) => debug!("Background build failed: {}", e),
                }
            });
        }
    }

    /// Run `maintain` every build interval until shutdown
    pub fn spawn_maintenance(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self
            .config
            .background_build_interval()
            .max(MIN_MAINTENANCE_TICK);
        let mut ticker = tokio::time::interval(period);
        let handle = tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else {
                    break;
                };
                if pool.is_shut_down() {
                    break;
                }
                pool.maintain();
            }
        });
        if let Some(previous) = lock(&self.maintenance_task).replace(handle) {
            previous.abort();
        }
    }

    /// Close every circuit and connection; later requests fail with `Interrupted`
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down circuit pool");
        self.shutdown_signal.notify_waiters();
        if let Some(task) = lock(&self.maintenance_task).take() {
            task.abort();
        }

        let circuits: Vec<PooledCircuit> = lock(&self.circuits).drain(..).collect();
        for pooled in circuits {
            pooled.circuit.close(true);
            self.usage.decrement(&pooled.route);
        }
        self.registry.close_all();
    }
}

impl Drop for CircuitPool {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.maintenance_task).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use crate::guard::MemoryGuardStore;
    use crate::testing::{MockNetwork, TestNetwork};

    fn config() -> ClientConfig {
        let mut config = ClientConfig::default()
            .with_queue_timeout(Duration::from_millis(300))
            .with_max_setup_duration(Duration::from_secs(5))
            .with_parallel_builds(1);
        config.background_build_interval_ms = 0;
        config
    }

    async fn pool(net: &TestNetwork, config: ClientConfig) -> Arc<CircuitPool> {
        CircuitPool::new(
            config,
            Arc::new(StaticDirectory::new(net.routers.clone())),
            net.mock.clone(),
            Arc::new(MemoryGuardStore::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_established_circuit_is_reused_unless_exclusive() {
        let net = TestNetwork::new(6);
        let pool = pool(&net, config()).await;
        let props = RouteRequestProperties::default();

        let first = pool.provide_circuit(&props, false).await.unwrap();
        let again = pool.provide_circuit(&props, false).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let private = pool.provide_circuit(&props, true).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &private));
        for _ in 0..5 {
            let shared = pool.provide_circuit(&props, false).await.unwrap();
            assert!(Arc::ptr_eq(&first, &shared));
        }
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_circuit_that_served_the_port_is_preferred() {
        let net = TestNetwork::new(6);
        let pool = pool(&net, config()).await;
        let web = RouteRequestProperties::default().with_exit_target(None, 80);

        let used = pool.provide_circuit(&web, false).await.unwrap();
        used.open_stream("example.com", 80).await.unwrap();

        let other_props = RouteRequestProperties::default().exclude(used.route_ids()[2]);
        let other = pool.provide_circuit(&other_props, false).await.unwrap();
        assert!(!Arc::ptr_eq(&used, &other));

        for _ in 0..10 {
            let picked = pool.provide_circuit(&web, false).await.unwrap();
            assert!(Arc::ptr_eq(&picked, &used));
        }
    }

    #[tokio::test]
    async fn test_unused_circuit_is_extended_to_pinned_exit() {
        let net = TestNetwork::new(6);
        let pool = pool(&net, config()).await;

        let circuit = pool
            .provide_circuit(&RouteRequestProperties::default(), false)
            .await
            .unwrap();
        let route = circuit.route_ids();
        let exit = net
            .routers
            .iter()
            .map(|r| r.identity)
            .find(|id| !route.contains(id))
            .unwrap();

        let props = RouteRequestProperties::default().with_exit_node(exit);
        let extended = pool.provide_circuit(&props, false).await.unwrap();
        assert!(Arc::ptr_eq(&circuit, &extended));
        assert_eq!(extended.route_ids().len(), 4);
        assert_eq!(extended.exit().unwrap().identity, exit);
        assert_eq!(pool.node_usage().count(&exit), 1);
    }

    #[tokio::test]
    async fn test_parallel_builds_yield_one_winner() {
        let net = TestNetwork::new(8);
        let pool = pool(&net, config().with_parallel_builds(3)).await;
        let mut events = pool.subscribe();

        let circuit = pool
            .provide_circuit(&RouteRequestProperties::default(), true)
            .await
            .unwrap();
        assert!(circuit.is_established());

        let built = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(CircuitEvent::Built { circ_id, .. }) = events.recv().await {
                    if circ_id == circuit.id() {
                        break;
                    }
                }
            }
        })
        .await;
        assert!(built.is_ok());
        assert!(pool.circuits().iter().any(|c| Arc::ptr_eq(c, &circuit)));
    }

    #[tokio::test]
    async fn test_unreachable_network_surfaces_one_error() {
        let net = TestNetwork::new(5);
        for router in &net.routers {
            net.mock.set_unreachable(router.identity);
        }
        let pool = pool(&net, config().with_parallel_builds(2)).await;

        let result = pool
            .provide_circuit(&RouteRequestProperties::default(), false)
            .await;
        assert!(result.is_err());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_prune_releases_node_usage() {
        let net = TestNetwork::new(6);
        let pool = pool(&net, config()).await;

        let circuit = pool
            .provide_circuit(&RouteRequestProperties::default(), false)
            .await
            .unwrap();
        let route = circuit.route_ids();
        assert!(route.iter().all(|id| pool.node_usage().count(id) == 1));

        circuit.close(true);
        assert_eq!(pool.prune(), 1);
        assert!(route.iter().all(|id| pool.node_usage().count(id) == 0));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_maintenance_keeps_idle_circuits_ready() {
        let net = TestNetwork::new(8);
        let mut config = config();
        config.min_idle_circuits = 2;
        config.max_background_builds = 2;
        let pool = pool(&net, config).await;

        pool.maintain();
        MockNetwork::wait_for(|| pool.len() >= 2).await;

        // Builds in flight or ready count toward the target
        pool.maintain();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_closes_and_refuses() {
        let net = TestNetwork::new(6);
        let pool = pool(&net, config()).await;
        let circuit = pool
            .provide_circuit(&RouteRequestProperties::default(), false)
            .await
            .unwrap();

        pool.shutdown();
        assert!(circuit.is_closed());
        assert!(pool.is_empty());
        assert!(pool.registry().is_empty());
        assert!(matches!(
            pool.provide_circuit(&RouteRequestProperties::default(), false)
                .await,
            Err(OnionError::Interrupted)
        ));
    }
}
