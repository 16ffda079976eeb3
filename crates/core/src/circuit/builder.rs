/// Turning routes into established circuits
///
/// One build request runs attempts in sequence: connect to the first hop,
/// handshake, then extend hop by hop. When hop `i` fails, the relay is
/// punished and a new route is searched that keeps the `i` hops already
/// proven, up to `max_route_retries` times. The whole request is bounded
/// by `max_setup_duration`; a partly built circuit is torn down whenever
/// its attempt is abandoned.

use super::path_selection::{RouteBuilder, RouteRequestProperties};
use super::types::{Circuit, CircuitEvent, CircuitParams};
use crate::directory::RouterDirectory;
use crate::guard::GuardSelector;
use crate::network::ConnectionRegistry;
use onionpath_common::{ClientConfig, OnionError, Result, RouterDescriptor, RouterIdentity};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Which hop broke an attempt, and how
#[derive(Debug)]
struct HopFailure {
    index: usize,
    router: RouterDescriptor,
    error: OnionError,
}

/// Hard-closes a circuit unless the build reached the end
struct TeardownGuard {
    circuit: Option<Arc<Circuit>>,
}

impl TeardownGuard {
    fn new(circuit: Arc<Circuit>) -> Self {
        Self {
            circuit: Some(circuit),
        }
    }

    fn disarm(mut self) {
        self.circuit = None;
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if let Some(circuit) = self.circuit.take() {
            debug!("Tearing down unfinished circuit {:#010x}", circuit.id());
            circuit.close(true);
        }
    }
}

pub struct CircuitBuilder {
    config: ClientConfig,
    directory: Arc<dyn RouterDirectory>,
    registry: Arc<ConnectionRegistry>,
    routes: Arc<RouteBuilder>,
    guards: Arc<GuardSelector>,
    events: broadcast::Sender<CircuitEvent>,
}

impl CircuitBuilder {
    pub fn new(
        config: ClientConfig,
        directory: Arc<dyn RouterDirectory>,
        registry: Arc<ConnectionRegistry>,
        routes: Arc<RouteBuilder>,
        guards: Arc<GuardSelector>,
        events: broadcast::Sender<CircuitEvent>,
    ) -> Self {
        Self {
            config,
            directory,
            registry,
            routes,
            guards,
            events,
        }
    }

    /// Build one established circuit satisfying `props`
    pub async fn build(&self, props: &RouteRequestProperties) -> Result<Arc<Circuit>> {
        let budget = self.config.max_setup_duration();
        match tokio::time::timeout(budget, self.build_with_retries(props)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Circuit setup exceeded {:?}", budget);
                Err(OnionError::SetupTimeout(budget.as_millis() as u64))
            }
        }
    }

    async fn build_with_retries(&self, props: &RouteRequestProperties) -> Result<Arc<Circuit>> {
        let mut route = self
            .routes
            .build_route(props)?
            .ok_or_else(|| OnionError::NoRouteFound("no relays satisfy the request".into()))?;
        if route.is_empty() {
            return Err(OnionError::NoRouteFound("empty route".into()));
        }
        let mut failed: HashSet<RouterIdentity> = HashSet::new();
        let mut misses = 0;

        loop {
            let failure = match self.attempt(&route, props).await {
                Ok(circuit) => return Ok(circuit),
                Err(failure) => failure,
            };
            let HopFailure {
                index,
                router,
                error,
            } = failure;
            warn!(
                "Circuit build failed at hop {} ({}): {}",
                index, router.identity, error
            );

            let pinned = (index == 0 && props.entry_node == Some(router.identity))
                || (index + 1 == route.len() && props.exit_node == Some(router.identity));
            if pinned || !error.is_retryable() {
                return Err(error);
            }
            misses += 1;
            if misses > self.config.max_route_retries {
                info!("Giving up after {} rebuilt routes", misses - 1);
                return Err(error);
            }

            self.directory.punish_router(&router.identity);
            failed.insert(router.identity);
            route = self
                .routes
                .rebuild_route(&route, index, &failed, props)?
                .ok_or_else(|| {
                    OnionError::NoRouteFound(format!(
                        "no replacement for hop {} after {} failures",
                        index,
                        failed.len()
                    ))
                })?;
        }
    }

    /// One pass over a non-empty `route`; a failure names the hop that broke it
    async fn attempt(
        &self,
        route: &[RouterDescriptor],
        props: &RouteRequestProperties,
    ) -> std::result::Result<Arc<Circuit>, HopFailure> {
        let fail = |index: usize, error: OnionError| HopFailure {
            index,
            router: route[index].clone(),
            error,
        };
        let first = &route[0];
        let started = Instant::now();

        let connection = match self.registry.get_or_open(first).await {
            Ok(connection) => connection,
            Err(e) => {
                self.report_guard(first, false, props).await;
                return Err(fail(0, e));
            }
        };
        let circuit = Circuit::open(
            &connection,
            self.directory.clone(),
            CircuitParams::from_config(&self.config),
            self.events.clone(),
        )
        .map_err(|e| fail(0, e))?;
        let teardown = TeardownGuard::new(circuit.clone());

        if let Err(e) = circuit
            .create_first_hop(first, self.config.fast_first_hop)
            .await
        {
            self.report_guard(first, false, props).await;
            return Err(fail(0, e));
        }
        self.report_guard(first, true, props).await;

        for (index, router) in route.iter().enumerate().skip(1) {
            circuit.extend_to(router).await.map_err(|e| fail(index, e))?;
        }

        circuit.mark_established(started.elapsed());
        teardown.disarm();
        Ok(circuit)
    }

    async fn report_guard(
        &self,
        router: &RouterDescriptor,
        success: bool,
        props: &RouteRequestProperties,
    ) {
        if !props.use_entry_guards || props.entry_node.is_some() {
            return;
        }
        let result = if success {
            self.guards.report_success(&router.identity).await
        } else {
            self.guards.report_failure(&router.identity).await
        };
        if let Err(e) = result {
            warn!("Could not persist guard state: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::NodeUsage;
    use crate::directory::StaticDirectory;
    use crate::guard::MemoryGuardStore;
    use crate::testing::{Behaviour, TestNetwork};
    use onionpath_common::GuardConfig;
    use std::time::Duration;

    struct Harness {
        builder: CircuitBuilder,
        directory: Arc<StaticDirectory>,
        guards: Arc<GuardSelector>,
        usage: Arc<NodeUsage>,
    }

    fn harness(net: &TestNetwork, config: ClientConfig) -> Harness {
        let directory = Arc::new(StaticDirectory::new(net.routers.clone()));
        let guards = Arc::new(GuardSelector::new(
            GuardConfig::default(),
            directory.clone(),
            Arc::new(MemoryGuardStore::new()),
        ));
        let usage = Arc::new(NodeUsage::new());
        let routes = Arc::new(RouteBuilder::new(
            directory.clone(),
            guards.clone(),
            usage.clone(),
            config.max_circuits_per_node,
        ));
        let registry = Arc::new(ConnectionRegistry::new(net.mock.clone()));
        let builder = CircuitBuilder::new(
            config,
            directory.clone(),
            registry,
            routes,
            guards.clone(),
            net.events.clone(),
        );
        Harness {
            builder,
            directory,
            guards,
            usage,
        }
    }

    fn quick_config() -> ClientConfig {
        ClientConfig::default()
            .with_queue_timeout(Duration::from_millis(300))
            .with_max_setup_duration(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_build_promotes_the_entry_guard() {
        let net = TestNetwork::new(5);
        let h = harness(&net, quick_config());

        let circuit = h
            .builder
            .build(&RouteRequestProperties::default())
            .await
            .unwrap();
        assert!(circuit.is_established());
        assert_eq!(circuit.route_established(), 3);
        assert!(circuit.setup_duration().is_some());

        let entry = circuit.route()[0].identity;
        assert!(h.guards.entries().iter().any(|g| g.identity == entry));
    }

    #[tokio::test]
    async fn test_failed_exit_is_replaced_keeping_the_prefix() {
        let net = TestNetwork::new(5);
        let mut config = quick_config();
        config.max_circuits_per_node = 1;
        let h = harness(&net, config);
        let ids = net.ids(&[0, 1, 2, 3, 4]);

        // Only router 1 may serve as the middle hop
        h.usage.increment(&ids[2..]);
        net.mock.set_behaviour(ids[1], Behaviour::FailExtends(2));

        let props = RouteRequestProperties::default()
            .with_entry_guards(false)
            .with_entry_node(ids[0]);
        let circuit = h.builder.build(&props).await.unwrap();

        assert_eq!(&circuit.route_ids()[..2], &ids[..2]);
        let exit = circuit.route_ids()[2];
        let punished: Vec<_> = ids[2..]
            .iter()
            .filter(|id| h.directory.router(id).unwrap().ranking < 1.0)
            .collect();
        assert_eq!(punished.len(), 2);
        assert!(!punished.contains(&&exit));
        let first_hop = ids[0];
        crate::testing::MockNetwork::wait_for(|| net.mock.destroys_seen(&first_hop) == 2).await;
    }

    #[tokio::test]
    async fn test_timed_out_exit_is_replaced_keeping_the_prefix() {
        let net = TestNetwork::new(5);
        let mut config = quick_config();
        config.max_circuits_per_node = 1;
        let h = harness(&net, config);
        let ids = net.ids(&[0, 1, 2, 3, 4]);

        h.usage.increment(&ids[2..]);
        net.mock.set_behaviour(ids[1], Behaviour::IgnoreExtends(2));

        let props = RouteRequestProperties::default()
            .with_entry_guards(false)
            .with_entry_node(ids[0]);
        let started = Instant::now();
        let circuit = h.builder.build(&props).await.unwrap();

        // Two extend waits ran out before the third route went through
        assert!(started.elapsed() >= Duration::from_millis(600));
        assert!(circuit.is_established());
        assert_eq!(&circuit.route_ids()[..2], &ids[..2]);
        let exit = circuit.route_ids()[2];
        let punished: Vec<_> = ids[2..]
            .iter()
            .filter(|id| h.directory.router(id).unwrap().ranking < 1.0)
            .collect();
        assert_eq!(punished.len(), 2);
        assert!(!punished.contains(&&exit));
        let first_hop = ids[0];
        crate::testing::MockNetwork::wait_for(|| net.mock.destroys_seen(&first_hop) == 2).await;
    }

    #[tokio::test]
    async fn test_retry_limit_is_enforced() {
        let net = TestNetwork::new(5);
        let mut config = quick_config();
        config.max_circuits_per_node = 1;
        config.max_route_retries = 1;
        let h = harness(&net, config);
        let ids = net.ids(&[0, 1, 2, 3, 4]);
        h.usage.increment(&ids[2..]);
        net.mock.set_behaviour(ids[1], Behaviour::FailExtends(10));

        let props = RouteRequestProperties::default()
            .with_entry_guards(false)
            .with_entry_node(ids[0]);
        let err = h.builder.build(&props).await.unwrap_err();
        assert!(matches!(err, OnionError::Truncated { .. }));

        let first_hop = ids[0];
        crate::testing::MockNetwork::wait_for(|| net.mock.destroys_seen(&first_hop) == 2).await;
    }

    #[tokio::test]
    async fn test_pinned_entry_failure_is_fatal() {
        let net = TestNetwork::new(4);
        let h = harness(&net, quick_config());
        let entry = net.routers[0].identity;
        net.mock.set_unreachable(entry);

        let props = RouteRequestProperties::default().with_entry_node(entry);
        let err = h.builder.build(&props).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(h.directory.router(&entry).unwrap().ranking, 1.0);
    }

    #[tokio::test]
    async fn test_setup_budget_tears_down_mid_handshake() {
        let net = TestNetwork::new(4);
        let config = ClientConfig::default()
            .with_queue_timeout(Duration::from_secs(10))
            .with_max_setup_duration(Duration::from_millis(200));
        let h = harness(&net, config);
        let entry = net.routers[0].identity;
        net.mock.set_behaviour(entry, Behaviour::Silent);

        let props = RouteRequestProperties::default().with_entry_node(entry);
        let started = Instant::now();
        let err = h.builder.build(&props).await.unwrap_err();
        assert!(matches!(err, OnionError::SetupTimeout(200)));
        assert!(started.elapsed() < Duration::from_secs(5));

        crate::testing::MockNetwork::wait_for(|| net.mock.destroys_seen(&entry) == 1).await;
    }

    #[tokio::test]
    async fn test_no_route_is_reported() {
        let net = TestNetwork::new(2);
        let h = harness(&net, quick_config());
        let err = h
            .builder
            .build(&RouteRequestProperties::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OnionError::NoRouteFound(_)));
    }
}
