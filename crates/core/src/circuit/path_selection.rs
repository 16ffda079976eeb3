use crate::directory::RouterDirectory;
use crate::guard::GuardSelector;
use crate::lock;
use onionpath_common::{
    routing, ClientConfig, OnionError, Result, RouterDescriptor, RouterIdentity,
};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Per-request constraints on a route
#[derive(Debug, Clone, PartialEq)]
pub struct RouteRequestProperties {
    pub min_length: usize,
    pub max_length: usize,

    /// Required first hop
    pub entry_node: Option<RouterIdentity>,

    /// Required last hop
    pub exit_node: Option<RouterIdentity>,

    /// Relays that must not appear anywhere in the route
    pub excluded: HashSet<RouterIdentity>,

    pub fast: bool,
    pub stable: bool,

    /// Destination the exit must accept; `None` address means by hostname
    pub exit_target: Option<(Option<IpAddr>, u16)>,

    /// 0 picks uniformly, 1 weights fully by ranking
    pub ranking_influence: f64,

    /// Route ends at a rendezvous or introduction point: no exit policy
    pub hidden_service: bool,

    /// Draw the first hop from the guard list
    pub use_entry_guards: bool,
}

impl Default for RouteRequestProperties {
    fn default() -> Self {
        Self {
            min_length: routing::DEFAULT_CIRCUIT_LENGTH,
            max_length: routing::DEFAULT_CIRCUIT_LENGTH,
            entry_node: None,
            exit_node: None,
            excluded: HashSet::new(),
            fast: true,
            stable: false,
            exit_target: None,
            ranking_influence: 0.8,
            hidden_service: false,
            use_entry_guards: true,
        }
    }
}

impl RouteRequestProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            min_length: config.min_route_length,
            max_length: config.max_route_length,
            ranking_influence: config.ranking_influence,
            ..Self::default()
        }
    }

    pub fn with_length(mut self, min: usize, max: usize) -> Self {
        self.min_length = min;
        self.max_length = max;
        self
    }

    pub fn with_entry_node(mut self, entry: RouterIdentity) -> Self {
        self.entry_node = Some(entry);
        self
    }

    pub fn with_exit_node(mut self, exit: RouterIdentity) -> Self {
        self.exit_node = Some(exit);
        self
    }

    pub fn with_exit_target(mut self, address: Option<IpAddr>, port: u16) -> Self {
        self.exit_target = Some((address, port));
        self
    }

    pub fn exclude(mut self, router: RouterIdentity) -> Self {
        self.excluded.insert(router);
        self
    }

    pub fn with_stable(mut self, stable: bool) -> Self {
        self.stable = stable;
        self
    }

    pub fn with_ranking_influence(mut self, influence: f64) -> Self {
        self.ranking_influence = influence;
        self
    }

    pub fn for_hidden_service(mut self) -> Self {
        self.hidden_service = true;
        self
    }

    pub fn with_entry_guards(mut self, use_guards: bool) -> Self {
        self.use_entry_guards = use_guards;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_length < routing::MIN_CIRCUIT_LENGTH
            || self.max_length > routing::MAX_CIRCUIT_LENGTH
            || self.min_length > self.max_length
        {
            return Err(OnionError::Config(format!(
                "route length {}..={} outside {}..={}",
                self.min_length,
                self.max_length,
                routing::MIN_CIRCUIT_LENGTH,
                routing::MAX_CIRCUIT_LENGTH
            )));
        }
        if !(0.0..=1.0).contains(&self.ranking_influence) {
            return Err(OnionError::Config(format!(
                "ranking influence {} outside 0..=1",
                self.ranking_influence
            )));
        }
        Ok(())
    }
}

/// How many live circuits each relay currently carries
#[derive(Debug, Default)]
pub struct NodeUsage {
    counts: Mutex<HashMap<RouterIdentity, usize>>,
}

impl NodeUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment<'a>(&self, routers: impl IntoIterator<Item = &'a RouterIdentity>) {
        let mut counts = lock(&self.counts);
        for id in routers {
            *counts.entry(*id).or_insert(0) += 1;
        }
    }

    pub fn decrement<'a>(&self, routers: impl IntoIterator<Item = &'a RouterIdentity>) {
        let mut counts = lock(&self.counts);
        for id in routers {
            if let Some(count) = counts.get_mut(id) {
                *count -= 1;
                if *count == 0 {
                    counts.remove(id);
                }
            }
        }
    }

    pub fn count(&self, router: &RouterIdentity) -> usize {
        lock(&self.counts).get(router).copied().unwrap_or(0)
    }

    pub fn overused(&self, router: &RouterIdentity, max: usize) -> bool {
        self.count(router) >= max
    }
}

/// One level of the back-to-front search
struct Frame {
    pos: usize,
    /// Exclusions inherited from the hops chosen after this one
    excluded: Arc<HashSet<RouterIdentity>>,
    /// Candidates already tried at this level
    tried: HashSet<RouterIdentity>,
    chosen: Option<RouterDescriptor>,
}

impl Frame {
    fn new(pos: usize, excluded: Arc<HashSet<RouterIdentity>>) -> Self {
        Self {
            pos,
            excluded,
            tried: HashSet::new(),
            chosen: None,
        }
    }
}

/// Picks routes back to front with bounded backtracking.
///
/// The exit is chosen first, then each hop closer to the client, every
/// choice adding its related relays to the exclusions of the levels below
/// it. A level that runs out of candidates pops back to its parent, which
/// tries a different relay.
pub struct RouteBuilder {
    directory: Arc<dyn RouterDirectory>,
    guards: Arc<GuardSelector>,
    usage: Arc<NodeUsage>,
    max_circuits_per_node: usize,
}

impl RouteBuilder {
    pub fn new(
        directory: Arc<dyn RouterDirectory>,
        guards: Arc<GuardSelector>,
        usage: Arc<NodeUsage>,
        max_circuits_per_node: usize,
    ) -> Self {
        Self {
            directory,
            guards,
            usage,
            max_circuits_per_node,
        }
    }

    /// Fresh route, or `Ok(None)` when the search gives up
    pub fn build_route(
        &self,
        props: &RouteRequestProperties,
    ) -> Result<Option<Vec<RouterDescriptor>>> {
        props.validate()?;
        let length = rand::thread_rng().gen_range(props.min_length..=props.max_length);
        let fixed = self.pinned_hops(length, props)?;
        Ok(self.search(fixed, props.excluded.clone(), props))
    }

    /// New route keeping `previous[..confirmed]` and avoiding `failed`
    pub fn rebuild_route(
        &self,
        previous: &[RouterDescriptor],
        confirmed: usize,
        failed: &HashSet<RouterIdentity>,
        props: &RouteRequestProperties,
    ) -> Result<Option<Vec<RouterDescriptor>>> {
        props.validate()?;
        let length = previous.len();
        if length == 0 {
            return self.build_route(props);
        }

        let mut fixed = self.pinned_hops(length, props)?;
        for (slot, router) in fixed.iter_mut().zip(&previous[..confirmed.min(length)]) {
            *slot = Some(router.clone());
        }

        let mut excluded = props.excluded.clone();
        excluded.extend(failed.iter().copied());
        debug!(
            "Rebuilding {}-hop route keeping {} confirmed hops, avoiding {} failed",
            length,
            confirmed,
            failed.len()
        );
        Ok(self.search(fixed, excluded, props))
    }

    fn pinned_hops(
        &self,
        length: usize,
        props: &RouteRequestProperties,
    ) -> Result<Vec<Option<RouterDescriptor>>> {
        let lookup = |id: &RouterIdentity| {
            self.directory
                .router(id)
                .ok_or_else(|| OnionError::ServerNotFound(id.to_hex()))
        };

        let mut fixed = vec![None; length];
        if let Some(exit) = &props.exit_node {
            fixed[length - 1] = Some(lookup(exit)?);
        }
        if let Some(entry) = &props.entry_node {
            fixed[0] = Some(lookup(entry)?);
        }
        Ok(fixed)
    }

    fn search(
        &self,
        fixed: Vec<Option<RouterDescriptor>>,
        mut base: HashSet<RouterIdentity>,
        props: &RouteRequestProperties,
    ) -> Option<Vec<RouterDescriptor>> {
        let length = fixed.len();
        let routers = self.directory.valid_routers();
        for pinned in fixed.iter().flatten() {
            base.extend(self.directory.exclude_related_nodes(pinned));
        }

        let mut stack = vec![Frame::new(length - 1, Arc::new(base))];
        let mut steps = 0;
        while let Some(frame) = stack.last_mut() {
            steps += 1;
            if steps > routing::MAX_ROUTE_SEARCH_STEPS {
                debug!("Route search gave up after {} steps", steps - 1);
                return None;
            }

            let pos = frame.pos;
            let choice = match &fixed[pos] {
                Some(pinned) if frame.tried.contains(&pinned.identity) => None,
                Some(pinned) => Some(pinned.clone()),
                None => self.pick(pos, length, frame, &routers, props),
            };
            let Some(router) = choice else {
                // Level exhausted: let the parent try another relay
                stack.pop();
                continue;
            };

            frame.tried.insert(router.identity);
            frame.chosen = Some(router.clone());
            let inherited = frame.excluded.clone();

            if pos == 0 {
                let route: Vec<RouterDescriptor> = stack
                    .iter()
                    .rev()
                    .filter_map(|f| f.chosen.clone())
                    .collect();
                if self
                    .directory
                    .is_route_compatible(&route, props, props.hidden_service)
                {
                    return Some(route);
                }
                debug!("Candidate route failed the compatibility check");
                continue;
            }

            let mut next = (*inherited).clone();
            next.extend(self.directory.exclude_related_nodes(&router));
            stack.push(Frame::new(pos - 1, Arc::new(next)));
        }

        debug!("Route search exhausted every candidate");
        None
    }

    fn pick(
        &self,
        pos: usize,
        length: usize,
        frame: &Frame,
        routers: &HashMap<RouterIdentity, RouterDescriptor>,
        props: &RouteRequestProperties,
    ) -> Option<RouterDescriptor> {
        let mut excluded = (*frame.excluded).clone();
        excluded.extend(frame.tried.iter().copied());

        let is_exit = pos == length - 1;
        let is_entry = pos == 0 && length > 1;
        if is_entry && props.use_entry_guards {
            return self.guards.select(&excluded, routers);
        }

        let candidates: Vec<RouterDescriptor> = routers
            .values()
            .filter(|r| {
                if is_exit {
                    Self::exit_candidate(r, props)
                } else if is_entry {
                    r.flags.is_guard_capable()
                } else {
                    !self
                        .usage
                        .overused(&r.identity, self.max_circuits_per_node)
                }
            })
            .cloned()
            .collect();

        self.directory.select_random_node(
            &candidates,
            &excluded,
            props.ranking_influence,
            props.fast,
            props.stable,
        )
    }

    fn exit_candidate(router: &RouterDescriptor, props: &RouteRequestProperties) -> bool {
        if props.hidden_service {
            return true;
        }
        match props.exit_target {
            Some((address, port)) => router.allows_exit_to(address, port),
            None => router.flags.exit && !router.flags.bad_exit,
        }
    }
}
