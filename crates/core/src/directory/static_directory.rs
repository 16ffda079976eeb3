use super::RouterDirectory;
use crate::circuit::RouteRequestProperties;
use onionpath_common::{OnionError, Result, RouterDescriptor, RouterIdentity};
use rand::distributions::{Distribution, WeightedIndex};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, warn};

/// Ranking multiplier applied to a relay that failed a build
const PUNISH_FACTOR: f64 = 0.5;

/// In-memory routing oracle over a fixed relay list
#[derive(Debug, Default)]
pub struct StaticDirectory {
    routers: RwLock<HashMap<RouterIdentity, RouterDescriptor>>,
    /// Treat relays in the same country as related
    enforce_country: bool,
}

impl StaticDirectory {
    pub fn new(routers: impl IntoIterator<Item = RouterDescriptor>) -> Self {
        let routers = routers
            .into_iter()
            .map(|router| (router.identity, router))
            .collect();
        Self {
            routers: RwLock::new(routers),
            enforce_country: false,
        }
    }

    pub fn with_country_separation(mut self, enforce: bool) -> Self {
        self.enforce_country = enforce;
        self
    }

    /// Load a JSON array of router descriptors
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let routers: Vec<RouterDescriptor> = serde_json::from_str(&contents)
            .map_err(|e| OnionError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(Self::new(routers))
    }

    pub fn insert(&self, router: RouterDescriptor) {
        if let Ok(mut routers) = self.routers.write() {
            routers.insert(router.identity, router);
        }
    }

    pub fn remove(&self, identity: &RouterIdentity) {
        if let Ok(mut routers) = self.routers.write() {
            routers.remove(identity);
        }
    }

    pub fn len(&self) -> usize {
        self.routers.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn same_subnet(a: IpAddr, b: IpAddr) -> bool {
        match (a, b) {
            (IpAddr::V4(a), IpAddr::V4(b)) => a.octets()[..2] == b.octets()[..2],
            (IpAddr::V6(a), IpAddr::V6(b)) => a.segments()[..2] == b.segments()[..2],
            _ => false,
        }
    }

    fn related(&self, a: &RouterDescriptor, b: &RouterDescriptor) -> bool {
        if a.identity == b.identity {
            return true;
        }
        if a.family.contains(&b.identity) && b.family.contains(&a.identity) {
            return true;
        }
        if Self::same_subnet(a.address, b.address) {
            return true;
        }
        self.enforce_country
            && matches!((&a.country, &b.country), (Some(x), Some(y)) if x.eq_ignore_ascii_case(y))
    }
}

impl RouterDirectory for StaticDirectory {
    fn valid_routers(&self) -> HashMap<RouterIdentity, RouterDescriptor> {
        self.routers
            .read()
            .map(|routers| {
                routers
                    .iter()
                    .filter(|(_, r)| r.flags.is_usable())
                    .map(|(id, r)| (*id, r.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn router(&self, identity: &RouterIdentity) -> Option<RouterDescriptor> {
        self.routers.read().ok()?.get(identity).cloned()
    }

    fn select_random_node(
        &self,
        candidates: &[RouterDescriptor],
        excluded: &HashSet<RouterIdentity>,
        ranking_influence: f64,
        require_fast: bool,
        require_stable: bool,
    ) -> Option<RouterDescriptor> {
        let eligible: Vec<&RouterDescriptor> = candidates
            .iter()
            .filter(|r| !excluded.contains(&r.identity))
            .filter(|r| r.flags.is_usable())
            .filter(|r| !require_fast || r.flags.fast)
            .filter(|r| !require_stable || r.flags.stable)
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let influence = ranking_influence.clamp(0.0, 1.0);
        let max_rank = eligible
            .iter()
            .map(|r| r.ranking.max(0.0))
            .fold(0.0_f64, f64::max);
        let weights: Vec<f64> = eligible
            .iter()
            .map(|r| {
                let normalized = if max_rank > 0.0 {
                    r.ranking.max(0.0) / max_rank
                } else {
                    0.0
                };
                (1.0 - influence) + influence * normalized
            })
            .collect();

        let mut rng = rand::thread_rng();
        match WeightedIndex::new(&weights) {
            Ok(dist) => Some(eligible[dist.sample(&mut rng)].clone()),
            // Every weight is zero: fall back to a uniform pick
            Err(_) => {
                use rand::seq::SliceRandom;
                eligible.choose(&mut rng).map(|r| (*r).clone())
            }
        }
    }

    fn exclude_related_nodes(&self, router: &RouterDescriptor) -> HashSet<RouterIdentity> {
        let mut related = HashSet::new();
        related.insert(router.identity);
        if let Ok(routers) = self.routers.read() {
            related.extend(
                routers
                    .values()
                    .filter(|other| self.related(router, other))
                    .map(|other| other.identity),
            );
        }
        related
    }

    fn is_route_compatible(
        &self,
        route: &[RouterDescriptor],
        request: &RouteRequestProperties,
        for_hidden_service: bool,
    ) -> bool {
        if route.len() < request.min_length || route.len() > request.max_length {
            debug!(
                "Route length {} outside {}..={}",
                route.len(),
                request.min_length,
                request.max_length
            );
            return false;
        }

        for (i, hop) in route.iter().enumerate() {
            if request.excluded.contains(&hop.identity) {
                return false;
            }
            if (request.fast && !hop.flags.fast) || (request.stable && !hop.flags.stable) {
                return false;
            }
            for other in &route[i + 1..] {
                if self.related(hop, other) {
                    return false;
                }
            }
        }

        if let Some(entry) = request.entry_node {
            if route.first().map(|r| r.identity) != Some(entry) {
                return false;
            }
        }
        if let Some(exit) = request.exit_node {
            if route.last().map(|r| r.identity) != Some(exit) {
                return false;
            }
        }

        if !for_hidden_service {
            if let (Some((address, port)), Some(last)) = (request.exit_target, route.last()) {
                // A caller-pinned exit is trusted to carry the stream
                if request.exit_node.is_none() && !last.allows_exit_to(address, port) {
                    return false;
                }
            }
        }
        true
    }

    fn punish_router(&self, identity: &RouterIdentity) {
        match self.routers.write() {
            Ok(mut routers) => {
                if let Some(router) = routers.get_mut(identity) {
                    let before = router.ranking;
                    router.ranking *= PUNISH_FACTOR;
                    debug!(
                        "Punished {}: ranking {:.4} -> {:.4}",
                        identity, before, router.ranking
                    );
                }
            }
            Err(_) => warn!("Directory lock poisoned while punishing {}", identity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onionpath_common::{ExitPolicy, RouterFlags};

    fn router(n: u8, addr: &str) -> RouterDescriptor {
        RouterDescriptor::new(
            RouterIdentity::from_bytes([n; 20]),
            format!("r{}", n),
            format!("{}:9001", addr).parse().unwrap(),
        )
    }

    #[test]
    fn test_subnet_and_family_relations() {
        let a = router(1, "10.1.0.1");
        let b = router(2, "10.1.200.2");
        let c = router(3, "10.2.0.3").with_family([RouterIdentity::from_bytes([4; 20])]);
        let d = router(4, "10.3.0.4").with_family([RouterIdentity::from_bytes([3; 20])]);
        let e = router(5, "10.4.0.5").with_family([RouterIdentity::from_bytes([1; 20])]);
        let dir = StaticDirectory::new(vec![a.clone(), b.clone(), c.clone(), d.clone(), e]);

        let related = dir.exclude_related_nodes(&a);
        assert!(related.contains(&a.identity));
        assert!(related.contains(&b.identity));
        assert!(!related.contains(&RouterIdentity::from_bytes([5; 20])));

        let related = dir.exclude_related_nodes(&c);
        assert!(related.contains(&d.identity));
        assert_eq!(related.len(), 2);
    }

    #[test]
    fn test_country_relation_is_optional() {
        let a = router(1, "10.1.0.1").with_country("de");
        let b = router(2, "10.2.0.1").with_country("DE");
        let dir = StaticDirectory::new(vec![a.clone(), b.clone()]);
        assert!(!dir.exclude_related_nodes(&a).contains(&b.identity));

        let dir = dir.with_country_separation(true);
        assert!(dir.exclude_related_nodes(&a).contains(&b.identity));
    }

    #[test]
    fn test_selection_respects_exclusions_and_flags() {
        let mut slow = router(1, "10.1.0.1");
        slow.flags.fast = false;
        let fast = router(2, "10.2.0.1");
        let banned = router(3, "10.3.0.1");
        let candidates = vec![slow, fast.clone(), banned.clone()];
        let dir = StaticDirectory::new(candidates.clone());

        let excluded: HashSet<_> = [banned.identity].into_iter().collect();
        for _ in 0..20 {
            let pick = dir
                .select_random_node(&candidates, &excluded, 0.5, true, false)
                .unwrap();
            assert_eq!(pick.identity, fast.identity);
        }

        let all: HashSet<_> = candidates.iter().map(|r| r.identity).collect();
        assert!(dir
            .select_random_node(&candidates, &all, 0.5, false, false)
            .is_none());
    }

    #[test]
    fn test_full_influence_never_picks_zero_ranked() {
        let zero = router(1, "10.1.0.1").with_ranking(0.0);
        let good = router(2, "10.2.0.1").with_ranking(5.0);
        let candidates = vec![zero, good.clone()];
        let dir = StaticDirectory::new(candidates.clone());
        for _ in 0..50 {
            let pick = dir
                .select_random_node(&candidates, &HashSet::new(), 1.0, false, false)
                .unwrap();
            assert_eq!(pick.identity, good.identity);
        }
    }

    #[test]
    fn test_punish_strictly_decreases() {
        let r = router(1, "10.1.0.1").with_ranking(2.0);
        let dir = StaticDirectory::new(vec![r.clone()]);
        dir.punish_router(&r.identity);
        assert!(dir.router(&r.identity).unwrap().ranking < 2.0);
    }

    #[test]
    fn test_route_compatibility() {
        let entry = router(1, "10.1.0.1");
        let middle = router(2, "10.2.0.1");
        let exit = router(3, "10.3.0.1")
            .with_flags(RouterFlags::relay().with_exit())
            .with_exit_policy(ExitPolicy::parse(["accept *:443"]).unwrap());
        let dir = StaticDirectory::new(vec![entry.clone(), middle.clone(), exit.clone()]);

        let mut request = RouteRequestProperties::default();
        request.exit_target = Some((None, 443));
        let route = vec![entry.clone(), middle.clone(), exit.clone()];
        assert!(dir.is_route_compatible(&route, &request, false));

        request.exit_target = Some((None, 80));
        assert!(!dir.is_route_compatible(&route, &request, false));
        assert!(dir.is_route_compatible(&route, &request, true));

        let same_subnet = router(4, "10.1.9.9");
        let route = vec![entry, same_subnet, exit];
        request.exit_target = None;
        assert!(!dir.is_route_compatible(&route, &request, false));
    }
}
