/// Routing-information oracle
///
/// The engine never parses consensus documents; it asks a `RouterDirectory`
/// for valid relays, weighted picks and relatedness.

mod static_directory;

pub use static_directory::StaticDirectory;

use crate::circuit::RouteRequestProperties;
use onionpath_common::{RouterDescriptor, RouterIdentity};
use std::collections::{HashMap, HashSet};

pub trait RouterDirectory: Send + Sync {
    /// Relays currently marked valid and running
    fn valid_routers(&self) -> HashMap<RouterIdentity, RouterDescriptor>;

    fn router(&self, identity: &RouterIdentity) -> Option<RouterDescriptor>;

    /// Weighted random pick among `candidates` not in `excluded`
    fn select_random_node(
        &self,
        candidates: &[RouterDescriptor],
        excluded: &HashSet<RouterIdentity>,
        ranking_influence: f64,
        require_fast: bool,
        require_stable: bool,
    ) -> Option<RouterDescriptor>;

    /// The relay itself plus every relay it must not share a circuit with
    fn exclude_related_nodes(&self, router: &RouterDescriptor) -> HashSet<RouterIdentity>;

    fn is_route_compatible(
        &self,
        route: &[RouterDescriptor],
        request: &RouteRequestProperties,
        for_hidden_service: bool,
    ) -> bool;

    /// Lower a relay's ranking after it failed a circuit build
    fn punish_router(&self, identity: &RouterIdentity);
}
