/// Entry guards
///
/// A short persisted list of relays the client keeps using as first hop,
/// with failure backoff and pruning of relays the directory dropped.

mod selector;
mod store;

pub use selector::GuardSelector;
pub use store::{GuardStore, JsonFileGuardStore, MemoryGuardStore};

use onionpath_common::{RouterIdentity, Timestamp};
use serde::{Deserialize, Serialize};

/// Persisted bookkeeping for one guard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardEntry {
    pub identity: RouterIdentity,

    /// When the directory stopped listing this relay as guard-capable
    #[serde(default)]
    pub first_discard: Option<Timestamp>,

    /// Consecutive failed connections
    #[serde(default)]
    pub unsuccessful_connect: u32,

    #[serde(default)]
    pub last_unsuccessful_connect: Option<Timestamp>,
}

impl GuardEntry {
    pub fn new(identity: RouterIdentity) -> Self {
        Self {
            identity,
            first_discard: None,
            unsuccessful_connect: 0,
            last_unsuccessful_connect: None,
        }
    }
}
