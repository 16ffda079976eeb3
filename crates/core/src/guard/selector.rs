use super::{GuardEntry, GuardStore};
use crate::directory::RouterDirectory;
use crate::lock;
use onionpath_common::{GuardConfig, Result, RouterDescriptor, RouterIdentity, Timestamp};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct GuardState {
    entries: Vec<GuardEntry>,
    /// Picked but not yet proven by a successful build, with the pick time
    pending: HashMap<RouterIdentity, Instant>,
}

/// Chooses first hops from a small persisted guard list.
///
/// Selection is synchronous so route search can call it; persistence
/// happens when builds report back.
pub struct GuardSelector {
    config: GuardConfig,
    directory: Arc<dyn RouterDirectory>,
    store: Arc<dyn GuardStore>,
    state: Arc<Mutex<GuardState>>,
    /// Serializes snapshot-and-write so saves land in order
    save_lock: Arc<tokio::sync::Mutex<()>>,
}

impl GuardSelector {
    /// Selector with an empty guard list
    pub fn new(
        config: GuardConfig,
        directory: Arc<dyn RouterDirectory>,
        store: Arc<dyn GuardStore>,
    ) -> Self {
        Self {
            config,
            directory,
            store,
            state: Arc::new(Mutex::new(GuardState::default())),
            save_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Selector seeded from `store`
    pub async fn load(
        config: GuardConfig,
        directory: Arc<dyn RouterDirectory>,
        store: Arc<dyn GuardStore>,
    ) -> Result<Self> {
        let mut entries = store.load_guards().await?;
        let mut seen = HashSet::new();
        entries.retain(|entry| seen.insert(entry.identity));
        entries.truncate(config.max_entries);
        info!("Loaded {} entry guards", entries.len());

        let selector = Self::new(config, directory, store);
        lock(&selector.state).entries = entries;
        Ok(selector)
    }

    pub fn entries(&self) -> Vec<GuardEntry> {
        lock(&self.state).entries.clone()
    }

    pub fn is_pending(&self, identity: &RouterIdentity) -> bool {
        lock(&self.state).pending.contains_key(identity)
    }

    /// Pick a first hop not in `excluded`.
    ///
    /// While few guards are usable, one guard-capable relay outside the list
    /// joins the draw as a candidate and is marked pending when picked.
    /// Otherwise the pick is uniform among the first `num_guards` usable
    /// entries.
    pub fn select(
        &self,
        excluded: &HashSet<RouterIdentity>,
        routers: &HashMap<RouterIdentity, RouterDescriptor>,
    ) -> Option<RouterDescriptor> {
        let now = Timestamp::now();
        let picked_at = Instant::now();
        let (pick, changed) = {
            let mut state = lock(&self.state);
            let changed = self.refresh(&mut state.entries, routers, now);
            let timeout = self.config.pending_timeout();
            state
                .pending
                .retain(|_, since| picked_at.duration_since(*since) < timeout);

            let mut draw: Vec<RouterDescriptor> = state
                .entries
                .iter()
                .filter(|entry| self.usable(entry, excluded, routers, now))
                .filter_map(|entry| routers.get(&entry.identity).cloned())
                .collect();
            let usable = draw.len();
            draw.truncate(self.config.num_guards);

            let mut candidate = None;
            if usable <= self.config.min_usable {
                candidate = self
                    .pending_candidate(&state, excluded, routers)
                    .or_else(|| self.new_candidate(&state.entries, excluded, routers));
                if let Some(c) = &candidate {
                    debug!("Only {} usable guards, {} joins the draw", usable, c);
                    draw.push(c.clone());
                }
            }

            let pick = draw.choose(&mut rand::thread_rng()).cloned();
            if let (Some(pick), Some(candidate)) = (&pick, &candidate) {
                if pick.identity == candidate.identity {
                    self.mark_pending(&mut state.pending, pick.identity, picked_at);
                }
            }
            (pick, changed)
        };

        if changed {
            self.persist_in_background();
        }
        pick
    }

    /// A build through `identity` succeeded
    pub async fn report_success(&self, identity: &RouterIdentity) -> Result<()> {
        let changed = {
            let mut state = lock(&self.state);
            let was_pending = state.pending.remove(identity).is_some();
            match state.entries.iter().position(|e| e.identity == *identity) {
                Some(i) => {
                    let entry = &mut state.entries[i];
                    let reset = entry.unsuccessful_connect != 0;
                    entry.unsuccessful_connect = 0;
                    entry.last_unsuccessful_connect = None;
                    reset
                }
                None if was_pending && state.entries.len() < self.config.max_entries => {
                    info!("Promoting {} to entry guard", identity);
                    state.entries.push(GuardEntry::new(*identity));
                    true
                }
                None => false,
            }
        };
        if changed {
            self.save().await?;
        }
        Ok(())
    }

    /// Connecting to `identity` failed
    pub async fn report_failure(&self, identity: &RouterIdentity) -> Result<()> {
        let changed = {
            let mut state = lock(&self.state);
            state.pending.remove(identity);
            match state.entries.iter().position(|e| e.identity == *identity) {
                Some(i) => {
                    let entry = &mut state.entries[i];
                    entry.unsuccessful_connect = entry.unsuccessful_connect.saturating_add(1);
                    entry.last_unsuccessful_connect = Some(Timestamp::now());
                    debug!(
                        "Guard {} failed {} times in a row",
                        identity, entry.unsuccessful_connect
                    );
                    true
                }
                None => false,
            }
        };
        if changed {
            self.save().await?;
        }
        Ok(())
    }

    /// Write the current list to the store
    pub async fn save(&self) -> Result<()> {
        write_snapshot(&self.state, self.store.as_ref(), &self.save_lock).await
    }

    /// Flush from synchronous code; without a runtime the next save carries the change
    fn persist_in_background(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime to persist guard changes now");
            return;
        };
        let state = self.state.clone();
        let store = self.store.clone();
        let save_lock = self.save_lock.clone();
        handle.spawn(async move {
            if let Err(e) = write_snapshot(&state, store.as_ref(), &save_lock).await {
                warn!("Could not persist guard state: {}", e);
            }
        });
    }

    /// Track directory disqualification and drop long-disqualified guards.
    ///
    /// Returns whether any entry changed.
    fn refresh(
        &self,
        entries: &mut Vec<GuardEntry>,
        routers: &HashMap<RouterIdentity, RouterDescriptor>,
        now: Timestamp,
    ) -> bool {
        let discard_after = self.config.discard_after();
        let mut changed = false;
        entries.retain_mut(|entry| {
            let qualified = routers
                .get(&entry.identity)
                .map(|r| r.flags.is_guard_capable())
                .unwrap_or(false);
            if qualified {
                changed |= entry.first_discard.take().is_some();
                return true;
            }
            let since = match entry.first_discard {
                Some(since) => since,
                None => {
                    changed = true;
                    *entry.first_discard.insert(now)
                }
            };
            if since.elapsed_at(now) > discard_after {
                warn!("Dropping guard {} after {} disqualified", entry.identity, since);
                changed = true;
                return false;
            }
            true
        });
        changed
    }

    /// Record a candidate pick, evicting the oldest when the set is full
    fn mark_pending(
        &self,
        pending: &mut HashMap<RouterIdentity, Instant>,
        identity: RouterIdentity,
        picked_at: Instant,
    ) {
        if !pending.contains_key(&identity) && pending.len() >= self.config.max_entries {
            let oldest = pending
                .iter()
                .min_by_key(|(_, since)| **since)
                .map(|(id, _)| *id);
            if let Some(oldest) = oldest {
                pending.remove(&oldest);
            }
        }
        pending.insert(identity, picked_at);
    }

    /// Most recent pending candidate still fit to be tried
    fn pending_candidate(
        &self,
        state: &GuardState,
        excluded: &HashSet<RouterIdentity>,
        routers: &HashMap<RouterIdentity, RouterDescriptor>,
    ) -> Option<RouterDescriptor> {
        state
            .pending
            .iter()
            .filter(|(id, _)| !excluded.contains(*id))
            .filter(|(id, _)| state.entries.iter().all(|e| e.identity != **id))
            .max_by_key(|(_, since)| **since)
            .and_then(|(id, _)| routers.get(id))
            .filter(|r| r.flags.is_guard_capable())
            .cloned()
    }

    fn usable(
        &self,
        entry: &GuardEntry,
        excluded: &HashSet<RouterIdentity>,
        routers: &HashMap<RouterIdentity, RouterDescriptor>,
        now: Timestamp,
    ) -> bool {
        if excluded.contains(&entry.identity) || entry.first_discard.is_some() {
            return false;
        }
        if !routers
            .get(&entry.identity)
            .map(|r| r.flags.is_guard_capable())
            .unwrap_or(false)
        {
            return false;
        }
        match entry.last_unsuccessful_connect {
            Some(last) if entry.unsuccessful_connect > 0 => {
                last.elapsed_at(now) >= self.config.backoff_for(entry.unsuccessful_connect)
            }
            _ => true,
        }
    }

    fn new_candidate(
        &self,
        entries: &[GuardEntry],
        excluded: &HashSet<RouterIdentity>,
        routers: &HashMap<RouterIdentity, RouterDescriptor>,
    ) -> Option<RouterDescriptor> {
        let mut skip = excluded.clone();
        skip.extend(entries.iter().map(|e| e.identity));
        let candidates: Vec<RouterDescriptor> = routers
            .values()
            .filter(|r| r.flags.is_guard_capable())
            .cloned()
            .collect();
        self.directory
            .select_random_node(&candidates, &skip, 1.0, true, false)
    }
}

async fn write_snapshot(
    state: &Mutex<GuardState>,
    store: &dyn GuardStore,
    save_lock: &tokio::sync::Mutex<()>,
) -> Result<()> {
    let _ordered = save_lock.lock().await;
    let snapshot = lock(state).entries.clone();
    store.save_guards(&snapshot).await
}
