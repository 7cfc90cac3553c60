// Identity enrichment: user id -> profile, filled in batches.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::*;
use crate::backend::Profile;

#[derive(Debug, Default)]
pub(super) struct ProfileCache {
    entries: HashMap<String, Profile>,
    in_flight: HashSet<String>,
}

impl ProfileCache {
    pub fn get(&self, user_id: &str) -> Option<&Profile> {
        self.entries.get(user_id)
    }

    /// Ids that are neither cached nor already being fetched.
    pub fn missing(&self, ids: BTreeSet<String>) -> BTreeSet<String> {
        ids.into_iter()
            .filter(|id| !self.entries.contains_key(id) && !self.in_flight.contains(id))
            .collect()
    }

    pub fn mark_in_flight(&mut self, ids: &BTreeSet<String>) {
        self.in_flight.extend(ids.iter().cloned());
    }

    pub fn finish(&mut self, ids: &BTreeSet<String>) {
        for id in ids {
            self.in_flight.remove(id);
        }
    }

    /// Last write wins per id.
    pub fn merge(&mut self, profiles: Vec<Profile>) -> usize {
        let count = profiles.len();
        for profile in profiles {
            self.entries.insert(profile.id.clone(), profile);
        }
        count
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.in_flight.clear();
    }
}

impl AppCore {
    /// One batched lookup for whichever of `ids` still need resolving.
    pub(super) fn request_enrichment(&mut self, ids: BTreeSet<String>) {
        let ids = self.profiles.missing(ids);
        if ids.is_empty() {
            return;
        }
        let Some(generation) = self.session.as_ref().map(|s| s.generation) else {
            return;
        };
        self.profiles.mark_in_flight(&ids);
        tracing::debug!(count = ids.len(), generation, "resolving profiles");

        let backend = self.backend.clone();
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let result = backend.query_profiles(&ids).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::ProfilesResolved {
                generation,
                ids,
                result,
            })));
        });
    }

    pub(super) fn handle_profiles_resolved(
        &mut self,
        generation: u64,
        ids: BTreeSet<String>,
        result: Result<Vec<Profile>, BackendError>,
    ) {
        if !self.is_current(generation) {
            tracing::debug!(generation, "dropping stale profile lookup");
            return;
        }
        self.profiles.finish(&ids);
        match result {
            Ok(profiles) => {
                let merged = self.profiles.merge(profiles);
                tracing::debug!(requested = ids.len(), merged, "profiles resolved");
                if merged > 0 {
                    self.emit_state();
                }
            }
            Err(e) => tracing::warn!(%e, count = ids.len(), "profile lookup failed"),
        }
    }
}
