//! Public profile lookups.
//!
//! Author names and avatars for comments and notifications come from a
//! server function that only exposes public columns. Results are cached
//! and only unknown ids go to the server.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use shoutmap_backend::{Backend, PUBLIC_PROFILES_RPC, PublicProfile};
use tracing::debug;

use crate::{SyncContext, SyncError};

pub struct ProfileCache {
    backend: Arc<dyn Backend>,
    profiles: DashMap<String, PublicProfile>,
}

impl ProfileCache {
    pub fn new(ctx: &SyncContext) -> Self {
        Self {
            backend: Arc::clone(ctx.backend()),
            profiles: DashMap::new(),
        }
    }

    pub fn get(&self, user_id: &str) -> Option<PublicProfile> {
        self.profiles.get(user_id).map(|p| p.value().clone())
    }

    /// Profiles for `user_ids`, fetching only the ones not cached yet.
    /// Ids the server does not know are left out of the result.
    #[tracing::instrument(skip(self, user_ids), fields(requested = user_ids.len()))]
    pub async fn fetch(
        &self,
        user_ids: &[String],
    ) -> Result<HashMap<String, PublicProfile>, SyncError> {
        let mut missing: Vec<&String> = user_ids
            .iter()
            .filter(|id| !self.profiles.contains_key(id.as_str()))
            .collect();
        missing.sort();
        missing.dedup();

        if !missing.is_empty() {
            debug!(missing = missing.len(), "fetching public profiles");
            let value = self
                .backend
                .rpc(PUBLIC_PROFILES_RPC, json!({ "user_ids": missing }))
                .await?;
            let fetched: Vec<PublicProfile> = serde_json::from_value(value)?;
            for profile in fetched {
                self.profiles.insert(profile.id.clone(), profile);
            }
        }

        Ok(user_ids
            .iter()
            .filter_map(|id| self.get(id).map(|p| (id.clone(), p)))
            .collect())
    }

    /// Drop a cached profile, e.g. after the user edits theirs.
    pub fn invalidate(&self, user_id: &str) {
        self.profiles.remove(user_id);
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
