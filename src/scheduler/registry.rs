//! Per-team index of job ids.
//!
//! Append-only: entries are never pruned here. It exists so dashboards can list
//! a team's jobs without scanning every lane; dispatch never reads it.

use std::sync::Arc;

use crate::error::StoreError;
use crate::store::QueueStore;

use super::keys::KeySpace;

#[derive(Clone)]
pub struct TeamJobRegistry {
    store: Arc<dyn QueueStore>,
    keys: KeySpace,
}

impl TeamJobRegistry {
    pub fn new(store: Arc<dyn QueueStore>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    pub async fn add_to_team(&self, team_id: &str, job_id: &str) -> Result<(), StoreError> {
        self.store.set_add(&self.keys.team_jobs(team_id), job_id).await
    }

    /// Returns every job id registered for the team, sorted.
    pub async fn get_team_job_ids(&self, team_id: &str) -> Result<Vec<String>, StoreError> {
        let mut ids = self.store.set_members(&self.keys.team_jobs(team_id)).await?;
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_team_registry_is_a_set_per_team() {
        let registry = TeamJobRegistry::new(Arc::new(MemoryStore::new()), KeySpace::new("test"));

        registry.add_to_team("team-a", "j2").await.unwrap();
        registry.add_to_team("team-a", "j1").await.unwrap();
        registry.add_to_team("team-a", "j1").await.unwrap();
        registry.add_to_team("team-b", "j3").await.unwrap();

        assert_eq!(registry.get_team_job_ids("team-a").await.unwrap(), vec!["j1", "j2"]);
        assert_eq!(registry.get_team_job_ids("team-b").await.unwrap(), vec!["j3"]);
        assert!(registry.get_team_job_ids("team-c").await.unwrap().is_empty());
    }
}
