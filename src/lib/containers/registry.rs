use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::RwLock;
use tracing::debug;

use super::{
    state::valid_state_transition,
    types::{ContainerRecord, ContainerState, RecordKey, Registry},
};
use crate::lib::{
    error::{ArenaError, ArenaResult},
    ports::types::PortBinding,
};

impl RecordKey {
    pub fn new(team: &str, image: &str) -> Self {
        RecordKey {
            team: team.to_string(),
            image: image.to_string(),
        }
    }

    pub fn owns(&self, binding: &PortBinding) -> bool {
        binding.team == self.team && binding.image == self.image
    }

    pub fn container_name(&self) -> String {
        format!("{}-{}", self.team, self.image)
    }
}

impl ContainerRecord {
    pub fn new(key: &RecordKey) -> Self {
        ContainerRecord {
            team: key.team.clone(),
            image: key.image.clone(),
            container_name: key.container_name(),
            state: ContainerState::Pending,
            port_bindings: Vec::new(),
            environment: BTreeMap::new(),
            runtime_handle: None,
            last_observed_at: None,
            last_error: None,
            exit_code: None,
            start_time: None,
            finish_time: None,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.team, &self.image)
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Returns a snapshot of the record for `key`, creating it in
    /// `pending` when it has never been requested.
    pub async fn get_or_create(&self, key: &RecordKey) -> ContainerRecord {
        if let Some(slot) = self.records.read().await.get(key).cloned() {
            return slot.read().await.clone();
        }

        let mut records = self.records.write().await;
        let slot = records
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(team = %key.team, image = %key.image, "Created container record");
                Arc::new(RwLock::new(ContainerRecord::new(key)))
            })
            .clone();
        drop(records);

        slot.read().await.clone()
    }

    pub async fn get(&self, key: &RecordKey) -> Option<ContainerRecord> {
        let slot = self.records.read().await.get(key).cloned()?;
        Some(slot.read().await.clone())
    }

    /// Applies `mutation` under the record's own lock. The record is only
    /// changed when the mutation succeeds.
    pub async fn update<F>(&self, key: &RecordKey, mutation: F) -> ArenaResult<ContainerRecord>
    where
        F: FnOnce(&mut ContainerRecord) -> ArenaResult<()>,
    {
        let slot = self
            .records
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| ArenaError::NotFound(key.to_string()))?;

        let mut record = slot.write().await;
        let mut next = record.clone();
        mutation(&mut next)?;
        *record = next;
        Ok(record.clone())
    }

    /// Moves the record to `to`, rejecting transitions outside the lifecycle.
    pub async fn transition<F>(
        &self,
        key: &RecordKey,
        to: ContainerState,
        mutation: F,
    ) -> ArenaResult<ContainerRecord>
    where
        F: FnOnce(&mut ContainerRecord),
    {
        self.update(key, |record| {
            if !valid_state_transition(&record.state, &to) {
                return Err(ArenaError::InvalidTransition(format!(
                    "{} from {} to {}",
                    key, record.state, to
                )));
            }
            record.state = to;
            mutation(record);
            Ok(())
        })
        .await
    }

    /// Snapshot of every record owned by `team`. Later mutations are not
    /// reflected; iterate the returned list as often as needed.
    pub async fn list(&self, team: &str) -> Vec<ContainerRecord> {
        let slots: Vec<_> = self
            .records
            .read()
            .await
            .iter()
            .filter(|(key, _)| key.team == team)
            .map(|(_, slot)| slot.clone())
            .collect();

        let mut records = Vec::with_capacity(slots.len());
        for slot in slots {
            records.push(slot.read().await.clone());
        }
        records.sort_by(|a, b| a.image.cmp(&b.image));
        records
    }

    /// Snapshot of every record across all teams.
    pub async fn all(&self) -> Vec<ContainerRecord> {
        let slots: Vec<_> = self.records.read().await.values().cloned().collect();
        let mut records = Vec::with_capacity(slots.len());
        for slot in slots {
            records.push(slot.read().await.clone());
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let registry = Arc::new(Registry::new());
        let key = RecordKey::new("alpha", "carla");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { registry.get_or_create(&key).await }));
        }
        for handle in handles {
            let record = handle.await.unwrap();
            assert_eq!(record.state, ContainerState::Pending);
            assert_eq!(record.container_name, "alpha-carla");
        }
        assert_eq!(registry.records.read().await.len(), 1);
    }

    #[tokio::test]
    async fn update_missing_record_is_not_found() {
        let registry = Registry::new();
        let err = registry
            .update(&RecordKey::new("ghost", "carla"), |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, ArenaError::NotFound(_)));
    }

    #[tokio::test]
    async fn failed_mutation_leaves_record_untouched() {
        let registry = Registry::new();
        let key = RecordKey::new("alpha", "carla");
        registry.get_or_create(&key).await;

        let err = registry
            .transition(&key, ContainerState::Running, |record| {
                record.runtime_handle = Some("abc".into())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ArenaError::InvalidTransition(_)));

        let record = registry.get(&key).await.unwrap();
        assert_eq!(record.state, ContainerState::Pending);
        assert!(record.runtime_handle.is_none());
    }

    #[tokio::test]
    async fn list_is_a_snapshot_per_team() {
        let registry = Registry::new();
        registry.get_or_create(&RecordKey::new("alpha", "b-image")).await;
        registry.get_or_create(&RecordKey::new("alpha", "a-image")).await;
        registry.get_or_create(&RecordKey::new("beta", "a-image")).await;

        let snapshot = registry.list("alpha").await;
        registry
            .transition(&RecordKey::new("alpha", "a-image"), ContainerState::Starting, |_| {})
            .await
            .unwrap();

        let images: Vec<_> = snapshot.iter().map(|r| r.image.as_str()).collect();
        assert_eq!(images, vec!["a-image", "b-image"]);
        assert!(snapshot.iter().all(|r| r.state == ContainerState::Pending));
        assert_eq!(registry.all().await.len(), 3);
    }
}
