//! Storage contract consumed by the engine, plus an in-memory implementation
//! used by the CLI and tests.

use crate::{DefinitionId, InstanceId, StoreError, WorkflowDefinition, WorkflowInstance, WorkflowStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait]
pub trait DefinitionRepository: Send + Sync {
    /// Latest version of a definition.
    async fn get_by_id(&self, id: DefinitionId) -> Result<Option<WorkflowDefinition>, StoreError>;

    /// A specific version, as referenced by running instances.
    async fn get_version(
        &self,
        id: DefinitionId,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;

    async fn save(&self, definition: &WorkflowDefinition) -> Result<(), StoreError>;
}

#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn get_by_id(&self, id: InstanceId) -> Result<Option<WorkflowInstance>, StoreError>;

    /// Persist the whole instance document. Atomic per call.
    async fn save(&self, instance: &WorkflowInstance) -> Result<(), StoreError>;

    async fn find_by_status(&self, status: WorkflowStatus) -> Result<Vec<WorkflowInstance>, StoreError>;
}

/// Process-local store keeping every definition version and the latest
/// document of every instance.
#[derive(Clone, Default)]
pub struct MemoryStore {
    definitions: Arc<RwLock<HashMap<DefinitionId, Vec<WorkflowDefinition>>>>,
    instances: Arc<RwLock<HashMap<InstanceId, WorkflowInstance>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }
}

#[async_trait]
impl DefinitionRepository for MemoryStore {
    async fn get_by_id(&self, id: DefinitionId) -> Result<Option<WorkflowDefinition>, StoreError> {
        let definitions = self.definitions.read().await;
        Ok(definitions
            .get(&id)
            .and_then(|versions| versions.iter().max_by_key(|d| d.version))
            .cloned())
    }

    async fn get_version(
        &self,
        id: DefinitionId,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let definitions = self.definitions.read().await;
        Ok(definitions
            .get(&id)
            .and_then(|versions| versions.iter().find(|d| d.version == version))
            .cloned())
    }

    async fn save(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        let mut definitions = self.definitions.write().await;
        let versions = definitions.entry(definition.id).or_default();
        match versions.iter_mut().find(|d| d.version == definition.version) {
            Some(existing) => *existing = definition.clone(),
            None => versions.push(definition.clone()),
        }
        Ok(())
    }
}

#[async_trait]
impl InstanceRepository for MemoryStore {
    async fn get_by_id(&self, id: InstanceId) -> Result<Option<WorkflowInstance>, StoreError> {
        Ok(self.instances.read().await.get(&id).cloned())
    }

    async fn save(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        self.instances
            .write()
            .await
            .insert(instance.id, instance.clone());
        Ok(())
    }

    async fn find_by_status(&self, status: WorkflowStatus) -> Result<Vec<WorkflowInstance>, StoreError> {
        let instances = self.instances.read().await;
        let mut found: Vec<_> = instances
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|i| i.created_at);
        Ok(found)
    }
}
