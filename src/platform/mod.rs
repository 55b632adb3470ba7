//! Calls the importer makes against the target virtualization platform.
//!
//! The platform owns persistence for every object here. The reconciler only
//! talks to it through [`PlatformClient`], which keeps the state machine
//! testable against [`MemoryPlatform`].

mod memory;

pub use memory::MemoryPlatform;

use crate::Result;
use crate::condition::{Condition, ConditionStatus, types};
use crate::migration::{MigrationRequest, MigrationStatus, ObjectKey, ObjectMeta, SourceClusterRef};
use crate::source::{Secret, SourceCluster, SourceClusterStatus};
use crate::vm::VirtualMachineDefinition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualMachineImage {
    pub metadata: ObjectMeta,
    /// Prefix for the platform-generated name when `metadata.name` is empty.
    #[serde(default)]
    pub generate_name: Option<String>,
    /// UID of the owning migration request; cleared once the import completes.
    #[serde(default)]
    pub owner_uid: Option<String>,
    pub display_name: String,
    pub url: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Outcome of an image import as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportState {
    Pending,
    Imported,
    Failed(String),
}

impl VirtualMachineImage {
    pub fn import_state(&self) -> ImportState {
        let imported = self.conditions.iter().find(|c| c.type_ == types::IMPORTED);
        match imported {
            Some(c) if c.status == ConditionStatus::True => ImportState::Imported,
            Some(c) if c.status == ConditionStatus::False && !c.reason.is_empty() => {
                let detail = if c.message.is_empty() {
                    c.reason.clone()
                } else {
                    format!("{}: {}", c.reason, c.message)
                };
                ImportState::Failed(detail)
            }
            _ => ImportState::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeClaim {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub storage_class: Option<String>,
    pub size_bytes: u64,
    /// Image the volume is populated from.
    pub image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualMachine {
    pub definition: VirtualMachineDefinition,
    #[serde(default)]
    pub ready: bool,
}

#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn get_migration(&self, key: &ObjectKey) -> Result<Option<MigrationRequest>>;

    async fn update_migration_status(&self, key: &ObjectKey, status: &MigrationStatus)
        -> Result<()>;

    /// Release a deleted migration request once its cleanup has run.
    async fn finalize_migration(&self, key: &ObjectKey) -> Result<()>;

    async fn get_source_cluster(&self, reference: &SourceClusterRef) -> Result<Option<SourceCluster>>;

    async fn update_source_cluster_status(
        &self,
        key: &ObjectKey,
        status: &SourceClusterStatus,
    ) -> Result<()>;

    async fn get_secret(&self, key: &ObjectKey) -> Result<Option<Secret>>;

    async fn storage_class_exists(&self, name: &str) -> Result<bool>;

    async fn network_exists(&self, key: &ObjectKey) -> Result<bool>;

    /// Create an image registration, filling in a generated name.
    async fn create_image(&self, image: VirtualMachineImage) -> Result<VirtualMachineImage>;

    async fn get_image(&self, key: &ObjectKey) -> Result<Option<VirtualMachineImage>>;

    async fn delete_image(&self, key: &ObjectKey) -> Result<()>;

    async fn remove_image_owner(&self, key: &ObjectKey) -> Result<()>;

    async fn get_volume_claim(&self, key: &ObjectKey) -> Result<Option<VolumeClaim>>;

    async fn create_volume_claim(&self, claim: VolumeClaim) -> Result<VolumeClaim>;

    async fn list_virtual_machines_by_label(
        &self,
        namespace: &str,
        label: &str,
        value: &str,
    ) -> Result<Vec<VirtualMachine>>;

    async fn create_virtual_machine(&self, definition: VirtualMachineDefinition)
        -> Result<VirtualMachine>;

    async fn get_virtual_machine(&self, key: &ObjectKey) -> Result<Option<VirtualMachine>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_with(condition: Option<Condition>) -> VirtualMachineImage {
        VirtualMachineImage {
            metadata: ObjectMeta::default(),
            generate_name: None,
            owner_uid: None,
            display_name: "disk".into(),
            url: "http://127.0.0.1:8080/disk.img".into(),
            conditions: condition.into_iter().collect(),
        }
    }

    #[test]
    fn import_state_from_conditions() {
        assert_eq!(image_with(None).import_state(), ImportState::Pending);
        assert_eq!(
            image_with(Some(Condition::new(types::IMPORTED, ConditionStatus::True))).import_state(),
            ImportState::Imported
        );
        assert_eq!(
            image_with(Some(Condition::new(types::IMPORTED, ConditionStatus::False)))
                .import_state(),
            ImportState::Pending
        );
        assert_eq!(
            image_with(Some(
                Condition::new(types::IMPORTED, ConditionStatus::False)
                    .with_reason("DownloadFailed")
                    .with_message("404")
            ))
            .import_state(),
            ImportState::Failed("DownloadFailed: 404".into())
        );
    }
}
