use super::{ImportState, PlatformClient, VirtualMachine, VirtualMachineImage, VolumeClaim};
use crate::condition::{self, Condition, ConditionStatus, types};
use crate::migration::{MigrationRequest, MigrationStatus, ObjectKey, SourceClusterRef};
use crate::source::{Secret, SourceCluster, SourceClusterStatus};
use crate::vm::VirtualMachineDefinition;
use crate::{ImportError, Result, log_debug};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct State {
    migrations: BTreeMap<ObjectKey, MigrationRequest>,
    sources: BTreeMap<ObjectKey, SourceCluster>,
    secrets: BTreeMap<ObjectKey, Secret>,
    storage_classes: BTreeSet<String>,
    networks: BTreeSet<ObjectKey>,
    images: BTreeMap<ObjectKey, VirtualMachineImage>,
    claims: BTreeMap<ObjectKey, VolumeClaim>,
    vms: BTreeMap<ObjectKey, VirtualMachine>,
    name_counter: u64,
}

/// In-process platform used for dry runs and tests.
///
/// Image imports and VM readiness do not progress on their own; drive them
/// with [`MemoryPlatform::set_image_state`] and [`MemoryPlatform::set_vm_ready`].
#[derive(Clone, Default)]
pub struct MemoryPlatform {
    state: Arc<Mutex<State>>,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| ImportError::Platform("platform state lock poisoned".to_string()))
    }

    /// Store `request`, assigning a uid the way an API server would when it has none.
    pub fn insert_migration(&self, mut request: MigrationRequest) -> Result<()> {
        if request.metadata.uid.is_empty() {
            request.metadata.uid = Uuid::new_v4().to_string();
        }
        self.state()?.migrations.insert(request.key(), request);
        Ok(())
    }

    pub fn insert_source_cluster(&self, cluster: SourceCluster) -> Result<()> {
        self.state()?.sources.insert(cluster.key(), cluster);
        Ok(())
    }

    pub fn insert_secret(&self, secret: Secret) -> Result<()> {
        let key = ObjectKey::new(&secret.metadata.namespace, &secret.metadata.name);
        self.state()?.secrets.insert(key, secret);
        Ok(())
    }

    pub fn add_storage_class(&self, name: &str) -> Result<()> {
        self.state()?.storage_classes.insert(name.to_string());
        Ok(())
    }

    pub fn add_network(&self, key: ObjectKey) -> Result<()> {
        self.state()?.networks.insert(key);
        Ok(())
    }

    /// Flag a migration request for deletion, as an API delete would.
    pub fn request_deletion(&self, key: &ObjectKey) -> Result<()> {
        let mut state = self.state()?;
        let request = state
            .migrations
            .get_mut(key)
            .ok_or_else(|| ImportError::not_found("MigrationRequest", key.to_string()))?;
        request.metadata.deletion_requested = true;
        Ok(())
    }

    pub fn migration(&self, key: &ObjectKey) -> Result<Option<MigrationRequest>> {
        Ok(self.state()?.migrations.get(key).cloned())
    }

    pub fn source_cluster(&self, key: &ObjectKey) -> Result<Option<SourceCluster>> {
        Ok(self.state()?.sources.get(key).cloned())
    }

    pub fn images(&self) -> Result<Vec<VirtualMachineImage>> {
        Ok(self.state()?.images.values().cloned().collect())
    }

    pub fn volume_claims(&self) -> Result<Vec<VolumeClaim>> {
        Ok(self.state()?.claims.values().cloned().collect())
    }

    pub fn virtual_machines(&self) -> Result<Vec<VirtualMachine>> {
        Ok(self.state()?.vms.values().cloned().collect())
    }

    pub fn set_image_state(&self, key: &ObjectKey, import: ImportState) -> Result<()> {
        let mut state = self.state()?;
        let image = state
            .images
            .get_mut(key)
            .ok_or_else(|| ImportError::not_found("VirtualMachineImage", key.to_string()))?;
        let cond = match import {
            ImportState::Pending => Condition::new(types::IMPORTED, ConditionStatus::Unknown),
            ImportState::Imported => Condition::new(types::IMPORTED, ConditionStatus::True),
            ImportState::Failed(reason) => Condition::new(types::IMPORTED, ConditionStatus::False)
                .with_reason("ImportFailed")
                .with_message(reason),
        };
        image.conditions = condition::upsert(&image.conditions, cond);
        Ok(())
    }

    pub fn set_vm_ready(&self, key: &ObjectKey, ready: bool) -> Result<()> {
        let mut state = self.state()?;
        let vm = state
            .vms
            .get_mut(key)
            .ok_or_else(|| ImportError::not_found("VirtualMachine", key.to_string()))?;
        vm.ready = ready;
        Ok(())
    }
}

#[async_trait]
impl PlatformClient for MemoryPlatform {
    async fn get_migration(&self, key: &ObjectKey) -> Result<Option<MigrationRequest>> {
        self.migration(key)
    }

    async fn update_migration_status(
        &self,
        key: &ObjectKey,
        status: &MigrationStatus,
    ) -> Result<()> {
        let mut state = self.state()?;
        let request = state
            .migrations
            .get_mut(key)
            .ok_or_else(|| ImportError::not_found("MigrationRequest", key.to_string()))?;
        request.status = status.clone();
        Ok(())
    }

    async fn finalize_migration(&self, key: &ObjectKey) -> Result<()> {
        let mut state = self.state()?;
        let Some(request) = state.migrations.remove(key) else {
            return Ok(());
        };
        // Owned images go with their owner.
        let uid = request.metadata.uid;
        state
            .images
            .retain(|_, image| image.owner_uid.as_deref() != Some(uid.as_str()));
        log_debug!("Finalized migration {}", key);
        Ok(())
    }

    async fn get_source_cluster(
        &self,
        reference: &SourceClusterRef,
    ) -> Result<Option<SourceCluster>> {
        let state = self.state()?;
        Ok(state
            .sources
            .get(&reference.key())
            .filter(|cluster| cluster.kind().as_str() == reference.kind)
            .cloned())
    }

    async fn update_source_cluster_status(
        &self,
        key: &ObjectKey,
        status: &SourceClusterStatus,
    ) -> Result<()> {
        let mut state = self.state()?;
        let cluster = state
            .sources
            .get_mut(key)
            .ok_or_else(|| ImportError::not_found("SourceCluster", key.to_string()))?;
        cluster.status = status.clone();
        Ok(())
    }

    async fn get_secret(&self, key: &ObjectKey) -> Result<Option<Secret>> {
        Ok(self.state()?.secrets.get(key).cloned())
    }

    async fn storage_class_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state()?.storage_classes.contains(name))
    }

    async fn network_exists(&self, key: &ObjectKey) -> Result<bool> {
        Ok(self.state()?.networks.contains(key))
    }

    async fn create_image(&self, mut image: VirtualMachineImage) -> Result<VirtualMachineImage> {
        let mut state = self.state()?;
        if image.metadata.name.is_empty() {
            state.name_counter += 1;
            let prefix = image.generate_name.clone().unwrap_or_else(|| "image-".to_string());
            image.metadata.name = format!("{}{:05}", prefix, state.name_counter);
        }
        let key = ObjectKey::new(&image.metadata.namespace, &image.metadata.name);
        if state.images.contains_key(&key) {
            return Err(ImportError::Platform(format!("image {} already exists", key)));
        }
        state.images.insert(key, image.clone());
        Ok(image)
    }

    async fn get_image(&self, key: &ObjectKey) -> Result<Option<VirtualMachineImage>> {
        Ok(self.state()?.images.get(key).cloned())
    }

    async fn delete_image(&self, key: &ObjectKey) -> Result<()> {
        self.state()?.images.remove(key);
        Ok(())
    }

    async fn remove_image_owner(&self, key: &ObjectKey) -> Result<()> {
        let mut state = self.state()?;
        if let Some(image) = state.images.get_mut(key) {
            image.owner_uid = None;
        }
        Ok(())
    }

    async fn get_volume_claim(&self, key: &ObjectKey) -> Result<Option<VolumeClaim>> {
        Ok(self.state()?.claims.get(key).cloned())
    }

    async fn create_volume_claim(&self, claim: VolumeClaim) -> Result<VolumeClaim> {
        let mut state = self.state()?;
        let key = ObjectKey::new(&claim.metadata.namespace, &claim.metadata.name);
        if state.claims.contains_key(&key) {
            return Err(ImportError::Platform(format!(
                "volume claim {} already exists",
                key
            )));
        }
        state.claims.insert(key, claim.clone());
        Ok(claim)
    }

    async fn list_virtual_machines_by_label(
        &self,
        namespace: &str,
        label: &str,
        value: &str,
    ) -> Result<Vec<VirtualMachine>> {
        let state = self.state()?;
        Ok(state
            .vms
            .values()
            .filter(|vm| {
                vm.definition.namespace == namespace
                    && vm.definition.labels.get(label).map(String::as_str) == Some(value)
            })
            .cloned()
            .collect())
    }

    async fn create_virtual_machine(
        &self,
        definition: VirtualMachineDefinition,
    ) -> Result<VirtualMachine> {
        let mut state = self.state()?;
        let key = ObjectKey::new(&definition.namespace, &definition.name);
        if state.vms.contains_key(&key) {
            return Err(ImportError::Platform(format!(
                "virtual machine {} already exists",
                key
            )));
        }
        let vm = VirtualMachine {
            definition,
            ready: false,
        };
        state.vms.insert(key, vm.clone());
        Ok(vm)
    }

    async fn get_virtual_machine(&self, key: &ObjectKey) -> Result<Option<VirtualMachine>> {
        Ok(self.state()?.vms.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::ObjectMeta;

    fn image(namespace: &str) -> VirtualMachineImage {
        VirtualMachineImage {
            metadata: ObjectMeta {
                namespace: namespace.into(),
                ..Default::default()
            },
            generate_name: Some("image-".into()),
            owner_uid: Some("uid-1".into()),
            display_name: "web-disk-0".into(),
            url: "http://127.0.0.1:8080/web-disk-0.img".into(),
            conditions: Vec::new(),
        }
    }

    #[test]
    fn inserted_migrations_get_a_uid() {
        let platform = MemoryPlatform::new();
        let mut request = crate::sources::test_support::request("web", Vec::new());
        request.metadata.uid.clear();
        let key = request.key();
        platform.insert_migration(request).unwrap();
        let stored = platform.migration(&key).unwrap().unwrap();
        assert!(Uuid::parse_str(&stored.metadata.uid).is_ok());
    }

    #[tokio::test]
    async fn generated_image_names_are_unique() {
        let platform = MemoryPlatform::new();
        let a = platform.create_image(image("default")).await.unwrap();
        let b = platform.create_image(image("default")).await.unwrap();
        assert_ne!(a.metadata.name, b.metadata.name);
        assert!(a.metadata.name.starts_with("image-"));
    }

    #[tokio::test]
    async fn removing_owner_keeps_image_after_finalize() {
        let platform = MemoryPlatform::new();
        let owned = platform.create_image(image("default")).await.unwrap();
        let kept = platform.create_image(image("default")).await.unwrap();
        let kept_key = ObjectKey::new("default", &kept.metadata.name);
        platform.remove_image_owner(&kept_key).await.unwrap();

        let mut state = platform.state().unwrap();
        state.migrations.insert(
            ObjectKey::new("default", "web"),
            serde_json::from_value(serde_json::json!({
                "metadata": {"name": "web", "namespace": "default", "uid": "uid-1"},
                "spec": {
                    "source_cluster": {
                        "kind": "OvaSource", "name": "s", "namespace": "default",
                        "apiVersion": "migration.harbor.io/v1beta1"
                    },
                    "virtual_machine_name": "web"
                }
            }))
            .unwrap(),
        );
        drop(state);

        platform
            .finalize_migration(&ObjectKey::new("default", "web"))
            .await
            .unwrap();
        let images = platform.images().unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].metadata.name, kept.metadata.name);
        assert_ne!(images[0].metadata.name, owned.metadata.name);
    }
}
