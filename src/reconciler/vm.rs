//! DiskImagesReady and VirtualMachineCreated phases: materialize volumes,
//! create the destination VM and wait for it to come up.

use super::{Context, Step, resolve_adapter};
use crate::condition::{self, Condition, ConditionStatus, types};
use crate::migration::{MigrationRequest, ObjectKey, ObjectMeta, Phase};
use crate::platform::VolumeClaim;
use crate::vm::IMPORTED_LABEL;
use crate::{ImportError, Result, log_debug, log_info};
use std::collections::BTreeMap;

/// Claim name for disk `index`; stable so re-runs find existing claims.
pub(super) fn claim_name(target: &str, index: usize) -> String {
    format!("{}-disk-{}", target, index)
}

pub(super) async fn handle_images_ready(ctx: &Context, request: &MigrationRequest) -> Result<Step> {
    let mut status = request.status.clone();
    let namespace = &request.metadata.namespace;
    let target = status.target_vm_name.clone();

    let existing = ctx
        .platform
        .list_virtual_machines_by_label(namespace, IMPORTED_LABEL, &request.import_label_value())
        .await?;
    if let Some(vm) = existing.first() {
        log_info!("Virtual machine {} already exists", vm.definition.name);
        return Ok(Step::advance(status.transition(Phase::VirtualMachineCreated)?));
    }

    for (index, disk) in status.disk_info.iter_mut().enumerate() {
        if disk.has_condition(types::VOLUME_CLAIM_CREATED) {
            continue;
        }
        let name = claim_name(&target, index);
        let key = ObjectKey::new(namespace, &name);
        if ctx.platform.get_volume_claim(&key).await?.is_none() {
            let image = disk.image_name.clone().ok_or_else(|| {
                ImportError::Platform(format!("disk {} has no image registration", disk.name))
            })?;
            ctx.platform
                .create_volume_claim(VolumeClaim {
                    metadata: ObjectMeta {
                        name: name.clone(),
                        namespace: namespace.clone(),
                        labels: BTreeMap::from([(
                            IMPORTED_LABEL.to_string(),
                            request.import_label_value(),
                        )]),
                        ..Default::default()
                    },
                    storage_class: request.spec.storage_class.clone(),
                    size_bytes: disk.size_bytes,
                    image,
                })
                .await?;
            log_debug!("Created volume claim {}", key);
        }
        disk.conditions = condition::upsert(
            &disk.conditions,
            Condition::new(types::VOLUME_CLAIM_CREATED, ConditionStatus::True)
                .with_reason("ClaimCreated"),
        );
    }

    let (_, adapter) = resolve_adapter(ctx, &request.spec.source_cluster).await?;
    let current = request.clone().with_status(status.clone());
    let definition = adapter
        .synthesize_target_vm(&current)
        .await?
        .with_label(IMPORTED_LABEL, request.import_label_value())
        .with_disks(
            status
                .disk_info
                .iter()
                .enumerate()
                .map(|(index, disk)| (claim_name(&target, index), disk.bus_type)),
        );

    let vm = ctx.platform.create_virtual_machine(definition).await?;
    log_info!(
        "Created virtual machine {}/{}",
        vm.definition.namespace,
        vm.definition.name
    );
    Ok(Step::advance(status.transition(Phase::VirtualMachineCreated)?))
}

pub(super) async fn handle_vm_created(ctx: &Context, request: &MigrationRequest) -> Result<Step> {
    let status = request.status.clone();
    let key = ObjectKey::new(&request.metadata.namespace, &status.target_vm_name);
    let vm = ctx
        .platform
        .get_virtual_machine(&key)
        .await?
        .ok_or_else(|| ImportError::not_found("VirtualMachine", key.to_string()))?;

    if vm.ready {
        log_info!("Virtual machine {} is running", key);
        return Ok(Step::advance(status.transition(Phase::VirtualMachineRunning)?));
    }
    log_debug!("Virtual machine {} is not ready yet", key);
    Ok(Step::wait(status, ctx.config.requeue.long()))
}
