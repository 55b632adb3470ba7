//! DisksExported and DiskImagesSubmitted phases: register converted disks as
//! importable images and wait for the platform to import them.

use super::{Context, Step};
use crate::condition::{self, Condition, ConditionStatus, types};
use crate::migration::{DiskInfo, MigrationRequest, ObjectKey, ObjectMeta, Phase};
use crate::platform::{ImportState, VirtualMachineImage};
use crate::{ImportError, Result, log_info, log_warn};
use std::path::Path;

fn mark(disk: &mut DiskInfo, condition: Condition) {
    disk.conditions = condition::upsert(&disk.conditions, condition);
}

fn image_for(ctx: &Context, request: &MigrationRequest, disk: &DiskInfo) -> VirtualMachineImage {
    let target = &request.status.target_vm_name;
    VirtualMachineImage {
        metadata: ObjectMeta {
            namespace: request.metadata.namespace.clone(),
            ..Default::default()
        },
        generate_name: Some(format!("{}-", target)),
        owner_uid: Some(request.metadata.uid.clone()),
        display_name: format!("{}-{}", target, disk.name),
        url: ctx.config.image_server.url_for(disk.file_name()),
        conditions: Vec::new(),
    }
}

async fn submit(ctx: &Context, request: &MigrationRequest, disk: &DiskInfo) -> Result<String> {
    // The image server can only serve what is on disk.
    if !Path::new(&disk.local_path).exists() {
        return Err(ImportError::not_found("disk image", disk.local_path.clone()));
    }
    let image = ctx.platform.create_image(image_for(ctx, request, disk)).await?;
    log_info!("Submitted {} as image {}", disk.file_name(), image.metadata.name);
    Ok(image.metadata.name)
}

pub(super) async fn handle_disks_exported(ctx: &Context, request: &MigrationRequest) -> Result<Step> {
    let mut status = request.status.clone();
    let mut incomplete = false;

    for disk in status.disk_info.iter_mut() {
        if disk.has_condition(types::IMAGE_SUBMITTED) {
            continue;
        }
        match submit(ctx, request, disk).await {
            Ok(name) => {
                disk.image_name = Some(name);
                mark(
                    disk,
                    Condition::new(types::IMAGE_SUBMITTED, ConditionStatus::True)
                        .with_reason("ImageCreated"),
                );
            }
            Err(e) => {
                log_warn!("Could not submit disk {}: {}", disk.name, e);
                incomplete = true;
                break;
            }
        }
    }

    // Keep what was submitted so far; the rest is retried.
    if incomplete {
        return Ok(Step::wait(status, ctx.config.requeue.short()));
    }
    Ok(Step::advance(status.transition(Phase::DiskImagesSubmitted)?))
}

pub(super) async fn handle_images_submitted(ctx: &Context, request: &MigrationRequest) -> Result<Step> {
    let mut status = request.status.clone();
    let namespace = &request.metadata.namespace;

    for disk in status.disk_info.iter_mut() {
        if disk.has_condition(types::IMAGE_READY) || disk.has_condition(types::IMAGE_FAILED) {
            continue;
        }
        let Some(name) = disk.image_name.clone() else {
            mark(
                disk,
                Condition::new(types::IMAGE_FAILED, ConditionStatus::True)
                    .with_reason("ImageMissing")
                    .with_message("disk was never registered as an image"),
            );
            continue;
        };

        let state = match ctx.platform.get_image(&ObjectKey::new(namespace, &name)).await? {
            Some(image) => image.import_state(),
            None => ImportState::Failed(format!("image {} no longer exists", name)),
        };
        match state {
            ImportState::Pending => {}
            ImportState::Imported => {
                log_info!("Image {} of disk {} is ready", name, disk.name);
                mark(
                    disk,
                    Condition::new(types::IMAGE_READY, ConditionStatus::True).with_reason("Imported"),
                );
            }
            ImportState::Failed(message) => {
                log_warn!("Image {} of disk {} failed: {}", name, disk.name, message);
                mark(
                    disk,
                    Condition::new(types::IMAGE_FAILED, ConditionStatus::True)
                        .with_reason("ImportFailed")
                        .with_message(message),
                );
            }
        }
    }

    let reported = status
        .disk_info
        .iter()
        .all(|d| d.has_condition(types::IMAGE_READY) || d.has_condition(types::IMAGE_FAILED));
    if !reported {
        return Ok(Step::wait(status, ctx.config.requeue.short()));
    }

    let next = if status.disk_info.iter().any(|d| d.has_condition(types::IMAGE_FAILED)) {
        Phase::DiskImagesFailed
    } else {
        Phase::DiskImagesReady
    };
    Ok(Step::advance(status.transition(next)?))
}
