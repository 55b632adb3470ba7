//! SourceReady and DiskImagesFailed phases: power the source down and export
//! its disks, or prepare a re-export after failed image imports.

use super::{Context, Step, resolve_adapter};
use crate::condition::{self, Condition, ConditionStatus, types};
use crate::migration::{MigrationRequest, MigrationStatus, ObjectKey, Phase};
use crate::sources::VirtualMachineOperations;
use crate::{Result, log_error, log_info, log_warn};
use chrono::Utc;

fn export_failed(status: MigrationStatus, message: String) -> Result<Step> {
    log_error!("Export failed: {}", message);
    let status = status
        .with_condition(
            Condition::new(types::EXPORT_FAILED, ConditionStatus::True)
                .with_reason("ExportFailed")
                .with_message(message),
        )
        .transition(Phase::MigrationFailed)?;
    Ok(Step::advance(status))
}

pub(super) async fn handle_source_ready(ctx: &Context, request: &MigrationRequest) -> Result<Step> {
    let status = request.status.clone();
    if status.has_condition(types::EXPORTED) {
        return Ok(Step::advance(status.transition(Phase::DisksExported)?));
    }

    let (_, adapter) = resolve_adapter(ctx, &request.spec.source_cluster).await?;

    let status = if status.has_condition(types::POWERED_OFF) {
        status
    } else {
        match power_down(ctx, adapter.as_ref(), request, status).await? {
            PowerState::Off(next) => next,
            PowerState::Pending(step) => return Ok(step),
        }
    };
    export(adapter.as_ref(), request, status).await
}

enum PowerState {
    Off(MigrationStatus),
    Pending(Step),
}

/// Drive the source towards powered off: graceful shutdown first, forced
/// power-off once the grace period has passed.
async fn power_down(
    ctx: &Context,
    adapter: &dyn VirtualMachineOperations,
    request: &MigrationRequest,
    status: MigrationStatus,
) -> Result<PowerState> {
    if !adapter.is_power_off_supported() {
        return Ok(PowerState::Off(status.with_condition(
            Condition::new(types::POWERED_OFF, ConditionStatus::True)
                .with_reason("PowerControlUnsupported"),
        )));
    }

    if adapter.is_powered_off(request).await? {
        log_info!("{} is powered off", request.spec.virtual_machine_name);
        return Ok(PowerState::Off(status.with_condition(
            Condition::new(types::POWERED_OFF, ConditionStatus::True).with_reason("PoweredOff"),
        )));
    }

    let short = ctx.config.requeue.short();
    let Some(powering_off) =
        condition::get(&status.conditions, types::POWERING_OFF, ConditionStatus::True).cloned()
    else {
        let status = if request.spec.force_power_off {
            adapter.power_off(request).await?;
            status
                .with_condition(
                    Condition::new(types::POWER_OFF_FORCED, ConditionStatus::True)
                        .with_reason("ForcePowerOffRequested"),
                )
                .with_condition(
                    Condition::new(types::POWERING_OFF, ConditionStatus::True)
                        .with_reason("ShutdownRequested"),
                )
        } else {
            // A refused shutdown (no guest tools, already stopping) still starts
            // the grace period so the forced power-off below takes over.
            let powering_off = match adapter.shutdown_guest(request).await {
                Ok(()) => Condition::new(types::POWERING_OFF, ConditionStatus::True)
                    .with_reason("ShutdownRequested"),
                Err(err) => {
                    log_warn!(
                        "Guest shutdown of {} failed: {}",
                        request.spec.virtual_machine_name,
                        err
                    );
                    Condition::new(types::POWERING_OFF, ConditionStatus::True)
                        .with_reason("ShutdownFailed")
                        .with_message(err.to_string())
                }
            };
            status.with_condition(powering_off)
        };
        return Ok(PowerState::Pending(Step::wait(status, short)));
    };

    let timeout = request
        .spec
        .graceful_shutdown_timeout_seconds
        .unwrap_or(ctx.config.graceful_shutdown_timeout_seconds);
    let waited = Utc::now() - powering_off.last_transition_time;
    if waited.num_seconds() >= timeout as i64 && !status.has_condition(types::POWER_OFF_FORCED) {
        log_warn!(
            "{} did not shut down within {}s, forcing power off",
            request.spec.virtual_machine_name,
            timeout
        );
        adapter.power_off(request).await?;
        let status = status.with_condition(
            Condition::new(types::POWER_OFF_FORCED, ConditionStatus::True)
                .with_reason("ShutdownTimeout"),
        );
        return Ok(PowerState::Pending(Step::wait(status, short)));
    }
    Ok(PowerState::Pending(Step::wait(status, short)))
}

/// Export failures are not retried; the request is failed for an operator to re-trigger.
async fn export(
    adapter: &dyn VirtualMachineOperations,
    request: &MigrationRequest,
    status: MigrationStatus,
) -> Result<Step> {
    let current = request.clone().with_status(status.clone());
    match adapter.export_disks(&current).await {
        Ok(disks) => {
            log_info!("Exported {} disk(s) of {}", disks.len(), request.spec.virtual_machine_name);
            let mut status = status.with_condition(
                Condition::new(types::EXPORTED, ConditionStatus::True).with_reason("DisksExported"),
            );
            status.disk_info = disks;
            Ok(Step::advance(status.transition(Phase::DisksExported)?))
        }
        Err(e) => export_failed(status, e.to_string()),
    }
}

pub(super) async fn handle_images_failed(ctx: &Context, request: &MigrationRequest) -> Result<Step> {
    let mut status = request.status.clone();
    let namespace = &request.metadata.namespace;

    for disk in status.disk_info.iter_mut() {
        if !disk.has_condition(types::IMAGE_FAILED) {
            continue;
        }
        if let Some(image) = disk.image_name.take() {
            log_info!("Deleting failed image {} of disk {}", image, disk.name);
            ctx.platform.delete_image(&ObjectKey::new(namespace, &image)).await?;
        }
        for type_ in [types::IMAGE_FAILED, types::IMAGE_SUBMITTED] {
            disk.conditions = condition::remove(&disk.conditions, type_, ConditionStatus::True);
        }
    }

    if let Some(max) = ctx.config.max_reexport_attempts {
        if status.reexport_attempts >= max {
            return export_failed(
                status,
                format!("disk images still failing after {} re-export attempt(s)", max),
            );
        }
    }

    status.reexport_attempts += 1;
    log_warn!(
        "Re-exporting failed disks of {} (attempt {})",
        request.spec.virtual_machine_name,
        status.reexport_attempts
    );
    let status = status.without_condition(types::EXPORTED, ConditionStatus::True);
    Ok(Step::advance(status.transition(Phase::SourceReady)?))
}
