//! Teardown: after success, after an absorbing failure, and on deletion.
//!
//! Cleanup is best effort. Failures are logged and never hold up the state
//! machine.

use super::{Context, Step, resolve_adapter};
use crate::condition::{Condition, ConditionStatus, types};
use crate::error::ErrorList;
use crate::migration::{MigrationRequest, ObjectKey};
use crate::{log_info, log_warn};

async fn run_adapter_cleanup(ctx: &Context, request: &MigrationRequest, errors: &mut ErrorList) {
    match resolve_adapter(ctx, &request.spec.source_cluster).await {
        Ok((_, adapter)) => errors.record("source cleanup", adapter.cleanup(request).await),
        Err(e) => errors.push("resolve source", e),
    }
}

fn report(request: &MigrationRequest, errors: ErrorList) {
    if let Err(e) = errors.into_result() {
        log_warn!("Cleanup of {} was incomplete: {}", request.key(), e);
    }
}

fn cleaned_up(request: &MigrationRequest) -> Step {
    Step::done(
        request.status.clone().with_condition(
            Condition::new(types::CLEANUP_COMPLETE, ConditionStatus::True)
                .with_reason("CleanupAttempted"),
        ),
    )
}

pub(super) async fn handle_running(ctx: &Context, request: &MigrationRequest) -> Step {
    if request.status.has_condition(types::CLEANUP_COMPLETE) {
        return Step::done(request.status.clone());
    }

    let mut errors = ErrorList::new();
    // Imported images outlive the request once the VM runs from them.
    for disk in &request.status.disk_info {
        if let Some(image) = &disk.image_name {
            let key = ObjectKey::new(&request.metadata.namespace, image);
            errors.record(
                &format!("release image {}", key),
                ctx.platform.remove_image_owner(&key).await,
            );
        }
    }
    run_adapter_cleanup(ctx, request, &mut errors).await;
    report(request, errors);

    log_info!("Migration {} completed", request.key());
    cleaned_up(request)
}

pub(super) async fn handle_failed(ctx: &Context, request: &MigrationRequest) -> Step {
    if request.status.has_condition(types::CLEANUP_COMPLETE) {
        return Step::done(request.status.clone());
    }

    let mut errors = ErrorList::new();
    run_adapter_cleanup(ctx, request, &mut errors).await;
    report(request, errors);
    cleaned_up(request)
}

pub(super) async fn handle_deletion(ctx: &Context, request: &MigrationRequest) {
    log_info!("Migration {} deleted, cleaning up", request.key());
    let mut errors = ErrorList::new();
    run_adapter_cleanup(ctx, request, &mut errors).await;
    report(request, errors);
}
