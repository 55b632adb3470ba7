//! New and ImportValid phases: decide whether a request can be imported at all.

use super::{Context, Step, resolve_adapter};
use crate::condition::{Condition, ConditionStatus, types};
use crate::migration::{MigrationRequest, MigrationStatus, Phase};
use crate::preflight::run_preflight;
use crate::sources::is_dns_label;
use crate::{Result, log_info, log_warn};

fn invalid(status: MigrationStatus, reason: &str, message: String) -> Result<Step> {
    log_warn!("Import is invalid: {}", message);
    let status = status
        .with_condition(
            Condition::new(types::VALIDATION_FAILED, ConditionStatus::True)
                .with_reason(reason)
                .with_message(message),
        )
        .transition(Phase::ImportInvalid)?;
    Ok(Step::advance(status))
}

pub(super) async fn handle_new(ctx: &Context, request: &MigrationRequest) -> Result<Step> {
    let status = request.status.clone();
    if request.spec.skip_preflight_checks {
        log_info!("Skipping preflight checks for {}", request.key());
        return Ok(Step::advance(status.transition(Phase::ImportValid)?));
    }

    let summary = run_preflight(ctx, request).await?;
    if !summary.is_ready() {
        return invalid(status, "PreflightFailed", summary.issues.join("; "));
    }
    Ok(Step::advance(status.transition(Phase::ImportValid)?))
}

pub(super) async fn handle_import_valid(ctx: &Context, request: &MigrationRequest) -> Result<Step> {
    let status = request.status.clone();
    let adapter = match resolve_adapter(ctx, &request.spec.source_cluster).await {
        Ok((_, adapter)) => adapter,
        Err(e) if e.is_terminal() => return invalid(status, "UnsupportedSource", e.to_string()),
        Err(e) => return Err(e),
    };

    let name = match adapter.sanitize_target_name(request) {
        Ok(name) => name,
        Err(e) if e.is_terminal() => return invalid(status, "InvalidName", e.to_string()),
        Err(e) => return Err(e),
    };
    if !is_dns_label(&name) {
        return invalid(
            status,
            "InvalidName",
            format!("'{}' is not a valid DNS label", name),
        );
    }

    log_info!("Importing {} as {}", request.spec.virtual_machine_name, name);
    let mut status = status;
    status.target_vm_name = name;
    Ok(Step::advance(status.transition(Phase::SourceReady)?))
}
