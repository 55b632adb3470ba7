//! Staged migration state machine.
//!
//! Each phase of a migration request is handled by a dedicated module. A
//! handler receives the request as read from the platform and returns the
//! status it should have next together with when to look at it again; the
//! dispatcher persists the status only if it changed. Every side effect in a
//! handler is gated by a condition, so re-running a handler after a crash or
//! requeue is safe.

mod cleanup;
mod export;
mod images;
mod validation;
mod vm;

use crate::config::ImportConfig;
use crate::migration::{MigrationRequest, MigrationStatus, ObjectKey, Phase, SourceClusterRef};
use crate::platform::PlatformClient;
use crate::source::{Secret, SourceCluster, validate_reference};
use crate::sources::{SourceResolver, VirtualMachineOperations};
use crate::{ImportError, Result, log_debug, log_info};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// What the controller should do with a key after a reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Requeue(Duration),
    /// Nothing to do until the object changes.
    AwaitChange,
}

impl Action {
    pub fn requeue(after: Duration) -> Self {
        Action::Requeue(after)
    }

    pub fn await_change() -> Self {
        Action::AwaitChange
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Action::Requeue(after) => Some(*after),
            Action::AwaitChange => None,
        }
    }
}

/// Shared state for all reconciles.
pub struct Context {
    pub platform: Arc<dyn PlatformClient>,
    pub sources: Arc<dyn SourceResolver>,
    pub config: Arc<ImportConfig>,
}

impl Context {
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        sources: Arc<dyn SourceResolver>,
        config: Arc<ImportConfig>,
    ) -> Self {
        Self {
            platform,
            sources,
            config,
        }
    }
}

/// Result of one phase handler.
pub(crate) struct Step {
    pub status: MigrationStatus,
    pub action: Action,
}

impl Step {
    /// Move on right away; used after a phase transition.
    pub fn advance(status: MigrationStatus) -> Self {
        Self {
            status,
            action: Action::requeue(Duration::ZERO),
        }
    }

    pub fn wait(status: MigrationStatus, after: Duration) -> Self {
        Self {
            status,
            action: Action::requeue(after),
        }
    }

    pub fn done(status: MigrationStatus) -> Self {
        Self {
            status,
            action: Action::await_change(),
        }
    }
}

/// Fetch the credentials secret a source cluster points at, if any.
pub async fn load_secret(ctx: &Context, cluster: &SourceCluster) -> Result<Option<Secret>> {
    let Some(reference) = cluster.credentials() else {
        return Ok(None);
    };
    let key = ObjectKey::new(&reference.namespace, &reference.name);
    ctx.platform
        .get_secret(&key)
        .await?
        .map(Some)
        .ok_or_else(|| ImportError::not_found("Secret", key.to_string()))
}

/// Resolve a source reference into a fresh adapter. Nothing is cached between
/// reconciles; credentials and endpoints may have changed.
pub async fn resolve_adapter(
    ctx: &Context,
    reference: &SourceClusterRef,
) -> Result<(SourceCluster, Box<dyn VirtualMachineOperations>)> {
    let kind = validate_reference(reference)?;
    let cluster = ctx
        .platform
        .get_source_cluster(reference)
        .await?
        .ok_or_else(|| ImportError::not_found(kind.as_str(), reference.key().to_string()))?;
    let secret = load_secret(ctx, &cluster).await?;
    let adapter = ctx.sources.resolve(&cluster, secret).await?;
    Ok((cluster, adapter))
}

/// Reconcile the migration request stored under `key`.
pub async fn reconcile(ctx: &Context, key: &ObjectKey) -> Result<Action> {
    let Some(request) = ctx.platform.get_migration(key).await? else {
        log_debug!("Migration {} no longer exists", key);
        return Ok(Action::await_change());
    };

    let span = tracing::info_span!(
        "reconcile",
        migration = %key,
        phase = %request.status.phase
    );
    reconcile_request(ctx, request).instrument(span).await
}

async fn reconcile_request(ctx: &Context, request: MigrationRequest) -> Result<Action> {
    let key = request.key();

    if request.metadata.deletion_requested {
        cleanup::handle_deletion(ctx, &request).await;
        ctx.platform.finalize_migration(&key).await?;
        return Ok(Action::await_change());
    }

    let step = match request.status.phase {
        Phase::New => validation::handle_new(ctx, &request).await?,
        Phase::ImportValid => validation::handle_import_valid(ctx, &request).await?,
        Phase::SourceReady => export::handle_source_ready(ctx, &request).await?,
        Phase::DiskImagesFailed => export::handle_images_failed(ctx, &request).await?,
        Phase::DisksExported => images::handle_disks_exported(ctx, &request).await?,
        Phase::DiskImagesSubmitted => images::handle_images_submitted(ctx, &request).await?,
        Phase::DiskImagesReady => vm::handle_images_ready(ctx, &request).await?,
        Phase::VirtualMachineCreated => vm::handle_vm_created(ctx, &request).await?,
        Phase::VirtualMachineRunning => cleanup::handle_running(ctx, &request).await,
        Phase::ImportInvalid | Phase::MigrationFailed => {
            cleanup::handle_failed(ctx, &request).await
        }
    };

    if step.status != request.status {
        ctx.platform.update_migration_status(&key, &step.status).await?;
        if step.status.phase != request.status.phase {
            log_info!(
                "Migration {} moved {} -> {}",
                key,
                request.status.phase,
                step.status.phase
            );
        }
    }
    Ok(step.action)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_requeue_after() {
        assert_eq!(
            Action::requeue(Duration::from_secs(5)).requeue_after(),
            Some(Duration::from_secs(5))
        );
        assert_eq!(Action::await_change().requeue_after(), None);
    }
}
