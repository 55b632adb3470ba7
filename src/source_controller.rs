//! Keeps source cluster status in line with whether the source is reachable.

use crate::migration::SourceClusterRef;
use crate::reconciler::{Action, Context, load_secret};
use crate::source::{SourceCluster, SourceClusterStatus};
use crate::{Result, log_debug, log_info, log_warn};
use std::time::Duration;

/// Retry interval for sources that failed their connectivity check.
pub const NOT_READY_REQUEUE: Duration = Duration::from_secs(30);

async fn verify(ctx: &Context, cluster: &SourceCluster) -> Result<()> {
    let secret = load_secret(ctx, cluster).await?;
    let adapter = ctx.sources.resolve(cluster, secret).await?;
    adapter.verify_connectivity().await
}

/// Whether two statuses report the same thing, ignoring timestamps.
fn same_outcome(a: &SourceClusterStatus, b: &SourceClusterStatus) -> bool {
    let summary = |s: &SourceClusterStatus| {
        s.conditions
            .iter()
            .map(|c| (c.type_.clone(), c.status, c.message.clone()))
            .collect::<Vec<_>>()
    };
    a.status == b.status && summary(a) == summary(b)
}

pub async fn reconcile_source(ctx: &Context, reference: &SourceClusterRef) -> Result<Action> {
    let Some(cluster) = ctx.platform.get_source_cluster(reference).await? else {
        log_debug!("{} no longer exists", reference);
        return Ok(Action::await_change());
    };

    let (status, action) = match verify(ctx, &cluster).await {
        Ok(()) => (
            cluster.status.ready(),
            Action::requeue(ctx.config.requeue.long()),
        ),
        Err(e) => {
            log_warn!("{} is not reachable: {}", reference, e);
            (
                cluster.status.not_ready(e.to_string()),
                Action::requeue(NOT_READY_REQUEUE),
            )
        }
    };

    if !same_outcome(&status, &cluster.status) {
        log_info!("{} is now {:?}", reference, status.status);
        ctx.platform
            .update_source_cluster_status(&cluster.key(), &status)
            .await?;
    }
    Ok(action)
}
