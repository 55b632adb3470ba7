//! Pre-flight validation of migration requests.

use crate::migration::MigrationRequest;
use crate::network;
use crate::reconciler::{Context, resolve_adapter};
use crate::source::validate_reference;
use crate::sources::sanitize_target_name;
use crate::{ImportError, Result, log_debug, log_info};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Serialize)]
pub struct CheckStatus {
    pub name: &'static str,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreflightSummary {
    pub migration: String,
    pub source: String,
    pub target_name: Option<String>,
    pub checks: Vec<CheckStatus>,
    pub issues: Vec<String>,
}

impl PreflightSummary {
    pub fn is_ready(&self) -> bool {
        self.issues.is_empty()
    }

    fn passed(&self, name: &str) -> bool {
        self.checks.iter().any(|c| c.name == name && c.passed)
    }

    fn record(&mut self, name: &'static str, issues: Vec<String>) {
        self.checks.push(CheckStatus {
            name,
            passed: issues.is_empty(),
        });
        self.issues.extend(issues);
    }
}

impl fmt::Display for PreflightSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Migration preflight for {} (source: {})",
            self.migration, self.source
        )?;
        writeln!(f, "\nChecks:")?;
        for check in &self.checks {
            writeln!(
                f,
                "  - {}: {}",
                check.name,
                if check.passed { "ok" } else { "failed" }
            )?;
        }
        if let Some(name) = &self.target_name {
            writeln!(f, "\nTarget VM name: {}", name)?;
        }
        if self.issues.is_empty() {
            writeln!(f, "\n✅ Ready to import")
        } else {
            writeln!(f, "\n⚠ Issues:")?;
            for issue in &self.issues {
                writeln!(f, "  - {}", issue)?;
            }
            Ok(())
        }
    }
}

/// Errors that describe a problem with the request rather than a passing outage.
fn into_issue(err: ImportError) -> Result<String> {
    if err.is_terminal() || matches!(err, ImportError::NotFound { .. }) {
        Ok(err.to_string())
    } else {
        Err(err)
    }
}

/// Checks that need nothing but the request itself.
pub fn check_request(request: &MigrationRequest) -> PreflightSummary {
    let mut summary = PreflightSummary {
        migration: request.key().to_string(),
        source: request.spec.source_cluster.to_string(),
        target_name: None,
        checks: Vec::new(),
        issues: Vec::new(),
    };

    let reference = validate_reference(&request.spec.source_cluster)
        .err()
        .map(|e| e.to_string());
    summary.record("source reference", reference.into_iter().collect());

    match sanitize_target_name(&request.spec.virtual_machine_name) {
        Ok(name) => {
            summary.target_name = Some(name);
            summary.record("target name", Vec::new());
        }
        Err(e) => summary.record("target name", vec![e.to_string()]),
    }

    let mut mapping_issues: Vec<String> = network::check_duplicate_sources(&request.spec.mapping)
        .err()
        .map(|e| e.to_string())
        .into_iter()
        .collect();
    for entry in &request.spec.mapping {
        if let Err(e) = network::destination_key(&entry.destination_network, &request.metadata.namespace) {
            mapping_issues.push(e.to_string());
        }
    }
    summary.record("network mapping", mapping_issues);

    summary
}

/// Full pre-flight: the offline checks plus lookups against the platform and
/// the source. Outages are returned as errors so the caller can retry; every
/// problem with the request itself lands in the summary.
pub async fn run_preflight(ctx: &Context, request: &MigrationRequest) -> Result<PreflightSummary> {
    log_info!("Running preflight checks for {}", request.key());
    let mut summary = check_request(request);

    let mut storage_issues = Vec::new();
    if let Some(class) = &request.spec.storage_class {
        if !ctx.platform.storage_class_exists(class).await? {
            storage_issues.push(format!("storage class '{}' does not exist", class));
        }
    }
    summary.record("storage class", storage_issues);

    let mut network_issues = Vec::new();
    if summary.passed("network mapping") {
        for entry in &request.spec.mapping {
            let key = network::destination_key(&entry.destination_network, &request.metadata.namespace)?;
            if !ctx.platform.network_exists(&key).await? {
                network_issues.push(format!("destination network {} does not exist", key));
            }
        }
    }
    summary.record("destination networks", network_issues);

    if !summary.passed("source reference") {
        return Ok(summary);
    }

    let adapter = match resolve_adapter(ctx, &request.spec.source_cluster).await {
        Ok((cluster, adapter)) => {
            if cluster.is_ready() {
                summary.record("source cluster", Vec::new());
                Some(adapter)
            } else {
                summary.record(
                    "source cluster",
                    vec![format!("{} is not ready", request.spec.source_cluster)],
                );
                None
            }
        }
        Err(e) => {
            summary.record("source cluster", vec![into_issue(e)?]);
            None
        }
    };

    if let Some(adapter) = adapter {
        let issues = match adapter.pre_flight_checks(request).await {
            Ok(()) => Vec::new(),
            Err(e) => vec![into_issue(e)?],
        };
        summary.record("source virtual machine", issues);
    }

    log_debug!("Preflight for {} found {} issue(s)", request.key(), summary.issues.len());
    Ok(summary)
}
