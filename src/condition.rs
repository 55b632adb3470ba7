//! Typed, timestamped status markers.
//!
//! A ledger holds at most one condition per type. Phase handlers check for a
//! "done" condition before performing a side effect, so every step can be
//! re-run after a crash or requeue. The functions here are pure: they take a
//! ledger and return the new one, persistence is up to the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Condition types recorded on migration requests, their disks and source clusters.
pub mod types {
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    pub const POWERING_OFF: &str = "VirtualMachinePoweringOff";
    pub const POWER_OFF_FORCED: &str = "VirtualMachinePowerOffForced";
    pub const POWERED_OFF: &str = "VirtualMachinePoweredOff";
    pub const EXPORTED: &str = "VirtualMachineExported";
    pub const EXPORT_FAILED: &str = "ExportFailed";
    pub const CLEANUP_COMPLETE: &str = "CleanupComplete";

    pub const IMAGE_SUBMITTED: &str = "ImageSubmitted";
    pub const IMAGE_READY: &str = "ImageReady";
    pub const IMAGE_FAILED: &str = "ImageFailed";
    pub const VOLUME_CLAIM_CREATED: &str = "VolumeClaimCreated";

    pub const CLUSTER_READY: &str = "ClusterReady";
    pub const CLUSTER_ERROR: &str = "ClusterError";

    /// Reported by the platform on image registrations.
    pub const IMPORTED: &str = "Imported";
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(rename = "lastUpdateTime")]
    pub last_update_time: DateTime<Utc>,
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl Condition {
    pub fn new(type_: impl Into<String>, status: ConditionStatus) -> Self {
        let now = Utc::now();
        Self {
            type_: type_.into(),
            status,
            last_update_time: now,
            last_transition_time: now,
            reason: String::new(),
            message: String::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

pub fn exists(conditions: &[Condition], type_: &str, status: ConditionStatus) -> bool {
    get(conditions, type_, status).is_some()
}

pub fn get<'a>(
    conditions: &'a [Condition],
    type_: &str,
    status: ConditionStatus,
) -> Option<&'a Condition> {
    conditions
        .iter()
        .find(|c| c.type_ == type_ && c.status == status)
}

/// Replace the entry with the same type in place, or append it.
pub fn upsert(conditions: &[Condition], condition: Condition) -> Vec<Condition> {
    let mut updated = conditions.to_vec();
    match updated.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => *existing = condition,
        None => updated.push(condition),
    }
    updated
}

pub fn merge(conditions: &[Condition], new_conditions: Vec<Condition>) -> Vec<Condition> {
    new_conditions
        .into_iter()
        .fold(conditions.to_vec(), |acc, c| upsert(&acc, c))
}

pub fn remove(conditions: &[Condition], type_: &str, status: ConditionStatus) -> Vec<Condition> {
    conditions
        .iter()
        .filter(|c| !(c.type_ == type_ && c.status == status))
        .cloned()
        .collect()
}
