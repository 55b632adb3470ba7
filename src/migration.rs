use crate::condition::{self, Condition, ConditionStatus};
use crate::{ImportError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// API version every source cluster reference must declare.
pub const SOURCE_API_VERSION: &str = "migration.harbor.io/v1beta1";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Set once deletion of the object has been requested.
    #[serde(default)]
    pub deletion_requested: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SourceClusterRef {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    #[serde(rename = "apiVersion")]
    pub api_version: String,
}

impl SourceClusterRef {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }
}

impl fmt::Display for SourceClusterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkMapping {
    pub source_network: String,
    /// `namespace/name` of the destination network attachment.
    pub destination_network: String,
    #[serde(default)]
    pub network_interface_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationSpec {
    pub source_cluster: SourceClusterRef,
    pub virtual_machine_name: String,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub mapping: Vec<NetworkMapping>,
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default)]
    pub skip_preflight_checks: bool,
    /// Skip the graceful guest shutdown and power the VM off straight away.
    #[serde(default)]
    pub force_power_off: bool,
    #[serde(default)]
    pub graceful_shutdown_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub default_network_interface_model: Option<String>,
    #[serde(default)]
    pub default_disk_bus: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    #[serde(rename = "")]
    New,
    ImportValid,
    ImportInvalid,
    SourceReady,
    DisksExported,
    DiskImagesSubmitted,
    DiskImagesReady,
    DiskImagesFailed,
    VirtualMachineCreated,
    VirtualMachineRunning,
    MigrationFailed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::New => "",
            Phase::ImportValid => "ImportValid",
            Phase::ImportInvalid => "ImportInvalid",
            Phase::SourceReady => "SourceReady",
            Phase::DisksExported => "DisksExported",
            Phase::DiskImagesSubmitted => "DiskImagesSubmitted",
            Phase::DiskImagesReady => "DiskImagesReady",
            Phase::DiskImagesFailed => "DiskImagesFailed",
            Phase::VirtualMachineCreated => "VirtualMachineCreated",
            Phase::VirtualMachineRunning => "VirtualMachineRunning",
            Phase::MigrationFailed => "MigrationFailed",
        }
    }

    /// Phases nothing moves out of.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Phase::ImportInvalid | Phase::MigrationFailed | Phase::VirtualMachineRunning
        )
    }

    /// Legal successors of this phase. Staying in place is always allowed.
    pub fn successors(&self) -> &'static [Phase] {
        match self {
            Phase::New => &[Phase::ImportValid, Phase::ImportInvalid],
            Phase::ImportValid => &[Phase::SourceReady, Phase::ImportInvalid],
            Phase::SourceReady => &[Phase::DisksExported, Phase::MigrationFailed],
            Phase::DisksExported => &[Phase::DiskImagesSubmitted],
            Phase::DiskImagesSubmitted => &[Phase::DiskImagesReady, Phase::DiskImagesFailed],
            Phase::DiskImagesFailed => &[Phase::SourceReady, Phase::MigrationFailed],
            Phase::DiskImagesReady => &[Phase::VirtualMachineCreated],
            Phase::VirtualMachineCreated => &[Phase::VirtualMachineRunning],
            Phase::VirtualMachineRunning | Phase::ImportInvalid | Phase::MigrationFailed => &[],
        }
    }

    pub fn can_transition_to(&self, next: Phase) -> bool {
        *self == next || self.successors().contains(&next)
    }

    /// Position in the forward order of the lifecycle; absorbing errors sort last.
    pub fn rank(&self) -> u8 {
        match self {
            Phase::New => 0,
            Phase::ImportValid => 1,
            Phase::SourceReady => 2,
            Phase::DisksExported => 3,
            Phase::DiskImagesSubmitted => 4,
            Phase::DiskImagesReady | Phase::DiskImagesFailed => 5,
            Phase::VirtualMachineCreated => 6,
            Phase::VirtualMachineRunning => 7,
            Phase::ImportInvalid | Phase::MigrationFailed => 8,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::New => write!(f, "<new>"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskBus {
    Scsi,
    Sata,
    Virtio,
    Usb,
}

impl DiskBus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskBus::Scsi => "scsi",
            DiskBus::Sata => "sata",
            DiskBus::Virtio => "virtio",
            DiskBus::Usb => "usb",
        }
    }
}

impl FromStr for DiskBus {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "scsi" => Ok(DiskBus::Scsi),
            "sata" | "ide" => Ok(DiskBus::Sata),
            "virtio" => Ok(DiskBus::Virtio),
            "usb" => Ok(DiskBus::Usb),
            other => Err(ImportError::Validation(format!(
                "unknown disk bus '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskInfo {
    pub name: String,
    pub size_bytes: u64,
    /// Converted raw image inside the working directory.
    pub local_path: String,
    pub bus_type: DiskBus,
    /// Generated name of the image registration, once submitted.
    #[serde(default)]
    pub image_name: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl DiskInfo {
    pub fn new(name: impl Into<String>, size_bytes: u64, local_path: impl Into<String>, bus_type: DiskBus) -> Self {
        Self {
            name: name.into(),
            size_bytes,
            local_path: local_path.into(),
            bus_type,
            image_name: None,
            conditions: Vec::new(),
        }
    }

    pub fn has_condition(&self, type_: &str) -> bool {
        condition::exists(&self.conditions, type_, ConditionStatus::True)
    }

    /// File name the image server exposes this disk under.
    pub fn file_name(&self) -> &str {
        self.local_path
            .rsplit('/')
            .next()
            .unwrap_or(self.local_path.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MigrationStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub disk_info: Vec<DiskInfo>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub target_vm_name: String,
    #[serde(default)]
    pub reexport_attempts: u32,
}

impl MigrationStatus {
    /// Move to `next`, refusing edges that are not in the transition table.
    pub fn transition(mut self, next: Phase) -> Result<Self> {
        if !self.phase.can_transition_to(next) {
            return Err(ImportError::Validation(format!(
                "illegal phase transition {} -> {}",
                self.phase, next
            )));
        }
        self.phase = next;
        Ok(self)
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions = condition::upsert(&self.conditions, condition);
        self
    }

    pub fn without_condition(mut self, type_: &str, status: ConditionStatus) -> Self {
        self.conditions = condition::remove(&self.conditions, type_, status);
        self
    }

    pub fn has_condition(&self, type_: &str) -> bool {
        condition::exists(&self.conditions, type_, ConditionStatus::True)
    }

    /// Whether the disk at `index` still has to be exported. Disks that were
    /// exported and submitted are kept as they are.
    pub fn needs_export(&self, index: usize) -> bool {
        self.disk_info
            .get(index)
            .map(|disk| !disk.has_condition(condition::types::IMAGE_SUBMITTED))
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationRequest {
    pub metadata: ObjectMeta,
    pub spec: MigrationSpec,
    #[serde(default)]
    pub status: MigrationStatus,
}

impl MigrationRequest {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    /// Label value placed on the created VM so re-runs can find it.
    pub fn import_label_value(&self) -> String {
        format!("{}.{}", self.metadata.namespace, self.metadata.name)
    }

    pub fn with_status(mut self, status: MigrationStatus) -> Self {
        self.status = status;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::types;

    const ALL: [Phase; 11] = [
        Phase::New,
        Phase::ImportValid,
        Phase::ImportInvalid,
        Phase::SourceReady,
        Phase::DisksExported,
        Phase::DiskImagesSubmitted,
        Phase::DiskImagesReady,
        Phase::DiskImagesFailed,
        Phase::VirtualMachineCreated,
        Phase::VirtualMachineRunning,
        Phase::MigrationFailed,
    ];

    #[test]
    fn phases_only_regress_through_resubmission() {
        for from in ALL {
            for to in from.successors() {
                if from == Phase::DiskImagesFailed && *to == Phase::SourceReady {
                    continue;
                }
                assert!(
                    to.rank() > from.rank(),
                    "{} -> {} goes backwards",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn absorbing_phases_have_no_exit() {
        for phase in [Phase::ImportInvalid, Phase::MigrationFailed, Phase::VirtualMachineRunning] {
            assert!(phase.is_terminal());
            assert!(phase.successors().is_empty());
        }
    }

    #[test]
    fn transition_rejects_illegal_edges() {
        let status = MigrationStatus::default();
        assert!(status.clone().transition(Phase::DisksExported).is_err());
        let valid = status.transition(Phase::ImportValid).unwrap();
        assert_eq!(valid.phase, Phase::ImportValid);
    }

    #[test]
    fn phase_serializes_as_plain_string() {
        assert_eq!(serde_json::to_string(&Phase::New).unwrap(), "\"\"");
        assert_eq!(
            serde_json::to_string(&Phase::DiskImagesSubmitted).unwrap(),
            "\"DiskImagesSubmitted\""
        );
        let parsed: Phase = serde_json::from_str("\"\"").unwrap();
        assert_eq!(parsed, Phase::New);
    }

    #[test]
    fn needs_export_tracks_submitted_disks() {
        let mut submitted = DiskInfo::new("disk-0", 10, "/work/vm-disk-0.img", DiskBus::Virtio);
        submitted.conditions = condition::upsert(
            &[],
            Condition::new(types::IMAGE_SUBMITTED, ConditionStatus::True),
        );
        let pending = DiskInfo::new("disk-1", 10, "/work/vm-disk-1.img", DiskBus::Virtio);

        let status = MigrationStatus {
            disk_info: vec![submitted, pending],
            ..Default::default()
        };
        assert!(!status.needs_export(0));
        assert!(status.needs_export(1));
        assert!(status.needs_export(2));
    }

    #[test]
    fn disk_bus_parsing() {
        assert_eq!("SCSI".parse::<DiskBus>().unwrap(), DiskBus::Scsi);
        assert_eq!("ide".parse::<DiskBus>().unwrap(), DiskBus::Sata);
        assert!("floppy".parse::<DiskBus>().is_err());
    }

    #[test]
    fn disk_file_name() {
        let disk = DiskInfo::new("d", 1, "/var/lib/vm-import/web-01-disk-0.img", DiskBus::Sata);
        assert_eq!(disk.file_name(), "web-01-disk-0.img");
    }
}
