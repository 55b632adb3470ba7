//! Source adapters: one per hypervisor family, one shared contract.
//!
//! The set of adapters is closed. [`SourceAdapter`] is the tagged union over
//! them and implements [`VirtualMachineOperations`] by delegation, so callers
//! only ever see the contract.

pub mod download;
pub mod kvm;
pub mod openstack;
pub mod ova;
pub mod vmware;
pub(crate) mod xml;

use crate::config::ImportConfig;
use crate::converter::QemuImg;
use crate::error::ErrorList;
use crate::migration::{DiskBus, DiskInfo, MigrationRequest};
use crate::network::{self, SourceNic};
use crate::source::{Secret, SourceCluster, SourceClusterSpec};
use crate::vm::{Firmware, IMPORTED_LABEL, VirtualMachineDefinition};
use crate::{ImportError, Result, log_debug};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DNS_LABEL_MAX: usize = 63;

/// Capability contract every hypervisor family implements.
#[async_trait]
pub trait VirtualMachineOperations: Send + Sync {
    /// Cheap reachability and credential check.
    async fn verify_connectivity(&self) -> Result<()>;

    /// Source-specific checks that the requested VM exists and can be exported.
    async fn pre_flight_checks(&self, request: &MigrationRequest) -> Result<()>;

    fn sanitize_target_name(&self, request: &MigrationRequest) -> Result<String> {
        sanitize_target_name(&request.spec.virtual_machine_name)
    }

    fn is_power_off_supported(&self) -> bool {
        true
    }

    async fn shutdown_guest(&self, request: &MigrationRequest) -> Result<()>;

    async fn power_off(&self, request: &MigrationRequest) -> Result<()>;

    async fn is_powered_off(&self, request: &MigrationRequest) -> Result<bool>;

    /// Export and convert every disk still missing from `request.status`.
    ///
    /// Returns the complete disk list in boot order. Entries for disks that
    /// were already exported and submitted are carried over untouched.
    async fn export_disks(&self, request: &MigrationRequest) -> Result<Vec<DiskInfo>>;

    /// CPU, memory, firmware and networks of the destination VM. Disks are
    /// attached by the caller once their volumes exist.
    async fn synthesize_target_vm(
        &self,
        request: &MigrationRequest,
    ) -> Result<VirtualMachineDefinition>;

    /// Best-effort removal of temporary artifacts; attempts every step.
    async fn cleanup(&self, request: &MigrationRequest) -> Result<()>;
}

/// Hardware facts read from the source VM.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceVirtualMachine {
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    pub firmware: Firmware,
    pub tpm: bool,
    pub nics: Vec<SourceNic>,
}

/// Settings and tools shared by all adapters.
#[derive(Debug, Clone)]
pub struct ExportContext {
    pub working_dir: PathBuf,
    pub converter: QemuImg,
    pub default_disk_bus: DiskBus,
    pub default_interface_model: String,
    pub http_timeout: Duration,
    pub poll_interval: Duration,
    pub upload_timeout: Duration,
}

impl ExportContext {
    pub fn from_config(config: &ImportConfig) -> Result<Self> {
        Ok(Self {
            working_dir: config.working_dir.clone(),
            converter: QemuImg::new(&config.qemu_img_path),
            default_disk_bus: config.default_disk_bus.parse()?,
            default_interface_model: config.default_interface_model.clone(),
            http_timeout: Duration::from_secs(config.http_timeout_seconds),
            poll_interval: Duration::from_secs(config.openstack.poll_interval_seconds),
            upload_timeout: Duration::from_secs(config.openstack.upload_timeout_seconds),
        })
    }

    /// Converted raw image for disk `index`; the image server exposes it by file name.
    pub fn disk_path(&self, stem: &str, index: usize) -> PathBuf {
        self.working_dir.join(format!("{}-disk-{}.img", stem, index))
    }

    /// Per-request directory for downloads awaiting conversion.
    pub fn scratch_dir(&self, stem: &str) -> PathBuf {
        self.working_dir.join(format!("{}.scratch", stem))
    }

    pub fn default_bus_for(&self, request: &MigrationRequest) -> DiskBus {
        request
            .spec
            .default_disk_bus
            .as_deref()
            .and_then(|bus| bus.parse().ok())
            .unwrap_or(self.default_disk_bus)
    }

    pub fn interface_model_for(&self, request: &MigrationRequest) -> String {
        request
            .spec
            .default_network_interface_model
            .clone()
            .unwrap_or_else(|| self.default_interface_model.clone())
    }

    pub async fn ensure_scratch_dir(&self, stem: &str) -> Result<PathBuf> {
        let dir = self.scratch_dir(stem);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Remove the scratch directory and every converted image of `stem`.
    pub async fn remove_local_artifacts(&self, stem: &str, errors: &mut ErrorList) {
        let scratch = self.scratch_dir(stem);
        if scratch.exists() {
            errors.record("remove scratch directory", tokio::fs::remove_dir_all(&scratch).await);
        }

        let entries = match std::fs::read_dir(&self.working_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                errors.push("list working directory", e);
                return;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_converted_image(stem, &name) {
                log_debug!("Removing converted image {}", name);
                errors.record(&format!("remove {}", name), tokio::fs::remove_file(entry.path()).await);
            }
        }
    }
}

/// Whether `name` is exactly `<stem>-disk-<index>.img`.
fn is_converted_image(stem: &str, name: &str) -> bool {
    name.strip_prefix(stem)
        .and_then(|rest| rest.strip_prefix("-disk-"))
        .and_then(|rest| rest.strip_suffix(".img"))
        .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
}

/// File name stem for everything written locally or remotely on behalf of
/// `request`. Namespace and name cannot contain `_`, so two requests never
/// share a stem even when their target VM names collide.
pub fn artifact_stem(request: &MigrationRequest) -> Result<String> {
    Ok(format!(
        "{}_{}_{}",
        request.metadata.namespace,
        request.metadata.name,
        target_name(request)?
    ))
}

/// Name used for artifacts of `request`, falling back to a fresh sanitisation
/// when the reconciler has not recorded one yet.
pub fn target_name(request: &MigrationRequest) -> Result<String> {
    if request.status.target_vm_name.is_empty() {
        sanitize_target_name(&request.spec.virtual_machine_name)
    } else {
        Ok(request.status.target_vm_name.clone())
    }
}

/// Existing entry for disk `index` when it does not need to be exported again.
pub fn kept_disk(request: &MigrationRequest, index: usize) -> Option<DiskInfo> {
    if request.status.needs_export(index) {
        None
    } else {
        request.status.disk_info.get(index).cloned()
    }
}

/// Turn an arbitrary source VM name into a DNS label.
pub fn sanitize_target_name(name: &str) -> Result<String> {
    let mut sanitized = String::with_capacity(name.len());
    for c in name.trim().chars().flat_map(char::to_lowercase) {
        let mapped = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if mapped == '-' && sanitized.ends_with('-') {
            continue;
        }
        sanitized.push(mapped);
    }

    let mut sanitized = sanitized.trim_matches('-').to_string();
    sanitized.truncate(DNS_LABEL_MAX);
    let sanitized = sanitized.trim_end_matches('-').to_string();

    if !is_dns_label(&sanitized) {
        return Err(ImportError::Validation(format!(
            "cannot derive a valid VM name from '{}'",
            name
        )));
    }
    Ok(sanitized)
}

/// RFC 1123 label: 1-63 chars of `[a-z0-9-]`, alphanumeric at both ends.
pub fn is_dns_label(name: &str) -> bool {
    let bytes = name.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= DNS_LABEL_MAX
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
}

/// Destination VM definition from source hardware and the request's network mapping.
pub fn build_target_vm(
    request: &MigrationRequest,
    source: &SourceVirtualMachine,
    default_model: &str,
) -> Result<VirtualMachineDefinition> {
    let mapped = network::map_networks(&source.nics, &request.spec.mapping);
    let (networks, interfaces) = network::generate_interface_config(&mapped, default_model);

    Ok(VirtualMachineDefinition {
        name: target_name(request)?,
        namespace: request.metadata.namespace.clone(),
        labels: BTreeMap::from([(IMPORTED_LABEL.to_string(), request.import_label_value())]),
        cpu_cores: source.cpu_cores.max(1),
        memory_bytes: source.memory_bytes,
        firmware: source.firmware,
        tpm: source.tpm,
        networks,
        interfaces,
        disks: Vec::new(),
    })
}

pub fn file_size(path: &Path) -> Result<u64> {
    Ok(std::fs::metadata(path)?.len())
}

/// Closed set of adapters, selected by the source cluster's kind.
pub enum SourceAdapter {
    Vmware(vmware::VmwareClient),
    Openstack(openstack::OpenstackClient),
    Ova(ova::OvaClient),
    Kvm(kvm::KvmClient),
}

impl SourceAdapter {
    pub fn new(cluster: &SourceCluster, secret: Option<Secret>, ctx: ExportContext) -> Result<Self> {
        let require_secret = || {
            secret.clone().ok_or_else(|| {
                ImportError::Validation(format!(
                    "{} '{}' has no credentials secret",
                    cluster.kind(),
                    cluster.metadata.name
                ))
            })
        };

        Ok(match &cluster.spec {
            SourceClusterSpec::Vmware(spec) => {
                SourceAdapter::Vmware(vmware::VmwareClient::new(spec.clone(), require_secret()?, ctx)?)
            }
            SourceClusterSpec::Openstack(spec) => SourceAdapter::Openstack(
                openstack::OpenstackClient::new(spec.clone(), require_secret()?, ctx)?,
            ),
            SourceClusterSpec::Ova(spec) => {
                SourceAdapter::Ova(ova::OvaClient::new(spec.clone(), secret.clone(), ctx)?)
            }
            SourceClusterSpec::Kvm(spec) => {
                SourceAdapter::Kvm(kvm::KvmClient::new(spec.clone(), require_secret()?, ctx))
            }
        })
    }

    fn operations(&self) -> &dyn VirtualMachineOperations {
        match self {
            SourceAdapter::Vmware(client) => client,
            SourceAdapter::Openstack(client) => client,
            SourceAdapter::Ova(client) => client,
            SourceAdapter::Kvm(client) => client,
        }
    }
}

#[async_trait]
impl VirtualMachineOperations for SourceAdapter {
    async fn verify_connectivity(&self) -> Result<()> {
        self.operations().verify_connectivity().await
    }

    async fn pre_flight_checks(&self, request: &MigrationRequest) -> Result<()> {
        self.operations().pre_flight_checks(request).await
    }

    fn sanitize_target_name(&self, request: &MigrationRequest) -> Result<String> {
        self.operations().sanitize_target_name(request)
    }

    fn is_power_off_supported(&self) -> bool {
        self.operations().is_power_off_supported()
    }

    async fn shutdown_guest(&self, request: &MigrationRequest) -> Result<()> {
        self.operations().shutdown_guest(request).await
    }

    async fn power_off(&self, request: &MigrationRequest) -> Result<()> {
        self.operations().power_off(request).await
    }

    async fn is_powered_off(&self, request: &MigrationRequest) -> Result<bool> {
        self.operations().is_powered_off(request).await
    }

    async fn export_disks(&self, request: &MigrationRequest) -> Result<Vec<DiskInfo>> {
        self.operations().export_disks(request).await
    }

    async fn synthesize_target_vm(
        &self,
        request: &MigrationRequest,
    ) -> Result<VirtualMachineDefinition> {
        self.operations().synthesize_target_vm(request).await
    }

    async fn cleanup(&self, request: &MigrationRequest) -> Result<()> {
        self.operations().cleanup(request).await
    }
}

/// Turns a source cluster into a ready-to-use adapter. Adapters are built
/// fresh on every reconcile since credentials and endpoints may change.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(
        &self,
        cluster: &SourceCluster,
        secret: Option<Secret>,
    ) -> Result<Box<dyn VirtualMachineOperations>>;
}

pub struct AdapterResolver {
    ctx: ExportContext,
}

impl AdapterResolver {
    pub fn new(ctx: ExportContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl SourceResolver for AdapterResolver {
    async fn resolve(
        &self,
        cluster: &SourceCluster,
        secret: Option<Secret>,
    ) -> Result<Box<dyn VirtualMachineOperations>> {
        Ok(Box::new(SourceAdapter::new(cluster, secret, self.ctx.clone())?))
    }
}
