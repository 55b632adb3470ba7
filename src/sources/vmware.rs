//! vSphere sources through the vCenter Automation REST API.
//!
//! Disks are pulled from the datastore file browser (`/folder`) as a VMDK
//! descriptor plus its extents, then converted locally.

use crate::converter::DiskFormat;
use crate::error::ErrorList;
use crate::migration::{DiskBus, DiskInfo, MigrationRequest};
use crate::network::SourceNic;
use crate::source::{Secret, VmwareSourceSpec, secret_keys};
use crate::sources::download::{self, fetch_to_file};
use crate::sources::{
    ExportContext, SourceVirtualMachine, VirtualMachineOperations, artifact_stem,
    build_target_vm, kept_disk,
};
use crate::vm::{Firmware, VirtualMachineDefinition};
use crate::{ImportError, Result, log_debug, log_info};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::Path;

const SESSION_HEADER: &str = "vmware-api-session-id";
/// Magic at the start of a monolithic sparse VMDK, which embeds its descriptor.
const SPARSE_MAGIC: &[u8; 4] = b"KDMV";

#[derive(Debug, Deserialize)]
struct DatacenterSummary {
    datacenter: String,
}

#[derive(Debug, Deserialize)]
struct FolderSummary {
    folder: String,
}

#[derive(Debug, Deserialize)]
struct VmSummary {
    vm: String,
}

#[derive(Debug, Deserialize)]
struct PowerInfo {
    state: String,
}

#[derive(Debug, Deserialize)]
struct NetworkSummary {
    name: String,
}

#[derive(Debug, Deserialize)]
pub struct VmInfo {
    pub name: String,
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    #[serde(default)]
    pub boot: Option<BootInfo>,
    #[serde(default)]
    pub disks: BTreeMap<String, VmDisk>,
    #[serde(default)]
    pub nics: BTreeMap<String, VmNic>,
}

#[derive(Debug, Deserialize)]
pub struct CpuInfo {
    pub count: u32,
}

#[derive(Debug, Deserialize)]
pub struct MemoryInfo {
    #[serde(rename = "size_MiB")]
    pub size_mib: u64,
}

#[derive(Debug, Deserialize)]
pub struct BootInfo {
    #[serde(rename = "type")]
    pub type_: String,
}

#[derive(Debug, Deserialize)]
pub struct VmDisk {
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type", default)]
    pub bus: String,
    #[serde(default)]
    pub capacity: u64,
    pub backing: DiskBacking,
}

#[derive(Debug, Deserialize)]
pub struct DiskBacking {
    #[serde(default)]
    pub vmdk_file: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VmNic {
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(rename = "type", default)]
    pub model: Option<String>,
    pub backing: NicBacking,
}

#[derive(Debug, Deserialize)]
pub struct NicBacking {
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub network_name: Option<String>,
}

impl VmInfo {
    /// Disks ordered by device key, which follows controller and unit order.
    pub fn ordered_disks(&self) -> Vec<&VmDisk> {
        let mut keyed: Vec<(u64, &VmDisk)> = self
            .disks
            .iter()
            .map(|(key, disk)| (key.parse().unwrap_or(u64::MAX), disk))
            .collect();
        keyed.sort_by_key(|(key, _)| *key);
        keyed.into_iter().map(|(_, disk)| disk).collect()
    }

    pub fn firmware(&self) -> Firmware {
        match self.boot.as_ref() {
            Some(boot) if boot.type_.eq_ignore_ascii_case("EFI") => {
                Firmware::Uefi { secure_boot: false }
            }
            _ => Firmware::Bios,
        }
    }
}

/// vSphere disk controller type to target bus; NVMe is presented as virtio.
pub fn vsphere_bus(kind: &str, default: DiskBus) -> DiskBus {
    match kind.to_ascii_uppercase().as_str() {
        "SCSI" => DiskBus::Scsi,
        "SATA" | "IDE" => DiskBus::Sata,
        "NVME" => DiskBus::Virtio,
        _ => default,
    }
}

/// Split `[datastore] dir/file.vmdk` into datastore and path.
pub fn parse_datastore_path(value: &str) -> Result<(String, String)> {
    let invalid = || ImportError::Source(format!("invalid datastore path '{}'", value));
    let rest = value.trim().strip_prefix('[').ok_or_else(invalid)?;
    let (datastore, path) = rest.split_once(']').ok_or_else(invalid)?;
    let path = path.trim();
    if datastore.is_empty() || path.is_empty() {
        return Err(invalid());
    }
    Ok((datastore.to_string(), path.to_string()))
}

/// Extent file names referenced by a text VMDK descriptor.
pub fn descriptor_extents(descriptor: &str) -> Vec<String> {
    descriptor
        .lines()
        .map(str::trim)
        .filter(|line| {
            ["RW ", "RDONLY ", "NOACCESS "]
                .iter()
                .any(|access| line.starts_with(access))
        })
        .filter_map(|line| {
            let start = line.find('"')?;
            let end = line[start + 1..].find('"')? + start + 1;
            Some(line[start + 1..end].to_string())
        })
        .collect()
}

pub struct VmwareClient {
    spec: VmwareSourceSpec,
    username: String,
    password: String,
    http: Client,
    ctx: ExportContext,
}

impl VmwareClient {
    pub fn new(spec: VmwareSourceSpec, secret: Secret, ctx: ExportContext) -> Result<Self> {
        let mut builder = download::client_builder(ctx.http_timeout);
        if let Some(pem) = secret.get(secret_keys::CA_CERT) {
            let cert = reqwest::Certificate::from_pem(pem.as_bytes())
                .map_err(|e| ImportError::Validation(format!("invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = download::build_client(builder)?;
        Ok(Self {
            username: secret.require(secret_keys::USERNAME)?.to_string(),
            password: secret.require(secret_keys::PASSWORD)?.to_string(),
            spec,
            http,
            ctx,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.spec.endpoint.trim_end_matches('/'), path)
    }

    async fn login(&self) -> Result<String> {
        let response = self
            .http
            .post(self.url("/api/session"))
            .basic_auth(&self.username, Some(&self.password))
            .timeout(self.ctx.http_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ImportError::Source(format!(
                "vCenter login failed with {}",
                response.status()
            )));
        }
        Ok(response.json::<String>().await?)
    }

    async fn logout(&self, session: &str) {
        let _ = self
            .http
            .delete(self.url("/api/session"))
            .header(SESSION_HEADER, session)
            .timeout(self.ctx.http_timeout)
            .send()
            .await;
    }

    /// API call bounded by the HTTP timeout as a whole.
    fn request(&self, session: &str, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, self.url(path))
            .header(SESSION_HEADER, session)
            .timeout(self.ctx.http_timeout)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        session: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let response = self
            .request(session, Method::GET, path)
            .query(query)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ImportError::Source(format!("GET {} returned {}", path, status)));
        }
        Ok(response.json().await?)
    }

    async fn post_action(&self, session: &str, path: &str, action: &str) -> Result<()> {
        let response = self
            .request(session, Method::POST, path)
            .query(&[("action", action)])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ImportError::Source(format!(
                "POST {}?action={} returned {}: {}",
                path, action, status, body
            )));
        }
        Ok(())
    }

    async fn datacenter_id(&self, session: &str) -> Result<String> {
        let found: Vec<DatacenterSummary> = self
            .get_json(session, "/api/vcenter/datacenter", &[("names", &self.spec.datacenter)])
            .await?;
        found
            .into_iter()
            .next()
            .map(|dc| dc.datacenter)
            .ok_or_else(|| ImportError::not_found("Datacenter", &self.spec.datacenter))
    }

    async fn folder_id(&self, session: &str, datacenter: &str, folder: &str) -> Result<String> {
        let folders: Vec<FolderSummary> = self
            .get_json(
                session,
                "/api/vcenter/folder",
                &[
                    ("names", folder),
                    ("type", "VIRTUAL_MACHINE"),
                    ("datacenters", datacenter),
                ],
            )
            .await?;
        folders
            .into_iter()
            .next()
            .map(|f| f.folder)
            .ok_or_else(|| ImportError::not_found("Folder", folder))
    }

    async fn vm_id(&self, session: &str, request: &MigrationRequest) -> Result<String> {
        let datacenter = self.datacenter_id(session).await?;
        let folder = match request.spec.folder.as_deref() {
            Some(folder) => Some(self.folder_id(session, &datacenter, folder).await?),
            None => None,
        };

        let name = &request.spec.virtual_machine_name;
        let mut query = vec![("names", name.as_str()), ("datacenters", datacenter.as_str())];
        if let Some(folder) = folder.as_deref() {
            query.push(("folders", folder));
        }

        let vms: Vec<VmSummary> = self.get_json(session, "/api/vcenter/vm", &query).await?;
        match vms.as_slice() {
            [vm] => Ok(vm.vm.clone()),
            [] => Err(ImportError::not_found("VirtualMachine", name)),
            _ => Err(ImportError::Validation(format!(
                "'{}' matches {} VMs; set a folder to disambiguate",
                name,
                vms.len()
            ))),
        }
    }

    async fn vm_info(&self, session: &str, vm: &str) -> Result<VmInfo> {
        self.get_json(session, &format!("/api/vcenter/vm/{}", vm), &[])
            .await
    }

    async fn powered_off(&self, session: &str, vm: &str) -> Result<bool> {
        let power: PowerInfo = self
            .get_json(session, &format!("/api/vcenter/vm/{}/power", vm), &[])
            .await?;
        Ok(power.state == "POWERED_OFF")
    }

    async fn network_name(&self, session: &str, backing: &NicBacking) -> Result<String> {
        if let Some(name) = backing.network_name.as_ref() {
            return Ok(name.clone());
        }
        let Some(id) = backing.network.as_deref() else {
            return Ok(String::new());
        };
        let found: Vec<NetworkSummary> = self
            .get_json(session, "/api/vcenter/network", &[("networks", id)])
            .await?;
        Ok(found.into_iter().next().map(|n| n.name).unwrap_or_default())
    }

    /// Run `op` inside a fresh API session that is always closed afterwards.
    async fn with_session<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(String) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let session = self.login().await?;
        let result = op(session.clone()).await;
        self.logout(&session).await;
        result
    }

    /// Datastore download; only idle reads are bounded.
    fn datastore_request(&self, datastore: &str, path: &str) -> RequestBuilder {
        self.http
            .get(self.url(&format!("/folder/{}", path)))
            .query(&[("dcPath", self.spec.datacenter.as_str()), ("dsName", datastore)])
            .basic_auth(&self.username, Some(&self.password))
    }

    /// Download a VMDK and every extent it references into `dir`.
    async fn download_vmdk(&self, backing: &str, dir: &Path) -> Result<std::path::PathBuf> {
        let (datastore, path) = parse_datastore_path(backing)?;
        let (parent, file_name) = match path.rsplit_once('/') {
            Some((parent, name)) => (Some(parent.to_string()), name.to_string()),
            None => (None, path.clone()),
        };

        let descriptor_path = dir.join(&file_name);
        fetch_to_file(self.datastore_request(&datastore, &path), &descriptor_path).await?;

        let head = tokio::fs::read(&descriptor_path).await?;
        if head.starts_with(SPARSE_MAGIC) {
            return Ok(descriptor_path);
        }
        let descriptor = String::from_utf8_lossy(&head);
        for extent in descriptor_extents(&descriptor) {
            let remote = match parent.as_deref() {
                Some(parent) => format!("{}/{}", parent, extent),
                None => extent.clone(),
            };
            log_debug!("Fetching extent {} from [{}]", remote, datastore);
            fetch_to_file(self.datastore_request(&datastore, &remote), &dir.join(&extent)).await?;
        }
        Ok(descriptor_path)
    }
}

#[async_trait]
impl VirtualMachineOperations for VmwareClient {
    async fn verify_connectivity(&self) -> Result<()> {
        self.with_session(|session| async move { self.datacenter_id(&session).await.map(|_| ()) })
            .await
    }

    async fn pre_flight_checks(&self, request: &MigrationRequest) -> Result<()> {
        self.with_session(|session| async move {
            let vm = self.vm_id(&session, request).await?;
            let info = self.vm_info(&session, &vm).await?;
            if info.ordered_disks().iter().all(|d| d.backing.vmdk_file.is_none()) {
                return Err(ImportError::Validation(format!(
                    "VM '{}' has no VMDK-backed disks",
                    info.name
                )));
            }
            Ok(())
        })
        .await
    }

    async fn shutdown_guest(&self, request: &MigrationRequest) -> Result<()> {
        self.with_session(|session| async move {
            let vm = self.vm_id(&session, request).await?;
            if self.powered_off(&session, &vm).await? {
                return Ok(());
            }
            log_info!("Requesting guest shutdown of {}", vm);
            self.post_action(&session, &format!("/api/vcenter/vm/{}/guest/power", vm), "shutdown")
                .await
        })
        .await
    }

    async fn power_off(&self, request: &MigrationRequest) -> Result<()> {
        self.with_session(|session| async move {
            let vm = self.vm_id(&session, request).await?;
            if self.powered_off(&session, &vm).await? {
                return Ok(());
            }
            log_info!("Powering off {}", vm);
            self.post_action(&session, &format!("/api/vcenter/vm/{}/power", vm), "stop")
                .await
        })
        .await
    }

    async fn is_powered_off(&self, request: &MigrationRequest) -> Result<bool> {
        self.with_session(|session| async move {
            let vm = self.vm_id(&session, request).await?;
            self.powered_off(&session, &vm).await
        })
        .await
    }

    async fn export_disks(&self, request: &MigrationRequest) -> Result<Vec<DiskInfo>> {
        let stem = artifact_stem(request)?;
        let info = self
            .with_session(|session| async move {
                let vm = self.vm_id(&session, request).await?;
                self.vm_info(&session, &vm).await
            })
            .await?;
        let scratch = self.ctx.ensure_scratch_dir(&stem).await?;
        let default_bus = self.ctx.default_bus_for(request);

        let mut disks = Vec::new();
        for (index, disk) in info
            .ordered_disks()
            .into_iter()
            .filter(|d| d.backing.vmdk_file.is_some())
            .enumerate()
        {
            if let Some(kept) = kept_disk(request, index) {
                disks.push(kept);
                continue;
            }
            let Some(backing) = disk.backing.vmdk_file.as_deref() else {
                continue;
            };

            let disk_dir = scratch.join(format!("disk-{}", index));
            tokio::fs::create_dir_all(&disk_dir).await?;
            log_info!("Exporting {} ({}) of {}", disk.label, backing, info.name);
            let descriptor = self.download_vmdk(backing, &disk_dir).await?;

            let raw = self.ctx.disk_path(&stem, index);
            self.ctx.converter.convert(DiskFormat::Vmdk, &descriptor, &raw).await?;
            tokio::fs::remove_dir_all(&disk_dir).await?;

            let name = if disk.label.is_empty() {
                format!("disk-{}", index)
            } else {
                disk.label.clone()
            };
            disks.push(DiskInfo::new(
                name,
                disk.capacity,
                raw.display().to_string(),
                vsphere_bus(&disk.bus, default_bus),
            ));
        }
        Ok(disks)
    }

    async fn synthesize_target_vm(
        &self,
        request: &MigrationRequest,
    ) -> Result<VirtualMachineDefinition> {
        let source = self
            .with_session(|session| async move {
                let vm = self.vm_id(&session, request).await?;
                let info = self.vm_info(&session, &vm).await?;
                let mut nics = Vec::with_capacity(info.nics.len());
                for nic in info.nics.values() {
                    nics.push(SourceNic {
                        network_name: self.network_name(&session, &nic.backing).await?,
                        mac_address: nic.mac_address.clone(),
                        model: nic.model.clone(),
                    });
                }
                Ok::<_, ImportError>(SourceVirtualMachine {
                    cpu_cores: info.cpu.count,
                    memory_bytes: info.memory.size_mib << 20,
                    firmware: info.firmware(),
                    tpm: false,
                    nics,
                })
            })
            .await?;
        build_target_vm(request, &source, &self.ctx.interface_model_for(request))
    }

    async fn cleanup(&self, request: &MigrationRequest) -> Result<()> {
        let stem = artifact_stem(request)?;
        let mut errors = ErrorList::new();
        self.ctx.remove_local_artifacts(&stem, &mut errors).await;
        errors.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datastore_paths() {
        assert_eq!(
            parse_datastore_path("[datastore1] web-01/web-01.vmdk").unwrap(),
            ("datastore1".to_string(), "web-01/web-01.vmdk".to_string())
        );
        assert!(parse_datastore_path("datastore1 web.vmdk").is_err());
        assert!(parse_datastore_path("[] web.vmdk").is_err());
        assert!(parse_datastore_path("[ds]").is_err());
    }

    #[test]
    fn extents_from_descriptor() {
        let descriptor = r#"# Disk DescriptorFile
version=1
CID=fffffffe
createType="vmfs"

# Extent description
RW 41943040 VMFS "web-01-flat.vmdk"
RDONLY 1024 SPARSE "web-01-s002.vmdk"

ddb.adapterType = "lsilogic"
"#;
        assert_eq!(
            descriptor_extents(descriptor),
            vec!["web-01-flat.vmdk".to_string(), "web-01-s002.vmdk".to_string()]
        );
        assert!(descriptor_extents("createType=\"vmfs\"").is_empty());
    }

    #[test]
    fn bus_mapping() {
        assert_eq!(vsphere_bus("SCSI", DiskBus::Virtio), DiskBus::Scsi);
        assert_eq!(vsphere_bus("ide", DiskBus::Virtio), DiskBus::Sata);
        assert_eq!(vsphere_bus("NVME", DiskBus::Scsi), DiskBus::Virtio);
        assert_eq!(vsphere_bus("", DiskBus::Usb), DiskBus::Usb);
    }

    #[test]
    fn vm_info_from_api_json() {
        let info: VmInfo = serde_json::from_value(serde_json::json!({
            "name": "web-01",
            "power_state": "POWERED_ON",
            "cpu": {"count": 4, "cores_per_socket": 2},
            "memory": {"size_MiB": 8192},
            "boot": {"type": "EFI"},
            "disks": {
                "2001": {"label": "Hard disk 2", "type": "SATA", "capacity": 1073741824,
                         "backing": {"type": "VMDK_FILE", "vmdk_file": "[ds1] web-01/web-01_1.vmdk"}},
                "2000": {"label": "Hard disk 1", "type": "SCSI", "capacity": 17179869184u64,
                         "backing": {"type": "VMDK_FILE", "vmdk_file": "[ds1] web-01/web-01.vmdk"}}
            },
            "nics": {
                "4000": {"label": "Network adapter 1", "type": "VMXNET3",
                         "mac_address": "00:50:56:aa:bb:cc",
                         "backing": {"type": "STANDARD_PORTGROUP", "network": "network-12",
                                     "network_name": "VM Network"}}
            }
        }))
        .unwrap();

        let disks = info.ordered_disks();
        assert_eq!(disks[0].label, "Hard disk 1");
        assert_eq!(disks[1].label, "Hard disk 2");
        assert_eq!(info.firmware(), Firmware::Uefi { secure_boot: false });
        assert_eq!(info.memory.size_mib << 20, 8 << 30);
        assert_eq!(
            info.nics["4000"].backing.network_name.as_deref(),
            Some("VM Network")
        );
    }
}
