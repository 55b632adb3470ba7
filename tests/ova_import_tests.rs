use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use vm_import::condition::{self, ConditionStatus, types};
use vm_import::config::ImportConfig;
use vm_import::migration::{
    DiskBus, MigrationRequest, MigrationSpec, MigrationStatus, NetworkMapping, ObjectKey,
    ObjectMeta, Phase, SOURCE_API_VERSION,
};
use vm_import::platform::ImportState;
use vm_import::reconciler::{self, Context};
use vm_import::source::{OvaSourceSpec, SourceCluster, SourceClusterSpec, SourceClusterStatus};
use vm_import::vm::{Firmware, NetworkAttachment};
use vm_import::{AdapterResolver, ExportContext, MemoryPlatform};

const APPLIANCE_OVF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Envelope xmlns="http://schemas.dmtf.org/ovf/envelope/1"
          xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1"
          xmlns:rasd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_ResourceAllocationSettingData">
  <References>
    <File ovf:id="file1" ovf:href="appliance-disk0.img" ovf:size="4096"/>
    <File ovf:id="file2" ovf:href="appliance-disk1.img" ovf:size="2048"/>
  </References>
  <DiskSection>
    <Info>Virtual disk information</Info>
    <Disk ovf:capacity="4096" ovf:capacityAllocationUnits="byte" ovf:diskId="vmdisk1" ovf:fileRef="file1"/>
    <Disk ovf:capacity="2048" ovf:capacityAllocationUnits="byte" ovf:diskId="vmdisk2" ovf:fileRef="file2"/>
  </DiskSection>
  <NetworkSection>
    <Info>The list of logical networks</Info>
    <Network ovf:name="VM Network"/>
  </NetworkSection>
  <VirtualSystem ovf:id="appliance">
    <Name>appliance</Name>
    <VirtualHardwareSection>
      <Item>
        <rasd:InstanceID>1</rasd:InstanceID>
        <rasd:ResourceType>3</rasd:ResourceType>
        <rasd:VirtualQuantity>4</rasd:VirtualQuantity>
      </Item>
      <Item>
        <rasd:AllocationUnits>byte * 2^20</rasd:AllocationUnits>
        <rasd:InstanceID>2</rasd:InstanceID>
        <rasd:ResourceType>4</rasd:ResourceType>
        <rasd:VirtualQuantity>2048</rasd:VirtualQuantity>
      </Item>
      <Item>
        <rasd:InstanceID>3</rasd:InstanceID>
        <rasd:ResourceSubType>vmware.sata.ahci</rasd:ResourceSubType>
        <rasd:ResourceType>20</rasd:ResourceType>
      </Item>
      <Item>
        <rasd:HostResource>ovf:/disk/vmdisk1</rasd:HostResource>
        <rasd:InstanceID>4</rasd:InstanceID>
        <rasd:ResourceType>17</rasd:ResourceType>
      </Item>
      <Item>
        <rasd:HostResource>ovf:/disk/vmdisk2</rasd:HostResource>
        <rasd:InstanceID>5</rasd:InstanceID>
        <rasd:Parent>3</rasd:Parent>
        <rasd:ResourceType>17</rasd:ResourceType>
      </Item>
      <Item>
        <rasd:Address>00:50:56:01:02:03</rasd:Address>
        <rasd:Connection>VM Network</rasd:Connection>
        <rasd:InstanceID>6</rasd:InstanceID>
        <rasd:ResourceSubType>VmxNet3</rasd:ResourceSubType>
        <rasd:ResourceType>10</rasd:ResourceType>
      </Item>
    </VirtualHardwareSection>
  </VirtualSystem>
</Envelope>
"#;

fn sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Write an OVA whose manifest claims `recorded` for the first disk.
fn write_ova(path: &Path, disk0: &[u8], disk1: &[u8], recorded: Option<&str>) {
    let manifest = format!(
        "SHA256(appliance.ovf)= {}\nSHA256(appliance-disk0.img)= {}\nSHA256(appliance-disk1.img)= {}\n",
        sha256(APPLIANCE_OVF.as_bytes()),
        recorded.map(str::to_string).unwrap_or_else(|| sha256(disk0)),
        sha256(disk1),
    );
    let members: [(&str, &[u8]); 4] = [
        ("appliance.ovf", APPLIANCE_OVF.as_bytes()),
        ("appliance.mf", manifest.as_bytes()),
        ("appliance-disk0.img", disk0),
        ("appliance-disk1.img", disk1),
    ];

    let mut builder = tar::Builder::new(File::create(path).unwrap());
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
    }
    builder.finish().unwrap();
}

struct Import {
    platform: MemoryPlatform,
    ctx: Context,
    key: ObjectKey,
    working_dir: std::path::PathBuf,
    _dir: TempDir,
}

fn import(recorded_digest: Option<&str>) -> Import {
    let dir = TempDir::new().unwrap();
    let ova = dir.path().join("appliance.ova");
    write_ova(&ova, &[0x11; 4096], &[0x22; 2048], recorded_digest);

    let config = ImportConfig {
        working_dir: dir.path().join("work"),
        ..Default::default()
    };
    let working_dir = config.working_dir.clone();

    let cluster = SourceCluster {
        metadata: ObjectMeta {
            name: "appliances".into(),
            namespace: "lab".into(),
            ..Default::default()
        },
        api_version: SOURCE_API_VERSION.into(),
        spec: SourceClusterSpec::Ova(OvaSourceSpec {
            url: ova.display().to_string(),
            http_timeout_seconds: None,
            credentials: None,
        }),
        status: SourceClusterStatus::default().ready(),
    };
    let request = MigrationRequest {
        metadata: ObjectMeta {
            name: "appliance-import".into(),
            namespace: "lab".into(),
            uid: "uid-ova".into(),
            ..Default::default()
        },
        spec: MigrationSpec {
            source_cluster: cluster.reference(),
            virtual_machine_name: "Appliance".into(),
            folder: None,
            mapping: vec![NetworkMapping {
                source_network: "VM Network".into(),
                destination_network: "vlan20".into(),
                network_interface_model: None,
            }],
            storage_class: None,
            skip_preflight_checks: false,
            force_power_off: false,
            graceful_shutdown_timeout_seconds: None,
            default_network_interface_model: None,
            default_disk_bus: None,
        },
        status: MigrationStatus::default(),
    };

    let platform = MemoryPlatform::new();
    platform.insert_source_cluster(cluster).unwrap();
    platform.add_network(ObjectKey::new("lab", "vlan20")).unwrap();
    let key = request.key();
    platform.insert_migration(request).unwrap();

    let resolver = AdapterResolver::new(ExportContext::from_config(&config).unwrap());
    let ctx = Context::new(
        Arc::new(platform.clone()),
        Arc::new(resolver),
        Arc::new(config),
    );
    Import {
        platform,
        ctx,
        key,
        working_dir,
        _dir: dir,
    }
}

impl Import {
    fn request(&self) -> MigrationRequest {
        self.platform.migration(&self.key).unwrap().unwrap()
    }

    async fn run_until(&self, phase: Phase) {
        for _ in 0..12 {
            if self.request().status.phase == phase {
                return;
            }
            reconciler::reconcile(&self.ctx, &self.key).await.unwrap();
        }
        panic!("stuck in {}", self.request().status.phase);
    }

    fn converted_images(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.working_dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.contains("-disk-") && name.ends_with(".img"))
            .collect()
    }
}

#[tokio::test]
async fn local_ova_is_imported_end_to_end() {
    let import = import(None);
    import.run_until(Phase::DiskImagesSubmitted).await;

    let status = import.request().status;
    assert_eq!(status.target_vm_name, "appliance");
    assert_eq!(status.disk_info.len(), 2);
    assert_eq!(status.disk_info[0].size_bytes, 4096);
    assert_eq!(status.disk_info[1].bus_type, DiskBus::Sata);
    let disk0 = std::fs::read(&status.disk_info[0].local_path).unwrap();
    assert_eq!(disk0, vec![0x11; 4096]);
    assert!(status.disk_info[0]
        .local_path
        .ends_with("lab_appliance-import_appliance-disk-0.img"));
    assert!(import.working_dir.join("lab_appliance-import_appliance.ova").exists());

    for disk in &status.disk_info {
        let image = ObjectKey::new("lab", disk.image_name.clone().unwrap());
        import
            .platform
            .set_image_state(&image, ImportState::Imported)
            .unwrap();
    }
    import.run_until(Phase::VirtualMachineCreated).await;

    let vm = import.platform.virtual_machines().unwrap().remove(0).definition;
    assert_eq!(vm.name, "appliance");
    assert_eq!(vm.cpu_cores, 4);
    assert_eq!(vm.memory_bytes, 2048 << 20);
    assert_eq!(vm.firmware, Firmware::Bios);
    assert_eq!(vm.disks.len(), 2);
    assert_eq!(
        vm.networks[0].attachment,
        NetworkAttachment::Multus {
            network_name: "vlan20".into()
        }
    );
    assert_eq!(vm.interfaces[0].mac_address.as_deref(), Some("00:50:56:01:02:03"));

    import
        .platform
        .set_vm_ready(&ObjectKey::new("lab", "appliance"), true)
        .unwrap();
    import.run_until(Phase::VirtualMachineRunning).await;
    reconciler::reconcile(&import.ctx, &import.key).await.unwrap();

    assert!(import.request().status.has_condition(types::CLEANUP_COMPLETE));
    assert!(import.converted_images().is_empty());
    assert!(!import.working_dir.join("lab_appliance-import_appliance.ova").exists());
    assert!(!import.working_dir.join("lab_appliance-import_appliance.ovf").exists());
}

#[tokio::test]
async fn checksum_mismatch_fails_without_leaving_images() {
    let import = import(Some("0".repeat(64).as_str()));
    import.run_until(Phase::MigrationFailed).await;

    let status = import.request().status;
    let failed = condition::get(&status.conditions, types::EXPORT_FAILED, ConditionStatus::True)
        .unwrap();
    assert!(failed.message.contains("appliance-disk0.img"));
    assert!(import.converted_images().is_empty());
    assert!(import.platform.images().unwrap().is_empty());
}
