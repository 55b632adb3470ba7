//! libvirt domain XML parsing.

use crate::converter::DiskFormat;
use crate::migration::DiskBus;
use crate::network::SourceNic;
use crate::sources::SourceVirtualMachine;
use crate::sources::xml::{attributes, local_name};
use crate::vm::Firmware;
use crate::{ImportError, Result};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomainDisk {
    /// Path of the backing file or block device on the hypervisor.
    pub source: String,
    /// Driver type as declared, e.g. `qcow2` or `raw`.
    pub driver_type: Option<String>,
    pub target_dev: String,
    pub target_bus: Option<String>,
}

impl DomainDisk {
    pub fn format(&self) -> DiskFormat {
        self.driver_type
            .as_deref()
            .and_then(|t| t.parse().ok())
            .unwrap_or(DiskFormat::Qcow2)
    }

    pub fn bus(&self, default: DiskBus) -> DiskBus {
        self.target_bus
            .as_deref()
            .and_then(|b| b.parse().ok())
            .unwrap_or(default)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Domain {
    pub name: String,
    pub vcpus: u32,
    pub memory_bytes: u64,
    pub uefi: bool,
    pub secure_boot: bool,
    pub tpm: bool,
    pub disks: Vec<DomainDisk>,
    pub nics: Vec<SourceNic>,
}

impl Domain {
    pub fn source_vm(&self) -> SourceVirtualMachine {
        SourceVirtualMachine {
            cpu_cores: self.vcpus.max(1),
            memory_bytes: self.memory_bytes,
            firmware: if self.uefi {
                Firmware::Uefi {
                    secure_boot: self.secure_boot,
                }
            } else {
                Firmware::Bios
            },
            tpm: self.tpm,
            nics: self.nics.clone(),
        }
    }
}

/// Convert a libvirt memory amount to bytes. Without a unit, KiB is assumed.
pub fn memory_to_bytes(amount: u64, unit: &str) -> Result<u64> {
    let multiplier: u64 = match unit {
        "b" | "bytes" => 1,
        "KB" => 1_000,
        "" | "k" | "KiB" => 1 << 10,
        "MB" => 1_000_000,
        "M" | "MiB" => 1 << 20,
        "GB" => 1_000_000_000,
        "G" | "GiB" => 1 << 30,
        "TB" => 1_000_000_000_000,
        "T" | "TiB" => 1 << 40,
        other => {
            return Err(ImportError::Source(format!(
                "unknown libvirt memory unit '{}'",
                other
            )));
        }
    };
    amount
        .checked_mul(multiplier)
        .ok_or_else(|| ImportError::Source(format!("memory {} {} overflows", amount, unit)))
}

struct DiskState {
    device: String,
    disk: DomainDisk,
}

#[derive(Default)]
struct InterfaceState {
    network: String,
    mac: Option<String>,
    model: Option<String>,
}

pub fn parse(xml: &str) -> Result<Domain> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut domain = Domain::default();
    let mut stack: Vec<String> = Vec::new();
    let mut disk: Option<DiskState> = None;
    let mut interface: Option<InterfaceState> = None;
    let mut memory_unit = String::new();

    loop {
        match reader.read_event()? {
            Event::Start(ref e) => {
                let tag = local_name(e);
                open_element(e, &tag, &stack, &mut domain, &mut disk, &mut interface, &mut memory_unit);
                stack.push(tag);
            }
            Event::Empty(ref e) => {
                let tag = local_name(e);
                open_element(e, &tag, &stack, &mut domain, &mut disk, &mut interface, &mut memory_unit);
                close_element(&tag, &mut domain, &mut disk, &mut interface);
            }
            Event::Text(ref t) => {
                let text = String::from_utf8_lossy(t).trim().to_string();
                let path: Vec<&str> = stack.iter().map(String::as_str).collect();
                match path.as_slice() {
                    ["domain", "name"] => domain.name = text,
                    ["domain", "vcpu"] => {
                        domain.vcpus = text.parse().map_err(|_| {
                            ImportError::Source(format!("invalid vcpu count '{}'", text))
                        })?
                    }
                    ["domain", "memory"] => {
                        let amount: u64 = text.parse().map_err(|_| {
                            ImportError::Source(format!("invalid memory amount '{}'", text))
                        })?;
                        domain.memory_bytes = memory_to_bytes(amount, &memory_unit)?;
                    }
                    _ => {}
                }
            }
            Event::End(ref e) => {
                let tag = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                close_element(&tag, &mut domain, &mut disk, &mut interface);
                stack.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if domain.name.is_empty() {
        return Err(ImportError::Source("domain XML has no name".to_string()));
    }
    Ok(domain)
}

fn open_element(
    e: &BytesStart,
    tag: &str,
    stack: &[String],
    domain: &mut Domain,
    disk: &mut Option<DiskState>,
    interface: &mut Option<InterfaceState>,
    memory_unit: &mut String,
) {
    let attrs = attributes(e);
    let parent = stack.last().map(String::as_str);
    match (parent, tag) {
        (Some("domain"), "memory") => {
            *memory_unit = attrs.get("unit").cloned().unwrap_or_default();
        }
        (Some("domain"), "os") => {
            if attrs.get("firmware").is_some_and(|f| f == "efi") {
                domain.uefi = true;
            }
        }
        (Some("os"), "loader") => {
            domain.uefi = true;
            if attrs.get("secure").is_some_and(|s| s == "yes") {
                domain.secure_boot = true;
            }
        }
        (Some("devices"), "tpm") => domain.tpm = true,
        (Some("devices"), "disk") => {
            *disk = Some(DiskState {
                device: attrs.get("device").cloned().unwrap_or_else(|| "disk".to_string()),
                disk: DomainDisk::default(),
            });
        }
        (Some("disk"), "driver") => {
            if let Some(state) = disk.as_mut() {
                state.disk.driver_type = attrs.get("type").cloned();
            }
        }
        (Some("disk"), "source") => {
            if let Some(state) = disk.as_mut() {
                state.disk.source = attrs
                    .get("file")
                    .or_else(|| attrs.get("dev"))
                    .cloned()
                    .unwrap_or_default();
            }
        }
        (Some("disk"), "target") => {
            if let Some(state) = disk.as_mut() {
                state.disk.target_dev = attrs.get("dev").cloned().unwrap_or_default();
                state.disk.target_bus = attrs.get("bus").cloned();
            }
        }
        (Some("devices"), "interface") => *interface = Some(InterfaceState::default()),
        (Some("interface"), "source") => {
            if let Some(state) = interface.as_mut() {
                state.network = attrs
                    .get("network")
                    .or_else(|| attrs.get("bridge"))
                    .cloned()
                    .unwrap_or_default();
            }
        }
        (Some("interface"), "mac") => {
            if let Some(state) = interface.as_mut() {
                state.mac = attrs.get("address").cloned();
            }
        }
        (Some("interface"), "model") => {
            if let Some(state) = interface.as_mut() {
                state.model = attrs.get("type").cloned();
            }
        }
        _ => {}
    }
}

fn close_element(
    tag: &str,
    domain: &mut Domain,
    disk: &mut Option<DiskState>,
    interface: &mut Option<InterfaceState>,
) {
    match tag {
        "disk" => {
            if let Some(state) = disk.take() {
                // CD-ROMs and floppies are not migrated.
                if state.device == "disk" && !state.disk.source.is_empty() {
                    domain.disks.push(state.disk);
                }
            }
        }
        "interface" => {
            if let Some(state) = interface.take() {
                domain.nics.push(SourceNic {
                    network_name: state.network,
                    mac_address: state.mac,
                    model: state.model,
                });
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN_XML: &str = r#"
<domain type='kvm'>
  <name>db-primary</name>
  <uuid>4dea22b3-1d52-d8f3-2516-782e98ab3fa0</uuid>
  <memory unit='KiB'>8388608</memory>
  <vcpu placement='static'>4</vcpu>
  <os firmware='efi'>
    <type arch='x86_64' machine='q35'>hvm</type>
    <loader readonly='yes' secure='yes' type='pflash'>/usr/share/OVMF/OVMF_CODE.secboot.fd</loader>
  </os>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/libvirt/images/db-primary.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='disk'>
      <driver name='qemu' type='raw'/>
      <source file='/var/lib/libvirt/images/db-data.img'/>
      <target dev='sda' bus='sata'/>
    </disk>
    <disk type='file' device='cdrom'>
      <source file='/iso/install.iso'/>
      <target dev='sdb' bus='sata'/>
    </disk>
    <interface type='network'>
      <mac address='52:54:00:12:34:56'/>
      <source network='default'/>
      <model type='virtio'/>
    </interface>
    <interface type='bridge'>
      <mac address='52:54:00:65:43:21'/>
      <source bridge='br-storage'/>
    </interface>
    <tpm model='tpm-crb'>
      <backend type='emulator' version='2.0'/>
    </tpm>
  </devices>
</domain>
"#;

    #[test]
    fn parses_domain() {
        let domain = parse(DOMAIN_XML).unwrap();
        assert_eq!(domain.name, "db-primary");
        assert_eq!(domain.vcpus, 4);
        assert_eq!(domain.memory_bytes, 8 << 30);
        assert!(domain.uefi);
        assert!(domain.secure_boot);
        assert!(domain.tpm);

        assert_eq!(domain.disks.len(), 2);
        assert_eq!(domain.disks[0].format(), DiskFormat::Qcow2);
        assert_eq!(domain.disks[0].bus(DiskBus::Scsi), DiskBus::Virtio);
        assert_eq!(domain.disks[1].format(), DiskFormat::Raw);
        assert_eq!(domain.disks[1].bus(DiskBus::Virtio), DiskBus::Sata);

        assert_eq!(domain.nics.len(), 2);
        assert_eq!(domain.nics[0].network_name, "default");
        assert_eq!(domain.nics[1].network_name, "br-storage");
        assert_eq!(domain.nics[1].model, None);
    }

    #[test]
    fn bios_domain_without_loader() {
        let domain = parse(
            "<domain><name>legacy</name><memory>1024</memory><vcpu>1</vcpu><os><type>hvm</type></os></domain>",
        )
        .unwrap();
        assert!(!domain.uefi);
        assert_eq!(domain.memory_bytes, 1 << 20);
        assert_eq!(domain.source_vm().firmware, Firmware::Bios);
    }

    #[test]
    fn memory_units() {
        assert_eq!(memory_to_bytes(2, "GiB").unwrap(), 2 << 30);
        assert_eq!(memory_to_bytes(2, "GB").unwrap(), 2_000_000_000);
        assert_eq!(memory_to_bytes(2, "").unwrap(), 2048);
        assert!(memory_to_bytes(2, "parsecs").is_err());
    }

    #[test]
    fn missing_driver_type_defaults_to_qcow2() {
        let disk = DomainDisk::default();
        assert_eq!(disk.format(), DiskFormat::Qcow2);
    }
}
