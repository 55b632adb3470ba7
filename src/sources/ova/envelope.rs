//! OVF envelope parsing.
//!
//! Only the parts needed to rebuild the VM are read: file references, the
//! disk section, virtual hardware items and VMware firmware hints.

use crate::migration::DiskBus;
use crate::network::SourceNic;
use crate::sources::SourceVirtualMachine;
use crate::sources::xml::{attributes, local_name};
use crate::vm::Firmware;
use crate::{ImportError, Result};
use quick_xml::Reader;
use quick_xml::events::Event;
use std::collections::BTreeMap;

/// CIM resource types used in `VirtualHardwareSection` items.
pub mod resource_type {
    pub const OTHER: u32 = 1;
    pub const PROCESSOR: u32 = 3;
    pub const MEMORY: u32 = 4;
    pub const IDE_CONTROLLER: u32 = 5;
    pub const SCSI_CONTROLLER: u32 = 6;
    pub const ETHERNET_ADAPTER: u32 = 10;
    pub const DISK_DRIVE: u32 = 17;
    pub const SATA_CONTROLLER: u32 = 20;
}

const VTPM_SUB_TYPE: &str = "vmware.vtpm";

const SECURE_BOOT_KEYS: &[&str] = &["uefi.secureBoot.enabled", "bootOptions.efiSecureBootEnabled"];

/// Controller sub-type fragments, checked in order.
const BUS_HINTS: &[(&[&str], DiskBus)] = &[
    (&["scsi", "buslogic", "lsilogic"], DiskBus::Scsi),
    (&["ahci", "sata", "ide"], DiskBus::Sata),
    (&["virtio", "nvme"], DiskBus::Virtio),
    (&["usb"], DiskBus::Usb),
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileReference {
    pub id: String,
    pub href: String,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VirtualDisk {
    pub disk_id: String,
    pub file_ref: Option<String>,
    pub capacity: String,
    pub capacity_units: Option<String>,
    pub format: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HardwareItem {
    pub instance_id: String,
    pub resource_type: u32,
    pub resource_sub_type: Option<String>,
    pub element_name: Option<String>,
    pub parent: Option<String>,
    pub host_resource: Option<String>,
    pub connection: Option<String>,
    pub address: Option<String>,
    pub virtual_quantity: Option<String>,
    pub allocation_units: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub name: String,
    pub files: Vec<FileReference>,
    pub disks: Vec<VirtualDisk>,
    pub networks: Vec<String>,
    pub items: Vec<HardwareItem>,
    /// `vmw:Config` and `vmw:ExtraConfig` key/value pairs.
    pub config: BTreeMap<String, String>,
}

/// A disk drive item resolved against the disk section and file references.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskLayout {
    pub file: FileReference,
    pub capacity_bytes: u64,
    pub bus: DiskBus,
    pub format_hint: Option<String>,
}

pub fn parse(xml: &str) -> Result<Envelope> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut envelope = Envelope::default();
    let mut stack: Vec<String> = Vec::new();
    let mut item: Option<HardwareItem> = None;

    loop {
        match reader.read_event()? {
            Event::Start(ref e) => {
                let tag = local_name(e);
                if is_item(&tag) {
                    item = Some(HardwareItem::default());
                } else {
                    open_element(&mut envelope, &tag, &attributes(e), stack.last());
                }
                stack.push(tag);
            }
            Event::Empty(ref e) => {
                let tag = local_name(e);
                open_element(&mut envelope, &tag, &attributes(e), stack.last());
            }
            Event::Text(ref t) => {
                let text = String::from_utf8_lossy(t).trim().to_string();
                let Some(field) = stack.last() else { continue };
                if let Some(current) = item.as_mut() {
                    set_item_field(current, field, text)?;
                } else if field == "Name"
                    && stack.iter().rev().nth(1).map(String::as_str) == Some("VirtualSystem")
                {
                    envelope.name = text;
                }
            }
            Event::End(ref e) => {
                let tag = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if is_item(&tag) {
                    if let Some(done) = item.take() {
                        envelope.items.push(done);
                    }
                }
                stack.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if envelope.items.is_empty() && envelope.disks.is_empty() {
        return Err(ImportError::Envelope(
            "envelope describes no virtual hardware".to_string(),
        ));
    }
    Ok(envelope)
}

fn is_item(tag: &str) -> bool {
    matches!(tag, "Item" | "StorageItem" | "EthernetPortItem")
}

fn open_element(
    envelope: &mut Envelope,
    tag: &str,
    attrs: &BTreeMap<String, String>,
    parent: Option<&String>,
) {
    let attr = |key: &str| attrs.get(key).cloned();
    match tag {
        "File" => envelope.files.push(FileReference {
            id: attr("id").unwrap_or_default(),
            href: attr("href").unwrap_or_default(),
            size: attr("size").and_then(|s| s.parse().ok()),
        }),
        "Disk" if parent.map(String::as_str) == Some("DiskSection") => {
            envelope.disks.push(VirtualDisk {
                disk_id: attr("diskId").unwrap_or_default(),
                file_ref: attr("fileRef"),
                capacity: attr("capacity").unwrap_or_default(),
                capacity_units: attr("capacityAllocationUnits"),
                format: attr("format"),
            })
        }
        "Network" if parent.map(String::as_str) == Some("NetworkSection") => {
            if let Some(name) = attr("name") {
                envelope.networks.push(name);
            }
        }
        "Config" | "ExtraConfig" => {
            if let (Some(key), Some(value)) = (attr("key"), attr("value")) {
                envelope.config.insert(key, value);
            }
        }
        "VirtualSystem" if envelope.name.is_empty() => {
            envelope.name = attr("id").unwrap_or_default();
        }
        _ => {}
    }
}

fn set_item_field(item: &mut HardwareItem, field: &str, text: String) -> Result<()> {
    match field {
        "InstanceID" => item.instance_id = text,
        "ResourceType" => {
            item.resource_type = text.parse().map_err(|_| {
                ImportError::Envelope(format!("invalid ResourceType '{}'", text))
            })?
        }
        "ResourceSubType" => item.resource_sub_type = Some(text),
        "ElementName" => item.element_name = Some(text),
        "Parent" => item.parent = Some(text),
        "HostResource" => item.host_resource = Some(text),
        "Connection" => item.connection = Some(text),
        "Address" => item.address = Some(text),
        "VirtualQuantity" => item.virtual_quantity = Some(text),
        "AllocationUnits" => item.allocation_units = Some(text),
        _ => {}
    }
    Ok(())
}

/// Convert an OVF capacity and its allocation units to bytes.
///
/// Accepts the programmatic form `byte * 2^N` and the common named units,
/// which OVF tooling always treats as binary multiples.
pub fn parse_capacity(value: &str, units: Option<&str>) -> Result<u64> {
    let amount: u64 = value
        .trim()
        .parse()
        .map_err(|_| ImportError::Envelope(format!("invalid capacity '{}'", value)))?;

    let multiplier = match units.map(str::trim).filter(|u| !u.is_empty()) {
        None => 1,
        Some(units) => unit_multiplier(units)?,
    };

    amount.checked_mul(multiplier).ok_or_else(|| {
        ImportError::Envelope(format!("capacity {} {} overflows", value, units.unwrap_or("")))
    })
}

fn unit_multiplier(units: &str) -> Result<u64> {
    let normalized: String = units
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();

    if let Some(exponent) = normalized.strip_prefix("byte*2^") {
        let exponent: u32 = exponent
            .parse()
            .map_err(|_| ImportError::Envelope(format!("invalid allocation units '{}'", units)))?;
        return 1u64.checked_shl(exponent).ok_or_else(|| {
            ImportError::Envelope(format!("allocation units '{}' out of range", units))
        });
    }

    let shift = match normalized.as_str() {
        "byte" | "bytes" | "b" => 0,
        "kb" | "kib" | "kilobyte" | "kilobytes" => 10,
        "mb" | "mib" | "megabyte" | "megabytes" => 20,
        "gb" | "gib" | "gigabyte" | "gigabytes" => 30,
        "tb" | "tib" | "terabyte" | "terabytes" => 40,
        _ => {
            return Err(ImportError::Envelope(format!(
                "unknown allocation units '{}'",
                units
            )));
        }
    };
    Ok(1u64 << shift)
}

/// Bus of a disk attached to a controller item.
pub fn controller_bus(controller: &HardwareItem, default: DiskBus) -> DiskBus {
    if let Some(sub_type) = controller.resource_sub_type.as_deref() {
        let sub_type = sub_type.to_ascii_lowercase();
        for (fragments, bus) in BUS_HINTS {
            if fragments.iter().any(|f| sub_type.contains(f)) {
                return *bus;
            }
        }
    }
    match controller.resource_type {
        resource_type::IDE_CONTROLLER | resource_type::SATA_CONTROLLER => DiskBus::Sata,
        resource_type::SCSI_CONTROLLER => DiskBus::Scsi,
        _ => default,
    }
}

impl Envelope {
    fn items_of(&self, kind: u32) -> impl Iterator<Item = &HardwareItem> {
        self.items.iter().filter(move |item| item.resource_type == kind)
    }

    pub fn cpu_count(&self) -> u32 {
        self.items_of(resource_type::PROCESSOR)
            .filter_map(|item| item.virtual_quantity.as_deref()?.parse::<u32>().ok())
            .sum::<u32>()
            .max(1)
    }

    pub fn memory_bytes(&self) -> Result<u64> {
        let Some(item) = self.items_of(resource_type::MEMORY).next() else {
            return Err(ImportError::Envelope("envelope has no memory item".to_string()));
        };
        let quantity = item.virtual_quantity.as_deref().unwrap_or("0");
        parse_capacity(
            quantity,
            Some(item.allocation_units.as_deref().unwrap_or("byte * 2^20")),
        )
    }

    /// `firmware` decides when present; otherwise an NVRAM file or any
    /// `uefi.*` setting means the appliance boots through UEFI.
    pub fn firmware(&self) -> Firmware {
        let efi = match self.config.get("firmware") {
            Some(value) => value.eq_ignore_ascii_case("efi"),
            None => self.has_efi_hints(),
        };
        if !efi {
            return Firmware::Bios;
        }
        let secure_boot = SECURE_BOOT_KEYS.iter().any(|key| {
            self.config
                .get(*key)
                .is_some_and(|v| v.eq_ignore_ascii_case("true"))
        });
        Firmware::Uefi { secure_boot }
    }

    fn has_efi_hints(&self) -> bool {
        self.config
            .keys()
            .any(|key| key == "nvram" || key.starts_with("uefi."))
            || self
                .files
                .iter()
                .any(|file| file.href.to_ascii_lowercase().ends_with(".nvram"))
    }

    pub fn has_vtpm(&self) -> bool {
        self.items.iter().any(|item| {
            item.resource_sub_type
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case(VTPM_SUB_TYPE))
        })
    }

    pub fn nics(&self) -> Vec<SourceNic> {
        self.items_of(resource_type::ETHERNET_ADAPTER)
            .map(|item| SourceNic {
                network_name: item.connection.clone().unwrap_or_default(),
                mac_address: item.address.clone(),
                model: item.resource_sub_type.clone(),
            })
            .collect()
    }

    pub fn source_vm(&self) -> Result<SourceVirtualMachine> {
        Ok(SourceVirtualMachine {
            cpu_cores: self.cpu_count(),
            memory_bytes: self.memory_bytes()?,
            firmware: self.firmware(),
            tpm: self.has_vtpm(),
            nics: self.nics(),
        })
    }

    /// Disk drives in hardware order, resolved to their backing files.
    pub fn disk_layout(&self, default_bus: DiskBus) -> Result<Vec<DiskLayout>> {
        let mut layout = Vec::new();
        for drive in self.items_of(resource_type::DISK_DRIVE) {
            let Some(host_resource) = drive.host_resource.as_deref() else {
                continue;
            };
            let disk_id = host_resource
                .rsplit('/')
                .next()
                .unwrap_or(host_resource);
            let disk = self
                .disks
                .iter()
                .find(|d| d.disk_id == disk_id)
                .ok_or_else(|| {
                    ImportError::Envelope(format!("disk '{}' is not declared", disk_id))
                })?;
            let file_ref = disk.file_ref.as_deref().ok_or_else(|| {
                ImportError::Envelope(format!("disk '{}' has no backing file", disk_id))
            })?;
            let file = self
                .files
                .iter()
                .find(|f| f.id == file_ref)
                .cloned()
                .ok_or_else(|| {
                    ImportError::Envelope(format!("file reference '{}' is missing", file_ref))
                })?;

            let bus = drive
                .parent
                .as_deref()
                .and_then(|parent| self.items.iter().find(|i| i.instance_id == parent))
                .map(|controller| controller_bus(controller, default_bus))
                .unwrap_or(default_bus);

            let capacity_bytes = parse_capacity(&disk.capacity, disk.capacity_units.as_deref())
                .or_else(|err| file.size.ok_or(err))?;

            layout.push(DiskLayout {
                file,
                capacity_bytes,
                bus,
                format_hint: disk.format.clone(),
            });
        }
        Ok(layout)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    pub const WEB_OVF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Envelope xmlns="http://schemas.dmtf.org/ovf/envelope/1"
          xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1"
          xmlns:rasd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_ResourceAllocationSettingData"
          xmlns:vmw="http://www.vmware.com/schema/ovf">
  <References>
    <File ovf:id="file1" ovf:href="web-disk1.vmdk" ovf:size="1024"/>
    <File ovf:id="file2" ovf:href="web-disk2.vmdk" ovf:size="2048"/>
  </References>
  <DiskSection>
    <Info>Virtual disk information</Info>
    <Disk ovf:capacity="16" ovf:capacityAllocationUnits="byte * 2^30" ovf:diskId="vmdisk1" ovf:fileRef="file1" ovf:format="http://www.vmware.com/interfaces/specifications/vmdk.html#streamOptimized"/>
    <Disk ovf:capacity="2" ovf:capacityAllocationUnits="GB" ovf:diskId="vmdisk2" ovf:fileRef="file2"/>
  </DiskSection>
  <NetworkSection>
    <Info>The list of logical networks</Info>
    <Network ovf:name="VM Network"/>
  </NetworkSection>
  <VirtualSystem ovf:id="web-01">
    <Name>web-01</Name>
    <VirtualHardwareSection>
      <Item>
        <rasd:AllocationUnits>hertz * 10^6</rasd:AllocationUnits>
        <rasd:InstanceID>1</rasd:InstanceID>
        <rasd:ResourceType>3</rasd:ResourceType>
        <rasd:VirtualQuantity>2</rasd:VirtualQuantity>
      </Item>
      <Item>
        <rasd:AllocationUnits>byte * 2^20</rasd:AllocationUnits>
        <rasd:InstanceID>2</rasd:InstanceID>
        <rasd:ResourceType>4</rasd:ResourceType>
        <rasd:VirtualQuantity>4096</rasd:VirtualQuantity>
      </Item>
      <Item>
        <rasd:InstanceID>3</rasd:InstanceID>
        <rasd:ResourceSubType>lsilogic</rasd:ResourceSubType>
        <rasd:ResourceType>6</rasd:ResourceType>
      </Item>
      <Item>
        <rasd:InstanceID>4</rasd:InstanceID>
        <rasd:ResourceSubType>vmware.sata.ahci</rasd:ResourceSubType>
        <rasd:ResourceType>20</rasd:ResourceType>
      </Item>
      <Item>
        <rasd:HostResource>ovf:/disk/vmdisk1</rasd:HostResource>
        <rasd:InstanceID>5</rasd:InstanceID>
        <rasd:Parent>3</rasd:Parent>
        <rasd:ResourceType>17</rasd:ResourceType>
      </Item>
      <Item>
        <rasd:HostResource>ovf:/disk/vmdisk2</rasd:HostResource>
        <rasd:InstanceID>6</rasd:InstanceID>
        <rasd:Parent>4</rasd:Parent>
        <rasd:ResourceType>17</rasd:ResourceType>
      </Item>
      <Item>
        <rasd:Address>00:50:56:aa:bb:cc</rasd:Address>
        <rasd:Connection>VM Network</rasd:Connection>
        <rasd:InstanceID>7</rasd:InstanceID>
        <rasd:ResourceSubType>VmxNet3</rasd:ResourceSubType>
        <rasd:ResourceType>10</rasd:ResourceType>
      </Item>
      <Item ovf:required="false">
        <rasd:InstanceID>8</rasd:InstanceID>
        <rasd:ResourceSubType>vmware.vtpm</rasd:ResourceSubType>
        <rasd:ResourceType>1</rasd:ResourceType>
      </Item>
      <vmw:Config ovf:required="false" vmw:key="firmware" vmw:value="efi"/>
      <vmw:ExtraConfig ovf:required="false" vmw:key="uefi.secureBoot.enabled" vmw:value="TRUE"/>
    </VirtualHardwareSection>
  </VirtualSystem>
</Envelope>
"#;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_units() {
        assert_eq!(parse_capacity("10", Some("GB")).unwrap(), 10 << 30);
        assert_eq!(parse_capacity("10", Some("byte * 2^30")).unwrap(), 10 << 30);
        assert_eq!(parse_capacity("42949672960", None).unwrap(), 42_949_672_960);
        assert_eq!(parse_capacity("512", Some("MegaBytes")).unwrap(), 512 << 20);
        assert_eq!(parse_capacity("7", Some("  ")).unwrap(), 7);
    }

    #[test]
    fn capacity_rejects_garbage() {
        assert!(parse_capacity("${disk.size}", None).is_err());
        assert!(parse_capacity("1", Some("furlongs")).is_err());
        assert!(parse_capacity("1", Some("byte * 2^64")).is_err());
        assert!(parse_capacity(&u64::MAX.to_string(), Some("KB")).is_err());
    }

    #[test]
    fn parses_hardware() {
        let envelope = parse(fixtures::WEB_OVF).unwrap();
        assert_eq!(envelope.name, "web-01");
        assert_eq!(envelope.cpu_count(), 2);
        assert_eq!(envelope.memory_bytes().unwrap(), 4096 << 20);
        assert_eq!(envelope.firmware(), Firmware::Uefi { secure_boot: true });
        assert!(envelope.has_vtpm());
        assert_eq!(envelope.networks, vec!["VM Network".to_string()]);

        let nics = envelope.nics();
        assert_eq!(nics.len(), 1);
        assert_eq!(nics[0].network_name, "VM Network");
        assert_eq!(nics[0].mac_address.as_deref(), Some("00:50:56:aa:bb:cc"));
    }

    #[test]
    fn disk_layout_follows_controllers() {
        let envelope = parse(fixtures::WEB_OVF).unwrap();
        let layout = envelope.disk_layout(DiskBus::Virtio).unwrap();
        assert_eq!(layout.len(), 2);
        assert_eq!(layout[0].file.href, "web-disk1.vmdk");
        assert_eq!(layout[0].capacity_bytes, 16 << 30);
        assert_eq!(layout[0].bus, DiskBus::Scsi);
        assert_eq!(layout[1].file.href, "web-disk2.vmdk");
        assert_eq!(layout[1].capacity_bytes, 2 << 30);
        assert_eq!(layout[1].bus, DiskBus::Sata);
    }

    #[test]
    fn bus_hints_are_checked_in_order() {
        let controller = |sub: Option<&str>, kind: u32| HardwareItem {
            resource_sub_type: sub.map(str::to_string),
            resource_type: kind,
            ..Default::default()
        };
        assert_eq!(controller_bus(&controller(Some("VirtualSCSI"), 6), DiskBus::Virtio), DiskBus::Scsi);
        assert_eq!(controller_bus(&controller(Some("PIIX4"), 5), DiskBus::Virtio), DiskBus::Sata);
        assert_eq!(controller_bus(&controller(Some("vmware.nvme.controller"), 1), DiskBus::Sata), DiskBus::Virtio);
        assert_eq!(controller_bus(&controller(None, 6), DiskBus::Virtio), DiskBus::Scsi);
        assert_eq!(controller_bus(&controller(None, 1), DiskBus::Usb), DiskBus::Usb);
    }

    #[test]
    fn bios_without_efi_config() {
        let envelope = Envelope::default();
        assert_eq!(envelope.firmware(), Firmware::Bios);
        assert!(!envelope.has_vtpm());
    }

    fn envelope_with(config: &[(&str, &str)], files: &[&str]) -> Envelope {
        Envelope {
            config: config
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            files: files
                .iter()
                .enumerate()
                .map(|(i, href)| FileReference {
                    id: format!("file{}", i),
                    href: href.to_string(),
                    size: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn nvram_file_implies_uefi() {
        let envelope = envelope_with(&[], &["web-disk1.vmdk", "web.nvram"]);
        assert_eq!(envelope.firmware(), Firmware::Uefi { secure_boot: false });
    }

    #[test]
    fn efi_settings_imply_uefi() {
        let nvram = envelope_with(&[("nvram", "ovf:/file/file2")], &[]);
        assert_eq!(nvram.firmware(), Firmware::Uefi { secure_boot: false });

        let secure = envelope_with(&[("uefi.secureBoot.enabled", "TRUE")], &[]);
        assert_eq!(secure.firmware(), Firmware::Uefi { secure_boot: true });

        let boot_options = envelope_with(
            &[("firmware", "efi"), ("bootOptions.efiSecureBootEnabled", "true")],
            &[],
        );
        assert_eq!(boot_options.firmware(), Firmware::Uefi { secure_boot: true });
    }

    #[test]
    fn explicit_bios_wins_over_hints() {
        let envelope = envelope_with(&[("firmware", "bios")], &["web.nvram"]);
        assert_eq!(envelope.firmware(), Firmware::Bios);
    }

    #[test]
    fn parsed_nvram_reference_selects_uefi() {
        let xml = fixtures::WEB_OVF
            .replace(
                r#"<vmw:Config ovf:required="false" vmw:key="firmware" vmw:value="efi"/>
      <vmw:ExtraConfig ovf:required="false" vmw:key="uefi.secureBoot.enabled" vmw:value="TRUE"/>"#,
                r#"<vmw:ExtraConfig ovf:required="false" vmw:key="nvram" vmw:value="ovf:/file/file3"/>"#,
            )
            .replace(
                r#"<File ovf:id="file2" ovf:href="web-disk2.vmdk" ovf:size="2048"/>"#,
                r#"<File ovf:id="file2" ovf:href="web-disk2.vmdk" ovf:size="2048"/>
    <File ovf:id="file3" ovf:href="web-01.nvram" ovf:size="8684"/>"#,
            );
        let envelope = parse(&xml).unwrap();
        assert!(!envelope.config.contains_key("firmware"));
        assert_eq!(envelope.firmware(), Firmware::Uefi { secure_boot: false });
    }

    #[test]
    fn rejects_empty_envelopes() {
        assert!(parse("<Envelope><References/></Envelope>").is_err());
    }
}
