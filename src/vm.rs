//! Destination virtual machine definitions.

use crate::migration::DiskBus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label placed on every imported VM, valued `<namespace>.<request name>`.
pub const IMPORTED_LABEL: &str = "migration.harbor.io/imported";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    #[default]
    Bios,
    Uefi { secure_boot: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NetworkAttachment {
    /// The platform's default pod network.
    Pod,
    Multus { network_name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub attachment: NetworkAttachment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceBinding {
    Bridge,
    Masquerade,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub mac_address: Option<String>,
    pub binding: InterfaceBinding,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub name: String,
    pub bus: DiskBus,
    #[serde(default)]
    pub boot_order: Option<u32>,
    pub volume_claim: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachineDefinition {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    #[serde(default)]
    pub firmware: Firmware,
    #[serde(default)]
    pub tpm: bool,
    pub networks: Vec<Network>,
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub disks: Vec<Disk>,
}

impl VirtualMachineDefinition {
    /// Attach one disk per claim, booting from them in order.
    pub fn with_disks(mut self, disks: impl IntoIterator<Item = (String, DiskBus)>) -> Self {
        self.disks = disks
            .into_iter()
            .enumerate()
            .map(|(index, (claim, bus))| Disk {
                name: format!("disk-{}", index),
                bus,
                boot_order: Some(index as u32 + 1),
                volume_claim: claim,
            })
            .collect();
        self
    }

    pub fn with_label(mut self, key: &str, value: impl Into<String>) -> Self {
        self.labels.insert(key.to_string(), value.into());
        self
    }

    pub fn is_uefi(&self) -> bool {
        matches!(self.firmware, Firmware::Uefi { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disks_get_sequential_boot_order() {
        let vm = VirtualMachineDefinition {
            name: "web".into(),
            namespace: "default".into(),
            labels: BTreeMap::new(),
            cpu_cores: 2,
            memory_bytes: 2 << 30,
            firmware: Firmware::Uefi { secure_boot: true },
            tpm: false,
            networks: Vec::new(),
            interfaces: Vec::new(),
            disks: Vec::new(),
        }
        .with_disks(vec![
            ("web-disk-0".to_string(), DiskBus::Virtio),
            ("web-disk-1".to_string(), DiskBus::Sata),
        ]);

        assert!(vm.is_uefi());
        assert_eq!(vm.disks.len(), 2);
        assert_eq!(vm.disks[0].boot_order, Some(1));
        assert_eq!(vm.disks[1].name, "disk-1");
        assert_eq!(vm.disks[1].bus, DiskBus::Sata);
    }
}
