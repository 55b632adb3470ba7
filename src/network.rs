//! Maps source NICs onto destination networks.

use crate::migration::{NetworkMapping, ObjectKey};
use crate::vm::{Interface, InterfaceBinding, Network, NetworkAttachment};
use crate::{ImportError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Name of the fallback attachment to the platform's pod network.
pub const POD_NETWORK_NAME: &str = "default";

/// A NIC as discovered on the source VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceNic {
    /// Name of the network the NIC is attached to on the source.
    pub network_name: String,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedNic {
    pub nic: SourceNic,
    pub destination_network: String,
    pub model_override: Option<String>,
}

/// Keep NICs whose network has a mapping entry; unmapped NICs are dropped.
pub fn map_networks(nics: &[SourceNic], mapping: &[NetworkMapping]) -> Vec<MappedNic> {
    nics.iter()
        .filter_map(|nic| {
            mapping
                .iter()
                .find(|entry| entry.source_network == nic.network_name)
                .map(|entry| MappedNic {
                    nic: nic.clone(),
                    destination_network: entry.destination_network.clone(),
                    model_override: entry.network_interface_model.clone(),
                })
        })
        .collect()
}

/// Build the network and interface lists for the destination VM.
///
/// Never returns an empty network list: without matches, a single masquerade
/// interface on the pod network is emitted.
pub fn generate_interface_config(
    mapped: &[MappedNic],
    default_model: &str,
) -> (Vec<Network>, Vec<Interface>) {
    if mapped.is_empty() {
        let network = Network {
            name: POD_NETWORK_NAME.to_string(),
            attachment: NetworkAttachment::Pod,
        };
        let interface = Interface {
            name: POD_NETWORK_NAME.to_string(),
            model: default_model.to_string(),
            mac_address: None,
            binding: InterfaceBinding::Masquerade,
        };
        return (vec![network], vec![interface]);
    }

    mapped
        .iter()
        .enumerate()
        .map(|(index, nic)| {
            let name = format!("migrated-{}", index);
            let network = Network {
                name: name.clone(),
                attachment: NetworkAttachment::Multus {
                    network_name: nic.destination_network.clone(),
                },
            };
            let interface = Interface {
                name,
                model: nic
                    .model_override
                    .clone()
                    .unwrap_or_else(|| default_model.to_string()),
                mac_address: nic.nic.mac_address.clone(),
                binding: InterfaceBinding::Bridge,
            };
            (network, interface)
        })
        .unzip()
}

/// Reject mapping tables that name the same source network twice.
pub fn check_duplicate_sources(mapping: &[NetworkMapping]) -> Result<()> {
    let mut seen = HashSet::new();
    for entry in mapping {
        if !seen.insert(entry.source_network.as_str()) {
            return Err(ImportError::Validation(format!(
                "source network '{}' is mapped more than once",
                entry.source_network
            )));
        }
    }
    Ok(())
}

/// Split `namespace/name`; a bare name lives in `default_namespace`.
pub fn destination_key(destination: &str, default_namespace: &str) -> Result<ObjectKey> {
    let parts: Vec<&str> = destination.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok(ObjectKey::new(default_namespace, *name)),
        [namespace, name] if !namespace.is_empty() && !name.is_empty() => {
            Ok(ObjectKey::new(*namespace, *name))
        }
        _ => Err(ImportError::Validation(format!(
            "destination network '{}' is not of the form namespace/name",
            destination
        ))),
    }
}
