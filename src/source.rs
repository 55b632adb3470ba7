//! Source cluster resources: where a VM is imported from and how to reach it.

use crate::condition::{self, Condition, ConditionStatus, types};
use crate::migration::{ObjectKey, ObjectMeta, SOURCE_API_VERSION, SourceClusterRef};
use crate::{ImportError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Well-known field names inside credential secrets.
pub mod secret_keys {
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
    pub const PRIVATE_KEY: &str = "privateKey";
    pub const CA_CERT: &str = "ca.crt";
    pub const PROJECT_NAME: &str = "project_name";
    pub const DOMAIN_NAME: &str = "domain_name";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    #[serde(rename = "VmwareSource")]
    Vmware,
    #[serde(rename = "OpenstackSource")]
    Openstack,
    #[serde(rename = "OvaSource")]
    Ova,
    #[serde(rename = "KvmSource")]
    Kvm,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Vmware => "VmwareSource",
            SourceKind::Openstack => "OpenstackSource",
            SourceKind::Ova => "OvaSource",
            SourceKind::Kvm => "KvmSource",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "VmwareSource" => Ok(SourceKind::Vmware),
            "OpenstackSource" => Ok(SourceKind::Openstack),
            "OvaSource" => Ok(SourceKind::Ova),
            "KvmSource" => Ok(SourceKind::Kvm),
            other => Err(ImportError::UnsupportedSource(format!(
                "unknown source kind '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretRef {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Secret {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl Secret {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| {
            ImportError::Validation(format!(
                "secret {}/{} is missing '{}'",
                self.metadata.namespace, self.metadata.name, key
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmwareSourceSpec {
    /// vCenter base URL, e.g. `https://vcenter.example.com`.
    pub endpoint: String,
    pub datacenter: String,
    pub credentials: SecretRef,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenstackSourceSpec {
    /// Keystone v3 URL, e.g. `https://keystone.example.com:5000/v3`.
    pub endpoint: String,
    pub region: String,
    pub credentials: SecretRef,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OvaSourceSpec {
    pub url: String,
    #[serde(default)]
    pub http_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub credentials: Option<SecretRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KvmSourceSpec {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub credentials: SecretRef,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum SourceClusterSpec {
    #[serde(rename = "VmwareSource")]
    Vmware(VmwareSourceSpec),
    #[serde(rename = "OpenstackSource")]
    Openstack(OpenstackSourceSpec),
    #[serde(rename = "OvaSource")]
    Ova(OvaSourceSpec),
    #[serde(rename = "KvmSource")]
    Kvm(KvmSourceSpec),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterState {
    Ready,
    #[default]
    NotReady,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SourceClusterStatus {
    #[serde(default)]
    pub status: ClusterState,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl SourceClusterStatus {
    pub fn ready(&self) -> Self {
        let conditions = condition::upsert(
            &self.conditions,
            Condition::new(types::CLUSTER_READY, ConditionStatus::True)
                .with_reason("ConnectivityVerified"),
        );
        Self {
            status: ClusterState::Ready,
            conditions: condition::remove(&conditions, types::CLUSTER_ERROR, ConditionStatus::True),
        }
    }

    pub fn not_ready(&self, message: impl Into<String>) -> Self {
        let message = message.into();
        let conditions = condition::merge(
            &self.conditions,
            vec![
                Condition::new(types::CLUSTER_READY, ConditionStatus::False)
                    .with_reason("ConnectivityFailed"),
                Condition::new(types::CLUSTER_ERROR, ConditionStatus::True)
                    .with_reason("ConnectivityFailed")
                    .with_message(message),
            ],
        );
        Self {
            status: ClusterState::NotReady,
            conditions,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceCluster {
    pub metadata: ObjectMeta,
    #[serde(rename = "apiVersion", default = "default_api_version")]
    pub api_version: String,
    pub spec: SourceClusterSpec,
    #[serde(default)]
    pub status: SourceClusterStatus,
}

fn default_api_version() -> String {
    SOURCE_API_VERSION.to_string()
}

impl SourceCluster {
    pub fn kind(&self) -> SourceKind {
        match self.spec {
            SourceClusterSpec::Vmware(_) => SourceKind::Vmware,
            SourceClusterSpec::Openstack(_) => SourceKind::Openstack,
            SourceClusterSpec::Ova(_) => SourceKind::Ova,
            SourceClusterSpec::Kvm(_) => SourceKind::Kvm,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn credentials(&self) -> Option<&SecretRef> {
        match &self.spec {
            SourceClusterSpec::Vmware(spec) => Some(&spec.credentials),
            SourceClusterSpec::Openstack(spec) => Some(&spec.credentials),
            SourceClusterSpec::Ova(spec) => spec.credentials.as_ref(),
            SourceClusterSpec::Kvm(spec) => Some(&spec.credentials),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status.status == ClusterState::Ready
    }

    /// Reference that points at this cluster.
    pub fn reference(&self) -> SourceClusterRef {
        SourceClusterRef {
            kind: self.kind().as_str().to_string(),
            name: self.metadata.name.clone(),
            namespace: self.metadata.namespace.clone(),
            api_version: self.api_version.clone(),
        }
    }
}

/// Check a reference's kind and declared API version before it is resolved.
pub fn validate_reference(reference: &SourceClusterRef) -> Result<SourceKind> {
    let kind = reference.kind.parse::<SourceKind>()?;
    if reference.api_version != SOURCE_API_VERSION {
        return Err(ImportError::UnsupportedSource(format!(
            "{} '{}' declares unsupported apiVersion '{}'",
            kind, reference.name, reference.api_version
        )));
    }
    Ok(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_round_trips_with_kind_tag() {
        let toml_str = r#"
kind = "KvmSource"
host = "kvm01.lab"
[credentials]
name = "kvm-creds"
namespace = "default"
"#;
        let spec: SourceClusterSpec = toml::from_str(toml_str).unwrap();
        match spec {
            SourceClusterSpec::Kvm(kvm) => {
                assert_eq!(kvm.host, "kvm01.lab");
                assert_eq!(kvm.port, 22);
            }
            other => panic!("unexpected spec {:?}", other),
        }
    }

    #[test]
    fn ready_and_not_ready_toggle_conditions() {
        let status = SourceClusterStatus::default().not_ready("connection refused");
        assert_eq!(status.status, ClusterState::NotReady);
        let err = condition::get(&status.conditions, types::CLUSTER_ERROR, ConditionStatus::True)
            .unwrap();
        assert_eq!(err.message, "connection refused");

        let ready = status.ready();
        assert_eq!(ready.status, ClusterState::Ready);
        assert!(condition::exists(&ready.conditions, types::CLUSTER_READY, ConditionStatus::True));
        assert!(!condition::exists(&ready.conditions, types::CLUSTER_ERROR, ConditionStatus::True));
        assert_eq!(ready.conditions.len(), 1);
    }

    #[test]
    fn reference_validation() {
        let mut reference = SourceClusterRef {
            kind: "OvaSource".into(),
            name: "appliances".into(),
            namespace: "default".into(),
            api_version: SOURCE_API_VERSION.into(),
        };
        assert_eq!(validate_reference(&reference).unwrap(), SourceKind::Ova);

        reference.api_version = "migration.harbor.io/v1alpha1".into();
        assert!(validate_reference(&reference).unwrap_err().is_terminal());

        reference.kind = "XenSource".into();
        assert!(validate_reference(&reference).unwrap_err().is_terminal());
    }

    #[test]
    fn secret_require_reports_missing_key() {
        let secret = Secret {
            metadata: ObjectMeta {
                name: "creds".into(),
                namespace: "default".into(),
                ..Default::default()
            },
            data: BTreeMap::from([("username".to_string(), "admin".to_string())]),
        };
        assert_eq!(secret.require(secret_keys::USERNAME).unwrap(), "admin");
        let err = secret.require(secret_keys::PASSWORD).unwrap_err();
        assert!(err.to_string().contains("password"));
    }
}
