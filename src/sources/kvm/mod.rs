//! Remote libvirt/KVM hosts reached over SSH.

pub mod domain;
pub mod ssh;

use crate::error::ErrorList;
use crate::migration::{DiskInfo, MigrationRequest};
use crate::source::{KvmSourceSpec, Secret, secret_keys};
use crate::sources::{
    ExportContext, VirtualMachineOperations, artifact_stem, build_target_vm, file_size, kept_disk,
};
use crate::vm::VirtualMachineDefinition;
use crate::{ImportError, Result, log_info};
use async_trait::async_trait;
use domain::Domain;
use ssh::{SshAuth, SshSession, shell_quote};

const VIRSH: &str = "virsh -c qemu:///system";

/// Optional secret field pinning the host key, as `SHA256:<base64>`.
pub const HOST_KEY_FINGERPRINT: &str = "hostKeyFingerprint";

pub struct KvmClient {
    spec: KvmSourceSpec,
    secret: Secret,
    ctx: ExportContext,
}

impl KvmClient {
    pub fn new(spec: KvmSourceSpec, secret: Secret, ctx: ExportContext) -> Self {
        Self { spec, secret, ctx }
    }

    fn auth(&self) -> Result<SshAuth> {
        if let Some(key) = self.secret.get(secret_keys::PRIVATE_KEY) {
            return Ok(SshAuth::PrivateKey(key.to_string()));
        }
        match self.secret.get(secret_keys::PASSWORD) {
            Some(password) => Ok(SshAuth::Password(password.to_string())),
            None => Err(ImportError::Validation(format!(
                "secret {} has neither '{}' nor '{}'",
                self.secret.metadata.name,
                secret_keys::PRIVATE_KEY,
                secret_keys::PASSWORD
            ))),
        }
    }

    async fn connect(&self) -> Result<SshSession> {
        SshSession::connect(
            &self.spec.host,
            self.spec.port,
            self.secret.require(secret_keys::USERNAME)?,
            &self.auth()?,
            self.secret.get(HOST_KEY_FINGERPRINT).map(str::to_string),
        )
        .await
    }

    /// Run one virsh subcommand on a fresh session.
    async fn virsh(&self, args: &str) -> Result<String> {
        let session = self.connect().await?;
        let result = session.exec(&format!("{} {}", VIRSH, args)).await;
        session.close().await;
        result
    }

    async fn domain(&self, request: &MigrationRequest) -> Result<Domain> {
        let xml = self
            .virsh(&format!(
                "dumpxml {}",
                shell_quote(&request.spec.virtual_machine_name)
            ))
            .await?;
        domain::parse(&xml)
    }
}

/// Whether a `virsh shutdown` or `destroy` failed only because the domain is already off.
fn already_stopped(err: &ImportError) -> bool {
    matches!(err, ImportError::RemoteCommand { stderr, .. } if stderr.contains("domain is not running"))
}

#[async_trait]
impl VirtualMachineOperations for KvmClient {
    async fn verify_connectivity(&self) -> Result<()> {
        self.virsh("list --all --name").await.map(|_| ())
    }

    async fn pre_flight_checks(&self, request: &MigrationRequest) -> Result<()> {
        let domain = self.domain(request).await?;
        if domain.disks.is_empty() {
            return Err(ImportError::Validation(format!(
                "domain '{}' has no file-backed disks",
                domain.name
            )));
        }
        Ok(())
    }

    async fn shutdown_guest(&self, request: &MigrationRequest) -> Result<()> {
        log_info!("Requesting guest shutdown of {}", request.spec.virtual_machine_name);
        match self
            .virsh(&format!("shutdown {}", shell_quote(&request.spec.virtual_machine_name)))
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if already_stopped(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn power_off(&self, request: &MigrationRequest) -> Result<()> {
        log_info!("Powering off {}", request.spec.virtual_machine_name);
        match self
            .virsh(&format!("destroy {}", shell_quote(&request.spec.virtual_machine_name)))
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if already_stopped(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn is_powered_off(&self, request: &MigrationRequest) -> Result<bool> {
        let state = self
            .virsh(&format!("domstate {}", shell_quote(&request.spec.virtual_machine_name)))
            .await?;
        Ok(state.trim() == "shut off")
    }

    async fn export_disks(&self, request: &MigrationRequest) -> Result<Vec<DiskInfo>> {
        let stem = artifact_stem(request)?;
        let domain = self.domain(request).await?;
        let default_bus = self.ctx.default_bus_for(request);
        let scratch = self.ctx.ensure_scratch_dir(&stem).await?;

        let session = self.connect().await?;
        let mut disks = Vec::with_capacity(domain.disks.len());
        let mut outcome = Ok(());
        for (index, disk) in domain.disks.iter().enumerate() {
            if let Some(kept) = kept_disk(request, index) {
                disks.push(kept);
                continue;
            }

            let format = disk.format();
            let downloaded = scratch.join(format!("disk-{}.{}", index, format.as_str()));
            let raw = self.ctx.disk_path(&stem, index);
            log_info!("Copying {}:{} for {}", self.spec.host, disk.source, request.key());

            let exported = async {
                session.download(&disk.source, &downloaded).await?;
                self.ctx.converter.convert(format, &downloaded, &raw).await?;
                if downloaded.exists() {
                    tokio::fs::remove_file(&downloaded).await?;
                }
                file_size(&raw)
            }
            .await;

            match exported {
                Ok(size) => disks.push(DiskInfo::new(
                    disk.target_dev.clone(),
                    size,
                    raw.display().to_string(),
                    disk.bus(default_bus),
                )),
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }
        session.close().await;
        outcome.map(|_| disks)
    }

    async fn synthesize_target_vm(
        &self,
        request: &MigrationRequest,
    ) -> Result<VirtualMachineDefinition> {
        let domain = self.domain(request).await?;
        build_target_vm(
            request,
            &domain.source_vm(),
            &self.ctx.interface_model_for(request),
        )
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
    use crate::migration::ObjectMeta;
    use std::collections::BTreeMap;

    fn client(data: &[(&str, &str)]) -> KvmClient {
        let dir = std::env::temp_dir();
        KvmClient::new(
            KvmSourceSpec {
                host: "kvm01.lab".into(),
                port: 22,
                credentials: crate::source::SecretRef {
                    name: "kvm".into(),
                    namespace: "default".into(),
                },
            },
            Secret {
                metadata: ObjectMeta {
                    name: "kvm".into(),
                    namespace: "default".into(),
                    ..Default::default()
                },
                data: data
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            },
            crate::sources::test_support::context(&dir),
        )
    }

    #[test]
    fn private_key_preferred_over_password() {
        let both = client(&[("username", "root"), ("password", "pw"), ("privateKey", "KEY")]);
        assert!(matches!(both.auth().unwrap(), SshAuth::PrivateKey(_)));

        let password = client(&[("username", "root"), ("password", "pw")]);
        assert!(matches!(password.auth().unwrap(), SshAuth::Password(_)));

        let neither = client(&[("username", "root")]);
        assert!(neither.auth().unwrap_err().is_terminal());
    }

    #[test]
    fn destroy_of_stopped_domain_is_not_an_error() {
        let err = ImportError::RemoteCommand {
            command: "virsh destroy web".into(),
            stderr: "exit status 1: error: Requested operation is not valid: domain is not running"
                .into(),
        };
        assert!(already_stopped(&err));
        assert!(!already_stopped(&ImportError::Source("x".into())));
    }
}
