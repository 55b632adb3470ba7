//! OVA appliances fetched over HTTP(S) or from a local path.
//!
//! There is no running VM behind an OVA, so power control is a no-op and
//! every disk comes out of the downloaded archive.

pub mod archive;
pub mod envelope;

use crate::converter::DiskFormat;
use crate::error::ErrorList;
use crate::migration::{DiskInfo, MigrationRequest};
use crate::source::{OvaSourceSpec, Secret, secret_keys};
use crate::sources::download::{self, Location};
use crate::sources::{
    ExportContext, VirtualMachineOperations, artifact_stem, build_target_vm, kept_disk,
};
use crate::vm::VirtualMachineDefinition;
use crate::{ImportError, Result, log_info, log_warn};
use archive::{Descriptors, Manifest};
use async_trait::async_trait;
use envelope::{DiskLayout, Envelope};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub struct OvaClient {
    location: Location,
    credentials: Option<(String, String)>,
    http: Client,
    timeout: Duration,
    ctx: ExportContext,
}

impl OvaClient {
    pub fn new(spec: OvaSourceSpec, secret: Option<Secret>, ctx: ExportContext) -> Result<Self> {
        let timeout = spec
            .http_timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(ctx.http_timeout);
        let credentials = match secret {
            Some(secret) => Some((
                secret.require(secret_keys::USERNAME)?.to_string(),
                secret.require(secret_keys::PASSWORD)?.to_string(),
            )),
            None => None,
        };
        Ok(Self {
            location: Location::parse(&spec.url)?,
            credentials,
            http: download::http_client(timeout)?,
            timeout,
            ctx,
        })
    }

    fn archive_path(&self, stem: &str) -> PathBuf {
        self.ctx.working_dir.join(format!("{}.ova", stem))
    }

    fn envelope_path(&self, stem: &str) -> PathBuf {
        self.ctx.working_dir.join(format!("{}.ovf", stem))
    }

    fn basic_auth(&self) -> Option<(&str, &str)> {
        self.credentials
            .as_ref()
            .map(|(user, password)| (user.as_str(), password.as_str()))
    }

    /// Download the archive once per request; a completed download is reused.
    async fn fetch_archive(&self, stem: &str) -> Result<PathBuf> {
        let path = self.archive_path(stem);
        if path.exists() {
            return Ok(path);
        }
        tokio::fs::create_dir_all(&self.ctx.working_dir).await?;
        download::fetch_location(&self.http, &self.location, self.basic_auth(), &path).await?;
        Ok(path)
    }

    async fn descriptors(archive_path: PathBuf) -> Result<Descriptors> {
        blocking(move || archive::read_descriptors(&archive_path)).await
    }

    async fn load_envelope(&self, stem: &str) -> Result<Envelope> {
        let saved = self.envelope_path(stem);
        if saved.exists() {
            return envelope::parse(&tokio::fs::read_to_string(&saved).await?);
        }
        let archive_path = self.fetch_archive(stem).await?;
        let descriptors = Self::descriptors(archive_path).await?;
        tokio::fs::write(&saved, &descriptors.ovf).await?;
        envelope::parse(&descriptors.ovf)
    }
}

async fn blocking<T, F>(task: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| ImportError::Transfer(format!("archive task failed: {}", e)))?
}

fn disk_format(disk: &DiskLayout) -> DiskFormat {
    if disk
        .format_hint
        .as_deref()
        .is_some_and(|f| f.to_ascii_lowercase().contains("vmdk"))
    {
        return DiskFormat::Vmdk;
    }
    Path::new(&disk.file.href)
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| ext.parse().ok())
        .unwrap_or(DiskFormat::Vmdk)
}

/// Check the descriptor itself against the manifest, when listed.
fn verify_descriptor(descriptors: &Descriptors, manifest: Option<&Manifest>) -> Result<()> {
    let Some(entry) = manifest.and_then(|m| m.get(&descriptors.ovf_name)) else {
        return Ok(());
    };
    entry.verify(&archive::digest_of(entry.algorithm, descriptors.ovf.as_bytes()))
}

#[async_trait]
impl VirtualMachineOperations for OvaClient {
    async fn verify_connectivity(&self) -> Result<()> {
        match &self.location {
            Location::Local(path) => {
                if path.is_file() {
                    Ok(())
                } else {
                    Err(ImportError::Source(format!("{} does not exist", path.display())))
                }
            }
            Location::Remote(url) => {
                let mut request = self.http.head(url).timeout(self.timeout);
                if let Some((user, password)) = self.basic_auth() {
                    request = request.basic_auth(user, Some(password));
                }
                let response = request.send().await?;
                let status = response.status();
                if status.is_success() || status == reqwest::StatusCode::METHOD_NOT_ALLOWED {
                    Ok(())
                } else {
                    Err(ImportError::Source(format!("{} returned {}", url, status)))
                }
            }
        }
    }

    async fn pre_flight_checks(&self, _request: &MigrationRequest) -> Result<()> {
        self.verify_connectivity().await?;
        // Local archives are cheap to inspect up front.
        if let Location::Local(path) = &self.location {
            let descriptors = Self::descriptors(path.clone()).await?;
            let envelope = envelope::parse(&descriptors.ovf)?;
            if envelope.disk_layout(self.ctx.default_disk_bus)?.is_empty() {
                return Err(ImportError::Validation(format!(
                    "{} describes no disks",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    fn is_power_off_supported(&self) -> bool {
        false
    }

    async fn shutdown_guest(&self, _request: &MigrationRequest) -> Result<()> {
        Ok(())
    }

    async fn power_off(&self, _request: &MigrationRequest) -> Result<()> {
        Ok(())
    }

    async fn is_powered_off(&self, _request: &MigrationRequest) -> Result<bool> {
        Ok(true)
    }

    async fn export_disks(&self, request: &MigrationRequest) -> Result<Vec<DiskInfo>> {
        let stem = artifact_stem(request)?;
        let archive_path = self.fetch_archive(&stem).await?;
        let descriptors = Self::descriptors(archive_path.clone()).await?;

        let manifest = descriptors.manifest.as_deref().map(Manifest::parse).transpose()?;
        if manifest.is_none() {
            log_warn!("{} has no manifest; disk checksums are not verified", archive_path.display());
        }
        verify_descriptor(&descriptors, manifest.as_ref())?;
        tokio::fs::write(self.envelope_path(&stem), &descriptors.ovf).await?;

        let envelope = envelope::parse(&descriptors.ovf)?;
        let layout = envelope.disk_layout(self.ctx.default_bus_for(request))?;
        if layout.is_empty() {
            return Err(ImportError::Envelope(format!(
                "{} describes no disks",
                descriptors.ovf_name
            )));
        }

        let scratch = self.ctx.ensure_scratch_dir(&stem).await?;
        let mut disks = Vec::with_capacity(layout.len());
        for (index, disk) in layout.iter().enumerate() {
            if let Some(kept) = kept_disk(request, index) {
                disks.push(kept);
                continue;
            }

            let format = disk_format(disk);
            let extracted = scratch.join(format!("disk-{}.{}", index, format.as_str()));
            let expected = manifest.as_ref().and_then(|m| m.get(&disk.file.href)).cloned();
            if manifest.is_some() && expected.is_none() {
                log_warn!("Manifest has no entry for {}", disk.file.href);
            }

            log_info!("Extracting {} from {}", disk.file.href, archive_path.display());
            let (archive_copy, member, destination) =
                (archive_path.clone(), disk.file.href.clone(), extracted.clone());
            blocking(move || {
                archive::extract_verified(&archive_copy, &member, &destination, expected.as_ref())
            })
            .await?;

            let raw = self.ctx.disk_path(&stem, index);
            self.ctx.converter.convert(format, &extracted, &raw).await?;
            if extracted.exists() {
                tokio::fs::remove_file(&extracted).await?;
            }

            disks.push(DiskInfo::new(
                disk.file.href.clone(),
                disk.capacity_bytes,
                raw.display().to_string(),
                disk.bus,
            ));
        }
        Ok(disks)
    }

    async fn synthesize_target_vm(
        &self,
        request: &MigrationRequest,
    ) -> Result<VirtualMachineDefinition> {
        let stem = artifact_stem(request)?;
        let envelope = self.load_envelope(&stem).await?;
        build_target_vm(
            request,
            &envelope.source_vm()?,
            &self.ctx.interface_model_for(request),
        )
    }

    async fn cleanup(&self, request: &MigrationRequest) -> Result<()> {
        let stem = artifact_stem(request)?;
        let mut errors = ErrorList::new();
        for path in [self.archive_path(&stem), self.envelope_path(&stem)] {
            if path.exists() {
                errors.record(
                    &format!("remove {}", path.display()),
                    tokio::fs::remove_file(&path).await,
                );
            }
        }
        self.ctx.remove_local_artifacts(&stem, &mut errors).await;
        errors.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::test_support::{context, request};
    use std::fs::File;
    use tempfile::TempDir;

    fn client(url: &str, working_dir: &Path) -> OvaClient {
        let spec = OvaSourceSpec {
            url: url.to_string(),
            http_timeout_seconds: Some(5),
            credentials: None,
        };
        OvaClient::new(spec, None, context(working_dir)).unwrap()
    }

    fn build_ova(path: &Path, members: &[(&str, &[u8])]) {
        let mut builder = tar::Builder::new(File::create(path).unwrap());
        for (name, data) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn format_detection() {
        let layout = |href: &str, hint: Option<&str>| DiskLayout {
            file: envelope::FileReference {
                id: "f".into(),
                href: href.into(),
                size: None,
            },
            capacity_bytes: 1,
            bus: crate::migration::DiskBus::Virtio,
            format_hint: hint.map(str::to_string),
        };
        assert_eq!(disk_format(&layout("a.bin", Some("http://x/vmdk.html#streamOptimized"))), DiskFormat::Vmdk);
        assert_eq!(disk_format(&layout("a.qcow2", None)), DiskFormat::Qcow2);
        assert_eq!(disk_format(&layout("a.img", None)), DiskFormat::Raw);
        assert_eq!(disk_format(&layout("a", None)), DiskFormat::Vmdk);
    }

    #[tokio::test]
    async fn power_control_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let client = client("/srv/web.ova", dir.path());
        let request = request("web", Vec::new());
        assert!(!client.is_power_off_supported());
        client.shutdown_guest(&request).await.unwrap();
        assert!(client.is_powered_off(&request).await.unwrap());
    }

    #[tokio::test]
    async fn missing_local_archive_fails_connectivity() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir.path().join("none.ova").display().to_string(), dir.path());
        assert!(client.verify_connectivity().await.is_err());
    }

    #[tokio::test]
    async fn tampered_descriptor_is_rejected() {
        let dir = TempDir::new().unwrap();
        let ova = dir.path().join("web.ova");
        let manifest = format!("SHA256(web.ovf)= {}\n", "0".repeat(64));
        build_ova(
            &ova,
            &[("web.ovf", envelope::fixtures::WEB_OVF.as_bytes()), ("web.mf", manifest.as_bytes())],
        );
        let work = dir.path().join("work");
        let client = client(&ova.display().to_string(), &work);

        let err = client.export_disks(&request("web", Vec::new())).await.unwrap_err();
        assert!(matches!(err, ImportError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn requests_for_the_same_appliance_download_separately() {
        let dir = TempDir::new().unwrap();
        let ova = dir.path().join("web.ova");
        build_ova(&ova, &[("web.ovf", envelope::fixtures::WEB_OVF.as_bytes())]);
        let work = dir.path().join("work");
        let client = client(&ova.display().to_string(), &work);

        let first = request("web", Vec::new());
        let mut second = request("web", Vec::new());
        second.metadata.namespace = "other".into();
        let first_stem = artifact_stem(&first).unwrap();
        let second_stem = artifact_stem(&second).unwrap();

        let first_archive = client.fetch_archive(&first_stem).await.unwrap();
        let second_archive = client.fetch_archive(&second_stem).await.unwrap();
        assert_ne!(first_archive, second_archive);

        client.cleanup(&first).await.unwrap();
        assert!(!first_archive.exists());
        assert!(second_archive.exists());
    }
}
