//! OpenStack sources: Keystone v3, Nova, Cinder and Glance.
//!
//! Each attached volume is exported as snapshot -> volume -> Glance image,
//! then downloaded and converted. A server without volumes is exported from
//! an image of its root disk. Every intermediate object carries a name
//! derived from the request's artifact stem so later reconciles and cleanup
//! can find it.

use crate::converter::DiskFormat;
use crate::error::ErrorList;
use crate::migration::{DiskBus, DiskInfo, MigrationRequest};
use crate::network::SourceNic;
use crate::source::{OpenstackSourceSpec, Secret, secret_keys};
use crate::sources::download::{self, fetch_to_file};
use crate::sources::{
    ExportContext, SourceVirtualMachine, VirtualMachineOperations, artifact_stem,
    build_target_vm, file_size, kept_disk,
};
use crate::vm::{Firmware, VirtualMachineDefinition};
use crate::{ImportError, Result, log_debug, log_info, log_warn};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::Path;
use tokio::time::Instant;

const TOKEN_HEADER: &str = "X-Auth-Token";
const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";
/// Embedded flavor details and `createImage` returning the image id.
const COMPUTE_MICROVERSION: &str = "2.47";
const VOLUME_SERVICE_TYPES: &[&str] = &["volumev3", "block-storage", "volumev2"];
const DEFAULT_DOMAIN: &str = "Default";

#[derive(Debug, Deserialize)]
struct TokenEnvelope {
    token: Token,
}

#[derive(Debug, Deserialize)]
struct Token {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

#[derive(Debug, Deserialize)]
struct Endpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    region_id: Option<String>,
    url: String,
}

#[derive(Debug, Deserialize)]
struct ServerEnvelope {
    server: Server,
}

#[derive(Debug, Deserialize)]
struct ServerList {
    servers: Vec<Server>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub flavor: Flavor,
    #[serde(default)]
    pub addresses: BTreeMap<String, Vec<ServerAddress>>,
    #[serde(rename = "os-extended-volumes:volumes_attached", default)]
    pub volumes_attached: Vec<AttachedVolume>,
    /// `{"id": ...}` for image-booted servers, an empty string otherwise.
    #[serde(default)]
    pub image: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Flavor {
    #[serde(default)]
    pub vcpus: u32,
    /// MiB.
    #[serde(default)]
    pub ram: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerAddress {
    #[serde(rename = "OS-EXT-IPS-MAC:mac_addr", default)]
    pub mac: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachedVolume {
    pub id: String,
}

impl Server {
    pub fn image_id(&self) -> Option<&str> {
        self.image.get("id").and_then(Value::as_str)
    }

    /// One NIC per distinct MAC; dual-stack ports list the same MAC twice.
    pub fn nics(&self) -> Vec<SourceNic> {
        let mut seen = BTreeSet::new();
        let mut nics = Vec::new();
        for (network, addresses) in &self.addresses {
            for address in addresses {
                let key = (network.clone(), address.mac.clone());
                if seen.insert(key) {
                    nics.push(SourceNic {
                        network_name: network.clone(),
                        mac_address: address.mac.clone(),
                        model: None,
                    });
                }
            }
        }
        nics
    }
}

#[derive(Debug, Deserialize)]
struct VolumeEnvelope {
    volume: Volume,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Volume {
    pub id: String,
    #[serde(default)]
    pub status: String,
    /// GiB.
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub volume_image_metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub attachments: Vec<VolumeAttachment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolumeAttachment {
    #[serde(default)]
    pub device: String,
}

impl Volume {
    fn device(&self) -> &str {
        self.attachments
            .first()
            .map(|a| a.device.as_str())
            .unwrap_or("")
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotEnvelope {
    snapshot: Snapshot,
}

#[derive(Debug, Deserialize)]
struct Snapshot {
    id: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Image {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub disk_format: Option<String>,
    #[serde(default)]
    pub virtual_size: Option<u64>,
    #[serde(flatten)]
    pub properties: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct NamedResource {
    id: String,
}

/// Glance-style hardware hints, from image properties or volume image metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HardwareHints(BTreeMap<String, String>);

impl HardwareHints {
    pub fn from_image(image: &Image) -> Self {
        Self(
            image
                .properties
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect(),
        )
    }

    pub fn firmware(&self) -> Firmware {
        match self.0.get("hw_firmware_type").map(String::as_str) {
            Some("uefi") => Firmware::Uefi {
                secure_boot: self.0.get("os_secure_boot").map(String::as_str) == Some("required"),
            },
            _ => Firmware::Bios,
        }
    }

    pub fn tpm(&self) -> bool {
        self.0.contains_key("hw_tpm_version")
    }

    pub fn disk_bus(&self) -> Option<DiskBus> {
        self.0.get("hw_disk_bus").and_then(|b| b.parse().ok())
    }
}

/// Deterministic names of the intermediate objects for disk `index`.
pub fn artifact_names(stem: &str, index: usize) -> (String, String, String) {
    (
        format!("{}-snapshot-{}", stem, index),
        format!("{}-volume-{}", stem, index),
        format!("{}-image-{}", stem, index),
    )
}

struct Session {
    token: String,
    compute: String,
    volume: String,
    image: String,
}

pub struct OpenstackClient {
    spec: OpenstackSourceSpec,
    username: String,
    password: String,
    project: String,
    domain: String,
    http: Client,
    ctx: ExportContext,
}

impl OpenstackClient {
    pub fn new(spec: OpenstackSourceSpec, secret: Secret, ctx: ExportContext) -> Result<Self> {
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
            project: secret.require(secret_keys::PROJECT_NAME)?.to_string(),
            domain: secret
                .get(secret_keys::DOMAIN_NAME)
                .unwrap_or(DEFAULT_DOMAIN)
                .to_string(),
            spec,
            http,
            ctx,
        })
    }

    fn auth_body(&self) -> Value {
        json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.username,
                            "domain": {"name": self.domain},
                            "password": self.password
                        }
                    }
                },
                "scope": {
                    "project": {"name": self.project, "domain": {"name": self.domain}}
                }
            }
        })
    }

    async fn authenticate(&self) -> Result<Session> {
        let url = format!("{}/auth/tokens", self.spec.endpoint.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&self.auth_body())
            .timeout(self.ctx.http_timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ImportError::Source(format!("Keystone authentication returned {}", status)));
        }
        let token = response
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ImportError::Source("Keystone response has no token".to_string()))?;
        let body: TokenEnvelope = response.json().await?;

        Ok(Session {
            token,
            compute: self.endpoint_for(&body.token.catalog, &["compute"])?,
            volume: self.endpoint_for(&body.token.catalog, VOLUME_SERVICE_TYPES)?,
            image: self.endpoint_for(&body.token.catalog, &["image"])?,
        })
    }

    fn endpoint_for(&self, catalog: &[CatalogEntry], service_types: &[&str]) -> Result<String> {
        service_types
            .iter()
            .filter_map(|kind| catalog.iter().find(|entry| entry.service_type == *kind))
            .flat_map(|entry| entry.endpoints.iter())
            .find(|endpoint| {
                endpoint.interface == "public"
                    && (endpoint.region.as_deref() == Some(self.spec.region.as_str())
                        || endpoint.region_id.as_deref() == Some(self.spec.region.as_str()))
            })
            .map(|endpoint| endpoint.url.trim_end_matches('/').to_string())
            .ok_or_else(|| {
                ImportError::Source(format!(
                    "no public {} endpoint in region {}",
                    service_types[0], self.spec.region
                ))
            })
    }

    /// API call bounded by the HTTP timeout as a whole.
    fn request(&self, session: &Session, method: Method, url: String) -> RequestBuilder {
        self.transfer(session, method, url)
            .timeout(self.ctx.http_timeout)
    }

    /// Bulk transfer; only connecting and idle reads are bounded.
    fn transfer(&self, session: &Session, method: Method, url: String) -> RequestBuilder {
        self.http
            .request(method, url)
            .header(TOKEN_HEADER, &session.token)
            .header("OpenStack-API-Version", format!("compute {}", COMPUTE_MICROVERSION))
            .header("X-OpenStack-Nova-API-Version", COMPUTE_MICROVERSION)
    }

    async fn send_json<T: DeserializeOwned>(request: RequestBuilder, what: &str) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ImportError::not_found("OpenStack resource", what));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ImportError::Source(format!("{} returned {}: {}", what, status, body)));
        }
        Ok(response.json().await?)
    }

    async fn send(request: RequestBuilder, what: &str) -> Result<StatusCode> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND || status == StatusCode::CONFLICT {
            return Ok(status);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ImportError::Source(format!("{} returned {}: {}", what, status, body)))
    }

    async fn find_server(&self, session: &Session, name: &str) -> Result<Server> {
        let list: ServerList = Self::send_json(
            self.request(session, Method::GET, format!("{}/servers/detail", session.compute))
                .query(&[("name", name)]),
            "server list",
        )
        .await?;
        let mut matches: Vec<Server> = list
            .servers
            .into_iter()
            .filter(|s| s.name == name || s.id == name)
            .collect();
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => {
                let found: ServerEnvelope = Self::send_json(
                    self.request(session, Method::GET, format!("{}/servers/{}", session.compute, name)),
                    name,
                )
                .await?;
                Ok(found.server)
            }
            n => Err(ImportError::Validation(format!(
                "'{}' matches {} servers",
                name, n
            ))),
        }
    }

    /// Attached volumes in device order, so the boot disk comes first.
    async fn volumes(&self, session: &Session, server: &Server) -> Result<Vec<Volume>> {
        let mut volumes = Vec::with_capacity(server.volumes_attached.len());
        for attached in &server.volumes_attached {
            let found: VolumeEnvelope = Self::send_json(
                self.request(session, Method::GET, format!("{}/volumes/{}", session.volume, attached.id)),
                &attached.id,
            )
            .await?;
            volumes.push(found.volume);
        }
        volumes.sort_by(|a, b| a.device().cmp(b.device()));
        Ok(volumes)
    }

    async fn image(&self, session: &Session, id: &str) -> Result<Image> {
        Self::send_json(
            self.request(session, Method::GET, format!("{}/v2/images/{}", session.image, id)),
            id,
        )
        .await
    }

    async fn hints(&self, session: &Session, server: &Server, volumes: &[Volume]) -> Result<HardwareHints> {
        if let Some(boot) = volumes.first() {
            return Ok(HardwareHints(boot.volume_image_metadata.clone()));
        }
        match server.image_id() {
            Some(id) => Ok(HardwareHints::from_image(&self.image(session, id).await?)),
            None => Ok(HardwareHints::default()),
        }
    }

    /// Id of the object called `name` in a Cinder or Glance listing.
    async fn find_named(&self, session: &Session, url: String, key: &str, name: &str) -> Result<Option<String>> {
        let listing: BTreeMap<String, Value> = Self::send_json(
            self.request(session, Method::GET, url).query(&[("name", name)]),
            name,
        )
        .await?;
        let Some(items) = listing.get(key) else {
            return Ok(None);
        };
        let items: Vec<NamedResource> = serde_json::from_value(items.clone())?;
        Ok(items.into_iter().next().map(|item| item.id))
    }

    async fn wait_for_status<F, Fut>(&self, what: &str, mut fetch: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let deadline = Instant::now() + self.ctx.upload_timeout;
        loop {
            let status = fetch().await?.to_ascii_lowercase();
            match status.as_str() {
                "available" | "active" => return Ok(()),
                "error" | "killed" | "deleted" | "error_deleting" => {
                    return Err(ImportError::Source(format!("{} entered status {}", what, status)));
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(ImportError::Source(format!(
                    "timed out waiting for {} (last status {})",
                    what, status
                )));
            }
            tokio::time::sleep(self.ctx.poll_interval).await;
        }
    }

    async fn wait_for_image(&self, session: &Session, id: &str) -> Result<Image> {
        self.wait_for_status(&format!("image {}", id), move || async move {
            Ok::<_, ImportError>(self.image(session, id).await?.status)
        })
        .await?;
        self.image(session, id).await
    }

    async fn snapshot(&self, session: &Session, volume: &Volume, name: &str) -> Result<String> {
        let url = format!("{}/snapshots", session.volume);
        let id = match self.find_named(session, url.clone(), "snapshots", name).await? {
            Some(id) => id,
            None => {
                log_info!("Creating snapshot {} of volume {}", name, volume.id);
                let created: SnapshotEnvelope = Self::send_json(
                    self.request(session, Method::POST, url).json(&json!({
                        "snapshot": {"volume_id": volume.id, "force": true, "name": name}
                    })),
                    name,
                )
                .await?;
                created.snapshot.id
            }
        };
        let snapshot_id = id.as_str();
        self.wait_for_status(&format!("snapshot {}", name), move || async move {
            let found: SnapshotEnvelope = Self::send_json(
                self.request(
                    session,
                    Method::GET,
                    format!("{}/snapshots/{}", session.volume, snapshot_id),
                ),
                name,
            )
            .await?;
            Ok::<_, ImportError>(found.snapshot.status)
        })
        .await?;
        Ok(id)
    }

    async fn volume_from_snapshot(
        &self,
        session: &Session,
        snapshot_id: &str,
        size: u64,
        name: &str,
    ) -> Result<String> {
        let url = format!("{}/volumes", session.volume);
        let id = match self.find_named(session, url.clone(), "volumes", name).await? {
            Some(id) => id,
            None => {
                log_info!("Creating volume {} from snapshot {}", name, snapshot_id);
                let created: VolumeEnvelope = Self::send_json(
                    self.request(session, Method::POST, url).json(&json!({
                        "volume": {"snapshot_id": snapshot_id, "size": size, "name": name}
                    })),
                    name,
                )
                .await?;
                created.volume.id
            }
        };
        let volume_id = id.as_str();
        self.wait_for_status(&format!("volume {}", name), move || async move {
            let found: VolumeEnvelope = Self::send_json(
                self.request(session, Method::GET, format!("{}/volumes/{}", session.volume, volume_id)),
                name,
            )
            .await?;
            Ok::<_, ImportError>(found.volume.status)
        })
        .await?;
        Ok(id)
    }

    async fn upload_volume(&self, session: &Session, volume_id: &str, name: &str) -> Result<Image> {
        let existing = self
            .find_named(session, format!("{}/v2/images", session.image), "images", name)
            .await?;
        let id = match existing {
            Some(id) => id,
            None => {
                log_info!("Uploading volume {} to image {}", volume_id, name);
                let uploaded: BTreeMap<String, Value> = Self::send_json(
                    self.request(
                        session,
                        Method::POST,
                        format!("{}/volumes/{}/action", session.volume, volume_id),
                    )
                    .json(&json!({
                        "os-volume_upload_image": {
                            "image_name": name,
                            "disk_format": "qcow2",
                            "container_format": "bare",
                            "force": true
                        }
                    })),
                    name,
                )
                .await?;
                uploaded
                    .get("os-volume_upload_image")
                    .and_then(|u| u.get("image_id"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| ImportError::Source(format!("upload of {} returned no image id", name)))?
            }
        };
        self.wait_for_image(session, &id).await
    }

    async fn server_image(&self, session: &Session, server: &Server, name: &str) -> Result<Image> {
        let existing = self
            .find_named(session, format!("{}/v2/images", session.image), "images", name)
            .await?;
        let id = match existing {
            Some(id) => id,
            None => {
                log_info!("Creating image {} of server {}", name, server.id);
                let created: BTreeMap<String, Value> = Self::send_json(
                    self.request(
                        session,
                        Method::POST,
                        format!("{}/servers/{}/action", session.compute, server.id),
                    )
                    .json(&json!({"createImage": {"name": name}})),
                    name,
                )
                .await?;
                created
                    .get("image_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| ImportError::Source(format!("createImage {} returned no id", name)))?
            }
        };
        self.wait_for_image(session, &id).await
    }

    async fn download_image(&self, session: &Session, image: &Image, destination: &Path) -> Result<DiskFormat> {
        let format = image
            .disk_format
            .as_deref()
            .unwrap_or("qcow2")
            .parse::<DiskFormat>()?;
        fetch_to_file(
            self.transfer(
                session,
                Method::GET,
                format!("{}/v2/images/{}/file", session.image, image.id),
            ),
            destination,
        )
        .await?;
        Ok(format)
    }

    async fn delete_named(
        &self,
        session: &Session,
        base: &str,
        key: &str,
        name: &str,
        errors: &mut ErrorList,
    ) -> Option<String> {
        match self.find_named(session, base.to_string(), key, name).await {
            Ok(Some(id)) => {
                log_debug!("Deleting {} {}", key, name);
                let url = format!("{}/{}", base, id);
                errors.record(
                    &format!("delete {}", name),
                    Self::send(self.request(session, Method::DELETE, url), name).await,
                );
                Some(id)
            }
            Ok(None) => None,
            Err(err) => {
                errors.push(&format!("look up {}", name), err);
                None
            }
        }
    }

    async fn wait_volume_gone(&self, session: &Session, id: &str) {
        let deadline = Instant::now() + self.ctx.upload_timeout;
        while Instant::now() < deadline {
            let request =
                self.request(session, Method::GET, format!("{}/volumes/{}", session.volume, id));
            if Self::send_json::<VolumeEnvelope>(request, id).await.is_err() {
                return;
            }
            tokio::time::sleep(self.ctx.poll_interval).await;
        }
    }
}

#[async_trait]
impl VirtualMachineOperations for OpenstackClient {
    async fn verify_connectivity(&self) -> Result<()> {
        self.authenticate().await.map(|_| ())
    }

    async fn pre_flight_checks(&self, request: &MigrationRequest) -> Result<()> {
        let session = self.authenticate().await?;
        let server = self.find_server(&session, &request.spec.virtual_machine_name).await?;
        if server.volumes_attached.is_empty() && server.image_id().is_none() {
            return Err(ImportError::Validation(format!(
                "server '{}' has neither volumes nor an image",
                server.name
            )));
        }
        Ok(())
    }

    async fn shutdown_guest(&self, request: &MigrationRequest) -> Result<()> {
        self.power_off(request).await
    }

    async fn power_off(&self, request: &MigrationRequest) -> Result<()> {
        let session = self.authenticate().await?;
        let server = self.find_server(&session, &request.spec.virtual_machine_name).await?;
        if server.status == "SHUTOFF" {
            return Ok(());
        }
        log_info!("Stopping server {}", server.id);
        let status = Self::send(
            self.request(
                &session,
                Method::POST,
                format!("{}/servers/{}/action", session.compute, server.id),
            )
            .json(&json!({"os-stop": null})),
            &server.name,
        )
        .await?;
        if status == StatusCode::CONFLICT {
            log_debug!("Server {} is already stopping", server.id);
        }
        Ok(())
    }

    async fn is_powered_off(&self, request: &MigrationRequest) -> Result<bool> {
        let session = self.authenticate().await?;
        let server = self.find_server(&session, &request.spec.virtual_machine_name).await?;
        Ok(server.status == "SHUTOFF")
    }

    async fn export_disks(&self, request: &MigrationRequest) -> Result<Vec<DiskInfo>> {
        let stem = artifact_stem(request)?;
        let session = self.authenticate().await?;
        let server = self.find_server(&session, &request.spec.virtual_machine_name).await?;
        let volumes = self.volumes(&session, &server).await?;
        let hints = self.hints(&session, &server, &volumes).await?;
        let bus = hints
            .disk_bus()
            .unwrap_or_else(|| self.ctx.default_bus_for(request));
        let scratch = self.ctx.ensure_scratch_dir(&stem).await?;

        let disk_count = volumes.len().max(1);
        let mut disks = Vec::with_capacity(disk_count);
        for index in 0..disk_count {
            if let Some(kept) = kept_disk(request, index) {
                disks.push(kept);
                continue;
            }
            let (snapshot_name, volume_name, image_name) = artifact_names(&stem, index);

            let (image, name) = match volumes.get(index) {
                Some(volume) => {
                    let snapshot = self.snapshot(&session, volume, &snapshot_name).await?;
                    let copy = self
                        .volume_from_snapshot(&session, &snapshot, volume.size, &volume_name)
                        .await?;
                    (self.upload_volume(&session, &copy, &image_name).await?, volume.id.clone())
                }
                None => (
                    self.server_image(&session, &server, &image_name).await?,
                    server.id.clone(),
                ),
            };

            let downloaded = scratch.join(format!("disk-{}.download", index));
            let format = self.download_image(&session, &image, &downloaded).await?;
            let raw = self.ctx.disk_path(&stem, index);
            self.ctx.converter.convert(format, &downloaded, &raw).await?;
            if downloaded.exists() {
                tokio::fs::remove_file(&downloaded).await?;
            }

            let size = match volumes.get(index) {
                Some(volume) => volume.size << 30,
                None => match image.virtual_size {
                    Some(size) => size,
                    None => file_size(&raw)?,
                },
            };
            disks.push(DiskInfo::new(name, size, raw.display().to_string(), bus));
        }
        Ok(disks)
    }

    async fn synthesize_target_vm(
        &self,
        request: &MigrationRequest,
    ) -> Result<VirtualMachineDefinition> {
        let session = self.authenticate().await?;
        let server = self.find_server(&session, &request.spec.virtual_machine_name).await?;
        let volumes = self.volumes(&session, &server).await?;
        let hints = self.hints(&session, &server, &volumes).await?;

        let source = SourceVirtualMachine {
            cpu_cores: server.flavor.vcpus,
            memory_bytes: server.flavor.ram << 20,
            firmware: hints.firmware(),
            tpm: hints.tpm(),
            nics: server.nics(),
        };
        build_target_vm(request, &source, &self.ctx.interface_model_for(request))
    }

    async fn cleanup(&self, request: &MigrationRequest) -> Result<()> {
        let stem = artifact_stem(request)?;
        let mut errors = ErrorList::new();

        match self.authenticate().await {
            Ok(session) => {
                let attached = match self
                    .find_server(&session, &request.spec.virtual_machine_name)
                    .await
                {
                    Ok(server) => server.volumes_attached.len(),
                    Err(err) => {
                        log_warn!("Cannot inspect source server during cleanup: {}", err);
                        0
                    }
                };
                let count = attached.max(request.status.disk_info.len()).max(1);
                let images = format!("{}/v2/images", session.image);
                let volumes = format!("{}/volumes", session.volume);
                let snapshots = format!("{}/snapshots", session.volume);

                for index in 0..count {
                    let (snapshot_name, volume_name, image_name) = artifact_names(&stem, index);
                    self.delete_named(&session, &images, "images", &image_name, &mut errors)
                        .await;
                    if let Some(id) = self
                        .delete_named(&session, &volumes, "volumes", &volume_name, &mut errors)
                        .await
                    {
                        self.wait_volume_gone(&session, &id).await;
                    }
                    self.delete_named(&session, &snapshots, "snapshots", &snapshot_name, &mut errors)
                        .await;
                }
            }
            Err(err) => errors.push("authenticate for cleanup", err),
        }

        self.ctx.remove_local_artifacts(&stem, &mut errors).await;
        errors.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_names_are_deterministic() {
        assert_eq!(
            artifact_names("tenant_import-web_web-01", 1),
            (
                "tenant_import-web_web-01-snapshot-1".to_string(),
                "tenant_import-web_web-01-volume-1".to_string(),
                "tenant_import-web_web-01-image-1".to_string()
            )
        );
    }

    #[test]
    fn hardware_hints() {
        let hints = HardwareHints(BTreeMap::from([
            ("hw_firmware_type".to_string(), "uefi".to_string()),
            ("os_secure_boot".to_string(), "required".to_string()),
            ("hw_disk_bus".to_string(), "scsi".to_string()),
        ]));
        assert_eq!(hints.firmware(), Firmware::Uefi { secure_boot: true });
        assert_eq!(hints.disk_bus(), Some(DiskBus::Scsi));
        assert!(!hints.tpm());

        let empty = HardwareHints::default();
        assert_eq!(empty.firmware(), Firmware::Bios);
        assert_eq!(empty.disk_bus(), None);
    }

    #[test]
    fn image_properties_become_hints() {
        let image: Image = serde_json::from_value(json!({
            "id": "img-1",
            "status": "active",
            "disk_format": "raw",
            "hw_firmware_type": "uefi",
            "hw_tpm_version": "2.0",
            "min_ram": 0
        }))
        .unwrap();
        let hints = HardwareHints::from_image(&image);
        assert_eq!(hints.firmware(), Firmware::Uefi { secure_boot: false });
        assert!(hints.tpm());
    }

    #[test]
    fn server_parsing_and_nics() {
        let server: Server = serde_json::from_value(json!({
            "id": "a1b2",
            "name": "web-01",
            "status": "ACTIVE",
            "flavor": {"vcpus": 2, "ram": 4096, "original_name": "m1.medium"},
            "image": "",
            "addresses": {
                "private": [
                    {"addr": "10.0.0.5", "OS-EXT-IPS-MAC:mac_addr": "fa:16:3e:00:00:01"},
                    {"addr": "fd00::5", "OS-EXT-IPS-MAC:mac_addr": "fa:16:3e:00:00:01"}
                ],
                "storage": [
                    {"addr": "10.1.0.5", "OS-EXT-IPS-MAC:mac_addr": "fa:16:3e:00:00:02"}
                ]
            },
            "os-extended-volumes:volumes_attached": [{"id": "vol-1"}]
        }))
        .unwrap();

        assert_eq!(server.image_id(), None);
        assert_eq!(server.flavor.ram << 20, 4 << 30);
        let nics = server.nics();
        assert_eq!(nics.len(), 2);
        assert_eq!(nics[0].network_name, "private");
        assert_eq!(nics[1].mac_address.as_deref(), Some("fa:16:3e:00:00:02"));
    }

    #[test]
    fn volumes_sort_by_device() {
        let volume = |id: &str, device: &str| Volume {
            id: id.into(),
            status: "in-use".into(),
            size: 10,
            volume_image_metadata: BTreeMap::new(),
            attachments: vec![VolumeAttachment {
                device: device.into(),
            }],
        };
        let mut volumes = vec![volume("data", "/dev/vdb"), volume("root", "/dev/vda")];
        volumes.sort_by(|a, b| a.device().cmp(b.device()));
        assert_eq!(volumes[0].id, "root");
    }
}
