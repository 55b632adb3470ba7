use crate::{ImportError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Directory holding in-flight downloads and converted images.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    #[serde(default)]
    pub image_server: ImageServerConfig,
    #[serde(default = "default_qemu_img_path")]
    pub qemu_img_path: PathBuf,
    /// Number of migration requests reconciled in parallel.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub requeue: RequeueConfig,
    #[serde(default = "default_interface_model")]
    pub default_interface_model: String,
    #[serde(default = "default_disk_bus")]
    pub default_disk_bus: String,
    #[serde(default = "default_graceful_shutdown_timeout_seconds")]
    pub graceful_shutdown_timeout_seconds: u64,
    /// Upper bound on re-export cycles after failed image imports. Unset means unlimited.
    #[serde(default)]
    pub max_reexport_attempts: Option<u32>,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default)]
    pub openstack: OpenstackTuning,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageServerConfig {
    #[serde(default = "default_image_server_host")]
    pub host: String,
    #[serde(default = "default_image_server_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequeueConfig {
    #[serde(default = "default_requeue_short_seconds")]
    pub short_seconds: u64,
    #[serde(default = "default_requeue_long_seconds")]
    pub long_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenstackTuning {
    #[serde(default = "default_openstack_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_openstack_upload_timeout_seconds")]
    pub upload_timeout_seconds: u64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            working_dir: default_working_dir(),
            image_server: ImageServerConfig::default(),
            qemu_img_path: default_qemu_img_path(),
            concurrency: default_concurrency(),
            requeue: RequeueConfig::default(),
            default_interface_model: default_interface_model(),
            default_disk_bus: default_disk_bus(),
            graceful_shutdown_timeout_seconds: default_graceful_shutdown_timeout_seconds(),
            max_reexport_attempts: None,
            http_timeout_seconds: default_http_timeout_seconds(),
            openstack: OpenstackTuning::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ImageServerConfig {
    fn default() -> Self {
        Self {
            host: default_image_server_host(),
            port: default_image_server_port(),
        }
    }
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            short_seconds: default_requeue_short_seconds(),
            long_seconds: default_requeue_long_seconds(),
        }
    }
}

impl Default for OpenstackTuning {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_openstack_poll_interval_seconds(),
            upload_timeout_seconds: default_openstack_upload_timeout_seconds(),
        }
    }
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("/var/lib/vm-import")
}

fn default_qemu_img_path() -> PathBuf {
    PathBuf::from("qemu-img")
}

fn default_concurrency() -> usize {
    5
}

fn default_interface_model() -> String {
    "virtio".to_string()
}

fn default_disk_bus() -> String {
    "virtio".to_string()
}

fn default_graceful_shutdown_timeout_seconds() -> u64 {
    60
}

fn default_http_timeout_seconds() -> u64 {
    600
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_image_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_image_server_port() -> u16 {
    8080
}

fn default_requeue_short_seconds() -> u64 {
    5
}

fn default_requeue_long_seconds() -> u64 {
    300
}

fn default_openstack_poll_interval_seconds() -> u64 {
    5
}

fn default_openstack_upload_timeout_seconds() -> u64 {
    3600
}

impl RequeueConfig {
    pub fn short(&self) -> Duration {
        Duration::from_secs(self.short_seconds)
    }

    pub fn long(&self) -> Duration {
        Duration::from_secs(self.long_seconds)
    }
}

impl ImageServerConfig {
    /// URL under which the image server exposes `file_name` from the working directory.
    pub fn url_for(&self, file_name: &str) -> String {
        format!("http://{}:{}/{}", self.host, self.port, file_name)
    }
}

impl ImportConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        let config: ImportConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ImportError::ConfigError(e.to_string()))?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// `$XDG_CONFIG_HOME/vm-import/config.toml`, falling back to the working directory.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("vm-import").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("vm-import.toml"))
    }

    /// Load `path` if it exists, otherwise the built-in defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(ImportError::ConfigError(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.working_dir.as_os_str().is_empty() {
            return Err(ImportError::ConfigError(
                "working_dir cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}
