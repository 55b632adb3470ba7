//! Disk image conversion through `qemu-img`.

use crate::{ImportError, Result, log_debug, log_info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Vmdk,
    Qcow2,
    Raw,
}

impl DiskFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
        }
    }
}

impl FromStr for DiskFormat {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "vmdk" => Ok(DiskFormat::Vmdk),
            "qcow2" => Ok(DiskFormat::Qcow2),
            "raw" | "img" => Ok(DiskFormat::Raw),
            other => Err(ImportError::Conversion(format!(
                "unsupported disk format '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QemuImg {
    binary: PathBuf,
}

impl QemuImg {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Convert `source` to a raw image at `destination`.
    ///
    /// A failed conversion never leaves a partial destination behind.
    pub async fn convert(&self, format: DiskFormat, source: &Path, destination: &Path) -> Result<()> {
        log_info!(
            "Converting {} ({}) to raw image {}",
            source.display(),
            format.as_str(),
            destination.display()
        );

        if format == DiskFormat::Raw {
            tokio::fs::rename(source, destination).await?;
            return Ok(());
        }

        let output = Command::new(&self.binary)
            .arg("convert")
            .args(["-f", format.as_str(), "-O", "raw"])
            .arg(source)
            .arg(destination)
            .output()
            .await
            .map_err(|e| {
                ImportError::Conversion(format!("failed to run {}: {}", self.binary.display(), e))
            })?;

        if !output.status.success() {
            let _ = tokio::fs::remove_file(destination).await;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ImportError::Conversion(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                stderr.trim()
            )));
        }

        log_debug!("Conversion of {} complete", source.display());
        Ok(())
    }
}

impl Default for QemuImg {
    fn default() -> Self {
        Self::new("qemu-img")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn fake_tool(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("qemu-img");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn format_parsing() {
        assert_eq!("QCOW2".parse::<DiskFormat>().unwrap(), DiskFormat::Qcow2);
        assert_eq!("img".parse::<DiskFormat>().unwrap(), DiskFormat::Raw);
        assert!("vhdx".parse::<DiskFormat>().is_err());
    }

    #[tokio::test]
    async fn passes_arguments_to_tool() {
        let dir = TempDir::new().unwrap();
        // convert -f <fmt> -O raw <src> <dst>
        let tool = fake_tool(dir.path(), r#"[ "$3" = "vmdk" ] && cp "$6" "$7""#);
        let src = dir.path().join("disk.vmdk");
        let dst = dir.path().join("disk.img");
        std::fs::write(&src, b"vmdk-bytes").unwrap();

        QemuImg::new(tool)
            .convert(DiskFormat::Vmdk, &src, &dst)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"vmdk-bytes");
    }

    #[tokio::test]
    async fn failure_removes_partial_output() {
        let dir = TempDir::new().unwrap();
        let tool = fake_tool(dir.path(), r#"echo partial > "$7"; echo "bad header" >&2; exit 1"#);
        let src = dir.path().join("disk.qcow2");
        let dst = dir.path().join("disk.img");
        std::fs::write(&src, b"junk").unwrap();

        let err = QemuImg::new(tool)
            .convert(DiskFormat::Qcow2, &src, &dst)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad header"));
        assert!(!dst.exists());
    }

    #[tokio::test]
    async fn raw_input_is_moved() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("disk.raw");
        let dst = dir.path().join("disk.img");
        std::fs::write(&src, b"raw").unwrap();

        QemuImg::new("/nonexistent/qemu-img")
            .convert(DiskFormat::Raw, &src, &dst)
            .await
            .unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dst).unwrap(), b"raw");
    }
}
