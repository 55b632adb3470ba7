//! OVA archive access: manifest parsing and checksum-gated extraction.

use crate::{ImportError, Result, log_debug};
use sha2::Digest;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;

const COPY_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl FromStr for DigestAlgorithm {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SHA1" => Ok(DigestAlgorithm::Sha1),
            "SHA256" => Ok(DigestAlgorithm::Sha256),
            "SHA512" => Ok(DigestAlgorithm::Sha512),
            other => Err(ImportError::Envelope(format!(
                "unsupported manifest digest '{}'",
                other
            ))),
        }
    }
}

pub enum Hasher {
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
}

impl Hasher {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Sha1 => Hasher::Sha1(sha1::Sha1::new()),
            DigestAlgorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            DigestAlgorithm::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize_hex(self) -> String {
        match self {
            Hasher::Sha1(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub algorithm: DigestAlgorithm,
    pub file_name: String,
    /// Lowercase hex digest.
    pub digest: String,
}

impl ManifestEntry {
    pub fn verify(&self, actual: &str) -> Result<()> {
        if actual.eq_ignore_ascii_case(&self.digest) {
            Ok(())
        } else {
            Err(ImportError::ChecksumMismatch {
                file: self.file_name.clone(),
                expected: self.digest.clone(),
                actual: actual.to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Parse `ALGO(file)= digest` lines; whitespace around `=` is tolerated.
    pub fn parse(content: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let malformed = || ImportError::Envelope(format!("malformed manifest line '{}'", line));

            let (left, digest) = line.rsplit_once('=').ok_or_else(malformed)?;
            let left = left.trim_end();
            let open = left.find('(').ok_or_else(malformed)?;
            if !left.ends_with(')') || open + 1 >= left.len() {
                return Err(malformed());
            }
            let digest = digest.trim();
            if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(malformed());
            }

            entries.push(ManifestEntry {
                algorithm: left[..open].parse()?,
                file_name: left[open + 1..left.len() - 1].to_string(),
                digest: digest.to_ascii_lowercase(),
            });
        }
        Ok(Self { entries })
    }

    pub fn get(&self, file_name: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.file_name == file_name)
    }
}

/// Text members of an archive needed before any disk is touched.
#[derive(Debug, Clone)]
pub struct Descriptors {
    pub ovf_name: String,
    pub ovf: String,
    pub manifest: Option<String>,
}

fn member_name(entry: &tar::Entry<'_, File>) -> Result<String> {
    let path = entry.path()?;
    Ok(path
        .to_string_lossy()
        .trim_start_matches("./")
        .to_string())
}

pub fn read_descriptors(archive_path: &Path) -> Result<Descriptors> {
    let mut archive = tar::Archive::new(File::open(archive_path)?);
    let mut ovf: Option<(String, String)> = None;
    let mut manifest = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = member_name(&entry)?;
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".ovf") && ovf.is_none() {
            let mut content = String::new();
            entry.read_to_string(&mut content)?;
            ovf = Some((name, content));
        } else if lower.ends_with(".mf") {
            let mut content = String::new();
            entry.read_to_string(&mut content)?;
            manifest = Some(content);
        }
    }

    let (ovf_name, ovf) = ovf.ok_or_else(|| {
        ImportError::Envelope(format!(
            "{} contains no OVF descriptor",
            archive_path.display()
        ))
    })?;
    Ok(Descriptors {
        ovf_name,
        ovf,
        manifest,
    })
}

/// Digest of an in-memory member, for descriptors already read.
pub fn digest_of(algorithm: DigestAlgorithm, data: &[u8]) -> String {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize_hex()
}

/// Stream `member` out of the archive into `destination`, hashing as it goes.
///
/// On a digest mismatch the extracted file is removed before returning.
pub fn extract_verified(
    archive_path: &Path,
    member: &str,
    destination: &Path,
    expected: Option<&ManifestEntry>,
) -> Result<u64> {
    let mut archive = tar::Archive::new(File::open(archive_path)?);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if member_name(&entry)? != member {
            continue;
        }

        let mut output = File::create(destination)?;
        let mut hasher = expected.map(|e| Hasher::new(e.algorithm));
        let mut buffer = vec![0u8; COPY_BUFFER];
        let mut written = 0u64;
        loop {
            let read = entry.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            output.write_all(&buffer[..read])?;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&buffer[..read]);
            }
            written += read as u64;
        }
        output.flush()?;
        drop(output);

        if let (Some(expected), Some(hasher)) = (expected, hasher) {
            if let Err(err) = expected.verify(&hasher.finalize_hex()) {
                std::fs::remove_file(destination)?;
                return Err(err);
            }
            log_debug!("Checksum verified for {}", member);
        }
        return Ok(written);
    }

    Err(ImportError::Envelope(format!(
        "archive {} has no member '{}'",
        archive_path.display(),
        member
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn build_archive(path: &Path, members: &[(&str, &[u8])]) {
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
    fn manifest_tolerates_spacing_around_equals() {
        let manifest = Manifest::parse(
            "SHA256(web.ovf)= ABCDEF01\nSHA1(web-disk1.vmdk) =0123abcd\n\nSHA512(odd (1).vmdk)=ff\n",
        )
        .unwrap();
        assert_eq!(manifest.entries.len(), 3);
        assert_eq!(manifest.entries[0].digest, "abcdef01");
        assert_eq!(manifest.entries[1].algorithm, DigestAlgorithm::Sha1);
        assert_eq!(manifest.get("odd (1).vmdk").unwrap().algorithm, DigestAlgorithm::Sha512);
    }

    #[test]
    fn manifest_rejects_malformed_lines() {
        assert!(Manifest::parse("SHA256 web.ovf abc").is_err());
        assert!(Manifest::parse("MD5(web.ovf)= abc").is_err());
        assert!(Manifest::parse("SHA256(web.ovf)= not-hex").is_err());
    }

    #[test]
    fn digests_match_known_values() {
        assert_eq!(
            digest_of(DigestAlgorithm::Sha256, b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            digest_of(DigestAlgorithm::Sha1, b"abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn descriptors_are_found_with_dot_prefix() {
        let dir = TempDir::new().unwrap();
        let ova = dir.path().join("web.ova");
        build_archive(
            &ova,
            &[("./web.ovf", b"<Envelope/>"), ("./web.mf", b"SHA1(web.ovf)= 00")],
        );
        let descriptors = read_descriptors(&ova).unwrap();
        assert_eq!(descriptors.ovf_name, "web.ovf");
        assert_eq!(descriptors.ovf, "<Envelope/>");
        assert!(descriptors.manifest.is_some());
    }

    #[test]
    fn extraction_checks_digest() {
        let dir = TempDir::new().unwrap();
        let ova = dir.path().join("web.ova");
        build_archive(&ova, &[("web.ovf", b"<Envelope/>"), ("disk.vmdk", b"abc")]);
        let dest = dir.path().join("disk.vmdk");

        let good = ManifestEntry {
            algorithm: DigestAlgorithm::Sha256,
            file_name: "disk.vmdk".into(),
            digest: digest_of(DigestAlgorithm::Sha256, b"abc"),
        };
        assert_eq!(extract_verified(&ova, "disk.vmdk", &dest, Some(&good)).unwrap(), 3);
        assert_eq!(std::fs::read(&dest).unwrap(), b"abc");
        std::fs::remove_file(&dest).unwrap();

        let bad = ManifestEntry {
            digest: "00".repeat(32),
            ..good
        };
        let err = extract_verified(&ova, "disk.vmdk", &dest, Some(&bad)).unwrap_err();
        assert!(matches!(err, ImportError::ChecksumMismatch { .. }));
        assert!(!dest.exists());

        assert!(extract_verified(&ova, "missing.vmdk", &dest, None).is_err());
    }
}
