//! Package manifests: a listing of files with their SHA-256 and size.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const PACKAGE_VERSION: &str = "1.0";
pub const MANIFEST_FILE: &str = "manifest.json";

/// UTC timestamp in the `2025-01-31T12:00:00.123456Z` form used in metadata files.
pub fn utc_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSource {
    pub topic: String,
    pub lang: String,
    pub episode: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub sha256: String,
    pub size: u64,
}

impl ManifestEntry {
    /// `rel` is the path recorded in the manifest, always with forward slashes.
    pub fn from_file(path: &Path, rel: &str) -> io::Result<Self> {
        Ok(Self {
            path: rel.replace('\\', "/"),
            sha256: file_sha256(path)?,
            size: fs::metadata(path)?.len(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub package_version: String,
    pub generated_at: String,
    pub source: ManifestSource,
    pub files: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(source: ManifestSource, files: Vec<ManifestEntry>) -> Self {
        Self { package_version: PACKAGE_VERSION.to_string(), generated_at: utc_timestamp(), source, files }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json()?).with_context(|| format!("writing {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn entry_hashes_file_contents() {
        let tmp = TempDir::new().unwrap();
        let p = tmp.path().join("a.txt");
        fs::write(&p, "abc").unwrap();
        let e = ManifestEntry::from_file(&p, "sub\\a.txt").unwrap();
        assert_eq!(e.path, "sub/a.txt");
        assert_eq!(e.size, 3);
        assert_eq!(e.sha256, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
    }

    #[test]
    fn manifest_carries_package_version() {
        let src = ManifestSource { topic: "t".into(), lang: "CS".into(), episode: "ep01".into() };
        let m = Manifest::new(src, Vec::new());
        let v: serde_json::Value = serde_json::from_str(&m.to_json().unwrap()).unwrap();
        assert_eq!(v["package_version"], "1.0");
        assert_eq!(v["source"]["episode"], "ep01");
        assert!(v["generated_at"].as_str().unwrap().ends_with('Z'));
    }
}
