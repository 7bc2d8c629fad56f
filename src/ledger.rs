//! Build ledger.
//!
//! Builds live under `<root>/builds/<buildid>/<basearch>/`, each owning a
//! `meta.json` record. The record is read at run start, mutated in
//! memory, and persisted exactly once by the output finalizer after every
//! other stage has succeeded; a failed run leaves the record untouched.
//!
//! Fields this core does not model are carried through the
//! read/patch/write cycle verbatim.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

pub const META_JSON: &str = "meta.json";
const LATEST: &str = "latest";

/// One produced artifact in the `images` map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageArtifact {
    pub path: String,
    pub sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// The build metadata record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildMetadata {
    #[serde(rename = "buildid")]
    pub build_id: String,
    pub name: String,
    #[serde(rename = "ostree-commit")]
    pub commit: String,
    pub basearch: String,
    /// Kernel command line recovered from the disk image; input of the
    /// kernel argument filter. Absent means empty.
    #[serde(rename = "kernel-arguments", skip_serializing_if = "Option::is_none")]
    pub kernel_arguments: Option<String>,
    #[serde(default)]
    pub images: BTreeMap<String, ImageArtifact>,
    /// Everything else in the record, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Ledger rooted at a directory containing `builds/`.
#[derive(Debug, Clone)]
pub struct BuildLedger {
    root: PathBuf,
}

impl BuildLedger {
    pub fn open(root: &Path) -> Result<Self> {
        let builds = root.join("builds");
        if !builds.is_dir() {
            bail!("no builds directory at {}", builds.display());
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a build id (or the `latest` pointer) to its directory.
    pub fn resolve(&self, build_id: Option<&str>, basearch: &str) -> Result<PathBuf> {
        let id = match build_id {
            Some(id) => id.to_string(),
            None => self.latest_id()?,
        };
        let dir = self.root.join("builds").join(&id).join(basearch);
        if !dir.is_dir() {
            bail!("no build directory for '{id}' ({basearch}): {}", dir.display());
        }
        Ok(dir)
    }

    fn latest_id(&self) -> Result<String> {
        let latest = self.root.join("builds").join(LATEST);
        // `latest` is a symlink to the build directory, or a plain file
        // holding the id.
        if let Ok(target) = fs::read_link(&latest) {
            return target
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .with_context(|| format!("unusable latest symlink {}", latest.display()));
        }
        let id = fs::read_to_string(&latest)
            .with_context(|| format!("no latest build pointer at {}", latest.display()))?;
        let id = id.trim().to_string();
        if id.is_empty() {
            bail!("empty latest build pointer at {}", latest.display());
        }
        Ok(id)
    }

    /// Read the metadata record of a build directory.
    pub fn read_metadata(&self, build_dir: &Path) -> Result<BuildMetadata> {
        let path = build_dir.join(META_JSON);
        let bytes =
            fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", path.display()))
    }

    /// Merge `patch` into the record's `images` map and replace the
    /// record atomically (temp file + rename) under an exclusive lock.
    ///
    /// The record is re-read under the lock, so a concurrent run for a
    /// different mode of the same build cannot lose its own patch.
    pub fn write_metadata(
        &self,
        build_dir: &Path,
        patch: &BTreeMap<String, ImageArtifact>,
    ) -> Result<()> {
        let path = build_dir.join(META_JSON);
        let lock_path = build_dir.join(".meta.json.lock");

        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("creating lock file {}", lock_path.display()))?;
        lock.lock_exclusive()
            .with_context(|| format!("locking {}", lock_path.display()))?;

        let result = (|| {
            let mut meta = self.read_metadata(build_dir)?;
            meta.images
                .extend(patch.iter().map(|(k, v)| (k.clone(), v.clone())));

            let bytes = serde_json::to_vec_pretty(&meta).context("serializing metadata")?;
            let mut tmp =
                NamedTempFile::new_in(build_dir).context("creating temporary metadata file")?;
            std::io::Write::write_all(&mut tmp, &bytes).context("writing metadata")?;
            tmp.persist(&path)
                .map_err(|e| e.error)
                .with_context(|| format!("replacing {}", path.display()))?;
            Ok(())
        })();

        let _ = fs2::FileExt::unlock(&lock);
        result
    }
}
