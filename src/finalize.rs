//! Output finalization.
//!
//! The single point where persisted state changes. Moves the finished
//! ISO into the build directory, extracts standalone kernel/initramfs
//! artifacts (live initramfs with the zero slot truncated off; the copy
//! inside the ISO keeps it), computes checksums and sizes, and hands the
//! resulting patch to the build ledger. Runs only after every other
//! stage has succeeded.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::embed::SLOT_LENGTH;
use crate::error::AssembleError;
use crate::extract::BootPayloads;
use crate::ledger::{BuildLedger, BuildMetadata, ImageArtifact};
use crate::pipeline::Mode;

/// File names of the three artifacts for one (build, mode, arch).
#[derive(Debug, PartialEq, Eq)]
pub struct ArtifactNames {
    pub iso: String,
    pub kernel: String,
    pub initramfs: String,
}

pub fn artifact_names(name: &str, build_id: &str, arch: &str, mode: Mode) -> ArtifactNames {
    let infix = match mode {
        Mode::Installer => String::new(),
        Mode::Live => "-live".to_string(),
    };
    ArtifactNames {
        iso: format!("{name}-{build_id}{infix}.{arch}.iso"),
        kernel: format!("{name}-{build_id}{infix}-kernel-{arch}"),
        initramfs: format!("{name}-{build_id}{infix}-initramfs.{arch}.img"),
    }
}

/// Move the ISO into the build directory, write the standalone
/// kernel/initramfs artifacts, and patch the metadata record.
pub fn finalize(
    ledger: &BuildLedger,
    build_dir: &Path,
    meta: &BuildMetadata,
    mode: Mode,
    iso: &Path,
    payloads: &BootPayloads,
) -> Result<()> {
    let names = artifact_names(&meta.name, &meta.build_id, &meta.basearch, mode);

    let iso_dest = build_dir.join(&names.iso);
    move_file(iso, &iso_dest)?;

    let kernel_dest = build_dir.join(&names.kernel);
    fs::copy(&payloads.kernel, &kernel_dest).with_context(|| {
        format!("copying kernel to {}", kernel_dest.display())
    })?;

    let initramfs_dest = build_dir.join(&names.initramfs);
    match mode {
        Mode::Installer => {
            fs::copy(&payloads.initramfs, &initramfs_dest).with_context(|| {
                format!("copying initramfs to {}", initramfs_dest.display())
            })?;
        }
        Mode::Live => {
            write_truncated_initramfs(&payloads.initramfs, &initramfs_dest)?;
        }
    }

    let mut patch = BTreeMap::new();
    for (kind, file) in [
        ("iso", &names.iso),
        ("kernel", &names.kernel),
        ("initramfs", &names.initramfs),
    ] {
        let path = build_dir.join(file);
        let (sha256, size) = sha256_file(&path)?;
        patch.insert(
            mode.image_kind(kind),
            ImageArtifact {
                path: file.clone(),
                sha256,
                size: Some(size),
            },
        );
    }

    ledger
        .write_metadata(build_dir, &patch)
        .context("patching build metadata record")?;

    println!("  finalized: {}", iso_dest.display());
    Ok(())
}

/// Write `src` to `dest` with the trailing zero slot removed.
///
/// The suffix is verified all-zero first; a nonzero byte there means the
/// padding length drifted somewhere and truncating would corrupt the
/// artifact.
pub fn write_truncated_initramfs(src: &Path, dest: &Path) -> Result<()> {
    let bytes = fs::read(src).with_context(|| format!("reading {}", src.display()))?;
    let truncated = strip_zero_slot(&bytes)?;

    let dir = dest
        .parent()
        .with_context(|| format!("no parent directory of {}", dest.display()))?;
    let mut tmp = NamedTempFile::new_in(dir).context("creating temporary initramfs")?;
    tmp.write_all(truncated).context("writing truncated initramfs")?;
    tmp.persist(dest)
        .map_err(|e| e.error)
        .with_context(|| format!("persisting {}", dest.display()))?;
    Ok(())
}

/// Return `bytes` minus the trailing [`SLOT_LENGTH`] zero suffix.
pub fn strip_zero_slot(bytes: &[u8]) -> Result<&[u8]> {
    let len = bytes.len() as u64;
    if len < SLOT_LENGTH {
        return Err(AssembleError::CorruptPadding { offset: 0, at: 0 }.into());
    }
    let cut = (len - SLOT_LENGTH) as usize;
    if let Some(at) = bytes[cut..].iter().position(|b| *b != 0) {
        return Err(AssembleError::CorruptPadding {
            offset: cut as u64,
            at: at as u64,
        }
        .into());
    }
    Ok(&bytes[..cut])
}

/// Streaming sha256 plus size of a file.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 128 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

fn move_file(src: &Path, dest: &Path) -> Result<()> {
    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(_) => {
            // EXDEV: worktree and build dir on different filesystems
            fs::copy(src, dest).with_context(|| {
                format!("copying {} to {}", src.display(), dest.display())
            })?;
            fs::remove_file(src)
                .with_context(|| format!("removing {}", src.display()))?;
            Ok(())
        }
    }
}
