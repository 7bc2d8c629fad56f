//! Commit payload extraction.
//!
//! Pulls the kernel and initramfs out of the commit store into the
//! working tree. The module tree at `/usr/lib/modules` holds exactly one
//! kernel version subdirectory; its listing starts with the directory
//! itself, so the version is the second entry. Anything else means the
//! commit layout is not one this assembler understands.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::commit::CommitStore;
use crate::error::AssembleError;

const MODULES_PATH: &str = "/usr/lib/modules";
pub const KERNEL_IMG: &str = "vmlinuz";
pub const INITRAMFS_IMG: &str = "initramfs.img";

/// Kernel and initramfs extracted into the working tree.
#[derive(Debug)]
pub struct BootPayloads {
    pub kernel: PathBuf,
    pub initramfs: PathBuf,
}

/// Copy `vmlinuz` and `initramfs.img` out of `commit` into `dest`.
pub fn extract_boot_payloads(
    store: &CommitStore,
    commit: &str,
    dest: &Path,
) -> Result<BootPayloads> {
    let entries = store
        .list(commit, MODULES_PATH)
        .with_context(|| format!("listing {MODULES_PATH} of commit {commit}"))?;
    let version = module_directory(&entries)?;
    let moduledir = format!("{MODULES_PATH}/{version}");

    for name in [KERNEL_IMG, INITRAMFS_IMG] {
        let target = dest.join(name);
        store
            .checkout(commit, &format!("{moduledir}/{name}"), &target)
            .map_err(|e| {
                AssembleError::Extraction(format!("checking out {moduledir}/{name}: {e:#}"))
            })?;
        if !target.is_file() {
            return Err(AssembleError::Extraction(format!(
                "{moduledir}/{name} missing after checkout"
            ))
            .into());
        }
        // user-mode checkout of a read-only store can leave 0400 modes
        restore_read_permissions(&target)?;
    }

    println!("  extracted {KERNEL_IMG} and {INITRAMFS_IMG} from {moduledir}");
    Ok(BootPayloads {
        kernel: dest.join(KERNEL_IMG),
        initramfs: dest.join(INITRAMFS_IMG),
    })
}

/// Pick the kernel version subdirectory out of a module tree listing.
///
/// The listing shape is `[<modules dir itself>, <version dir>]`; any
/// other shape is an extraction error rather than a guess.
pub fn module_directory(entries: &[String]) -> Result<&str> {
    match entries {
        [_, version] => Ok(version.as_str()),
        _ => Err(AssembleError::Extraction(format!(
            "expected module directory listing of two entries, got {}: {entries:?}",
            entries.len()
        ))
        .into()),
    }
}

fn restore_read_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o644))
            .with_context(|| format!("restoring permissions on {}", path.display()))?;
    }
    Ok(())
}
