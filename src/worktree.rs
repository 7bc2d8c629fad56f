//! Per-run working tree.
//!
//! One run owns one tree, named deterministically per
//! (build, mode, architecture) so concurrent runs for different variants
//! of the same build never share state. The tree is destroyed
//! unconditionally at run start (a tree left by an interrupted run is
//! not trusted) and left in place afterwards for inspection, including
//! after a failure.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::pipeline::Mode;

#[derive(Debug)]
pub struct WorkTree {
    root: PathBuf,
}

impl WorkTree {
    /// Create a fresh tree under `<build_dir>/tmp/iso-<mode>-<arch>/`.
    pub fn create(build_dir: &Path, mode: Mode, arch: &str) -> Result<Self> {
        let root = build_dir
            .join("tmp")
            .join(format!("iso-{}-{}", mode.as_str(), arch));

        if root.exists() {
            fs::remove_dir_all(&root)
                .with_context(|| format!("removing stale working tree {}", root.display()))?;
        }

        let tree = Self { root };
        for dir in [tree.images_dir(), tree.iso_root(), tree.scratch_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(tree)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Extracted kernel/initramfs and staged boot images.
    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Staging root handed to the ISO mastering tool.
    pub fn iso_root(&self) -> PathBuf {
        self.root.join("iso")
    }

    /// Scratch space for intermediate payloads (squashfs, cpio, tar).
    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join("scratch")
    }

    /// Live-mode root filesystem checkout.
    pub fn rootfs_dir(&self) -> PathBuf {
        self.root.join("rootfs")
    }

    /// EFI directory checkout used to build the FAT boot image.
    pub fn efi_dir(&self) -> PathBuf {
        self.root.join("efi")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_wipes_stale_tree() {
        let tmp = TempDir::new().unwrap();
        let stale = tmp
            .path()
            .join("tmp/iso-live-x86_64/images/leftover.img");
        fs::create_dir_all(stale.parent().unwrap()).unwrap();
        fs::write(&stale, b"stale").unwrap();

        let tree = WorkTree::create(tmp.path(), Mode::Live, "x86_64").unwrap();
        assert!(!stale.exists());
        assert!(tree.images_dir().exists());
        assert!(tree.iso_root().exists());
    }

    #[test]
    fn trees_are_distinct_per_mode_and_arch() {
        let tmp = TempDir::new().unwrap();
        let live = WorkTree::create(tmp.path(), Mode::Live, "x86_64").unwrap();
        let installer = WorkTree::create(tmp.path(), Mode::Installer, "x86_64").unwrap();
        let s390x = WorkTree::create(tmp.path(), Mode::Live, "s390x").unwrap();

        assert_ne!(live.root(), installer.root());
        assert_ne!(live.root(), s390x.root());
        // creating one did not wipe the others
        assert!(live.images_dir().exists());
        assert!(installer.images_dir().exists());
    }
}
