//! UEFI FAT boot image construction.
//!
//! The commit carries the EFI bootloader tree at a fixed path. Each of
//! its subdirectories is checked out into scratch space, the whole tree
//! is packed into a tar with ownership and permissions normalized (the
//! store checkout runs unprivileged, so source modes cannot be trusted),
//! and an external tool converts the tar into a FAT filesystem image
//! staged as `images/efiboot.img`.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::compose::ComposeRequest;
use crate::error::AssembleError;
use crate::process::Cmd;
use crate::worktree::WorkTree;

/// Commit path of the EFI bootloader directory tree.
const EFI_PATH: &str = "/usr/lib/ostree-boot/efi/EFI";

/// Stage `images/efiboot.img` in the ISO staging root.
pub fn stage_efi_boot_image(
    request: &ComposeRequest<'_>,
    tree: &WorkTree,
    kargs: &str,
) -> Result<()> {
    let scratch = tree.efi_dir().join("EFI");
    fs::create_dir_all(&scratch)
        .with_context(|| format!("creating {}", scratch.display()))?;

    // First entry is the EFI directory itself; the rest are the vendor
    // subdirectories to check out.
    let entries = request
        .store
        .list(request.commit, EFI_PATH)
        .context("listing EFI bootloader directory")?;
    if entries.len() < 2 {
        return Err(AssembleError::Extraction(format!(
            "EFI directory listing too short: {entries:?}"
        ))
        .into());
    }
    for name in &entries[1..] {
        request
            .store
            .checkout(
                request.commit,
                &format!("{EFI_PATH}/{name}"),
                &scratch.join(name),
            )
            .with_context(|| format!("checking out EFI subdirectory {name}"))?;
    }

    let boot_dir = scratch.join("BOOT");
    fs::create_dir_all(&boot_dir)
        .with_context(|| format!("creating {}", boot_dir.display()))?;
    fs::write(boot_dir.join("grub.cfg"), grub_config(kargs))
        .context("writing grub.cfg")?;

    let tar_path = tree.scratch_dir().join("efiboot.tar");
    build_normalized_tar(tree.efi_dir().as_path(), &tar_path)?;

    let efiboot = tree.iso_root().join("images").join("efiboot.img");
    Cmd::new("virt-make-fs")
        .args(["--type", "vfat"])
        .arg_path(&tar_path)
        .arg_path(&efiboot)
        .error_msg("virt-make-fs failed. Install guestfs-tools.")
        .run()?;
    Ok(())
}

fn grub_config(kargs: &str) -> String {
    format!(
        "set timeout=5\n\
         menuentry \"Boot\" {{\n\
         \tlinux /images/vmlinuz {kargs}\n\
         \tinitrd /images/initramfs.img\n\
         }}\n"
    )
}

/// Pack `src_dir` into a tar at `out_path` with everything owned by
/// root, directories 0755, files 0644, zero mtime, entries in a
/// deterministic order. Restricted build environments cannot chown real
/// files, so normalization happens in the archive headers instead.
pub fn build_normalized_tar(src_dir: &Path, out_path: &Path) -> Result<()> {
    let out = File::create(out_path)
        .with_context(|| format!("creating {}", out_path.display()))?;
    let mut builder = tar::Builder::new(out);

    let mut entries: Vec<PathBuf> = walkdir::WalkDir::new(src_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .map(|e| e.path().to_path_buf())
        .filter(|p| p != src_dir)
        .collect();
    entries.sort_by(|a, b| {
        let ra = a.strip_prefix(src_dir).unwrap_or(a).to_string_lossy().into_owned();
        let rb = b.strip_prefix(src_dir).unwrap_or(b).to_string_lossy().into_owned();
        ra.cmp(&rb)
    });

    for p in entries {
        let rel = p
            .strip_prefix(src_dir)
            .unwrap_or(&p)
            .to_string_lossy()
            .replace('\\', "/");
        let md = fs::symlink_metadata(&p)
            .with_context(|| format!("reading metadata of {}", p.display()))?;

        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);

        if md.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, format!("{rel}/"), std::io::empty())?;
        } else if md.is_file() {
            let mut f = File::open(&p)
                .with_context(|| format!("opening {}", p.display()))?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.len());
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, rel, &mut f)?;
        }
        // symlinks do not occur in EFI trees; anything else is skipped
    }

    builder
        .into_inner()
        .context("finalizing EFI tar")?
        .sync_all()
        .context("flushing EFI tar")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    #[test]
    fn tar_normalizes_ownership_and_modes() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("efi");
        fs::create_dir_all(src.join("EFI/fedora")).unwrap();
        fs::write(src.join("EFI/fedora/grubx64.efi"), b"efi binary").unwrap();
        // a mode the restricted store might produce
        fs::set_permissions(
            src.join("EFI/fedora/grubx64.efi"),
            fs::Permissions::from_mode(0o400),
        )
        .unwrap();

        let tar_path = tmp.path().join("efiboot.tar");
        build_normalized_tar(&src, &tar_path).unwrap();

        let mut archive = tar::Archive::new(File::open(&tar_path).unwrap());
        let mut seen = Vec::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let header = entry.header();
            assert_eq!(header.uid().unwrap(), 0);
            assert_eq!(header.gid().unwrap(), 0);
            let mode = header.mode().unwrap();
            match header.entry_type() {
                tar::EntryType::Directory => assert_eq!(mode, 0o755),
                tar::EntryType::Regular => assert_eq!(mode, 0o644),
                other => panic!("unexpected entry type {other:?}"),
            }
            seen.push(entry.path().unwrap().display().to_string());
        }
        assert_eq!(seen, vec!["EFI/", "EFI/fedora/", "EFI/fedora/grubx64.efi"]);
    }

    #[test]
    fn tar_entry_order_is_deterministic() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("efi");
        fs::create_dir_all(&src).unwrap();
        for name in ["zz", "aa", "mm"] {
            fs::write(src.join(name), name).unwrap();
        }

        let tar_path = tmp.path().join("a.tar");
        build_normalized_tar(&src, &tar_path).unwrap();
        let mut archive = tar::Archive::new(File::open(&tar_path).unwrap());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["aa", "mm", "zz"]);
    }

    #[test]
    fn grub_config_carries_the_kargs() {
        let cfg = grub_config("mitigations=auto liveiso=os-99");
        assert!(cfg.contains("linux /images/vmlinuz mitigations=auto liveiso=os-99"));
        assert!(cfg.contains("initrd /images/initramfs.img"));
    }
}
