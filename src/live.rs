//! Live root filesystem payload.
//!
//! A live ISO boots straight into the OS from a compressed root
//! filesystem shipped inside the initramfs. This module builds that
//! payload: squashfs of the root tree, wrapped in an uncompressed cpio
//! so the kernel can unpack it, gzipped, appended to the initramfs, and
//! followed by exactly [`SLOT_LENGTH`] zero bytes reserved for a later
//! config embed (see `embed`).

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

use crate::config::LiveConfig;
use crate::embed::SLOT_LENGTH;
use crate::error::AssembleError;
use crate::process::{shell, Cmd};

/// File name of the squashfs inside the appended cpio. The initrd hook
/// that mounts the live root looks for this exact name.
const ROOT_SQUASHFS: &str = "root.squashfs";

/// Build the live payload from `rootfs` and append it (plus the zero
/// slot) to `initramfs`, replacing the file atomically.
///
/// `scratch` is a working directory for the intermediate squashfs and
/// cpio. The initramfs replacement goes through a temp file in the
/// initramfs's own directory plus rename, so a failure never leaves a
/// half-written initramfs and a shared source file is never mutated in
/// place.
pub fn append_live_payload(
    initramfs: &Path,
    rootfs: &Path,
    scratch: &Path,
    config: &LiveConfig,
) -> Result<()> {
    fs::create_dir_all(scratch)
        .with_context(|| format!("creating {}", scratch.display()))?;

    let squashfs = scratch.join(ROOT_SQUASHFS);
    build_root_squashfs(rootfs, &squashfs, &config.squashfs_compression)?;

    let payload = scratch.join("rootfs.cpio.gz");
    wrap_in_cpio_gz(scratch, &payload)?;

    let payload_bytes = fs::read(&payload)
        .with_context(|| format!("reading {}", payload.display()))?;
    concat_with_padding(initramfs, &payload_bytes)
        .map_err(|e| AssembleError::PayloadBuild(format!("{e:#}")))?;

    println!(
        "  appended live payload ({} bytes + {SLOT_LENGTH} zero bytes)",
        payload_bytes.len()
    );
    Ok(())
}

/// Compress a root filesystem tree into a single squashfs file.
fn build_root_squashfs(rootfs: &Path, output: &Path, compression: &str) -> Result<()> {
    Cmd::new("mksquashfs")
        .arg_path(rootfs)
        .arg_path(output)
        .args(["-comp", compression])
        .arg("-no-progress")
        .error_msg("mksquashfs failed. Install squashfs-tools.")
        .run()
        .map_err(payload_error)?;
    Ok(())
}

/// Wrap the squashfs in an uncompressed newc cpio, then gzip it.
///
/// The cpio is reproducible and root-owned regardless of who runs the
/// build. Archiving and compression run as two separately checked
/// stages: a cpio failure that still emitted partial bytes must fail the
/// build, and a single pipe would only report the compressor's status.
fn wrap_in_cpio_gz(scratch: &Path, output: &Path) -> Result<()> {
    let archive = scratch.join("rootfs.cpio");
    shell(&cpio_script(scratch, &archive)).map_err(payload_error)?;

    if !archive.exists() || fs::metadata(&archive)?.len() == 0 {
        return Err(
            AssembleError::PayloadBuild("cpio produced an empty payload archive".into()).into(),
        );
    }

    // gzip -9 replaces rootfs.cpio with rootfs.cpio.gz
    Cmd::new("gzip")
        .arg("-9")
        .arg_path(&archive)
        .error_msg("gzip failed. Install gzip.")
        .run()
        .map_err(payload_error)?;

    if !output.exists() || fs::metadata(output)?.len() == 0 {
        return Err(
            AssembleError::PayloadBuild("gzip produced an empty payload archive".into()).into(),
        );
    }
    Ok(())
}

/// Shell script feeding the squashfs name to cpio. The archiver is the
/// script's final command, so its exit status is the script's; paths are
/// single-quoted against whitespace in build directories.
fn cpio_script(scratch: &Path, archive: &Path) -> String {
    format!(
        "cd '{}' && echo {ROOT_SQUASHFS} | \
         cpio -o -H newc -R root:root --quiet --reproducible > '{}'",
        scratch.display(),
        archive.display()
    )
}

fn payload_error(err: anyhow::Error) -> anyhow::Error {
    match err.downcast_ref::<AssembleError>() {
        Some(AssembleError::ExternalTool { .. }) => {
            AssembleError::PayloadBuild(format!("{err:#}")).into()
        }
        _ => err,
    }
}

/// Replace `initramfs` with `[initramfs][payload][SLOT_LENGTH zeros]`.
///
/// Written via a temp file in the same directory and persisted by
/// rename; the original bytes are only replaced on full success.
pub fn concat_with_padding(initramfs: &Path, payload: &[u8]) -> Result<()> {
    let original = fs::read(initramfs)
        .with_context(|| format!("reading {}", initramfs.display()))?;

    let dir = initramfs
        .parent()
        .with_context(|| format!("no parent directory of {}", initramfs.display()))?;
    let mut tmp = NamedTempFile::new_in(dir).context("creating temporary initramfs")?;

    tmp.write_all(&original).context("writing original initramfs")?;
    tmp.write_all(payload).context("writing live payload")?;
    tmp.write_all(&vec![0u8; SLOT_LENGTH as usize])
        .context("writing config slot padding")?;
    tmp.flush().context("flushing initramfs")?;

    tmp.persist(initramfs)
        .map_err(|e| e.error)
        .with_context(|| format!("replacing {}", initramfs.display()))?;
    Ok(())
}
