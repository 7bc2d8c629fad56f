//! Architecture-conditional ISO composition.
//!
//! Stages everything the ISO needs under the working tree's staging
//! root, then invokes the external mastering tool with
//! architecture-specific arguments. Each architecture is a variant of a
//! closed enum composing the same result; adding an architecture means
//! adding a variant. The mastering tool runs only after all staging has
//! succeeded, so a failed run never emits a partial ISO.

pub mod efi;

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};

use crate::commit::CommitStore;
use crate::extract::{BootPayloads, INITRAMFS_IMG, KERNEL_IMG};
use crate::pipeline::Mode;
use crate::process::Cmd;
use crate::worktree::WorkTree;

/// Commit path holding the legacy BIOS bootloader binaries.
const ISOLINUX_PATH: &str = "/usr/lib/bootloader/isolinux";

/// Name of the finished ISO inside the working tree; the finalizer moves
/// it to its final name in the build directory.
const DISC_ISO: &str = "disc.iso";

/// The closed set of supported target architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X86_64,
    Aarch64,
    Ppc64le,
    S390x,
}

impl FromStr for Architecture {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "x86_64" => Ok(Self::X86_64),
            "aarch64" => Ok(Self::Aarch64),
            "ppc64le" => Ok(Self::Ppc64le),
            "s390x" => Ok(Self::S390x),
            other => bail!("unsupported architecture '{other}'"),
        }
    }
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Aarch64 => "aarch64",
            Self::Ppc64le => "ppc64le",
            Self::S390x => "s390x",
        }
    }

    /// Whether the config-slot discovery header is written on this
    /// architecture. s390x boots through a combined image and carries
    /// no slot.
    pub fn supports_config_slot(&self) -> bool {
        !matches!(self, Self::S390x)
    }

    /// The ISO mastering program for this architecture.
    pub fn mastering_tool(&self) -> &'static str {
        match self {
            Self::S390x => "genisoimage",
            _ => "xorrisofs",
        }
    }

    /// Whether the EFI FAT boot image is staged.
    pub fn uses_efi_image(&self) -> bool {
        matches!(self, Self::X86_64 | Self::Aarch64)
    }

    /// Boot-related mastering arguments, appended to the common set.
    pub fn mastering_boot_args(&self) -> Vec<String> {
        let owned = |args: &[&str]| args.iter().map(|s| s.to_string()).collect();
        match self {
            Self::X86_64 => owned(&[
                "-b",
                "isolinux/isolinux.bin",
                "-c",
                "isolinux/boot.cat",
                "-no-emul-boot",
                "-boot-load-size",
                "4",
                "-boot-info-table",
                "-eltorito-alt-boot",
                "-e",
                "images/efiboot.img",
                "-no-emul-boot",
            ]),
            Self::Aarch64 => owned(&["-e", "images/efiboot.img", "-no-emul-boot"]),
            Self::Ppc64le => owned(&["-chrp-boot"]),
            Self::S390x => owned(&["-b", "images/cdboot.img", "-no-emul-boot"]),
        }
    }
}

/// Everything composition needs from the earlier stages.
pub struct ComposeRequest<'a> {
    pub store: &'a CommitStore,
    pub commit: &'a str,
    pub arch: Architecture,
    pub mode: Mode,
    /// Volume label, already sanitized (see [`volume_id`]).
    pub volume_id: String,
    /// Filtered kernel arguments for the bootloader configs.
    pub kargs: String,
}

/// Stage the ISO tree and master the image. Returns the ISO path inside
/// the working tree.
pub fn compose(
    request: &ComposeRequest<'_>,
    tree: &WorkTree,
    payloads: &BootPayloads,
) -> Result<PathBuf> {
    let iso_root = tree.iso_root();
    let images = iso_root.join("images");
    fs::create_dir_all(&images)
        .with_context(|| format!("creating {}", images.display()))?;

    copy_file(&payloads.kernel, &images.join(KERNEL_IMG))?;
    copy_file(&payloads.initramfs, &images.join(INITRAMFS_IMG))?;

    let kargs = bootloader_kargs(request);

    match request.arch {
        Architecture::X86_64 => {
            stage_isolinux(request, tree, &kargs)?;
            efi::stage_efi_boot_image(request, tree, &kargs)?;
        }
        Architecture::Aarch64 => {
            efi::stage_efi_boot_image(request, tree, &kargs)?;
        }
        Architecture::Ppc64le => {
            // CHRP boot needs no staged bootloader binaries, only the
            // mastering flag.
        }
        Architecture::S390x => {
            stage_s390x_cdboot(tree, payloads, &kargs)?;
        }
    }

    let iso = tree.root().join(DISC_ISO);
    master_iso(request, &iso_root, &iso)?;

    if request.arch == Architecture::X86_64 {
        // make the ISO bootable from a raw USB block device too
        Cmd::new("isohybrid")
            .arg("--uefi")
            .arg_path(&iso)
            .error_msg("isohybrid failed. Install syslinux.")
            .run()?;
    }

    Ok(iso)
}

/// The boot command line carried by the generated bootloader configs.
fn bootloader_kargs(request: &ComposeRequest<'_>) -> String {
    match request.mode {
        Mode::Live => {
            let live = format!("liveiso={}", request.volume_id);
            if request.kargs.is_empty() {
                live
            } else {
                format!("{} {live}", request.kargs)
            }
        }
        Mode::Installer => request.kargs.clone(),
    }
}

fn stage_isolinux(
    request: &ComposeRequest<'_>,
    tree: &WorkTree,
    kargs: &str,
) -> Result<()> {
    let isolinux = tree.iso_root().join("isolinux");
    request
        .store
        .checkout(request.commit, ISOLINUX_PATH, &isolinux)
        .context("checking out isolinux bootloader binaries")?;

    // El Torito boot files must be world-readable and the directory
    // traversable regardless of the store's modes.
    set_mode_recursive(&isolinux, 0o755)?;

    let config = format!(
        "DEFAULT linux\n\
         TIMEOUT 50\n\
         LABEL linux\n\
         \x20 KERNEL /images/{KERNEL_IMG}\n\
         \x20 APPEND initrd=/images/{INITRAMFS_IMG} {kargs}\n"
    );
    fs::write(isolinux.join("isolinux.cfg"), config)
        .context("writing isolinux.cfg")?;
    Ok(())
}

fn stage_s390x_cdboot(tree: &WorkTree, payloads: &BootPayloads, kargs: &str) -> Result<()> {
    let cmdline = tree.scratch_dir().join("cmdline");
    fs::write(&cmdline, format!("{kargs}\n")).context("writing s390x cmdline")?;

    let cdboot = tree.iso_root().join("images").join("cdboot.img");
    Cmd::new("mk-s390image")
        .arg_path(&payloads.kernel)
        .arg_path(&cdboot)
        .arg("-r")
        .arg_path(&payloads.initramfs)
        .arg("-p")
        .arg_path(&cmdline)
        .error_msg("mk-s390image failed. Install s390utils.")
        .run()?;
    Ok(())
}

fn master_iso(request: &ComposeRequest<'_>, iso_root: &Path, output: &Path) -> Result<()> {
    Cmd::new(request.arch.mastering_tool())
        .args(mastering_args(request.arch, &request.volume_id, iso_root, output))
        .error_msg("ISO mastering failed. Install xorriso or genisoimage.")
        .run()?;
    Ok(())
}

/// Full mastering argument list. Only spellings both xorrisofs and
/// genisoimage accept go in the common part (`-o`, not `-output`).
fn mastering_args(
    arch: Architecture,
    volume_id: &str,
    iso_root: &Path,
    output: &Path,
) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        output.display().to_string(),
        "-volid".to_string(),
        volume_id.to_string(),
        "-rational-rock".to_string(),
        "-J".to_string(),
        "-joliet-long".to_string(),
    ];
    args.extend(arch.mastering_boot_args());
    args.push(iso_root.display().to_string());
    args
}

/// Derive the ISO volume label from the OS name and build id:
/// `[A-Za-z0-9_-]` only, at most 32 bytes.
pub fn volume_id(name: &str, build_id: &str) -> String {
    let mut id: String = format!("{name}-{build_id}")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    id.truncate(32);
    id
}

fn copy_file(src: &Path, dest: &Path) -> Result<()> {
    fs::copy(src, dest).with_context(|| {
        format!("copying {} to {}", src.display(), dest.display())
    })?;
    Ok(())
}

fn set_mode_recursive(root: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        for entry in walkdir::WalkDir::new(root) {
            let entry = entry.with_context(|| format!("walking {}", root.display()))?;
            fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode))
                .with_context(|| {
                    format!("setting permissions on {}", entry.path().display())
                })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn architecture_parses_the_closed_set() {
        for (s, arch) in [
            ("x86_64", Architecture::X86_64),
            ("aarch64", Architecture::Aarch64),
            ("ppc64le", Architecture::Ppc64le),
            ("s390x", Architecture::S390x),
        ] {
            assert_eq!(Architecture::from_str(s).unwrap(), arch);
            assert_eq!(arch.as_str(), s);
        }
        assert!(Architecture::from_str("riscv64").is_err());
    }

    #[test]
    fn only_s390x_lacks_the_config_slot() {
        assert!(Architecture::X86_64.supports_config_slot());
        assert!(Architecture::Aarch64.supports_config_slot());
        assert!(Architecture::Ppc64le.supports_config_slot());
        assert!(!Architecture::S390x.supports_config_slot());
    }

    #[test]
    fn x86_64_masters_bios_and_efi_boot() {
        let args = Architecture::X86_64.mastering_boot_args();
        assert!(args.contains(&"isolinux/isolinux.bin".to_string()));
        assert!(args.contains(&"images/efiboot.img".to_string()));
        assert_eq!(Architecture::X86_64.mastering_tool(), "xorrisofs");
    }

    #[test]
    fn aarch64_masters_efi_only() {
        let args = Architecture::Aarch64.mastering_boot_args();
        assert!(args.contains(&"images/efiboot.img".to_string()));
        assert!(!args.iter().any(|a| a.contains("isolinux")));
    }

    #[test]
    fn ppc64le_masters_chrp_boot() {
        assert_eq!(
            Architecture::Ppc64le.mastering_boot_args(),
            vec!["-chrp-boot".to_string()]
        );
    }

    #[test]
    fn s390x_switches_mastering_program() {
        assert_eq!(Architecture::S390x.mastering_tool(), "genisoimage");
        assert!(Architecture::S390x
            .mastering_boot_args()
            .contains(&"images/cdboot.img".to_string()));
    }

    #[test]
    fn mastering_output_flag_works_for_both_tools() {
        // genisoimage (the s390x tool) has no -output; -o is common
        for arch in [Architecture::X86_64, Architecture::S390x] {
            let args = mastering_args(
                arch,
                "os-99-9",
                Path::new("/work/iso"),
                Path::new("/work/disc.iso"),
            );
            assert_eq!(args[0], "-o");
            assert_eq!(args[1], "/work/disc.iso");
            assert!(!args.contains(&"-output".to_string()));
            assert_eq!(args.last().unwrap(), "/work/iso");
        }
    }

    #[test]
    fn volume_id_is_sanitized_and_bounded() {
        assert_eq!(volume_id("fedora-coreos", "99.9"), "fedora-coreos-99-9");
        let long = volume_id("a-very-long-operating-system-name", "123456789");
        assert_eq!(long.len(), 32);
        assert!(long
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    }

    #[test]
    fn live_mode_appends_liveiso_karg() {
        let store = CommitStore::new(Path::new("/nonexistent"));
        let request = ComposeRequest {
            store: &store,
            commit: "deadbeef",
            arch: Architecture::X86_64,
            mode: Mode::Live,
            volume_id: "os-99-9".to_string(),
            kargs: "mitigations=auto".to_string(),
        };
        assert_eq!(bootloader_kargs(&request), "mitigations=auto liveiso=os-99-9");

        let installer = ComposeRequest {
            mode: Mode::Installer,
            ..request
        };
        assert_eq!(bootloader_kargs(&installer), "mitigations=auto");
    }
}
