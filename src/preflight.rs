//! Host tool preflight.
//!
//! Verifies that every external tool the selected architecture and mode
//! will invoke is present before the run touches any state. This turns
//! cryptic mid-pipeline failures into one upfront report.

use anyhow::{bail, Result};

use crate::compose::Architecture;
use crate::pipeline::Mode;

/// Tools needed for a given run, as (command, package) pairs.
pub fn required_tools(arch: Architecture, mode: Mode) -> Vec<(&'static str, &'static str)> {
    let mut tools = vec![
        ("ostree", "ostree"),
        ("isoinfo", "genisoimage"),
        (arch.mastering_tool(), mastering_package(arch)),
    ];
    if mode == Mode::Live {
        tools.push(("mksquashfs", "squashfs-tools"));
        tools.push(("cpio", "cpio"));
        tools.push(("gzip", "gzip"));
    }
    if arch.uses_efi_image() {
        tools.push(("virt-make-fs", "guestfs-tools"));
    }
    match arch {
        Architecture::X86_64 => tools.push(("isohybrid", "syslinux")),
        Architecture::S390x => tools.push(("mk-s390image", "s390utils")),
        _ => {}
    }
    tools
}

fn mastering_package(arch: Architecture) -> &'static str {
    match arch.mastering_tool() {
        "genisoimage" => "genisoimage",
        _ => "xorriso",
    }
}

/// Check that all tools for this run exist in PATH.
pub fn check_host_tools(arch: Architecture, mode: Mode) -> Result<()> {
    let missing: Vec<_> = required_tools(arch, mode)
        .into_iter()
        .filter(|(tool, _)| which::which(tool).is_err())
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {t} (install: {p})"))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{msg}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_names(arch: Architecture, mode: Mode) -> Vec<&'static str> {
        required_tools(arch, mode).into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn live_x86_64_needs_the_full_set() {
        let tools = tool_names(Architecture::X86_64, Mode::Live);
        for t in ["ostree", "isoinfo", "xorrisofs", "mksquashfs", "cpio", "gzip", "virt-make-fs", "isohybrid"] {
            assert!(tools.contains(&t), "missing {t}");
        }
    }

    #[test]
    fn installer_mode_skips_payload_tools() {
        let tools = tool_names(Architecture::Ppc64le, Mode::Installer);
        assert!(!tools.contains(&"mksquashfs"));
        assert!(!tools.contains(&"virt-make-fs"));
        assert!(!tools.contains(&"isohybrid"));
    }

    #[test]
    fn s390x_switches_tooling() {
        let tools = tool_names(Architecture::S390x, Mode::Installer);
        assert!(tools.contains(&"genisoimage"));
        assert!(tools.contains(&"mk-s390image"));
        assert!(!tools.contains(&"xorrisofs"));
    }
}
