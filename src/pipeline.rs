//! Run orchestration.
//!
//! One run assembles one ISO variant for one build: extract boot
//! payloads, (live) build and append the root filesystem payload, filter
//! kernel arguments, compose and master the ISO, (live) embed the config
//! slot header, finalize outputs. Stages run strictly in that order;
//! each either fails the whole run or feeds the next. The metadata
//! record is only written by the final stage, so a failure anywhere
//! leaves it exactly as it was.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::commit::CommitStore;
use crate::compose::{self, Architecture, ComposeRequest};
use crate::config::AssemblerConfig;
use crate::embed;
use crate::extract;
use crate::finalize;
use crate::kargs::filter_kargs;
use crate::ledger::BuildLedger;
use crate::live;
use crate::preflight;
use crate::worktree::WorkTree;

/// Which ISO variant a run produces. The two modes are mutually
/// exclusive result namespaces within one build; both may coexist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Installer,
    Live,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Installer => "installer",
            Self::Live => "live",
        }
    }

    /// The image-kind key for one of `iso`, `kernel`, `initramfs`.
    pub fn image_kind(&self, kind: &str) -> String {
        match self {
            Self::Installer => kind.to_string(),
            Self::Live => format!("live-{kind}"),
        }
    }

    fn image_kinds(&self) -> [String; 3] {
        ["iso", "kernel", "initramfs"].map(|k| self.image_kind(k))
    }
}

/// One assembly run.
pub struct RunOptions {
    pub mode: Mode,
    /// Build id; `None` resolves the ledger's latest.
    pub build: Option<String>,
    /// Rebuild even if this mode's images already exist.
    pub force: bool,
    /// Ledger root (holds `builds/` and the optional config file).
    pub ledger_root: PathBuf,
    /// Commit store repository.
    pub repo: PathBuf,
}

/// Execute a full run. Returns `Ok(())` both on success and on the
/// "already built, not forced" no-op.
pub fn run(options: &RunOptions) -> Result<()> {
    let config = AssemblerConfig::load(&options.ledger_root)?;
    let ledger = BuildLedger::open(&options.ledger_root)?;
    let store = CommitStore::new(&options.repo);

    // The architecture lives in the metadata record, so resolve by id
    // across arch directories first.
    let build_dir = resolve_build_dir(&ledger, options.build.as_deref())?;
    let meta = ledger.read_metadata(&build_dir)?;
    let arch: Architecture = meta.basearch.parse()?;
    let tag = format!("[{}:{}:{}]", options.mode.as_str(), meta.build_id, arch.as_str());

    if !options.force && has_all_kinds(&meta, options.mode) {
        println!("{tag} images already built; skipping (use --force to rebuild)");
        return Ok(());
    }

    preflight::check_host_tools(arch, options.mode)?;

    println!("{tag} assembling ISO for commit {}", meta.commit);
    let tree = WorkTree::create(&build_dir, options.mode, arch.as_str())?;

    let payloads = extract::extract_boot_payloads(&store, &meta.commit, &tree.images_dir())?;

    if options.mode == Mode::Live {
        store
            .checkout(&meta.commit, "/", &tree.rootfs_dir())
            .context("checking out live root filesystem")?;
        live::append_live_payload(
            &payloads.initramfs,
            &tree.rootfs_dir(),
            &tree.scratch_dir(),
            &config.live,
        )?;
    }

    let kargs = filter_kargs(meta.kernel_arguments.as_deref().unwrap_or(""));

    let request = ComposeRequest {
        store: &store,
        commit: &meta.commit,
        arch,
        mode: options.mode,
        volume_id: compose::volume_id(&meta.name, &meta.build_id),
        kargs,
    };
    let iso = compose::compose(&request, &tree, &payloads)?;

    if options.mode == Mode::Live && arch.supports_config_slot() {
        let initramfs_size = fs::metadata(&payloads.initramfs)
            .context("sizing padded initramfs")?
            .len();
        embed::embed_config_slot(&iso, initramfs_size)?;
    }

    finalize::finalize(&ledger, &build_dir, &meta, options.mode, &iso, &payloads)?;

    println!("{tag} done");
    Ok(())
}

fn resolve_build_dir(ledger: &BuildLedger, build: Option<&str>) -> Result<PathBuf> {
    // The ledger keys build directories by (id, basearch) but a run is
    // addressed by id alone; probe the known architectures.
    for arch in ["x86_64", "aarch64", "ppc64le", "s390x"] {
        if let Ok(dir) = ledger.resolve(build, arch) {
            return Ok(dir);
        }
    }
    match build {
        Some(id) => anyhow::bail!("no build directory found for '{id}'"),
        None => anyhow::bail!("no latest build found in ledger"),
    }
}

fn has_all_kinds(meta: &crate::ledger::BuildMetadata, mode: Mode) -> bool {
    mode.image_kinds()
        .iter()
        .all(|kind| meta.images.contains_key(kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ImageArtifact;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn seed_ledger(kinds: &[&str]) -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("builds/99.9/x86_64");
        fs::create_dir_all(&dir).unwrap();
        let images: BTreeMap<String, ImageArtifact> = kinds
            .iter()
            .map(|k| {
                (
                    k.to_string(),
                    ImageArtifact {
                        path: format!("{k}.bin"),
                        sha256: "00".repeat(32),
                        size: Some(1),
                    },
                )
            })
            .collect();
        let meta = serde_json::json!({
            "buildid": "99.9",
            "name": "fedora-coreos",
            "ostree-commit": "ab".repeat(32),
            "basearch": "x86_64",
            "images": images,
        });
        fs::write(
            dir.join("meta.json"),
            serde_json::to_vec_pretty(&meta).unwrap(),
        )
        .unwrap();
        (tmp, dir)
    }

    #[test]
    fn mode_kind_namespaces() {
        assert_eq!(Mode::Installer.image_kind("iso"), "iso");
        assert_eq!(Mode::Live.image_kind("iso"), "live-iso");
        assert_eq!(
            Mode::Live.image_kinds(),
            ["live-iso", "live-kernel", "live-initramfs"]
        );
    }

    #[test]
    fn already_built_is_a_noop() {
        let (tmp, dir) = seed_ledger(&["live-iso", "live-kernel", "live-initramfs"]);
        let before = fs::read(dir.join("meta.json")).unwrap();

        let options = RunOptions {
            mode: Mode::Live,
            build: Some("99.9".to_string()),
            force: false,
            ledger_root: tmp.path().to_path_buf(),
            repo: tmp.path().join("repo"),
        };
        run(&options).unwrap();

        // no metadata change, no new files next to the record
        assert_eq!(fs::read(dir.join("meta.json")).unwrap(), before);
        let entries: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec!["meta.json"]);
    }

    #[test]
    fn installer_images_do_not_satisfy_live_runs() {
        let (_tmp, dir) = seed_ledger(&["iso", "kernel", "initramfs"]);
        let ledger = BuildLedger::open(dir.ancestors().nth(3).unwrap()).unwrap();
        let meta = ledger.read_metadata(&dir).unwrap();
        assert!(has_all_kinds(&meta, Mode::Installer));
        assert!(!has_all_kinds(&meta, Mode::Live));
    }
}
