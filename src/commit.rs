//! Commit store access.
//!
//! The OS image lives in a content-addressable store browsable by path
//! at a given commit hash. Listing and checkout go through the external
//! store tool; this module only shapes the arguments and parses the
//! listing output.

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::process::Cmd;

#[derive(Debug, Clone)]
pub struct CommitStore {
    repo: PathBuf,
}

impl CommitStore {
    pub fn new(repo: &Path) -> Self {
        Self {
            repo: repo.to_path_buf(),
        }
    }

    /// List the entries at `path` in `commit`, in the store's own
    /// (lexical) order. Entry names are bare, without the leading path.
    pub fn list(&self, commit: &str, path: &str) -> Result<Vec<String>> {
        let out = Cmd::new("ostree")
            .arg("ls")
            .args(["--repo", &self.repo.display().to_string()])
            .arg("--nul-filenames-only")
            .arg(commit)
            .arg(path)
            .error_msg("ostree ls failed. Install ostree.")
            .run()?;

        Ok(out
            .stdout
            .split('\0')
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                entry
                    .rsplit('/')
                    .next()
                    .unwrap_or(entry)
                    .to_string()
            })
            .collect())
    }

    /// Check out `subpath` of `commit` into `dest`.
    ///
    /// User-mode checkout: no special privileges, ownership is the
    /// calling user, which is why callers normalize permissions
    /// themselves afterwards.
    pub fn checkout(&self, commit: &str, subpath: &str, dest: &Path) -> Result<()> {
        Cmd::new("ostree")
            .arg("checkout")
            .args(["--repo", &self.repo.display().to_string()])
            .arg("--user-mode")
            .arg(format!("--subpath={subpath}"))
            .arg(commit)
            .arg_path(dest)
            .error_msg("ostree checkout failed. Install ostree.")
            .run()?;
        Ok(())
    }
}
