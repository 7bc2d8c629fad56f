//! External command invocation.
//!
//! Every format-specific tool (squashfs compressor, ISO mastering,
//! checkout, ...) is an opaque subprocess behind this wrapper. Each call
//! is a blocking, synchronous boundary: the calling stage waits for full
//! completion and a success/failure signal, no partial output is ever
//! consumed. Commands are echoed to stderr (`+ <cmdline>`) before running.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};

use crate::error::AssembleError;

/// Output of a successfully completed command.
#[derive(Debug)]
pub struct CmdOutput {
    pub stdout: String,
}

/// Builder for a single external tool invocation.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    error_msg: Option<String>,
}

impl Cmd {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            error_msg: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.display().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for a in args {
            self.args.push(a.as_ref().to_string());
        }
        self
    }

    /// Extra context prepended when the tool cannot be spawned.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Run the command, capturing stdout. Nonzero exit becomes
    /// [`AssembleError::ExternalTool`] with the tool's stderr verbatim.
    pub fn run(self) -> Result<CmdOutput> {
        eprintln!("+ {} {}", self.program, self.args.join(" "));

        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .with_context(|| match &self.error_msg {
                Some(msg) => format!("{} (spawning {})", msg, self.program),
                None => format!("spawning {}", self.program),
            })?;

        if !output.status.success() {
            return Err(AssembleError::ExternalTool {
                tool: self.program,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            }
            .into());
        }

        Ok(CmdOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}

/// Run a shell snippet via `sh -c`. Used where the tool contract is a
/// pipe (feeding a file list to cpio). The exit status is the pipeline's
/// last command, so archivers must sit at the end of the pipe.
pub fn shell(script: &str) -> Result<()> {
    eprintln!("+ sh -c {script}");

    let output = Command::new("sh")
        .args(["-c", script])
        .output()
        .context("spawning sh")?;

    if !output.status.success() {
        return Err(AssembleError::ExternalTool {
            tool: "sh".to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        }
        .into());
    }

    Ok(())
}
