use std::path::PathBuf;

use anyhow::{bail, Result};
use iso_assembler::{run, Mode, RunOptions};

fn usage() -> &'static str {
    "Usage:\n  iso-assembler build <installer|live> [--build <ID>] [--force] \
     [--ledger <dir>] [--repo <dir>]"
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.split_first() {
        Some((cmd, rest)) if cmd == "build" => {
            let options = parse_build_args(rest)?;
            run(&options)
        }
        _ => bail!(usage()),
    }
}

fn parse_build_args(args: &[String]) -> Result<RunOptions> {
    let (mode, flags) = match args.split_first() {
        Some((mode, flags)) if mode == "installer" => (Mode::Installer, flags),
        Some((mode, flags)) if mode == "live" => (Mode::Live, flags),
        _ => bail!(usage()),
    };

    let mut options = RunOptions {
        mode,
        build: None,
        force: false,
        ledger_root: PathBuf::from("."),
        repo: PathBuf::from("tmp/repo"),
    };

    let mut iter = flags.iter();
    while let Some(flag) = iter.next() {
        match flag.as_str() {
            "--force" => options.force = true,
            "--build" => {
                options.build = Some(expect_value(&mut iter, "--build")?);
            }
            "--ledger" => {
                options.ledger_root = PathBuf::from(expect_value(&mut iter, "--ledger")?);
            }
            "--repo" => {
                options.repo = PathBuf::from(expect_value(&mut iter, "--repo")?);
            }
            other => bail!("unrecognized argument '{other}'\n{}", usage()),
        }
    }

    Ok(options)
}

fn expect_value<'a>(
    iter: &mut std::slice::Iter<'a, String>,
    flag: &str,
) -> Result<String> {
    match iter.next() {
        Some(value) if !value.starts_with("--") => Ok(value.clone()),
        _ => bail!("{flag} requires a value\n{}", usage()),
    }
}
