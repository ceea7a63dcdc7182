//! The init role.
//!
//! Runs as an init container ahead of the sidecar & main containers: creates
//! the FIFO pair and working directories on the shared volume, and checks out
//! the configured repository for git-sourced steps.

use std::path::Path;

use anyhow::{bail, Context, Result};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tokio::process::Command;

use crate::config::Config;
use dataflow_core::crd::Processor;
use dataflow_core::{PATH_FIFO_IN, PATH_FIFO_OUT, PATH_GROUPS, PATH_VAR_RUN, PATH_WORKING_DIR};

pub async fn run(config: &Config) -> Result<()> {
    tokio::fs::create_dir_all(PATH_VAR_RUN).await.context("error creating shared volume dir")?;
    tokio::fs::create_dir_all(PATH_GROUPS).await.context("error creating groups dir")?;
    make_fifo(PATH_FIFO_IN)?;
    make_fifo(PATH_FIFO_OUT)?;
    tracing::info!("created FIFOs");

    let step = config.step()?;
    if let Processor::Git(git) = &step.spec.processor {
        checkout(&git.url, &git.branch, &git.path).await?;
    }

    Ok(())
}

/// Create a named pipe at the given path, tolerating an existing one.
fn make_fifo(path: &str) -> Result<()> {
    match mkfifo(path, Mode::S_IRWXU | Mode::S_IRGRP | Mode::S_IWGRP) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(err) => Err(err).with_context(|| format!("error creating FIFO {}", path)),
    }
}

/// Shallow-clone the given branch into the working dir.
async fn checkout(url: &str, branch: &str, path: &str) -> Result<()> {
    tracing::info!(url = %url, branch = %branch, "checking out git source");
    let staging = format!("{}/repo", PATH_VAR_RUN);
    let output = Command::new("git")
        .args(&["clone", "--depth", "1", "--branch", branch, "--single-branch", url, &staging])
        .output()
        .await
        .context("error running git clone")?;
    if !output.status.success() {
        bail!("git clone failed: {}", String::from_utf8_lossy(&output.stderr));
    }

    // The configured path within the repository becomes the working dir.
    let source = if path == "." { staging.clone() } else { format!("{}/{}", staging, path) };
    if !Path::new(&source).is_dir() {
        bail!("configured git path {:?} does not exist in the repository", path);
    }
    tokio::fs::rename(&source, PATH_WORKING_DIR)
        .await
        .with_context(|| format!("error moving checkout into {}", PATH_WORKING_DIR))?;
    Ok(())
}
