/*
 * Copyright 2024 Oxide Computer Company
 */

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use asyncbuild_common::*;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct ConfigFile {
    /**
     * The concurrency cap: how many jobs may be PENDING or SUBMITTED at once.
     */
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
    /**
     * The build host, reachable over SSH, on which commands run.
     */
    pub async_agent: String,
    /**
     * Namespace under which per-job scratch directories are created.  If
     * not set, scratch directories go in the home directory of the user
     * that submitted the job.
     */
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_ssh")]
    pub ssh: String,
    #[serde(default = "default_sshpass")]
    pub sshpass: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
}

fn default_max_jobs() -> usize {
    10
}

fn default_port() -> u16 {
    22
}

fn default_ssh() -> String {
    "ssh".to_string()
}

fn default_sshpass() -> String {
    "sshpass".to_string()
}

fn default_poll_interval_secs() -> u64 {
    1
}

fn default_sync_interval_secs() -> u64 {
    2
}

impl ConfigFile {
    pub fn check(&self) -> Result<()> {
        if self.async_agent.trim().is_empty() {
            bail!("async_agent must be set to the build host address");
        }
        if self.async_agent.contains('/') {
            bail!("async_agent {:?} may not contain '/'", self.async_agent);
        }
        if self.max_jobs == 0 {
            bail!("max_jobs must be at least 1");
        }
        if let Some(ws) = &self.workspace {
            if !ws.is_absolute() {
                bail!("workspace {:?} must be an absolute path", ws);
            }
        }
        /*
         * Cancellation is only observed at poll ticks, so a long tick means a
         * long wait before a cancelled job lets go of its resources.
         */
        if !(1..=5).contains(&self.poll_interval_secs) {
            bail!("poll_interval_secs must be between 1 and 5");
        }
        if self.sync_interval_secs == 0 {
            bail!("sync_interval_secs must be at least 1");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

pub fn load<P: AsRef<Path>>(path: P) -> Result<ConfigFile> {
    let cf: ConfigFile = read_toml(path.as_ref())?;
    cf.check()?;
    Ok(cf)
}
