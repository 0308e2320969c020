// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use std::process::Command;

use se_util::{read_cgroup_flat_keyed_file, read_one_line, run_command, MB};

pub const CGROUP_MOUNT: &str = "/sys/fs/cgroup";

fn sudo_write_cmd(path: &str, val: &str) -> String {
    format!("echo {} | sudo tee {} > /dev/null", val, path)
}

/// Write a root-owned sysfs/procfs file. The harness itself runs unprivileged
/// and reaches everything privileged through sudo, same as the process and
/// cgroup operations.
fn sudo_write(path: &str, val: &str) -> Result<()> {
    run_command(
        Command::new("sh").arg("-c").arg(sudo_write_cmd(path, val)),
        "is passwordless sudo configured?",
    )
}

/// Resource-controller precondition failure. Unlike everything else in a
/// treatment this terminates the whole batch; the memory ceiling is what the
/// experiment is about and running without it would silently measure nothing.
#[derive(Debug, thiserror::Error)]
#[error("resource controller setup failed: {0:#}")]
pub struct SetupError(#[from] anyhow::Error);

/// Memory cgroup confining the server process group.
#[derive(Debug, Clone)]
pub struct MemCgroup {
    name: String,
}

impl MemCgroup {
    /// Create (or reuse) the cgroup and apply the treatment's memory ceiling
    /// and swappiness.
    pub fn setup(name: &str, limit_bytes: u64, swappiness: u32) -> Result<Self, SetupError> {
        let cg = Self::attach(name);
        run_command(
            Command::new("sudo")
                .args(&["cgcreate", "-g"])
                .arg(format!("memory:{}", name)),
            "is cgcreate (libcgroup-tools) available?",
        )?;
        cg.set_knob("memory.limit_in_bytes", &limit_bytes.to_string())?;
        cg.set_knob("memory.swappiness", &swappiness.to_string())?;
        Ok(cg)
    }

    /// Handle to an already-set-up cgroup, e.g. for telemetry reads.
    pub fn attach(name: &str) -> Self {
        Self { name: name.into() }
    }

    fn knob_path(&self, knob: &str) -> String {
        format!("{}/memory/{}/{}", CGROUP_MOUNT, &self.name, knob)
    }

    fn set_knob(&self, knob: &str, val: &str) -> Result<()> {
        let path = self.knob_path(knob);
        sudo_write(&path, val).with_context(|| format!("writing {:?}", &path))?;

        // The kernel may clamp the value (e.g. the limit rounds to page
        // granularity); surface that instead of failing.
        let back = read_one_line(&path)?;
        if back.trim() != val {
            warn!("cgroup: {} reads back {:?} after writing {:?}", knob, back.trim(), val);
        }
        debug!("cgroup: {} = {}", knob, val);
        Ok(())
    }

    /// Command prefix confining a process group into this cgroup.
    pub fn exec_prefix(&self) -> String {
        format!("sudo cgexec -g memory:{} --sticky ", &self.name)
    }

    /// Instantaneous page-cache charge of the cgroup in megabytes.
    pub fn page_cache_mb(&self) -> Result<u64> {
        let stat = read_cgroup_flat_keyed_file(&self.knob_path("memory.stat"))?;
        let bytes = stat
            .get("cache")
            .copied()
            .ok_or_else(|| anyhow!("no cache key in memory.stat"))?;
        Ok(bytes / MB)
    }
}

pub fn set_read_ahead_kb(device: &str, kb: u32) -> Result<(), SetupError> {
    let path = format!("/sys/block/{}/queue/read_ahead_kb", device);
    Ok(sudo_write(&path, &kb.to_string()).with_context(|| format!("writing {:?}", &path))?)
}

pub fn set_swap(enable: bool) -> Result<(), SetupError> {
    let (subcmd, emsg) = match enable {
        true => ("swapon", "failed to enable swap"),
        false => ("swapoff", "failed to disable swap"),
    };
    Ok(run_command(
        Command::new("sudo").args(&[subcmd, "-a"]),
        emsg,
    )?)
}

pub fn drop_caches() -> Result<(), SetupError> {
    let mut sync = Command::new("sync");
    run_command(&mut sync, "sync failed")?;
    Ok(sudo_write("/proc/sys/vm/drop_caches", "3")
        .context("writing /proc/sys/vm/drop_caches")?)
}
