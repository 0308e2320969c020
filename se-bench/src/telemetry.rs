// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use log::{info, warn};
use scan_fmt::scan_fmt;
use std::path::PathBuf;
use std::process::{Child, Command};

use crate::cgroup::MemCgroup;
use crate::run::Telemetry;
use se_util::{sh_ignore_error, sh_output};

/// Live resource telemetry for one treatment: instantaneous page-cache charge
/// of the server cgroup and the cumulative KB-read counter of the partition
/// under the server's data.
pub struct SysTelemetry {
    cgroup: MemCgroup,
    partition: String,
}

impl SysTelemetry {
    pub fn new(cgroup_name: &str, partition: &str) -> Self {
        Self {
            cgroup: MemCgroup::attach(cgroup_name),
            partition: partition.into(),
        }
    }
}

impl Telemetry for SysTelemetry {
    fn page_cache_mb(&self) -> Result<u64> {
        self.cgroup.page_cache_mb()
    }

    fn device_kb_read(&self) -> Result<u64> {
        let out = sh_output(&format!("iostat -k {}", &self.partition))?;
        parse_iostat_kb_read(&out, &self.partition)
    }
}

/// Pick the cumulative kB_read column out of the partition's row in
/// `iostat -k` output.
pub fn parse_iostat_kb_read(out: &str, partition: &str) -> Result<u64> {
    for line in out.lines() {
        if !line.starts_with(partition) {
            continue;
        }
        if let Ok((_dev, _tps, _rps, _wps, kb_read, _kb_wrtn)) = scan_fmt!(
            line,
            "{} {f} {f} {f} {d} {d}",
            String,
            f64,
            f64,
            f64,
            u64,
            u64
        ) {
            return Ok(kb_read);
        }
    }
    bail!("no {} row in iostat output", partition);
}

/// Optional block-level I/O trace covering the measured window of a run,
/// started after the server has fully loaded its index.
pub struct BlockTracer {
    device: String,
    outdir: PathBuf,
    child: Option<Child>,
}

impl BlockTracer {
    pub fn new(device: &str, outdir: PathBuf) -> Self {
        Self {
            device: device.into(),
            outdir,
            child: None,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        info!("starting blktrace on /dev/{}", &self.device);
        let child = Command::new("sudo")
            .args(&["blktrace", "-d"])
            .arg(format!("/dev/{}", &self.device))
            .arg("-D")
            .arg(&self.outdir)
            .args(&["-o", "trace"])
            .spawn()
            .context("spawning blktrace")?;
        self.child = Some(child);
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.child.is_none() {
            return;
        }
        sh_ignore_error("sync");
        sh_ignore_error("sudo pkill blktrace");
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.wait() {
                warn!("failed to reap blktrace ({})", &e);
            }
        }
    }
}

impl Drop for BlockTracer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_iostat_kb_read() {
        let out = "Linux 5.8.11 (node1) \t08/26/26 \t_x86_64_\t(40 CPU)\n\
                   \n\
                   avg-cpu:  %user   %nice %system %iowait  %steal   %idle\n\
                   \t0.66    0.00    0.33    0.04    0.00   98.97\n\
                   \n\
                   Device            tps    kB_read/s    kB_wrtn/s    kB_read    kB_wrtn\n\
                   nvme0n1         12.84       512.49        90.39    7340032    1294336\n\
                   nvme0n1p4        9.21       498.10        88.01    6991872    1260544\n";
        assert_eq!(parse_iostat_kb_read(out, "nvme0n1p4").unwrap(), 6991872);
        assert_eq!(parse_iostat_kb_read(out, "nvme0n1").unwrap(), 7340032);
        assert!(parse_iostat_kb_read(out, "sdc1").is_err());
    }
}
