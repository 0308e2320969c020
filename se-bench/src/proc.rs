// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use log::{debug, warn};
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use crate::run::{ProcHandle, ProcOps};
use se_util::{run_command, sh_output};

/// Bracket the pattern's first character so the command lines of the shell
/// and ssh wrappers carrying the pattern never match it themselves. Without
/// this `pgrep -f` counts its own wrapper and a dead process still shows up
/// as running.
fn grep_pattern(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => format!("[{}]{}", first, chars.as_str()),
        None => String::new(),
    }
}

/// Shell-level process operations. The server always runs on this host in its
/// own process group; the client runs here too unless a remote host is
/// configured, in which case it is driven through ssh with the local end's
/// stdout captured into the client output file.
pub struct ShellProcs {
    remote: Option<String>,
    client_out: PathBuf,
    children: Vec<Child>,
}

impl ShellProcs {
    pub fn new(remote: Option<&str>, client_out: &str) -> Self {
        Self {
            remote: remote.map(Into::into),
            client_out: client_out.into(),
            children: Vec::new(),
        }
    }

    fn spawn_local(&mut self, cmd: &str, out: Option<fs::File>) -> Result<ProcHandle> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd).process_group(0);
        if let Some(f) = out {
            command
                .stdout(Stdio::from(f.try_clone()?))
                .stderr(Stdio::from(f));
        }
        let child = command
            .spawn()
            .with_context(|| format!("spawning {:?}", cmd))?;
        let handle = ProcHandle {
            pid: Some(child.id() as i32),
            name: cmd.split_whitespace().next().unwrap_or("").to_string(),
        };
        self.children.push(child);
        Ok(handle)
    }

    fn spawn_remote(&mut self, host: &str, cmd: &str, out: fs::File) -> Result<ProcHandle> {
        let child = Command::new("ssh")
            .arg(host)
            .arg(cmd)
            .stdout(Stdio::from(out.try_clone()?))
            .stderr(Stdio::from(out))
            .spawn()
            .with_context(|| format!("spawning ssh {} {:?}", host, cmd))?;
        let handle = ProcHandle {
            pid: Some(child.id() as i32),
            name: format!("ssh:{}", host),
        };
        self.children.push(child);
        Ok(handle)
    }

    fn pgrep_count(&self, remote: bool, name: &str) -> Result<u64> {
        let pat = grep_pattern(name);

        // pgrep exits non-zero when nothing matches; that's a count of zero,
        // not an error.
        let out = match (remote, self.remote.as_ref()) {
            (true, Some(host)) => Command::new("ssh")
                .arg(host)
                .arg(format!("pgrep -f -c '{}'", &pat))
                .output()?,
            _ => Command::new("pgrep").args(&["-f", "-c", &pat]).output()?,
        };
        let count = String::from_utf8_lossy(&out.stdout)
            .trim()
            .parse::<u64>()
            .unwrap_or(0);
        debug!("pgrep: {} instances of {:?}", count, name);
        Ok(count)
    }

    fn pkill(&self, remote: bool, name: &str) {
        let pkill = format!("sudo pkill -f '{}'", grep_pattern(name));
        let cmd = match (remote, self.remote.as_ref()) {
            (true, Some(host)) => format!("ssh {} \"{}\"", host, &pkill),
            _ => pkill,
        };
        se_util::sh_ignore_error(&cmd);
    }

    fn reap(&mut self) {
        self.children
            .retain_mut(|child| !matches!(child.try_wait(), Ok(Some(_))));
    }

    /// Batch-level cleanup: kill anything left over from a previous run on
    /// both hosts, including a stale block tracer.
    pub fn kill_leftovers(&mut self, names: &[&str]) {
        for name in names {
            self.pkill(false, name);
            if self.remote.is_some() {
                self.pkill(true, name);
            }
        }
        self.pkill(false, "blktrace");
        self.reap();
    }

    pub fn remove_client_out(&self) {
        if let Err(e) = fs::remove_file(&self.client_out) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove {:?} ({})", &self.client_out, &e);
            }
        }
    }

    pub fn archive_client_output(&self, dir: &Path) -> Result<()> {
        fs::copy(&self.client_out, dir.join("client.out"))
            .with_context(|| format!("archiving {:?}", &self.client_out))?;
        Ok(())
    }

    /// Mirror the workload file to the client host at the same path before
    /// the treatment starts. No-op when the client runs locally.
    pub fn sync_workload(&self, query_path: &str) -> Result<()> {
        if let Some(host) = self.remote.as_ref() {
            run_command(
                Command::new("rsync")
                    .args(&["-a", query_path])
                    .arg(rsync_dest(host, query_path)),
                "is rsync installed on both hosts?",
            )?;
        }
        Ok(())
    }
}

fn rsync_dest(host: &str, query_path: &str) -> String {
    format!("{}:{}", host, query_path)
}

impl ProcOps for ShellProcs {
    fn start_server(&mut self, cmd: &str) -> Result<ProcHandle> {
        self.spawn_local(cmd, None)
    }

    fn start_client(&mut self, cmd: &str) -> Result<ProcHandle> {
        let out = fs::File::create(&self.client_out)
            .with_context(|| format!("creating {:?}", &self.client_out))?;
        match self.remote.clone() {
            Some(host) => self.spawn_remote(&host, cmd, out),
            None => self.spawn_local(cmd, Some(out)),
        }
    }

    fn server_running(&self, name: &str) -> Result<bool> {
        Ok(self.pgrep_count(false, name)? > 0)
    }

    fn client_running(&self, name: &str) -> Result<bool> {
        Ok(self.pgrep_count(true, name)? > 0)
    }

    fn port_open(&self, name: &str) -> Result<bool> {
        let out = sh_output(&format!(
            "sudo netstat -ap 2>/dev/null | grep {} | wc -l",
            name
        ))?;
        Ok(out.trim().parse::<u64>().unwrap_or(0) > 0)
    }

    fn terminate_client(&mut self, name: &str) -> Result<()> {
        self.pkill(self.remote.is_some(), name);
        self.reap();
        Ok(())
    }

    fn interrupt_server_group(&self, handle: &ProcHandle) -> Result<()> {
        let pid = match handle.pid {
            Some(pid) => pid,
            None => return Ok(()),
        };
        // The server was spawned as its own process group leader.
        let rc = unsafe { libc::killpg(pid, libc::SIGINT) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            // Already gone counts as interrupted.
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err).with_context(|| format!("killpg({}, SIGINT)", pid));
            }
        }
        Ok(())
    }

    fn client_tail(&self) -> Result<Option<String>> {
        let text = match fs::read_to_string(&self.client_out) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(text.lines().last().map(|v| v.trim_end().to_string()))
    }

    fn client_output(&self) -> Result<String> {
        match fs::read_to_string(&self.client_out) {
            Ok(v) => Ok(v),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_tail_and_output() {
        let path = std::env::temp_dir().join("se-bench-proc-tail-test");
        let procs = ShellProcs::new(None, path.to_str().unwrap());

        procs.remove_client_out();
        assert_eq!(procs.client_tail().unwrap(), None);
        assert_eq!(procs.client_output().unwrap(), "");

        fs::write(&path, "line one\nExperimentFinished!!!\n").unwrap();
        assert_eq!(
            procs.client_tail().unwrap().as_deref(),
            Some("ExperimentFinished!!!")
        );
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_grep_pattern() {
        assert_eq!(grep_pattern("java"), "[j]ava");
        assert_eq!(grep_pattern("fts_server"), "[f]ts_server");
        assert_eq!(grep_pattern(""), "");
    }

    #[test]
    fn test_liveness_no_false_positive() {
        let procs = ShellProcs::new(None, "/tmp/se-bench-liveness-test");

        // A name no process on the system carries must count as not running,
        // even though the query itself mentions it.
        assert!(!procs.server_running("zzz_no_such_proc_qq").unwrap());

        // Positive control with a process we own.
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(procs.server_running("sleep 30").unwrap());
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_rsync_dest() {
        assert_eq!(
            rsync_dest("bench1", "/mnt/ssd/short_log"),
            "bench1:/mnt/ssd/short_log"
        );
    }
}
