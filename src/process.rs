//! Process probe for the target client.
//!
//! Matching is by process name only. Processes the current user is not
//! allowed to see or signal are indistinguishable from processes that do not
//! exist: both report "not running" / "nothing stopped". Callers must treat
//! a negative answer as best-effort.

use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use crate::config::Config;

/// What the engine needs to know about the running client
pub trait ProcessProbe: Send + Sync {
    /// Whether any process matching the client name is alive. Never fails.
    fn is_running(&self) -> bool;

    /// Terminate every matching process, then wait for the settle delay.
    /// Returns whether anything was found to stop.
    fn request_stop(&self) -> bool;

    /// Start the client, optionally with a region argument. Returns whether
    /// the launch command was issued, not whether the client came up.
    fn launch(&self, region_hint: Option<&str>) -> bool;
}

/// A process seen in the system process list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
}

/// Probe backed by the OS process list
#[derive(Debug, Clone)]
pub struct SystemProbe {
    name_pattern: String,
    launcher: PathBuf,
    settle: Duration,
}

impl SystemProbe {
    pub fn new(name_pattern: impl Into<String>, launcher: PathBuf, settle: Duration) -> Self {
        Self {
            name_pattern: name_pattern.into().to_lowercase(),
            launcher,
            settle,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.process_name.clone(),
            config.launcher.clone(),
            config.stop_settle(),
        )
    }

    fn matching(&self) -> Vec<ProcessEntry> {
        match list_processes() {
            Ok(procs) => procs
                .into_iter()
                .filter(|p| matches_name(&p.name, &self.name_pattern))
                .collect(),
            Err(e) => {
                tracing::debug!("Process listing failed: {e:#}");
                Vec::new()
            }
        }
    }
}

impl ProcessProbe for SystemProbe {
    fn is_running(&self) -> bool {
        !self.matching().is_empty()
    }

    fn request_stop(&self) -> bool {
        let procs = self.matching();
        if procs.is_empty() {
            return false;
        }

        let mut stopped = false;
        for proc in &procs {
            match terminate(proc.pid) {
                Ok(()) => {
                    tracing::info!(pid = proc.pid, name = %proc.name, "Terminated client process");
                    stopped = true;
                }
                Err(e) => tracing::debug!(pid = proc.pid, "Terminate failed: {e:#}"),
            }
        }

        if stopped {
            thread::sleep(self.settle);
        }
        stopped
    }

    fn launch(&self, region_hint: Option<&str>) -> bool {
        if !self.launcher.exists() {
            tracing::warn!(launcher = %self.launcher.display(), "Launcher not found");
            return false;
        }

        let mut cmd = Command::new(&self.launcher);
        if let Some(region) = region_hint {
            cmd.arg(format!("--setregion={}", region));
        }
        match cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => {
                tracing::info!(pid = child.id(), region = ?region_hint, "Launched client");
                true
            }
            Err(e) => {
                tracing::warn!("Failed to launch client: {e}");
                false
            }
        }
    }
}

fn matches_name(name: &str, pattern: &str) -> bool {
    name.to_lowercase().contains(pattern)
}

#[cfg(windows)]
fn list_processes() -> Result<Vec<ProcessEntry>> {
    let output = Command::new("tasklist")
        .args(["/FO", "CSV", "/NH"])
        .stderr(Stdio::null())
        .output()
        .context("Failed to run tasklist")?;
    if !output.status.success() {
        bail!("tasklist exited with {}", output.status);
    }
    Ok(parse_tasklist_csv(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(not(windows))]
fn list_processes() -> Result<Vec<ProcessEntry>> {
    let output = Command::new("ps")
        .args(["-A", "-o", "pid=,comm="])
        .stderr(Stdio::null())
        .output()
        .context("Failed to run ps")?;
    if !output.status.success() {
        bail!("ps exited with {}", output.status);
    }
    Ok(parse_ps(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `tasklist /FO CSV /NH` output: `"name.exe","1234","Console",...`
pub fn parse_tasklist_csv(output: &str) -> Vec<ProcessEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split("\",\"").map(|f| f.trim_matches('"'));
            let name = fields.next()?.trim();
            let pid = fields.next()?.trim().parse().ok()?;
            (!name.is_empty()).then(|| ProcessEntry {
                pid,
                name: name.to_string(),
            })
        })
        .collect()
}

/// Parse `ps -A -o pid=,comm=` output: `  1234 name`
pub fn parse_ps(output: &str) -> Vec<ProcessEntry> {
    output
        .lines()
        .filter_map(|line| {
            let (pid, name) = line.trim_start().split_once(char::is_whitespace)?;
            Some(ProcessEntry {
                pid: pid.parse().ok()?,
                name: name.trim().to_string(),
            })
        })
        .collect()
}

#[cfg(unix)]
fn terminate(pid: u32) -> Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid).context("PID out of range")?;
    kill(Pid::from_raw(pid), Signal::SIGTERM).context("Failed to send SIGTERM")
}

#[cfg(windows)]
fn terminate(pid: u32) -> Result<()> {
    let status = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .context("Failed to run taskkill")?;
    if !status.success() {
        bail!("taskkill exited with {}", status);
    }
    Ok(())
}
