//! Telling the proxy to pick up a new configuration.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, info};

use crate::config::ReloadConfig;
use crate::{Error, Result};

/// Something that makes the proxy reload its configuration
#[async_trait]
pub trait ReloadSignal: Send + Sync {
    /// Deliver the reload request.
    ///
    /// # Errors
    ///
    /// `Error::Reload` when no proxy could be told.
    async fn reload(&self) -> Result<()>;
}

/// Build the signal described by `config`
#[must_use]
pub fn from_config(config: &ReloadConfig) -> Box<dyn ReloadSignal> {
    match &config.command {
        Some(argv) if !argv.is_empty() => Box::new(CommandReload::new(argv.clone())),
        _ => Box::new(ProcessSignal::new(&config.process_match, &config.proc_root)),
    }
}

/// Sends `SIGHUP` to the proxy master process found under procfs
#[derive(Debug, Clone)]
pub struct ProcessSignal {
    process_match: String,
    proc_root: PathBuf,
}

impl ProcessSignal {
    /// Signal processes whose command line contains `process_match`
    #[must_use]
    pub fn new(process_match: &str, proc_root: &Path) -> Self {
        Self {
            process_match: process_match.to_string(),
            proc_root: proc_root.to_path_buf(),
        }
    }

    /// Lowest pid whose command line contains the marker
    ///
    /// # Errors
    ///
    /// `Error::Reload` if procfs cannot be read or nothing matches.
    pub fn find_pid(&self) -> Result<i32> {
        let entries = fs::read_dir(&self.proc_root).map_err(|e| {
            Error::Reload(format!("cannot scan {}: {e}", self.proc_root.display()))
        })?;

        let mut pids: Vec<i32> = entries
            .filter_map(std::result::Result::ok)
            .filter_map(|entry| {
                let pid: i32 = entry.file_name().to_str()?.parse().ok()?;
                let raw = fs::read(entry.path().join("cmdline")).ok()?;
                let cmdline = String::from_utf8_lossy(&raw).replace('\0', " ");
                cmdline.contains(&self.process_match).then_some(pid)
            })
            .collect();
        pids.sort_unstable();

        pids.first().copied().ok_or_else(|| {
            Error::Reload(format!("no process matching '{}'", self.process_match))
        })
    }
}

#[async_trait]
impl ReloadSignal for ProcessSignal {
    async fn reload(&self) -> Result<()> {
        let pid = self.find_pid()?;
        kill(Pid::from_raw(pid), Signal::SIGHUP)
            .map_err(|e| Error::Reload(format!("SIGHUP to pid {pid} failed: {e}")))?;
        info!(pid, "sent SIGHUP to proxy");
        Ok(())
    }
}

/// Runs a fixed command, e.g. `nginx -s reload`
#[derive(Debug, Clone)]
pub struct CommandReload {
    argv: Vec<String>,
}

impl CommandReload {
    /// Command to run; the first element is the program
    #[must_use]
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

#[async_trait]
impl ReloadSignal for CommandReload {
    async fn reload(&self) -> Result<()> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| Error::Reload("empty reload command".to_string()))?;
        debug!(program = %program, ?args, "running reload command");

        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Reload(format!("cannot run {program}: {e}")))?;

        if !output.status.success() {
            return Err(Error::Reload(format!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!(program = %program, "reload command succeeded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_proc(entries: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (pid, cmdline) in entries {
            let proc_dir = dir.path().join(pid);
            fs::create_dir_all(&proc_dir).unwrap();
            fs::write(proc_dir.join("cmdline"), cmdline).unwrap();
        }
        fs::create_dir_all(dir.path().join("self")).unwrap();
        dir
    }

    #[test]
    fn finds_master_process() {
        let proc_root = fake_proc(&[
            ("412", "nginx: worker process\0"),
            ("97", "nginx: master process /usr/sbin/nginx -g daemon off;\0"),
            ("1", "/sbin/tini\0--\0"),
        ]);
        let signal = ProcessSignal::new("nginx: master", proc_root.path());
        assert_eq!(signal.find_pid().unwrap(), 97);
    }

    #[test]
    fn missing_process_is_a_reload_error() {
        let proc_root = fake_proc(&[("1", "/sbin/tini\0")]);
        let signal = ProcessSignal::new("nginx: master", proc_root.path());
        let err = signal.find_pid().unwrap_err();
        assert!(err.is_reload());
    }

    #[tokio::test]
    async fn unreadable_proc_root_is_a_reload_error() {
        let signal = ProcessSignal::new("nginx: master", Path::new("/nonexistent/proc"));
        assert!(signal.reload().await.unwrap_err().is_reload());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_reload_reports_exit_status() {
        assert!(CommandReload::new(vec!["true".into()]).reload().await.is_ok());
        let err = CommandReload::new(vec!["false".into()]).reload().await.unwrap_err();
        assert!(err.is_reload());
        let err = CommandReload::new(Vec::new()).reload().await.unwrap_err();
        assert!(err.is_reload());
    }
}
