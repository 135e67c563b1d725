// Supervised child processes (dnsmasq, forkdns, forkproxy).
//
// The supervisor value holds the child handle for the daemon's lifetime; the
// pidfile on disk is a recovery hint for crash restart. A pid read back from
// disk is never signalled without first comparing /proc/<pid>/cmdline against
// the argv we recorded, so a stale pidfile can't kill an unrelated process.

use crate::net::error::{NetworkError, NetworkResult};
use crate::utils::fs::{remove_if_exists, write_atomic};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub struct Supervisor {
    cmd: String,
    args: Vec<String>,
    pidfile: PathBuf,
    log_path: Option<PathBuf>,
    child: Option<tokio::process::Child>,
}

impl Supervisor {
    pub fn new(cmd: &str, args: Vec<String>, pidfile: &Path, log_path: Option<&Path>) -> Self {
        Self {
            cmd: cmd.to_string(),
            args,
            pidfile: pidfile.to_path_buf(),
            log_path: log_path.map(|p| p.to_path_buf()),
            child: None,
        }
    }

    /// Spawn the child and write the pidfile atomically once the process
    /// exists. stdout/stderr go to the log file when one is configured.
    pub async fn start(&mut self) -> NetworkResult<()> {
        let mut command = tokio::process::Command::new(&self.cmd);
        command.args(&self.args);

        if let Some(log) = &self.log_path {
            let out = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log)
                .map_err(NetworkError::Io)?;
            let err = out.try_clone().map_err(NetworkError::Io)?;
            command.stdout(out).stderr(err);
        }

        let child = command.spawn().map_err(NetworkError::Io)?;
        let pid = match child.id() {
            Some(p) => p,
            None => {
                return Err(NetworkError::Command {
                    cmd: self.cmd.clone(),
                    stderr: "child exited before pid could be recorded".into(),
                })
            }
        };

        if let Err(e) = write_atomic(&self.pidfile, format!("{}\n", pid).as_bytes()) {
            // Could not record the child; kill it rather than leak it.
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            return Err(e);
        }

        self.child = Some(child);
        Ok(())
    }

    /// Stop the child: SIGTERM, bounded wait, then SIGKILL. Falls back to
    /// the pidfile (with cmdline verification) when we hold no handle.
    pub async fn stop(&mut self, timeout: Duration) -> NetworkResult<()> {
        let pid = match self.child.take() {
            Some(child) => child.id().map(|p| Pid::from_raw(p as i32)),
            None => adopt(&self.pidfile, &self.expected_argv())?,
        };

        let pid = match pid {
            Some(p) => p,
            None => {
                remove_if_exists(&self.pidfile)?;
                return Ok(());
            }
        };

        terminate(pid, timeout).await;
        remove_if_exists(&self.pidfile)?;
        Ok(())
    }

    fn expected_argv(&self) -> Vec<String> {
        let mut argv = vec![self.cmd.clone()];
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// Read a pidfile and verify the process behind it still runs our command.
/// Returns None (and removes the pidfile silently) when the pid is dead or
/// the cmdline no longer matches the recorded argv prefix.
pub fn adopt(pidfile: &Path, expected_argv: &[String]) -> NetworkResult<Option<Pid>> {
    let contents = match std::fs::read_to_string(pidfile) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e)),
    };

    let pid: i32 = match contents.trim().parse() {
        Ok(p) => p,
        Err(_) => {
            remove_if_exists(pidfile)?;
            return Ok(None);
        }
    };

    if !verify_cmdline(pid, expected_argv) {
        remove_if_exists(pidfile)?;
        return Ok(None);
    }

    Ok(Some(Pid::from_raw(pid)))
}

/// Compare /proc/<pid>/cmdline against an expected argv prefix. The command
/// itself is matched on its basename so "/usr/sbin/dnsmasq" satisfies an
/// expected "dnsmasq".
pub fn verify_cmdline(pid: i32, expected_argv: &[String]) -> bool {
    let cmdline = match std::fs::read(format!("/proc/{}/cmdline", pid)) {
        Ok(c) => c,
        Err(_) => return false,
    };

    let actual: Vec<String> = cmdline
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).to_string())
        .collect();

    if actual.is_empty() || expected_argv.is_empty() {
        return false;
    }

    if basename(&actual[0]) != basename(&expected_argv[0]) {
        return false;
    }

    for (i, expected) in expected_argv.iter().enumerate().skip(1) {
        match actual.get(i) {
            Some(a) if a == expected => {}
            _ => return false,
        }
    }

    true
}

/// SIGTERM, wait up to `timeout`, then SIGKILL.
pub async fn terminate(pid: Pid, timeout: Duration) {
    if !is_running(pid) {
        return;
    }

    let _ = signal::kill(pid, Signal::SIGTERM);

    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !is_running(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    if is_running(pid) {
        let _ = signal::kill(pid, Signal::SIGKILL);
    }
}

/// Kill a process recorded in a pidfile outright (SIGKILL), verifying the
/// cmdline first, then unlink the pidfile.
pub fn kill_from_pidfile(pidfile: &Path, expected_argv: &[String]) -> NetworkResult<()> {
    if let Some(pid) = adopt(pidfile, expected_argv)? {
        let _ = signal::kill(pid, Signal::SIGKILL);
    }
    remove_if_exists(pidfile)?;
    Ok(())
}

pub fn is_running(pid: Pid) -> bool {
    signal::kill(pid, None).is_ok()
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn own_argv0() -> String {
        std::env::args().next().unwrap()
    }

    #[test]
    fn cmdline_matches_own_process() {
        let pid = std::process::id() as i32;
        assert!(verify_cmdline(pid, &[own_argv0()]));
    }

    #[test]
    fn cmdline_rejects_wrong_command() {
        let pid = std::process::id() as i32;
        assert!(!verify_cmdline(pid, &["definitely-not-this-binary".to_string()]));
    }

    #[test]
    fn cmdline_rejects_wrong_args() {
        let pid = std::process::id() as i32;
        let argv = vec![own_argv0(), "argument-we-never-passed".to_string()];
        assert!(!verify_cmdline(pid, &argv));
    }

    #[test]
    fn stale_pidfile_removed_without_signal() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("stale.pid");

        // Points at our own process but records a different command, so the
        // adoption must refuse to hand back a pid and must clean up the file.
        std::fs::write(&pidfile, format!("{}\n", std::process::id())).unwrap();
        let got = adopt(&pidfile, &["some-other-daemon".to_string()]).unwrap();
        assert!(got.is_none());
        assert!(!pidfile.exists());
    }

    #[test]
    fn dead_pid_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("dead.pid");
        // Far beyond pid_max on any reasonable system.
        std::fs::write(&pidfile, "67108863\n").unwrap();
        let got = adopt(&pidfile, &[own_argv0()]).unwrap();
        assert!(got.is_none());
    }
}
