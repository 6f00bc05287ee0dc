use crate::identity::store::IdentityConfig;
use crate::runtime::secret::ElevationSecret;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

/// Verbosity passed to the daemon; enough to diagnose handshake failures
/// without flooding the log file.
const DAEMON_LOG_VERBOSITY: &str = "3";

/// Per-instance locations of the daemon's runtime files.
///
/// Every path is derived from a base directory plus the instance label, so
/// two managers with different labels can never collide on pid, log, or
/// credential files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonPaths {
    pid_file: PathBuf,
    log_file: PathBuf,
    secret_file: PathBuf,
}

impl DaemonPaths {
    pub fn new(state_dir: &Path, label: &str) -> Self {
        Self {
            pid_file: state_dir.join(format!("{label}.pid")),
            log_file: state_dir.join(format!("{label}.log")),
            secret_file: state_dir.join(format!("{label}.auth")),
        }
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    pub fn secret_file(&self) -> &Path {
        &self.secret_file
    }
}

/// Transient credential file handed to the daemon at launch.
///
/// Created immediately before the spawn and removed on drop, so the secret
/// is gone on every exit path whether the launch succeeded or not.
#[derive(Debug)]
pub struct SecretFile {
    path: PathBuf,
}

impl SecretFile {
    pub fn create(path: &Path, username: &str, password: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        std::fs::write(path, format!("{username}\n{password}\n"))
            .with_context(|| format!("failed to write credential file {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).with_context(
                || format!("failed to restrict permissions on {}", path.display()),
            )?;
        }

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SecretFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to remove daemon credential file"
                );
            }
        }
    }
}

/// Removes pid and log files left over from a previous daemon instance so
/// liveness checks cannot read stale state.
pub(crate) fn remove_stale_runtime_files(paths: &DaemonPaths) {
    for path in [paths.pid_file(), paths.log_file()] {
        if let Err(err) = std::fs::remove_file(path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(
                    path = %path.display(),
                    error = %err,
                    "failed to remove stale daemon file"
                );
            }
        }
    }
}

/// Spawns the identity daemon for `config`, optionally under `sudo -S` with
/// the elevation secret fed on stdin. The daemon self-daemonizes, writes its
/// own pid file, and logs to its own log file.
pub(crate) async fn spawn_daemon(
    binary: &str,
    label: &str,
    config: &IdentityConfig,
    secret: &SecretFile,
    paths: &DaemonPaths,
    elevation: Option<&ElevationSecret>,
) -> Result<Child> {
    let mut command = if elevation.is_some() {
        let mut command = Command::new("sudo");
        command.arg("-S").arg(binary);
        command
    } else {
        Command::new(binary)
    };

    command
        .arg("--config")
        .arg(config.path())
        .arg("--auth-user-pass")
        .arg(secret.path())
        .arg("--daemon")
        .arg(label)
        .arg("--writepid")
        .arg(paths.pid_file())
        .arg("--log")
        .arg(paths.log_file())
        .arg("--verb")
        .arg(DAEMON_LOG_VERBOSITY)
        .stdin(if elevation.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn identity daemon '{binary}'"))?;

    if let Some(elevation) = elevation {
        if let Some(mut stdin) = child.stdin.take() {
            let line = format!("{}\n", elevation.reveal());
            // A closed stdin just means sudo had cached credentials.
            let _ = stdin.write_all(line.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }
    }

    Ok(child)
}

/// Reads the pid the daemon recorded for itself, if any.
pub(crate) fn recorded_pid(paths: &DaemonPaths) -> Option<i32> {
    let raw = std::fs::read_to_string(paths.pid_file()).ok()?;
    raw.trim().parse().ok()
}

/// Reports whether a process with `pid` is still running.
///
/// An unreaped zombie still answers signal 0 but no longer holds the tunnel,
/// so on hosts with procfs the process state is consulted first: `Z` (and
/// `X`, dying) count as dead. Elsewhere, signal 0 probes existence; `EPERM`
/// means the process exists but belongs to another user (the daemon
/// typically runs as root), which still counts as alive.
pub(crate) fn pid_alive(pid: i32) -> bool {
    if let Some(state) = proc_state(pid) {
        return state != 'Z' && state != 'X';
    }

    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Process state letter from `/proc/<pid>/stat`, where procfs exists.
///
/// The state is the first field after the parenthesized command name; the
/// name itself may contain parentheses, so the split is on the last `)`.
fn proc_state(pid: i32) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let after_name = stat.rsplit(')').next()?;
    after_name.trim_start().chars().next()
}

/// Reads the daemon's own log file; missing or unreadable logs read as empty.
pub(crate) fn read_log(paths: &DaemonPaths) -> String {
    std::fs::read_to_string(paths.log_file()).unwrap_or_default()
}

/// Last `lines` non-blank lines of the daemon log, for failure diagnostics.
pub(crate) fn log_tail(paths: &DaemonPaths, lines: usize) -> String {
    let log = read_log(paths);
    let tail: Vec<&str> = log
        .lines()
        .filter(|line| !line.trim().is_empty())
        .collect();
    let start = tail.len().saturating_sub(lines);
    tail[start..].join("\n")
}

/// ERROR/FATAL lines currently present in the daemon log.
pub(crate) fn error_lines(log: &str) -> Vec<&str> {
    log.lines()
        .filter(|line| line.contains("ERROR") || line.contains("FATAL"))
        .collect()
}
