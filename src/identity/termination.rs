use crate::runtime::secret::ElevationSecret;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Everything a termination step needs to know about the daemon instance.
pub(crate) struct TerminationContext<'a> {
    pub binary: &'a str,
    pub label: &'a str,
    pub elevation: Option<&'a ElevationSecret>,
}

/// One step of the shutdown ladder.
///
/// The ladder replaces a nest of ad-hoc fallbacks with an ordered list tried
/// in sequence until a post-check confirms the daemon is gone: polite signal
/// to the recorded pid first, escalating to broad by-name sweeps only when
/// the pid route is unavailable or ineffective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TerminationStrategy {
    /// SIGTERM to the recorded daemon pid.
    Term(i32),
    /// SIGKILL to the recorded daemon pid.
    Kill(i32),
    /// `pkill -f <label>`: matches any daemon carrying our instance label.
    PatternSweep,
    /// `killall <binary>`: every instance of the daemon executable.
    NameSweep,
    /// `killall -9 <binary>`: last resort.
    ForcedNameSweep,
}

impl TerminationStrategy {
    /// Full ladder for one instance. Pid-directed steps are present only
    /// when a live pid was actually recorded.
    pub(crate) fn ladder(pid: Option<i32>) -> Vec<Self> {
        let mut steps = Vec::new();
        if let Some(pid) = pid {
            steps.push(Self::Term(pid));
            steps.push(Self::Kill(pid));
        }
        steps.push(Self::PatternSweep);
        steps.push(Self::NameSweep);
        steps.push(Self::ForcedNameSweep);
        steps
    }

    /// Executes the step. Failures are logged and swallowed; the caller's
    /// post-check decides whether to keep climbing the ladder.
    pub(crate) async fn execute(&self, ctx: &TerminationContext<'_>) {
        match self {
            Self::Term(pid) => signal_pid(*pid, "TERM", ctx).await,
            Self::Kill(pid) => signal_pid(*pid, "KILL", ctx).await,
            Self::PatternSweep => run_sweep(&["pkill", "-f", ctx.label], ctx).await,
            Self::NameSweep => run_sweep(&["killall", ctx.binary], ctx).await,
            Self::ForcedNameSweep => run_sweep(&["killall", "-9", ctx.binary], ctx).await,
        }
    }
}

async fn signal_pid(pid: i32, signal: &str, ctx: &TerminationContext<'_>) {
    if ctx.elevation.is_some() {
        // The daemon runs as root, so the signal has to as well.
        let pid = pid.to_string();
        let signal = format!("-{signal}");
        run_sweep(&["kill", &signal, &pid], ctx).await;
        return;
    }

    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = match signal {
        "KILL" => Signal::SIGKILL,
        _ => Signal::SIGTERM,
    };

    if let Err(err) = kill(Pid::from_raw(pid), signal) {
        tracing::debug!(pid, %signal, error = %err, "pid signal failed");
    } else {
        tracing::info!(pid, %signal, "signalled identity daemon");
    }
}

/// Runs one kill command, under `sudo -S` when an elevation secret is
/// configured. Non-zero exits are expected (no matching process) and only
/// logged at debug.
async fn run_sweep(argv: &[&str], ctx: &TerminationContext<'_>) {
    let mut command = if ctx.elevation.is_some() {
        let mut command = Command::new("sudo");
        command.arg("-S").args(argv);
        command
    } else {
        let mut command = Command::new(argv[0]);
        command.args(&argv[1..]);
        command
    };

    command
        .stdin(if ctx.elevation.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            tracing::debug!(command = ?argv, error = %err, "kill command unavailable");
            return;
        }
    };

    if let Some(elevation) = ctx.elevation {
        if let Some(mut stdin) = child.stdin.take() {
            let line = format!("{}\n", elevation.reveal());
            let _ = stdin.write_all(line.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }
    }

    match child.wait().await {
        Ok(status) if status.success() => {
            tracing::info!(command = ?argv, "termination command completed");
        }
        Ok(status) => {
            tracing::debug!(command = ?argv, ?status, "termination command found nothing");
        }
        Err(err) => {
            tracing::debug!(command = ?argv, error = %err, "termination command failed");
        }
    }
}
