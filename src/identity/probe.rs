use futures::future::BoxFuture;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Ceiling on each interface inspection command.
const PROBE_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Re-checkable signal for "is the identity endpoint live".
///
/// The manager never trusts its own cached state or the daemon's exit code;
/// every connectivity decision re-derives truth through this probe, because
/// the daemon can die (or come up) behind the manager's back.
pub trait HealthProbe: Send + Sync {
    /// Reports whether the identity network interface is up and carries an
    /// address. Infallible by contract; probe errors read as "down".
    fn endpoint_up(&self) -> BoxFuture<'_, bool>;
}

/// Probe over the tunnel interface the identity daemon creates.
///
/// On Linux this inspects `tun0` via `ip`; on macOS it walks `utun0..utun9`
/// via `ifconfig`. An interface only counts as up when it carries an `inet`
/// address, not merely when it exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct TunInterfaceProbe;

impl HealthProbe for TunInterfaceProbe {
    fn endpoint_up(&self) -> BoxFuture<'_, bool> {
        Box::pin(tunnel_interface_up())
    }
}

#[cfg(target_os = "macos")]
async fn tunnel_interface_up() -> bool {
    for index in 0..10 {
        let interface = format!("utun{index}");
        if let Some(output) = run_probe_command("ifconfig", &[&interface]).await {
            if output.contains("inet ") {
                return true;
            }
        }
    }
    false
}

#[cfg(not(target_os = "macos"))]
async fn tunnel_interface_up() -> bool {
    if run_probe_command("ip", &["link", "show", "tun0"])
        .await
        .is_none()
    {
        return false;
    }

    match run_probe_command("ip", &["addr", "show", "tun0"]).await {
        Some(output) => output.contains("inet "),
        None => false,
    }
}

/// Runs one inspection command, returning its stdout only on zero exit.
async fn run_probe_command(program: &str, args: &[&str]) -> Option<String> {
    let result = timeout(
        PROBE_COMMAND_TIMEOUT,
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output(),
    )
    .await;

    match result {
        Ok(Ok(output)) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        _ => None,
    }
}
