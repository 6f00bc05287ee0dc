use crate::identity::daemon::{self, DaemonPaths, SecretFile};
use crate::identity::probe::{HealthProbe, TunInterfaceProbe};
use crate::identity::store::{ConfigStore, IdentityConfig};
use crate::identity::termination::{TerminationContext, TerminationStrategy};
use crate::runtime::config::HaulConfig;
use crate::runtime::secret::ElevationSecret;
use crate::runtime::timing::sleep_cancellable;
use anyhow::{Context, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cadence for scanning the daemon log while waiting for readiness.
const LOG_SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// One live activation of an identity endpoint.
///
/// At most one session exists process-wide; it is owned exclusively by the
/// manager, created on a successful connect and cleared on disconnect.
#[derive(Debug, Clone)]
pub struct IdentitySession {
    config: IdentityConfig,
    pid: Option<i32>,
    started_at: Instant,
}

impl IdentitySession {
    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

/// Drives the external identity daemon through connect/disconnect cycles.
///
/// Every lifecycle failure below construction is converted to a boolean
/// outcome at this boundary: callers never see process-spawning errors, only
/// "the endpoint came up" or "it did not". The single hard precondition is
/// the daemon binary existing at all, checked once at construction.
pub struct IdentityManager {
    config: Arc<HaulConfig>,
    store: ConfigStore,
    probe: Box<dyn HealthProbe>,
    paths: DaemonPaths,
    elevation: Option<ElevationSecret>,
    current_config: Option<IdentityConfig>,
    session: Option<IdentitySession>,
    shutdown: CancellationToken,
}

impl fmt::Debug for IdentityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The probe is an opaque trait object; everything else renders.
        f.debug_struct("IdentityManager")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("paths", &self.paths)
            .field("elevation", &self.elevation)
            .field("current_config", &self.current_config)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl IdentityManager {
    /// Creates a manager probing the real tunnel interface.
    ///
    /// Errors when the daemon binary cannot be resolved; nothing else about
    /// the environment is checked here.
    pub fn new(
        config: Arc<HaulConfig>,
        elevation: Option<ElevationSecret>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        Self::with_probe(config, elevation, shutdown, Box::new(TunInterfaceProbe))
    }

    /// Creates a manager with an injected health probe.
    pub fn with_probe(
        config: Arc<HaulConfig>,
        elevation: Option<ElevationSecret>,
        shutdown: CancellationToken,
        probe: Box<dyn HealthProbe>,
    ) -> Result<Self> {
        which::which(config.daemon_binary()).with_context(|| {
            format!(
                "identity daemon binary '{}' not found; install it or adjust daemon_binary",
                config.daemon_binary()
            )
        })?;

        let store = ConfigStore::new(config.config_dir());
        let paths = DaemonPaths::new(config.state_dir(), config.daemon_label());

        Ok(Self {
            config,
            store,
            probe,
            paths,
            elevation,
            current_config: None,
            session: None,
            shutdown,
        })
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn paths(&self) -> &DaemonPaths {
        &self.paths
    }

    /// Configuration used by the most recent connect attempt, successful or
    /// not. This is the cursor [`ConfigStore::pick_next`] rotates from.
    pub fn current_config(&self) -> Option<&IdentityConfig> {
        self.current_config.as_ref()
    }

    pub fn session(&self) -> Option<&IdentitySession> {
        self.session.as_ref()
    }

    /// Re-derives connectivity from the external probe on every call.
    ///
    /// The cached session is deliberately not consulted: the daemon can die
    /// (or an endpoint can appear) without the manager's involvement.
    pub async fn is_connected(&self) -> bool {
        self.probe.endpoint_up().await
    }

    /// Brings an identity endpoint up.
    ///
    /// Picks a random configuration when none is given. Idempotent: when the
    /// probe already reports a live endpoint, no new daemon is spawned and
    /// the call succeeds immediately. All failures return `false`.
    pub async fn connect(&mut self, requested: Option<IdentityConfig>) -> bool {
        if self.probe.endpoint_up().await {
            match &self.current_config {
                Some(config) => {
                    tracing::info!(config = config.name(), "identity endpoint already up")
                }
                None => {
                    tracing::info!("identity endpoint already up (configuration unknown)")
                }
            }
            if self.session.is_none() {
                self.session = Some(IdentitySession {
                    config: match self.current_config.clone() {
                        Some(config) => config,
                        None => return true,
                    },
                    pid: daemon::recorded_pid(&self.paths),
                    started_at: Instant::now(),
                });
            }
            return true;
        }

        let config = match requested {
            Some(config) => config,
            None => match self.store.pick_random() {
                Ok(config) => config,
                Err(err) => {
                    tracing::warn!(error = %err, "cannot select an identity configuration");
                    return false;
                }
            },
        };
        self.current_config = Some(config.clone());

        tracing::info!(config = config.name(), "connecting identity endpoint");

        let secret = match SecretFile::create(
            self.paths.secret_file(),
            self.config.identity_username(),
            self.config.identity_password(),
        ) {
            Ok(secret) => secret,
            Err(err) => {
                tracing::error!(error = %err, "failed to stage daemon credentials");
                return false;
            }
        };

        daemon::remove_stale_runtime_files(&self.paths);

        let mut child = match daemon::spawn_daemon(
            self.config.daemon_binary(),
            self.config.daemon_label(),
            &config,
            &secret,
            &self.paths,
            self.elevation.as_ref(),
        )
        .await
        {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(error = %err, "failed to launch identity daemon");
                return false;
            }
        };

        if !sleep_cancellable(self.config.launch_settle(), &self.shutdown).await {
            return false;
        }

        // The launcher exits quickly once the daemon detaches; a non-zero
        // exit this early means the launch itself failed.
        if let Ok(Some(status)) = child.try_wait() {
            if !status.success() {
                self.log_launch_failure("identity daemon exited at launch");
                return false;
            }
        }

        if !self.daemon_process_alive() {
            self.log_launch_failure("identity daemon did not record a live pid");
            return false;
        }

        let started = Instant::now();
        let deadline = started + self.config.readiness_timeout();
        let mut last_log_scan = started;

        while Instant::now() < deadline {
            if self.probe.endpoint_up().await {
                let elapsed = started.elapsed();
                tracing::info!(
                    config = config.name(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "identity endpoint connected"
                );
                self.session = Some(IdentitySession {
                    config,
                    pid: daemon::recorded_pid(&self.paths),
                    started_at: started,
                });
                return true;
            }

            if last_log_scan.elapsed() >= LOG_SCAN_INTERVAL {
                let log = daemon::read_log(&self.paths);
                let errors = daemon::error_lines(&log);
                if let Some(line) = errors.last() {
                    tracing::warn!(line, "identity daemon reported an error while connecting");
                }
                last_log_scan = Instant::now();
            }

            if !sleep_cancellable(self.config.readiness_poll_interval(), &self.shutdown).await {
                tracing::info!("identity connect cancelled");
                return false;
            }
        }

        tracing::warn!(
            config = config.name(),
            timeout_secs = self.config.readiness_timeout().as_secs(),
            tail = %daemon::log_tail(&self.paths, self.config.log_tail_lines()),
            "timed out waiting for the identity endpoint"
        );
        false
    }

    /// Tears the endpoint down.
    ///
    /// Climbs the termination ladder until the daemon process is gone, then
    /// verifies through the probe. Never errors and always clears the
    /// session, even when verification still reports the endpoint up; the
    /// caller must always be able to proceed to a reconnect.
    pub async fn disconnect(&mut self) {
        tracing::info!("disconnecting identity endpoint");

        let pid = daemon::recorded_pid(&self.paths)
            .or_else(|| self.session.as_ref().and_then(IdentitySession::pid));

        for strategy in TerminationStrategy::ladder(pid) {
            strategy.execute(&self.termination_context()).await;
            tokio::time::sleep(self.config.termination_grace()).await;
            if !self.daemon_process_alive() {
                break;
            }
        }

        if let Err(err) = std::fs::remove_file(self.paths.pid_file()) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(error = %err, "failed to remove daemon pid file");
            }
        }

        tokio::time::sleep(self.config.disconnect_settle()).await;

        if self.probe.endpoint_up().await {
            tracing::warn!("endpoint still up after the ladder; forcing a final sweep");
            TerminationStrategy::ForcedNameSweep
                .execute(&self.termination_context())
                .await;
            tokio::time::sleep(self.config.disconnect_settle()).await;

            if self.probe.endpoint_up().await {
                tracing::warn!(
                    "could not verify endpoint teardown; clearing session state anyway"
                );
            }
        }

        self.session = None;
        self.current_config = None;
        tracing::info!("identity endpoint disconnected");
    }

    /// The rotation primitive: tear down the current endpoint (when one is
    /// up) and dial the next configuration in the enumeration order.
    pub async fn reconnect_with_new_config(&mut self) -> bool {
        let previous = self.current_config.clone();
        match &previous {
            Some(config) => {
                tracing::info!(current = config.name(), "rotating identity configuration")
            }
            None => tracing::info!("rotating identity configuration"),
        }

        if self.probe.endpoint_up().await {
            self.disconnect().await;
            // Give the interface time to fully drop before dialing again.
            if !sleep_cancellable(self.config.reconnect_gap(), &self.shutdown).await {
                return false;
            }
        } else {
            self.session = None;
        }

        let next = match self.store.pick_next(previous.as_ref()) {
            Ok(next) => next,
            Err(err) => {
                tracing::warn!(error = %err, "no identity configuration to rotate to");
                return false;
            }
        };

        let connected = self.connect(Some(next)).await;
        if connected {
            if let Some(session) = &self.session {
                tracing::info!(config = session.config().name(), "rotation complete");
            }
        }
        connected
    }

    fn termination_context(&self) -> TerminationContext<'_> {
        TerminationContext {
            binary: self.config.daemon_binary(),
            label: self.config.daemon_label(),
            elevation: self.elevation.as_ref(),
        }
    }

    fn daemon_process_alive(&self) -> bool {
        match daemon::recorded_pid(&self.paths) {
            Some(pid) => daemon::pid_alive(pid),
            None => false,
        }
    }

    fn log_launch_failure(&self, message: &str) {
        let tail = daemon::log_tail(&self.paths, self.config.log_tail_lines());
        if tail.is_empty() {
            tracing::error!("{message} (no daemon log produced)");
        } else {
            tracing::error!(tail = %tail, "{message}");
        }
    }
}
