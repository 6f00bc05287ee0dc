use crate::runtime::telemetry;
use anyhow::{bail, Context, Result};
use rand::Rng;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DAEMON_BINARY: &str = "openvpn";
const DEFAULT_DAEMON_LABEL: &str = "pagehaul";
const DEFAULT_READINESS_POLL_MILLIS: u64 = 100;
const DEFAULT_READINESS_TIMEOUT_SECS: u64 = 60;
const DEFAULT_LAUNCH_SETTLE_MILLIS: u64 = 100;
const DEFAULT_TERMINATION_GRACE_MILLIS: u64 = 500;
const DEFAULT_DISCONNECT_SETTLE_SECS: u64 = 1;
const DEFAULT_RECONNECT_GAP_SECS: u64 = 2;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_LOG_TAIL_LINES: usize = 10;

/// Delay window sampled uniformly each time it is applied.
///
/// Human-shaped pauses (pre-fetch, render, cooldown) and the retry backoff
/// base all draw from windows rather than fixed values so repeated runs do
/// not produce a recognizable cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterWindow {
    min: Duration,
    max: Duration,
}

impl JitterWindow {
    pub const fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub const fn from_secs(min: u64, max: u64) -> Self {
        Self::new(Duration::from_secs(min), Duration::from_secs(max))
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Draws one delay from the window.
    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let secs = rand::rng().random_range(self.min.as_secs_f64()..=self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    fn validate(&self, field: &str) -> Result<()> {
        if self.max < self.min {
            bail!("{field} window max must not be less than min");
        }
        Ok(())
    }
}

const DEFAULT_ROTATION_COOLDOWN: JitterWindow = JitterWindow::from_secs(5, 10);
const DEFAULT_PRE_FETCH_DELAY: JitterWindow = JitterWindow::from_secs(5, 10);
const DEFAULT_RENDER_DELAY: JitterWindow = JitterWindow::from_secs(3, 5);
const DEFAULT_POST_FETCH_PAUSE: JitterWindow = JitterWindow::from_secs(2, 4);
const DEFAULT_BACKOFF_BASE: JitterWindow = JitterWindow::from_secs(30, 60);

/// Runtime configuration for the collection pipeline.
///
/// All instances must be constructed via [`HaulConfig::builder`] or
/// [`HaulConfig::new`] so invariants are validated before any consumer
/// observes the values.
#[derive(Clone, PartialEq, Eq)]
pub struct HaulConfig {
    config_dir: PathBuf,
    queue_path: PathBuf,
    output_dir: PathBuf,
    identity_username: String,
    identity_password: String,
    daemon_binary: String,
    daemon_label: String,
    state_dir: PathBuf,
    readiness_poll_interval: Duration,
    readiness_timeout: Duration,
    launch_settle: Duration,
    termination_grace: Duration,
    disconnect_settle: Duration,
    reconnect_gap: Duration,
    rotation_cooldown: JitterWindow,
    pre_fetch_delay: JitterWindow,
    render_delay: JitterWindow,
    post_fetch_pause: JitterWindow,
    backoff_base: JitterWindow,
    max_retries: u32,
    overall_deadline: Option<Duration>,
    fetch_timeout: Duration,
    metrics_interval: Duration,
    log_tail_lines: usize,
}

pub struct HaulConfigParams {
    pub config_dir: PathBuf,
    pub queue_path: PathBuf,
    pub output_dir: PathBuf,
    pub identity_username: String,
    pub identity_password: String,
    pub daemon_binary: String,
    pub daemon_label: String,
    pub state_dir: PathBuf,
    pub readiness_poll_interval: Duration,
    pub readiness_timeout: Duration,
    pub launch_settle: Duration,
    pub termination_grace: Duration,
    pub disconnect_settle: Duration,
    pub reconnect_gap: Duration,
    pub rotation_cooldown: JitterWindow,
    pub pre_fetch_delay: JitterWindow,
    pub render_delay: JitterWindow,
    pub post_fetch_pause: JitterWindow,
    pub backoff_base: JitterWindow,
    pub max_retries: u32,
    pub overall_deadline: Option<Duration>,
    pub fetch_timeout: Duration,
    pub metrics_interval: Duration,
    pub log_tail_lines: usize,
}

impl HaulConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> HaulConfigBuilder {
        HaulConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    ///
    /// Prefer [`HaulConfig::builder`] for ergonomics when many values use defaults.
    pub fn new(params: HaulConfigParams) -> Result<Self> {
        let HaulConfigParams {
            config_dir,
            queue_path,
            output_dir,
            identity_username,
            identity_password,
            daemon_binary,
            daemon_label,
            state_dir,
            readiness_poll_interval,
            readiness_timeout,
            launch_settle,
            termination_grace,
            disconnect_settle,
            reconnect_gap,
            rotation_cooldown,
            pre_fetch_delay,
            render_delay,
            post_fetch_pause,
            backoff_base,
            max_retries,
            overall_deadline,
            fetch_timeout,
            metrics_interval,
            log_tail_lines,
        } = params;

        let config = Self {
            config_dir,
            queue_path,
            output_dir,
            identity_username: trimmed_string(identity_username),
            identity_password: trimmed_string(identity_password),
            daemon_binary: trimmed_string(daemon_binary),
            daemon_label: trimmed_string(daemon_label),
            state_dir,
            readiness_poll_interval,
            readiness_timeout,
            launch_settle,
            termination_grace,
            disconnect_settle,
            reconnect_gap,
            rotation_cooldown,
            pre_fetch_delay,
            render_delay,
            post_fetch_pause,
            backoff_base,
            max_retries,
            overall_deadline,
            fetch_timeout,
            metrics_interval,
            log_tail_lines,
        };

        config.validate()?;
        Ok(config)
    }

    /// Directory scanned for identity endpoint configuration files.
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// JSON work queue document driving the run.
    pub fn queue_path(&self) -> &Path {
        &self.queue_path
    }

    /// Directory that receives one output record per completed item.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Username written into the daemon credential file.
    pub fn identity_username(&self) -> &str {
        &self.identity_username
    }

    /// Password written into the daemon credential file.
    pub fn identity_password(&self) -> &str {
        &self.identity_password
    }

    /// Name of the identity daemon executable looked up on PATH.
    pub fn daemon_binary(&self) -> &str {
        &self.daemon_binary
    }

    /// Label distinguishing this pipeline's daemon instance from any other.
    ///
    /// The label is passed to the daemon, embedded in its runtime file names,
    /// and used as the match pattern when sweeping stray processes.
    pub fn daemon_label(&self) -> &str {
        &self.daemon_label
    }

    /// Directory holding the daemon's pid, log, and credential files.
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Interval between endpoint readiness checks while connecting.
    pub fn readiness_poll_interval(&self) -> Duration {
        self.readiness_poll_interval
    }

    /// Ceiling on how long a single connection attempt may poll for readiness.
    pub fn readiness_timeout(&self) -> Duration {
        self.readiness_timeout
    }

    /// Pause after spawning the daemon before its health is first inspected.
    pub fn launch_settle(&self) -> Duration {
        self.launch_settle
    }

    /// Grace period between the polite terminate signal and the forced kill.
    pub fn termination_grace(&self) -> Duration {
        self.termination_grace
    }

    /// Pause after the termination ladder before re-probing the endpoint.
    pub fn disconnect_settle(&self) -> Duration {
        self.disconnect_settle
    }

    /// Pause between tearing down one endpoint and dialing the next.
    pub fn reconnect_gap(&self) -> Duration {
        self.reconnect_gap
    }

    /// Cooldown applied after every identity rotation.
    pub fn rotation_cooldown(&self) -> JitterWindow {
        self.rotation_cooldown
    }

    /// Delay drawn before each page request.
    pub fn pre_fetch_delay(&self) -> JitterWindow {
        self.pre_fetch_delay
    }

    /// Extra settling time granted to the page before its content is read.
    pub fn render_delay(&self) -> JitterWindow {
        self.render_delay
    }

    /// Pause after a page has been fetched, before the response is returned.
    pub fn post_fetch_pause(&self) -> JitterWindow {
        self.post_fetch_pause
    }

    /// Base window for the exponential retry backoff.
    pub fn backoff_base(&self) -> JitterWindow {
        self.backoff_base
    }

    /// Maximum fetch attempts per work item.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Optional wall-clock ceiling on one item's whole retry sequence.
    ///
    /// `None` lets the attempt budget alone bound the sequence.
    pub fn overall_deadline(&self) -> Option<Duration> {
        self.overall_deadline
    }

    /// Timeout applied to each HTTP request.
    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Number of daemon log lines quoted in failure diagnostics.
    pub fn log_tail_lines(&self) -> usize {
        self.log_tail_lines
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        ensure_path_not_empty(&self.config_dir, "config_dir")?;
        ensure_path_not_empty(&self.queue_path, "queue_path")?;
        ensure_path_not_empty(&self.output_dir, "output_dir")?;
        ensure_path_not_empty(&self.state_dir, "state_dir")?;
        ensure_not_empty(&self.identity_username, "identity_username")?;
        ensure_not_empty(&self.identity_password, "identity_password")?;
        ensure_not_empty(&self.daemon_binary, "daemon_binary")?;
        validate_label(&self.daemon_label)?;

        if self.readiness_poll_interval.is_zero() {
            bail!("readiness_poll_interval must be greater than 0");
        }

        if self.readiness_timeout.is_zero() {
            bail!("readiness_timeout must be greater than 0");
        }

        if self.readiness_timeout < self.readiness_poll_interval {
            bail!("readiness_timeout must not be shorter than readiness_poll_interval");
        }

        if self.fetch_timeout.is_zero() {
            bail!("fetch_timeout must be greater than 0");
        }

        if self.max_retries == 0 {
            bail!("max_retries must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        if let Some(deadline) = self.overall_deadline {
            if deadline.is_zero() {
                bail!("overall_deadline must be greater than 0 when set");
            }
        }

        if self.log_tail_lines == 0 {
            bail!("log_tail_lines must be greater than 0");
        }

        self.rotation_cooldown.validate("rotation_cooldown")?;
        self.pre_fetch_delay.validate("pre_fetch_delay")?;
        self.render_delay.validate("render_delay")?;
        self.post_fetch_pause.validate("post_fetch_pause")?;
        self.backoff_base.validate("backoff_base")?;

        Ok(())
    }
}

impl fmt::Debug for HaulConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HaulConfig")
            .field("config_dir", &self.config_dir)
            .field("queue_path", &self.queue_path)
            .field("output_dir", &self.output_dir)
            .field("identity_username", &self.identity_username)
            .field("identity_password", &"<redacted>")
            .field("daemon_binary", &self.daemon_binary)
            .field("daemon_label", &self.daemon_label)
            .field("state_dir", &self.state_dir)
            .field("readiness_poll_interval", &self.readiness_poll_interval)
            .field("readiness_timeout", &self.readiness_timeout)
            .field("launch_settle", &self.launch_settle)
            .field("termination_grace", &self.termination_grace)
            .field("disconnect_settle", &self.disconnect_settle)
            .field("reconnect_gap", &self.reconnect_gap)
            .field("rotation_cooldown", &self.rotation_cooldown)
            .field("pre_fetch_delay", &self.pre_fetch_delay)
            .field("render_delay", &self.render_delay)
            .field("post_fetch_pause", &self.post_fetch_pause)
            .field("backoff_base", &self.backoff_base)
            .field("max_retries", &self.max_retries)
            .field("overall_deadline", &self.overall_deadline)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("metrics_interval", &self.metrics_interval)
            .field("log_tail_lines", &self.log_tail_lines)
            .finish()
    }
}

#[derive(Debug, Default, Clone)]
pub struct HaulConfigBuilder {
    config_dir: Option<PathBuf>,
    queue_path: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    identity_username: Option<String>,
    identity_password: Option<String>,
    daemon_binary: Option<String>,
    daemon_label: Option<String>,
    state_dir: Option<PathBuf>,
    readiness_poll_interval: Option<Duration>,
    readiness_timeout: Option<Duration>,
    launch_settle: Option<Duration>,
    termination_grace: Option<Duration>,
    disconnect_settle: Option<Duration>,
    reconnect_gap: Option<Duration>,
    rotation_cooldown: Option<JitterWindow>,
    pre_fetch_delay: Option<JitterWindow>,
    render_delay: Option<JitterWindow>,
    post_fetch_pause: Option<JitterWindow>,
    backoff_base: Option<JitterWindow>,
    max_retries: Option<u32>,
    overall_deadline: Option<Duration>,
    fetch_timeout: Option<Duration>,
    metrics_interval: Option<Duration>,
    log_tail_lines: Option<usize>,
}

impl HaulConfigBuilder {
    pub fn config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    pub fn queue_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.queue_path = Some(path.into());
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn identity_username(mut self, username: impl Into<String>) -> Self {
        self.identity_username = Some(username.into());
        self
    }

    pub fn identity_password(mut self, password: impl Into<String>) -> Self {
        self.identity_password = Some(password.into());
        self
    }

    pub fn daemon_binary(mut self, binary: impl Into<String>) -> Self {
        self.daemon_binary = Some(binary.into());
        self
    }

    pub fn daemon_label(mut self, label: impl Into<String>) -> Self {
        self.daemon_label = Some(label.into());
        self
    }

    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn readiness_poll_interval(mut self, interval: Duration) -> Self {
        self.readiness_poll_interval = Some(interval);
        self
    }

    pub fn readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = Some(timeout);
        self
    }

    pub fn launch_settle(mut self, settle: Duration) -> Self {
        self.launch_settle = Some(settle);
        self
    }

    pub fn termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = Some(grace);
        self
    }

    pub fn disconnect_settle(mut self, settle: Duration) -> Self {
        self.disconnect_settle = Some(settle);
        self
    }

    pub fn reconnect_gap(mut self, gap: Duration) -> Self {
        self.reconnect_gap = Some(gap);
        self
    }

    pub fn rotation_cooldown(mut self, window: JitterWindow) -> Self {
        self.rotation_cooldown = Some(window);
        self
    }

    pub fn pre_fetch_delay(mut self, window: JitterWindow) -> Self {
        self.pre_fetch_delay = Some(window);
        self
    }

    pub fn render_delay(mut self, window: JitterWindow) -> Self {
        self.render_delay = Some(window);
        self
    }

    pub fn post_fetch_pause(mut self, window: JitterWindow) -> Self {
        self.post_fetch_pause = Some(window);
        self
    }

    pub fn backoff_base(mut self, window: JitterWindow) -> Self {
        self.backoff_base = Some(window);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn overall_deadline(mut self, deadline: Duration) -> Self {
        self.overall_deadline = Some(deadline);
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn log_tail_lines(mut self, lines: usize) -> Self {
        self.log_tail_lines = Some(lines);
        self
    }

    pub fn build(self) -> Result<HaulConfig> {
        let params = HaulConfigParams {
            config_dir: self.config_dir.context("config_dir is required")?,
            queue_path: self.queue_path.context("queue_path is required")?,
            output_dir: self.output_dir.context("output_dir is required")?,
            identity_username: self
                .identity_username
                .context("identity_username is required")?,
            identity_password: self
                .identity_password
                .context("identity_password is required")?,
            daemon_binary: self
                .daemon_binary
                .unwrap_or_else(|| DEFAULT_DAEMON_BINARY.to_owned()),
            daemon_label: self
                .daemon_label
                .unwrap_or_else(|| DEFAULT_DAEMON_LABEL.to_owned()),
            state_dir: self.state_dir.unwrap_or_else(std::env::temp_dir),
            readiness_poll_interval: self
                .readiness_poll_interval
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_READINESS_POLL_MILLIS)),
            readiness_timeout: self
                .readiness_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_READINESS_TIMEOUT_SECS)),
            launch_settle: self
                .launch_settle
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_LAUNCH_SETTLE_MILLIS)),
            termination_grace: self
                .termination_grace
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_TERMINATION_GRACE_MILLIS)),
            disconnect_settle: self
                .disconnect_settle
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_DISCONNECT_SETTLE_SECS)),
            reconnect_gap: self
                .reconnect_gap
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_RECONNECT_GAP_SECS)),
            rotation_cooldown: self.rotation_cooldown.unwrap_or(DEFAULT_ROTATION_COOLDOWN),
            pre_fetch_delay: self.pre_fetch_delay.unwrap_or(DEFAULT_PRE_FETCH_DELAY),
            render_delay: self.render_delay.unwrap_or(DEFAULT_RENDER_DELAY),
            post_fetch_pause: self.post_fetch_pause.unwrap_or(DEFAULT_POST_FETCH_PAUSE),
            backoff_base: self.backoff_base.unwrap_or(DEFAULT_BACKOFF_BASE),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            overall_deadline: self.overall_deadline,
            fetch_timeout: self
                .fetch_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
            log_tail_lines: self.log_tail_lines.unwrap_or(DEFAULT_LOG_TAIL_LINES),
        };

        HaulConfig::new(params)
    }
}

fn trimmed_string(value: String) -> String {
    value.trim().to_owned()
}

fn ensure_not_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{field} cannot be empty");
    }
    Ok(())
}

fn ensure_path_not_empty(path: &Path, field: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("{field} cannot be empty");
    }
    Ok(())
}

fn validate_label(label: &str) -> Result<()> {
    ensure_not_empty(label, "daemon_label")?;
    // The label ends up in file names and in a process match pattern.
    if !label
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        bail!("daemon_label may only contain ASCII letters, digits, '-', '_' and '.'");
    }
    Ok(())
}
