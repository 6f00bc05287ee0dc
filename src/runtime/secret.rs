use anyhow::{Context, Result};
use std::env;
use std::fmt;
use std::io::IsTerminal;

/// Environment variable consulted for the daemon elevation credential.
pub const ELEVATION_SECRET_ENV: &str = "PAGEHAUL_SUDO_PASSWORD";

/// Credential used to run the identity daemon and its kill sweeps under `sudo`.
///
/// The value is read once at process start and held in memory for the lifetime
/// of the run. It is never logged; `Debug` renders a redacted placeholder.
#[derive(Clone, PartialEq, Eq)]
pub struct ElevationSecret(String);

impl ElevationSecret {
    /// Wraps an already-known credential. Blank values collapse to `None`
    /// (the pipeline then runs the daemon without elevation).
    pub fn from_value(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            None
        } else {
            Some(Self(value))
        }
    }

    /// Resolves the credential from the environment, falling back to an
    /// interactive no-echo prompt when stdin is a terminal.
    ///
    /// Returns `Ok(None)` when no credential is available through either
    /// channel; callers treat that as "run without elevation".
    pub fn resolve() -> Result<Option<Self>> {
        if let Ok(value) = env::var(ELEVATION_SECRET_ENV) {
            if let Some(secret) = Self::from_value(value) {
                return Ok(Some(secret));
            }
        }

        if !std::io::stdin().is_terminal() {
            return Ok(None);
        }

        let value = dialoguer::Password::new()
            .with_prompt(format!(
                "sudo password (or set {ELEVATION_SECRET_ENV} in the environment)"
            ))
            .allow_empty_password(true)
            .interact()
            .context("failed to read elevation secret from the terminal")?;

        Ok(Self::from_value(value))
    }

    pub(crate) fn reveal(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ElevationSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ElevationSecret(<redacted>)")
    }
}
