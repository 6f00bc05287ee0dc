use crate::identity::manager::IdentityManager;
use crate::runtime::config::JitterWindow;
use crate::runtime::telemetry::Telemetry;
use crate::runtime::timing::sleep_cancellable;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The single chokepoint that decides "we are being blocked, switch
/// identity".
///
/// `rotate` runs exactly one disconnect/connect cycle and then a randomized
/// cooldown so the new endpoint stabilizes before the next fetch. The
/// `&mut self` receiver is what keeps rotations from ever overlapping: a
/// caller must await one rotation before it can issue another.
pub struct Rotator {
    manager: IdentityManager,
    cooldown: JitterWindow,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
}

impl Rotator {
    pub fn new(
        manager: IdentityManager,
        cooldown: JitterWindow,
        telemetry: Arc<Telemetry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            manager,
            cooldown,
            telemetry,
            shutdown,
        }
    }

    pub fn manager(&self) -> &IdentityManager {
        &self.manager
    }

    /// Switches to the next identity configuration and waits out the
    /// cooldown. Returns whether the new endpoint actually came up; either
    /// way the cooldown is honored so a failed rotation does not turn into
    /// an immediate re-fetch burst.
    pub async fn rotate(&mut self) -> bool {
        self.telemetry.record_rotation();
        let connected = self.manager.reconnect_with_new_config().await;

        let cooldown = self.cooldown.sample();
        tracing::info!(
            connected,
            cooldown_ms = cooldown.as_millis() as u64,
            "rotation finished; cooling down"
        );
        sleep_cancellable(cooldown, &self.shutdown).await;

        connected
    }

    /// Best-effort identity: one connect attempt when the endpoint is down.
    pub async fn ensure_connected(&mut self) -> bool {
        if self.manager.is_connected().await {
            return true;
        }
        self.manager.connect(None).await
    }

    /// Tears down any active endpoint; used by run teardown paths.
    pub async fn shutdown_identity(&mut self) {
        self.manager.disconnect().await;
    }
}
