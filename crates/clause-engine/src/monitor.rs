use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::lifecycle::LifecycleManager;

/// Background liveness probing of a healthy or unhealthy instance.
pub struct HealthMonitor;

impl HealthMonitor {
    /// Probe every `interval` until `cancel` fires. A slow probe delays the
    /// next tick instead of stacking probes.
    pub fn spawn(
        manager: Arc<LifecycleManager>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            info!(interval_ms = interval.as_millis() as u64, "health monitor started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(state) = manager.probe_once().await {
                            debug!(%state, "monitor changed instance state");
                        }
                    }
                }
            }
            info!("health monitor stopped");
        })
    }
}
