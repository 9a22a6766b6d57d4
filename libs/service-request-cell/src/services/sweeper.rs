use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::services::engine::LifecycleEngine;
use crate::services::tasks::{shutdown_channel, TaskHandle};

/// Periodically re-issues completion codes that the patient never confirmed.
pub struct VerificationSweeper {
    engine: Arc<LifecycleEngine>,
    period: Duration,
}

impl VerificationSweeper {
    pub fn new(engine: Arc<LifecycleEngine>, period: Duration) -> Self {
        Self { engine, period }
    }

    pub async fn sweep_once(&self) -> usize {
        match self.engine.reissue_stale_codes(Utc::now()).await {
            Ok(count) => count,
            Err(e) => {
                error!("Verification sweep failed: {}", e);
                0
            }
        }
    }

    pub fn spawn(self) -> TaskHandle {
        let (tx, rx) = shutdown_channel();
        let join = tokio::spawn(async move { self.run(rx).await });
        TaskHandle::new("verification-sweeper", tx, join)
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Verification sweeper running every {:?}", self.period);
        let mut ticker = interval(self.period.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let reissued = self.sweep_once().await;
                    debug!("Sweep reissued {} codes", reissued);
                }
            }
        }

        info!("Verification sweeper stopped");
    }
}
