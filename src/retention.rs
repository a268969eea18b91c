use crate::{artifacts::ArtifactStore, config::RetentionConfig};
use std::{sync::Arc, time::SystemTime};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{interval, Duration, MissedTickBehavior},
};

/// Periodically applies the retention policy to the artifact directory.
pub struct RetentionSweeper {
    store: Arc<ArtifactStore>,
    policy: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(store: Arc<ArtifactStore>, policy: RetentionConfig) -> Self {
        Self { store, policy }
    }

    pub fn sweep(&self) -> usize {
        match self.store.prune(&self.policy, SystemTime::now()) {
            Ok(0) => 0,
            Ok(removed) => {
                tracing::info!("Retention sweep removed {} artifact pair(s)", removed);
                removed
            }
            Err(e) => {
                tracing::error!("Retention sweep failed: {:?}", e);
                0
            }
        }
    }

    /// Spawns the sweep loop. Returns `None` when no limit is configured.
    pub fn start(self, mut shutdown_rx: broadcast::Receiver<()>) -> Option<JoinHandle<()>> {
        if !self.policy.is_enabled() {
            tracing::info!("Artifact retention disabled, outputs are kept indefinitely");
            return None;
        }

        let period = Duration::from_secs(self.policy.sweep_interval_secs.max(1));
        tracing::info!(
            "Artifact retention: max_artifacts={:?}, max_age_secs={:?}, every {:?}",
            self.policy.max_artifacts,
            self.policy.max_age_secs,
            period
        );

        Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let sweeper = Self {
                            store: self.store.clone(),
                            policy: self.policy.clone(),
                        };
                        if let Err(e) = tokio::task::spawn_blocking(move || sweeper.sweep()).await {
                            tracing::error!("Retention sweep task panicked: {:?}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Retention sweeper received shutdown signal");
                        break;
                    }
                }
            }
            tracing::info!("Retention sweeper stopped");
        }))
    }
}
