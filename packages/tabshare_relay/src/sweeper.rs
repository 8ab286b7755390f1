//! Liveness sweeper
//!
//! Runs on a fixed interval alongside request handling, evicting silent
//! connections and reclaiming empty groups past their grace period.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::LivenessConfig;
use crate::router::Relay;

/// Spawn the sweeper. It stops when `cancel` fires.
pub fn spawn_sweeper(
    relay: Arc<Relay>,
    liveness: LivenessConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    spawn_sweeper_with_clock(relay, liveness, cancel, Utc::now)
}

/// Like [`spawn_sweeper`], judging liveness against `clock` instead of the
/// wall clock.
pub fn spawn_sweeper_with_clock(
    relay: Arc<Relay>,
    liveness: LivenessConfig,
    cancel: CancellationToken,
    clock: impl Fn() -> DateTime<Utc> + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(liveness.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately; skip it so a fresh relay is not swept.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Stopping liveness sweeper");
                    break;
                }
                _ = interval.tick() => {
                    let report = relay.sweep_at(clock(), &liveness).await;
                    if !report.evicted.is_empty() || !report.reclaimed.is_empty() {
                        info!(
                            evicted = report.evicted.len(),
                            reclaimed = report.reclaimed.len(),
                            "sweep complete"
                        );
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RelayMetrics;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_silent_connection() {
        let relay = Arc::new(Relay::new(100, Arc::new(RelayMetrics::new())));
        let (tx, _rx) = mpsc::channel(16);
        relay.connect(tx).await;

        let liveness = LivenessConfig {
            sweep_interval: Duration::from_millis(50),
            connection_timeout: Duration::from_secs(300),
            group_grace: Duration::from_secs(3600),
        };
        let cancel = CancellationToken::new();
        // Ten minutes of silence as far as the sweeper can tell.
        let clock = || Utc::now() + chrono::Duration::minutes(10);
        let handle = spawn_sweeper_with_clock(relay.clone(), liveness, cancel.clone(), clock);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(relay.connection_count().await, 0);
        assert_eq!(relay.metrics().snapshot().connections.evicted, 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_spares_recent_connection() {
        let relay = Arc::new(Relay::new(100, Arc::new(RelayMetrics::new())));
        let (tx, _rx) = mpsc::channel(16);
        relay.connect(tx).await;

        let liveness = LivenessConfig {
            sweep_interval: Duration::from_millis(50),
            connection_timeout: Duration::from_secs(300),
            group_grace: Duration::from_secs(3600),
        };
        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(relay.clone(), liveness, cancel.clone());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(relay.connection_count().await, 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_on_cancel() {
        let relay = Arc::new(Relay::new(100, Arc::new(RelayMetrics::new())));
        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(relay, LivenessConfig::default(), cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
