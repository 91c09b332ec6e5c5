//! Periodic sweep of expired and finished state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::node::PortalCore;

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub certificates: usize,
    pub sessions: usize,
    pub rate_entries: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.certificates == 0 && self.sessions == 0 && self.rate_entries == 0
    }
}

/// Run one sweep. Store failures are logged and the rest still runs.
pub async fn sweep(core: &PortalCore) -> SweepReport {
    let certificates = match core.certificates().cleanup_expired().await {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, "Certificate cleanup failed");
            0
        }
    };
    let report = SweepReport {
        certificates,
        sessions: core.pairing().cleanup_expired_sessions().await,
        rate_entries: core.limiter().cleanup().await,
    };
    if report.is_empty() {
        debug!("Maintenance sweep found nothing to remove");
    } else {
        info!(
            certificates = report.certificates,
            sessions = report.sessions,
            rate_entries = report.rate_entries,
            "Maintenance sweep"
        );
    }
    report
}

/// Handle to the background sweeper.
pub struct Maintenance {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Maintenance {
    /// Spawn a task that sweeps every `interval` until [`Self::shutdown`].
    pub fn spawn(core: Arc<PortalCore>, interval: Duration) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(run(core, interval, rx));
        Self { shutdown, task }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Maintenance task ended abnormally");
        }
    }
}

async fn run(core: Arc<PortalCore>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep(&core).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("Maintenance task stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::pairing::Clock;
    use crate::store::{InMemoryStore, KeyValueStore};
    use chrono::{DateTime, Utc};
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn test_sweep_removes_finished_and_expired_sessions() {
        let time = Arc::new(StdMutex::new(Utc::now()));
        let clock_time = time.clone();
        let clock: Clock = Arc::new(move || -> DateTime<Utc> { *clock_time.lock().unwrap() });
        let store: Arc<dyn KeyValueStore> = InMemoryStore::new_shared();
        let core = PortalCore::open_with_clock(
            CoreConfig::default(),
            store,
            "desk",
            Some(clock),
        )
        .await
        .unwrap();

        core.pairing().initiate().await.unwrap();
        let dropped = core.pairing().initiate().await.unwrap();
        core.pairing().cancel(&dropped.session_id).await.unwrap();
        assert_eq!(sweep(&core).await.sessions, 1);
        assert_eq!(core.pairing().list_sessions().await.len(), 1);
        assert_eq!(sweep(&core).await.sessions, 0);

        *time.lock().unwrap() += chrono::Duration::seconds(301);
        let report = sweep(&core).await;
        assert_eq!(report.sessions, 1);
        assert!(core.pairing().list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        let store: Arc<dyn KeyValueStore> = InMemoryStore::new_shared();
        let core = Arc::new(
            PortalCore::open(CoreConfig::default(), store, "desk")
                .await
                .unwrap(),
        );
        let maintenance = Maintenance::spawn(core, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        maintenance.shutdown().await;
    }
}
