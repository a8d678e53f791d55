use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use blobber_storage::ContentStore;

use crate::connection::{list_connections, load_connection, save_connection, ConnectionStatus};
use crate::db::BlobberDb;
use crate::error::BlobberError;
use crate::locks::LockManager;
use crate::now_secs;

/// Background worker that reclaims connections abandoned before commit:
/// staged content is deleted and the connection closed as `Deleted`. The row
/// stays so the id cannot be reopened.
pub struct ConnectionSweeper {
    db: BlobberDb,
    store: Arc<dyn ContentStore>,
    locks: Arc<LockManager>,
    stale_after_secs: u64,
    interval_secs: u64,
    shutdown: Arc<Notify>,
}

impl ConnectionSweeper {
    pub fn new(
        db: BlobberDb,
        store: Arc<dyn ContentStore>,
        locks: Arc<LockManager>,
        stale_after_secs: u64,
        interval_secs: u64,
    ) -> Self {
        Self { db, store, locks, stale_after_secs, interval_secs, shutdown: Arc::new(Notify::new()) }
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("connection sweeper started: scanning every {}s", self.interval_secs);
            loop {
                tokio::select! {
                    _ = self.shutdown.notified() => {
                        info!("connection sweeper shutting down");
                        break;
                    }
                    _ = sleep(Duration::from_secs(self.interval_secs)) => {
                        if let Err(e) = self.run_once().await {
                            warn!("connection sweep failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// Stop the loop started by [`Self::start`]. Safe to call before the
    /// task first polls.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    fn is_stale(&self, updated_at: u64, now: u64) -> bool {
        updated_at.saturating_add(self.stale_after_secs) <= now
    }

    /// One sweep. Returns the number of connections reclaimed.
    pub async fn run_once(&self) -> Result<usize, BlobberError> {
        let now = now_secs();
        let candidates: Vec<_> = self
            .db
            .read(|txn, b| list_connections(txn, b))?
            .into_iter()
            .filter(|c| c.is_active() && self.is_stale(c.updated_at, now))
            .collect();

        let mut reclaimed = 0;
        for candidate in candidates {
            let _guard = self.locks.lock_connection(&candidate.connection_id).await;

            // an upload may have touched it while we waited for the lock
            let current = self.db.read(|txn, b| load_connection(txn, b, &candidate.connection_id))?;
            let mut conn = match current {
                Some(c) if c.is_active() && self.is_stale(c.updated_at, now) => c,
                _ => continue,
            };
            let changes = conn.changes.len();

            if let Err(e) = self.store.delete_staged(&conn.allocation_id, &conn.connection_id) {
                warn!(connection = %conn.connection_id, error = %e, "failed to delete staged content");
                continue;
            }
            conn.status = ConnectionStatus::Deleted;
            conn.changes.clear();
            conn.size = 0;
            conn.updated_at = now;
            self.db.write(|txn, b| save_connection(txn, b, &conn))?;
            debug!(
                allocation = %conn.allocation_id,
                connection = %conn.connection_id,
                changes,
                "stale connection reclaimed"
            );
            reclaimed += 1;
        }
        if reclaimed > 0 {
            info!(reclaimed, "connection sweep finished");
        }
        Ok(reclaimed)
    }
}
