//! Ingestion pipeline: drains the decoded-reading queue into the store.
//!
//! Persistence is at-most-once per received message: a failed or timed-out
//! insert is logged and the reading is dropped. Broker redeliveries are not
//! deduplicated.

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::db::{Db, NewReading};
use crate::state::SharedState;

pub struct IngestPipeline {
    db: Db,
    shared: SharedState,
}

impl IngestPipeline {
    pub fn new(db: Db, shared: SharedState) -> Self {
        Self { db, shared }
    }

    /// Persist one reading. Never fails; store errors are absorbed.
    pub async fn ingest(&self, reading: NewReading) -> Option<i64> {
        match self.db.insert_reading(&reading).await {
            Ok(id) => {
                debug!(id, device = %reading.device_id, "reading stored");
                self.shared.write().await.record_reading(id, &reading);
                Some(id)
            }
            Err(e) => {
                error!(device = %reading.device_id, "insert_reading failed: {e}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("insert_reading failed: {e}"));
                None
            }
        }
    }

    /// Consume the queue until every sender is gone. Intended to be
    /// `tokio::spawn`-ed.
    pub async fn run(self, mut queue: mpsc::Receiver<NewReading>) {
        info!("ingestion pipeline started");
        while let Some(reading) = queue.recv().await {
            self.ingest(reading).await;
        }
        warn!("ingestion queue closed, pipeline stopped");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
