//! Durable offline queue with exponential-backoff retry.
//!
//! Items move `pending -> processing -> completed`, or back to `pending` with
//! one more retry when delivery fails. Once `retries` reaches the configured
//! maximum the item is parked as `failed` until [`OfflineQueue::retry_failed`].
//! The queue is generic over a [`QueueProcessor`]; only delivery differs per
//! adapter.

pub mod messages;
pub mod storage;

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use ciphertalk_shared::constants::MAX_RETRY_DELAY_MS;
use ciphertalk_shared::error::ChatError;
use ciphertalk_shared::ids::QueueItemId;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::QueueConfig;
use storage::StoredItem;

pub use messages::{DeliveryReceipt, MessageDelivery, MessageQueue, QueuedMessage};

/// Shared handle to the local queue database.
pub type QueueDb = Arc<Mutex<Connection>>;

/// Open (or create) the queue database at `path` and run its migrations.
pub fn open_queue_db(path: &std::path::Path) -> Result<QueueDb, ChatError> {
    let conn = storage::open_queue_db(path).map_err(storage_err)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Non-durable queue database, for tests and throwaway sessions.
pub fn open_queue_db_in_memory() -> Result<QueueDb, ChatError> {
    let conn = storage::open_queue_db_in_memory().map_err(storage_err)?;
    Ok(Arc::new(Mutex::new(conn)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Failed,
    Completed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Failed => "failed",
            QueueStatus::Completed => "completed",
        }
    }
}

impl FromStr for QueueStatus {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "failed" => Ok(QueueStatus::Failed),
            "completed" => Ok(QueueStatus::Completed),
            other => Err(ChatError::Storage(format!("unknown queue status: {other}"))),
        }
    }
}

/// A queued unit of work plus its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem<P> {
    pub id: QueueItemId,
    pub status: QueueStatus,
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub payload: P,
    /// Set once delivery succeeded.
    pub receipt: Option<serde_json::Value>,
}

/// Aggregate outcome of one [`OfflineQueue::sync`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: u32,
    pub failed: u32,
    pub skipped: u32,
}

/// Adapter-specific delivery for an [`OfflineQueue`].
#[async_trait]
pub trait QueueProcessor: Send + Sync + 'static {
    /// Name distinguishing this adapter's rows in the shared table.
    const QUEUE_NAME: &'static str;

    type Payload: Serialize + DeserializeOwned + Clone + Send + Sync;
    type Receipt: Serialize + Send;

    async fn process_item(&self, payload: &Self::Payload) -> Result<Self::Receipt, ChatError>;
}

fn storage_err(e: impl std::fmt::Display) -> ChatError {
    ChatError::Storage(e.to_string())
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, ChatError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(storage_err)
}

/// Releases the single-flight flag when a sync pass ends, however it ends.
struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct OfflineQueue<P: QueueProcessor> {
    db: QueueDb,
    processor: P,
    config: QueueConfig,
    syncing: AtomicBool,
}

impl<P: QueueProcessor> OfflineQueue<P> {
    pub fn new(db: QueueDb, processor: P, config: QueueConfig) -> Self {
        Self {
            db,
            processor,
            config,
            syncing: AtomicBool::new(false),
        }
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, ChatError> {
        let conn = self
            .db
            .lock()
            .map_err(|e| ChatError::Storage(format!("queue database lock poisoned: {e}")))?;
        f(&conn).map_err(storage_err)
    }

    fn decode(&self, row: StoredItem) -> Result<QueueItem<P::Payload>, ChatError> {
        Ok(QueueItem {
            id: row.id.parse().map_err(storage_err)?,
            status: row.status.parse()?,
            retries: u32::try_from(row.retries).map_err(storage_err)?,
            created_at: parse_timestamp(&row.created_at)?,
            last_attempt: row
                .last_attempt_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            last_error: row.last_error,
            payload: serde_json::from_str(&row.payload).map_err(storage_err)?,
            receipt: row
                .receipt
                .as_deref()
                .map(serde_json::from_str::<serde_json::Value>)
                .transpose()
                .map_err(storage_err)?,
        })
    }

    /// Persist a new pending item.
    pub fn enqueue(&self, payload: &P::Payload) -> Result<QueueItemId, ChatError> {
        let id = QueueItemId::new();
        let json = serde_json::to_string(payload).map_err(storage_err)?;
        let created_at = timestamp(Utc::now());
        self.with_conn(|conn| {
            storage::insert_item(conn, P::QUEUE_NAME, &id.to_string(), &json, &created_at)
        })?;
        tracing::debug!(queue = P::QUEUE_NAME, item_id = %id, "item queued");
        Ok(id)
    }

    pub fn get_count(&self, status: QueueStatus) -> Result<u64, ChatError> {
        self.with_conn(|conn| storage::count_by_status(conn, P::QUEUE_NAME, status.as_str()))
    }

    /// Items oldest first, optionally filtered by status.
    pub fn get_items(
        &self,
        status: Option<QueueStatus>,
    ) -> Result<Vec<QueueItem<P::Payload>>, ChatError> {
        let statuses: Vec<&str> = status.iter().map(|s| s.as_str()).collect();
        let rows = self.with_conn(|conn| storage::list_items(conn, P::QUEUE_NAME, &statuses))?;
        rows.into_iter().map(|row| self.decode(row)).collect()
    }

    pub fn get_item(&self, id: QueueItemId) -> Result<Option<QueueItem<P::Payload>>, ChatError> {
        let row = self.with_conn(|conn| storage::get_item(conn, P::QUEUE_NAME, &id.to_string()))?;
        row.map(|row| self.decode(row)).transpose()
    }

    /// Backoff before the attempt following `retries` failures:
    /// `initial_delay * multiplier^(retries - 1)`, capped at
    /// [`MAX_RETRY_DELAY_MS`]. Zero before any failure.
    pub fn get_retry_delay(&self, retries: u32) -> Duration {
        if retries == 0 {
            return Duration::ZERO;
        }
        let cap = Duration::from_millis(MAX_RETRY_DELAY_MS);
        let exponent = i32::try_from(retries - 1).unwrap_or(i32::MAX);
        let factor = self.config.backoff_multiplier.powi(exponent);
        let secs = self.config.initial_delay_ms as f64 * factor / 1000.0;
        Duration::try_from_secs_f64(secs).map_or(cap, |delay| delay.min(cap))
    }

    fn in_backoff(&self, item: &QueueItem<P::Payload>, now: DateTime<Utc>) -> bool {
        let Some(last_attempt) = item.last_attempt else {
            return false;
        };
        let delay = self.get_retry_delay(item.retries);
        let elapsed = (now - last_attempt).to_std().unwrap_or(Duration::ZERO);
        elapsed < delay
    }

    /// Drain pending items once, sequentially, oldest first.
    ///
    /// Returns all-zero counts immediately if another sync on this queue is
    /// still running.
    pub async fn sync(&self) -> Result<SyncResult, ChatError> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(queue = P::QUEUE_NAME, "sync already in progress");
            return Ok(SyncResult::default());
        }
        let _guard = SyncGuard(&self.syncing);

        let rows = self.with_conn(|conn| {
            storage::list_items(
                conn,
                P::QUEUE_NAME,
                &[QueueStatus::Pending.as_str(), QueueStatus::Processing.as_str()],
            )
        })?;

        let mut result = SyncResult::default();
        for row in rows {
            let item = self.decode(row)?;
            let item_id = item.id.to_string();

            if item.retries >= self.config.max_retries {
                self.with_conn(|conn| {
                    storage::set_status(conn, &item_id, QueueStatus::Failed.as_str())
                })?;
                result.failed += 1;
                continue;
            }

            let now = Utc::now();
            if self.in_backoff(&item, now) {
                tracing::debug!(queue = P::QUEUE_NAME, item_id = %item.id, retries = item.retries, "item still in backoff");
                result.skipped += 1;
                continue;
            }

            self.with_conn(|conn| storage::mark_processing(conn, &item_id, &timestamp(now)))?;

            match self.processor.process_item(&item.payload).await {
                Ok(receipt) => {
                    let receipt = serde_json::to_string(&receipt).map_err(storage_err)?;
                    self.with_conn(|conn| storage::mark_completed(conn, &item_id, &receipt))?;
                    tracing::debug!(queue = P::QUEUE_NAME, item_id = %item.id, "item delivered");
                    result.success += 1;
                }
                Err(e) => {
                    let retries = item.retries + 1;
                    let status = if retries >= self.config.max_retries {
                        QueueStatus::Failed
                    } else {
                        QueueStatus::Pending
                    };
                    let message = e.to_string();
                    self.with_conn(|conn| {
                        storage::record_failure(
                            conn,
                            &item_id,
                            status.as_str(),
                            i64::from(retries),
                            &message,
                        )
                    })?;
                    tracing::warn!(
                        queue = P::QUEUE_NAME,
                        item_id = %item.id,
                        retries,
                        status = status.as_str(),
                        error = %e,
                        "queued item delivery failed"
                    );
                    result.failed += 1;
                }
            }
        }

        if result != SyncResult::default() {
            tracing::info!(
                queue = P::QUEUE_NAME,
                success = result.success,
                failed = result.failed,
                skipped = result.skipped,
                "queue sync finished"
            );
        }
        Ok(result)
    }

    /// Move every failed item back to pending with `retries = 0`.
    pub fn retry_failed(&self) -> Result<u64, ChatError> {
        self.with_conn(|conn| storage::reset_failed(conn, P::QUEUE_NAME))
    }

    pub fn remove(&self, id: QueueItemId) -> Result<bool, ChatError> {
        self.with_conn(|conn| storage::delete_item(conn, P::QUEUE_NAME, &id.to_string()))
    }

    pub fn clear_completed(&self) -> Result<u64, ChatError> {
        self.with_conn(|conn| {
            storage::delete_by_status(conn, P::QUEUE_NAME, QueueStatus::Completed.as_str())
        })
    }

    pub fn clear(&self) -> Result<u64, ChatError> {
        self.with_conn(|conn| storage::delete_all(conn, P::QUEUE_NAME))
    }

    /// Delete every item whose payload matches `predicate`, whatever its status.
    pub fn purge(&self, predicate: impl Fn(&P::Payload) -> bool) -> Result<u64, ChatError> {
        let mut removed = 0;
        for item in self.get_items(None)? {
            if predicate(&item.payload) && self.remove(item.id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
