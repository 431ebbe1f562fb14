use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::store::{AttemptRecord, DbHandle};

/// Storage for loop guard entries.
#[async_trait]
pub trait AttemptLedger: Send + Sync {
    async fn get(&self, task_id: i64) -> Result<Option<AttemptRecord>>;
    async fn put(&self, task_id: i64, record: AttemptRecord) -> Result<()>;
    async fn clear(&self, task_id: i64) -> Result<()>;
}

/// Process-lifetime ledger; history resets when the coordinator restarts.
#[derive(Default)]
pub struct MemoryLedger {
    entries: Mutex<HashMap<i64, AttemptRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttemptLedger for MemoryLedger {
    async fn get(&self, task_id: i64) -> Result<Option<AttemptRecord>> {
        Ok(self.entries.lock().await.get(&task_id).copied())
    }

    async fn put(&self, task_id: i64, record: AttemptRecord) -> Result<()> {
        self.entries.lock().await.insert(task_id, record);
        Ok(())
    }

    async fn clear(&self, task_id: i64) -> Result<()> {
        self.entries.lock().await.remove(&task_id);
        Ok(())
    }
}

/// Ledger backed by the `loop_guard` table, surviving restarts.
pub struct SqliteLedger {
    db: DbHandle,
}

impl SqliteLedger {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AttemptLedger for SqliteLedger {
    async fn get(&self, task_id: i64) -> Result<Option<AttemptRecord>> {
        self.db.call(move |db| db.get_attempt_record(task_id)).await
    }

    async fn put(&self, task_id: i64, record: AttemptRecord) -> Result<()> {
        self.db
            .call(move |db| db.put_attempt_record(task_id, &record))
            .await
    }

    async fn clear(&self, task_id: i64) -> Result<()> {
        self.db.call(move |db| db.clear_attempt_record(task_id)).await
    }
}

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Outcome of consulting the guard before a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    /// Launch allowed; `attempt` is the 1-based attempt being started.
    Proceed { attempt: u32 },
    /// A failure happened too recently; try again after `remaining`.
    CoolingDown { remaining: Duration },
    /// The attempt budget is spent.
    Exhausted { attempts: u32 },
}

/// Per-task attempt counter with a cooldown after each failure.
#[derive(Clone)]
pub struct LoopGuard {
    ledger: Arc<dyn AttemptLedger>,
    max_attempts: u32,
    cooldown: Duration,
    clock: Clock,
    /// Read-modify-write of one record happens under this lock.
    update: Arc<Mutex<()>>,
}

impl LoopGuard {
    pub fn new(ledger: Arc<dyn AttemptLedger>, max_attempts: u32, cooldown: Duration) -> Self {
        Self {
            ledger,
            max_attempts,
            cooldown,
            clock: Arc::new(Utc::now),
            update: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide whether `task_id` may launch, counting the attempt if so.
    pub async fn check_and_increment(&self, task_id: i64) -> Result<GuardDecision> {
        let _update = self.update.lock().await;
        let mut record = self.ledger.get(task_id).await?.unwrap_or(AttemptRecord {
            attempt_count: 0,
            last_failure_at: None,
        });

        if record.attempt_count >= self.max_attempts {
            return Ok(GuardDecision::Exhausted {
                attempts: record.attempt_count,
            });
        }

        if let Some(last) = record.last_failure_at {
            let elapsed = (self.clock)()
                .signed_duration_since(last)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if elapsed < self.cooldown {
                return Ok(GuardDecision::CoolingDown {
                    remaining: self.cooldown - elapsed,
                });
            }
        }

        record.attempt_count += 1;
        self.ledger.put(task_id, record).await?;
        debug!(task_id, attempt = record.attempt_count, "Loop guard admitted launch");
        Ok(GuardDecision::Proceed {
            attempt: record.attempt_count,
        })
    }

    /// Give back an attempt that never did any work.
    pub async fn refund(&self, task_id: i64) -> Result<()> {
        let _update = self.update.lock().await;
        if let Some(mut record) = self.ledger.get(task_id).await? {
            record.attempt_count = record.attempt_count.saturating_sub(1);
            if record.attempt_count == 0 && record.last_failure_at.is_none() {
                self.ledger.clear(task_id).await?;
            } else {
                self.ledger.put(task_id, record).await?;
            }
        }
        Ok(())
    }

    pub async fn record_failure(&self, task_id: i64) -> Result<()> {
        let _update = self.update.lock().await;
        let mut record = self.ledger.get(task_id).await?.unwrap_or(AttemptRecord {
            attempt_count: 0,
            last_failure_at: None,
        });
        record.last_failure_at = Some((self.clock)());
        self.ledger.put(task_id, record).await
    }

    pub async fn record_success(&self, task_id: i64) -> Result<()> {
        self.ledger.clear(task_id).await
    }

    /// Attempts left before the task is failed permanently.
    pub async fn remaining(&self, task_id: i64) -> Result<u32> {
        let used = self
            .ledger
            .get(task_id)
            .await?
            .map(|r| r.attempt_count)
            .unwrap_or(0);
        Ok(self.max_attempts.saturating_sub(used))
    }
}
