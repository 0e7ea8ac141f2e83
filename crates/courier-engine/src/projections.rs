use chrono::{DateTime, Duration, Utc};

use courier_store::{Database, QueueCounts, QueueEntry, QueueRepo, QueueStatus, WindowRepo, WindowRow};

use crate::error::EngineError;

/// Default and maximum page size for queue listings.
pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 500;

/// Read-only views for dashboards. Nothing here feeds a compliance decision.
pub struct Projections {
    windows: WindowRepo,
    queue: QueueRepo,
}

impl Projections {
    pub fn new(db: Database) -> Self {
        Self {
            windows: WindowRepo::new(db.clone()),
            queue: QueueRepo::new(db),
        }
    }

    pub fn list_open_windows(&self, now: DateTime<Utc>) -> Result<Vec<WindowRow>, EngineError> {
        Ok(self.windows.list_open(now)?)
    }

    /// Open windows that close within `within` of `now` ("expires soon").
    pub fn list_expiring_windows(
        &self,
        now: DateTime<Utc>,
        within: Duration,
    ) -> Result<Vec<WindowRow>, EngineError> {
        Ok(self.windows.list_expiring(now, within)?)
    }

    /// Newest first. `limit` is clamped to [`MAX_PAGE_SIZE`].
    pub fn list_queue(
        &self,
        status: Option<QueueStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<QueueEntry>, EngineError> {
        Ok(self.queue.list(status, limit.min(MAX_PAGE_SIZE), offset)?)
    }

    pub fn queue_counts(&self) -> Result<QueueCounts, EngineError> {
        Ok(self.queue.counts()?)
    }
}
