use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use courier_core::{Clock, ConversationChannelKey, SystemClock};
use courier_store::{ContactMeta, Database, WindowRepo, WindowRow};

use crate::error::EngineError;

/// Why a send was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// No customer message has ever opened a window for the key.
    NoWindow,
    /// The window exists but `now` is past its expiry.
    WindowExpired,
    /// The window could not be read; treated like `NoWindow`.
    LookupFailed,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoWindow => "no_window",
            Self::WindowExpired => "window_expired",
            Self::LookupFailed => "lookup_failed",
        })
    }
}

/// Outcome of [`ComplianceGate::evaluate`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<WindowRow>,
}

impl Decision {
    fn allow(window: WindowRow) -> Self {
        Self {
            allowed: true,
            reason: None,
            window: Some(window),
        }
    }

    fn deny(reason: DenyReason, window: Option<WindowRow>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            window,
        }
    }
}

/// Decides whether a free-form send to a conversation may proceed now.
///
/// Openness is always recomputed from `now` against `window_expires_at`;
/// the persisted status is only a cache for dashboards.
pub struct ComplianceGate {
    windows: WindowRepo,
    window: Duration,
    clock: Arc<dyn Clock>,
    drain_tx: Option<mpsc::UnboundedSender<ConversationChannelKey>>,
}

impl ComplianceGate {
    pub fn new(db: Database, window: Duration) -> Self {
        Self {
            windows: WindowRepo::new(db),
            window,
            clock: Arc::new(SystemClock),
            drain_tx: None,
        }
    }

    /// Stamp window audit columns from `clock` instead of wall time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Notify `tx` with the key after every successful renewal.
    pub fn with_drain_signal(mut self, tx: mpsc::UnboundedSender<ConversationChannelKey>) -> Self {
        self.drain_tx = Some(tx);
        self
    }

    pub fn window_length(&self) -> Duration {
        self.window
    }

    /// Read-only verdict for `key` at `now`. Storage errors fail closed.
    #[instrument(skip(self), fields(key = %key))]
    pub fn evaluate(&self, key: &ConversationChannelKey, now: DateTime<Utc>) -> Decision {
        match self.windows.get(key) {
            Ok(None) => Decision::deny(DenyReason::NoWindow, None),
            Ok(Some(window)) if window.is_open_at(now) => Decision::allow(window),
            Ok(Some(window)) => Decision::deny(DenyReason::WindowExpired, Some(window)),
            Err(e) => {
                warn!(key = %key, error = %e, "window lookup failed, denying send");
                Decision::deny(DenyReason::LookupFailed, None)
            }
        }
    }

    /// Open or extend the window for an inbound customer message at `now`.
    pub fn renew(
        &self,
        key: &ConversationChannelKey,
        now: DateTime<Utc>,
    ) -> Result<WindowRow, EngineError> {
        self.renew_with(key, now, &ContactMeta::default())
    }

    /// [`renew`](Self::renew) that also records contact/owner metadata.
    pub fn renew_with(
        &self,
        key: &ConversationChannelKey,
        now: DateTime<Utc>,
        meta: &ContactMeta,
    ) -> Result<WindowRow, EngineError> {
        let window = self
            .windows
            .renew(key, now, self.window, meta, self.clock.now())?;
        debug!(key = %key, expires_at = %window.window_expires_at, "window renewed");

        if let Some(tx) = &self.drain_tx {
            // Unbounded send never blocks; a closed receiver only means no reconciler is running.
            let _ = tx.send(key.clone());
        }
        Ok(window)
    }
}
