//! Settings type definitions.
//!
//! Field names are camelCase on the wire. Every section is
//! `#[serde(default)]`, so a partial JSON file only overrides what it names.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CourierSettings {
    pub database: DatabaseSettings,
    pub compliance: ComplianceSettings,
    pub queue: QueueSettings,
    pub reconciler: ReconcilerSettings,
    pub transport: TransportSettings,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
}

impl CourierSettings {
    /// Reject values that would break engine invariants.
    pub fn validate(&self) -> Result<()> {
        let checks: [(bool, &str); 7] = [
            (self.compliance.window_hours == 0, "compliance.windowHours must be > 0"),
            (self.queue.max_attempts == 0, "queue.maxAttempts must be > 0"),
            (self.queue.send_timeout_ms == 0, "queue.sendTimeoutMs must be > 0"),
            (self.reconciler.hourly_interval_secs == 0, "reconciler.hourlyIntervalSecs must be > 0"),
            (self.reconciler.express_interval_secs == 0, "reconciler.expressIntervalSecs must be > 0"),
            (self.reconciler.cleanup_interval_secs == 0, "reconciler.cleanupIntervalSecs must be > 0"),
            (self.server.shutdown_timeout_secs == 0, "server.shutdownTimeoutSecs must be > 0"),
        ];
        for (bad, msg) in checks {
            if bad {
                return Err(SettingsError::InvalidValue(msg.to_string()));
            }
        }
        if self.queue.claim_lease_ms <= self.queue.send_timeout_ms {
            return Err(SettingsError::InvalidValue(
                "queue.claimLeaseMs must exceed queue.sendTimeoutMs".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// SQLite file; `:memory:` opens a throwaway database.
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: courier_home().join("database").join("courier.db"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComplianceSettings {
    /// Length of the engagement window opened by a customer message.
    pub window_hours: u32,
    /// Threshold for the "expires soon" projection. Never affects allow/deny.
    pub expiring_soon_minutes: u32,
}

impl Default for ComplianceSettings {
    fn default() -> Self {
        Self {
            window_hours: 24,
            expiring_soon_minutes: 60,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueSettings {
    pub max_attempts: u32,
    /// Terminal entries older than this are purged by the cleanup sweep.
    pub retention_days: u32,
    /// Upper bound on a single transport call.
    pub send_timeout_ms: u64,
    /// How long a drain worker owns an entry it is sending.
    pub claim_lease_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retention_days: 7,
            send_timeout_ms: 10_000,
            claim_lease_ms: 60_000,
        }
    }
}

impl QueueSettings {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_millis(self.claim_lease_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcilerSettings {
    /// Expiry marking + drain.
    pub hourly_interval_secs: u64,
    /// Drain only.
    pub express_interval_secs: u64,
    /// Terminal purge.
    pub cleanup_interval_secs: u64,
    /// Drain a key as soon as an inbound message renews its window.
    pub drain_on_renew: bool,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            hourly_interval_secs: 3_600,
            express_interval_secs: 900,
            cleanup_interval_secs: 21_600,
            drain_on_renew: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    /// Endpoint receiving outbound send requests. Unset means no delivery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// How long shutdown waits for in-flight sweeps and requests.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            shutdown_timeout_secs: 30,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level; `RUST_LOG` wins when set.
    pub level: String,
    /// JSON lines on stdout instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

/// `~/.courier`, falling back to `/tmp/.courier` without a home.
pub fn courier_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".courier")
}
