use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use courier_core::{
    Clock, ConversationChannelKey, MessageTransport, OutboundContent, Payload, SendError,
    SendReceipt, SendRequest,
};
use courier_settings::QueueSettings;
use courier_store::{Database, QueueEntry, QueueRepo, QueueStatus, StoreError};

use crate::catalog::TemplateCatalog;
use crate::compliance::ComplianceGate;
use crate::error::EngineError;

/// Retry and timing limits for queued delivery.
#[derive(Clone, Debug)]
pub struct DeliveryConfig {
    pub max_attempts: u32,
    /// Upper bound on a single transport call.
    pub send_timeout: Duration,
    /// How long a claimed entry stays invisible to other workers.
    pub claim_lease: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self::from_settings(&QueueSettings::default())
    }
}

impl DeliveryConfig {
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            send_timeout: settings.send_timeout(),
            claim_lease: settings.claim_lease(),
        }
    }
}

/// Counters for one `drain` of one key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    /// Another drain of the same key was already running; nothing was touched.
    pub skipped: bool,
    pub sent: u32,
    /// Failed attempts that left the entry `Waiting` for a later sweep.
    pub retrying: u32,
    /// Failed attempts that exhausted retries.
    pub failed: u32,
    /// Entries left untouched: window closed and no usable template.
    pub deferred: u32,
    /// Entries another worker had already claimed.
    pub contended: u32,
}

impl DrainReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn attempted(&self) -> u32 {
        self.sent + self.retrying + self.failed
    }
}

enum EntryOutcome {
    Sent,
    Retrying,
    Failed,
    Deferred,
    Contended,
}

/// In-process single-flight guard, one async mutex per key.
#[derive(Default)]
struct KeyLocks {
    locks: DashMap<ConversationChannelKey, Arc<Mutex<()>>>,
}

impl KeyLocks {
    fn try_acquire(&self, key: &ConversationChannelKey) -> Option<OwnedMutexGuard<()>> {
        let lock = self.locks.entry(key.clone()).or_default().clone();
        lock.try_lock_owned().ok()
    }

    /// Forget the lock for `key` once nobody holds or waits on it.
    fn prune(&self, key: &ConversationChannelKey) {
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Durable queue of blocked outbound messages and its drain logic.
pub struct DeliveryQueue {
    queue: QueueRepo,
    gate: Arc<ComplianceGate>,
    catalog: Arc<TemplateCatalog>,
    transport: Arc<dyn MessageTransport>,
    clock: Arc<dyn Clock>,
    config: DeliveryConfig,
    locks: KeyLocks,
}

impl DeliveryQueue {
    pub fn new(
        db: Database,
        gate: Arc<ComplianceGate>,
        catalog: Arc<TemplateCatalog>,
        transport: Arc<dyn MessageTransport>,
        clock: Arc<dyn Clock>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            queue: QueueRepo::new(db),
            gate,
            catalog,
            transport,
            clock,
            config,
            locks: KeyLocks::default(),
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Persist a blocked send as `Waiting`. Storage failures propagate.
    #[instrument(skip(self, payload), fields(key = %key))]
    pub fn enqueue(
        &self,
        key: &ConversationChannelKey,
        recipient: &str,
        payload: &Payload,
    ) -> Result<QueueEntry, EngineError> {
        let entry = self.queue.insert(
            key,
            recipient,
            payload,
            self.config.max_attempts,
            self.clock.now(),
        )?;
        info!(key = %key, entry_id = %entry.id, kind = %entry.kind, "message queued");
        Ok(entry)
    }

    /// Deliver what compliance allows for `key`, oldest entry first.
    ///
    /// Concurrent drains of the same key collapse: the loser returns a
    /// report with `skipped` set instead of waiting.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn drain(&self, key: &ConversationChannelKey) -> Result<DrainReport, EngineError> {
        let Some(guard) = self.locks.try_acquire(key) else {
            debug!(key = %key, "drain already in flight, skipping");
            return Ok(DrainReport::skipped());
        };

        let result = self.drain_locked(key).await;
        drop(guard);
        self.locks.prune(key);
        result
    }

    async fn drain_locked(&self, key: &ConversationChannelKey) -> Result<DrainReport, EngineError> {
        let mut report = DrainReport::default();
        for entry in self.queue.waiting_for_key(key)? {
            match self.process(&entry).await? {
                EntryOutcome::Sent => report.sent += 1,
                EntryOutcome::Retrying => report.retrying += 1,
                EntryOutcome::Failed => report.failed += 1,
                EntryOutcome::Deferred => report.deferred += 1,
                EntryOutcome::Contended => report.contended += 1,
            }
        }
        Ok(report)
    }

    async fn process(&self, entry: &QueueEntry) -> Result<EntryOutcome, EngineError> {
        let now = self.clock.now();
        let lease = chrono::Duration::from_std(self.config.claim_lease)
            .map_err(|e| EngineError::Config(format!("claim lease out of range: {e}")))?;
        if !self.queue.claim(&entry.id, now, lease)? {
            debug!(entry_id = %entry.id, "entry claimed elsewhere");
            return Ok(EntryOutcome::Contended);
        }

        let decision = self.gate.evaluate(&entry.key, now);
        let content = match self.content_for(entry, decision.allowed) {
            Ok(content) => content,
            Err(e @ (EngineError::TemplateUnavailable(_) | EngineError::Render(_))) => {
                debug!(
                    entry_id = %entry.id,
                    reason = ?decision.reason,
                    error = %e,
                    "entry deferred"
                );
                self.queue.release(&entry.id)?;
                return Ok(EntryOutcome::Deferred);
            }
            Err(e) => {
                self.queue.release(&entry.id)?;
                return Err(e);
            }
        };

        let request = SendRequest {
            channel_type: entry.key.channel_type,
            recipient: entry.recipient.clone(),
            content,
        };

        match self.send_bounded(&request).await {
            Ok(receipt) => self.finish_sent(entry, receipt),
            Err(err) => self.finish_failed(entry, &err),
        }
    }

    /// Wire content for `entry`: raw text while the window is open, a
    /// rendered approved template otherwise.
    fn content_for(&self, entry: &QueueEntry, allowed: bool) -> Result<OutboundContent, EngineError> {
        build_content(&self.catalog, entry.key.channel_type, &entry.payload, allowed)
    }

    fn finish_sent(&self, entry: &QueueEntry, receipt: SendReceipt) -> Result<EntryOutcome, EngineError> {
        match self.queue.mark_sent(&entry.id, self.clock.now()) {
            Ok(_) => {
                info!(
                    entry_id = %entry.id,
                    key = %entry.key,
                    provider_message_id = ?receipt.provider_message_id,
                    "queued message sent"
                );
                Ok(EntryOutcome::Sent)
            }
            Err(StoreError::Conflict(msg)) => {
                warn!(entry_id = %entry.id, detail = %msg, "entry left waiting before outcome was recorded");
                Ok(EntryOutcome::Contended)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn finish_failed(&self, entry: &QueueEntry, err: &SendError) -> Result<EntryOutcome, EngineError> {
        let updated = match self.queue.record_failure(&entry.id, self.clock.now(), &err.to_string()) {
            Ok(updated) => updated,
            Err(StoreError::Conflict(msg)) => {
                warn!(entry_id = %entry.id, detail = %msg, "entry left waiting before outcome was recorded");
                return Ok(EntryOutcome::Contended);
            }
            Err(e) => return Err(e.into()),
        };

        if updated.status == QueueStatus::Failed {
            warn!(
                entry_id = %entry.id,
                key = %entry.key,
                attempts = updated.attempts,
                error_kind = err.error_kind(),
                "retries exhausted, entry failed"
            );
            Ok(EntryOutcome::Failed)
        } else {
            info!(
                entry_id = %entry.id,
                attempts = updated.attempts,
                max_attempts = updated.max_attempts,
                error_kind = err.error_kind(),
                "send attempt failed, will retry"
            );
            Ok(EntryOutcome::Retrying)
        }
    }

    /// One transport call under the configured timeout. A timeout is a send failure.
    pub async fn send_bounded(&self, request: &SendRequest) -> Result<SendReceipt, SendError> {
        let timeout = self.config.send_timeout;
        match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout(timeout)),
        }
    }

    /// Send `payload` immediately, for callers that already hold an allow decision.
    pub async fn send_now(
        &self,
        key: &ConversationChannelKey,
        recipient: &str,
        payload: &Payload,
    ) -> Result<SendReceipt, EngineError> {
        let content = build_content(&self.catalog, key.channel_type, payload, true)?;
        let request = SendRequest {
            channel_type: key.channel_type,
            recipient: recipient.to_string(),
            content,
        };
        Ok(self.send_bounded(&request).await?)
    }

    /// Delete `Sent`/`Failed` entries created more than `retention` ago.
    #[instrument(skip(self))]
    pub fn purge_terminal(&self, retention: chrono::Duration) -> Result<usize, EngineError> {
        let cutoff = self.clock.now() - retention;
        let purged = self.queue.purge_terminal(cutoff)?;
        if purged > 0 {
            info!(purged, cutoff = %cutoff, "purged terminal queue entries");
        }
        Ok(purged)
    }

    pub fn keys_with_waiting(&self) -> Result<Vec<ConversationChannelKey>, EngineError> {
        Ok(self.queue.keys_with_waiting()?)
    }
}

fn build_content(
    catalog: &TemplateCatalog,
    channel_type: courier_core::ChannelType,
    payload: &Payload,
    allowed: bool,
) -> Result<OutboundContent, EngineError> {
    if let (true, Payload::Text { body }) = (allowed, payload) {
        return Ok(OutboundContent::Text { body: body.clone() });
    }
    let template = catalog.resolve(channel_type, payload)?.ok_or_else(|| {
        EngineError::TemplateUnavailable(format!("{channel_type}/{}", payload.kind()))
    })?;
    TemplateCatalog::render(&template, &payload.template_params())
}
