use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use courier_core::{Clock, ConversationChannelKey};
use courier_settings::{QueueSettings, ReconcilerSettings};
use courier_store::{Database, WindowRepo};

use crate::delivery::{DeliveryQueue, DrainReport};
use crate::error::EngineError;

#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    pub hourly_interval: Duration,
    pub express_interval: Duration,
    pub cleanup_interval: Duration,
    /// Terminal entries older than this are purged by the cleanup sweep.
    pub retention: chrono::Duration,
    /// Drain a key as soon as its window is renewed.
    pub drain_on_renew: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self::from_settings(&ReconcilerSettings::default(), &QueueSettings::default())
    }
}

impl ReconcilerConfig {
    pub fn from_settings(reconciler: &ReconcilerSettings, queue: &QueueSettings) -> Self {
        Self {
            hourly_interval: Duration::from_secs(reconciler.hourly_interval_secs),
            express_interval: Duration::from_secs(reconciler.express_interval_secs),
            cleanup_interval: Duration::from_secs(reconciler.cleanup_interval_secs),
            retention: chrono::Duration::days(i64::from(queue.retention_days)),
            drain_on_renew: reconciler.drain_on_renew,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepKind {
    Hourly,
    Express,
    Cleanup,
}

impl fmt::Display for SweepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hourly => "hourly",
            Self::Express => "express",
            Self::Cleanup => "cleanup",
        })
    }
}

/// Totals for one sweep across every key it touched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub kind: SweepKind,
    pub windows_expired: usize,
    pub keys_drained: u32,
    /// Keys whose drain was already in flight elsewhere.
    pub keys_skipped: u32,
    /// Keys whose drain errored; the sweep carried on with the rest.
    pub keys_failed: u32,
    pub sent: u32,
    pub retrying: u32,
    pub failed: u32,
    pub deferred: u32,
    pub purged: usize,
}

impl SweepReport {
    fn new(kind: SweepKind) -> Self {
        Self {
            kind,
            windows_expired: 0,
            keys_drained: 0,
            keys_skipped: 0,
            keys_failed: 0,
            sent: 0,
            retrying: 0,
            failed: 0,
            deferred: 0,
            purged: 0,
        }
    }

    fn absorb(&mut self, drain: &DrainReport) {
        if drain.skipped {
            self.keys_skipped += 1;
            return;
        }
        self.keys_drained += 1;
        self.sent += drain.sent;
        self.retrying += drain.retrying;
        self.failed += drain.failed;
        self.deferred += drain.deferred;
    }
}

/// Scheduled orchestration over windows and the delivery queue.
///
/// Every sweep is idempotent and safe to overlap with the others; per-key
/// exclusion lives in [`DeliveryQueue::drain`].
pub struct Reconciler {
    windows: WindowRepo,
    delivery: Arc<DeliveryQueue>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        db: Database,
        delivery: Arc<DeliveryQueue>,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            windows: WindowRepo::new(db),
            delivery,
            clock,
            config,
        }
    }

    /// Mark lapsed windows `Expired`, then drain every key with a backlog.
    pub async fn hourly_sweep(&self) -> Result<SweepReport, EngineError> {
        let mut report = SweepReport::new(SweepKind::Hourly);
        match self.windows.mark_expired(self.clock.now()) {
            Ok(n) => report.windows_expired = n,
            // Status is a cached projection; a failed refresh must not block delivery.
            Err(e) => warn!(error = %e, "failed to mark expired windows"),
        }
        self.drain_all(&mut report).await?;
        info!(sweep = %report.kind, ?report, "sweep finished");
        Ok(report)
    }

    /// Drain only, without the expiry pass.
    pub async fn express_sweep(&self) -> Result<SweepReport, EngineError> {
        let mut report = SweepReport::new(SweepKind::Express);
        self.drain_all(&mut report).await?;
        info!(sweep = %report.kind, ?report, "sweep finished");
        Ok(report)
    }

    pub async fn cleanup_sweep(&self) -> Result<SweepReport, EngineError> {
        let mut report = SweepReport::new(SweepKind::Cleanup);
        report.purged = self.delivery.purge_terminal(self.config.retention)?;
        info!(sweep = %report.kind, purged = report.purged, "sweep finished");
        Ok(report)
    }

    pub async fn run(&self, kind: SweepKind) -> Result<SweepReport, EngineError> {
        match kind {
            SweepKind::Hourly => self.hourly_sweep().await,
            SweepKind::Express => self.express_sweep().await,
            SweepKind::Cleanup => self.cleanup_sweep().await,
        }
    }

    async fn drain_all(&self, report: &mut SweepReport) -> Result<(), EngineError> {
        for key in self.delivery.keys_with_waiting()? {
            match self.delivery.drain(&key).await {
                Ok(drain) => report.absorb(&drain),
                Err(e) => {
                    report.keys_failed += 1;
                    warn!(
                        sweep = %report.kind,
                        conversation_id = %key.conversation_id,
                        channel = %key.channel_type,
                        error_kind = e.error_kind(),
                        error = %e,
                        "drain failed for key"
                    );
                }
            }
        }
        Ok(())
    }

    /// Drain one key in response to a renewal signal.
    async fn drain_signalled(&self, key: &ConversationChannelKey) {
        match self.delivery.drain(key).await {
            Ok(drain) if drain.skipped => debug!(key = %key, "renewal drain skipped, already in flight"),
            Ok(drain) => debug!(key = %key, sent = drain.sent, "renewal drain finished"),
            Err(e) => warn!(
                conversation_id = %key.conversation_id,
                channel = %key.channel_type,
                error_kind = e.error_kind(),
                error = %e,
                "renewal drain failed"
            ),
        }
    }

    /// Start the three cadences plus, if given, the renewal-signal listener.
    ///
    /// Each cadence waits one full interval before its first sweep. All
    /// tasks stop when `cancel` fires.
    pub fn spawn(
        self: Arc<Self>,
        signals: Option<mpsc::UnboundedReceiver<ConversationChannelKey>>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            spawn_cadence(
                Arc::clone(&self),
                SweepKind::Hourly,
                self.config.hourly_interval,
                cancel.clone(),
            ),
            spawn_cadence(
                Arc::clone(&self),
                SweepKind::Express,
                self.config.express_interval,
                cancel.clone(),
            ),
            spawn_cadence(
                Arc::clone(&self),
                SweepKind::Cleanup,
                self.config.cleanup_interval,
                cancel.clone(),
            ),
        ];

        if let Some(rx) = signals {
            handles.push(spawn_signal_listener(self, rx, cancel));
        }
        handles
    }
}

fn spawn_cadence(
    reconciler: Arc<Reconciler>,
    kind: SweepKind,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = reconciler.run(kind).await {
                        warn!(sweep = %kind, error_kind = e.error_kind(), error = %e, "sweep aborted");
                    }
                }
            }
        }
        debug!(sweep = %kind, "cadence stopped");
    })
}

fn spawn_signal_listener(
    reconciler: Arc<Reconciler>,
    mut rx: mpsc::UnboundedReceiver<ConversationChannelKey>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let key = tokio::select! {
                () = cancel.cancelled() => break,
                key = rx.recv() => match key {
                    Some(key) => key,
                    None => break,
                },
            };
            // Renewals still flow when disabled; the express sweep picks the key up.
            if reconciler.config.drain_on_renew {
                reconciler.drain_signalled(&key).await;
            }
        }
        debug!("renewal listener stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use courier_core::mock::MockTransport;
    use courier_core::{ChannelType, ManualClock, MessageTransport, Payload};
    use courier_store::{QueueRepo, QueueStatus, WindowStatus};

    use crate::catalog::TemplateCatalog;
    use crate::compliance::ComplianceGate;
    use crate::delivery::DeliveryConfig;

    struct Harness {
        db: Database,
        clock: Arc<ManualClock>,
        gate: Arc<ComplianceGate>,
        delivery: Arc<DeliveryQueue>,
        transport: Arc<MockTransport>,
        reconciler: Arc<Reconciler>,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn harness_with(transport: MockTransport, config: ReconcilerConfig) -> (Harness, mpsc::UnboundedReceiver<ConversationChannelKey>) {
        let db = Database::in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = Arc::new(
            ComplianceGate::new(db.clone(), chrono::Duration::hours(24)).with_drain_signal(tx),
        );
        let transport = Arc::new(transport);
        let dyn_transport: Arc<dyn MessageTransport> = transport.clone();
        let delivery = Arc::new(DeliveryQueue::new(
            db.clone(),
            gate.clone(),
            Arc::new(TemplateCatalog::new(db.clone())),
            dyn_transport,
            clock.clone(),
            DeliveryConfig::default(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            db.clone(),
            delivery.clone(),
            clock.clone(),
            config,
        ));
        (
            Harness {
                db,
                clock,
                gate,
                delivery,
                transport,
                reconciler,
            },
            rx,
        )
    }

    fn harness(transport: MockTransport) -> Harness {
        harness_with(transport, ReconcilerConfig::default()).0
    }

    fn key(id: &str) -> ConversationChannelKey {
        ConversationChannelKey::new(id, ChannelType::Whatsapp)
    }

    #[tokio::test]
    async fn hourly_marks_expired_and_drains() {
        let h = harness(MockTransport::always_deliver());
        h.gate.renew(&key("stale"), t0()).unwrap();
        h.clock.set(t0() + chrono::Duration::hours(25));
        h.gate.renew(&key("fresh"), h.clock.now()).unwrap();
        h.delivery.enqueue(&key("fresh"), "+1", &Payload::text("hi")).unwrap();

        let report = h.reconciler.hourly_sweep().await.unwrap();
        assert_eq!(report.windows_expired, 1);
        assert_eq!(report.keys_drained, 1);
        assert_eq!(report.sent, 1);

        let stale = WindowRepo::new(h.db.clone()).get(&key("stale")).unwrap().unwrap();
        assert_eq!(stale.status, WindowStatus::Expired);
    }

    #[tokio::test]
    async fn express_skips_expiry_marking() {
        let h = harness(MockTransport::always_deliver());
        h.gate.renew(&key("stale"), t0()).unwrap();
        h.clock.set(t0() + chrono::Duration::hours(25));

        let report = h.reconciler.express_sweep().await.unwrap();
        assert_eq!(report.windows_expired, 0);
        let stale = WindowRepo::new(h.db.clone()).get(&key("stale")).unwrap().unwrap();
        assert_eq!(stale.status, WindowStatus::Open);
    }

    #[tokio::test]
    async fn failing_key_does_not_abort_sweep() {
        let h = harness(MockTransport::always_deliver());
        h.gate.renew(&key("good"), t0()).unwrap();
        h.delivery.enqueue(&key("bad"), "+1", &Payload::text("x")).unwrap();
        h.delivery.enqueue(&key("good"), "+1", &Payload::text("y")).unwrap();

        // Template lookups for the closed "bad" key hit a missing table.
        h.db
            .with_conn(|conn| {
                conn.execute_batch("DROP TABLE templates")?;
                Ok(())
            })
            .unwrap();

        let report = h.reconciler.express_sweep().await.unwrap();
        assert_eq!(report.keys_failed, 1);
        assert_eq!(report.sent, 1);

        let repo = QueueRepo::new(h.db.clone());
        let bad = repo.waiting_for_key(&key("bad")).unwrap();
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].attempts, 0);
        assert!(bad[0].claimed_until.is_none());
    }

    #[tokio::test]
    async fn cleanup_purges_only_terminal() {
        let h = harness(MockTransport::always_deliver());
        let repo = QueueRepo::new(h.db.clone());
        let waiting = h.delivery.enqueue(&key("a"), "+1", &Payload::text("w")).unwrap();
        let done = h.delivery.enqueue(&key("a"), "+1", &Payload::text("d")).unwrap();
        repo.mark_sent(&done.id, t0()).unwrap();
        h.clock.set(t0() + chrono::Duration::days(8));

        let report = h.reconciler.cleanup_sweep().await.unwrap();
        assert_eq!(report.purged, 1);
        assert_eq!(repo.get(&waiting.id).unwrap().status, QueueStatus::Waiting);
    }

    #[tokio::test]
    async fn sweeps_are_idempotent() {
        let h = harness(MockTransport::always_deliver());
        h.gate.renew(&key("a"), t0()).unwrap();
        h.delivery.enqueue(&key("a"), "+1", &Payload::text("once")).unwrap();

        assert_eq!(h.reconciler.hourly_sweep().await.unwrap().sent, 1);
        let again = h.reconciler.hourly_sweep().await.unwrap();
        assert_eq!(again.sent, 0);
        assert_eq!(again.keys_drained, 0);
        assert_eq!(h.transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_signal_triggers_drain() {
        let (h, rx) = harness_with(MockTransport::always_deliver(), ReconcilerConfig::default());
        h.delivery.enqueue(&key("a"), "+1", &Payload::text("waiting")).unwrap();

        let cancel = CancellationToken::new();
        let handles = Arc::clone(&h.reconciler).spawn(Some(rx), cancel.clone());

        h.gate.renew(&key("a"), t0()).unwrap();
        for _ in 0..50 {
            if h.transport.call_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.transport.call_count(), 1);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_signal_ignored_when_disabled() {
        let config = ReconcilerConfig {
            drain_on_renew: false,
            ..ReconcilerConfig::default()
        };
        let (h, rx) = harness_with(MockTransport::always_deliver(), config);
        h.delivery.enqueue(&key("a"), "+1", &Payload::text("waiting")).unwrap();

        let cancel = CancellationToken::new();
        let handles = Arc::clone(&h.reconciler).spawn(Some(rx), cancel.clone());
        h.gate.renew(&key("a"), t0()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.transport.call_count(), 0);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn express_cadence_fires_on_interval() {
        let config = ReconcilerConfig {
            express_interval: Duration::from_secs(900),
            drain_on_renew: false,
            ..ReconcilerConfig::default()
        };
        let (h, _rx) = harness_with(MockTransport::always_deliver(), config);
        h.gate.renew(&key("a"), t0()).unwrap();
        h.delivery.enqueue(&key("a"), "+1", &Payload::text("later")).unwrap();

        let cancel = CancellationToken::new();
        let handles = Arc::clone(&h.reconciler).spawn(None, cancel.clone());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.transport.call_count(), 0);

        tokio::time::sleep(Duration::from_secs(900)).await;
        assert_eq!(h.transport.call_count(), 1);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[test]
    fn config_from_settings() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.hourly_interval, Duration::from_secs(3_600));
        assert_eq!(config.express_interval, Duration::from_secs(900));
        assert_eq!(config.cleanup_interval, Duration::from_secs(21_600));
        assert_eq!(config.retention, chrono::Duration::days(7));
        assert!(config.drain_on_renew);
    }
}
