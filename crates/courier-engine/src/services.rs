use std::sync::Arc;

use tokio::sync::mpsc;

use courier_core::{Clock, ConversationChannelKey, MessageTransport};
use courier_settings::CourierSettings;
use courier_store::Database;

use crate::catalog::TemplateCatalog;
use crate::compliance::ComplianceGate;
use crate::delivery::{DeliveryConfig, DeliveryQueue};
use crate::dispatcher::Dispatcher;
use crate::error::EngineError;
use crate::projections::Projections;
use crate::reconciler::{Reconciler, ReconcilerConfig};

/// Every engine component, wired over one database, transport and clock.
#[derive(Clone)]
pub struct CourierServices {
    pub gate: Arc<ComplianceGate>,
    pub catalog: Arc<TemplateCatalog>,
    pub delivery: Arc<DeliveryQueue>,
    pub reconciler: Arc<Reconciler>,
    pub dispatcher: Arc<Dispatcher>,
    pub projections: Arc<Projections>,
    pub clock: Arc<dyn Clock>,
}

impl CourierServices {
    /// Build the graph. The returned receiver carries renewal signals for
    /// [`Reconciler::spawn`].
    pub fn build(
        db: Database,
        settings: &CourierSettings,
        transport: Arc<dyn MessageTransport>,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConversationChannelKey>), EngineError> {
        settings
            .validate()
            .map_err(|e| EngineError::Config(e.to_string()))?;

        let (drain_tx, drain_rx) = mpsc::unbounded_channel();
        let window = chrono::Duration::hours(i64::from(settings.compliance.window_hours));
        let gate = Arc::new(
            ComplianceGate::new(db.clone(), window)
                .with_clock(Arc::clone(&clock))
                .with_drain_signal(drain_tx),
        );
        let catalog = Arc::new(TemplateCatalog::new(db.clone()));
        let delivery = Arc::new(DeliveryQueue::new(
            db.clone(),
            Arc::clone(&gate),
            Arc::clone(&catalog),
            transport,
            Arc::clone(&clock),
            DeliveryConfig::from_settings(&settings.queue),
        ));
        let reconciler = Arc::new(Reconciler::new(
            db.clone(),
            Arc::clone(&delivery),
            Arc::clone(&clock),
            ReconcilerConfig::from_settings(&settings.reconciler, &settings.queue),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&gate),
            Arc::clone(&delivery),
            Arc::clone(&clock),
        ));
        let projections = Arc::new(Projections::new(db));

        Ok((
            Self {
                gate,
                catalog,
                delivery,
                reconciler,
                dispatcher,
                projections,
                clock,
            },
            drain_rx,
        ))
    }
}
