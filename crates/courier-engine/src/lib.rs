//! # courier-engine
//!
//! Compliance-window enforcement and durable delivery for outbound
//! conversational messages.
//!
//! - [`ComplianceGate`]: may a free-form send to a conversation happen now?
//! - [`DeliveryQueue`]: persisted backlog of blocked sends with bounded retry
//!   and template fallback
//! - [`Reconciler`]: hourly, express and cleanup sweeps
//! - [`Dispatcher`]: inbound/outbound entry points

pub mod catalog;
pub mod compliance;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod http_transport;
pub mod projections;
pub mod reconciler;
pub mod services;

pub use catalog::TemplateCatalog;
pub use compliance::{ComplianceGate, Decision, DenyReason};
pub use delivery::{DeliveryConfig, DeliveryQueue, DrainReport};
pub use dispatcher::{DispatchOutcome, Dispatcher, InboundMessage, OutboundIntent};
pub use error::EngineError;
pub use http_transport::{transport_from_settings, HttpTransport, LogTransport};
pub use projections::Projections;
pub use reconciler::{Reconciler, ReconcilerConfig, SweepKind, SweepReport};
pub use services::CourierServices;
