//! The signal-to-fill governance pipeline.
//!
//! A signal travels `router -> governor -> filters -> order manager`; fills
//! travel back through the order manager into positions, trades and account
//! state. The execution loop in [`runtime`] schedules the concurrent
//! activities (signal intake, reconciliation, stop-loss monitoring) around a
//! shared shutdown signal.

use thiserror::Error;

use arbiter_core::OrderId;
use arbiter_exchange::ExchangeError;
use arbiter_store::StoreError;

pub mod filters;
pub mod governor;
pub mod orders;
pub mod router;
pub mod runtime;
pub mod view;

pub use filters::FilterChain;
pub use governor::{Governor, GovernorConfig};
pub use orders::{OrderManager, OrderPolicy};
pub use router::SignalRouter;
pub use runtime::{EngineSettings, EngineStats, ExecutionLoop, ShutdownSignal, SignalQueue};
pub use view::{AccountView, DashboardSnapshot, PositionView, SystemStatus};

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Faults surfaced by the order manager and execution loop. Admission
/// rejections are not errors and live in [`arbiter_core::AdmissionOutcome`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// The venue refused a submission outright.
    #[error("exchange rejected order: {0}")]
    ExchangeRejected(String),
    /// A protective stop could not be attached; panic-close was initiated.
    #[error("failed to attach stop loss for entry {entry_id}")]
    StopLossAttachFailed { entry_id: OrderId },
    /// The venue reported more quantity than the order ever requested.
    #[error("fill for order {order_id} exceeds requested quantity")]
    InconsistentFill { order_id: OrderId },
    /// The venue stayed unreachable across consecutive reconciliation passes.
    #[error("exchange unreachable across consecutive reconciliation passes")]
    ReconciliationTimeout,
    /// A configuration value could not be interpreted.
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}
