//! The execution loop: signal intake, exchange event pump, reconciliation
//! ticker and cooperative shutdown.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use arbiter_config::{AppConfig, ExecutionSettings};
use arbiter_core::{AdmissionOutcome, RejectReason, Signal, TradeReason};
use arbiter_exchange::{ExchangeClient, ExchangeEvent, ExchangeEvents};
use arbiter_store::Store;

use crate::filters::FilterChain;
use crate::governor::{Governor, GovernorConfig};
use crate::orders::{OrderManager, OrderPolicy};
use crate::router::SignalRouter;
use crate::{EngineError, EngineResult};

/// Loop-level timing knobs.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub reconcile_interval: Duration,
    pub signal_queue_capacity: usize,
}

impl EngineSettings {
    pub fn from_settings(settings: &ExecutionSettings) -> Self {
        Self {
            reconcile_interval: Duration::from_secs(settings.reconcile_interval_seconds),
            signal_queue_capacity: settings.signal_queue_capacity,
        }
    }
}

/// Counters surfaced on the dashboard.
#[derive(Default)]
pub struct EngineStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl EngineStats {
    pub fn note_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, detail: impl Into<String>) {
        *self.last_error.lock().unwrap() = Some(detail.into());
    }

    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }
}

/// Bounded intake queue with oldest-dropped backpressure.
pub struct SignalQueue {
    inner: Mutex<VecDeque<Signal>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl SignalQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a signal, evicting the oldest entry when full.
    pub fn push(&self, signal: Signal) {
        {
            let mut queue = self.inner.lock().unwrap();
            if queue.len() >= self.capacity {
                let evicted = queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                if let Some(evicted) = evicted {
                    warn!(
                        va_id = %evicted.va_id,
                        symbol = %evicted.symbol,
                        "signal queue full, oldest signal dropped"
                    );
                }
            }
            queue.push_back(signal);
        }
        self.notify.notify_one();
    }

    /// Wait for the next signal; returns `None` once shutdown triggers.
    pub async fn pop(&self, shutdown: &ShutdownSignal) -> Option<Signal> {
        loop {
            if let Some(signal) = self.inner.lock().unwrap().pop_front() {
                return Some(signal);
            }
            if shutdown.triggered() {
                return None;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = shutdown.wait() => return None,
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Cooperative shutdown flag shared by every long-lived task. Created once
/// per engine; ctrl-c flips it, `trigger` does the same programmatically.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    flag: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    /// Create the signal and hook the process ctrl-c handler into it.
    pub fn new() -> Self {
        let signal = Self {
            inner: Arc::default(),
        };
        let hook = signal.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                hook.trigger();
            }
        });
        signal
    }

    pub fn trigger(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    #[must_use]
    pub fn triggered(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        if self.triggered() {
            return;
        }
        self.inner.notify.notified().await;
    }

    /// Sleep that returns `false` when interrupted by shutdown.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.triggered() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.inner.notify.notified() => false,
        }
    }
}

/// Orchestrates the governance pipeline and its background activities.
pub struct ExecutionLoop {
    pub(crate) store: Arc<Store>,
    pub(crate) router: Arc<SignalRouter>,
    pub(crate) governor: Arc<Governor>,
    pub(crate) filters: FilterChain,
    pub(crate) orders: Arc<OrderManager>,
    pub(crate) queue: Arc<SignalQueue>,
    pub(crate) stats: Arc<EngineStats>,
    pub(crate) kill_switch: Arc<AtomicBool>,
    pub(crate) settings: EngineSettings,
    pub(crate) shutdown: ShutdownSignal,
}

impl ExecutionLoop {
    /// Wire every pipeline stage from configuration, a store and a venue.
    pub fn build(
        config: &AppConfig,
        store: Arc<Store>,
        exchange: Arc<dyn ExchangeClient>,
    ) -> EngineResult<Self> {
        let kill_switch = Arc::new(AtomicBool::new(config.kill_switch_enabled));
        let router = Arc::new(SignalRouter::new());
        let governor = Arc::new(Governor::new(
            Arc::clone(&store),
            GovernorConfig::from_settings(&config.governor),
            Arc::clone(&kill_switch),
        ));
        let filters = FilterChain::from_settings(&config.filters)?;
        let orders = Arc::new(OrderManager::new(
            Arc::clone(&store),
            exchange,
            Arc::clone(&governor),
            Arc::clone(&router),
            OrderPolicy::from_settings(&config.execution),
            Arc::clone(&kill_switch),
        ));
        let settings = EngineSettings::from_settings(&config.execution);
        let queue = Arc::new(SignalQueue::new(settings.signal_queue_capacity));
        Ok(Self {
            store,
            router,
            governor,
            filters,
            orders,
            queue,
            stats: Arc::new(EngineStats::default()),
            kill_switch,
            settings,
            shutdown: ShutdownSignal::new(),
        })
    }

    /// Intake handle used by signal producers.
    #[must_use]
    pub fn queue(&self) -> Arc<SignalQueue> {
        Arc::clone(&self.queue)
    }

    #[must_use]
    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    #[must_use]
    pub fn order_manager(&self) -> Arc<OrderManager> {
        Arc::clone(&self.orders)
    }

    #[must_use]
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Rebuild the in-memory caches (router reservations, governor counters)
    /// from persisted positions.
    pub fn rehydrate(&self) -> EngineResult<usize> {
        let positions = self.store.list_positions()?;
        self.router.rehydrate(&positions);
        self.governor.rehydrate()?;
        Ok(positions.len())
    }

    /// Run until shutdown: consume signals, pump exchange events, reconcile
    /// on a timer. Afterwards a final reconciliation runs, open orders are
    /// canceled and the store handle is released last.
    pub async fn run(self: Arc<Self>, events: ExchangeEvents) -> EngineResult<()> {
        let open_positions = self.rehydrate()?;
        info!(open_positions, "execution loop starting");

        let consumer = tokio::spawn(Arc::clone(&self).consume_signals());
        let pump = tokio::spawn(Arc::clone(&self).pump_events(events));
        let reconciler = tokio::spawn(Arc::clone(&self).reconcile_loop());

        let _ = consumer.await;
        let _ = pump.await;
        let _ = reconciler.await;

        // Resting protective stops stay on the venue; only a fatal store
        // fault cancels the book wholesale (see `reconcile_loop`).
        info!("shutdown: final reconciliation pass");
        if let Err(err) = self.orders.reconcile(Utc::now()).await {
            error!(error = %err, "final reconciliation failed");
        }
        info!("execution loop stopped");
        Ok(())
    }

    async fn consume_signals(self: Arc<Self>) {
        while let Some(signal) = self.queue.pop(&self.shutdown).await {
            self.handle_signal(signal).await;
        }
        info!("signal consumer stopped");
    }

    async fn pump_events(self: Arc<Self>, mut events: ExchangeEvents) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.wait() => break,
                event = events.recv() => event,
            };
            match event {
                None => {
                    warn!("exchange event stream closed");
                    break;
                }
                Some(ExchangeEvent::Fill(fill)) => {
                    if let Err(err) = self.orders.apply_fill(fill).await {
                        error!(error = %err, "fill processing failed");
                        self.stats.record_error(err.to_string());
                    }
                }
                Some(ExchangeEvent::Snapshot(snapshot)) => {
                    if let Err(err) = self.orders.on_snapshot(&snapshot).await {
                        error!(error = %err, "snapshot processing failed");
                        self.stats.record_error(err.to_string());
                    }
                }
            }
        }
        info!("event pump stopped");
    }

    async fn reconcile_loop(self: Arc<Self>) {
        while self.shutdown.sleep(self.settings.reconcile_interval).await {
            match self.orders.reconcile(Utc::now()).await {
                Ok(()) => {}
                Err(err @ EngineError::ReconciliationTimeout) => {
                    error!(error = %err, "reconciliation escalated");
                    self.stats.record_error(err.to_string());
                }
                Err(EngineError::Store(err)) => {
                    // Losing the store is fatal: cancel whatever is still
                    // working on the venue and halt the loop.
                    error!(error = %err, "store fault during reconciliation, halting");
                    self.stats.record_error(err.to_string());
                    if let Err(cancel_err) = self.orders.cancel_all_open().await {
                        error!(error = %cancel_err, "failed to cancel open orders");
                    }
                    self.shutdown.trigger();
                }
                Err(err) => {
                    error!(error = %err, "reconciliation pass failed");
                    self.stats.record_error(err.to_string());
                }
            }
        }
        info!("reconciliation ticker stopped");
    }

    /// Run one signal through the pipeline, logging the outcome of each
    /// stage. Opposite-side signals against an open position are manual
    /// exits and skip entry admission entirely.
    pub async fn handle_signal(&self, signal: Signal) {
        let now = Utc::now();
        let va_id = signal.va_id.clone();
        let symbol = signal.symbol.clone();

        match self.store.get_position(&va_id, &symbol) {
            Ok(Some(position)) if position.side == signal.side.inverse() => {
                info!(%va_id, %symbol, qty = %signal.desired_qty, "signal reduces an open position, treating as exit");
                if let Err(err) = self
                    .orders
                    .place_exit(&position, signal.desired_qty, TradeReason::ManualExit)
                    .await
                {
                    error!(%va_id, %symbol, error = %err, "manual exit failed");
                    self.stats.record_error(err.to_string());
                }
                return;
            }
            Ok(_) => {}
            Err(err) => {
                error!(%va_id, %symbol, error = %err, "store unavailable during signal intake");
                self.stats.record_error(err.to_string());
                return;
            }
        }

        if let AdmissionOutcome::Rejected(reason) = self.router.route(&va_id, &symbol) {
            self.log_rejection(&va_id, &symbol, &reason);
            return;
        }

        match self.governor.admit(&va_id, now) {
            Ok(AdmissionOutcome::Accepted) => {}
            Ok(AdmissionOutcome::Rejected(reason)) => {
                self.log_rejection(&va_id, &symbol, &reason);
                self.release_if_unused(&va_id, &symbol);
                return;
            }
            Err(err) => {
                error!(%va_id, %symbol, error = %err, "governor check failed");
                self.stats.record_error(err.to_string());
                self.release_if_unused(&va_id, &symbol);
                return;
            }
        }

        if let AdmissionOutcome::Rejected(reason) = self.filters.evaluate(&signal, now) {
            self.log_rejection(&va_id, &symbol, &reason);
            self.release_if_unused(&va_id, &symbol);
            return;
        }

        match self.orders.place_entry(&signal).await {
            Ok(order) => {
                self.stats.note_accepted();
                info!(
                    va_id,
                    symbol,
                    order_id = %order.order_id,
                    stop = ?order.stop_loss_price,
                    "signal accepted"
                );
            }
            Err(err) => {
                warn!(%va_id, %symbol, error = %err, "entry placement failed");
                self.stats.record_error(err.to_string());
                self.stats.note_rejected();
                self.release_if_unused(&va_id, &symbol);
            }
        }
    }

    fn log_rejection(&self, va_id: &str, symbol: &str, reason: &RejectReason) {
        self.stats.note_rejected();
        info!(va_id, symbol, gate = reason.gate(), %reason, "signal rejected");
    }

    /// A reservation made for a signal that never produced an order or
    /// position must not wedge the account.
    fn release_if_unused(&self, va_id: &str, symbol: &str) {
        let has_position = matches!(self.store.get_position(va_id, symbol), Ok(Some(_)));
        let has_orders = self
            .store
            .open_orders_for_symbol(symbol)
            .map(|orders| orders.iter().any(|order| order.va_id == va_id))
            .unwrap_or(true);
        if !has_position && !has_orders {
            self.router.release(va_id, symbol);
        }
    }
}
