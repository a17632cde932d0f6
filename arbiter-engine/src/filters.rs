//! Pre-trade admission gates, evaluated in order with the first rejection
//! short-circuiting: trading window, spread, slippage, latency.

use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use arbiter_config::FilterSettings;
use arbiter_core::{AdmissionOutcome, MarketSnapshot, RejectReason, Signal};

use crate::{EngineError, EngineResult};

/// Stateless filter chain; thresholds come from configuration.
#[derive(Clone, Debug)]
pub struct FilterChain {
    max_spread_bps: Decimal,
    max_slippage_bps: Decimal,
    max_latency_ms: f64,
    window: Option<(NaiveTime, NaiveTime)>,
    window_offset: FixedOffset,
}

impl FilterChain {
    pub fn from_settings(settings: &FilterSettings) -> EngineResult<Self> {
        let window = parse_window(
            &settings.trading_window_start,
            &settings.trading_window_end,
        )?;
        let window_offset = FixedOffset::east_opt(settings.trading_window_utc_offset_minutes * 60)
            .ok_or_else(|| {
                EngineError::Config(format!(
                    "trading window offset {} minutes is out of range",
                    settings.trading_window_utc_offset_minutes
                ))
            })?;
        Ok(Self {
            max_spread_bps: settings.max_spread_bps,
            max_slippage_bps: settings.max_slippage_bps,
            max_latency_ms: settings.max_latency_ms,
            window,
            window_offset,
        })
    }

    #[must_use]
    pub fn max_spread_bps(&self) -> Decimal {
        self.max_spread_bps
    }

    #[must_use]
    pub fn max_slippage_bps(&self) -> Decimal {
        self.max_slippage_bps
    }

    #[must_use]
    pub fn max_latency_ms(&self) -> f64 {
        self.max_latency_ms
    }

    /// Run every gate in order; the first rejection wins.
    pub fn evaluate(&self, signal: &Signal, now: DateTime<Utc>) -> AdmissionOutcome {
        if let Some(reason) = self
            .check_window(now)
            .or_else(|| self.check_spread(&signal.snapshot))
            .or_else(|| self.check_slippage(signal))
            .or_else(|| self.check_latency(&signal.snapshot, now))
        {
            return AdmissionOutcome::Rejected(reason);
        }
        AdmissionOutcome::Accepted
    }

    fn check_window(&self, now: DateTime<Utc>) -> Option<RejectReason> {
        let (start, end) = self.window?;
        let local = now.with_timezone(&self.window_offset).time();
        let inside = if start <= end {
            start <= local && local <= end
        } else {
            // Overnight window wraps midnight.
            local >= start || local <= end
        };
        (!inside).then_some(RejectReason::OutsideTradingWindow)
    }

    fn check_spread(&self, snapshot: &MarketSnapshot) -> Option<RejectReason> {
        let Some(spread_bps) = snapshot.spread_bps() else {
            return Some(RejectReason::InvalidMarket);
        };
        (spread_bps > self.max_spread_bps)
            .then_some(RejectReason::SpreadTooWide { spread_bps })
    }

    fn check_slippage(&self, signal: &Signal) -> Option<RejectReason> {
        let Some(expected) = signal.expected_price else {
            // No expected price on this signal path; the gate does not apply.
            debug!(symbol = %signal.symbol, "slippage gate skipped, no expected price");
            return None;
        };
        let reference = signal.snapshot.last;
        if reference.is_zero() {
            return Some(RejectReason::InvalidMarket);
        }
        let slippage_bps =
            (Decimal::from(10_000) * (expected - reference) / reference).abs();
        (slippage_bps > self.max_slippage_bps)
            .then_some(RejectReason::SlippageTooHigh { slippage_bps })
    }

    fn check_latency(&self, snapshot: &MarketSnapshot, now: DateTime<Utc>) -> Option<RejectReason> {
        let transit = (now - snapshot.as_of).num_milliseconds() as f64;
        let latency_ms = transit + snapshot.source_latency_ms;
        (latency_ms > self.max_latency_ms).then_some(RejectReason::LatencyTooHigh { latency_ms })
    }
}

fn parse_window(
    start: &str,
    end: &str,
) -> EngineResult<Option<(NaiveTime, NaiveTime)>> {
    if start.is_empty() && end.is_empty() {
        return Ok(None);
    }
    let parse = |value: &str| {
        NaiveTime::parse_from_str(value, "%H:%M").map_err(|err| {
            EngineError::Config(format!("invalid trading window bound '{value}': {err}"))
        })
    };
    Ok(Some((parse(start)?, parse(end)?)))
}
