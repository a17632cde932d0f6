//! Randomized demo feed: a simulated market plus a naive signal producer,
//! enough to exercise the whole governance pipeline locally.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::info;

use arbiter_core::{MarketSnapshot, Side, Signal};
use arbiter_engine::{ShutdownSignal, SignalQueue};
use arbiter_paper::PaperExchange;

/// Random-walk price feed pushed into the paper venue as market snapshots.
pub async fn run_price_feed(
    venue: PaperExchange,
    symbols: Vec<String>,
    interval: Duration,
    shutdown: ShutdownSignal,
) {
    let mut rng = StdRng::from_entropy();
    let mut prices: HashMap<String, f64> = symbols
        .iter()
        .map(|symbol| (symbol.clone(), rng.gen_range(90.0..110.0)))
        .collect();

    while shutdown.sleep(interval).await {
        for symbol in &symbols {
            let price = prices.get_mut(symbol).unwrap();
            *price *= 1.0 + rng.gen_range(-0.002..0.002);
            let spread = rng.gen_range(0.01..0.05);
            let snapshot = MarketSnapshot {
                symbol: symbol.clone(),
                bid: Decimal::from_f64(*price - spread / 2.0).unwrap_or_default(),
                ask: Decimal::from_f64(*price + spread / 2.0).unwrap_or_default(),
                last: Decimal::from_f64(*price).unwrap_or_default(),
                as_of: Utc::now(),
                source_latency_ms: rng.gen_range(20.0..120.0),
            };
            venue.push_snapshot(snapshot).await;
        }
    }
    info!("price feed stopped");
}

/// Emit a random signal every few seconds, the way the original simulation
/// harness did.
pub async fn run_signal_feed(
    queue: Arc<SignalQueue>,
    venue: PaperExchange,
    va_ids: Vec<String>,
    symbols: Vec<String>,
    shutdown: ShutdownSignal,
) {
    let mut rng = StdRng::from_entropy();
    loop {
        let pause = Duration::from_millis(rng.gen_range(5_000..15_000));
        if !shutdown.sleep(pause).await {
            break;
        }
        let va_id = va_ids[rng.gen_range(0..va_ids.len())].clone();
        let symbol = symbols[rng.gen_range(0..symbols.len())].clone();
        let side = if rng.gen_bool(0.5) { Side::Buy } else { Side::Sell };
        let qty = Decimal::from(rng.gen_range(10..100));
        let Some(last) = venue.last_price(&symbol) else {
            continue;
        };
        let spread = Decimal::from_f64(rng.gen_range(0.01..0.05)).unwrap_or_default();
        let half = spread / Decimal::TWO;
        let snapshot = MarketSnapshot {
            symbol: symbol.clone(),
            bid: last - half,
            ask: last + half,
            last,
            as_of: Utc::now(),
            source_latency_ms: rng.gen_range(20.0..120.0),
        };
        info!(%va_id, %symbol, ?side, %qty, price = %last, "demo signal");
        queue.push(Signal::new(va_id, symbol, side, qty, snapshot));
    }
    info!("signal feed stopped");
}
