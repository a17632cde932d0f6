//! Layered configuration loading utilities.

use std::path::{Path, PathBuf};

use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Global admission block; individual accounts carry their own flag too.
    #[serde(default)]
    pub kill_switch_enabled: bool,
    /// Virtual accounts created at startup when missing from the store.
    #[serde(default)]
    pub accounts: Vec<AccountSeed>,
    #[serde(default)]
    pub governor: GovernorSettings,
    #[serde(default)]
    pub filters: FilterSettings,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub dashboard: DashboardSettings,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AccountSeed {
    pub va_id: String,
    #[serde(default = "default_seed_balance")]
    pub balance: Decimal,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GovernorSettings {
    /// Consecutive losses before a cooldown is armed.
    #[serde(default = "default_max_loss_cooldown")]
    pub max_loss_cooldown: u32,
    #[serde(default = "default_cooldown_duration_seconds")]
    pub cooldown_duration_seconds: u64,
    #[serde(default = "default_max_open_positions_per_va")]
    pub max_open_positions_per_va: usize,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FilterSettings {
    #[serde(default = "default_max_spread_bps")]
    pub max_spread_bps: Decimal,
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: Decimal,
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: f64,
    /// HH:MM bounds; empty strings disable the window gate.
    #[serde(default = "default_trading_window_start")]
    pub trading_window_start: String,
    #[serde(default = "default_trading_window_end")]
    pub trading_window_end: String,
    /// Offset applied before comparing against the window bounds.
    #[serde(default)]
    pub trading_window_utc_offset_minutes: i32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExecutionSettings {
    #[serde(default = "default_reconcile_interval_seconds")]
    pub reconcile_interval_seconds: u64,
    #[serde(default = "default_stale_threshold_seconds")]
    pub stale_threshold_seconds: u64,
    /// Stop distance from the entry reference price, in percent.
    #[serde(default = "default_stop_loss_percentage")]
    pub stop_loss_percentage: Decimal,
    #[serde(default = "default_exchange_call_timeout_ms")]
    pub exchange_call_timeout_ms: u64,
    #[serde(default = "default_sl_attach_failure_limit")]
    pub sl_attach_failure_limit: u32,
    #[serde(default = "default_reconcile_failure_limit")]
    pub reconcile_failure_limit: u32,
    #[serde(default = "default_signal_queue_capacity")]
    pub signal_queue_capacity: usize,
    #[serde(default = "default_monitor_poll_interval_ms")]
    pub monitor_poll_interval_ms: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DashboardSettings {
    #[serde(default = "default_dashboard_refresh_seconds")]
    pub refresh_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            log_level: default_log_level(),
            kill_switch_enabled: false,
            accounts: Vec::new(),
            governor: GovernorSettings::default(),
            filters: FilterSettings::default(),
            execution: ExecutionSettings::default(),
            dashboard: DashboardSettings::default(),
        }
    }
}

impl Default for GovernorSettings {
    fn default() -> Self {
        Self {
            max_loss_cooldown: default_max_loss_cooldown(),
            cooldown_duration_seconds: default_cooldown_duration_seconds(),
            max_open_positions_per_va: default_max_open_positions_per_va(),
        }
    }
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            max_spread_bps: default_max_spread_bps(),
            max_slippage_bps: default_max_slippage_bps(),
            max_latency_ms: default_max_latency_ms(),
            trading_window_start: default_trading_window_start(),
            trading_window_end: default_trading_window_end(),
            trading_window_utc_offset_minutes: 0,
        }
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            reconcile_interval_seconds: default_reconcile_interval_seconds(),
            stale_threshold_seconds: default_stale_threshold_seconds(),
            stop_loss_percentage: default_stop_loss_percentage(),
            exchange_call_timeout_ms: default_exchange_call_timeout_ms(),
            sl_attach_failure_limit: default_sl_attach_failure_limit(),
            reconcile_failure_limit: default_reconcile_failure_limit(),
            signal_queue_capacity: default_signal_queue_capacity(),
            monitor_poll_interval_ms: default_monitor_poll_interval_ms(),
        }
    }
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            refresh_seconds: default_dashboard_refresh_seconds(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./data/arbiter.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_seed_balance() -> Decimal {
    Decimal::from(100_000)
}

fn default_max_loss_cooldown() -> u32 {
    3
}

fn default_cooldown_duration_seconds() -> u64 {
    300
}

fn default_max_open_positions_per_va() -> usize {
    5
}

fn default_max_spread_bps() -> Decimal {
    Decimal::new(10, 0)
}

fn default_max_slippage_bps() -> Decimal {
    Decimal::new(5, 0)
}

fn default_max_latency_ms() -> f64 {
    500.0
}

fn default_trading_window_start() -> String {
    "09:30".to_string()
}

fn default_trading_window_end() -> String {
    "16:00".to_string()
}

fn default_reconcile_interval_seconds() -> u64 {
    5
}

fn default_stale_threshold_seconds() -> u64 {
    30
}

fn default_stop_loss_percentage() -> Decimal {
    Decimal::new(2, 0)
}

fn default_exchange_call_timeout_ms() -> u64 {
    2_000
}

fn default_sl_attach_failure_limit() -> u32 {
    3
}

fn default_reconcile_failure_limit() -> u32 {
    3
}

fn default_signal_queue_capacity() -> usize {
    256
}

fn default_monitor_poll_interval_ms() -> u64 {
    1_000
}

fn default_dashboard_refresh_seconds() -> u64 {
    2
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml`
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `ARBITER__`
pub fn load_config(env: Option<&str>) -> Result<AppConfig> {
    let base_path = Path::new("config");

    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(false));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }

    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));

    builder = builder.add_source(
        Environment::with_prefix("ARBITER")
            .separator("__")
            .ignore_empty(true),
    );

    let config = builder.build()?;
    config
        .try_deserialize()
        .map_err(|err: ConfigError| err.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.governor.max_loss_cooldown, 3);
        assert_eq!(cfg.governor.cooldown_duration_seconds, 300);
        assert_eq!(cfg.filters.max_spread_bps, Decimal::new(10, 0));
        assert_eq!(cfg.execution.reconcile_interval_seconds, 5);
        assert_eq!(cfg.execution.stop_loss_percentage, Decimal::new(2, 0));
        assert!(!cfg.kill_switch_enabled);
    }

    #[test]
    fn partial_sources_fall_back_to_field_defaults() {
        let cfg: AppConfig = Config::builder()
            .add_source(config::File::from_str(
                "[governor]\nmax_loss_cooldown = 5\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.governor.max_loss_cooldown, 5);
        assert_eq!(cfg.governor.cooldown_duration_seconds, 300);
        assert_eq!(cfg.execution.reconcile_interval_seconds, 5);
    }
}
