/*
[INPUT]:  YAML configuration file path
[OUTPUT]: Validated engine configuration with account credentials
[POS]:    Configuration layer - runtime parameters for all components
[UPDATE]: When tunables or account settings change
*/

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::monitor::default_tranche_percents;

/// Credentials and endpoint for one exchange account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub api_key: String,
    pub api_secret: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_base_url() -> String {
    "https://api.bybit.com".to_string()
}

/// Full engine configuration, loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub primary: AccountConfig,
    /// Optional second account; replication is disabled when absent.
    #[serde(default)]
    pub mirror: Option<AccountConfig>,

    #[serde(default = "default_category")]
    pub category: String,

    /// Seconds between monitoring ticks.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Relative price tolerance before a protective order is replaced.
    #[serde(default = "default_price_tolerance")]
    pub price_tolerance: Decimal,

    /// Relative quantity tolerance for primary/mirror divergence warnings.
    #[serde(default = "default_mirror_tolerance")]
    pub mirror_qty_tolerance: Decimal,

    /// Ladder allocation percentages; must sum to 100.
    #[serde(default = "default_tranche_percents")]
    pub tranche_percents: Vec<Decimal>,

    /// Take-profit price offsets from entry, percent, one per tranche.
    #[serde(default = "default_tp_offsets")]
    pub tp_offsets_pct: Vec<Decimal>,

    /// Stop-loss price offset from entry, percent.
    #[serde(default = "default_sl_offset")]
    pub sl_offset_pct: Decimal,

    /// Move the stop-loss to entry after the first tranche fills.
    #[serde(default = "default_true")]
    pub breakeven_after_tp1: bool,

    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_category() -> String {
    "linear".to_string()
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_price_tolerance() -> Decimal {
    // 5 bps
    Decimal::new(5, 4)
}

fn default_mirror_tolerance() -> Decimal {
    // 0.1%
    Decimal::new(1, 3)
}

fn default_true() -> bool {
    true
}

fn default_tp_offsets() -> Vec<Decimal> {
    vec![
        Decimal::from(2),
        Decimal::from(4),
        Decimal::from(6),
        Decimal::from(8),
    ]
}

fn default_sl_offset() -> Decimal {
    Decimal::from(5)
}

fn default_store_path() -> PathBuf {
    PathBuf::from("monitors.json")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: EngineConfig =
            serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.primary.api_key.is_empty() || self.primary.api_secret.is_empty() {
            bail!("primary account credentials must not be empty");
        }
        if let Some(mirror) = &self.mirror {
            if mirror.api_key.is_empty() || mirror.api_secret.is_empty() {
                bail!("mirror account credentials must not be empty");
            }
        }
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be positive");
        }
        if self.tranche_percents.is_empty() {
            bail!("tranche_percents must not be empty");
        }
        let total: Decimal = self.tranche_percents.iter().copied().sum();
        if total != Decimal::from(100) {
            bail!("tranche_percents must sum to 100, got {total}");
        }
        if self.tp_offsets_pct.len() != self.tranche_percents.len() {
            bail!(
                "tp_offsets_pct must have one entry per tranche ({} vs {})",
                self.tp_offsets_pct.len(),
                self.tranche_percents.len()
            );
        }
        if self.sl_offset_pct <= Decimal::ZERO {
            bail!("sl_offset_pct must be positive");
        }
        if self.price_tolerance < Decimal::ZERO || self.mirror_qty_tolerance < Decimal::ZERO {
            bail!("tolerances must be non-negative");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn mirror_enabled(&self) -> bool {
        self.mirror.is_some()
    }
}
