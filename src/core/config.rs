//! Configuration - Type-safe, validated config
//!
//! Loaded from a TOML file, then overridden from `CLOB_ENGINE__SECTION__KEY`
//! environment variables and `--set section.key=value` flags. Every override
//! goes through [`Config::set_option`], so unknown keys and unparsable values
//! fail the same way no matter where they come from.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::core::{Error, Result};
use crate::risk::RiskLimits;
use crate::strategies::StrategyConfig;

/// Environment prefix for overrides: `CLOB_ENGINE__ENGINE__TICK_INTERVAL_MS=250`.
pub const ENV_PREFIX: &str = "CLOB_ENGINE__";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Application settings
    #[serde(default)]
    pub app: AppConfig,

    /// Event loop settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Risk limits, immutable for the life of a run
    #[serde(default)]
    pub risk: RiskLimits,

    /// Strategies, in registration order
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Log level (RUST_LOG takes precedence)
    pub log_level: String,

    /// Route orders to the paper client instead of a live venue
    pub dry_run: bool,

    /// Paper client fills every acknowledged order in full
    pub paper_fill: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            dry_run: true,
            paper_fill: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Periodic tick interval
    pub tick_interval_ms: u64,

    /// A book with no update for this long is stale
    pub staleness_window_ms: u64,

    /// Bounded wait for in-flight orders after shutdown is requested
    pub shutdown_grace_ms: u64,

    /// Book updates to observe before Buy/Sell signals are let through
    pub warmup_updates: u64,

    /// Stop after this many ticks
    pub max_ticks: Option<u64>,

    /// Fill price deviation from the book mid (fraction) that is flagged
    pub max_fill_deviation: Option<Decimal>,

    /// Capacity of the market-data channel
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            staleness_window_ms: 5000,
            shutdown_grace_ms: 5000,
            warmup_updates: 0,
            max_ticks: None,
            max_fill_deviation: Some(Decimal::new(10, 2)),
            channel_capacity: 4096,
        }
    }
}

impl EngineConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn staleness_window(&self) -> Duration {
        Duration::from_millis(self.staleness_window_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Config {
    /// Load from TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load from the first default location that exists, else defaults.
    pub fn load_default() -> Result<Self> {
        let candidates = ["config.toml", concat!(env!("CARGO_MANIFEST_DIR"), "/config.toml")];

        for path in candidates.iter().map(Path::new) {
            if path.exists() {
                let cfg = Self::load(path)?;
                tracing::info!(path = %path.display(), "Loaded config");
                return Ok(cfg);
            }
        }

        tracing::warn!("No config.toml found, using defaults");
        Ok(Self::default())
    }

    /// Set a single option by its dotted name (`engine.tick_interval_ms`).
    ///
    /// Optional values are cleared with `none`.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key {
            "app.log_level" => self.app.log_level = value.to_string(),
            "app.dry_run" => self.app.dry_run = parse(key, value)?,
            "app.paper_fill" => self.app.paper_fill = parse(key, value)?,

            "engine.tick_interval_ms" => self.engine.tick_interval_ms = parse(key, value)?,
            "engine.staleness_window_ms" => self.engine.staleness_window_ms = parse(key, value)?,
            "engine.shutdown_grace_ms" => self.engine.shutdown_grace_ms = parse(key, value)?,
            "engine.warmup_updates" => self.engine.warmup_updates = parse(key, value)?,
            "engine.max_ticks" => self.engine.max_ticks = parse_opt(key, value)?,
            "engine.max_fill_deviation" => self.engine.max_fill_deviation = parse_opt(key, value)?,
            "engine.channel_capacity" => self.engine.channel_capacity = parse(key, value)?,

            "risk.max_position_size" => self.risk.max_position_size = parse(key, value)?,
            "risk.max_total_exposure" => self.risk.max_total_exposure = parse(key, value)?,
            "risk.max_order_notional" => self.risk.max_order_notional = parse_opt(key, value)?,
            "risk.max_open_orders" => self.risk.max_open_orders = parse_opt(key, value)?,
            "risk.max_loss" => self.risk.max_loss = parse_opt(key, value)?,

            _ => return Err(Error::UnknownOption(key.to_string())),
        }
        tracing::debug!(option = key, value, "Config option set");
        Ok(())
    }

    /// Apply `KEY=VALUE` pairs whose key carries [`ENV_PREFIX`].
    /// Other keys are ignored.
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(rest) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let key = rest.to_lowercase().replacen("__", ".", 1);
            self.set_option(&key, &value)?;
        }
        Ok(())
    }

    /// Overrides from the process environment, after loading `.env`.
    pub fn apply_process_env(&mut self) -> Result<()> {
        dotenv::dotenv().ok();
        self.apply_env_overrides(std::env::vars())
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let e = &self.engine;
        if e.tick_interval_ms == 0 {
            return Err(Error::Config("engine.tick_interval_ms must be > 0".into()));
        }
        if e.staleness_window_ms == 0 {
            return Err(Error::Config("engine.staleness_window_ms must be > 0".into()));
        }
        if e.channel_capacity == 0 {
            return Err(Error::Config("engine.channel_capacity must be > 0".into()));
        }
        if matches!(e.max_fill_deviation, Some(d) if d <= Decimal::ZERO) {
            return Err(Error::Config("engine.max_fill_deviation must be > 0".into()));
        }

        self.risk.validate()?;

        let mut names = HashSet::new();
        for s in &self.strategies {
            if s.name.trim().is_empty() {
                return Err(Error::Config(format!("strategy of kind '{}' has no name", s.kind)));
            }
            if !names.insert(s.name.as_str()) {
                return Err(Error::Config(format!("duplicate strategy name '{}'", s.name)));
            }
        }
        Ok(())
    }
}

fn parse<T: FromStr>(option: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| Error::InvalidOption {
        option: option.to_string(),
        value: value.to_string(),
    })
}

fn parse_opt<T: FromStr>(option: &str, value: &str) -> Result<Option<T>> {
    if value.eq_ignore_ascii_case("none") || value.is_empty() {
        return Ok(None);
    }
    parse(option, value).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const SAMPLE: &str = r#"
[app]
log_level = "debug"

[engine]
tick_interval_ms = 250
max_ticks = 10

[risk]
max_position_size = 100
max_total_exposure = 5000
max_loss = 250.5

[[strategies]]
name = "mm"
kind = "market_maker"
instruments = ["tok-a"]
spread_bps = 150
"#;

    #[test]
    fn test_parse_sample() {
        let cfg = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.app.log_level, "debug");
        assert_eq!(cfg.engine.tick_interval_ms, 250);
        assert_eq!(cfg.engine.max_ticks, Some(10));
        assert_eq!(cfg.engine.staleness_window_ms, 5000);
        assert_eq!(cfg.risk.max_position_size, dec!(100));
        assert_eq!(cfg.risk.max_loss, Some(dec!(250.5)));
        assert_eq!(cfg.strategies.len(), 1);
        assert_eq!(cfg.strategies[0].kind, "market_maker");
        assert!(cfg.strategies[0].params.contains_key("spread_bps"));
        cfg.validate().unwrap();
    }

    #[test]
    fn test_set_option() {
        let mut cfg = Config::default();
        cfg.set_option("engine.tick_interval_ms", "50").unwrap();
        cfg.set_option("risk.max_order_notional", "12.5").unwrap();
        cfg.set_option("risk.max_loss", "none").unwrap();
        assert_eq!(cfg.engine.tick_interval_ms, 50);
        assert_eq!(cfg.risk.max_order_notional, Some(dec!(12.5)));
        assert_eq!(cfg.risk.max_loss, None);

        assert!(matches!(
            cfg.set_option("engine.warp_drive", "1"),
            Err(Error::UnknownOption(_))
        ));
        assert!(matches!(
            cfg.set_option("engine.tick_interval_ms", "fast"),
            Err(Error::InvalidOption { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = Config::default();
        let vars = vec![
            ("CLOB_ENGINE__ENGINE__SHUTDOWN_GRACE_MS".to_string(), "1500".to_string()),
            ("CLOB_ENGINE__APP__DRY_RUN".to_string(), "false".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ];
        cfg.apply_env_overrides(vars).unwrap();
        assert_eq!(cfg.engine.shutdown_grace_ms, 1500);
        assert!(!cfg.app.dry_run);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.engine.tick_interval_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.risk.max_total_exposure = dec!(-1);
        assert!(cfg.validate().is_err());

        let cfg = Config::from_toml_str(
            r#"
[[strategies]]
name = "dup"
kind = "spread_watcher"

[[strategies]]
name = "dup"
kind = "market_maker"
"#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let path = Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/config.toml"));
        let cfg = Config::load(path).unwrap();
        cfg.validate().unwrap();
        let runtime = crate::strategies::StrategyRuntime::from_configs(&cfg.strategies).unwrap();
        assert_eq!(runtime.names().collect::<Vec<_>>(), vec!["mm"]);
    }
}
