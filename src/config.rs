use anyhow::{ Context, Result };
use serde::{ Deserialize, Serialize };
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_path: String,
    pub fetch: FetchConfig,
    pub sweep: SweepConfig,
    pub general: GeneralConfig,
}

/// Settings for the outbound fetch path: dispatch spacing, retry policy
/// and the two TTLs stamped onto cache rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Minimum gap between upstream dispatches, across all keys.
    pub spacing_ms: u64,
    /// Fixed delay before retrying a failed download.
    pub retry_cooldown_ms: u64,
    /// Per-request HTTP timeout.
    pub request_timeout_secs: u64,
    /// TTL stamped on a row while its download is still in flight.
    pub placeholder_ttl_ms: i64,
    /// TTL stamped on a row after a successful download.
    pub expire_ttl_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    pub busy_interval_ms: u64,
    pub idle_interval_ms: u64,
    pub initial_limit: usize,
    pub max_limit: usize,
    /// Wall-time budget for one sweep step; the batch size adapts around it.
    pub time_budget_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "data/cache.db".to_string(),
            fetch: FetchConfig {
                spacing_ms: 5, // 200 req/s upstream cap
                retry_cooldown_ms: 500,
                request_timeout_secs: 30,
                placeholder_ttl_ms: 5_000,
                expire_ttl_ms: 30_000,
            },
            sweep: SweepConfig {
                busy_interval_ms: 1_000,
                idle_interval_ms: 900_000, // 15 minutes
                initial_limit: 200,
                max_limit: 10_000,
                time_budget_ms: 5,
            },
            general: GeneralConfig {
                log_level: "info".to_string(),
            },
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            let default_config = Self::default();
            default_config.save(path)?;
            return Ok(default_config);
        }

        let content = fs
            ::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Self = serde_json
            ::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json
            ::to_string_pretty(self)
            .with_context(|| "Failed to serialize config")?;

        fs::write(path, content).with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.database_path.is_empty() {
            return Err(anyhow::anyhow!("database_path is required in config"));
        }
        if self.sweep.initial_limit == 0 || self.sweep.max_limit == 0 {
            return Err(anyhow::anyhow!("sweep limits must be non-zero"));
        }
        if self.sweep.initial_limit > self.sweep.max_limit {
            return Err(
                anyhow::anyhow!(
                    "sweep.initial_limit ({}) exceeds sweep.max_limit ({})",
                    self.sweep.initial_limit,
                    self.sweep.max_limit
                )
            );
        }
        Ok(())
    }
}

impl FetchConfig {
    pub fn spacing(&self) -> Duration {
        Duration::from_millis(self.spacing_ms)
    }

    pub fn retry_cooldown(&self) -> Duration {
        Duration::from_millis(self.retry_cooldown_ms)
    }
}

impl SweepConfig {
    pub fn busy_interval(&self) -> Duration {
        Duration::from_millis(self.busy_interval_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_millis(self.time_budget_ms)
    }
}
