//! Bridge configuration with environment overrides.

use std::time::Duration;

/// Tunable knobs for one bridge instance.
///
/// Defaults match production cadence; tests pass much shorter values.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// How long a probe waits for a PROBE_REPLY before giving up.
    pub probe_timeout_ms: u64,
    /// Delay before the simulation answers with its PROBE_REPLY.
    pub sim_reply_delay_ms: u64,
    /// Cadence of simulated PROGRESS messages.
    pub sim_tick_interval_ms: u64,
    /// Page target used when a job does not request one.
    pub default_page_target: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 2000,
            sim_reply_delay_ms: 300,
            sim_tick_interval_ms: 1000,
            default_page_target: 5,
        }
    }
}

impl BridgeConfig {
    /// Build a config from the environment, falling back to defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            probe_timeout_ms: env_u64("BRIDGE_PROBE_TIMEOUT_MS", defaults.probe_timeout_ms),
            sim_reply_delay_ms: env_u64("BRIDGE_SIM_REPLY_DELAY_MS", defaults.sim_reply_delay_ms),
            sim_tick_interval_ms: env_u64(
                "BRIDGE_SIM_TICK_INTERVAL_MS",
                defaults.sim_tick_interval_ms,
            ),
            default_page_target: env_u32(
                "BRIDGE_DEFAULT_PAGE_TARGET",
                defaults.default_page_target,
            ),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn sim_reply_delay(&self) -> Duration {
        Duration::from_millis(self.sim_reply_delay_ms)
    }

    pub fn sim_tick_interval(&self) -> Duration {
        Duration::from_millis(self.sim_tick_interval_ms)
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}
