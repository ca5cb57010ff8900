use crate::config::EngineConfig;
use crate::engine::pool::{CycleHook, CycleStats, Epoch};
use tracing::{debug, info, trace};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Installs a fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`. Returns false if a global subscriber already exists.
pub fn init_tracing(default_filter: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    Registry::default()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}

pub fn init_from_config(config: &EngineConfig) -> bool {
    init_tracing(&config.log_filter)
}

/// Logs cycle boundaries. Timing goes out at `info` when enabled,
/// otherwise at `debug`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingCycleHook {
    pub timing: bool,
}

impl TracingCycleHook {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            timing: config.cycle_timing,
        }
    }
}

impl CycleHook for TracingCycleHook {
    fn on_cycle_start(&self, epoch: Epoch) {
        trace!(epoch, "cycle start");
    }

    fn on_cycle_end(&self, stats: &CycleStats) {
        let elapsed_us = stats.elapsed.as_micros() as u64;
        if self.timing {
            info!(
                epoch = stats.epoch,
                stages = stats.processed_stages,
                did_work = stats.did_work,
                elapsed_us,
                "cycle finished"
            );
        } else {
            debug!(epoch = stats.epoch, stages = stats.processed_stages, elapsed_us, "cycle finished");
        }
    }
}
