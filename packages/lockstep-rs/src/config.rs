//! Engine configuration.

use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};

use crate::applier::ReplayMode;
use crate::core::SourceId;

/// Tunables of one engine instance.
///
/// Every field has a default, so a partial JSON document or an empty
/// environment gives a working configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Which events reach the applier chain, live and on replay.
    pub replay_mode: ReplayMode,
    /// Attempts per event before an output gives up on it.
    pub output_retry_budget: u32,
    /// Initial in-flight ring capacity, rounded up to a power of two.
    pub in_flight_initial_capacity: usize,
    /// Maximum commands dispatched per duty cycle.
    pub dispatch_batch_limit: usize,
    /// Maximum events applied per apply step.
    pub apply_batch_limit: usize,
    /// Maximum events each output publishes per duty cycle.
    pub publish_batch_limit: usize,
    /// Source used for loopback commands sent by outputs.
    pub loopback_source_id: SourceId,
    /// Durable poller name of the command dispatcher.
    pub dispatcher_poller: String,
    /// Durable poller name of the event applier.
    pub applier_poller: String,
    /// Upper bound on cycles run by `run_until_idle`.
    pub max_idle_cycles: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            replay_mode: ReplayMode::ReplayAll,
            output_retry_budget: 3,
            in_flight_initial_capacity: 64,
            dispatch_batch_limit: 64,
            apply_batch_limit: 1024,
            publish_batch_limit: 64,
            loopback_source_id: SourceId::MAX,
            dispatcher_poller: "dispatcher".to_string(),
            applier_poller: "applier".to_string(),
            max_idle_cycles: 10_000,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `LOCKSTEP_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();
        Ok(Self {
            replay_mode: var_or("LOCKSTEP_REPLAY_MODE", defaults.replay_mode)?,
            output_retry_budget: var_or(
                "LOCKSTEP_OUTPUT_RETRY_BUDGET",
                defaults.output_retry_budget,
            )?,
            in_flight_initial_capacity: var_or(
                "LOCKSTEP_IN_FLIGHT_CAPACITY",
                defaults.in_flight_initial_capacity,
            )?,
            dispatch_batch_limit: var_or(
                "LOCKSTEP_DISPATCH_BATCH_LIMIT",
                defaults.dispatch_batch_limit,
            )?,
            apply_batch_limit: var_or("LOCKSTEP_APPLY_BATCH_LIMIT", defaults.apply_batch_limit)?,
            publish_batch_limit: var_or(
                "LOCKSTEP_PUBLISH_BATCH_LIMIT",
                defaults.publish_batch_limit,
            )?,
            loopback_source_id: var_or("LOCKSTEP_LOOPBACK_SOURCE_ID", defaults.loopback_source_id)?,
            dispatcher_poller: env::var("LOCKSTEP_DISPATCHER_POLLER")
                .unwrap_or(defaults.dispatcher_poller),
            applier_poller: env::var("LOCKSTEP_APPLIER_POLLER").unwrap_or(defaults.applier_poller),
            max_idle_cycles: var_or("LOCKSTEP_MAX_IDLE_CYCLES", defaults.max_idle_cycles)?,
        })
    }

    pub fn with_replay_mode(mut self, mode: ReplayMode) -> Self {
        self.replay_mode = mode;
        self
    }

    pub fn with_output_retry_budget(mut self, budget: u32) -> Self {
        self.output_retry_budget = budget;
        self
    }

    pub fn with_in_flight_initial_capacity(mut self, capacity: usize) -> Self {
        self.in_flight_initial_capacity = capacity;
        self
    }

    pub fn with_dispatch_batch_limit(mut self, limit: usize) -> Self {
        self.dispatch_batch_limit = limit;
        self
    }

    pub fn with_apply_batch_limit(mut self, limit: usize) -> Self {
        self.apply_batch_limit = limit;
        self
    }

    pub fn with_publish_batch_limit(mut self, limit: usize) -> Self {
        self.publish_batch_limit = limit;
        self
    }

    pub fn with_loopback_source_id(mut self, source_id: SourceId) -> Self {
        self.loopback_source_id = source_id;
        self
    }

    pub fn with_max_idle_cycles(mut self, cycles: usize) -> Self {
        self.max_idle_cycles = cycles;
        self
    }
}

fn var_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| anyhow::anyhow!("{e}"))
            .with_context(|| format!("{name} must be a valid value, got '{raw}'")),
        Err(_) => Ok(default),
    }
}
