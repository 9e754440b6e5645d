//! Campaign runner for deterministic simulation campaigns.
//!
//! Executes many seeds with the same parameters, collecting pass/fail
//! results and the first failing seed for replay.

use std::ops::Range;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tm_core::config::SyncConfig;

use crate::network::FaultConfig;
use crate::oracle::{ConvergenceOracle, InvariantViolation, OracleResult};
use crate::{SimulationConfig, SimulationResult, Simulator};

/// Parameters shared by every seed of a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Seeds to execute, e.g. `0..100`.
    pub seed_range: Range<u64>,
    pub client_count: usize,
    pub rounds: u64,
    pub quiet_rounds: u64,
    pub action_rate_percent: u8,
    /// Percent of calls lost in transit.
    pub fault_drop_percent: u8,
    /// Percent of calls refused by the server.
    pub fault_error_percent: u8,
    /// Maximum delivery delay in rounds.
    pub fault_max_delay: u8,
    pub sync: SyncConfig,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        let sim = SimulationConfig::default();
        Self {
            seed_range: 0..100,
            client_count: sim.client_count,
            rounds: sim.rounds,
            quiet_rounds: sim.quiet_rounds,
            action_rate_percent: sim.action_rate_percent,
            fault_drop_percent: sim.fault.drop_rate_percent,
            fault_error_percent: sim.fault.error_rate_percent,
            fault_max_delay: sim.fault.max_delay_rounds,
            sync: sim.sync,
        }
    }
}

impl CampaignConfig {
    #[must_use]
    pub const fn sim_config_for_seed(&self, seed: u64) -> SimulationConfig {
        SimulationConfig {
            seed,
            client_count: self.client_count,
            rounds: self.rounds,
            quiet_rounds: self.quiet_rounds,
            action_rate_percent: self.action_rate_percent,
            fault: FaultConfig {
                max_delay_rounds: self.fault_max_delay,
                drop_rate_percent: self.fault_drop_percent,
                error_rate_percent: self.fault_error_percent,
            },
            sync: self.sync,
        }
    }

    /// # Errors
    ///
    /// Returns an error if the seed range is empty or the per-seed
    /// configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        self.sim_config_for_seed(self.seed_range.start).validate()
    }
}

/// Failure details for a single seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub violations: Vec<String>,
}

/// Aggregate report produced by a campaign run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// First seed that failed, for prioritized replay.
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    /// Seeds in which at least one call failed.
    pub interesting_states_reached: usize,
}

impl CampaignReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A single seed replayed with everything kept for inspection.
#[derive(Debug, Clone)]
pub struct DetailedTrace {
    pub result: SimulationResult,
    pub oracle: OracleResult,
}

/// Run every seed in the campaign.
///
/// # Errors
///
/// Returns an error if config validation fails or a simulation hits an
/// internal error.
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut report = CampaignReport {
        seeds_run: 0,
        seeds_passed: 0,
        first_failure: None,
        failures: Vec::new(),
        interesting_states_reached: 0,
    };

    for seed in config.seed_range.clone() {
        let detail = replay_seed(seed, config)?;
        report.seeds_run += 1;
        if detail.result.interesting_state_reached {
            report.interesting_states_reached += 1;
        }
        if detail.oracle.passed {
            report.seeds_passed += 1;
        } else {
            report.first_failure.get_or_insert(seed);
            report.failures.push(SeedFailure {
                seed,
                violations: detail.oracle.violations.iter().map(ToString::to_string).collect(),
            });
        }
    }
    Ok(report)
}

/// Run a single seed and return `Ok(())` on pass, `Err(violations)` on
/// failure.
///
/// # Errors
///
/// The outer error is an internal simulation failure. The inner `Result`
/// distinguishes pass from invariant violations.
pub fn run_single_seed(
    seed: u64,
    config: &CampaignConfig,
) -> Result<std::result::Result<(), Vec<InvariantViolation>>> {
    let detail = replay_seed(seed, config)?;
    if detail.oracle.passed {
        Ok(Ok(()))
    } else {
        Ok(Err(detail.oracle.violations))
    }
}

/// Replay a single seed with full trace details for debugging.
///
/// # Errors
///
/// Returns an error when config validation or simulation fails.
pub fn replay_seed(seed: u64, config: &CampaignConfig) -> Result<DetailedTrace> {
    let mut simulator = Simulator::new(config.sim_config_for_seed(seed))?;
    let result = simulator.run()?;
    let oracle = ConvergenceOracle::check_all(&result.states, &result.server);
    Ok(DetailedTrace { result, oracle })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(seeds: Range<u64>) -> CampaignConfig {
        CampaignConfig {
            seed_range: seeds,
            rounds: 30,
            ..CampaignConfig::default()
        }
    }

    #[test]
    fn campaign_config_default_is_valid() {
        assert!(CampaignConfig::default().validate().is_ok());
    }

    #[test]
    fn campaign_config_empty_seed_range_rejected() {
        let config = CampaignConfig {
            seed_range: 5..5,
            ..CampaignConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn campaign_config_zero_clients_rejected() {
        let config = CampaignConfig {
            client_count: 0,
            ..CampaignConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn sim_config_for_seed_uses_correct_seed() {
        let config = CampaignConfig::default();
        let sim = config.sim_config_for_seed(42);
        assert_eq!(sim.seed, 42);
        assert_eq!(sim.client_count, config.client_count);
        assert_eq!(sim.fault.drop_rate_percent, config.fault_drop_percent);
    }

    #[test]
    fn run_single_seed_passes() {
        let result = run_single_seed(0, &small(0..1)).expect("sim should not error");
        assert!(result.is_ok(), "seed 0 should pass: {result:?}");
    }

    #[test]
    fn run_campaign_all_seeds_pass() {
        let report = run_campaign(&small(0..20)).expect("campaign should not error");
        assert_eq!(report.seeds_run, 20);
        assert!(
            report.all_passed(),
            "campaign failed: {:?}",
            report.failures.first()
        );
        assert!(report.first_failure.is_none());
        assert!(report.interesting_states_reached > 0);
    }

    #[test]
    fn heavy_faults_still_converge() {
        let config = CampaignConfig {
            client_count: 5,
            fault_drop_percent: 40,
            fault_error_percent: 20,
            fault_max_delay: 4,
            quiet_rounds: 60,
            ..small(100..110)
        };
        let report = run_campaign(&config).expect("campaign should not error");
        assert!(report.all_passed(), "{:?}", report.failures.first());
        assert_eq!(report.interesting_states_reached, 10);
    }

    #[test]
    fn replay_is_deterministic() {
        let config = small(0..1);
        let a = replay_seed(7, &config).expect("replay 1");
        let b = replay_seed(7, &config).expect("replay 2");
        assert_eq!(a.result.trace, b.result.trace);
        assert_eq!(a.result.states, b.result.states);
        assert!(!a.result.trace.is_empty());
    }

    #[test]
    fn campaign_report_serializes_to_json() {
        let report = CampaignReport {
            seeds_run: 10,
            seeds_passed: 9,
            first_failure: Some(7),
            failures: vec![SeedFailure {
                seed: 7,
                violations: vec!["Unsent: client 0 still holds 1 unacknowledged change(s)".into()],
            }],
            interesting_states_reached: 5,
        };
        let json = serde_json::to_string(&report).expect("serialize");
        assert!(json.contains("\"seeds_run\":10"));
        assert!(json.contains("\"first_failure\":7"));
    }
}
