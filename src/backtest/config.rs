//! Simulation configuration and validation.
//!
//! Every threshold used by the execution, gap and assignment models is carried
//! here. Validation runs once at engine construction; a bad value is the only
//! fatal error class in the simulator.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::risk::{AssignmentConfig, GapRiskConfig};

use super::commission::CommissionModel;
use super::execution::ExecutionConfig;
use super::slippage::SlippageModel;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} = {value} is out of range ({expected})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        expected: &'static str,
    },

    #[error("{field} must be sorted ascending with non-decreasing values")]
    NotMonotonic { field: &'static str },

    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{0} must be ordered: {1}")]
    Ordering(&'static str, &'static str),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

pub(crate) fn check_fraction(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            expected: "0.0..=1.0",
        })
    }
}

pub(crate) fn check_positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            expected: "> 0",
        })
    }
}

pub(crate) fn check_at_least_one(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            expected: ">= 1.0",
        })
    }
}

/// Full configuration for a simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Seed for the run's random generator.
    pub seed: u64,

    /// Shares per contract.
    pub contract_multiplier: u32,

    /// Starting equity for return and drawdown metrics.
    pub initial_equity: Decimal,

    pub execution: ExecutionConfig,
    pub slippage: SlippageModel,
    pub commission: CommissionModel,
    pub gap: GapRiskConfig,
    pub assignment: AssignmentConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            contract_multiplier: 100,
            initial_equity: Decimal::from(100_000),
            execution: ExecutionConfig::default(),
            slippage: SlippageModel::default(),
            commission: CommissionModel::default(),
            gap: GapRiskConfig::default(),
            assignment: AssignmentConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// Parse a TOML document. Missing sections take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section. Called by the engine constructor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.contract_multiplier == 0 {
            return Err(ConfigError::OutOfRange {
                field: "contract_multiplier",
                value: 0.0,
                expected: "> 0",
            });
        }
        if self.initial_equity <= Decimal::ZERO {
            return Err(ConfigError::OutOfRange {
                field: "initial_equity",
                value: self.initial_equity.try_into().unwrap_or(0.0),
                expected: "> 0",
            });
        }
        self.execution.validate()?;
        self.slippage.validate()?;
        self.commission.validate()?;
        self.gap.validate()?;
        self.assignment.validate()?;
        Ok(())
    }

    pub fn multiplier(&self) -> Decimal {
        Decimal::from(self.contract_multiplier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(SimulationConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_zero_multiplier_rejected() {
        let config = SimulationConfig {
            contract_multiplier: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                field: "contract_multiplier",
                ..
            })
        ));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = SimulationConfig::from_toml_str(
            r#"
            seed = 7

            [execution]
            min_open_interest = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.execution.min_open_interest, 100);
        assert_eq!(config.contract_multiplier, 100);
        assert_eq!(config.gap, GapRiskConfig::default());
    }

    #[test]
    fn test_invalid_toml_fraction_fails_fast() {
        let err = SimulationConfig::from_toml_str(
            r#"
            [execution]
            session_boundary_penalty = 1.5
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { .. }));
    }

    #[test]
    fn test_check_helpers() {
        assert!(check_fraction("x", 0.5).is_ok());
        assert!(check_fraction("x", f64::NAN).is_err());
        assert!(check_positive("x", 0.0).is_err());
        assert!(check_at_least_one("x", 0.99).is_err());
    }
}
