//! Commission model for options trading.
//!
//! Default: $1.00 per contract, charged on every leg of every opening and
//! closing order. Settlement at expiration is free.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::config::ConfigError;

/// Commission for a single order.
#[derive(Debug, Clone, Copy)]
pub struct Commission {
    pub contracts: u32,
    pub per_contract: Decimal,
    pub total: Decimal,
}

impl Commission {
    pub fn calculate(contracts: u32, per_contract: Decimal) -> Self {
        Self {
            contracts,
            per_contract,
            total: per_contract * Decimal::from(contracts),
        }
    }
}

/// Configurable commission model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommissionModel {
    /// Commission per contract.
    pub per_contract: Decimal,
    /// Minimum commission per order.
    pub min_per_order: Decimal,
    /// Maximum commission per order (0 = unlimited).
    pub max_per_order: Decimal,
}

impl Default for CommissionModel {
    fn default() -> Self {
        Self {
            per_contract: Decimal::ONE,
            min_per_order: Decimal::ZERO,
            max_per_order: Decimal::ZERO,
        }
    }
}

impl CommissionModel {
    pub fn new(per_contract: Decimal) -> Self {
        Self {
            per_contract,
            ..Default::default()
        }
    }


    /// Commission for an order touching `contracts` contracts across all legs.
    pub fn calculate(&self, contracts: u32) -> Commission {
        let mut commission = Commission::calculate(contracts, self.per_contract);

        if contracts > 0 && commission.total < self.min_per_order {
            commission.total = self.min_per_order;
        }

        if self.max_per_order > Decimal::ZERO && commission.total > self.max_per_order {
            commission.total = self.max_per_order;
        }

        commission
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("commission.per_contract", self.per_contract),
            ("commission.min_per_order", self.min_per_order),
            ("commission.max_per_order", self.max_per_order),
        ] {
            if value < Decimal::ZERO {
                return Err(ConfigError::OutOfRange {
                    field,
                    value: value.try_into().unwrap_or(0.0),
                    expected: ">= 0",
                });
            }
        }
        if self.max_per_order > Decimal::ZERO && self.max_per_order < self.min_per_order {
            return Err(ConfigError::Ordering(
                "commission",
                "min_per_order <= max_per_order",
            ));
        }
        Ok(())
    }
}
