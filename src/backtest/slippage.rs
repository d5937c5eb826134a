//! Leg-count slippage model.
//!
//! Fill prices are placed a fixed fraction of the way across the bid-ask
//! spread, depending on how many legs the order has. More legs = fills
//! closer to mid per leg, as complex orders are worked as a package.
//!
//! | Legs | Fill % of spread |
//! |------|------------------|
//! | 1    | 75%              |
//! | 2    | 66%              |
//! | 3    | 56%              |
//! | 4    | 53%              |

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::config::ConfigError;
use super::signal::LegAction;

/// Slippage percentage for an order with a given number of legs.
#[derive(Debug, Clone, Copy)]
pub struct Slippage {
    pub legs: usize,
    pub fill_pct: f64,
}

impl Slippage {
    fn fill_fraction(&self) -> Decimal {
        Decimal::try_from(self.fill_pct).unwrap_or(Decimal::ONE)
    }

    /// Fill price when buying.
    /// fill = bid + (ask - bid) * fill_pct
    pub fn buy_fill(&self, bid: Decimal, ask: Decimal) -> Decimal {
        bid + (ask - bid) * self.fill_fraction()
    }

    /// Fill price when selling.
    /// fill = ask - (ask - bid) * fill_pct
    pub fn sell_fill(&self, bid: Decimal, ask: Decimal) -> Decimal {
        ask - (ask - bid) * self.fill_fraction()
    }

    /// Fill price for the given side.
    pub fn fill(&self, action: LegAction, bid: Decimal, ask: Decimal) -> Decimal {
        match action {
            LegAction::Buy => self.buy_fill(bid, ask),
            LegAction::Sell => self.sell_fill(bid, ask),
        }
    }

    /// Dollar cost of filling away from mid.
    pub fn cost(
        &self,
        action: LegAction,
        bid: Decimal,
        ask: Decimal,
        quantity: u32,
        multiplier: Decimal,
    ) -> Decimal {
        let mid = (bid + ask) / Decimal::TWO;
        (self.fill(action, bid, ask) - mid).abs() * Decimal::from(quantity) * multiplier
    }
}

/// Configurable slippage model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlippageModel {
    /// Fill percentages by leg count (1-indexed). Orders with more legs than
    /// entries use the last entry.
    pub fill_pcts: Vec<f64>,
}

impl Default for SlippageModel {
    fn default() -> Self {
        Self::standard()
    }
}

impl SlippageModel {
    /// Create a new slippage model with custom fill percentages.
    pub fn new(fill_pcts: Vec<f64>) -> Self {
        Self { fill_pcts }
    }

    /// Standard package fill percentages.
    pub fn standard() -> Self {
        Self {
            fill_pcts: vec![0.75, 0.66, 0.56, 0.53],
        }
    }

    /// Get slippage for a given number of legs.
    pub fn for_legs(&self, legs: usize) -> Slippage {
        let fill_pct = match self.fill_pcts.last() {
            None => 0.50,
            Some(&last) => self
                .fill_pcts
                .get(legs.saturating_sub(1))
                .copied()
                .unwrap_or(last),
        };
        Slippage { legs, fill_pct }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fill_pcts.is_empty() {
            return Err(ConfigError::Empty {
                field: "slippage.fill_pcts",
            });
        }
        for &pct in &self.fill_pcts {
            if !pct.is_finite() || !(0.5..=1.0).contains(&pct) {
                return Err(ConfigError::OutOfRange {
                    field: "slippage.fill_pcts",
                    value: pct,
                    expected: "0.5..=1.0",
                });
            }
        }
        Ok(())
    }
}
