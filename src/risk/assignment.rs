//! Early assignment risk for short legs.
//!
//! Deep in-the-money short options get exercised early, mostly right before
//! expiration and, for calls, the day before an ex-dividend date when the
//! remaining time value is below the dividend. The model turns leg delta,
//! DTE and the dividend calendar into a daily assignment probability and
//! draws at most once per short leg per calendar day.

use chrono::NaiveDate;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::backtest::config::{check_at_least_one, check_fraction, ConfigError};
use crate::backtest::Position;
use crate::data::OptionType;

/// Assignment model parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentConfig {
    /// |delta| at which a short leg becomes assignable.
    pub itm_delta: f64,
    /// |delta| treated as deep in the money.
    pub deep_itm_delta: f64,
    pub base_daily_rate: f64,
    pub deep_daily_rate: f64,

    pub near_expiry_dte: i64,
    pub near_expiry_multiplier: f64,

    /// Short calls this deep take the fixed override the day before ex-div.
    pub dividend_min_delta: f64,
    pub dividend_override_probability: f64,
    /// Days ahead of ex-dividend in which the rate is multiplied.
    pub dividend_window_days: i64,
    pub dividend_multiplier: f64,

    /// Fraction of each leg's spread charged on assignment.
    pub penalty_spread_fraction: f64,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            itm_delta: 0.75,
            deep_itm_delta: 0.95,
            base_daily_rate: 0.01,
            deep_daily_rate: 0.05,
            near_expiry_dte: 7,
            near_expiry_multiplier: 2.0,
            dividend_min_delta: 0.90,
            dividend_override_probability: 0.85,
            dividend_window_days: 7,
            dividend_multiplier: 2.0,
            penalty_spread_fraction: 0.5,
        }
    }
}

impl AssignmentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_fraction("assignment.itm_delta", self.itm_delta)?;
        check_fraction("assignment.deep_itm_delta", self.deep_itm_delta)?;
        if self.itm_delta > self.deep_itm_delta {
            return Err(ConfigError::Ordering(
                "assignment.itm_delta",
                "itm_delta <= deep_itm_delta",
            ));
        }
        check_fraction("assignment.base_daily_rate", self.base_daily_rate)?;
        check_fraction("assignment.deep_daily_rate", self.deep_daily_rate)?;
        if self.near_expiry_dte < 0 {
            return Err(ConfigError::OutOfRange {
                field: "assignment.near_expiry_dte",
                value: self.near_expiry_dte as f64,
                expected: ">= 0",
            });
        }
        check_at_least_one("assignment.near_expiry_multiplier", self.near_expiry_multiplier)?;
        check_fraction("assignment.dividend_min_delta", self.dividend_min_delta)?;
        check_fraction(
            "assignment.dividend_override_probability",
            self.dividend_override_probability,
        )?;
        if self.dividend_window_days < 1 {
            return Err(ConfigError::OutOfRange {
                field: "assignment.dividend_window_days",
                value: self.dividend_window_days as f64,
                expected: ">= 1",
            });
        }
        check_at_least_one("assignment.dividend_multiplier", self.dividend_multiplier)?;
        check_fraction(
            "assignment.penalty_spread_fraction",
            self.penalty_spread_fraction,
        )?;
        Ok(())
    }
}

/// Inputs for one leg on one day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssignmentContext {
    pub right: OptionType,
    pub is_short: bool,
    pub delta: f64,
    pub dte: i64,
    pub as_of: NaiveDate,
    pub ex_dividend_date: Option<NaiveDate>,
}

/// How an assigned position settles.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentSettlement {
    /// Indices of the assigned legs.
    pub assigned_legs: Vec<usize>,
    /// Cost to close, assigned legs at max(mark, intrinsic).
    pub exit_debit: Decimal,
    /// Spread penalty on top of normal exit slippage.
    pub penalty_slippage: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct AssignmentModel {
    config: AssignmentConfig,
}

impl AssignmentModel {
    pub fn new(config: AssignmentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AssignmentConfig {
        &self.config
    }

    /// Probability that the leg is assigned today.
    pub fn daily_probability(&self, ctx: &AssignmentContext) -> f64 {
        if !ctx.is_short {
            return 0.0;
        }
        let depth = ctx.delta.abs();
        if !depth.is_finite() || depth < self.config.itm_delta {
            return 0.0;
        }

        let mut p = if depth >= self.config.deep_itm_delta {
            self.config.deep_daily_rate
        } else {
            self.config.base_daily_rate
        };

        if ctx.dte <= self.config.near_expiry_dte {
            p *= self.config.near_expiry_multiplier;
        }

        if ctx.right == OptionType::Call {
            if let Some(ex_div) = ctx.ex_dividend_date {
                let days_ahead = (ex_div - ctx.as_of).num_days();
                if days_ahead == 1 && depth >= self.config.dividend_min_delta {
                    return self.config.dividend_override_probability.clamp(0.0, 1.0);
                }
                if (1..=self.config.dividend_window_days).contains(&days_ahead) {
                    p *= self.config.dividend_multiplier;
                }
            }
        }

        p.clamp(0.0, 1.0)
    }

    /// Draw for every short leg of `position`, at most once per calendar day.
    /// Returns the assigned leg indices (empty when nothing was assigned or
    /// the day was already checked).
    pub fn draw<R: Rng + ?Sized>(
        &self,
        position: &mut Position,
        date: NaiveDate,
        ex_dividend_date: Option<NaiveDate>,
        rng: &mut R,
    ) -> Vec<usize> {
        if !position.is_open() || position.last_assignment_check == Some(date) {
            return Vec::new();
        }
        position.last_assignment_check = Some(date);

        let mut assigned = Vec::new();
        for (i, leg) in position.legs.iter().enumerate() {
            let ctx = AssignmentContext {
                right: leg.contract.right,
                is_short: leg.is_short(),
                delta: leg.delta,
                dte: (leg.contract.expiration - date).num_days(),
                as_of: date,
                ex_dividend_date,
            };
            let p = self.daily_probability(&ctx);
            if p <= 0.0 {
                continue;
            }
            let u: f64 = rng.gen();
            if u < p {
                assigned.push(i);
            }
        }
        assigned
    }

    /// Settlement for a position with the given legs assigned.
    pub fn settle(
        &self,
        position: &Position,
        assigned_legs: Vec<usize>,
        underlying: Decimal,
    ) -> AssignmentSettlement {
        let exit_debit = position
            .legs
            .iter()
            .enumerate()
            .map(|(i, l)| {
                let price = if assigned_legs.contains(&i) {
                    l.mark
                        .max(l.contract.right.intrinsic(l.contract.strike, underlying))
                } else {
                    l.mark
                };
                l.close_cost_at(price, position.multiplier)
            })
            .sum();

        AssignmentSettlement {
            assigned_legs,
            exit_debit,
            penalty_slippage: position.spread_cost(self.config.penalty_spread_fraction),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::execution::{Fill, LegFill};
    use crate::backtest::signal::{ExitPolicy, LegAction};
    use crate::data::ContractKey;
    use rand::rngs::mock::StepRng;
    use rust_decimal_macros::dec;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn ctx(delta: f64, dte: i64) -> AssignmentContext {
        AssignmentContext {
            right: OptionType::Put,
            is_short: true,
            delta,
            dte,
            as_of: day(1),
            ex_dividend_date: None,
        }
    }

    fn short_call_spread(short_delta: f64) -> Position {
        let expiry = day(15);
        let legs = vec![
            LegFill {
                contract: ContractKey::new(dec!(90), expiry, OptionType::Call),
                action: LegAction::Sell,
                quantity: 1,
                bid: dec!(10.90),
                ask: dec!(11.10),
                mid: dec!(11.00),
                fill_price: dec!(11.00),
                delta: short_delta,
            },
            LegFill {
                contract: ContractKey::new(dec!(95), expiry, OptionType::Call),
                action: LegAction::Buy,
                quantity: 1,
                bid: dec!(6.00),
                ask: dec!(6.20),
                mid: dec!(6.10),
                fill_price: dec!(6.10),
                delta: 0.85,
            },
        ];
        let fill = Fill {
            legs,
            probability: 1.0,
            slippage: Decimal::ZERO,
            commission: Decimal::ZERO,
        };
        Position::from_fill(
            1,
            &fill,
            day(1).and_hms_opt(15, 0, 0).unwrap(),
            ExitPolicy::default(),
            dec!(100),
        )
    }

    #[test]
    fn test_otm_and_long_legs_are_never_assigned() {
        let model = AssignmentModel::default();
        assert_eq!(model.daily_probability(&ctx(0.50, 3)), 0.0);
        assert_eq!(model.daily_probability(&ctx(0.7499, 3)), 0.0);

        let long = AssignmentContext {
            is_short: false,
            ..ctx(0.99, 1)
        };
        assert_eq!(model.daily_probability(&long), 0.0);
    }

    #[test]
    fn test_depth_and_expiry_rates() {
        let model = AssignmentModel::default();
        assert!((model.daily_probability(&ctx(0.80, 30)) - 0.01).abs() < 1e-12);
        assert!((model.daily_probability(&ctx(-0.96, 30)) - 0.05).abs() < 1e-12);
        assert!((model.daily_probability(&ctx(0.80, 7)) - 0.02).abs() < 1e-12);
        assert!((model.daily_probability(&ctx(0.96, 2)) - 0.10).abs() < 1e-12);
    }

    #[test]
    fn test_ex_dividend_override_for_short_calls() {
        let model = AssignmentModel::default();
        let call = AssignmentContext {
            right: OptionType::Call,
            ex_dividend_date: Some(day(2)),
            ..ctx(0.97, 30)
        };
        assert_eq!(model.daily_probability(&call), 0.85);

        // Not deep enough for the override: window multiplier only
        let shallow = AssignmentContext {
            delta: 0.80,
            ..call
        };
        assert!((model.daily_probability(&shallow) - 0.02).abs() < 1e-12);

        // Puts ignore dividends
        let put = AssignmentContext {
            right: OptionType::Put,
            ..call
        };
        assert!((model.daily_probability(&put) - 0.05).abs() < 1e-12);

        // Ex-div already passed
        let passed = AssignmentContext {
            ex_dividend_date: Some(day(1)),
            ..call
        };
        assert!((model.daily_probability(&passed) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_one_draw_per_day() {
        let model = AssignmentModel::default();
        let mut position = short_call_spread(0.97);
        let mut rng = StepRng::new(0, 0);

        assert_eq!(model.draw(&mut position, day(1), Some(day(2)), &mut rng), vec![0]);
        assert_eq!(position.last_assignment_check, Some(day(1)));
        assert!(model
            .draw(&mut position, day(1), Some(day(2)), &mut rng)
            .is_empty());
    }

    #[test]
    fn test_failed_draw_assigns_nothing() {
        let model = AssignmentModel::default();
        let mut position = short_call_spread(0.97);
        let mut rng = StepRng::new(u64::MAX, 0);
        assert!(model
            .draw(&mut position, day(1), Some(day(2)), &mut rng)
            .is_empty());
    }

    #[test]
    fn test_settlement_uses_intrinsic_floor() {
        let model = AssignmentModel::default();
        let position = short_call_spread(0.97);
        // Underlying at 102: short 90 call intrinsic 12.00 above its 11.00 mark
        let settlement = model.settle(&position, vec![0], dec!(102));
        assert_eq!(settlement.exit_debit, dec!(1200) - dec!(610));
        // Half of two 0.20 spreads x 100
        assert_eq!(settlement.penalty_slippage, dec!(20));
    }

    #[test]
    fn test_validate() {
        assert!(AssignmentConfig::default().validate().is_ok());
        let config = AssignmentConfig {
            itm_delta: 0.99,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
