//! Overnight and weekend gap risk.
//!
//! Positions are only marked while the market is open. When the feed crosses
//! a closed interval the underlying can open somewhere else entirely, so each
//! open position takes an adverse move sized by the time closed, the
//! volatility regime, weekends and earnings. If the gapped cost to close
//! breaches the position's stop, it is closed at the next open.

use chrono::{Datelike, NaiveDateTime, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::backtest::config::{check_at_least_one, check_fraction, check_positive, ConfigError};
use crate::backtest::Position;

/// Gap model parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GapRiskConfig {
    /// Expected adverse move over one closed day at the reference volatility.
    pub base_gap_pct: f64,
    pub reference_volatility: f64,
    pub weekend_multiplier: f64,
    pub earnings_multiplier: f64,
    /// Fraction of each leg's spread charged on a forced close.
    pub penalty_spread_fraction: f64,
}

impl Default for GapRiskConfig {
    fn default() -> Self {
        Self {
            base_gap_pct: 0.005,
            reference_volatility: 0.20,
            weekend_multiplier: 1.5,
            earnings_multiplier: 3.0,
            penalty_spread_fraction: 0.5,
        }
    }
}

impl GapRiskConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_fraction("gap.base_gap_pct", self.base_gap_pct)?;
        check_positive("gap.reference_volatility", self.reference_volatility)?;
        check_at_least_one("gap.weekend_multiplier", self.weekend_multiplier)?;
        check_at_least_one("gap.earnings_multiplier", self.earnings_multiplier)?;
        check_fraction("gap.penalty_spread_fraction", self.penalty_spread_fraction)?;
        Ok(())
    }
}

/// The closed interval being crossed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GapContext {
    /// Last timestamp before the close.
    pub current_time: NaiveDateTime,
    /// First timestamp after the reopen.
    pub next_time: NaiveDateTime,
    pub volatility: f64,
    pub earnings_in_gap: bool,
    pub underlying_price: Decimal,
}

impl GapContext {
    pub fn hours(&self) -> f64 {
        (self.next_time - self.current_time).num_seconds() as f64 / 3600.0
    }
}

/// Result of gapping one position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapAdjustment {
    pub position_id: u64,
    pub gap_pct: f64,
    /// Adverse dollar move applied to the cost to close.
    pub gap_dollars: Decimal,
    pub adjusted_close_cost: Decimal,
    pub adjusted_unrealized_pnl: Decimal,
    /// The gapped cost breaches the stop.
    pub force_close: bool,
    /// Extra slippage charged when force-closed.
    pub penalty_slippage: Decimal,
}

/// True when any calendar day in `[from, to]` is a Saturday or Sunday.
pub fn spans_weekend(from: NaiveDateTime, to: NaiveDateTime) -> bool {
    if to <= from {
        return false;
    }
    let (start, end) = (from.date(), to.date());
    if (end - start).num_days() >= 6 {
        return true;
    }
    start
        .iter_days()
        .take_while(|d| *d <= end)
        .any(|d| matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
}

/// Whether moving from one feed item to the next crosses a closed session:
/// the next item is open and either the previous one was closed or the
/// interval spans a weekend.
pub fn crosses_closed_interval(
    prev_time: NaiveDateTime,
    prev_open: bool,
    next_time: NaiveDateTime,
    next_open: bool,
) -> bool {
    next_open && (!prev_open || spans_weekend(prev_time, next_time))
}

/// Gap risk model.
#[derive(Debug, Clone, Default)]
pub struct GapRiskModel {
    config: GapRiskConfig,
}

impl GapRiskModel {
    pub fn new(config: GapRiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GapRiskConfig {
        &self.config
    }

    /// Expected adverse move as a fraction of the underlying.
    pub fn gap_pct(&self, ctx: &GapContext) -> f64 {
        let hours = ctx.hours();
        if hours <= 0.0 {
            return 0.0;
        }
        let days_closed = hours / 24.0;
        let volatility = if ctx.volatility.is_finite() {
            ctx.volatility.max(0.0)
        } else {
            0.0
        };

        let mut pct = self.config.base_gap_pct
            * days_closed.sqrt()
            * (volatility / self.config.reference_volatility);
        if spans_weekend(ctx.current_time, ctx.next_time) {
            pct *= self.config.weekend_multiplier;
        }
        if ctx.earnings_in_gap {
            pct *= self.config.earnings_multiplier;
        }
        pct
    }

    /// Gap a single open position. `None` when the position is not open or
    /// the interval is empty.
    pub fn assess(&self, position: &Position, ctx: &GapContext) -> Option<GapAdjustment> {
        if !position.is_open() || ctx.hours() <= 0.0 {
            return None;
        }

        let gap_pct = self.gap_pct(ctx);
        let underlying: f64 = ctx.underlying_price.try_into().unwrap_or(0.0);
        let notional = underlying * position.net_delta_shares().abs();
        let gap_dollars = Decimal::try_from(gap_pct * notional)
            .unwrap_or(Decimal::ZERO)
            .round_dp(2)
            .max(Decimal::ZERO);

        let adjusted_close_cost = position.close_cost() + gap_dollars;
        let force_close = position.stop_breached(adjusted_close_cost);
        let penalty_slippage = if force_close {
            position.spread_cost(self.config.penalty_spread_fraction)
        } else {
            Decimal::ZERO
        };

        Some(GapAdjustment {
            position_id: position.id,
            gap_pct,
            gap_dollars,
            adjusted_close_cost,
            adjusted_unrealized_pnl: position.gross_pnl_at(adjusted_close_cost),
            force_close,
            penalty_slippage,
        })
    }

    /// Gap every open position.
    pub fn apply<'a, I>(&self, positions: I, ctx: &GapContext) -> Vec<GapAdjustment>
    where
        I: IntoIterator<Item = &'a Position>,
    {
        positions
            .into_iter()
            .filter_map(|p| self.assess(p, ctx))
            .collect()
    }
}
