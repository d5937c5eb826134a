//! Execution model: would this order have filled, and at what price?
//!
//! Each leg gets a fill probability from its liquidity (open interest,
//! bid-ask width, size against daily volume) and the market context
//! (session boundary, volatility regime). All legs must fill, so the order
//! probability is the minimum across legs. One seeded draw decides the fill.
//! Fill prices come from the leg-count slippage table; commissions from the
//! commission model.

use chrono::{NaiveDateTime, NaiveTime, Timelike};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::{ContractKey, OptionChain, OptionContract};

use super::commission::CommissionModel;
use super::config::{check_fraction, check_positive, ConfigError, SimulationConfig};
use super::signal::{LegAction, OrderLeg};
use super::slippage::SlippageModel;
use super::trade::Position;

/// Why an order did not execute.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RejectReason {
    #[error("order has no legs")]
    EmptyOrder,

    #[error("unsupported leg count {legs} (expected 1, 2 or 4)")]
    UnsupportedLegCount { legs: usize },

    #[error("zero quantity on {contract}")]
    InvalidQuantity { contract: ContractKey },

    #[error("{contract} not found in chain")]
    UnresolvableLeg { contract: ContractKey },

    #[error("{contract} has no usable quote")]
    InvalidQuote { contract: ContractKey },

    #[error("{contract} open interest {open_interest} below floor {floor}")]
    InsufficientOpenInterest {
        contract: ContractKey,
        open_interest: i64,
        floor: i64,
    },

    #[error("{contract} spread {spread_pct:.4} above ceiling {ceiling:.4}")]
    SpreadTooWide {
        contract: ContractKey,
        spread_pct: f64,
        ceiling: f64,
    },

    #[error("fill missed (probability {probability:.4}, draw {draw:.4})")]
    FillMissed { probability: f64, draw: f64 },

    #[error("invalid exit policy: {field} = {value}")]
    InvalidExitPolicy { field: String, value: f64 },

    #[error("no chain data available")]
    NoChainData,

    #[error("position {position_id} does not exist")]
    UnknownPosition { position_id: u64 },

    #[error("position {position_id} is not open")]
    PositionNotOpen { position_id: u64 },
}

impl RejectReason {
    /// Fill probability implied by the rejection.
    pub fn probability(&self) -> f64 {
        match self {
            Self::FillMissed { probability, .. } => *probability,
            _ => 0.0,
        }
    }
}

/// Open-interest band: orders at or above `min_open_interest` fill with
/// this base probability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OpenInterestBand {
    pub min_open_interest: i64,
    pub probability: f64,
}

/// Spread tier: spreads at or above `min_spread_pct` take this multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpreadTier {
    pub min_spread_pct: f64,
    pub multiplier: f64,
}

/// Size tier: orders larger than `min_volume_ratio` of daily volume take
/// this multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeTier {
    pub min_volume_ratio: f64,
    pub multiplier: f64,
}

fn default_session_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default()
}

fn default_session_close() -> NaiveTime {
    NaiveTime::from_hms_opt(16, 0, 0).unwrap_or_default()
}

/// Thresholds for the fill-probability model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Below this open interest a leg cannot fill.
    pub min_open_interest: i64,
    /// Ascending open-interest bands.
    pub open_interest_bands: Vec<OpenInterestBand>,

    /// Above this spread (fraction of mid) a leg cannot fill.
    pub max_spread_pct: f64,
    /// Ascending spread tiers.
    pub spread_tiers: Vec<SpreadTier>,

    pub session_open: NaiveTime,
    pub session_close: NaiveTime,
    /// Minutes after the open / before the close treated as the boundary.
    pub session_boundary_minutes: i64,
    pub session_boundary_penalty: f64,

    pub high_volatility: f64,
    pub high_volatility_penalty: f64,
    pub extreme_volatility: f64,
    pub extreme_volatility_penalty: f64,

    /// Ascending size tiers (quantity / daily volume).
    pub volume_tiers: Vec<VolumeTier>,

    /// Added to the probability of closing orders, capped at 1.0.
    pub closing_bonus: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            min_open_interest: 50,
            open_interest_bands: vec![
                OpenInterestBand {
                    min_open_interest: 50,
                    probability: 0.50,
                },
                OpenInterestBand {
                    min_open_interest: 200,
                    probability: 0.75,
                },
                OpenInterestBand {
                    min_open_interest: 500,
                    probability: 0.90,
                },
                OpenInterestBand {
                    min_open_interest: 1000,
                    probability: 1.0,
                },
            ],
            max_spread_pct: 0.10,
            spread_tiers: vec![
                SpreadTier {
                    min_spread_pct: 0.02,
                    multiplier: 0.95,
                },
                SpreadTier {
                    min_spread_pct: 0.05,
                    multiplier: 0.85,
                },
            ],
            session_open: default_session_open(),
            session_close: default_session_close(),
            session_boundary_minutes: 30,
            session_boundary_penalty: 0.85,
            high_volatility: 0.30,
            high_volatility_penalty: 0.90,
            extreme_volatility: 0.50,
            extreme_volatility_penalty: 0.75,
            volume_tiers: vec![
                VolumeTier {
                    min_volume_ratio: 0.10,
                    multiplier: 0.90,
                },
                VolumeTier {
                    min_volume_ratio: 0.25,
                    multiplier: 0.75,
                },
                VolumeTier {
                    min_volume_ratio: 0.50,
                    multiplier: 0.50,
                },
            ],
            closing_bonus: 0.05,
        }
    }
}

impl ExecutionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_open_interest < 0 {
            return Err(ConfigError::OutOfRange {
                field: "execution.min_open_interest",
                value: self.min_open_interest as f64,
                expected: ">= 0",
            });
        }

        let first = self.open_interest_bands.first().ok_or(ConfigError::Empty {
            field: "execution.open_interest_bands",
        })?;
        if first.min_open_interest > self.min_open_interest {
            return Err(ConfigError::Ordering(
                "execution.open_interest_bands",
                "first band must start at or below min_open_interest",
            ));
        }
        for band in &self.open_interest_bands {
            check_fraction("execution.open_interest_bands.probability", band.probability)?;
        }
        let bands_sorted = self.open_interest_bands.windows(2).all(|w| {
            w[0].min_open_interest < w[1].min_open_interest && w[0].probability <= w[1].probability
        });
        if !bands_sorted {
            return Err(ConfigError::NotMonotonic {
                field: "execution.open_interest_bands",
            });
        }

        check_positive("execution.max_spread_pct", self.max_spread_pct)?;
        for tier in &self.spread_tiers {
            check_fraction("execution.spread_tiers.multiplier", tier.multiplier)?;
        }
        let tiers_sorted = self.spread_tiers.windows(2).all(|w| {
            w[0].min_spread_pct < w[1].min_spread_pct && w[0].multiplier >= w[1].multiplier
        });
        if !tiers_sorted {
            return Err(ConfigError::NotMonotonic {
                field: "execution.spread_tiers",
            });
        }

        if self.session_open >= self.session_close {
            return Err(ConfigError::Ordering(
                "execution.session_open",
                "session_open < session_close",
            ));
        }
        if self.session_boundary_minutes < 0 {
            return Err(ConfigError::OutOfRange {
                field: "execution.session_boundary_minutes",
                value: self.session_boundary_minutes as f64,
                expected: ">= 0",
            });
        }
        check_fraction("execution.session_boundary_penalty", self.session_boundary_penalty)?;

        check_positive("execution.high_volatility", self.high_volatility)?;
        check_positive("execution.extreme_volatility", self.extreme_volatility)?;
        if self.high_volatility >= self.extreme_volatility {
            return Err(ConfigError::Ordering(
                "execution.high_volatility",
                "high_volatility < extreme_volatility",
            ));
        }
        check_fraction("execution.high_volatility_penalty", self.high_volatility_penalty)?;
        check_fraction(
            "execution.extreme_volatility_penalty",
            self.extreme_volatility_penalty,
        )?;

        for tier in &self.volume_tiers {
            check_fraction("execution.volume_tiers.multiplier", tier.multiplier)?;
        }
        let volume_sorted = self.volume_tiers.windows(2).all(|w| {
            w[0].min_volume_ratio < w[1].min_volume_ratio && w[0].multiplier >= w[1].multiplier
        });
        if !volume_sorted {
            return Err(ConfigError::NotMonotonic {
                field: "execution.volume_tiers",
            });
        }

        check_fraction("execution.closing_bonus", self.closing_bonus)?;
        Ok(())
    }
}

/// Context for one fill decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillContext {
    pub timestamp: NaiveDateTime,
    /// Volatility proxy from the current snapshot.
    pub volatility: f64,
    pub is_closing: bool,
}

/// Execution details for one leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegFill {
    pub contract: ContractKey,
    pub action: LegAction,
    pub quantity: u32,
    pub bid: Decimal,
    pub ask: Decimal,
    pub mid: Decimal,
    pub fill_price: Decimal,
    pub delta: f64,
}

/// A filled order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub legs: Vec<LegFill>,
    pub probability: f64,
    /// Dollar slippage against mid, all legs.
    pub slippage: Decimal,
    pub commission: Decimal,
}

impl Fill {
    /// Mid-based cash received (negative when paid).
    pub fn net_cash_flow(&self, multiplier: Decimal) -> Decimal {
        self.legs
            .iter()
            .map(|l| -Decimal::from(l.action.sign() * i64::from(l.quantity)) * l.mid * multiplier)
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Filled(Fill),
    Rejected(RejectReason),
}

/// Slippage and commission for a rule-based exit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitCosts {
    pub slippage: Decimal,
    pub commission: Decimal,
}

/// Fill-probability and fill-price model.
#[derive(Debug, Clone)]
pub struct ExecutionModel {
    config: ExecutionConfig,
    slippage: SlippageModel,
    commission: CommissionModel,
    multiplier: Decimal,
}

impl ExecutionModel {
    pub fn new(
        config: ExecutionConfig,
        slippage: SlippageModel,
        commission: CommissionModel,
        multiplier: Decimal,
    ) -> Self {
        Self {
            config,
            slippage,
            commission,
            multiplier,
        }
    }

    pub fn from_config(config: &SimulationConfig) -> Self {
        Self::new(
            config.execution.clone(),
            config.slippage.clone(),
            config.commission.clone(),
            config.multiplier(),
        )
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Base probability from open interest.
    pub fn open_interest_probability(&self, open_interest: i64) -> f64 {
        if open_interest < self.config.min_open_interest {
            return 0.0;
        }
        self.config
            .open_interest_bands
            .iter()
            .rev()
            .find(|b| open_interest >= b.min_open_interest)
            .map(|b| b.probability)
            .unwrap_or(0.0)
    }

    /// Multiplier from spread width (fraction of mid).
    pub fn spread_multiplier(&self, spread_pct: f64) -> f64 {
        if !spread_pct.is_finite() || spread_pct > self.config.max_spread_pct {
            return 0.0;
        }
        self.config
            .spread_tiers
            .iter()
            .rev()
            .find(|t| spread_pct >= t.min_spread_pct)
            .map(|t| t.multiplier)
            .unwrap_or(1.0)
    }

    /// Multiplier from order size against the session's volume.
    pub fn volume_multiplier(&self, quantity: u32, volume: i64) -> f64 {
        let ratio = if volume <= 0 {
            f64::INFINITY
        } else {
            f64::from(quantity) / volume as f64
        };
        self.config
            .volume_tiers
            .iter()
            .rev()
            .find(|t| ratio > t.min_volume_ratio)
            .map(|t| t.multiplier)
            .unwrap_or(1.0)
    }

    pub fn volatility_multiplier(&self, volatility: f64) -> f64 {
        if volatility >= self.config.extreme_volatility {
            self.config.extreme_volatility_penalty
        } else if volatility >= self.config.high_volatility {
            self.config.high_volatility_penalty
        } else {
            1.0
        }
    }

    /// Within the boundary window after the open or before the close.
    pub fn is_session_boundary(&self, timestamp: NaiveDateTime) -> bool {
        let minute_of_day = |t: NaiveTime| i64::from(t.hour()) * 60 + i64::from(t.minute());
        let now = minute_of_day(timestamp.time());
        let open = minute_of_day(self.config.session_open);
        let close = minute_of_day(self.config.session_close);
        let window = self.config.session_boundary_minutes;
        (now - open).abs() <= window || (close - now).abs() <= window
    }

    fn session_multiplier(&self, timestamp: NaiveDateTime) -> f64 {
        if self.is_session_boundary(timestamp) {
            self.config.session_boundary_penalty
        } else {
            1.0
        }
    }

    /// Hard liquidity gates: below the OI floor, spread above the ceiling,
    /// or an unusable quote.
    fn hard_reject(&self, contract: &OptionContract) -> Option<RejectReason> {
        let key = contract.key();
        if !contract.has_valid_quote() {
            return Some(RejectReason::InvalidQuote { contract: key });
        }
        if contract.open_interest < self.config.min_open_interest {
            return Some(RejectReason::InsufficientOpenInterest {
                contract: key,
                open_interest: contract.open_interest,
                floor: self.config.min_open_interest,
            });
        }
        let spread_pct = contract.spread_pct();
        if spread_pct > self.config.max_spread_pct {
            return Some(RejectReason::SpreadTooWide {
                contract: key,
                spread_pct,
                ceiling: self.config.max_spread_pct,
            });
        }
        None
    }

    /// Fill probability for one leg, before the closing adjustment.
    /// Hard-gated legs return exactly 0.
    pub fn leg_probability(
        &self,
        contract: &OptionContract,
        quantity: u32,
        ctx: &FillContext,
    ) -> f64 {
        if self.hard_reject(contract).is_some() {
            return 0.0;
        }
        let p = self.open_interest_probability(contract.open_interest)
            * self.spread_multiplier(contract.spread_pct())
            * self.session_multiplier(ctx.timestamp)
            * self.volatility_multiplier(ctx.volatility)
            * self.volume_multiplier(quantity, contract.volume);
        p.clamp(0.0, 1.0)
    }

    /// Order probability: minimum across legs, closing bonus applied to any
    /// non-zero result, clamped to [0, 1].
    pub fn order_probability(
        &self,
        legs: &[OrderLeg],
        chain: &OptionChain,
        ctx: &FillContext,
    ) -> Result<f64, RejectReason> {
        match legs.len() {
            0 => return Err(RejectReason::EmptyOrder),
            1 | 2 | 4 => {}
            n => return Err(RejectReason::UnsupportedLegCount { legs: n }),
        }

        let mut probability = 1.0_f64;
        for leg in legs {
            if leg.quantity == 0 {
                return Err(RejectReason::InvalidQuantity {
                    contract: leg.contract,
                });
            }
            let contract = chain
                .get(&leg.contract)
                .ok_or(RejectReason::UnresolvableLeg {
                    contract: leg.contract,
                })?;
            if let Some(reason) = self.hard_reject(contract) {
                return Err(reason);
            }
            probability = probability.min(self.leg_probability(contract, leg.quantity, ctx));
        }

        if ctx.is_closing && probability > 0.0 {
            probability += self.config.closing_bonus;
        }
        Ok(probability.clamp(0.0, 1.0))
    }

    /// Decide the order with one draw from `rng`.
    pub fn evaluate<R: Rng + ?Sized>(
        &self,
        legs: &[OrderLeg],
        chain: &OptionChain,
        ctx: &FillContext,
        rng: &mut R,
    ) -> ExecutionOutcome {
        let probability = match self.order_probability(legs, chain, ctx) {
            Ok(p) => p,
            Err(reason) => return ExecutionOutcome::Rejected(reason),
        };

        let draw: f64 = rng.gen();
        if draw >= probability {
            return ExecutionOutcome::Rejected(RejectReason::FillMissed { probability, draw });
        }

        let slippage = self.slippage.for_legs(legs.len());
        let mut fills = Vec::with_capacity(legs.len());
        let mut total_slippage = Decimal::ZERO;
        for leg in legs {
            let Some(contract) = chain.get(&leg.contract) else {
                return ExecutionOutcome::Rejected(RejectReason::UnresolvableLeg {
                    contract: leg.contract,
                });
            };
            let fill_price = slippage.fill(leg.action, contract.bid, contract.ask);
            total_slippage += slippage.cost(
                leg.action,
                contract.bid,
                contract.ask,
                leg.quantity,
                self.multiplier,
            );
            fills.push(LegFill {
                contract: leg.contract,
                action: leg.action,
                quantity: leg.quantity,
                bid: contract.bid,
                ask: contract.ask,
                mid: contract.mid(),
                fill_price,
                delta: contract.delta,
            });
        }

        let contracts = legs.iter().map(|l| l.quantity).sum();
        ExecutionOutcome::Filled(Fill {
            legs: fills,
            probability,
            slippage: total_slippage,
            commission: self.commission.calculate(contracts).total,
        })
    }

    /// Costs of flattening a position at its latest quotes, without a
    /// probability gate.
    pub fn exit_costs(&self, position: &Position) -> ExitCosts {
        let slippage = self.slippage.for_legs(position.num_legs());
        let total = position
            .legs
            .iter()
            .map(|l| {
                slippage.cost(
                    l.action.opposite(),
                    l.bid,
                    l.ask.max(l.bid),
                    l.quantity,
                    self.multiplier,
                )
            })
            .sum();
        ExitCosts {
            slippage: total,
            commission: self.commission.calculate(position.total_contracts()).total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::OptionType;
    use chrono::NaiveDate;
    use rand::rngs::mock::StepRng;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rust_decimal_macros::dec;

    fn expiry() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, 16).unwrap()
    }

    fn midday() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 16)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn ctx() -> FillContext {
        FillContext {
            timestamp: midday(),
            volatility: 0.15,
            is_closing: false,
        }
    }

    fn contract(strike: Decimal, oi: i64, bid: Decimal, ask: Decimal) -> OptionContract {
        OptionContract {
            strike,
            expiration: expiry(),
            right: OptionType::Put,
            bid,
            ask,
            implied_volatility: 0.2,
            delta: -0.25,
            open_interest: oi,
            volume: 10_000,
        }
    }

    fn model() -> ExecutionModel {
        ExecutionModel::new(
            ExecutionConfig::default(),
            SlippageModel::standard(),
            CommissionModel::default(),
            dec!(100),
        )
    }

    fn always() -> StepRng {
        StepRng::new(0, 0)
    }

    #[test]
    fn test_open_interest_bands() {
        let m = model();
        assert_eq!(m.open_interest_probability(49), 0.0);
        assert_eq!(m.open_interest_probability(50), 0.50);
        assert_eq!(m.open_interest_probability(300), 0.75);
        assert_eq!(m.open_interest_probability(999), 0.90);
        assert_eq!(m.open_interest_probability(5_000), 1.0);
    }

    #[test]
    fn test_hard_floor_is_exactly_zero() {
        let m = model();
        let c = contract(dec!(95), 49, dec!(1.00), dec!(1.01));
        let closing = FillContext {
            is_closing: true,
            ..ctx()
        };
        assert_eq!(m.leg_probability(&c, 1, &closing), 0.0);

        let chain = OptionChain::new(vec![c.clone()]);
        let legs = vec![OrderLeg::sell(c.key(), 1)];
        assert!(matches!(
            m.order_probability(&legs, &chain, &closing),
            Err(RejectReason::InsufficientOpenInterest { .. })
        ));
        assert!(matches!(
            m.evaluate(&legs, &chain, &closing, &mut always()),
            ExecutionOutcome::Rejected(RejectReason::InsufficientOpenInterest { .. })
        ));
    }

    #[test]
    fn test_probability_monotone_in_open_interest() {
        let m = model();
        let mut last = 0.0;
        for oi in (0..3_000).step_by(10) {
            let p = m.leg_probability(&contract(dec!(95), oi, dec!(1.00), dec!(1.03)), 1, &ctx());
            assert!(p >= last, "oi {oi}: {p} < {last}");
            last = p;
        }
        assert!(last > 0.0);
    }

    #[test]
    fn test_probability_monotone_in_spread() {
        let m = model();
        let mut last = 1.0;
        for cents in 0..30 {
            let ask = dec!(1.00) + Decimal::new(cents, 2);
            let p = m.leg_probability(&contract(dec!(95), 2_000, dec!(1.00), ask), 1, &ctx());
            assert!(p <= last, "width {cents}: {p} > {last}");
            last = p;
        }
        assert_eq!(last, 0.0);
    }

    #[test]
    fn test_spread_ceiling_rejects() {
        let m = model();
        let c = contract(dec!(95), 2_000, dec!(0.90), dec!(1.10));
        let chain = OptionChain::new(vec![c.clone()]);
        let outcome = m.evaluate(&[OrderLeg::buy(c.key(), 1)], &chain, &ctx(), &mut always());
        assert!(matches!(
            outcome,
            ExecutionOutcome::Rejected(RejectReason::SpreadTooWide { .. })
        ));
    }

    #[test]
    fn test_context_penalties() {
        let m = model();
        let c = contract(dec!(95), 2_000, dec!(1.00), dec!(1.01));
        assert_eq!(m.leg_probability(&c, 1, &ctx()), 1.0);

        let open = FillContext {
            timestamp: NaiveDate::from_ymd_opt(2024, 1, 16)
                .unwrap()
                .and_hms_opt(9, 45, 0)
                .unwrap(),
            ..ctx()
        };
        assert!((m.leg_probability(&c, 1, &open) - 0.85).abs() < 1e-12);

        let high = FillContext {
            volatility: 0.35,
            ..ctx()
        };
        assert!((m.leg_probability(&c, 1, &high) - 0.90).abs() < 1e-12);

        let extreme = FillContext {
            volatility: 0.80,
            ..ctx()
        };
        assert!((m.leg_probability(&c, 1, &extreme) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_volume_tiers() {
        let m = model();
        assert_eq!(m.volume_multiplier(5, 100), 1.0);
        assert_eq!(m.volume_multiplier(20, 100), 0.90);
        assert_eq!(m.volume_multiplier(30, 100), 0.75);
        assert_eq!(m.volume_multiplier(60, 100), 0.50);
        assert_eq!(m.volume_multiplier(1, 0), 0.50);
    }

    #[test]
    fn test_order_probability_is_min_across_legs() {
        let m = model();
        let short = contract(dec!(95), 2_000, dec!(1.00), dec!(1.01));
        let long = contract(dec!(90), 100, dec!(0.50), dec!(0.505));
        let chain = OptionChain::new(vec![short.clone(), long.clone()]);
        let legs = vec![OrderLeg::sell(short.key(), 1), OrderLeg::buy(long.key(), 1)];
        let p = m.order_probability(&legs, &chain, &ctx()).unwrap();
        assert!((p - 0.50).abs() < 1e-12);
    }

    #[test]
    fn test_closing_bonus_capped() {
        let m = model();
        let c = contract(dec!(95), 300, dec!(1.00), dec!(1.01));
        let chain = OptionChain::new(vec![c.clone()]);
        let legs = vec![OrderLeg::buy(c.key(), 1)];
        let closing = FillContext {
            is_closing: true,
            ..ctx()
        };
        let opening = m.order_probability(&legs, &chain, &ctx()).unwrap();
        let closed = m.order_probability(&legs, &chain, &closing).unwrap();
        assert!((closed - opening - 0.05).abs() < 1e-12);

        let liquid = contract(dec!(95), 5_000, dec!(1.00), dec!(1.01));
        let chain = OptionChain::new(vec![liquid.clone()]);
        let legs = vec![OrderLeg::buy(liquid.key(), 1)];
        assert_eq!(m.order_probability(&legs, &chain, &closing).unwrap(), 1.0);
    }

    #[test]
    fn test_structural_rejections() {
        let m = model();
        let c = contract(dec!(95), 2_000, dec!(1.00), dec!(1.01));
        let chain = OptionChain::new(vec![c.clone()]);
        assert_eq!(
            m.order_probability(&[], &chain, &ctx()),
            Err(RejectReason::EmptyOrder)
        );
        let three = vec![OrderLeg::buy(c.key(), 1); 3];
        assert_eq!(
            m.order_probability(&three, &chain, &ctx()),
            Err(RejectReason::UnsupportedLegCount { legs: 3 })
        );
        let missing = ContractKey::new(dec!(80), expiry(), OptionType::Put);
        assert_eq!(
            m.order_probability(&[OrderLeg::buy(missing, 1)], &chain, &ctx()),
            Err(RejectReason::UnresolvableLeg { contract: missing })
        );
        assert_eq!(
            m.order_probability(&[OrderLeg::buy(c.key(), 0)], &chain, &ctx()),
            Err(RejectReason::InvalidQuantity { contract: c.key() })
        );
    }

    #[test]
    fn test_fill_prices_and_costs() {
        let m = model();
        let short = contract(dec!(95), 2_000, dec!(1.00), dec!(1.02));
        let long = contract(dec!(90), 2_000, dec!(0.50), dec!(0.51));
        let chain = OptionChain::new(vec![short.clone(), long.clone()]);
        let legs = vec![OrderLeg::sell(short.key(), 2), OrderLeg::buy(long.key(), 2)];

        let ExecutionOutcome::Filled(fill) = m.evaluate(&legs, &chain, &ctx(), &mut always()) else {
            panic!("expected fill");
        };
        assert_eq!(fill.legs.len(), 2);
        assert!(fill.legs[0].fill_price < fill.legs[0].mid);
        assert!(fill.legs[1].fill_price > fill.legs[1].mid);
        assert_eq!(fill.commission, dec!(4));
        // Credit at mid: (1.01 - 0.505) x 2 x 100
        assert_eq!(fill.net_cash_flow(dec!(100)), dec!(101));
        // (0.66 - 0.5) x (0.02 + 0.01) x 2 x 100 = 0.96
        assert!((fill.slippage - dec!(0.96)).abs() < dec!(0.0001));
    }

    #[test]
    fn test_seeded_draws_are_reproducible() {
        let m = model();
        let c = contract(dec!(95), 300, dec!(1.00), dec!(1.01));
        let chain = OptionChain::new(vec![c.clone()]);
        let legs = vec![OrderLeg::sell(c.key(), 1)];

        let run = |seed: u64| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            (0..50)
                .map(|_| matches!(m.evaluate(&legs, &chain, &ctx(), &mut rng), ExecutionOutcome::Filled(_)))
                .collect::<Vec<_>>()
        };
        let a = run(7);
        assert_eq!(a, run(7));
        // p = 0.75: some fills and some misses over 50 draws
        assert!(a.iter().any(|f| *f));
        assert!(a.iter().any(|f| !*f));
    }

    #[test]
    fn test_missed_fill_reports_probability() {
        let m = model();
        let c = contract(dec!(95), 300, dec!(1.00), dec!(1.01));
        let chain = OptionChain::new(vec![c.clone()]);
        // StepRng at u64::MAX draws just under 1.0
        let mut rng = StepRng::new(u64::MAX, 0);
        match m.evaluate(&[OrderLeg::sell(c.key(), 1)], &chain, &ctx(), &mut rng) {
            ExecutionOutcome::Rejected(reason @ RejectReason::FillMissed { .. }) => {
                assert!((reason.probability() - 0.75).abs() < 1e-12);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        assert!(ExecutionConfig::default().validate().is_ok());

        let mut config = ExecutionConfig::default();
        config.open_interest_bands.swap(0, 1);
        assert!(config.validate().is_err());

        let config = ExecutionConfig {
            high_volatility: 0.6,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ExecutionConfig {
            closing_bonus: -0.1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
