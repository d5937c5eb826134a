//! Position lifecycle for the simulator.
//!
//! Handles the complete trade lifecycle:
//! - Entry (position creation from an execution fill, or a rejection)
//! - Mark-to-market from each chain snapshot
//! - Exit rule checks (profit target, stop loss, DTE, expiration)
//! - The single terminal transition and realized P&L
//!
//! All cash amounts are dollars: premium per share x quantity x multiplier.
//! Entry and exit are valued at mid; fill slippage and commissions are
//! carried separately so that
//! `realized = entry_credit - exit_debit - commissions - slippage` holds
//! exactly.

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::data::{ContractKey, OptionChain};

use super::execution::{Fill, RejectReason};
use super::signal::{ExitPolicy, LegAction, OrderLeg};

/// Lifecycle state of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Rejected,
    ClosedProfit,
    ClosedStop,
    #[serde(rename = "ClosedDTE")]
    ClosedDte,
    ClosedExpired,
    ClosedAssigned,
    ClosedGap,
    /// Closed by a strategy close signal.
    ClosedSignal,
}

impl PositionStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Rejected and every Closed* state are terminal.
    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }

    pub fn is_closed(&self) -> bool {
        !matches!(self, Self::Open | Self::Rejected)
    }

    pub const CLOSED: [PositionStatus; 7] = [
        Self::ClosedProfit,
        Self::ClosedStop,
        Self::ClosedDte,
        Self::ClosedExpired,
        Self::ClosedAssigned,
        Self::ClosedGap,
        Self::ClosedSignal,
    ];
}

/// A single leg of a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionLeg {
    pub contract: ContractKey,
    pub action: LegAction,
    pub quantity: u32,
    /// Mid at entry (per share).
    pub entry_price: Decimal,
    /// Actual fill at entry (per share).
    pub entry_fill: Decimal,
    /// Latest mid (per share).
    pub mark: Decimal,
    /// Latest bid/ask, kept for pricing exits.
    pub bid: Decimal,
    pub ask: Decimal,
    /// Latest delta.
    pub delta: f64,
}

impl PositionLeg {
    pub fn is_short(&self) -> bool {
        self.action == LegAction::Sell
    }

    /// Signed contract count: positive long, negative short.
    pub fn signed_quantity(&self) -> i64 {
        self.action.sign() * i64::from(self.quantity)
    }

    /// Cash received at entry (negative when paid).
    pub fn entry_cash_flow(&self, multiplier: Decimal) -> Decimal {
        -Decimal::from(self.signed_quantity()) * self.entry_price * multiplier
    }

    /// Cash needed to flatten this leg at `price` (negative when received).
    pub fn close_cost_at(&self, price: Decimal, multiplier: Decimal) -> Decimal {
        -Decimal::from(self.signed_quantity()) * price * multiplier
    }

    pub fn spread(&self) -> Decimal {
        (self.ask - self.bid).max(Decimal::ZERO)
    }

    fn update_quote(&mut self, chain: &OptionChain) -> bool {
        match chain.get(&self.contract) {
            Some(quote) if quote.has_valid_quote() => {
                self.mark = quote.mid();
                self.bid = quote.bid;
                self.ask = quote.ask;
                self.delta = quote.delta;
                true
            }
            _ => false,
        }
    }
}

/// How a position leaves the Open state.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitDetails {
    pub timestamp: NaiveDateTime,
    pub status: PositionStatus,
    /// Mid-based cost to flatten (negative = received).
    pub exit_debit: Decimal,
    pub slippage: Decimal,
    pub commission: Decimal,
}

/// A complete options position (1, 2 or 4 legs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: u64,
    pub legs: Vec<PositionLeg>,
    pub entry_time: NaiveDateTime,
    pub exit_time: Option<NaiveDateTime>,
    /// Net premium at mid: positive credit, negative debit.
    pub entry_credit: Decimal,
    /// Net cost to close at exit (set once closed).
    pub exit_debit: Option<Decimal>,
    pub exit_policy: ExitPolicy,
    pub status: PositionStatus,
    pub realized_pnl: Option<Decimal>,
    /// Mark-based P&L before costs.
    pub unrealized_pnl: Decimal,
    /// Entry plus exit commissions.
    pub commissions: Decimal,
    /// Entry plus exit slippage against mid.
    pub slippage: Decimal,
    pub multiplier: Decimal,
    /// Probability used by the execution model at entry.
    pub fill_probability: f64,
    pub rejection: Option<RejectReason>,
    /// Last calendar day an assignment draw was taken.
    pub last_assignment_check: Option<NaiveDate>,
}

impl Position {
    /// Build an open position from an entry fill.
    pub fn from_fill(
        id: u64,
        fill: &Fill,
        timestamp: NaiveDateTime,
        exit_policy: ExitPolicy,
        multiplier: Decimal,
    ) -> Self {
        let legs: Vec<PositionLeg> = fill
            .legs
            .iter()
            .map(|l| PositionLeg {
                contract: l.contract,
                action: l.action,
                quantity: l.quantity,
                entry_price: l.mid,
                entry_fill: l.fill_price,
                mark: l.mid,
                bid: l.bid,
                ask: l.ask,
                delta: l.delta,
            })
            .collect();

        let entry_credit = legs.iter().map(|l| l.entry_cash_flow(multiplier)).sum();

        Self {
            id,
            legs,
            entry_time: timestamp,
            exit_time: None,
            entry_credit,
            exit_debit: None,
            exit_policy,
            status: PositionStatus::Open,
            realized_pnl: None,
            unrealized_pnl: Decimal::ZERO,
            commissions: fill.commission,
            slippage: fill.slippage,
            multiplier,
            fill_probability: fill.probability,
            rejection: None,
            last_assignment_check: None,
        }
    }

    /// Record a signal that never became a position.
    pub fn rejected(
        id: u64,
        order: &[OrderLeg],
        timestamp: NaiveDateTime,
        exit_policy: ExitPolicy,
        reason: RejectReason,
        multiplier: Decimal,
    ) -> Self {
        let legs = order
            .iter()
            .map(|o| PositionLeg {
                contract: o.contract,
                action: o.action,
                quantity: o.quantity,
                entry_price: Decimal::ZERO,
                entry_fill: Decimal::ZERO,
                mark: Decimal::ZERO,
                bid: Decimal::ZERO,
                ask: Decimal::ZERO,
                delta: 0.0,
            })
            .collect();

        Self {
            id,
            legs,
            entry_time: timestamp,
            exit_time: None,
            entry_credit: Decimal::ZERO,
            exit_debit: None,
            exit_policy,
            status: PositionStatus::Rejected,
            realized_pnl: None,
            unrealized_pnl: Decimal::ZERO,
            commissions: Decimal::ZERO,
            slippage: Decimal::ZERO,
            multiplier,
            fill_probability: reason.probability(),
            rejection: Some(reason),
            last_assignment_check: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    pub fn num_legs(&self) -> usize {
        self.legs.len()
    }

    /// Contracts across all legs.
    pub fn total_contracts(&self) -> u32 {
        self.legs.iter().map(|l| l.quantity).sum()
    }

    pub fn is_credit(&self) -> bool {
        self.entry_credit > Decimal::ZERO
    }

    /// Absolute entry premium.
    pub fn premium(&self) -> Decimal {
        self.entry_credit.abs()
    }

    /// Nearest expiration among the legs.
    pub fn expiration(&self) -> Option<NaiveDate> {
        self.legs.iter().map(|l| l.contract.expiration).min()
    }

    pub fn dte(&self, date: NaiveDate) -> i64 {
        self.expiration()
            .map(|exp| (exp - date).num_days())
            .unwrap_or(0)
    }

    /// Cost to flatten every leg at its current mark.
    pub fn close_cost(&self) -> Decimal {
        self.legs
            .iter()
            .map(|l| l.close_cost_at(l.mark, self.multiplier))
            .sum()
    }

    /// Cost to flatten at expiration: expired legs at intrinsic, the rest at mark.
    pub fn settlement_cost(&self, date: NaiveDate, underlying: Decimal) -> Decimal {
        self.legs
            .iter()
            .map(|l| {
                let price = if l.contract.expiration <= date {
                    l.contract.right.intrinsic(l.contract.strike, underlying)
                } else {
                    l.mark
                };
                l.close_cost_at(price, self.multiplier)
            })
            .sum()
    }

    /// Mark-based P&L before costs.
    pub fn gross_pnl_at(&self, close_cost: Decimal) -> Decimal {
        self.entry_credit - close_cost
    }

    /// Net delta exposure in shares.
    pub fn net_delta_shares(&self) -> f64 {
        let multiplier: f64 = self.multiplier.try_into().unwrap_or(100.0);
        self.legs
            .iter()
            .map(|l| l.signed_quantity() as f64 * l.delta * multiplier)
            .sum()
    }

    /// Dollar cost of `fraction` of every leg's bid-ask spread.
    pub fn spread_cost(&self, fraction: f64) -> Decimal {
        let fraction = Decimal::try_from(fraction).unwrap_or(Decimal::ZERO);
        self.legs
            .iter()
            .map(|l| l.spread() * fraction * Decimal::from(l.quantity) * self.multiplier)
            .sum()
    }

    /// Re-mark every leg from the chain. Legs missing from the chain keep
    /// their last mark. Returns the number of legs re-marked.
    pub fn update_marks(&mut self, chain: &OptionChain) -> usize {
        let mut updated = 0;
        for leg in &mut self.legs {
            if leg.update_quote(chain) {
                updated += 1;
            }
        }
        self.unrealized_pnl = self.gross_pnl_at(self.close_cost());
        updated
    }

    /// Profit target: gross P&L strictly above the target fraction of premium.
    pub fn is_profit_target_hit(&self) -> bool {
        let premium = self.premium();
        if premium.is_zero() {
            return false;
        }
        let Ok(target) = Decimal::try_from(self.exit_policy.profit_target_pct) else {
            return false;
        };
        self.gross_pnl_at(self.close_cost()) > premium * target
    }

    /// Stop check against the current mark.
    pub fn is_stop_loss_hit(&self) -> bool {
        self.stop_breached(self.close_cost())
    }

    /// Stop check against an arbitrary cost to close.
    ///
    /// Credit positions stop when the cost to close reaches `multiple x credit`.
    /// Debit positions stop when their remaining value falls to
    /// `debit / multiple`.
    pub fn stop_breached(&self, close_cost: Decimal) -> bool {
        let premium = self.premium();
        let multiple = self.exit_policy.stop_loss_multiple;
        if premium.is_zero() || !multiple.is_finite() || multiple <= 0.0 {
            return false;
        }
        let Ok(multiple) = Decimal::try_from(multiple) else {
            return false;
        };
        if self.is_credit() {
            close_cost >= premium * multiple
        } else {
            -close_cost <= premium / multiple
        }
    }

    /// DTE exit: inside the close window but not yet expired.
    pub fn is_dte_exit(&self, date: NaiveDate) -> bool {
        match self.exit_policy.close_at_dte {
            Some(window) => {
                let dte = self.dte(date);
                dte > 0 && dte <= window
            }
            None => false,
        }
    }

    pub fn is_expired(&self, date: NaiveDate) -> bool {
        self.dte(date) <= 0
    }

    /// The single terminal transition. Returns `false` (and changes nothing)
    /// when the position is not open or the status is not a closed state.
    pub fn close(&mut self, exit: ExitDetails) -> bool {
        if !self.is_open() || !exit.status.is_closed() {
            return false;
        }
        self.status = exit.status;
        self.exit_time = Some(exit.timestamp);
        self.exit_debit = Some(exit.exit_debit);
        self.commissions += exit.commission;
        self.slippage += exit.slippage;
        self.unrealized_pnl = Decimal::ZERO;
        self.realized_pnl =
            Some(self.entry_credit - exit.exit_debit - self.commissions - self.slippage);
        true
    }
}

/// Append-only record of a closed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub position_id: u64,
    pub status: PositionStatus,
    pub legs: Vec<PositionLeg>,
    pub entry_time: NaiveDateTime,
    pub exit_time: NaiveDateTime,
    pub entry_credit: Decimal,
    pub exit_debit: Decimal,
    pub commissions: Decimal,
    pub slippage: Decimal,
    pub realized_pnl: Decimal,
    /// Calendar days between entry and exit.
    pub days_held: i64,
    /// Realized P&L over absolute entry premium.
    pub return_on_premium: f64,
}

impl TradeRecord {
    /// Create a record from a closed position.
    pub fn from_position(position: &Position) -> Option<Self> {
        if !position.status.is_closed() {
            return None;
        }
        let exit_time = position.exit_time?;
        let realized_pnl = position.realized_pnl?;
        let exit_debit = position.exit_debit?;

        let days_held = (exit_time.date() - position.entry_time.date()).num_days();
        let premium: f64 = position.premium().try_into().unwrap_or(0.0);
        let pnl: f64 = realized_pnl.try_into().unwrap_or(0.0);
        let return_on_premium = if premium != 0.0 { pnl / premium } else { 0.0 };

        Some(Self {
            position_id: position.id,
            status: position.status,
            legs: position.legs.clone(),
            entry_time: position.entry_time,
            exit_time,
            entry_credit: position.entry_credit,
            exit_debit,
            commissions: position.commissions,
            slippage: position.slippage,
            realized_pnl,
            days_held,
            return_on_premium,
        })
    }

    pub fn is_winner(&self) -> bool {
        self.realized_pnl > Decimal::ZERO
    }

    /// Break-even trades are neither winners nor losers.
    pub fn is_loser(&self) -> bool {
        self.realized_pnl < Decimal::ZERO
    }

    pub fn pnl(&self) -> Decimal {
        self.realized_pnl
    }
}
