//! Position bookkeeping for a single run.
//!
//! The [`PositionLedger`] allocates ids, holds open positions and moves each
//! one into the append-only [`TradeLedger`] exactly once when it closes.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::execution::{Fill, RejectReason};
use super::signal::{ExitPolicy, OrderLeg};
use super::trade::{ExitDetails, Position, PositionStatus, TradeRecord};

/// Closed trades in close order, plus rejected signals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeLedger {
    pub trades: Vec<TradeRecord>,
    pub rejected: Vec<Position>,
}

impl TradeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    pub fn total_pnl(&self) -> Decimal {
        self.trades.iter().map(|t| t.realized_pnl).sum()
    }
}

/// Open positions and the trade ledger they close into.
#[derive(Debug, Clone)]
pub struct PositionLedger {
    next_id: u64,
    multiplier: Decimal,
    open: Vec<Position>,
    ledger: TradeLedger,
}

impl PositionLedger {
    pub fn new(multiplier: Decimal) -> Self {
        Self {
            next_id: 1,
            multiplier,
            open: Vec::new(),
            ledger: TradeLedger::new(),
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Has this id ever been handed out?
    pub fn is_known(&self, position_id: u64) -> bool {
        position_id > 0 && position_id < self.next_id
    }

    /// Open a position from an entry fill. Returns its id.
    pub fn open(&mut self, fill: &Fill, timestamp: NaiveDateTime, policy: ExitPolicy) -> u64 {
        let id = self.allocate_id();
        self.open
            .push(Position::from_fill(id, fill, timestamp, policy, self.multiplier));
        id
    }

    /// Record a rejected open signal. Returns the id given to it.
    pub fn reject(
        &mut self,
        order: &[OrderLeg],
        timestamp: NaiveDateTime,
        policy: ExitPolicy,
        reason: RejectReason,
    ) -> u64 {
        let id = self.allocate_id();
        self.ledger.rejected.push(Position::rejected(
            id,
            order,
            timestamp,
            policy,
            reason,
            self.multiplier,
        ));
        id
    }

    pub fn open_positions(&self) -> &[Position] {
        &self.open
    }

    pub fn open_positions_mut(&mut self) -> &mut [Position] {
        &mut self.open
    }

    pub fn open_ids(&self) -> Vec<u64> {
        self.open.iter().map(|p| p.id).collect()
    }

    pub fn get(&self, position_id: u64) -> Option<&Position> {
        self.open.iter().find(|p| p.id == position_id)
    }

    pub fn get_mut(&mut self, position_id: u64) -> Option<&mut Position> {
        self.open.iter_mut().find(|p| p.id == position_id)
    }

    /// Close an open position and append its trade record. Returns `None`
    /// (and changes nothing) when the id is not open.
    pub fn close(&mut self, position_id: u64, exit: ExitDetails) -> Option<&TradeRecord> {
        let idx = self.open.iter().position(|p| p.id == position_id)?;
        if !self.open[idx].close(exit) {
            return None;
        }
        let position = self.open.remove(idx);
        let record = TradeRecord::from_position(&position)?;
        self.ledger.trades.push(record);
        self.ledger.trades.last()
    }

    pub fn into_parts(self) -> (TradeLedger, Vec<Position>) {
        (self.ledger, self.open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::execution::LegFill;
    use crate::backtest::signal::LegAction;
    use crate::data::{ContractKey, OptionType};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn ts(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(15, 0, 0)
            .unwrap()
    }

    fn key() -> ContractKey {
        ContractKey::new(
            dec!(95),
            NaiveDate::from_ymd_opt(2024, 2, 16).unwrap(),
            OptionType::Put,
        )
    }

    fn fill() -> Fill {
        Fill {
            legs: vec![LegFill {
                contract: key(),
                action: LegAction::Sell,
                quantity: 1,
                bid: dec!(0.95),
                ask: dec!(1.05),
                mid: dec!(1.00),
                fill_price: dec!(0.975),
                delta: -0.3,
            }],
            probability: 1.0,
            slippage: dec!(2.50),
            commission: dec!(1),
        }
    }

    fn exit(status: PositionStatus) -> ExitDetails {
        ExitDetails {
            timestamp: ts(5),
            status,
            exit_debit: dec!(40),
            slippage: dec!(2.50),
            commission: dec!(1),
        }
    }

    #[test]
    fn test_ids_are_ledger_local_and_sequential() {
        let mut a = PositionLedger::new(dec!(100));
        let mut b = PositionLedger::new(dec!(100));
        assert_eq!(a.open(&fill(), ts(2), ExitPolicy::default()), 1);
        assert_eq!(
            a.reject(
                &[OrderLeg::sell(key(), 1)],
                ts(3),
                ExitPolicy::default(),
                RejectReason::EmptyOrder
            ),
            2
        );
        assert_eq!(b.open(&fill(), ts(2), ExitPolicy::default()), 1);
        assert!(a.is_known(2));
        assert!(!a.is_known(3));
    }

    #[test]
    fn test_close_moves_position_once() {
        let mut ledger = PositionLedger::new(dec!(100));
        let id = ledger.open(&fill(), ts(2), ExitPolicy::default());

        let record = ledger.close(id, exit(PositionStatus::ClosedProfit)).cloned().unwrap();
        // 100 credit - 40 debit - 2 commission - 5 slippage
        assert_eq!(record.realized_pnl, dec!(53));
        assert!(ledger.open_positions().is_empty());

        assert!(ledger.close(id, exit(PositionStatus::ClosedStop)).is_none());
        let (trades, open) = ledger.into_parts();
        assert!(open.is_empty());
        assert_eq!(trades.len(), 1);
        assert_eq!(trades.trades[0].status, PositionStatus::ClosedProfit);
    }

    #[test]
    fn test_non_closing_status_is_ignored() {
        let mut ledger = PositionLedger::new(dec!(100));
        let id = ledger.open(&fill(), ts(2), ExitPolicy::default());
        assert!(ledger.close(id, exit(PositionStatus::Rejected)).is_none());
        assert!(ledger.get(id).unwrap().is_open());
    }

    #[test]
    fn test_rejections_are_kept() {
        let mut ledger = PositionLedger::new(dec!(100));
        ledger.reject(
            &[OrderLeg::sell(key(), 1)],
            ts(2),
            ExitPolicy::default(),
            RejectReason::UnresolvableLeg { contract: key() },
        );
        let (trades, open) = ledger.into_parts();
        assert!(trades.is_empty());
        assert!(open.is_empty());
        assert_eq!(trades.rejected.len(), 1);
        assert_eq!(trades.rejected[0].status, PositionStatus::Rejected);
    }
}
