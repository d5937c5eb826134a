//! Core simulation engine.
//!
//! Replays a feed of market snapshots and option chains:
//! 1. Apply gap risk when a closed session was crossed
//! 2. Merge the item into the last-known-good market and chain
//! 3. Re-mark open positions
//! 4. Ask the strategy for at most one signal and execute it
//! 5. Check exits: profit target, stop loss, DTE, assignment, expiration
//!
//! Missing data degrades the step instead of failing the run. A run is fully
//! determined by the feed, the signal source and the configured seed.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use chrono::NaiveDateTime;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::data::{FeedItem, MarketSnapshot, OptionChain};
use crate::metrics::{Metrics, MetricsCalculator};
use crate::risk::{crosses_closed_interval, AssignmentModel, GapAdjustment, GapContext, GapRiskModel};

use super::config::{ConfigError, SimulationConfig};
use super::execution::{ExecutionModel, ExecutionOutcome, FillContext, RejectReason};
use super::ledger::{PositionLedger, TradeLedger};
use super::signal::{OrderLeg, Signal, SignalIntent, SignalSource};
use super::trade::{ExitDetails, Position, PositionStatus};

/// Something noteworthy that happened during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEvent {
    /// Market or chain data missing at this timestamp.
    DegradedData {
        timestamp: NaiveDateTime,
        missing_market: bool,
        missing_chain: bool,
    },
    /// Timestamp not after the previous processed item; skipped.
    OutOfOrder {
        timestamp: NaiveDateTime,
        previous: NaiveDateTime,
    },
    SignalRejected {
        timestamp: NaiveDateTime,
        position_id: Option<u64>,
        reason: RejectReason,
    },
    GapAdjusted {
        timestamp: NaiveDateTime,
        adjustment: GapAdjustment,
    },
    Assigned {
        timestamp: NaiveDateTime,
        position_id: u64,
        legs: Vec<usize>,
    },
    /// The signal source panicked.
    SourceFailure {
        timestamp: NaiveDateTime,
        message: String,
    },
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub seed: u64,
    pub ledger: TradeLedger,
    /// Positions still open when the feed ran out.
    pub open_positions: Vec<Position>,
    pub events: Vec<RunEvent>,
    pub metrics: Metrics,
}

impl SimulationResult {
    pub fn count_events<F>(&self, pred: F) -> usize
    where
        F: Fn(&RunEvent) -> bool,
    {
        self.events.iter().filter(|e| pred(e)).count()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "signal source panicked".to_string()
    }
}

/// The main simulation engine.
pub struct SimulationEngine {
    config: SimulationConfig,
    execution: ExecutionModel,
    gap: GapRiskModel,
    assignment: AssignmentModel,
    multiplier: Decimal,
    // Per-run state
    rng: ChaCha8Rng,
    positions: PositionLedger,
    events: Vec<RunEvent>,
    market: Option<MarketSnapshot>,
    chain: Option<OptionChain>,
    last_timestamp: Option<NaiveDateTime>,
    /// Timestamp of the last item that carried a market bar.
    last_market_time: Option<NaiveDateTime>,
    last_session_open: Option<bool>,
}

impl SimulationEngine {
    /// Create a new engine. Fails on any invalid threshold.
    pub fn new(config: SimulationConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let multiplier = config.multiplier();
        Ok(Self {
            execution: ExecutionModel::from_config(&config),
            gap: GapRiskModel::new(config.gap.clone()),
            assignment: AssignmentModel::new(config.assignment.clone()),
            multiplier,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            positions: PositionLedger::new(multiplier),
            events: Vec::new(),
            market: None,
            chain: None,
            last_timestamp: None,
            last_market_time: None,
            last_session_open: None,
            config,
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Replay the whole feed.
    pub fn run_feed(
        &mut self,
        source: &mut dyn SignalSource,
        feed: &[FeedItem],
    ) -> SimulationResult {
        self.run(source, feed, NaiveDateTime::MIN, NaiveDateTime::MAX)
    }

    /// Replay the items of `feed` within `[start, end]`.
    pub fn run(
        &mut self,
        source: &mut dyn SignalSource,
        feed: &[FeedItem],
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> SimulationResult {
        self.reset();
        info!(
            "Starting simulation: {} feed items, seed {}",
            feed.len(),
            self.config.seed
        );

        for item in feed {
            if item.timestamp < start || item.timestamp > end {
                continue;
            }
            self.process_item(source, item);
        }

        self.build_result()
    }

    fn reset(&mut self) {
        self.rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        self.positions = PositionLedger::new(self.multiplier);
        self.events.clear();
        self.market = None;
        self.chain = None;
        self.last_timestamp = None;
        self.last_market_time = None;
        self.last_session_open = None;
    }

    fn process_item(&mut self, source: &mut dyn SignalSource, item: &FeedItem) {
        let timestamp = item.timestamp;
        if let Some(previous) = self.last_timestamp {
            if timestamp <= previous {
                warn!("Skipping out-of-order item at {} (previous {})", timestamp, previous);
                self.events.push(RunEvent::OutOfOrder {
                    timestamp,
                    previous,
                });
                return;
            }
        }

        // 1. Gap risk across a closed session, measured from the last bar
        if let Some(market) = &item.market {
            self.apply_gap_risk(timestamp, market.market_open);
            self.last_session_open = Some(market.market_open);
            self.last_market_time = Some(timestamp);
        }
        self.last_timestamp = Some(timestamp);

        // 2. Merge into last-known-good state
        let missing_market = item.market.is_none();
        let missing_chain = item.chain.is_none();
        if let Some(market) = &item.market {
            self.market = Some(market.clone());
        }
        if let Some(chain) = &item.chain {
            self.chain = Some(chain.clone());
        }
        if missing_market || missing_chain {
            warn!(
                "Degraded data at {} (market missing: {}, chain missing: {})",
                timestamp, missing_market, missing_chain
            );
            self.events.push(RunEvent::DegradedData {
                timestamp,
                missing_market,
                missing_chain,
            });
        }

        // 3. Mark to market
        if let Some(chain) = &item.chain {
            for position in self.positions.open_positions_mut() {
                position.update_marks(chain);
            }
        }

        // Nothing trades while the session is closed; the gap step prices
        // the reopen.
        let session_open = self.market.as_ref().is_some_and(|m| m.market_open);

        // 4. Strategy signal, only on complete data in an open session
        if !missing_market && !missing_chain && session_open {
            self.process_signal(source, timestamp);
        }

        // 5. Exits, on last-known-good data
        self.check_exits(timestamp, session_open);
    }

    fn apply_gap_risk(&mut self, timestamp: NaiveDateTime, next_open: bool) {
        let (Some(previous), Some(prev_open), Some(market)) =
            (self.last_market_time, self.last_session_open, self.market.as_ref())
        else {
            return;
        };
        if !crosses_closed_interval(previous, prev_open, timestamp, next_open) {
            return;
        }

        let ctx = GapContext {
            current_time: previous,
            next_time: timestamp,
            volatility: market.volatility,
            earnings_in_gap: market.earnings_in_gap,
            underlying_price: market.underlying_price,
        };
        let adjustments = self.gap.apply(self.positions.open_positions(), &ctx);

        for adjustment in adjustments {
            debug!(
                "Gap {} -> {}: position {} moved {:.4}% (${})",
                previous,
                timestamp,
                adjustment.position_id,
                adjustment.gap_pct * 100.0,
                adjustment.gap_dollars
            );
            if adjustment.force_close {
                if let Some(position) = self.positions.get(adjustment.position_id) {
                    let costs = self.execution.exit_costs(position);
                    let exit = ExitDetails {
                        timestamp,
                        status: PositionStatus::ClosedGap,
                        exit_debit: adjustment.adjusted_close_cost,
                        slippage: costs.slippage + adjustment.penalty_slippage,
                        commission: costs.commission,
                    };
                    self.close_position(adjustment.position_id, exit);
                }
            } else if let Some(position) = self.positions.get_mut(adjustment.position_id) {
                position.unrealized_pnl = adjustment.adjusted_unrealized_pnl;
            }
            self.events.push(RunEvent::GapAdjusted {
                timestamp,
                adjustment,
            });
        }
    }

    fn process_signal(&mut self, source: &mut dyn SignalSource, timestamp: NaiveDateTime) {
        let (Some(market), Some(chain)) = (self.market.as_ref(), self.chain.as_ref()) else {
            return;
        };
        let volatility = market.volatility;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            source.get_signal(timestamp, market, chain)
        }));

        let signal = match outcome {
            Ok(Some(signal)) => signal,
            Ok(None) => return,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!("Signal source failed at {}: {}", timestamp, message);
                self.events.push(RunEvent::SourceFailure { timestamp, message });
                return;
            }
        };

        match signal.intent {
            SignalIntent::Open => self.open_from_signal(timestamp, volatility, signal),
            SignalIntent::Close { position_id } => {
                self.close_from_signal(timestamp, volatility, position_id)
            }
        }
    }

    fn open_from_signal(&mut self, timestamp: NaiveDateTime, volatility: f64, signal: Signal) {
        let Some(chain) = self.chain.as_ref() else {
            return;
        };
        let ctx = FillContext {
            timestamp,
            volatility,
            is_closing: false,
        };

        let outcome = match signal.exit_policy.validate() {
            Ok(()) => self.execution.evaluate(&signal.legs, chain, &ctx, &mut self.rng),
            Err(reason) => ExecutionOutcome::Rejected(reason),
        };

        match outcome {
            ExecutionOutcome::Filled(fill) => {
                let id = self.positions.open(&fill, timestamp, signal.exit_policy);
                info!(
                    "Opened position {} at {}: {} legs, p={:.3}, slippage ${}, commission ${}",
                    id,
                    timestamp,
                    fill.legs.len(),
                    fill.probability,
                    fill.slippage,
                    fill.commission
                );
            }
            ExecutionOutcome::Rejected(reason) => {
                warn!("Rejected open signal at {}: {}", timestamp, reason);
                let id = self.positions.reject(
                    &signal.legs,
                    timestamp,
                    signal.exit_policy,
                    reason.clone(),
                );
                self.events.push(RunEvent::SignalRejected {
                    timestamp,
                    position_id: Some(id),
                    reason,
                });
            }
        }
    }

    fn close_from_signal(&mut self, timestamp: NaiveDateTime, volatility: f64, position_id: u64) {
        let Some(position) = self.positions.get(position_id) else {
            let reason = if self.positions.is_known(position_id) {
                RejectReason::PositionNotOpen { position_id }
            } else {
                RejectReason::UnknownPosition { position_id }
            };
            warn!("Rejected close signal at {}: {}", timestamp, reason);
            self.events.push(RunEvent::SignalRejected {
                timestamp,
                position_id: Some(position_id),
                reason,
            });
            return;
        };

        let legs: Vec<OrderLeg> = position
            .legs
            .iter()
            .map(|l| OrderLeg::new(l.contract, l.action.opposite(), l.quantity))
            .collect();
        let Some(chain) = self.chain.as_ref() else {
            return;
        };
        let ctx = FillContext {
            timestamp,
            volatility,
            is_closing: true,
        };

        match self.execution.evaluate(&legs, chain, &ctx, &mut self.rng) {
            ExecutionOutcome::Filled(fill) => {
                let exit = ExitDetails {
                    timestamp,
                    status: PositionStatus::ClosedSignal,
                    exit_debit: -fill.net_cash_flow(self.multiplier),
                    slippage: fill.slippage,
                    commission: fill.commission,
                };
                self.close_position(position_id, exit);
            }
            ExecutionOutcome::Rejected(reason) => {
                warn!(
                    "Close of position {} rejected at {}: {}",
                    position_id, timestamp, reason
                );
                self.events.push(RunEvent::SignalRejected {
                    timestamp,
                    position_id: Some(position_id),
                    reason,
                });
            }
        }
    }

    /// Evaluate every open position against its exit rules. The first
    /// matching rule wins. Profit, stop and DTE closes need an open session;
    /// assignment and expiration settle regardless.
    fn check_exits(&mut self, timestamp: NaiveDateTime, session_open: bool) {
        let Some(market) = self.market.clone() else {
            return;
        };

        for id in self.positions.open_ids() {
            let mut exit = if session_open {
                self.positions
                    .get(id)
                    .and_then(|p| self.rule_exit(p, timestamp))
            } else {
                None
            };
            if exit.is_none() {
                exit = self.assignment_exit(id, timestamp, &market);
            }
            if exit.is_none() {
                exit = self
                    .positions
                    .get(id)
                    .and_then(|p| Self::expiration_exit(p, timestamp, &market));
            }
            if let Some(exit) = exit {
                self.close_position(id, exit);
            }
        }
    }

    /// Profit target, stop loss and DTE exits, priced at the latest quotes.
    fn rule_exit(&self, position: &Position, timestamp: NaiveDateTime) -> Option<ExitDetails> {
        let status = if position.is_profit_target_hit() {
            PositionStatus::ClosedProfit
        } else if position.is_stop_loss_hit() {
            PositionStatus::ClosedStop
        } else if position.is_dte_exit(timestamp.date()) {
            PositionStatus::ClosedDte
        } else {
            return None;
        };

        let costs = self.execution.exit_costs(position);
        Some(ExitDetails {
            timestamp,
            status,
            exit_debit: position.close_cost(),
            slippage: costs.slippage,
            commission: costs.commission,
        })
    }

    fn assignment_exit(
        &mut self,
        id: u64,
        timestamp: NaiveDateTime,
        market: &MarketSnapshot,
    ) -> Option<ExitDetails> {
        let position = self.positions.get_mut(id)?;
        let assigned = self.assignment.draw(
            position,
            timestamp.date(),
            market.ex_dividend_date,
            &mut self.rng,
        );
        if assigned.is_empty() {
            return None;
        }

        let position = self.positions.get(id)?;
        let costs = self.execution.exit_costs(position);
        let settlement = self
            .assignment
            .settle(position, assigned, market.underlying_price);
        info!(
            "Position {} assigned at {} (legs {:?})",
            id, timestamp, settlement.assigned_legs
        );
        self.events.push(RunEvent::Assigned {
            timestamp,
            position_id: id,
            legs: settlement.assigned_legs.clone(),
        });

        Some(ExitDetails {
            timestamp,
            status: PositionStatus::ClosedAssigned,
            exit_debit: settlement.exit_debit,
            slippage: costs.slippage + settlement.penalty_slippage,
            commission: costs.commission,
        })
    }

    /// Expired legs settle at intrinsic with no costs.
    fn expiration_exit(
        position: &Position,
        timestamp: NaiveDateTime,
        market: &MarketSnapshot,
    ) -> Option<ExitDetails> {
        let date = timestamp.date();
        if !position.is_expired(date) {
            return None;
        }
        Some(ExitDetails {
            timestamp,
            status: PositionStatus::ClosedExpired,
            exit_debit: position.settlement_cost(date, market.underlying_price),
            slippage: Decimal::ZERO,
            commission: Decimal::ZERO,
        })
    }

    fn close_position(&mut self, id: u64, exit: ExitDetails) {
        let status = exit.status;
        match self.positions.close(id, exit) {
            Some(record) => info!(
                "Closed position {} at {}: {:?}, realized ${}",
                id, record.exit_time, status, record.realized_pnl
            ),
            None => debug!("Position {} already closed, ignoring {:?}", id, status),
        }
    }

    fn build_result(&mut self) -> SimulationResult {
        let positions = std::mem::replace(&mut self.positions, PositionLedger::new(self.multiplier));
        let (ledger, open_positions) = positions.into_parts();
        let metrics = MetricsCalculator::calculate(&ledger, self.config.initial_equity);

        info!(
            "Simulation complete: {} trades, {} rejected, {} still open, total P&L ${}",
            ledger.len(),
            ledger.rejected.len(),
            open_positions.len(),
            metrics.total_pnl
        );

        SimulationResult {
            seed: self.config.seed,
            ledger,
            open_positions,
            events: std::mem::take(&mut self.events),
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::signal::{ExitPolicy, ScriptedSignalSource};
    use crate::data::{ContractKey, OptionContract, OptionType};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn key() -> ContractKey {
        ContractKey::new(
            dec!(95),
            NaiveDate::from_ymd_opt(2024, 2, 16).unwrap(),
            OptionType::Put,
        )
    }

    fn chain(mid: Decimal) -> OptionChain {
        OptionChain::new(vec![OptionContract {
            strike: dec!(95),
            expiration: NaiveDate::from_ymd_opt(2024, 2, 16).unwrap(),
            right: OptionType::Put,
            bid: mid - dec!(0.005),
            ask: mid + dec!(0.005),
            implied_volatility: 0.2,
            delta: -0.2,
            open_interest: 5_000,
            volume: 10_000,
        }])
    }

    fn item(ts: NaiveDateTime, mid: Decimal) -> FeedItem {
        FeedItem::new(
            ts,
            Some(MarketSnapshot {
                timestamp: ts,
                underlying_price: dec!(100),
                volatility: 0.15,
                market_open: true,
                ex_dividend_date: None,
                earnings_in_gap: false,
            }),
            Some(chain(mid)),
        )
    }

    fn engine() -> SimulationEngine {
        SimulationEngine::new(SimulationConfig::default()).unwrap()
    }

    struct PanickingSource;

    impl SignalSource for PanickingSource {
        fn get_signal(
            &mut self,
            _timestamp: NaiveDateTime,
            _market: &MarketSnapshot,
            _chain: &OptionChain,
        ) -> Option<Signal> {
            panic!("strategy bug")
        }
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let mut config = SimulationConfig::default();
        config.gap.reference_volatility = 0.0;
        assert!(SimulationEngine::new(config).is_err());
    }

    #[test]
    fn test_open_position_is_left_open_at_end() {
        let mut source = ScriptedSignalSource::new().with_signal(
            at(2, 12),
            Signal::open(vec![OrderLeg::sell(key(), 1)], ExitPolicy::default()),
        );
        let feed = vec![item(at(2, 12), dec!(1.00)), item(at(2, 13), dec!(0.90))];
        let result = engine().run_feed(&mut source, &feed);

        assert!(result.ledger.is_empty());
        assert_eq!(result.open_positions.len(), 1);
        assert_eq!(result.open_positions[0].unrealized_pnl, dec!(10));
    }

    #[test]
    fn test_out_of_order_and_window() {
        let feed = vec![
            item(at(1, 12), dec!(1.00)),
            item(at(2, 12), dec!(1.00)),
            item(at(2, 11), dec!(1.00)),
            item(at(3, 12), dec!(1.00)),
        ];
        let mut source = ScriptedSignalSource::new();
        let result = engine().run(&mut source, &feed, at(2, 0), at(3, 0));

        let out_of_order: Vec<_> = result
            .events
            .iter()
            .filter(|e| matches!(e, RunEvent::OutOfOrder { .. }))
            .collect();
        assert_eq!(
            out_of_order,
            vec![&RunEvent::OutOfOrder {
                timestamp: at(2, 11),
                previous: at(2, 12),
            }]
        );
    }

    #[test]
    fn test_degraded_item_skips_signal() {
        let mut source = ScriptedSignalSource::new().with_signal(
            at(2, 13),
            Signal::open(vec![OrderLeg::sell(key(), 1)], ExitPolicy::default()),
        );
        let feed = vec![
            item(at(2, 12), dec!(1.00)),
            FeedItem::new(at(2, 13), None, Some(chain(dec!(1.00)))),
        ];
        let result = engine().run_feed(&mut source, &feed);

        assert!(result.open_positions.is_empty());
        assert_eq!(
            result.count_events(|e| matches!(
                e,
                RunEvent::DegradedData {
                    missing_market: true,
                    missing_chain: false,
                    ..
                }
            )),
            1
        );
    }

    #[test]
    fn test_source_panic_is_recorded() {
        let feed = vec![item(at(2, 12), dec!(1.00)), item(at(2, 13), dec!(1.00))];
        let result = engine().run_feed(&mut PanickingSource, &feed);
        assert_eq!(
            result.count_events(|e| matches!(e, RunEvent::SourceFailure { message, .. } if message == "strategy bug")),
            2
        );
    }

    #[test]
    fn test_close_signal_for_unknown_position() {
        let mut source = ScriptedSignalSource::new().with_signal(at(2, 12), Signal::close(9));
        let result = engine().run_feed(&mut source, &[item(at(2, 12), dec!(1.00))]);
        assert_eq!(
            result.events,
            vec![RunEvent::SignalRejected {
                timestamp: at(2, 12),
                position_id: Some(9),
                reason: RejectReason::UnknownPosition { position_id: 9 },
            }]
        );
    }

    #[test]
    fn test_close_signal_closes_position() {
        let mut source = ScriptedSignalSource::new()
            .with_signal(
                at(2, 12),
                Signal::open(vec![OrderLeg::sell(key(), 1)], ExitPolicy::default()),
            )
            .with_signal(at(2, 13), Signal::close(1));
        let feed = vec![item(at(2, 12), dec!(1.00)), item(at(2, 13), dec!(0.80))];
        let result = engine().run_feed(&mut source, &feed);

        assert_eq!(result.ledger.len(), 1);
        let trade = &result.ledger.trades[0];
        assert_eq!(trade.status, PositionStatus::ClosedSignal);
        assert_eq!(trade.exit_debit, dec!(80));
        assert_eq!(
            trade.realized_pnl,
            trade.entry_credit - trade.exit_debit - trade.commissions - trade.slippage
        );
    }

    #[test]
    fn test_invalid_exit_policy_is_rejected() {
        let policy = ExitPolicy {
            profit_target_pct: -0.5,
            ..Default::default()
        };
        let mut source = ScriptedSignalSource::new()
            .with_signal(at(2, 12), Signal::open(vec![OrderLeg::sell(key(), 1)], policy));
        let result = engine().run_feed(&mut source, &[item(at(2, 12), dec!(1.00))]);

        assert!(result.ledger.is_empty());
        assert!(result.open_positions.is_empty());
        assert_eq!(result.ledger.rejected.len(), 1);
        assert!(matches!(
            result.ledger.rejected[0].rejection,
            Some(RejectReason::InvalidExitPolicy { .. })
        ));
    }

    #[test]
    fn test_closed_session_holds_signals_and_rule_exits() {
        let mut closed = item(at(2, 20), dec!(2.50));
        if let Some(market) = closed.market.as_mut() {
            market.market_open = false;
        }
        let mut source = ScriptedSignalSource::new()
            .with_signal(
                at(2, 12),
                Signal::open(vec![OrderLeg::sell(key(), 1)], ExitPolicy::default()),
            )
            .with_signal(
                at(2, 20),
                Signal::open(vec![OrderLeg::sell(key(), 1)], ExitPolicy::default()),
            );
        let feed = vec![item(at(2, 12), dec!(1.00)), closed];
        let result = engine().run_feed(&mut source, &feed);

        // Stop is breached on the mark but cannot fire after the close
        assert!(result.ledger.is_empty());
        assert_eq!(result.open_positions.len(), 1);
        assert_eq!(result.open_positions[0].legs[0].mark, dec!(2.50));
        assert!(result.ledger.rejected.is_empty());
        assert_eq!(source.len(), 1);
    }
}
