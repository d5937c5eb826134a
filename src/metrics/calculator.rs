//! Performance metrics calculator.
//!
//! Pure aggregation over a [`TradeLedger`]. Every ratio has a defined value
//! for empty or degenerate input; nothing here produces NaN or infinity.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::backtest::{PositionStatus, TradeLedger, TradeRecord};

const TRADING_DAYS_PER_YEAR: f64 = 252.0;
const CALENDAR_DAYS_PER_YEAR: f64 = 365.25;

/// Gross profit over gross loss, with explicit sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum ProfitFactor {
    Ratio(f64),
    /// Trades exist but none lost money.
    NoLosses,
    NoTrades,
}

impl ProfitFactor {
    pub fn ratio(&self) -> Option<f64> {
        match self {
            Self::Ratio(r) => Some(*r),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProfitFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ratio(r) => write!(f, "{r:.2}"),
            Self::NoLosses => write!(f, "n/a (no losses)"),
            Self::NoTrades => write!(f, "n/a (no trades)"),
        }
    }
}

/// Equity after each closing day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub equity: Decimal,
    pub daily_pnl: Decimal,
}

/// Drawdown analysis details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawdownAnalysis {
    pub max_drawdown: Decimal,
    pub max_drawdown_pct: f64,
    pub peak_date: Option<NaiveDate>,
    pub trough_date: Option<NaiveDate>,
}

/// Summary statistics for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    // Basic statistics
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub rejected_signals: usize,

    // P&L metrics
    pub total_pnl: Decimal,
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    pub profit_factor: ProfitFactor,
    pub avg_trade_pnl: Decimal,
    pub avg_winner: Decimal,
    pub avg_loser: Decimal,
    pub largest_winner: Decimal,
    pub largest_loser: Decimal,

    // Return metrics
    pub initial_equity: Decimal,
    pub final_equity: Decimal,
    pub total_return_pct: f64,
    pub annualized_return_pct: f64,

    // Risk metrics
    pub max_drawdown: Decimal,
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,

    // Time metrics
    pub avg_days_held: f64,

    // Costs
    pub total_commission: Decimal,
    pub total_slippage: Decimal,

    pub closes_by_status: BTreeMap<PositionStatus, usize>,
}

impl Metrics {
    /// Generate a summary report.
    pub fn summary(&self) -> String {
        let mut closes = String::new();
        for (status, count) in &self.closes_by_status {
            closes.push_str(&format!("\n  {status:?}: {count}"));
        }
        format!(
            "Performance Summary\n\
             ====================\n\
             \n\
             Trades: {} (W: {}, L: {}), rejected signals: {}\n\
             Win Rate: {:.1}%\n\
             Profit Factor: {}\n\
             \n\
             Total P&L: ${:.2}\n\
             Avg Trade: ${:.2}\n\
             Avg Winner: ${:.2}\n\
             Avg Loser: ${:.2}\n\
             Largest Win: ${:.2}\n\
             Largest Loss: ${:.2}\n\
             \n\
             Total Return: {:.2}%\n\
             Annualized Return: {:.2}%\n\
             Max Drawdown: ${:.2} ({:.2}%)\n\
             Sharpe Ratio: {:.2}\n\
             Sortino Ratio: {:.2}\n\
             \n\
             Avg Days Held: {:.1}\n\
             Commission: ${:.2}\n\
             Slippage: ${:.2}\n\
             \n\
             Closes:{}",
            self.total_trades,
            self.winning_trades,
            self.losing_trades,
            self.rejected_signals,
            self.win_rate * 100.0,
            self.profit_factor,
            self.total_pnl,
            self.avg_trade_pnl,
            self.avg_winner,
            self.avg_loser,
            self.largest_winner,
            self.largest_loser,
            self.total_return_pct,
            self.annualized_return_pct,
            self.max_drawdown,
            self.max_drawdown_pct,
            self.sharpe_ratio,
            self.sortino_ratio,
            self.avg_days_held,
            self.total_commission,
            self.total_slippage,
            closes,
        )
    }
}

fn to_f64(value: Decimal) -> f64 {
    value.try_into().unwrap_or(0.0)
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn average(total: Decimal, count: usize) -> Decimal {
    if count == 0 {
        Decimal::ZERO
    } else {
        total / Decimal::from(count as u64)
    }
}

/// Metrics calculator.
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Calculate all metrics from a trade ledger.
    pub fn calculate(ledger: &TradeLedger, initial_equity: Decimal) -> Metrics {
        let trades = &ledger.trades;

        // Basic counts
        let total_trades = ledger.len();
        let winning_trades = trades.iter().filter(|t| t.is_winner()).count();
        let losing_trades = trades.iter().filter(|t| t.is_loser()).count();
        let win_rate = if total_trades > 0 {
            winning_trades as f64 / total_trades as f64
        } else {
            0.0
        };

        // P&L
        let total_pnl = ledger.total_pnl();
        let gross_profit: Decimal = trades
            .iter()
            .filter(|t| t.is_winner())
            .map(TradeRecord::pnl)
            .sum();
        let gross_loss: Decimal = trades
            .iter()
            .filter(|t| t.is_loser())
            .map(TradeRecord::pnl)
            .sum();
        let profit_factor = Self::profit_factor(total_trades, gross_profit, gross_loss);

        let largest_winner = trades
            .iter()
            .filter(|t| t.is_winner())
            .map(TradeRecord::pnl)
            .max()
            .unwrap_or(Decimal::ZERO);
        let largest_loser = trades
            .iter()
            .filter(|t| t.is_loser())
            .map(TradeRecord::pnl)
            .min()
            .unwrap_or(Decimal::ZERO);

        // Returns
        let final_equity = initial_equity + total_pnl;
        let total_return_pct = if initial_equity > Decimal::ZERO {
            finite_or_zero(to_f64(total_pnl) / to_f64(initial_equity) * 100.0)
        } else {
            0.0
        };
        let annualized_return_pct =
            Self::annualized_return(trades, initial_equity, final_equity);

        // Risk
        let curve = Self::equity_curve(trades, initial_equity);
        let drawdown = Self::analyze_drawdown(&curve, initial_equity);
        let returns = Self::daily_returns(&curve, initial_equity);
        let sharpe_ratio = Self::sharpe(&returns);
        let sortino_ratio = Self::sortino(&returns);

        let avg_days_held = if total_trades > 0 {
            trades.iter().map(|t| t.days_held as f64).sum::<f64>() / total_trades as f64
        } else {
            0.0
        };

        let mut closes_by_status = BTreeMap::new();
        for trade in trades {
            *closes_by_status.entry(trade.status).or_insert(0) += 1;
        }

        Metrics {
            total_trades,
            winning_trades,
            losing_trades,
            win_rate,
            rejected_signals: ledger.rejected.len(),
            total_pnl,
            gross_profit,
            gross_loss,
            profit_factor,
            avg_trade_pnl: average(total_pnl, total_trades),
            avg_winner: average(gross_profit, winning_trades),
            avg_loser: average(gross_loss, losing_trades),
            largest_winner,
            largest_loser,
            initial_equity,
            final_equity,
            total_return_pct,
            annualized_return_pct,
            max_drawdown: drawdown.max_drawdown,
            max_drawdown_pct: drawdown.max_drawdown_pct,
            sharpe_ratio,
            sortino_ratio,
            avg_days_held,
            total_commission: trades.iter().map(|t| t.commissions).sum(),
            total_slippage: trades.iter().map(|t| t.slippage).sum(),
            closes_by_status,
        }
    }

    fn profit_factor(trades: usize, gross_profit: Decimal, gross_loss: Decimal) -> ProfitFactor {
        if trades == 0 {
            return ProfitFactor::NoTrades;
        }
        if gross_loss.is_zero() {
            return ProfitFactor::NoLosses;
        }
        ProfitFactor::Ratio(finite_or_zero(
            to_f64(gross_profit) / to_f64(gross_loss.abs()),
        ))
    }

    /// Compound annual return over the calendar span from first entry to
    /// last exit.
    fn annualized_return(trades: &[TradeRecord], initial: Decimal, final_val: Decimal) -> f64 {
        let first_entry = trades.iter().map(|t| t.entry_time).min();
        let last_exit = trades.iter().map(|t| t.exit_time).max();
        let (Some(start), Some(end)) = (first_entry, last_exit) else {
            return 0.0;
        };

        let days = (end - start).num_seconds() as f64 / 86_400.0;
        let init = to_f64(initial);
        let fin = to_f64(final_val);
        if days <= 0.0 || init <= 0.0 || fin <= 0.0 {
            return 0.0;
        }

        let years = days / CALENDAR_DAYS_PER_YEAR;
        finite_or_zero(((fin / init).powf(1.0 / years) - 1.0) * 100.0)
    }

    /// Replay closed trades in close order into a daily equity curve.
    pub fn equity_curve(trades: &[TradeRecord], initial_equity: Decimal) -> Vec<EquityPoint> {
        let mut ordered: Vec<(NaiveDateTime, Decimal)> =
            trades.iter().map(|t| (t.exit_time, t.realized_pnl)).collect();
        ordered.sort_by_key(|(time, _)| *time);

        let mut curve: Vec<EquityPoint> = Vec::new();
        let mut equity = initial_equity;
        for (time, pnl) in ordered {
            equity += pnl;
            match curve.last_mut() {
                Some(point) if point.date == time.date() => {
                    point.equity = equity;
                    point.daily_pnl += pnl;
                }
                _ => curve.push(EquityPoint {
                    date: time.date(),
                    equity,
                    daily_pnl: pnl,
                }),
            }
        }
        curve
    }

    /// Largest peak-to-trough decline, starting from initial equity.
    pub fn analyze_drawdown(curve: &[EquityPoint], initial_equity: Decimal) -> DrawdownAnalysis {
        let mut peak = initial_equity;
        let mut peak_date = None;
        let mut analysis = DrawdownAnalysis {
            max_drawdown: Decimal::ZERO,
            max_drawdown_pct: 0.0,
            peak_date: None,
            trough_date: None,
        };

        for point in curve {
            if point.equity > peak {
                peak = point.equity;
                peak_date = Some(point.date);
                continue;
            }
            let drawdown = peak - point.equity;
            if drawdown > analysis.max_drawdown {
                analysis.max_drawdown = drawdown;
                analysis.max_drawdown_pct = if peak > Decimal::ZERO {
                    finite_or_zero(to_f64(drawdown) / to_f64(peak) * 100.0)
                } else {
                    0.0
                };
                analysis.peak_date = peak_date;
                analysis.trough_date = Some(point.date);
            }
        }
        analysis
    }

    /// Per-day returns of the equity curve.
    fn daily_returns(curve: &[EquityPoint], initial_equity: Decimal) -> Vec<f64> {
        let mut prev = to_f64(initial_equity);
        let mut returns = Vec::with_capacity(curve.len());
        for point in curve {
            let equity = to_f64(point.equity);
            if prev > 0.0 {
                returns.push((equity - prev) / prev);
            }
            prev = equity;
        }
        returns
    }

    /// Annualized Sharpe ratio (risk-free rate 0). 0.0 when undefined.
    pub fn sharpe(returns: &[f64]) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }
        let mean = returns.mean();
        let std_dev = returns.std_dev();
        if !std_dev.is_finite() || std_dev == 0.0 {
            return 0.0;
        }
        finite_or_zero(mean / std_dev * TRADING_DAYS_PER_YEAR.sqrt())
    }

    /// Annualized Sortino ratio over downside deviation. 0.0 when undefined.
    pub fn sortino(returns: &[f64]) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }
        let mean = returns.mean();
        let downside: Vec<f64> = returns.iter().map(|r| r.min(0.0).powi(2)).collect();
        let downside_dev = downside.mean().sqrt();
        if !downside_dev.is_finite() || downside_dev == 0.0 {
            return 0.0;
        }
        finite_or_zero(mean / downside_dev * TRADING_DAYS_PER_YEAR.sqrt())
    }
}
