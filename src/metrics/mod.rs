//! Performance metrics module.
//!
//! Aggregates a run's trade ledger:
//! - Win rate, profit factor
//! - Sharpe ratio, Sortino ratio
//! - Maximum drawdown
//! - Total and annualized return

pub mod calculator;

pub use calculator::{DrawdownAnalysis, EquityPoint, Metrics, MetricsCalculator, ProfitFactor};
