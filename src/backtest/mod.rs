//! Simulation engine for options strategies.
//!
//! This module provides the event-driven replay:
//! - Signal intake from a pluggable strategy
//! - Probabilistic execution with slippage and commissions
//! - Position lifecycle (entry, marks, exits)
//! - Append-only trade ledger
//! - Parallel batch runs

pub mod batch;
pub mod commission;
pub mod config;
pub mod engine;
pub mod execution;
pub mod ledger;
pub mod signal;
pub mod slippage;
pub mod trade;

pub use batch::{BatchOutcome, BatchRunner};
pub use commission::{Commission, CommissionModel};
pub use config::{ConfigError, SimulationConfig};
pub use engine::{RunEvent, SimulationEngine, SimulationResult};
pub use execution::{
    ExecutionConfig, ExecutionModel, ExecutionOutcome, ExitCosts, Fill, FillContext, LegFill,
    RejectReason,
};
pub use ledger::{PositionLedger, TradeLedger};
pub use signal::{
    ExitPolicy, LegAction, OrderLeg, ScriptedSignalSource, Signal, SignalIntent, SignalSource,
};
pub use slippage::{Slippage, SlippageModel};
pub use trade::{ExitDetails, Position, PositionLeg, PositionStatus, TradeRecord};
