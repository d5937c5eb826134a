pub mod backtest;
pub mod data;
pub mod metrics;
pub mod risk;

// Re-export commonly used types
pub use backtest::{
    BatchRunner, ConfigError, ExitPolicy, OrderLeg, Position, PositionStatus, RunEvent,
    ScriptedSignalSource, Signal, SignalSource, SimulationConfig, SimulationEngine,
    SimulationResult, TradeLedger, TradeRecord,
};
pub use data::{ContractKey, FeedItem, MarketSnapshot, OptionChain, OptionContract, OptionType};
pub use metrics::{Metrics, MetricsCalculator, ProfitFactor};
pub use risk::{AssignmentModel, GapRiskModel};
