//! Risk models applied to open positions.
//!
//! Provides:
//! - Gap risk across closed sessions (overnight, weekends, earnings)
//! - Early assignment of deep in-the-money short legs

pub mod assignment;
pub mod gap;

pub use assignment::{AssignmentConfig, AssignmentContext, AssignmentModel, AssignmentSettlement};
pub use gap::{
    crosses_closed_interval, spans_weekend, GapAdjustment, GapContext, GapRiskConfig,
    GapRiskModel,
};
