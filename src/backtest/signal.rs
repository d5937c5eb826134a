//! Trade signals and the strategy interface.
//!
//! Strategies are external: the engine only sees them through
//! [`SignalSource`], asking for at most one [`Signal`] per timestamp.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::data::{ContractKey, MarketSnapshot, OptionChain};

use super::execution::RejectReason;

/// Side of a leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegAction {
    Buy,
    Sell,
}

impl LegAction {
    /// The side that flattens this one.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> i64 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }
}

/// One leg of a proposed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLeg {
    pub contract: ContractKey,
    pub action: LegAction,
    pub quantity: u32,
}

impl OrderLeg {
    pub fn new(contract: ContractKey, action: LegAction, quantity: u32) -> Self {
        Self {
            contract,
            action,
            quantity,
        }
    }

    pub fn buy(contract: ContractKey, quantity: u32) -> Self {
        Self::new(contract, LegAction::Buy, quantity)
    }

    pub fn sell(contract: ContractKey, quantity: u32) -> Self {
        Self::new(contract, LegAction::Sell, quantity)
    }
}

/// What the order is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalIntent {
    /// Open a new position from the signal's legs.
    Open,
    /// Close an existing position; the signal's legs are ignored.
    Close { position_id: u64 },
}

/// Exit rules attached to a position at entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitPolicy {
    /// Close when gross profit exceeds this fraction of the entry premium.
    pub profit_target_pct: f64,

    /// Stop multiple of the entry premium (2.0 = close a credit position when
    /// the cost to close reaches twice the credit).
    pub stop_loss_multiple: f64,

    /// Close once days-to-expiration falls to this value.
    pub close_at_dte: Option<i64>,
}

impl Default for ExitPolicy {
    fn default() -> Self {
        Self {
            profit_target_pct: 0.50,
            stop_loss_multiple: 2.0,
            close_at_dte: None,
        }
    }
}

impl ExitPolicy {
    /// Targets and stops must be positive and finite; the DTE window must not
    /// be negative.
    pub fn validate(&self) -> Result<(), RejectReason> {
        let invalid = |field: &str, value: f64| RejectReason::InvalidExitPolicy {
            field: field.to_string(),
            value,
        };
        if !self.profit_target_pct.is_finite() || self.profit_target_pct <= 0.0 {
            return Err(invalid("profit_target_pct", self.profit_target_pct));
        }
        if !self.stop_loss_multiple.is_finite() || self.stop_loss_multiple <= 0.0 {
            return Err(invalid("stop_loss_multiple", self.stop_loss_multiple));
        }
        if let Some(dte) = self.close_at_dte {
            if dte < 0 {
                return Err(invalid("close_at_dte", dte as f64));
            }
        }
        Ok(())
    }
}

/// A proposed order produced by a strategy. Consumed once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub intent: SignalIntent,
    #[serde(default)]
    pub legs: Vec<OrderLeg>,
    #[serde(default)]
    pub exit_policy: ExitPolicy,
}

impl Signal {
    pub fn open(legs: Vec<OrderLeg>, exit_policy: ExitPolicy) -> Self {
        Self {
            intent: SignalIntent::Open,
            legs,
            exit_policy,
        }
    }

    pub fn close(position_id: u64) -> Self {
        Self {
            intent: SignalIntent::Close { position_id },
            legs: Vec::new(),
            exit_policy: ExitPolicy::default(),
        }
    }
}

/// Strategy interface: at most one signal per call.
pub trait SignalSource {
    fn get_signal(
        &mut self,
        timestamp: NaiveDateTime,
        market: &MarketSnapshot,
        chain: &OptionChain,
    ) -> Option<Signal>;
}

/// Replays a fixed timestamp-keyed script of signals.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSignalSource {
    script: BTreeMap<NaiveDateTime, Signal>,
}

impl ScriptedSignalSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_signal(mut self, timestamp: NaiveDateTime, signal: Signal) -> Self {
        self.script.insert(timestamp, signal);
        self
    }

    pub fn insert(&mut self, timestamp: NaiveDateTime, signal: Signal) {
        self.script.insert(timestamp, signal);
    }

    pub fn len(&self) -> usize {
        self.script.len()
    }

    pub fn is_empty(&self) -> bool {
        self.script.is_empty()
    }
}

impl FromIterator<(NaiveDateTime, Signal)> for ScriptedSignalSource {
    fn from_iter<I: IntoIterator<Item = (NaiveDateTime, Signal)>>(iter: I) -> Self {
        Self {
            script: iter.into_iter().collect(),
        }
    }
}

impl SignalSource for ScriptedSignalSource {
    fn get_signal(
        &mut self,
        timestamp: NaiveDateTime,
        _market: &MarketSnapshot,
        _chain: &OptionChain,
    ) -> Option<Signal> {
        self.script.remove(&timestamp)
    }
}
