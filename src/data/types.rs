//! Core data types for options simulation.
//!
//! These types represent the market inputs replayed by the engine: one
//! underlying snapshot and one option chain per timestamp.

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Option type (call or put).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "C" | "CALL" => Some(Self::Call),
            "P" | "PUT" => Some(Self::Put),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "C",
            Self::Put => "P",
        }
    }

    /// Intrinsic value per share at the given underlying price.
    pub fn intrinsic(&self, strike: Decimal, underlying: Decimal) -> Decimal {
        let value = match self {
            Self::Call => underlying - strike,
            Self::Put => strike - underlying,
        };
        value.max(Decimal::ZERO)
    }
}

/// Identity of a listed contract within a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContractKey {
    pub strike: Decimal,
    pub expiration: NaiveDate,
    pub right: OptionType,
}

impl ContractKey {
    pub fn new(strike: Decimal, expiration: NaiveDate, right: OptionType) -> Self {
        Self {
            strike,
            expiration,
            right,
        }
    }
}

impl std::fmt::Display for ContractKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}@{}", self.expiration, self.right.as_str(), self.strike)
    }
}

/// A single option quote at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionContract {
    /// Strike price
    pub strike: Decimal,

    /// Option expiration date
    pub expiration: NaiveDate,

    /// Call or put
    pub right: OptionType,

    /// Bid price (per share)
    pub bid: Decimal,

    /// Ask price (per share)
    pub ask: Decimal,

    /// Implied volatility
    #[serde(default)]
    pub implied_volatility: f64,

    /// Delta (calls positive, puts negative)
    pub delta: f64,

    /// Open interest
    pub open_interest: i64,

    /// Trading volume for the session
    pub volume: i64,
}

impl OptionContract {
    pub fn key(&self) -> ContractKey {
        ContractKey::new(self.strike, self.expiration, self.right)
    }

    /// Mid price.
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }

    /// Bid-ask width.
    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }

    /// Bid-ask spread as a fraction of mid.
    pub fn spread_pct(&self) -> f64 {
        let mid = self.mid();
        if mid.is_zero() {
            return 0.0;
        }
        (self.spread() / mid).try_into().unwrap_or(0.0)
    }

    /// A quote is usable when it is two-sided, uncrossed and has a positive mid.
    pub fn has_valid_quote(&self) -> bool {
        self.bid >= Decimal::ZERO && self.ask >= self.bid && self.mid() > Decimal::ZERO
    }
}

/// All option quotes for one underlying at one timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionChain {
    pub contracts: Vec<OptionContract>,
}

impl OptionChain {
    pub fn new(contracts: Vec<OptionContract>) -> Self {
        Self { contracts }
    }

    /// Look up a contract by (strike, expiration, right).
    pub fn get(&self, key: &ContractKey) -> Option<&OptionContract> {
        self.contracts.iter().find(|c| {
            c.strike == key.strike && c.expiration == key.expiration && c.right == key.right
        })
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    /// Get all strikes available in this chain.
    pub fn strikes(&self) -> Vec<Decimal> {
        let mut strikes: Vec<_> = self.contracts.iter().map(|c| c.strike).collect();
        strikes.sort();
        strikes.dedup();
        strikes
    }

    /// All expirations in the chain, ascending.
    pub fn expirations(&self) -> Vec<NaiveDate> {
        let mut exps: Vec<_> = self.contracts.iter().map(|c| c.expiration).collect();
        exps.sort();
        exps.dedup();
        exps
    }
}

/// Underlying state at one timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub timestamp: NaiveDateTime,

    /// Underlying price
    pub underlying_price: Decimal,

    /// Annualized volatility proxy (0.20 = 20%)
    pub volatility: f64,

    /// Whether the regular session is open at this timestamp
    pub market_open: bool,

    /// Next known ex-dividend date, if any
    #[serde(default)]
    pub ex_dividend_date: Option<NaiveDate>,

    /// Set when an earnings release falls before the next session opens
    #[serde(default)]
    pub earnings_in_gap: bool,
}

/// One element of the replayed feed. `None` marks a coverage gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub timestamp: NaiveDateTime,
    #[serde(default)]
    pub market: Option<MarketSnapshot>,
    #[serde(default)]
    pub chain: Option<OptionChain>,
}

impl FeedItem {
    pub fn new(
        timestamp: NaiveDateTime,
        market: Option<MarketSnapshot>,
        chain: Option<OptionChain>,
    ) -> Self {
        Self {
            timestamp,
            market,
            chain,
        }
    }

    /// Both the underlying bar and the chain are present.
    pub fn is_complete(&self) -> bool {
        self.market.is_some() && self.chain.is_some()
    }
}
