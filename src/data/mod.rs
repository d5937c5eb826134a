pub mod loader;
pub mod types;

pub use loader::{parse_feed, parse_signals, read_feed, read_signals, DataLoader, LoaderError, ScriptEntry};
pub use types::{ContractKey, FeedItem, MarketSnapshot, OptionChain, OptionContract, OptionType};
