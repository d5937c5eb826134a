//! Data loader for materialized simulation inputs.
//!
//! Reads JSON files from a data directory:
//! - a feed: an array of `FeedItem`s (timestamp, optional market snapshot,
//!   optional option chain; a missing part marks a coverage gap)
//! - a signal script: an array of `{ "timestamp": ..., "signal": ... }`
//!   entries replayed by `ScriptedSignalSource`
//!
//! Ordering is not enforced here; the engine records out-of-order items.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backtest::{ScriptedSignalSource, Signal};

use super::types::FeedItem;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("JSON error in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One scripted signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptEntry {
    pub timestamp: NaiveDateTime,
    pub signal: Signal,
}

/// Loader rooted at a data directory. Relative names resolve against it;
/// absolute paths are used as given.
pub struct DataLoader {
    data_dir: PathBuf,
}

impl DataLoader {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    pub fn load_feed(&self, name: &str) -> Result<Vec<FeedItem>, LoaderError> {
        read_feed(&self.resolve(name))
    }

    pub fn load_signals(&self, name: &str) -> Result<ScriptedSignalSource, LoaderError> {
        read_signals(&self.resolve(name))
    }
}

fn read_to_string(path: &Path) -> Result<String, LoaderError> {
    if !path.exists() {
        return Err(LoaderError::FileNotFound(path.display().to_string()));
    }
    Ok(fs::read_to_string(path)?)
}

/// Read a feed file.
pub fn read_feed(path: &Path) -> Result<Vec<FeedItem>, LoaderError> {
    let json = read_to_string(path)?;
    parse_feed(&json).map_err(|e| match e {
        LoaderError::Json { source, .. } => LoaderError::Json {
            path: path.display().to_string(),
            source,
        },
        other => other,
    })
}

/// Read a signal script file.
pub fn read_signals(path: &Path) -> Result<ScriptedSignalSource, LoaderError> {
    let json = read_to_string(path)?;
    parse_signals(&json).map_err(|e| match e {
        LoaderError::Json { source, .. } => LoaderError::Json {
            path: path.display().to_string(),
            source,
        },
        other => other,
    })
}

pub fn parse_feed(json: &str) -> Result<Vec<FeedItem>, LoaderError> {
    let items: Vec<FeedItem> = serde_json::from_str(json).map_err(|source| LoaderError::Json {
        path: "<inline>".to_string(),
        source,
    })?;

    for item in &items {
        if let Some(chain) = &item.chain {
            if let Some(bad) = chain
                .contracts
                .iter()
                .find(|c| c.open_interest < 0 || c.volume < 0)
            {
                return Err(LoaderError::InvalidData(format!(
                    "negative open interest or volume for {} at {}",
                    bad.key(),
                    item.timestamp
                )));
            }
        }
    }
    Ok(items)
}

/// Parse a signal script. Each timestamp may carry at most one signal.
pub fn parse_signals(json: &str) -> Result<ScriptedSignalSource, LoaderError> {
    let entries: Vec<ScriptEntry> =
        serde_json::from_str(json).map_err(|source| LoaderError::Json {
            path: "<inline>".to_string(),
            source,
        })?;

    let mut seen = HashSet::new();
    for entry in &entries {
        if !seen.insert(entry.timestamp) {
            return Err(LoaderError::InvalidData(format!(
                "more than one signal at {}",
                entry.timestamp
            )));
        }
    }

    Ok(entries
        .into_iter()
        .map(|e| (e.timestamp, e.signal))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FEED: &str = r#"[
        {
            "timestamp": "2024-01-16T12:00:00",
            "market": {
                "timestamp": "2024-01-16T12:00:00",
                "underlying_price": "100.00",
                "volatility": 0.18,
                "market_open": true
            },
            "chain": {
                "contracts": [{
                    "strike": "95",
                    "expiration": "2024-02-16",
                    "right": "put",
                    "bid": "0.95",
                    "ask": "1.05",
                    "delta": -0.25,
                    "open_interest": 1200,
                    "volume": 300
                }]
            }
        },
        { "timestamp": "2024-01-16T13:00:00" }
    ]"#;

    const SIGNALS: &str = r#"[
        {
            "timestamp": "2024-01-16T12:00:00",
            "signal": {
                "intent": { "type": "open" },
                "legs": [{
                    "contract": { "strike": "95", "expiration": "2024-02-16", "right": "put" },
                    "action": "sell",
                    "quantity": 1
                }],
                "exit_policy": { "profit_target_pct": 0.5, "stop_loss_multiple": 2.0 }
            }
        },
        {
            "timestamp": "2024-01-17T12:00:00",
            "signal": { "intent": { "type": "close", "position_id": 1 } }
        }
    ]"#;

    #[test]
    fn test_parse_feed_with_gap() {
        let feed = parse_feed(FEED).unwrap();
        assert_eq!(feed.len(), 2);
        assert!(feed[0].is_complete());
        assert!(feed[1].market.is_none() && feed[1].chain.is_none());
        let chain = feed[0].chain.as_ref().unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.contracts[0].implied_volatility, 0.0);
    }

    #[test]
    fn test_parse_signals() {
        let source = parse_signals(SIGNALS).unwrap();
        assert_eq!(source.len(), 2);
    }

    #[test]
    fn test_duplicate_signal_timestamp_rejected() {
        let json = r#"[
            { "timestamp": "2024-01-17T12:00:00", "signal": { "intent": { "type": "close", "position_id": 1 } } },
            { "timestamp": "2024-01-17T12:00:00", "signal": { "intent": { "type": "close", "position_id": 2 } } }
        ]"#;
        assert!(matches!(parse_signals(json), Err(LoaderError::InvalidData(_))));
    }

    #[test]
    fn test_loader_reads_from_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = fs::File::create(dir.path().join("feed.json")).unwrap();
        file.write_all(FEED.as_bytes()).unwrap();

        let loader = DataLoader::new(dir.path());
        assert_eq!(loader.load_feed("feed.json").unwrap().len(), 2);
        assert!(matches!(
            loader.load_feed("missing.json"),
            Err(LoaderError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_malformed_json_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signals.json");
        fs::write(&path, "{ not json").unwrap();

        match read_signals(&path) {
            Err(LoaderError::Json { path: p, .. }) => assert!(p.ends_with("signals.json")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
