//! Configuration of a channel manager.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// Default value for `max_auto_moves` in [`ChannelConfig`].
const DEFAULT_MAX_AUTO_MOVES: usize = 100;

/// Default value for `wait_for_change_timeout_ms` in [`ChannelConfig`].
const DEFAULT_WAIT_FOR_CHANGE_TIMEOUT_MS: u64 = 5_000;

/// Default value for `dispute_blocks` in [`ChannelConfig`].
const DEFAULT_DISPUTE_BLOCKS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Upper bound on the number of automoves chained onto a single mutation. A game whose
    /// automoves do not settle within this bound fails the mutation instead of looping.
    #[serde(default = "default_max_auto_moves")]
    pub max_auto_moves: usize,

    /// How long a `waitforchange` call blocks before returning the unchanged state.
    #[serde(default = "default_wait_for_change_timeout_ms")]
    pub wait_for_change_timeout_ms: u64,

    /// Number of blocks after which an on-chain dispute expires.
    #[serde(default = "default_dispute_blocks")]
    pub dispute_blocks: u64,

    /// If set, a dispute is filed automatically once the other participant has not moved
    /// for this many blocks while it is their turn.
    #[serde(default)]
    pub auto_dispute_blocks: Option<u64>,
}

fn default_max_auto_moves() -> usize {
    DEFAULT_MAX_AUTO_MOVES
}

fn default_wait_for_change_timeout_ms() -> u64 {
    DEFAULT_WAIT_FOR_CHANGE_TIMEOUT_MS
}

fn default_dispute_blocks() -> u64 {
    DEFAULT_DISPUTE_BLOCKS
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_auto_moves: DEFAULT_MAX_AUTO_MOVES,
            wait_for_change_timeout_ms: DEFAULT_WAIT_FOR_CHANGE_TIMEOUT_MS,
            dispute_blocks: DEFAULT_DISPUTE_BLOCKS,
            auto_dispute_blocks: None,
        }
    }
}

impl ChannelConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("invalid channel config")
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        Self::from_toml_str(&contents)
    }

    pub fn wait_for_change_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_for_change_timeout_ms)
    }
}
