//! Chain information consumed by the network layer
//!
//! The peer layer never touches blocks; it only announces our height and
//! cumulative work in the version handshake and refuses peers on a
//! different genesis block.

use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Seed hashed into the genesis identity of the default network
pub const DEFAULT_GENESIS_SEED: &[u8] = b"evo-genesis-block";

/// Read-only view of the local ledger
pub trait ChainInfo: Send + Sync {
    /// Current chain height
    fn height(&self) -> u32;
    /// Cumulative chain work
    fn total_work(&self) -> u64;
    /// Hex-encoded genesis block hash
    fn genesis_hash(&self) -> String;
}

/// Chain info with a fixed genesis and an externally updated tip
#[derive(Debug)]
pub struct StaticChain {
    genesis_hash: String,
    height: AtomicU32,
    total_work: AtomicU64,
}

impl StaticChain {
    pub fn new(genesis_seed: &[u8]) -> Self {
        Self {
            genesis_hash: hex::encode(Sha256::digest(genesis_seed)),
            height: AtomicU32::new(0),
            total_work: AtomicU64::new(0),
        }
    }

    /// Update the announced tip
    pub fn set_tip(&self, height: u32, total_work: u64) {
        self.height.store(height, Ordering::Relaxed);
        self.total_work.store(total_work, Ordering::Relaxed);
    }
}

impl Default for StaticChain {
    fn default() -> Self {
        Self::new(DEFAULT_GENESIS_SEED)
    }
}

impl ChainInfo for StaticChain {
    fn height(&self) -> u32 {
        self.height.load(Ordering::Relaxed)
    }

    fn total_work(&self) -> u64 {
        self.total_work.load(Ordering::Relaxed)
    }

    fn genesis_hash(&self) -> String {
        self.genesis_hash.clone()
    }
}
