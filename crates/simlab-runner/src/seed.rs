//! PRNG state capture, persistence and replay.
//!
//! The generator state is a plain value ([`SeedState`]) that is captured
//! before each generation attempt and can be written to disk and restored
//! later to replay that attempt's randomness exactly.

use anyhow::{anyhow, Result};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use simlab_core::write_new_unique;
use std::fs;
use std::path::{Path, PathBuf};

/// Generator handed to the generate stage.
pub type SimRng = ChaCha20Rng;

pub const SEED_SCHEMA_VERSION: &str = "seed_state_v1";

/// Serializable snapshot of a [`SimRng`] position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedState {
    /// 32-byte key, hex encoded.
    pub key: String,
    pub stream: u64,
    #[serde(with = "u128_string")]
    pub word_pos: u128,
}

impl SeedState {
    pub fn capture(rng: &SimRng) -> Self {
        Self {
            key: hex::encode(rng.get_seed()),
            stream: rng.get_stream(),
            word_pos: rng.get_word_pos(),
        }
    }

    pub fn restore(&self) -> Result<SimRng> {
        let bytes = hex::decode(&self.key).map_err(|e| anyhow!("invalid seed key: {}", e))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| anyhow!("seed key must be 32 bytes, got {}", b.len()))?;
        let mut rng = SimRng::from_seed(key);
        rng.set_stream(self.stream);
        rng.set_word_pos(self.word_pos);
        Ok(rng)
    }
}

/// Generator for replication `replication` of a condition.
///
/// Depends only on the condition seed and the index, so dispatch order never
/// changes which numbers a replication sees.
pub fn replication_rng(condition_seed: u64, replication: usize) -> SimRng {
    let mut rng = SimRng::seed_from_u64(condition_seed);
    rng.set_stream(replication as u64);
    rng
}

#[derive(Debug, Serialize, Deserialize)]
struct SeedRecord {
    schema_version: String,
    condition_id: u64,
    replication: usize,
    state: SeedState,
}

/// Writes seed records under `<root>/design-row-<ID>/seed-<rep>.json`.
#[derive(Debug, Clone)]
pub struct SeedStore {
    root: PathBuf,
}

impl SeedStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist without overwriting: repeated attempts for the same
    /// replication land in `seed-<rep>-1.json`, `seed-<rep>-2.json`, ...
    pub fn persist(&self, condition_id: u64, replication: usize, state: &SeedState) -> Result<PathBuf> {
        let record = SeedRecord {
            schema_version: SEED_SCHEMA_VERSION.to_string(),
            condition_id,
            replication,
            state: state.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;
        let path = self
            .root
            .join(format!("design-row-{}", condition_id))
            .join(format!("seed-{}.json", replication));
        write_new_unique(&path, &bytes)
    }
}

/// Read a seed file written by [`SeedStore::persist`] (or a bare [`SeedState`]).
pub fn load_seed(path: &Path) -> Result<SeedState> {
    let bytes = fs::read(path).map_err(|e| anyhow!("failed to read seed {}: {}", path.display(), e))?;
    if let Ok(record) = serde_json::from_slice::<SeedRecord>(&bytes) {
        return Ok(record.state);
    }
    serde_json::from_slice::<SeedState>(&bytes)
        .map_err(|e| anyhow!("failed to parse seed {}: {}", path.display(), e))
}

mod u128_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u128, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
