//! Cluster-aware router over several stores.
//!
//! Keys map to one of [SLOT_COUNT] hash slots (CRC16 of the key, or of the
//! `{...}` hash tag when present) and slots are split into contiguous ranges,
//! one per shard. Multi-key pipelines are grouped per shard and reassembled in
//! input order; scripts must keep all their keys in one slot.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::StoreError;
use crate::script::Script;
use crate::store::{KeyValueStore, ScoreRange, SharedStore};

pub const SLOT_COUNT: u16 = 16384;

/// CRC16/XMODEM, the checksum cluster slot assignment is defined over.
fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in bytes {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// The part of `key` that decides its slot: the first non-empty `{tag}`, else the whole key.
fn hash_tag(key: &str) -> &str {
    if let Some(open) = key.find('{') {
        if let Some(len) = key[open + 1..].find('}') {
            if len > 0 {
                return &key[open + 1..open + 1 + len];
            }
        }
    }
    key
}

pub fn hash_slot(key: &str) -> u16 {
    crc16(hash_tag(key).as_bytes()) % SLOT_COUNT
}

pub struct ShardedKeyValueStore {
    shards: Vec<SharedStore>,
}

impl ShardedKeyValueStore {
    pub fn new(shards: Vec<SharedStore>) -> Result<Self, StoreError> {
        if shards.is_empty() {
            return Err(StoreError::Config(
                "sharded store needs at least one shard".to_string(),
            ));
        }
        Ok(Self { shards })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Index of the shard owning `key`.
    pub fn shard_index(&self, key: &str) -> usize {
        hash_slot(key) as usize * self.shards.len() / SLOT_COUNT as usize
    }

    fn shard(&self, key: &str) -> &dyn KeyValueStore {
        self.shards[self.shard_index(key)].as_ref()
    }

    /// Positions of `keys` grouped by owning shard.
    fn group<'k, I>(&self, keys: I) -> BTreeMap<usize, Vec<usize>>
    where
        I: IntoIterator<Item = &'k str>,
    {
        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (position, key) in keys.into_iter().enumerate() {
            groups.entry(self.shard_index(key)).or_default().push(position);
        }
        groups
    }
}

impl KeyValueStore for ShardedKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.shard(key).get(key)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.shard(key).set(key, value, ttl)
    }

    fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.shard(key).set_nx(key, value, ttl)
    }

    fn pttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        self.shard(key).pttl(key)
    }

    fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.shard(key).incr_by(key, delta)
    }

    fn incr_by_many(&self, increments: &[(String, i64)]) -> Result<Vec<i64>, StoreError> {
        let mut out = vec![0; increments.len()];
        for (shard, positions) in self.group(increments.iter().map(|(key, _)| key.as_str())) {
            let batch: Vec<(String, i64)> = positions.iter().map(|&i| increments[i].clone()).collect();
            let totals = self.shards[shard].incr_by_many(&batch)?;
            for (position, total) in positions.into_iter().zip(totals) {
                out[position] = total;
            }
        }
        Ok(out)
    }

    fn del(&self, keys: &[&str]) -> Result<u64, StoreError> {
        let mut removed = 0;
        for (shard, positions) in self.group(keys.iter().copied()) {
            let batch: Vec<&str> = positions.iter().map(|&i| keys[i]).collect();
            removed += self.shards[shard].del(&batch)?;
        }
        Ok(removed)
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.shard(key).exists(key)
    }

    fn exists_many(&self, keys: &[String]) -> Result<Vec<bool>, StoreError> {
        let mut out = vec![false; keys.len()];
        for (shard, positions) in self.group(keys.iter().map(String::as_str)) {
            let batch: Vec<String> = positions.iter().map(|&i| keys[i].clone()).collect();
            let found = self.shards[shard].exists_many(&batch)?;
            for (position, present) in positions.into_iter().zip(found) {
                out[position] = present;
            }
        }
        Ok(out)
    }

    fn zadd(&self, key: &str, score: i64, member: &str) -> Result<bool, StoreError> {
        self.shard(key).zadd(key, score, member)
    }

    fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.shard(key).zcard(key)
    }

    fn zrange_by_score(
        &self,
        key: &str,
        range: ScoreRange,
        limit: usize,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        self.shard(key).zrange_by_score(key, range, limit)
    }

    fn zrem_range_by_score(&self, key: &str, range: ScoreRange) -> Result<u64, StoreError> {
        self.shard(key).zrem_range_by_score(key, range)
    }

    fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.shard(key).zrem(key, member)
    }

    fn eval(&self, script: &Script) -> Result<i64, StoreError> {
        let keys = script.keys();
        let Some(first) = keys.first() else {
            return Err(StoreError::CrossSlot {
                script: script.name(),
            });
        };
        let slot = hash_slot(first);
        if keys.iter().any(|key| hash_slot(key) != slot) {
            return Err(StoreError::CrossSlot {
                script: script.name(),
            });
        }
        self.shard(first).eval(script)
    }

    fn purge_expired(&self) -> Result<u64, StoreError> {
        let mut removed = 0;
        for shard in &self.shards {
            removed += shard.purge_expired()?;
        }
        Ok(removed)
    }
}
