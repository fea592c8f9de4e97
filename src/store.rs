//! Send-block store: pre-chunked outbound payloads awaiting retrieval.
//!
//! Data is segmented once at store time into TXT-sized chunk strings and is
//! immutable afterwards. Clients drive retrieval with `_b` range queries and
//! acknowledge with `_cb`; blocks that are never acknowledged fall to the
//! TTL sweep.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::codec;

struct SendBlock {
    chunks: Vec<String>,
    stored_at: Instant,
}

pub struct SendBlockStore {
    blocks: RwLock<HashMap<String, SendBlock>>,
    chunk_bytes: usize,
    ttl: Duration,
}

impl SendBlockStore {
    pub fn new(chunk_bytes: usize, ttl: Duration) -> Self {
        SendBlockStore {
            blocks: RwLock::new(HashMap::new()),
            chunk_bytes,
            ttl,
        }
    }

    /// Segments `data` into chunk strings and publishes them under a fresh
    /// block ID. Returns the ID and the chunk count.
    pub fn store(&self, data: &[u8]) -> (String, usize) {
        let chunks: Vec<String> = data
            .chunks(self.chunk_bytes)
            .enumerate()
            .map(|(seq, window)| codec::chunk_label(seq as u32, window))
            .collect();
        let count = chunks.len();

        let mut blocks = self.blocks.write().expect("send block store poisoned");
        let id = loop {
            let candidate = codec::random_id(codec::BLOCK_ID_SIZE);
            if !blocks.contains_key(&candidate) {
                break candidate;
            }
        };
        blocks.insert(
            id.clone(),
            SendBlock {
                chunks,
                stored_at: Instant::now(),
            },
        );
        (id, count)
    }

    /// Returns chunks `[start, stop)` clipped to the block bounds. Unknown
    /// IDs and inverted ranges yield an empty list, never an error.
    pub fn range(&self, block_id: &str, start: usize, stop: usize) -> Vec<String> {
        if stop < start {
            return Vec::new();
        }
        let blocks = self.blocks.read().expect("send block store poisoned");
        match blocks.get(block_id) {
            Some(block) => {
                let stop = stop.min(block.chunks.len());
                let start = start.min(stop);
                block.chunks[start..stop].to_vec()
            }
            None => {
                log::debug!("range request for unknown block");
                Vec::new()
            }
        }
    }

    /// Removes a block; returns whether it existed.
    pub fn clear(&self, block_id: &str) -> bool {
        let mut blocks = self.blocks.write().expect("send block store poisoned");
        blocks.remove(block_id).is_some()
    }

    /// Evicts blocks older than the TTL; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut blocks = self.blocks.write().expect("send block store poisoned");
        let before = blocks.len();
        blocks.retain(|_, block| block.stored_at.elapsed() <= self.ttl);
        before - blocks.len()
    }

    #[cfg(test)]
    fn chunk_count(&self, block_id: &str) -> Option<usize> {
        let blocks = self.blocks.read().unwrap();
        blocks.get(block_id).map(|b| b.chunks.len())
    }
}
