//! Reassembly buffer for inbound blocks.
//!
//! A session header announces a block as a fixed number of fragment slots;
//! `s` messages then fill the slots in whatever order the resolver path
//! delivers them. The single buffer lock is held across both fragment
//! placement and the completion check, and a completing call removes the
//! entry before returning, so two fragments racing to finish the same block
//! can never both observe completion.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::codec;
use crate::errors::TunnelError;

// Upper bound on announced fragment counts, so a single header cannot pin
// an arbitrary allocation.
pub const MAX_BLOCK_SLOTS: usize = 1 << 16;

#[derive(Debug)]
pub enum Ingest {
    Incomplete,
    Complete(Vec<u8>),
}

struct Entry {
    slots: Vec<Option<Vec<u8>>>,
    announced_at: Instant,
}

pub struct ReassemblyBuffer {
    entries: Mutex<HashMap<String, Entry>>,
    idle: Duration,
}

impl ReassemblyBuffer {
    pub fn new(idle: Duration) -> Self {
        ReassemblyBuffer {
            entries: Mutex::new(HashMap::new()),
            idle,
        }
    }

    /// Allocates `size` empty slots under `block_id`. Re-announcing an
    /// existing ID overwrites it: a late or replayed header truncates the
    /// in-progress reassembly.
    pub fn announce(&self, block_id: &str, size: usize) -> Result<(), TunnelError> {
        if size == 0 || size > MAX_BLOCK_SLOTS {
            return Err(TunnelError::InvalidSequence);
        }
        let mut entries = self.entries.lock().expect("reassembly buffer poisoned");
        entries.insert(
            block_id.to_string(),
            Entry {
                slots: vec![None; size],
                announced_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Places base32 fragments into the block's slots. When the final slot
    /// fills, the entry is removed and the concatenated ciphertext returned;
    /// exactly one caller can receive `Complete` for a given announcement.
    pub fn ingest(&self, block_id: &str, fragments: &[&str]) -> Result<Ingest, TunnelError> {
        let mut entries = self.entries.lock().expect("reassembly buffer poisoned");
        let entry = entries.get_mut(block_id).ok_or(TunnelError::UnknownBlock)?;

        for fragment in fragments {
            let raw = codec::decode_base32(fragment)?;
            let (seq, payload) = codec::split_fragment(&raw)?;
            let slot = entry
                .slots
                .get_mut(seq as usize)
                .ok_or(TunnelError::InvalidSequence)?;
            *slot = Some(payload.to_vec());
        }

        if entry.slots.iter().any(|slot| slot.is_none()) {
            return Ok(Ingest::Incomplete);
        }

        let entry = entries
            .remove(block_id)
            .expect("entry present under held lock");
        let ciphertext = entry
            .slots
            .into_iter()
            .flat_map(|slot| slot.expect("all slots checked full"))
            .collect();
        Ok(Ingest::Complete(ciphertext))
    }

    /// Removes an entry. Idempotent.
    pub fn discard(&self, block_id: &str) {
        let mut entries = self.entries.lock().expect("reassembly buffer poisoned");
        entries.remove(block_id);
    }

    /// Discards entries that have been incomplete longer than the idle
    /// timeout; returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().expect("reassembly buffer poisoned");
        let before = entries.len();
        entries.retain(|_, entry| entry.announced_at.elapsed() <= self.idle);
        before - entries.len()
    }
}
