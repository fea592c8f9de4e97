use anyhow::{anyhow, Result};
use std::time::Duration;

// Max TXT character-string is 255 bytes. A chunk is base64(4-byte sequence
// number + window), prefixed with ".", so (n + 4) * 8 / 6 + 1 must stay
// under 255. n = 185 leaves some slop below the n = 187 ceiling.
pub const MAX_CHUNK_BYTES: usize = 185;

/// Runtime configuration for a tunnel instance.
///
/// Only the apex and the bind address are exposed on the command line;
/// everything else is fixed at construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// DNS zone the tunnel answers authoritatively for.
    pub apex: String,
    /// UDP listen address.
    pub bind_addr: String,
    /// Raw bytes per pre-chunked send-block window.
    pub block_chunk_bytes: usize,
    /// Sessions without a checkin for this long are closed by the sweep.
    pub session_idle: Duration,
    /// Reassembly entries that never complete are discarded after this long.
    pub reasm_idle: Duration,
    /// Unclaimed send blocks are evicted after this long.
    pub block_ttl: Duration,
    /// Label for the apex RSA keypair.
    pub rsa_keypair_name: String,
    /// Key size for the apex RSA keypair generated at startup.
    pub rsa_bits: usize,
}

impl Config {
    pub fn new(apex: impl Into<String>) -> Self {
        Config {
            apex: apex.into(),
            bind_addr: "0.0.0.0:53".to_string(),
            block_chunk_bytes: MAX_CHUNK_BYTES,
            session_idle: Duration::from_secs(30 * 60),
            reasm_idle: Duration::from_secs(60),
            block_ttl: Duration::from_secs(10 * 60),
            rsa_keypair_name: "warren-rsa".to_string(),
            rsa_bits: 2048,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.apex.trim_matches('.').is_empty() {
            return Err(anyhow!("apex domain must not be empty"));
        }
        if self.block_chunk_bytes == 0 || self.block_chunk_bytes > MAX_CHUNK_BYTES {
            return Err(anyhow!(
                "block_chunk_bytes must be in 1..={} (got {})",
                MAX_CHUNK_BYTES,
                self.block_chunk_bytes
            ));
        }
        if self.rsa_bits < 1024 {
            return Err(anyhow!("rsa_bits must be at least 1024"));
        }
        Ok(())
    }
}
