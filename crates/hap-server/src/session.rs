//! Per-connection session state and the registry that owns it.
//!
//! Every pairing transition, every frame seal/open and every subscription
//! change goes through [`SessionRegistry`], which guards all sessions with a
//! single lock. The lock is never held across an `.await`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use hap_core::error::{CryptoError, TransportError};
use hap_core::ids::{CharacteristicId, ConnectionId};
use hap_crypto::chacha::{frame_len, FrameCipher};
use hap_crypto::keys::SessionKeys;
use hap_pairing::{PairSetup, PairVerify};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

/// Bytes queued for a connection's writer.
#[derive(Debug)]
pub enum Outbound {
    /// Response to the request just handled. With `activate` set, keys staged
    /// by pair-verify become active once these bytes are written.
    Response { bytes: Vec<u8>, activate: bool },
    /// Unsolicited event notification.
    Event(Vec<u8>),
}

/// Ways to reach a connection's task from outside.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub outbound: mpsc::Sender<Outbound>,
    pub closed: Arc<Notify>,
}

/// The long-lived record of one connection.
#[derive(Default)]
pub struct Session {
    pub peer: Option<SocketAddr>,
    pub pair_setup: Option<PairSetup>,
    pub pair_verify: Option<PairVerify>,
    /// Controller verified by pair-verify, set when its keys are staged.
    pub controller: Option<String>,
    staged: Option<SessionKeys>,
    cipher: Option<FrameCipher>,
    subscriptions: HashSet<CharacteristicId>,
    handle: Option<ConnectionHandle>,
}

impl Session {
    /// True once application data on this connection is encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn subscriptions(&self) -> &HashSet<CharacteristicId> {
        &self.subscriptions
    }

    /// Frame counters `(sent, received)`, once encrypted.
    pub fn counters(&self) -> Option<(u64, u64)> {
        self.cipher
            .as_ref()
            .map(|c| (c.encrypt_counter(), c.decrypt_counter()))
    }
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<ConnectionId, Session>,
    subscribers: HashMap<CharacteristicId, BTreeSet<ConnectionId>>,
}

/// Concurrency-safe map from connection to [`Session`].
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Registry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on the session for `conn`, creating it on first access.
    pub fn with_session<R>(&self, conn: ConnectionId, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut inner = self.lock();
        f(inner.sessions.entry(conn).or_default())
    }

    /// Register a newly accepted connection.
    pub fn attach(&self, conn: ConnectionId, peer: SocketAddr, handle: ConnectionHandle) {
        self.with_session(conn, |session| {
            session.peer = Some(peer);
            session.handle = Some(handle);
        });
    }

    /// Forget the connection's handle so no new events are queued for it.
    /// The session itself stays until [`remove`](Self::remove).
    pub fn detach(&self, conn: ConnectionId) -> Option<ConnectionHandle> {
        self.lock().sessions.get_mut(&conn)?.handle.take()
    }

    /// Drop the session and every subscription it held.
    pub fn remove(&self, conn: ConnectionId) -> Option<Session> {
        let mut inner = self.lock();
        let session = inner.sessions.remove(&conn)?;
        for characteristic in &session.subscriptions {
            if let Some(set) = inner.subscribers.get_mut(characteristic) {
                set.remove(&conn);
                if set.is_empty() {
                    inner.subscribers.remove(characteristic);
                }
            }
        }
        debug!(conn = %conn, "session removed");
        Some(session)
    }

    /// Every connection with a session, in ascending order.
    pub fn active_connections(&self) -> Vec<ConnectionId> {
        let mut conns: Vec<_> = self.lock().sessions.keys().copied().collect();
        conns.sort();
        conns
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handle(&self, conn: ConnectionId) -> Option<ConnectionHandle> {
        self.lock()
            .sessions
            .get(&conn)
            .and_then(|s| s.handle.clone())
    }

    pub fn is_encrypted(&self, conn: ConnectionId) -> bool {
        self.lock()
            .sessions
            .get(&conn)
            .is_some_and(Session::is_encrypted)
    }

    /// Verified controller on an encrypted connection.
    pub fn controller_of(&self, conn: ConnectionId) -> Option<String> {
        let inner = self.lock();
        let session = inner.sessions.get(&conn)?;
        if session.is_encrypted() {
            session.controller.clone()
        } else {
            None
        }
    }

    /// Connections verified as `controller_id`.
    pub fn connections_of(&self, controller_id: &str) -> Vec<ConnectionId> {
        let mut conns: Vec<_> = self
            .lock()
            .sessions
            .iter()
            .filter(|(_, s)| s.controller.as_deref() == Some(controller_id))
            .map(|(id, _)| *id)
            .collect();
        conns.sort();
        conns
    }

    /// Hold pair-verify keys until the M4 response has been written.
    pub fn stage_keys(&self, conn: ConnectionId, controller_id: String, keys: SessionKeys) {
        self.with_session(conn, |session| {
            session.controller = Some(controller_id);
            session.staged = Some(keys);
        });
    }

    /// Promote staged keys; counters start at zero.
    pub fn activate_staged(&self, conn: ConnectionId) -> bool {
        let mut inner = self.lock();
        let Some(session) = inner.sessions.get_mut(&conn) else {
            return false;
        };
        match session.staged.take() {
            Some(keys) => {
                session.cipher = Some(keys.cipher());
                debug!(conn = %conn, "session encryption active");
                true
            }
            None => false,
        }
    }

    /// Encrypt outbound bytes, or pass them through before pair-verify.
    pub fn seal(&self, conn: ConnectionId, plaintext: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut inner = self.lock();
        let session = inner
            .sessions
            .get_mut(&conn)
            .ok_or(TransportError::UnknownConnection(conn.0))?;
        match session.cipher.as_mut() {
            Some(cipher) => cipher.encrypt(plaintext).map_err(seal_error),
            None => Ok(plaintext.to_vec()),
        }
    }

    /// Turn buffered inbound bytes into plaintext.
    ///
    /// Before pair-verify the whole buffer is plaintext. Afterwards every
    /// complete frame is decrypted and removed from `raw`; a trailing partial
    /// frame stays for the next call.
    pub fn open(&self, conn: ConnectionId, raw: &mut Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let mut inner = self.lock();
        let session = inner
            .sessions
            .get_mut(&conn)
            .ok_or(TransportError::UnknownConnection(conn.0))?;
        let Some(cipher) = session.cipher.as_mut() else {
            return Ok(std::mem::take(raw));
        };

        let mut plaintext = Vec::new();
        let mut consumed = 0;
        loop {
            let len = match frame_len(&raw[consumed..]) {
                Ok(Some(len)) => len,
                Ok(None) => break,
                Err(_) => {
                    let declared = u16::from_le_bytes([raw[consumed], raw[consumed + 1]]);
                    return Err(TransportError::FrameTooLarge(declared as usize));
                }
            };
            if raw.len() - consumed < len {
                break;
            }
            let block = cipher
                .decrypt(&raw[consumed..consumed + len])
                .map_err(|_| TransportError::FrameIntegrity)?;
            plaintext.extend_from_slice(&block);
            consumed += len;
        }
        raw.drain(..consumed);
        trace!(conn = %conn, len = plaintext.len(), "opened frames");
        Ok(plaintext)
    }

    /// Enable or disable event delivery of `characteristic` to `conn`.
    pub fn set_subscription(&self, conn: ConnectionId, characteristic: CharacteristicId, on: bool) {
        let mut inner = self.lock();
        let Registry {
            sessions,
            subscribers,
        } = &mut *inner;
        let session = sessions.entry(conn).or_default();
        if on {
            session.subscriptions.insert(characteristic);
            subscribers.entry(characteristic).or_default().insert(conn);
        } else {
            session.subscriptions.remove(&characteristic);
            if let Some(set) = subscribers.get_mut(&characteristic) {
                set.remove(&conn);
                if set.is_empty() {
                    subscribers.remove(&characteristic);
                }
            }
        }
    }

    /// Connections subscribed to `characteristic`, in ascending order.
    pub fn subscribers_of(&self, characteristic: CharacteristicId) -> Vec<ConnectionId> {
        self.lock()
            .subscribers
            .get(&characteristic)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn seal_error(err: CryptoError) -> TransportError {
    match err {
        CryptoError::NonceExhausted => TransportError::ConnectionClosed,
        _ => TransportError::FrameIntegrity,
    }
}
