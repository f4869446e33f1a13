use std::net::SocketAddr;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use ahash::{AHashMap, AHashSet};
use parking_lot::{Mutex, RwLock};
use proto::error::close;
use proto::{Envelope, Principal, Role};

use crate::kv::{KvError, KvStore};
use crate::queue::{Outbound, OverflowPolicy, PushOutcome, SendQueue};

/// Which listener a connection arrived on. Must agree with the principal
/// kind for the session's whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Adapter,
    Client,
}

pub struct SessionParams {
    pub remote: SocketAddr,
    pub origin: ListenerKind,
    pub principal: Principal,
    pub now: u64,
}

/// One live connection. Owned by the registry; the receive and send tasks
/// hold the same `Arc` and talk to each other only through the queue and
/// the atomic close flag.
pub struct Session {
    pub conn_id: u64,
    pub remote: SocketAddr,
    pub origin: ListenerKind,
    pub principal: Principal,
    pub created_at: u64,
    last_received: AtomicU64,
    last_pong: AtomicU64,
    closing: AtomicBool,
    queue: SendQueue,
}

impl Session {
    pub fn touch(&self, now: u64) {
        self.last_received.store(now, Ordering::Relaxed);
    }

    pub fn last_received(&self) -> u64 {
        self.last_received.load(Ordering::Relaxed)
    }

    pub fn pong(&self, now: u64) {
        self.last_pong.store(now, Ordering::Relaxed);
    }

    pub fn last_pong(&self) -> u64 {
        self.last_pong.load(Ordering::Relaxed)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    /// Enqueue one envelope for transmission. Overflow applies the
    /// listener's policy; a fatal overflow flips the close flag.
    pub fn send(&self, envelope: Envelope) -> PushOutcome {
        let outcome = self.queue.push(envelope);
        if outcome == PushOutcome::Overflowed {
            self.closing.store(true, Ordering::Relaxed);
        }
        outcome
    }

    pub fn send_ping(&self) {
        self.queue.push_ping();
    }

    /// Mark the session for close and enqueue the close frame. The flag is
    /// the single cancellation signal; both tasks observe it cooperatively.
    pub fn close(&self, code: u16, reason: &str, immediate: bool) {
        self.closing.store(true, Ordering::Relaxed);
        self.queue.close(code, reason, immediate);
    }

    pub async fn next_outbound(&self) -> Option<Outbound> {
        self.queue.pop().await
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn server_id(&self) -> Option<&str> {
        match &self.principal {
            Principal::Adapter { server_id, .. } => Some(server_id),
            Principal::Client { .. } => None,
        }
    }
}

/// The in-process directory of live sessions plus the per-server K/V state.
///
/// All state is lost on restart by design. Cloning shares the same maps.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

struct Inner {
    sessions: RwLock<AHashMap<u64, Arc<Session>>>,
    adapters: RwLock<AHashMap<String, u64>>,
    roles: RwLock<[AHashSet<u64>; Role::COUNT]>,
    kv: Mutex<KvStore>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl Registry {
    pub fn new(queue_capacity: usize, kv_budget: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: RwLock::new(AHashMap::with_capacity(1024)),
                adapters: RwLock::new(AHashMap::new()),
                roles: RwLock::new(std::array::from_fn(|_| AHashSet::new())),
                kv: Mutex::new(KvStore::new(kv_budget)),
                next_id: AtomicU64::new(0),
                queue_capacity,
            }),
        }
    }

    /// Create and index a session. A second adapter claiming an already
    /// registered `server_id` displaces the prior session: its close flag
    /// is set, a `server_displaced` close frame is enqueued behind its
    /// pending envelopes, and the index now points at the newcomer.
    pub fn insert(&self, params: SessionParams) -> Arc<Session> {
        let conn_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let policy = match params.origin {
            ListenerKind::Adapter => OverflowPolicy::FatalClose,
            ListenerKind::Client => OverflowPolicy::DropOldest,
        };

        let session = Arc::new(Session {
            conn_id,
            remote: params.remote,
            origin: params.origin,
            principal: params.principal,
            created_at: params.now,
            last_received: AtomicU64::new(params.now),
            last_pong: AtomicU64::new(params.now),
            closing: AtomicBool::new(false),
            queue: SendQueue::new(self.inner.queue_capacity, policy),
        });

        self.inner.sessions.write().insert(conn_id, session.clone());

        match &session.principal {
            Principal::Adapter { server_id, .. } => {
                let displaced = self
                    .inner
                    .adapters
                    .write()
                    .insert(server_id.clone(), conn_id);

                if let Some(old_id) = displaced {
                    if let Some(old) = self.get(old_id) {
                        old.close(close::GOING_AWAY, "server_displaced", false);
                    }
                }
            }
            Principal::Client { role, .. } => {
                self.inner.roles.write()[role.index()].insert(conn_id);
            }
        }

        session
    }

    /// Drop every index entry for `conn_id`. Idempotent; a displaced
    /// adapter's removal leaves the newcomer's index entry alone.
    pub fn remove(&self, conn_id: u64) -> Option<Arc<Session>> {
        let session = self.inner.sessions.write().remove(&conn_id)?;

        match &session.principal {
            Principal::Adapter { server_id, .. } => {
                let mut adapters = self.inner.adapters.write();
                if adapters.get(server_id) == Some(&conn_id) {
                    adapters.remove(server_id);
                }
            }
            Principal::Client { role, .. } => {
                self.inner.roles.write()[role.index()].remove(&conn_id);
            }
        }

        Some(session)
    }

    pub fn get(&self, conn_id: u64) -> Option<Arc<Session>> {
        self.inner.sessions.read().get(&conn_id).cloned()
    }

    pub fn adapter_for_server(&self, server_id: &str) -> Option<Arc<Session>> {
        let conn_id = *self.inner.adapters.read().get(server_id)?;
        self.get(conn_id)
    }

    /// Client sessions at or above `min_role`, highest role first — System
    /// recipients always enqueue before the rest of a broadcast.
    pub fn clients_with_role_at_least(&self, min_role: Role) -> Vec<Arc<Session>> {
        let roles = self.inner.roles.read();
        let sessions = self.inner.sessions.read();

        let mut out = Vec::new();
        for role in Role::ALL.iter().rev() {
            if *role < min_role {
                break;
            }
            for conn_id in &roles[role.index()] {
                if let Some(session) = sessions.get(conn_id) {
                    out.push(session.clone());
                }
            }
        }

        out
    }

    /// Connected server ids with their advertised names.
    pub fn connected_servers(&self) -> Vec<(String, Option<String>)> {
        let adapters = self.inner.adapters.read();
        let sessions = self.inner.sessions.read();

        let mut out = Vec::with_capacity(adapters.len());
        for (server_id, conn_id) in adapters.iter() {
            if let Some(session) = sessions.get(conn_id) {
                if let Principal::Adapter { server_name, .. } = &session.principal {
                    out.push((server_id.clone(), server_name.clone()));
                }
            }
        }

        out
    }

    pub fn sessions_snapshot(&self) -> Vec<Arc<Session>> {
        self.inner.sessions.read().values().cloned().collect()
    }

    pub fn close_all(&self, code: u16, reason: &str) {
        for session in self.sessions_snapshot() {
            session.close(code, reason, false);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_adapters(&self) -> usize {
        self.inner.adapters.read().len()
    }

    pub fn clients_by_role(&self) -> [usize; Role::COUNT] {
        let roles = self.inner.roles.read();
        std::array::from_fn(|i| roles[i].len())
    }

    pub fn kv_set(&self, key: &str, value: String) -> Result<(), KvError> {
        self.inner.kv.lock().set(key, value)
    }

    pub fn kv_get(&self, key: &str) -> Option<String> {
        self.inner.kv.lock().get(key).map(str::to_string)
    }

    pub fn kv_delete(&self, key: &str) {
        self.inner.kv.lock().delete(key);
    }
}
