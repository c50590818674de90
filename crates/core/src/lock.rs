//! Per-path write locks.
//!
//! Each normalized path owns one lock slot, created lazily and reused. A slot
//! has at most one holder and a FIFO queue of waiters; releasing hands the
//! lock directly to the oldest live waiter, so writes to the same path commit
//! in acquisition order. Unrelated paths never contend.
//!
//! A waiter that gives up (timeout or the caller dropping the future) removes
//! itself from the queue, and if the hand-off already reached it the lock is
//! passed on immediately, so an abandoned request never strands later waiters.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::LockError;
use crate::path::{PathKey, PathNormalizer};

/// Default acquisition timeout.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(5000);

/// Snapshot of a held lock.
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub path: String,
    pub holder_session_id: String,
    pub acquired_at: DateTime<Utc>,
    pub held_ms: u64,
    pub waiters: usize,
}

struct Holder {
    session_id: String,
    acquired_at: DateTime<Utc>,
    acquired_instant: Instant,
    token: u64,
}

struct Waiter {
    session_id: String,
    token: u64,
    grant: oneshot::Sender<()>,
}

struct LockSlot {
    path: String,
    holder: Option<Holder>,
    waiters: VecDeque<Waiter>,
}

impl LockSlot {
    fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            holder: None,
            waiters: VecDeque::new(),
        }
    }

    /// Clear the holder and pass the lock to the oldest waiter still
    /// listening.
    fn hand_off(&mut self) {
        self.holder = None;
        while let Some(waiter) = self.waiters.pop_front() {
            self.holder = Some(Holder {
                session_id: waiter.session_id,
                acquired_at: Utc::now(),
                acquired_instant: Instant::now(),
                token: waiter.token,
            });
            if waiter.grant.send(()).is_ok() {
                return;
            }
            self.holder = None;
        }
    }

    fn status(&self) -> Option<LockStatus> {
        self.holder.as_ref().map(|h| LockStatus {
            path: self.path.clone(),
            holder_session_id: h.session_id.clone(),
            acquired_at: h.acquired_at,
            held_ms: h.acquired_instant.elapsed().as_millis() as u64,
            waiters: self.waiters.len(),
        })
    }
}

/// Registry of per-path locks.
pub struct LockManager {
    normalizer: PathNormalizer,
    default_timeout: Duration,
    slots: Mutex<HashMap<PathKey, LockSlot>>,
    next_token: AtomicU64,
}

impl LockManager {
    pub fn new(normalizer: PathNormalizer, default_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            normalizer,
            default_timeout,
            slots: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<PathKey, LockSlot>> {
        self.slots.lock().unwrap_or_else(|poisoned| {
            warn!("lock registry mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Wait until the lock on `path` is free or `timeout` elapses (the
    /// manager default when `None`). Locks are not re-entrant: a session that
    /// already holds `path` waits like anyone else.
    pub async fn acquire(
        self: &Arc<Self>,
        path: &str,
        session_id: &str,
        timeout: Option<Duration>,
    ) -> Result<LockHandle, LockError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let key = self.normalizer.normalize(path);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        let rx = {
            let mut slots = self.slots();
            let slot = slots
                .entry(key.clone())
                .or_insert_with(|| LockSlot::new(path));

            if slot.holder.is_none() && slot.waiters.is_empty() {
                slot.holder = Some(Holder {
                    session_id: session_id.to_string(),
                    acquired_at: Utc::now(),
                    acquired_instant: Instant::now(),
                    token,
                });
                debug!(path, session_id, "lock acquired");
                return Ok(self.handle(key, path, session_id, token));
            }

            let (tx, rx) = oneshot::channel();
            slot.waiters.push_back(Waiter {
                session_id: session_id.to_string(),
                token,
                grant: tx,
            });
            debug!(path, session_id, waiters = slot.waiters.len(), "waiting for lock");
            rx
        };

        let mut pending = PendingAcquire {
            manager: Arc::clone(self),
            key: key.clone(),
            token,
            rx,
            settled: false,
        };

        let started = Instant::now();
        match tokio::time::timeout(timeout, &mut pending.rx).await {
            Ok(Ok(())) => {
                pending.settled = true;
                debug!(path, session_id, waited_ms = started.elapsed().as_millis() as u64, "lock acquired after wait");
                Ok(self.handle(key, path, session_id, token))
            }
            Ok(Err(_)) | Err(_) => {
                // Dropping `pending` withdraws the request and passes on a
                // grant that raced with the timeout.
                drop(pending);
                let holder = self.holder(path).unwrap_or_else(|| "nobody".to_string());
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(path, session_id, holder = %holder, waited_ms, "lock acquisition timed out");
                Err(LockError::Timeout {
                    path: path.to_string(),
                    holder,
                    waited_ms,
                })
            }
        }
    }

    fn handle(self: &Arc<Self>, key: PathKey, path: &str, session_id: &str, token: u64) -> LockHandle {
        LockHandle {
            manager: Arc::clone(self),
            key,
            path: path.to_string(),
            session_id: session_id.to_string(),
            token,
            released: false,
        }
    }

    /// Release the lock on `path` on behalf of `session_id`. Releasing a lock
    /// that is unheld or held by another session is a logged no-op.
    pub fn release(&self, path: &str, session_id: &str) -> bool {
        match self.try_release(path, session_id) {
            Ok(()) => true,
            Err(e) => {
                warn!(path, session_id, error = %e, "ignoring lock release");
                false
            }
        }
    }

    /// Like [`release`](Self::release) but reports why nothing was released.
    pub fn try_release(&self, path: &str, session_id: &str) -> Result<(), LockError> {
        let key = self.normalizer.normalize(path);
        let mut slots = self.slots();
        let slot = slots
            .get_mut(&key)
            .ok_or_else(|| LockError::NotHeld(path.to_string()))?;

        match &slot.holder {
            None => Err(LockError::NotHeld(path.to_string())),
            Some(h) if h.session_id != session_id => Err(LockError::OwnershipViolation {
                path: path.to_string(),
                requested_by: session_id.to_string(),
                holder: h.session_id.clone(),
            }),
            Some(_) => {
                slot.hand_off();
                debug!(path, session_id, "lock released");
                Ok(())
            }
        }
    }

    fn release_token(&self, key: &PathKey, token: u64) -> bool {
        let mut slots = self.slots();
        match slots.get_mut(key) {
            Some(slot) if slot.holder.as_ref().is_some_and(|h| h.token == token) => {
                slot.hand_off();
                true
            }
            _ => false,
        }
    }

    fn abandon(&self, key: &PathKey, token: u64) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(key) {
            slot.waiters.retain(|w| w.token != token);
            if slot.holder.as_ref().is_some_and(|h| h.token == token) {
                debug!(path = %slot.path, "passing on lock granted to an abandoned request");
                slot.hand_off();
            }
        }
    }

    pub fn is_locked(&self, path: &str) -> bool {
        let key = self.normalizer.normalize(path);
        self.slots()
            .get(&key)
            .is_some_and(|slot| slot.holder.is_some())
    }

    /// Session currently holding `path`, if any.
    pub fn holder(&self, path: &str) -> Option<String> {
        let key = self.normalizer.normalize(path);
        self.slots()
            .get(&key)
            .and_then(|slot| slot.holder.as_ref().map(|h| h.session_id.clone()))
    }

    pub fn status(&self, path: &str) -> Option<LockStatus> {
        let key = self.normalizer.normalize(path);
        self.slots().get(&key).and_then(LockSlot::status)
    }

    /// All currently held locks.
    pub fn all_locks(&self) -> Vec<LockStatus> {
        let mut locks: Vec<LockStatus> = self.slots().values().filter_map(LockSlot::status).collect();
        locks.sort_by(|a, b| a.path.cmp(&b.path));
        locks
    }

    /// Administrative override: release `path` regardless of holder.
    /// Returns the session that held it.
    pub fn force_release(&self, path: &str) -> Option<String> {
        let key = self.normalizer.normalize(path);
        let mut slots = self.slots();
        let slot = slots.get_mut(&key)?;
        let previous = slot.holder.as_ref().map(|h| h.session_id.clone())?;
        slot.hand_off();
        info!(path, holder = %previous, "lock force-released");
        Some(previous)
    }

    /// Force-release every lock held for longer than `max_age`. Returns the
    /// released paths.
    pub fn clear_stale(&self, max_age: Duration) -> Vec<String> {
        let mut released = Vec::new();
        let mut slots = self.slots();
        for slot in slots.values_mut() {
            let stale = slot
                .holder
                .as_ref()
                .is_some_and(|h| h.acquired_instant.elapsed() > max_age);
            if stale {
                let holder = slot.holder.as_ref().map(|h| h.session_id.clone());
                warn!(path = %slot.path, holder = ?holder, "clearing stale lock");
                released.push(slot.path.clone());
                slot.hand_off();
            }
        }
        released.sort();
        released
    }

    /// Drop every slot that is neither held nor awaited.
    pub fn prune_idle(&self) {
        self.slots()
            .retain(|_, slot| slot.holder.is_some() || !slot.waiters.is_empty());
    }
}

/// An in-flight wait for a lock. Dropping it before the grant is observed
/// withdraws the request.
struct PendingAcquire {
    manager: Arc<LockManager>,
    key: PathKey,
    token: u64,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if !self.settled {
            self.rx.close();
            self.manager.abandon(&self.key, self.token);
        }
    }
}

/// Proof of holding a path lock. The lock is released on [`release`] or on
/// drop, so a failing commit can never leave the path locked.
///
/// [`release`]: LockHandle::release
pub struct LockHandle {
    manager: Arc<LockManager>,
    key: PathKey,
    path: String,
    session_id: String,
    token: u64,
    released: bool,
}

impl LockHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Release the lock. Returns `false` when it had already been
    /// force-released by an administrator.
    pub fn release(mut self) -> bool {
        self.released = true;
        let released = self.manager.release_token(&self.key, self.token);
        if released {
            debug!(path = %self.path, session_id = %self.session_id, "lock released");
        } else {
            warn!(path = %self.path, session_id = %self.session_id, "lock was no longer held at release");
        }
        released
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if !self.released {
            self.manager.release_token(&self.key, self.token);
        }
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("path", &self.path)
            .field("session_id", &self.session_id)
            .finish()
    }
}
