//! # Keyed Rendezvous Queue
//!
//! Request/response matching for protocols whose replies carry no request id.
//! A caller registers interest under one or more keys, sends its request, and
//! sleeps until some reply is delivered under any of those keys.
//!
//! Every waiter on a key gets a copy of the value, so two identical
//! outstanding requests are both satisfied by the first reply.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::error::{ProtocolError, Result};

struct Waiter<K, V> {
    keys: Vec<K>,
    sender: oneshot::Sender<Result<V>>,
}

struct Inner<K, V> {
    next_id: u64,
    waiters: HashMap<u64, Waiter<K, V>>,
    by_key: HashMap<K, Vec<u64>>,
    closed: bool,
}

impl<K: Eq + Hash + Clone, V> Inner<K, V> {
    fn unregister(&mut self, id: u64) -> Option<Waiter<K, V>> {
        let waiter = self.waiters.remove(&id)?;
        for key in &waiter.keys {
            if let Some(ids) = self.by_key.get_mut(key) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    self.by_key.remove(key);
                }
            }
        }
        Some(waiter)
    }
}

pub struct KeyedQueue<K, V> {
    inner: Mutex<Inner<K, V>>,
}

/// Removes a waiter when its future is dropped before being resumed.
struct Registration<'a, K: Eq + Hash + Clone, V> {
    queue: &'a KeyedQueue<K, V>,
    id: u64,
}

impl<K: Eq + Hash + Clone, V> Drop for Registration<'_, K, V> {
    fn drop(&mut self) {
        self.queue.lock().unregister(self.id);
    }
}

impl<K, V> KeyedQueue<K, V> {
    // The state is consistent between statements, so a poisoned lock is
    // safe to keep using.
    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<K, V> KeyedQueue<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 0,
                waiters: HashMap::new(),
                by_key: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Register under every key in `keys`, run `before`, then wait for the
    /// first value resumed on any of them.
    ///
    /// `before` runs after registration so a reply racing the request cannot
    /// be missed. If it fails, the registration is withdrawn and its error
    /// returned.
    pub async fn wait<I, F>(&self, keys: I, before: F) -> Result<V>
    where
        I: IntoIterator<Item = K>,
        F: FnOnce() -> Result<()>,
    {
        let (sender, receiver) = oneshot::channel();
        let id = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(ProtocolError::ConnectionClosed);
            }
            let id = inner.next_id;
            inner.next_id += 1;
            let mut unique: Vec<K> = Vec::new();
            for key in keys {
                if !unique.contains(&key) {
                    unique.push(key);
                }
            }
            for key in &unique {
                inner.by_key.entry(key.clone()).or_default().push(id);
            }
            trace!(id, keys = ?unique, "Waiter registered");
            inner.waiters.insert(
                id,
                Waiter {
                    keys: unique,
                    sender,
                },
            );
            id
        };
        let _registration = Registration { queue: self, id };

        before()?;

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Deliver `value` to every waiter registered under `key`.
    ///
    /// Woken waiters are withdrawn from all their other keys too. Returns how
    /// many were woken.
    pub fn resume(&self, key: &K, value: V) -> usize {
        let mut inner = self.lock();
        let ids = inner.by_key.get(key).cloned().unwrap_or_default();
        let mut woken = 0;
        for id in ids {
            if let Some(waiter) = inner.unregister(id) {
                if waiter.sender.send(Ok(value.clone())).is_ok() {
                    woken += 1;
                }
            }
        }
        if woken == 0 {
            warn!(key = ?key, "Value resumed with nobody waiting for it");
        }
        woken
    }

    /// Deliver `value` to every waiter, whatever its keys. Returns how many
    /// were woken.
    pub fn resume_all(&self, value: V) -> usize {
        let mut inner = self.lock();
        inner.by_key.clear();
        let mut woken = 0;
        for (_, waiter) in inner.waiters.drain() {
            if waiter.sender.send(Ok(value.clone())).is_ok() {
                woken += 1;
            }
        }
        trace!(woken, "Value resumed on every key");
        woken
    }

    /// Fail every pending waiter with `ConnectionClosed`. Later calls to
    /// [`wait`](Self::wait) fail immediately.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.by_key.clear();
        for (_, waiter) in inner.waiters.drain() {
            let _ = waiter.sender.send(Err(ProtocolError::ConnectionClosed));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of callers currently waiting.
    pub fn pending(&self) -> usize {
        self.lock().waiters.len()
    }
}

impl<K, V> Default for KeyedQueue<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> std::fmt::Debug for KeyedQueue<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedQueue").finish_non_exhaustive()
    }
}
