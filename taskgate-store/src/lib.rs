//! Expiring key/value store abstraction for taskgate.
//!
//! Everything that must be visible across request-handling workers lives
//! behind [`KvStore`]: sessions, one-time CSRF/nonce values, bridge and API
//! tokens, and rate-limit counters. The trait exposes exactly the atomic
//! primitives those callers need (`take` for single-use values, `incr` for
//! fixed-window counters, `remove_many` for logout-everywhere batches) so a
//! backend can map them onto its own atomic operations.
//!
//! [`InMemoryStore`] is the default backend. Entries carry their own TTL and
//! are lazily evicted on access.

use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Error raised when the store cannot serve a request.
///
/// Callers decide policy: session lookups treat this as not-authenticated
/// (fail closed) while rate-limit checks admit the request (fail open).
#[derive(Debug)]
pub enum StoreError {
    /// The backend is unreachable or refused the operation.
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Boxed future returned by every [`KvStore`] operation.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Pluggable shared-store backend.
///
/// All cross-request state goes through this trait; components receive an
/// `Arc<dyn KvStore>` at construction time so tests can substitute a fake
/// without touching process-wide state.
pub trait KvStore: Send + Sync + 'static {
    /// Read a value. Expired entries count as absent.
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Bytes>>;

    /// Write a value with a time-to-live, replacing any existing entry.
    fn set<'a>(&'a self, key: &'a str, value: Bytes, ttl: Duration) -> StoreFuture<'a, ()>;

    /// Atomically read and delete a value.
    ///
    /// This is the consumption primitive for one-time tokens: of two
    /// concurrent callers, at most one observes the value.
    fn take<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Bytes>>;

    /// Delete a single entry. Deleting an absent key is not an error.
    fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;

    /// Delete a batch of entries in one operation.
    fn remove_many<'a>(&'a self, keys: &'a [String]) -> StoreFuture<'a, ()>;

    /// Atomically increment a counter, creating it with `ttl` if absent,
    /// and return the post-increment value.
    ///
    /// The TTL is applied only on creation; the window of an existing
    /// counter is never extended.
    fn incr<'a>(&'a self, key: &'a str, ttl: Duration) -> StoreFuture<'a, i64>;

    /// Add a member to a set, creating the set with `ttl` if absent.
    /// Re-adding refreshes the set's TTL.
    fn set_add<'a>(&'a self, key: &'a str, member: &'a str, ttl: Duration) -> StoreFuture<'a, ()>;

    /// List the members of a set. An absent or expired set yields an empty list.
    fn set_members<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<String>>;

    /// Remove a member from a set.
    fn set_remove<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, ()>;

    /// Health probe used at startup to pick between the shared store and
    /// the degraded cookie-only session mode.
    fn ping(&self) -> StoreFuture<'_, ()>;
}

enum Value {
    Bytes(Bytes),
    Counter(i64),
    Set(HashSet<String>),
}

struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Default in-memory store backed by `DashMap`.
///
/// Entries are lazily evicted on access. Suitable for a single-process
/// deployment or as the test backend; a multi-instance deployment would
/// implement [`KvStore`] against a shared service instead.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<DashMap<String, Entry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    /// Remove all expired entries.
    pub fn evict_expired(&self) {
        self.inner.retain(|_, entry| !entry.expired());
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for InMemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Bytes>> {
        Box::pin(async move {
            if let Some(entry) = self.inner.get(key) {
                if !entry.expired() {
                    if let Value::Bytes(b) = &entry.value {
                        return Ok(Some(b.clone()));
                    }
                    return Ok(None);
                }
                // Expired — drop the read guard before removing
                drop(entry);
                self.inner.remove(key);
            }
            Ok(None)
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: Bytes, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.inner.insert(
                key.to_string(),
                Entry {
                    value: Value::Bytes(value),
                    expires_at: Instant::now() + ttl,
                },
            );
            Ok(())
        })
    }

    fn take<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Bytes>> {
        Box::pin(async move {
            match self.inner.remove(key) {
                Some((_, entry)) if !entry.expired() => match entry.value {
                    Value::Bytes(b) => Ok(Some(b)),
                    _ => Ok(None),
                },
                _ => Ok(None),
            }
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.inner.remove(key);
            Ok(())
        })
    }

    fn remove_many<'a>(&'a self, keys: &'a [String]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            for key in keys {
                self.inner.remove(key);
            }
            Ok(())
        })
    }

    fn incr<'a>(&'a self, key: &'a str, ttl: Duration) -> StoreFuture<'a, i64> {
        Box::pin(async move {
            let mut entry = self.inner.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Counter(0),
                expires_at: Instant::now() + ttl,
            });

            // A counter that outlived its window starts a fresh one.
            if entry.expired() {
                *entry = Entry {
                    value: Value::Counter(0),
                    expires_at: Instant::now() + ttl,
                };
            }

            match &mut entry.value {
                Value::Counter(n) => {
                    *n += 1;
                    Ok(*n)
                }
                other => {
                    // Key collision with a non-counter value: reset into a counter.
                    *other = Value::Counter(1);
                    Ok(1)
                }
            }
        })
    }

    fn set_add<'a>(&'a self, key: &'a str, member: &'a str, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut entry = self.inner.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Set(HashSet::new()),
                expires_at: Instant::now() + ttl,
            });

            if entry.expired() || !matches!(entry.value, Value::Set(_)) {
                entry.value = Value::Set(HashSet::new());
            }
            entry.expires_at = Instant::now() + ttl;

            if let Value::Set(members) = &mut entry.value {
                members.insert(member.to_string());
            }
            Ok(())
        })
    }

    fn set_members<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            if let Some(entry) = self.inner.get(key) {
                if !entry.expired() {
                    if let Value::Set(members) = &entry.value {
                        return Ok(members.iter().cloned().collect());
                    }
                    return Ok(Vec::new());
                }
                drop(entry);
                self.inner.remove(key);
            }
            Ok(Vec::new())
        })
    }

    fn set_remove<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if let Some(mut entry) = self.inner.get_mut(key) {
                if let Value::Set(members) = &mut entry.value {
                    members.remove(member);
                }
            }
            Ok(())
        })
    }

    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move { Ok(()) })
    }
}
