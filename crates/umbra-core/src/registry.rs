//! Identity bindings and per-connection outbound queues.
//!
//! The id↔token maps live behind one mutex so a rebind is atomic: a second
//! login for an id evicts the first in the same critical section that
//! installs the new binding, and no interleaving ever observes an id bound
//! to two connections. Queues live in a `DashMap` keyed by token; external
//! senders enqueue here and nudge the reactor through its waker.

use dashmap::DashMap;
use mio::{Token, Waker};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::error::ServerError;
use crate::queue::OutboundQueue;

#[derive(Debug, Default)]
struct Maps {
    by_id: HashMap<String, Token>,
    by_token: HashMap<Token, String>,
}

/// Atomic id↔token bindings.
#[derive(Debug, Default)]
pub struct Bindings {
    inner: Mutex<Maps>,
}

impl Bindings {
    /// Bind `id` to `token`, replacing any existing binding for either key.
    ///
    /// Returns the token of an evicted connection when `id` was already
    /// bound elsewhere; the caller must close that connection.
    pub fn bind(&self, id: &str, token: Token) -> Option<Token> {
        let mut maps = self.inner.lock().expect("bindings lock poisoned");
        let evicted = match maps.by_id.insert(id.to_owned(), token) {
            Some(old) if old != token => {
                maps.by_token.remove(&old);
                Some(old)
            }
            _ => None,
        };
        if let Some(previous_id) = maps.by_token.insert(token, id.to_owned()) {
            // Same connection re-authenticated under a different id
            if previous_id != id && maps.by_id.get(&previous_id) == Some(&token) {
                maps.by_id.remove(&previous_id);
            }
        }
        evicted
    }

    /// Remove the binding for a connection. Returns the id it held.
    pub fn unbind(&self, token: Token) -> Option<String> {
        let mut maps = self.inner.lock().expect("bindings lock poisoned");
        let id = maps.by_token.remove(&token)?;
        if maps.by_id.get(&id) == Some(&token) {
            maps.by_id.remove(&id);
        }
        Some(id)
    }

    /// The connection currently bound to `id`.
    pub fn token_of(&self, id: &str) -> Option<Token> {
        self.inner
            .lock()
            .expect("bindings lock poisoned")
            .by_id
            .get(id)
            .copied()
    }

    /// The id bound to a connection, if authenticated.
    pub fn id_of(&self, token: Token) -> Option<String> {
        self.inner
            .lock()
            .expect("bindings lock poisoned")
            .by_token
            .get(&token)
            .cloned()
    }

    /// Number of bound identities.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("bindings lock poisoned").by_id.len()
    }

    /// Whether no identity is bound.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Server-side connection registry: bindings, queues, and the dirty set
/// that tells the reactor which connections have pending output.
pub struct Registry {
    bindings: Bindings,
    queues: DashMap<Token, Arc<OutboundQueue>>,
    dirty: Mutex<HashSet<Token>>,
    waker: Arc<Waker>,
}

impl Registry {
    /// Registry wired to the reactor's waker.
    #[must_use]
    pub fn new(waker: Arc<Waker>) -> Self {
        Self {
            bindings: Bindings::default(),
            queues: DashMap::new(),
            dirty: Mutex::new(HashSet::new()),
            waker,
        }
    }

    /// Track a freshly accepted connection's queue.
    pub fn register_connection(&self, token: Token, queue: Arc<OutboundQueue>) {
        self.queues.insert(token, queue);
    }

    /// Forget a connection entirely. Returns the id it was bound to.
    pub fn drop_connection(&self, token: Token) -> Option<String> {
        self.queues.remove(&token);
        self.dirty.lock().expect("dirty lock poisoned").remove(&token);
        self.bindings.unbind(token)
    }

    /// Bind an authenticated identity; see [`Bindings::bind`] for the
    /// eviction contract.
    pub fn bind_identity(&self, id: &str, token: Token) -> Option<Token> {
        self.bindings.bind(id, token)
    }

    /// The id bound to a connection.
    pub fn id_of(&self, token: Token) -> Option<String> {
        self.bindings.id_of(token)
    }

    /// The connection bound to an id.
    pub fn token_of(&self, id: &str) -> Option<Token> {
        self.bindings.token_of(id)
    }

    /// Queue a wire message for the connection bound to `id`.
    ///
    /// # Errors
    ///
    /// [`ServerError::UnknownTarget`] when no connection is bound to `id`,
    /// or the queue's backpressure error.
    pub fn enqueue_for_id(&self, id: &str, message: String) -> Result<(), ServerError> {
        let token = self
            .bindings
            .token_of(id)
            .ok_or_else(|| ServerError::UnknownTarget(id.to_owned()))?;
        self.enqueue(token, message)
    }

    /// Queue a wire message for a specific connection.
    ///
    /// # Errors
    ///
    /// [`ServerError::UnknownTarget`] when the connection is gone, or the
    /// queue's backpressure error.
    pub fn enqueue(&self, token: Token, message: String) -> Result<(), ServerError> {
        let queue = self
            .queues
            .get(&token)
            .ok_or_else(|| ServerError::UnknownTarget(format!("token {}", token.0)))?;
        queue.push(message)?;
        drop(queue);
        self.mark_dirty(token);
        Ok(())
    }

    /// Flag a connection as having pending output and wake the reactor.
    pub fn mark_dirty(&self, token: Token) {
        self.dirty.lock().expect("dirty lock poisoned").insert(token);
        if let Err(err) = self.waker.wake() {
            warn!(error = %err, "reactor wake failed");
        }
    }

    /// Take the set of connections with pending output.
    pub fn take_dirty(&self) -> Vec<Token> {
        self.dirty
            .lock()
            .expect("dirty lock poisoned")
            .drain()
            .collect()
    }

    /// Live (accepted, post-handshake) connections.
    pub fn connection_count(&self) -> usize {
        self.queues.len()
    }

    /// Authenticated connections.
    pub fn bound_count(&self) -> usize {
        self.bindings.len()
    }
}
