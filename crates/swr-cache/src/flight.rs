//! Single-flight registry: at most one outstanding fetch per key.
//!
//! The first caller to [`SingleFlight::acquire`] a key gets a [`Ticket`] and
//! is responsible for fetching. Everyone else gets a [`Flight`] they can wait
//! on to observe the ticket holder's outcome instead of fetching again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::error::FetchError;

/// Outcome published by a ticket holder: the fetched value in JSON form, or
/// the fetch error.
pub type FlightOutcome = Result<Arc<serde_json::Value>, FetchError>;

type Slot = Option<FlightOutcome>;

struct InFlight {
    id: u64,
    rx: watch::Receiver<Slot>,
}

#[derive(Default)]
struct Registry {
    flights: Mutex<HashMap<String, InFlight>>,
    next_id: AtomicU64,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.flights.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_if(&self, key: &str, id: u64) {
        let mut flights = self.lock();
        if flights.get(key).is_some_and(|f| f.id == id) {
            flights.remove(key);
        }
    }
}

/// Registry of in-flight fetches, keyed by cache key.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct SingleFlight {
    inner: Arc<Registry>,
}

/// Result of [`SingleFlight::acquire`].
pub enum Acquire {
    /// The caller owns the fetch for this key.
    Ticket(Ticket),
    /// Another caller already owns it.
    InFlight(Flight),
}

impl SingleFlight {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the fetch for `key`, or observe the existing claim.
    ///
    /// The check and the insert happen under one lock, so two callers can
    /// never both receive a ticket for the same key.
    pub fn acquire(&self, key: &str) -> Acquire {
        let mut flights = self.inner.lock();
        if let Some(existing) = flights.get(key) {
            return Acquire::InFlight(Flight {
                rx: existing.rx.clone(),
            });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        flights.insert(key.to_string(), InFlight { id, rx });

        Acquire::Ticket(Ticket {
            key: key.to_string(),
            id,
            tx,
            registry: Arc::clone(&self.inner),
        })
    }

    /// Forget the flight for `key`. Releasing an unknown key is a no-op.
    ///
    /// Waiters already attached keep waiting on the original holder.
    pub fn release(&self, key: &str) {
        self.inner.lock().remove(key);
    }

    /// Whether a fetch for `key` is outstanding.
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inner.lock().contains_key(key)
    }

    /// Number of outstanding fetches.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl std::fmt::Debug for SingleFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.len())
            .finish()
    }
}

/// Exclusive right to fetch a key.
///
/// Dropping a ticket without calling [`Ticket::complete`] releases the key
/// and tells waiters the flight was abandoned.
pub struct Ticket {
    key: String,
    id: u64,
    tx: watch::Sender<Slot>,
    registry: Arc<Registry>,
}

impl Ticket {
    /// The key this ticket covers.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Publish the outcome to all waiters and release the key.
    pub fn complete(self, outcome: FlightOutcome) {
        self.tx.send_replace(Some(outcome));
        // Drop releases.
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.registry.release_if(&self.key, self.id);
    }
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

/// A fetch owned by someone else.
#[derive(Debug)]
pub struct Flight {
    rx: watch::Receiver<Slot>,
}

impl Flight {
    /// Wait for the ticket holder to finish.
    ///
    /// Returns `None` if the holder dropped its ticket without publishing.
    pub async fn wait(mut self) -> Option<FlightOutcome> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        }
    }
}
