//! Single-flight execution of identical concurrent work.
//!
//! The first caller for a key becomes the leader and installs a shared future;
//! every caller arriving while it is in flight awaits the same future. The
//! slot is cleared by whichever caller observes completion first, and only if
//! it still holds the same flight.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::hash::Hash;

/// Role of a caller in a flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flight {
    /// Started the work.
    Leader,
    /// Attached to work already in progress.
    Joined,
}

pub type InFlight<V> = Shared<BoxFuture<'static, V>>;

pub struct SingleFlight<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    inflight: DashMap<K, InFlight<V>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `key` or start one with `make`.
    ///
    /// `make` runs under the slot lock; it must only construct the future.
    pub fn join_or_start<F, Fut>(&self, key: K, make: F) -> (InFlight<V>, Flight)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        match self.inflight.entry(key) {
            Entry::Occupied(slot) => (slot.get().clone(), Flight::Joined),
            Entry::Vacant(slot) => {
                let flight = make().boxed().shared();
                slot.insert(flight.clone());
                (flight, Flight::Leader)
            }
        }
    }

    /// Clear the slot if it still holds `flight`.
    pub fn complete(&self, key: &K, flight: &InFlight<V>) {
        self.inflight
            .remove_if(key, |_, current| current.ptr_eq(flight));
    }

    /// Await the flight for `key`, starting it if needed.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> (V, Flight)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (flight, role) = self.join_or_start(key.clone(), make);
        let out = flight.clone().await;
        self.complete(&key, &flight);
        (out, role)
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.inflight.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}
