//! Keyed deduplication of in-flight origin work.
//!
//! The first caller for a key becomes the leader: its work runs on a detached
//! task so a caller that stops waiting never aborts it halfway through a
//! storage write. Everyone arriving while that task runs subscribes to the
//! same outcome and receives its own clone of it.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tracing::debug;

use super::error::CoalesceError;

type Flight<T> = watch::Receiver<Option<T>>;

pub struct Coalescer<T> {
    inflight: Arc<DashMap<String, Flight<T>>>,
}

impl<T> Default for Coalescer<T> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
        }
    }
}

impl<T> Clone for Coalescer<T> {
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
        }
    }
}

impl<T> Coalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with work currently running.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Runs `work` unless work for `key` is already running, then waits for
    /// the outcome. The flag is `true` for every caller that joined someone
    /// else's work.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Result<(T, bool), CoalesceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (mut flight, leader) = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(occupied) => (occupied.get().clone(), None),
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(None);
                vacant.insert(rx.clone());
                (rx, Some(tx))
            }
        };
        let shared = leader.is_none();

        if let Some(tx) = leader {
            let guard = FlightGuard {
                key: key.to_string(),
                flight: flight.clone(),
                inflight: Arc::clone(&self.inflight),
            };
            let fut = work();
            tokio::spawn(async move {
                let outcome = fut.await;
                drop(guard);
                let _ = tx.send(Some(outcome));
            });
        }

        if shared {
            debug!(key, "joined in-flight work");
        }

        let outcome = flight
            .wait_for(Option::is_some)
            .await
            .map_err(|_| CoalesceError::Abandoned {
                key: key.to_string(),
            })?;
        match (*outcome).clone() {
            Some(value) => Ok((value, shared)),
            None => Err(CoalesceError::Abandoned {
                key: key.to_string(),
            }),
        }
    }
}

/// Unregisters a flight when its task finishes or unwinds. Only removes the
/// entry it registered, so a newer leader for the same key is left alone.
struct FlightGuard<T> {
    key: String,
    flight: Flight<T>,
    inflight: Arc<DashMap<String, Flight<T>>>,
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        self.inflight
            .remove_if(&self.key, |_, existing| existing.same_channel(&self.flight));
    }
}
