//! Per-key single-flight coordination
//!
//! The first caller to miss on a key becomes the leader and owns the origin
//! fetch. Later callers for the same key become followers and wait for the
//! leader's outcome instead of fetching again. A leader that is dropped
//! without finishing releases the key, and its followers see the flight as
//! abandoned.

use crate::error::OriginError;
use crate::types::CacheKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

/// How an in-flight fetch ended
#[derive(Debug, Clone)]
pub(crate) enum FlightOutcome {
    /// Payload committed to the blob store
    Stored,
    /// Origin responded but the payload could not be stored
    NotStored,
    /// Origin rejected or could not serve the request
    Failed(OriginError),
}

type OutcomeRx = watch::Receiver<Option<FlightOutcome>>;

#[derive(Debug, Default)]
pub(crate) struct FlightMap {
    flights: Mutex<HashMap<CacheKey, (u64, OutcomeRx)>>,
    next_id: AtomicU64,
}

pub(crate) enum Join {
    Leader(FlightLeader),
    Follower(FlightFollower),
}

impl FlightMap {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Become the leader for `key`, or follow the flight already running
    pub(crate) fn join(self: &Arc<Self>, key: &CacheKey) -> Join {
        let mut flights = self.lock();
        if let Some((_, rx)) = flights.get(key) {
            return Join::Follower(FlightFollower { rx: rx.clone() });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        flights.insert(key.clone(), (id, rx));

        Join::Leader(FlightLeader {
            map: Arc::clone(self),
            key: key.clone(),
            id,
            tx,
        })
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn release(&self, key: &CacheKey, id: u64) {
        let mut flights = self.lock();
        if flights.get(key).is_some_and(|(current, _)| *current == id) {
            flights.remove(key);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, (u64, OutcomeRx)>> {
        self.flights.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Exclusive right to fetch a key; releases the key when dropped
pub(crate) struct FlightLeader {
    map: Arc<FlightMap>,
    key: CacheKey,
    id: u64,
    tx: watch::Sender<Option<FlightOutcome>>,
}

impl FlightLeader {
    pub(crate) fn complete(self, outcome: FlightOutcome) {
        self.tx.send_replace(Some(outcome));
    }
}

impl Drop for FlightLeader {
    fn drop(&mut self) {
        self.map.release(&self.key, self.id);
    }
}

pub(crate) struct FlightFollower {
    rx: OutcomeRx,
}

impl FlightFollower {
    /// Wait for the leader; `None` if it went away without an outcome
    pub(crate) async fn wait(mut self) -> Option<FlightOutcome> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        }
    }
}
