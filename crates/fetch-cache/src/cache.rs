//! Fetch-through retrieval
//!
//! A lookup is served from the blob store when the freshness index says the
//! entry is fresh. Otherwise one caller per key becomes the flight leader: a
//! detached task fetches from the origin and fans the body out to the caller
//! and to the blob store. The index is marked fresh only after the store has
//! committed the payload. Callers that miss while a flight is running wait for
//! it and then read what it stored.

use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::{CacheError, OriginError, Result, StoreError};
use crate::fingerprint::fingerprint;
use crate::flight::{FlightLeader, FlightMap, FlightOutcome, Join};
use crate::freshness::{is_fresh, FreshnessIndex};
use crate::metrics::MetricsSink;
use crate::origin::OriginFetcher;
use crate::retention::Retention;
use crate::store::BlobStore;
use crate::types::{
    ByteStream, CacheKey, CacheSource, Resource, ResourceMetadata, StoreUsage, StoredEntry,
};
use bytes::Bytes;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::StreamExt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

type Head = std::result::Result<(ResourceMetadata, ByteStream), OriginError>;

/// Fetch-through cache. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct FetchCache {
    inner: Arc<Inner>,
}

struct Inner {
    store: BlobStore,
    index: Arc<dyn FreshnessIndex>,
    origin: Arc<dyn OriginFetcher>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    retention: Retention,
    flights: Arc<FlightMap>,
    default_max_age: Duration,
    origin_timeout: Duration,
    caller_buffer_size: u64,
}

impl FetchCache {
    pub fn new(
        config: &CacheConfig,
        index: Arc<dyn FreshnessIndex>,
        origin: Arc<dyn OriginFetcher>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self::with_clock(config, index, origin, metrics, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: &CacheConfig,
        index: Arc<dyn FreshnessIndex>,
        origin: Arc<dyn OriginFetcher>,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: BlobStore::new(config.cache_dir.clone()),
                index,
                origin,
                metrics,
                clock,
                retention: Retention::new(config.max_cache_size, config.max_entries),
                flights: FlightMap::new(),
                default_max_age: config.default_max_age,
                origin_timeout: config.origin_timeout,
                caller_buffer_size: config.caller_buffer_size,
            }),
        }
    }

    /// Prepare the blob store and load existing entries into the retention LRU,
    /// evicting whatever no longer fits the configured budget
    pub async fn init(&self) -> Result<StoreUsage> {
        let entries = self.inner.store.init().await?;
        for entry in entries {
            let key = entry.key.clone();
            for (victim, size) in self.inner.retention.admit(key, entry.size) {
                self.inner.evict(&victim, size, None).await;
            }
        }

        let usage = self.inner.retention.usage();
        info!(
            entries = usage.entries,
            total_size = usage.total_size,
            "Cache initialized"
        );
        Ok(usage)
    }

    pub fn default_max_age(&self) -> Duration {
        self.inner.default_max_age
    }

    pub fn usage(&self) -> StoreUsage {
        self.inner.retention.usage()
    }

    /// Retrieve using the configured default max age
    pub async fn retrieve(&self, identifier: &str) -> Result<Resource> {
        self.retrieve_with_max_age(identifier, self.inner.default_max_age)
            .await
    }

    /// Retrieve a resource, serving the stored copy if it was refreshed within `max_age`
    pub async fn retrieve_with_max_age(
        &self,
        identifier: &str,
        max_age: Duration,
    ) -> Result<Resource> {
        let key = fingerprint(identifier);

        loop {
            if let Some(resource) = self.inner.lookup_fresh(&key, max_age).await {
                return Ok(resource);
            }

            match self.inner.flights.join(&key) {
                Join::Leader(leader) => {
                    // A flight may have finished between the lookup and the join
                    if let Some(resource) = self.inner.lookup_fresh(&key, max_age).await {
                        return Ok(resource);
                    }
                    return self.fetch_through(identifier, key, leader).await;
                }
                Join::Follower(follower) => {
                    debug!(key = %key, "Waiting on in-flight fetch");
                    self.inner.metrics.record_coalesced();
                    match follower.wait().await {
                        Some(FlightOutcome::Stored) => {
                            if let Some(resource) = self.inner.serve_stored(&key).await {
                                return Ok(resource);
                            }
                        }
                        Some(FlightOutcome::Failed(e)) => return Err(e.into()),
                        // Nothing stored: try again, possibly as the next leader
                        Some(FlightOutcome::NotStored) | None => {}
                    }
                }
            }
        }
    }

    /// Delete the stored entry and its freshness record. Absent keys are a no-op.
    pub async fn remove(&self, identifier: &str) -> Result<()> {
        let key = fingerprint(identifier);

        loop {
            match self.inner.flights.join(&key) {
                Join::Leader(leader) => {
                    let result = self.inner.purge(&key).await;
                    drop(leader);
                    return result;
                }
                Join::Follower(follower) => {
                    follower.wait().await;
                }
            }
        }
    }

    async fn fetch_through(
        &self,
        identifier: &str,
        key: CacheKey,
        leader: FlightLeader,
    ) -> Result<Resource> {
        debug!(key = %key, identifier, "Cache miss");
        self.inner.metrics.record_miss();

        let (head_tx, head_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let identifier = identifier.to_string();

        // Detached so the fetch and the store write outlive a disconnecting caller
        tokio::spawn(async move { inner.run_flight(identifier, key, leader, head_tx).await });

        match head_rx.await {
            Ok(Ok((metadata, body))) => Ok(Resource {
                metadata,
                body,
                source: CacheSource::Origin,
            }),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(CacheError::Origin(OriginError::ConnectionError(
                "fetch task ended without a response".to_string(),
            ))),
        }
    }
}

impl Inner {
    /// Serve the stored entry if the index says it is fresh
    async fn lookup_fresh(&self, key: &CacheKey, max_age: Duration) -> Option<Resource> {
        let refreshed_at = match self.index.last_refreshed(key).await {
            Ok(Some(refreshed_at)) => refreshed_at,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "Freshness index unavailable, treating as miss");
                self.metrics.record_index_unavailable();
                return None;
            }
        };

        if !is_fresh(refreshed_at, self.clock.now(), max_age) {
            debug!(key = %key, %refreshed_at, "Cache entry stale");
            return None;
        }

        self.serve_stored(key).await
    }

    async fn serve_stored(&self, key: &CacheKey) -> Option<Resource> {
        match self.store.read(key).await {
            Ok(blob) => {
                debug!(key = %key, "Cache hit");
                self.retention.touch(key);
                self.metrics.record_hit();
                self.metrics
                    .record_bytes_served(blob.metadata.content_length.unwrap_or(0));
                Some(Resource {
                    metadata: blob.metadata,
                    body: blob.body,
                    source: CacheSource::Store,
                })
            }
            Err(e @ (StoreError::NotFound | StoreError::Corrupt(_))) => {
                warn!(key = %key, error = %e, "Index and blob store disagree, refetching");
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read cached blob, refetching");
                self.metrics.record_store_failure();
                None
            }
        }
    }

    async fn run_flight(
        self: Arc<Self>,
        identifier: String,
        key: CacheKey,
        leader: FlightLeader,
        head_tx: oneshot::Sender<Head>,
    ) {
        self.metrics.record_origin_fetch();
        let fetched = tokio::time::timeout(self.origin_timeout, self.origin.fetch(&identifier))
            .await
            .unwrap_or(Err(OriginError::Timeout));
        let response = match fetched {
            Ok(response) => response,
            Err(e) => {
                error!(identifier = %identifier, error = %e, "Origin fetch failed");
                leader.complete(FlightOutcome::Failed(e.clone()));
                let _ = head_tx.send(Err(e));
                return;
            }
        };

        let metadata = ResourceMetadata {
            content_type: response.content_type.clone(),
            content_length: response.content_length,
        };

        let (caller_feed, caller_body) = CallerFeed::channel(self.caller_buffer_size);
        let caller_feed = match head_tx.send(Ok((metadata, caller_body))) {
            Ok(()) => Some(caller_feed),
            Err(_) => {
                debug!(key = %key, "Caller went away before the response, caching anyway");
                None
            }
        };

        let (store_tx, store_rx) = mpsc::unbounded();
        tokio::join!(
            self.pump(&key, response.body, caller_feed, store_tx),
            self.persist(
                &key,
                &response.content_type,
                response.content_length,
                store_rx.boxed(),
                leader,
            ),
        );
    }

    /// Read the origin body once, handing every chunk to both consumers.
    /// The store never waits on the caller: a caller that falls too far behind
    /// is cut off. A body that stays silent for the origin timeout fails both.
    async fn pump(
        &self,
        key: &CacheKey,
        mut body: ByteStream,
        caller: Option<CallerFeed>,
        store: UnboundedSender<io::Result<Bytes>>,
    ) {
        let mut caller = caller;
        let mut store = Some(store);

        loop {
            let item = match tokio::time::timeout(self.origin_timeout, body.next()).await {
                Ok(Some(item)) => item,
                Ok(None) => return,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    OriginError::Timeout,
                )),
            };

            match item {
                Ok(chunk) => {
                    if let Some(feed) = &caller {
                        let len = chunk.len() as u64;
                        match feed.send(chunk.clone()) {
                            Ok(()) => self.metrics.record_bytes_served(len),
                            Err(FeedError::Lagging) => {
                                warn!(
                                    key = %key,
                                    buffered = feed.buffered(),
                                    "Caller fell too far behind, cutting it off"
                                );
                                caller = None;
                            }
                            Err(FeedError::Disconnected) => {
                                debug!(key = %key, "Caller disconnected, still filling cache");
                                caller = None;
                            }
                        }
                    }
                    if let Some(tx) = &store {
                        if tx.unbounded_send(Ok(chunk)).is_err() {
                            store = None;
                        }
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Origin stream failed");
                    if let Some(feed) = &caller {
                        feed.fail(io::Error::new(e.kind(), e.to_string()));
                    }
                    if let Some(tx) = &store {
                        let _ = tx.unbounded_send(Err(e));
                    }
                    return;
                }
            }

            if caller.is_none() && store.is_none() {
                debug!(key = %key, "No consumers left, dropping origin stream");
                return;
            }
        }
    }

    /// Write the body to the blob store, then mark the key fresh
    async fn persist(
        &self,
        key: &CacheKey,
        content_type: &str,
        content_length: Option<u64>,
        body: ByteStream,
        leader: FlightLeader,
    ) {
        let outcome = match self
            .store
            .write(key, content_type, content_length, body)
            .await
        {
            Ok(entry) => {
                if self.commit_fresh(&entry).await {
                    FlightOutcome::Stored
                } else {
                    FlightOutcome::NotStored
                }
            }
            Err(e @ StoreError::Incomplete(_)) => {
                warn!(key = %key, error = %e, "Origin body incomplete, not caching");
                FlightOutcome::NotStored
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to cache resource");
                self.metrics.record_store_failure();
                FlightOutcome::NotStored
            }
        };

        leader.complete(outcome);
    }

    /// Returns false if the entry was evicted straight away for exceeding the budget
    async fn commit_fresh(&self, entry: &StoredEntry) -> bool {
        let key = &entry.key;
        if let Err(e) = self.index.mark_refreshed(key, self.clock.now()).await {
            warn!(key = %key, error = %e, "Failed to mark cache entry fresh");
            self.metrics.record_index_unavailable();
        }

        let mut retained = true;
        for (victim, size) in self.retention.admit(key.clone(), entry.size) {
            if &victim == key {
                retained = false;
            }
            self.evict(&victim, size, Some(key)).await;
        }
        retained
    }

    /// Remove an LRU victim. `held` is a key whose flight the caller already leads.
    async fn evict(&self, victim: &CacheKey, size: u64, held: Option<&CacheKey>) {
        let _guard = if held == Some(victim) {
            None
        } else {
            match self.flights.join(victim) {
                Join::Leader(leader) => Some(leader),
                Join::Follower(_) => {
                    // Being refreshed right now; that flight re-admits it
                    debug!(key = %victim, "Skipping eviction of in-flight entry");
                    return;
                }
            }
        };

        debug!(key = %victim, size, "Evicting cache entry");
        if let Err(e) = self.purge(victim).await {
            warn!(key = %victim, error = %e, "Failed to evict cache entry");
        }
        self.metrics.record_eviction(size);
    }

    /// Drop the index record first so nothing treats the entry as fresh,
    /// then the blob itself
    async fn purge(&self, key: &CacheKey) -> Result<()> {
        self.retention.forget(key);
        if let Err(e) = self.index.remove(key).await {
            self.metrics.record_index_unavailable();
            return Err(e.into());
        }
        if let Err(e) = self.store.delete(key).await {
            self.metrics.record_store_failure();
            return Err(e.into());
        }
        Ok(())
    }
}

enum FeedError {
    Lagging,
    Disconnected,
}

/// Sending half of a caller's live body. Tracks how many bytes the caller has
/// yet to read so a stalled client holds at most `limit` bytes in memory.
struct CallerFeed {
    tx: UnboundedSender<io::Result<Bytes>>,
    buffered: Arc<AtomicU64>,
    limit: u64,
}

impl CallerFeed {
    fn channel(limit: u64) -> (Self, ByteStream) {
        let (tx, rx) = mpsc::unbounded();
        let buffered = Arc::new(AtomicU64::new(0));

        let drained = Arc::clone(&buffered);
        let body = rx
            .inspect(move |item: &io::Result<Bytes>| {
                if let Ok(chunk) = item {
                    drained.fetch_sub(chunk.len() as u64, Ordering::AcqRel);
                }
            })
            .boxed();

        (
            Self {
                tx,
                buffered,
                limit,
            },
            body,
        )
    }

    fn buffered(&self) -> u64 {
        self.buffered.load(Ordering::Acquire)
    }

    /// A chunk larger than the whole limit still goes through when nothing is queued
    fn send(&self, chunk: Bytes) -> std::result::Result<(), FeedError> {
        if self.tx.is_closed() {
            return Err(FeedError::Disconnected);
        }

        let len = chunk.len() as u64;
        let queued = self.buffered();
        if queued > 0 && queued + len > self.limit {
            return Err(FeedError::Lagging);
        }

        self.buffered.fetch_add(len, Ordering::AcqRel);
        self.tx
            .unbounded_send(Ok(chunk))
            .map_err(|_| FeedError::Disconnected)
    }

    fn fail(&self, err: io::Error) {
        let _ = self.tx.unbounded_send(Err(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::IndexError;
    use crate::freshness::MemoryFreshnessIndex;
    use crate::metrics::CacheMetrics;
    use crate::origin::OriginResponse;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    const PAYLOAD: &[u8] = b"The quick brown fox jumps over the lazy dog";

    /// Origin that serves a fixed payload and counts calls
    struct FakeOrigin {
        calls: AtomicUsize,
        delay: Duration,
        payload: Vec<u8>,
        content_type: String,
        declared_length: Option<Option<u64>>,
        failure: Option<OriginError>,
        break_after: Option<usize>,
        stall_after: Option<usize>,
    }

    impl FakeOrigin {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                payload: PAYLOAD.to_vec(),
                content_type: "text/plain".to_string(),
                declared_length: None,
                failure: None,
                break_after: None,
                stall_after: None,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn with_payload(mut self, payload: Vec<u8>) -> Self {
            self.payload = payload;
            self
        }

        fn declaring(mut self, length: Option<u64>) -> Self {
            self.declared_length = Some(length);
            self
        }

        fn failing(mut self, err: OriginError) -> Self {
            self.failure = Some(err);
            self
        }

        fn breaking_after(mut self, chunks: usize) -> Self {
            self.break_after = Some(chunks);
            self
        }

        /// Send `chunks` chunks, then keep the body open without sending more
        fn stalling_after(mut self, chunks: usize) -> Self {
            self.stall_after = Some(chunks);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OriginFetcher for FakeOrigin {
        async fn fetch(&self, _identifier: &str) -> std::result::Result<OriginResponse, OriginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(err) = &self.failure {
                return Err(err.clone());
            }

            let mut chunks: Vec<io::Result<Bytes>> = self
                .payload
                .chunks(8)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            if let Some(n) = self.break_after {
                chunks.truncate(n);
                chunks.push(Err(io::Error::other("connection reset by origin")));
            }
            let body = match self.stall_after {
                Some(n) => {
                    chunks.truncate(n);
                    stream::iter(chunks).chain(stream::pending()).boxed()
                }
                None => stream::iter(chunks).boxed(),
            };

            Ok(OriginResponse {
                content_type: self.content_type.clone(),
                content_length: self
                    .declared_length
                    .unwrap_or(Some(self.payload.len() as u64)),
                body,
            })
        }
    }

    /// Index whose backing store is down
    struct UnavailableIndex;

    #[async_trait]
    impl FreshnessIndex for UnavailableIndex {
        async fn last_refreshed(
            &self,
            _key: &CacheKey,
        ) -> std::result::Result<Option<DateTime<Utc>>, IndexError> {
            Err(IndexError::Unavailable("connection refused".to_string()))
        }

        async fn mark_refreshed(
            &self,
            _key: &CacheKey,
            _at: DateTime<Utc>,
        ) -> std::result::Result<(), IndexError> {
            Err(IndexError::Unavailable("connection refused".to_string()))
        }

        async fn remove(&self, _key: &CacheKey) -> std::result::Result<(), IndexError> {
            Err(IndexError::Unavailable("connection refused".to_string()))
        }
    }

    struct Harness {
        cache: FetchCache,
        index: Arc<MemoryFreshnessIndex>,
        origin: Arc<FakeOrigin>,
        metrics: Arc<CacheMetrics>,
        clock: Arc<ManualClock>,
        dir: TempDir,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn test_config(dir: &TempDir) -> CacheConfig {
        CacheConfig {
            cache_dir: dir.path().join("blobs"),
            default_max_age: Duration::from_secs(60),
            ..CacheConfig::default()
        }
    }

    async fn harness(origin: FakeOrigin) -> Harness {
        harness_with(origin, |_| {}).await
    }

    async fn harness_with(origin: FakeOrigin, tweak: impl FnOnce(&mut CacheConfig)) -> Harness {
        let dir = tempdir().unwrap();
        let mut config = test_config(&dir);
        tweak(&mut config);

        let index = Arc::new(MemoryFreshnessIndex::new());
        let origin = Arc::new(origin);
        let metrics = Arc::new(CacheMetrics::new());
        let clock = Arc::new(ManualClock::new(t0()));

        let cache = FetchCache::with_clock(
            &config,
            index.clone(),
            origin.clone(),
            metrics.clone(),
            clock.clone(),
        );
        cache.init().await.unwrap();

        Harness {
            cache,
            index,
            origin,
            metrics,
            clock,
            dir,
        }
    }

    async fn collect(mut body: ByteStream) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    /// Wait until every flight has stored (or given up on) its payload
    async fn settle(cache: &FetchCache) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while cache.inner.flights.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("flights did not settle");
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let h = harness(FakeOrigin::new()).await;
        let url = "https://example.com/fox.txt";

        let first = h.cache.retrieve(url).await.unwrap();
        assert_eq!(first.source, CacheSource::Origin);
        assert_eq!(first.metadata.content_type, "text/plain");
        assert_eq!(first.metadata.content_length, Some(PAYLOAD.len() as u64));
        assert_eq!(collect(first.body).await.unwrap(), PAYLOAD);
        settle(&h.cache).await;

        let second = h.cache.retrieve(url).await.unwrap();
        assert_eq!(second.source, CacheSource::Store);
        assert_eq!(second.metadata, first.metadata);
        assert_eq!(collect(second.body).await.unwrap(), PAYLOAD);

        assert_eq!(h.origin.calls(), 1);
        let stats = h.metrics.snapshot(h.cache.usage());
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_size, PAYLOAD.len() as u64);
        assert_eq!(stats.bytes_served, 2 * PAYLOAD.len() as u64);
    }

    #[tokio::test]
    async fn test_freshness_boundary() {
        let h = harness(FakeOrigin::new()).await;
        let url = "https://example.com/boundary";
        let max_age = Duration::from_secs(60);

        let resource = h.cache.retrieve_with_max_age(url, max_age).await.unwrap();
        collect(resource.body).await.unwrap();
        settle(&h.cache).await;
        assert_eq!(
            h.index.last_refreshed(&fingerprint(url)).await.unwrap(),
            Some(t0())
        );

        h.clock
            .set(t0() + chrono::Duration::seconds(60) - chrono::Duration::milliseconds(1));
        let resource = h.cache.retrieve_with_max_age(url, max_age).await.unwrap();
        assert_eq!(resource.source, CacheSource::Store);
        assert_eq!(h.origin.calls(), 1);

        h.clock
            .set(t0() + chrono::Duration::seconds(60) + chrono::Duration::milliseconds(1));
        let resource = h.cache.retrieve_with_max_age(url, max_age).await.unwrap();
        assert_eq!(resource.source, CacheSource::Origin);
        collect(resource.body).await.unwrap();
        assert_eq!(h.origin.calls(), 2);
    }

    #[tokio::test]
    async fn test_default_max_age_from_config() {
        let h = harness(FakeOrigin::new()).await;
        let url = "https://example.com/default-age";
        assert_eq!(h.cache.default_max_age(), Duration::from_secs(60));

        collect(h.cache.retrieve(url).await.unwrap().body)
            .await
            .unwrap();
        settle(&h.cache).await;

        h.clock.advance(chrono::Duration::seconds(61));
        let resource = h.cache.retrieve(url).await.unwrap();
        assert_eq!(resource.source, CacheSource::Origin);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_share_one_fetch() {
        let h = harness(FakeOrigin::new().with_delay(Duration::from_millis(50))).await;
        let url = "https://example.com/popular.js";

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let cache = h.cache.clone();
                tokio::spawn(async move {
                    let resource = cache.retrieve(url).await.unwrap();
                    let metadata = resource.metadata.clone();
                    (metadata, collect(resource.body).await.unwrap())
                })
            })
            .collect();

        for task in tasks {
            let (metadata, body) = task.await.unwrap();
            assert_eq!(metadata.content_length, Some(PAYLOAD.len() as u64));
            assert_eq!(body, PAYLOAD);
        }

        assert_eq!(h.origin.calls(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_does_not_affect_caller() {
        let h = harness(FakeOrigin::new()).await;
        let url = "https://example.com/unwritable";

        // Storage disappears underneath the cache
        std::fs::remove_dir_all(h.dir.path().join("blobs")).unwrap();

        let resource = h.cache.retrieve(url).await.unwrap();
        assert_eq!(resource.source, CacheSource::Origin);
        assert_eq!(collect(resource.body).await.unwrap(), PAYLOAD);
        settle(&h.cache).await;

        assert_eq!(h.index.last_refreshed(&fingerprint(url)).await.unwrap(), None);
        assert!(h.metrics.snapshot(h.cache.usage()).store_failures >= 1);

        let resource = h.cache.retrieve(url).await.unwrap();
        assert_eq!(resource.source, CacheSource::Origin);
        assert_eq!(collect(resource.body).await.unwrap(), PAYLOAD);
        assert_eq!(h.origin.calls(), 2);
    }

    #[tokio::test]
    async fn test_index_store_desync_heals() {
        let h = harness(FakeOrigin::new()).await;
        let url = "https://example.com/desync";

        // Index claims the entry is fresh but the store never received it
        h.index
            .mark_refreshed(&fingerprint(url), t0())
            .await
            .unwrap();

        let resource = h.cache.retrieve(url).await.unwrap();
        assert_eq!(resource.source, CacheSource::Origin);
        assert_eq!(collect(resource.body).await.unwrap(), PAYLOAD);
        assert_eq!(h.origin.calls(), 1);
        settle(&h.cache).await;

        let resource = h.cache.retrieve(url).await.unwrap();
        assert_eq!(resource.source, CacheSource::Store);
    }

    #[tokio::test]
    async fn test_origin_error_is_propagated_and_not_cached() {
        let h = harness(FakeOrigin::new().failing(OriginError::NotFound)).await;
        let url = "https://example.com/missing";

        let err = h.cache.retrieve(url).await.unwrap_err();
        assert!(matches!(err, CacheError::Origin(OriginError::NotFound)));
        settle(&h.cache).await;

        let err = h.cache.retrieve(url).await.unwrap_err();
        assert!(matches!(err, CacheError::Origin(OriginError::NotFound)));
        assert_eq!(h.origin.calls(), 2);
        assert!(h.index.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_waiters_share_origin_failure() {
        let h = harness(
            FakeOrigin::new()
                .with_delay(Duration::from_millis(50))
                .failing(OriginError::ServerError(502)),
        )
        .await;
        let url = "https://example.com/flaky";

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let cache = h.cache.clone();
                tokio::spawn(async move { cache.retrieve(url).await.map(|_| ()) })
            })
            .collect();

        for task in tasks {
            let result = task.await.unwrap();
            assert!(matches!(
                result,
                Err(CacheError::Origin(OriginError::ServerError(502)))
            ));
        }
        assert_eq!(h.origin.calls(), 1);
    }

    #[tokio::test]
    async fn test_index_unavailable_degrades_to_origin() {
        let dir = tempdir().unwrap();
        let origin = Arc::new(FakeOrigin::new());
        let metrics = Arc::new(CacheMetrics::new());
        let cache = FetchCache::new(
            &test_config(&dir),
            Arc::new(UnavailableIndex),
            origin.clone(),
            metrics.clone(),
        );
        cache.init().await.unwrap();
        let url = "https://example.com/degraded";

        for _ in 0..2 {
            let resource = cache.retrieve(url).await.unwrap();
            assert_eq!(resource.source, CacheSource::Origin);
            assert_eq!(collect(resource.body).await.unwrap(), PAYLOAD);
            settle(&cache).await;
        }

        assert_eq!(origin.calls(), 2);
        assert!(metrics.snapshot(cache.usage()).index_failures >= 2);
    }

    #[tokio::test]
    async fn test_caller_disconnect_still_fills_cache() {
        let h = harness(FakeOrigin::new()).await;
        let url = "https://example.com/abandoned";

        let resource = h.cache.retrieve(url).await.unwrap();
        drop(resource);
        settle(&h.cache).await;

        let resource = h.cache.retrieve(url).await.unwrap();
        assert_eq!(resource.source, CacheSource::Store);
        assert_eq!(collect(resource.body).await.unwrap(), PAYLOAD);
        assert_eq!(h.origin.calls(), 1);
    }

    #[tokio::test]
    async fn test_truncated_origin_body_is_not_cached() {
        let h = harness(FakeOrigin::new().declaring(Some(PAYLOAD.len() as u64 + 10))).await;
        let url = "https://example.com/truncated";

        let resource = h.cache.retrieve(url).await.unwrap();
        assert_eq!(collect(resource.body).await.unwrap(), PAYLOAD);
        settle(&h.cache).await;

        assert_eq!(h.index.last_refreshed(&fingerprint(url)).await.unwrap(), None);
        let resource = h.cache.retrieve(url).await.unwrap();
        assert_eq!(resource.source, CacheSource::Origin);
        assert_eq!(h.origin.calls(), 2);
    }

    #[tokio::test]
    async fn test_origin_stream_error_reaches_caller() {
        let h = harness(FakeOrigin::new().breaking_after(2)).await;
        let url = "https://example.com/reset";

        let resource = h.cache.retrieve(url).await.unwrap();
        assert!(collect(resource.body).await.is_err());
        settle(&h.cache).await;

        assert_eq!(h.index.last_refreshed(&fingerprint(url)).await.unwrap(), None);
        assert_eq!(h.cache.usage().entries, 0);
    }

    #[tokio::test]
    async fn test_stalled_origin_body_releases_the_key() {
        let h = harness_with(FakeOrigin::new().stalling_after(2), |config| {
            config.origin_timeout = Duration::from_millis(100);
        })
        .await;
        let url = "https://example.com/stalled";

        let resource = h.cache.retrieve(url).await.unwrap();
        let err = tokio::time::timeout(Duration::from_secs(3), collect(resource.body))
            .await
            .expect("caller body never ended")
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        settle(&h.cache).await;

        assert_eq!(h.index.last_refreshed(&fingerprint(url)).await.unwrap(), None);
        assert_eq!(h.cache.usage().entries, 0);

        // A caller that walked away early must not leave the key stuck either
        let resource = h.cache.retrieve(url).await.unwrap();
        drop(resource);
        settle(&h.cache).await;

        let resource = tokio::time::timeout(Duration::from_secs(3), h.cache.retrieve(url))
            .await
            .expect("retrieve waited on a dead fetch")
            .unwrap();
        assert_eq!(resource.source, CacheSource::Origin);
        assert_eq!(h.origin.calls(), 3);
    }

    #[tokio::test]
    async fn test_slow_origin_response_times_out() {
        let h = harness_with(
            FakeOrigin::new().with_delay(Duration::from_secs(5)),
            |config| config.origin_timeout = Duration::from_millis(100),
        )
        .await;

        let err = tokio::time::timeout(
            Duration::from_secs(3),
            h.cache.retrieve("https://example.com/sluggish"),
        )
        .await
        .expect("origin timeout was not applied")
        .unwrap_err();
        assert!(matches!(err, CacheError::Origin(OriginError::Timeout)));
        settle(&h.cache).await;
    }

    #[tokio::test]
    async fn test_lagging_caller_is_cut_off_while_cache_fills() {
        let payload: Vec<u8> = (0..64 * 8).map(|i| (i % 251) as u8).collect();
        let h = harness_with(FakeOrigin::new().with_payload(payload.clone()), |config| {
            config.caller_buffer_size = 32;
        })
        .await;
        let url = "https://example.com/slow-reader.bin";

        // Nobody reads the live body until the flight is over
        let live = h.cache.retrieve(url).await.unwrap();
        settle(&h.cache).await;

        let received = collect(live.body).await.unwrap();
        assert_eq!(received.len(), 32);
        assert_eq!(received[..], payload[..32]);

        let stored = h.cache.retrieve(url).await.unwrap();
        assert_eq!(stored.source, CacheSource::Store);
        assert_eq!(collect(stored.body).await.unwrap(), payload);
        assert_eq!(h.origin.calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_length_is_recorded_on_store() {
        let h = harness(FakeOrigin::new().declaring(None)).await;
        let url = "https://example.com/chunked";

        let live = h.cache.retrieve(url).await.unwrap();
        assert_eq!(live.metadata.content_length, None);
        collect(live.body).await.unwrap();
        settle(&h.cache).await;

        let stored = h.cache.retrieve(url).await.unwrap();
        assert_eq!(stored.source, CacheSource::Store);
        assert_eq!(stored.metadata.content_length, Some(PAYLOAD.len() as u64));
    }

    #[tokio::test]
    async fn test_remove() {
        let h = harness(FakeOrigin::new()).await;
        let url = "https://example.com/removable";

        // Removing something never cached is a no-op
        h.cache.remove(url).await.unwrap();

        collect(h.cache.retrieve(url).await.unwrap().body)
            .await
            .unwrap();
        settle(&h.cache).await;
        assert_eq!(h.cache.usage().entries, 1);

        h.cache.remove(url).await.unwrap();
        assert_eq!(h.index.last_refreshed(&fingerprint(url)).await.unwrap(), None);
        assert_eq!(h.cache.usage().entries, 0);
        assert!(matches!(
            h.cache.inner.store.read(&fingerprint(url)).await,
            Err(StoreError::NotFound)
        ));

        let resource = h.cache.retrieve(url).await.unwrap();
        assert_eq!(resource.source, CacheSource::Origin);
        assert_eq!(h.origin.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_remove_never_splits_entry() {
        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let h = harness(FakeOrigin::new().with_payload(payload.clone())).await;
        let url = "https://example.com/contended.bin";

        let remover = {
            let cache = h.cache.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    cache.remove(url).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = h.cache.clone();
                let expected = payload.clone();
                tokio::spawn(async move {
                    for _ in 0..25 {
                        let resource = cache.retrieve(url).await.unwrap();
                        let declared = resource.metadata.content_length;
                        let body = collect(resource.body).await.unwrap();
                        assert_eq!(declared, Some(body.len() as u64));
                        assert_eq!(body, expected);
                    }
                })
            })
            .collect();

        remover.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_retention_evicts_least_recently_used() {
        let h = harness_with(FakeOrigin::new(), |config| {
            config.max_cache_size = 2 * PAYLOAD.len() as u64;
        })
        .await;

        for url in ["https://example.com/1", "https://example.com/2"] {
            collect(h.cache.retrieve(url).await.unwrap().body)
                .await
                .unwrap();
            settle(&h.cache).await;
        }

        // Touch the first so the second becomes the eviction victim
        let hit = h.cache.retrieve("https://example.com/1").await.unwrap();
        assert_eq!(hit.source, CacheSource::Store);

        collect(h.cache.retrieve("https://example.com/3").await.unwrap().body)
            .await
            .unwrap();
        settle(&h.cache).await;

        let usage = h.cache.usage();
        assert_eq!(usage.entries, 2);
        assert!(usage.total_size <= 2 * PAYLOAD.len() as u64);
        assert_eq!(
            h.index
                .last_refreshed(&fingerprint("https://example.com/2"))
                .await
                .unwrap(),
            None
        );
        assert_eq!(h.metrics.snapshot(usage).evictions, 1);

        let kept = h.cache.retrieve("https://example.com/1").await.unwrap();
        assert_eq!(kept.source, CacheSource::Store);
        let again = h.cache.retrieve("https://example.com/2").await.unwrap();
        assert_eq!(again.source, CacheSource::Origin);
    }

    #[tokio::test]
    async fn test_oversized_resource_is_served_but_not_retained() {
        let h = harness_with(FakeOrigin::new(), |config| {
            config.max_cache_size = 4;
        })
        .await;
        let url = "https://example.com/huge";

        let resource = h.cache.retrieve(url).await.unwrap();
        assert_eq!(collect(resource.body).await.unwrap(), PAYLOAD);
        settle(&h.cache).await;

        assert_eq!(h.cache.usage().entries, 0);
        assert_eq!(h.index.last_refreshed(&fingerprint(url)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_init_restores_retention_from_disk() {
        let h = harness(FakeOrigin::new()).await;
        collect(h.cache.retrieve("https://example.com/persisted").await.unwrap().body)
            .await
            .unwrap();
        settle(&h.cache).await;

        let reopened = FetchCache::new(
            &test_config(&h.dir),
            h.index.clone(),
            h.origin.clone(),
            Arc::new(CacheMetrics::new()),
        );
        let usage = reopened.init().await.unwrap();
        assert_eq!(usage.entries, 1);
        assert_eq!(usage.total_size, PAYLOAD.len() as u64);
    }

    #[tokio::test]
    async fn test_init_evicts_over_budget_entries() {
        let h = harness(FakeOrigin::new()).await;
        for url in ["https://example.com/a", "https://example.com/b"] {
            collect(h.cache.retrieve(url).await.unwrap().body)
                .await
                .unwrap();
            settle(&h.cache).await;
        }

        let mut config = test_config(&h.dir);
        config.max_entries = 1;
        let reopened = FetchCache::new(
            &config,
            h.index.clone(),
            h.origin.clone(),
            Arc::new(CacheMetrics::new()),
        );
        let usage = reopened.init().await.unwrap();
        assert_eq!(usage.entries, 1);
        assert_eq!(h.index.len().await, 1);
    }
}
