//! The fetch, cache and deliver pipeline.
//!
//! A [`FetchPipeline`] turns slot assignments into photo payloads. It is owned by a single
//! delivery context, the task that also owns the [`Presenter`], so slots are only ever read and
//! written from one place. Everything that can block runs elsewhere:
//!
//! - Cache reads and writes go through the [`SerialCache`] worker.
//! - Fetches run on the worker runtime, bounded by `max_concurrent_fetches`.
//! - Results come back to the delivery context as [`Delivery`] messages, which are revalidated
//!   against the slot's current assignment before they are applied.
//!
//! Every fetched key forms one chain: a single shared fetch, a task that writes a successful
//! result into the cache, and one forwarder per request that hands the result to the delivery
//! context. Slots asking for a key that is already being fetched join the running chain.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use astronomy_cache::SerialCache;
use bytes::Bytes;
use futures::future::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::fetch::{FetchError, FetchResult, Fetcher};
use crate::utils::futures::{m, measure};

mod delivery;
mod registry;

pub use self::delivery::{Delivered, Delivery, DeliveryReport};
pub use self::registry::RequestId;

use self::delivery::DeliveryGuard;
use self::registry::{Finished, Registry, SharedFetch};

/// Requirements on the keys identifying photos.
pub trait Key: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> Key for T where T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

/// Requirements on the handles identifying slots.
pub trait Slot: Eq + Hash + Copy + fmt::Debug + Send + 'static {}

impl<T> Slot for T where T: Eq + Hash + Copy + fmt::Debug + Send + 'static {}

/// The consumer of fetched photos.
///
/// A presenter owns a number of slots, each of which shows at most one photo at a time. Slots
/// are reused: the key assigned to a slot may change at any time between a call to
/// [`FetchPipeline::load`] and the matching delivery.
pub trait Presenter {
    /// The key of the photos shown in slots.
    type Key;
    /// The handle of a slot.
    type Slot;

    /// The key currently assigned to `slot`, if any.
    fn current_key(&self, slot: Self::Slot) -> Option<Self::Key>;

    /// Shows `payload` in `slot`.
    fn apply(&mut self, slot: Self::Slot, payload: &Bytes);
}

/// The result of [`FetchPipeline::load`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadStatus {
    /// The slot has no key assigned, nothing was loaded.
    Unassigned,
    /// The payload was in the cache and has been applied right away.
    Cached,
    /// The slot already waits for this key.
    InFlight,
    /// Another slot already fetches this key, the slot joined that fetch.
    Attached,
    /// A new fetch was started.
    Fetching,
}

impl LoadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unassigned => "unassigned",
            Self::Cached => "cached",
            Self::InFlight => "inflight",
            Self::Attached => "attached",
            Self::Fetching => "fetching",
        }
    }
}

/// The shared parts every chain is spawned with.
struct Workers<K> {
    cache: SerialCache<K, Bytes>,
    fetcher: Arc<dyn Fetcher<K>>,
    runtime: Handle,
    fetch_permits: Arc<Semaphore>,
    /// Cache writes that have not been awaited yet.
    caching: FuturesUnordered<JoinHandle<()>>,
}

impl<K: Key> Workers<K> {
    /// Spawns the fetch for `key` along with the task writing its result into the cache.
    fn start_chain(&mut self, key: K) -> (SharedFetch, CancellationToken) {
        let cancel = CancellationToken::new();

        let fetch = fetch_photo(
            Arc::clone(&self.fetcher),
            Arc::clone(&self.fetch_permits),
            cancel.clone(),
            key.clone(),
        );
        let result = self
            .runtime
            .spawn(fetch)
            .map(|joined| match joined {
                Ok(result) => result,
                Err(error) => {
                    tracing::error!(
                        error = &error as &dyn std::error::Error,
                        "Photo fetch panicked or was aborted"
                    );
                    Err(FetchError::InternalError)
                }
            })
            .boxed()
            .shared();

        let cache = self.cache.clone();
        let fetched = result.clone();
        let caching = self.runtime.spawn(async move {
            if let Ok(payload) = fetched.await {
                cache.put(key, payload);
            }
        });
        self.caching.push(caching);

        (result, cancel)
    }

    /// Drops the handles of cache writes that are already done.
    fn reap_caching(&mut self) {
        while let Some(Some(joined)) = self.caching.next().now_or_never() {
            log_caching_error(joined);
        }
    }

    /// Waits until every cache write started so far has been enqueued.
    async fn flush_caching(&mut self) {
        while let Some(joined) = self.caching.next().await {
            log_caching_error(joined);
        }
    }
}

fn log_caching_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(error) = joined {
        tracing::error!(
            error = &error as &dyn std::error::Error,
            "Writing a photo into the cache panicked or was aborted"
        );
    }
}

/// Loads photos into slots, through the cache.
pub struct FetchPipeline<K, S> {
    workers: Workers<K>,
    registry: Registry<K, S>,
    undelivered: usize,
    deliveries_tx: mpsc::UnboundedSender<Delivery<K, S>>,
    deliveries_rx: mpsc::UnboundedReceiver<Delivery<K, S>>,
}

impl<K: fmt::Debug, S: fmt::Debug> fmt::Debug for FetchPipeline<K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchPipeline")
            .field("cache", &self.workers.cache)
            .field(
                "fetch_permits",
                &self.workers.fetch_permits.available_permits(),
            )
            .field("registry", &self.registry)
            .field("undelivered", &self.undelivered)
            .finish()
    }
}

impl<K: Key, S: Slot> FetchPipeline<K, S> {
    /// Creates a new pipeline.
    ///
    /// Fetches are spawned on `runtime`, at most `max_concurrent_fetches` of them run at the
    /// same time. A limit of `0` is treated as `1`.
    pub fn new(
        cache: SerialCache<K, Bytes>,
        fetcher: Arc<dyn Fetcher<K>>,
        runtime: Handle,
        max_concurrent_fetches: usize,
    ) -> Self {
        let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
        Self {
            workers: Workers {
                cache,
                fetcher,
                runtime,
                fetch_permits: Arc::new(Semaphore::new(max_concurrent_fetches.max(1))),
                caching: FuturesUnordered::new(),
            },
            registry: Registry::default(),
            undelivered: 0,
            deliveries_tx,
            deliveries_rx,
        }
    }

    /// Creates a pipeline with the limits from `config`.
    pub fn from_config(
        config: &Config,
        cache: SerialCache<K, Bytes>,
        fetcher: Arc<dyn Fetcher<K>>,
        runtime: Handle,
    ) -> Self {
        Self::new(cache, fetcher, runtime, config.max_concurrent_fetches)
    }

    /// The cache backing this pipeline.
    pub fn cache(&self) -> &SerialCache<K, Bytes> {
        &self.workers.cache
    }

    /// Number of slots waiting for a delivery.
    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    /// Whether `slot` waits for a delivery.
    pub fn is_in_flight(&self, slot: S) -> bool {
        self.registry.contains_slot(slot)
    }

    /// Loads the photo for the key currently assigned to `slot`.
    ///
    /// Cached photos are applied immediately. Otherwise a fetch is started, or joined if one is
    /// already running for the key, and the photo is applied once its [`Delivery`] is passed to
    /// [`deliver`](Self::deliver). Failures never surface here.
    pub async fn load<P>(&mut self, presenter: &mut P, slot: S) -> LoadStatus
    where
        P: Presenter<Key = K, Slot = S>,
    {
        let status = self.load_inner(presenter, slot).await;
        metric!(counter("pipeline.load") += 1, "status" => status.as_str());
        status
    }

    async fn load_inner<P>(&mut self, presenter: &mut P, slot: S) -> LoadStatus
    where
        P: Presenter<Key = K, Slot = S>,
    {
        let Some(key) = presenter.current_key(slot) else {
            self.registry.forget_slot(slot);
            return LoadStatus::Unassigned;
        };

        if let Some(payload) = self.workers.cache.get_async(&key).await {
            tracing::trace!(?key, ?slot, "Photo served from cache");
            self.registry.forget_slot(slot);
            presenter.apply(slot, &payload);
            return LoadStatus::Cached;
        }

        if self.registry.is_pending(slot, &key) {
            return LoadStatus::InFlight;
        }

        self.workers.reap_caching();
        let (request, result, started) = self
            .registry
            .register(slot, key.clone(), || self.workers.start_chain(key));

        tracing::trace!(id = %request.id, key = ?request.key, ?slot, started, "Photo requested");

        let guard = DeliveryGuard::new(request, self.deliveries_tx.clone());
        self.undelivered += 1;
        self.workers
            .runtime
            .spawn(async move { guard.deliver(result.await) });

        match started {
            true => LoadStatus::Fetching,
            false => LoadStatus::Attached,
        }
    }

    /// Stops waiting for the photo requested by `slot`.
    ///
    /// Returns `false` if the slot had nothing in flight. The fetch itself is stopped once no
    /// other slot waits for the same key, and nothing is cached in that case.
    pub fn cancel(&mut self, slot: S) -> bool {
        match self.registry.cancel(slot) {
            Some(id) => {
                tracing::trace!(%id, ?slot, "Photo request canceled");
                true
            }
            None => false,
        }
    }

    /// Waits for the next finished request.
    ///
    /// Returns `None` once every request has been delivered.
    pub async fn next_delivery(&mut self) -> Option<Delivery<K, S>> {
        if self.undelivered == 0 {
            return None;
        }
        let delivery = self.deliveries_rx.recv().await?;
        self.undelivered -= 1;
        Some(delivery)
    }

    /// Returns the next finished request, if one is ready.
    ///
    /// Every delivery taken from the pipeline must be passed to [`deliver`](Self::deliver).
    pub fn try_next_delivery(&mut self) -> Option<Delivery<K, S>> {
        let delivery = self.deliveries_rx.try_recv().ok()?;
        self.undelivered -= 1;
        Some(delivery)
    }

    /// Applies a finished request to its slot, if the slot still wants it.
    pub fn deliver<P>(&mut self, presenter: &mut P, delivery: Delivery<K, S>) -> Delivered
    where
        P: Presenter<Key = K, Slot = S>,
    {
        let Delivery { request, result } = delivery;

        let delivered = match self.registry.finish(&request) {
            Finished::Canceled => Delivered::Canceled,
            Finished::Superseded => {
                tracing::debug!(
                    id = %request.id,
                    slot = ?request.slot,
                    "Got photo for superseded request"
                );
                Delivered::Stale
            }
            Finished::Current
                if presenter.current_key(request.slot).as_ref() != Some(&request.key) =>
            {
                tracing::debug!(
                    key = ?request.key,
                    slot = ?request.slot,
                    "Got photo for reused slot"
                );
                Delivered::Stale
            }
            Finished::Current => match result {
                Ok(payload) => {
                    presenter.apply(request.slot, &payload);
                    Delivered::Applied
                }
                Err(error) => {
                    match error {
                        FetchError::NotFound => {
                            tracing::debug!(key = ?request.key, "Photo not found");
                        }
                        _ => tracing::warn!(
                            error = &error as &dyn std::error::Error,
                            key = ?request.key,
                            "Failed to fetch photo"
                        ),
                    }
                    Delivered::Failed(error)
                }
            },
        };

        metric!(counter("pipeline.delivery") += 1, "outcome" => delivered.as_str());
        metric!(gauge("pipeline.in_flight") = self.registry.len() as u64);
        delivered
    }

    /// Delivers every outstanding request.
    ///
    /// Returns once no slot waits for anything anymore and every successful fetch has been
    /// written into the cache.
    pub async fn run_until_idle<P>(&mut self, presenter: &mut P) -> DeliveryReport
    where
        P: Presenter<Key = K, Slot = S>,
    {
        let mut report = DeliveryReport::default();
        while let Some(delivery) = self.next_delivery().await {
            report.record(&self.deliver(presenter, delivery));
        }
        self.workers.flush_caching().await;
        report
    }
}

/// Fetches `key` once a permit is available, unless the chain is canceled first.
async fn fetch_photo<K: Key>(
    fetcher: Arc<dyn Fetcher<K>>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    key: K,
) -> FetchResult {
    let job = async {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Canceled),
            permit = permits.acquire() => {
                permit.map_err(|_| FetchError::InternalError)?
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Canceled),
            result = fetcher.fetch(key.clone()) => result,
        }
    };

    let result = measure("pipeline.fetch", m::fetch, job).await;
    metric!(counter("pipeline.fetch") += 1, "status" => m::fetch(&result));

    if let Err(error) = &result {
        tracing::debug!(
            error = error as &dyn std::error::Error,
            ?key,
            "Photo fetch did not complete"
        );
    }

    result
}
