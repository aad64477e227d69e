use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use astronomy_cache::SerialCache;
use astronomy_service::fetch::{FetchError, FetchResult, Fetcher};
use astronomy_service::pipeline::{FetchPipeline, Presenter};
use astronomy_test as test;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::watch;

pub use test::{PhotoServer, read_fixture};

/// The bytes of the PNG fixture, starting with `[0x89, 0x50, ...]`.
pub fn png() -> Bytes {
    Bytes::from(read_fixture("photos/curiosity-42.png"))
}

/// A distinct payload for `key`.
pub fn payload(key: u64) -> Bytes {
    Bytes::from(format!("photo #{key}"))
}

/// What a [`ScriptedFetcher`] does for a key.
#[derive(Clone, Debug)]
pub enum Script {
    Payload(Bytes),
    Fail(FetchError),
    Panic,
}

#[derive(Debug, Default)]
struct State {
    scripts: HashMap<u64, Script>,
    gates: HashMap<u64, watch::Receiver<bool>>,
    calls: HashMap<u64, usize>,
    running: usize,
    max_running: usize,
}

/// A fetcher that answers from a fixed script and records how it is used.
///
/// Fetches for keys without a script fail with [`FetchError::NotFound`]. Keys can be gated,
/// in which case their fetch does not complete before the gate is opened.
#[derive(Clone, Debug, Default)]
pub struct ScriptedFetcher {
    state: Arc<Mutex<State>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: u64, script: Script) -> Self {
        self.state.lock().unwrap().scripts.insert(key, script);
        self
    }

    pub fn with_payload(self, key: u64, payload: Bytes) -> Self {
        self.with(key, Script::Payload(payload))
    }

    /// Holds back the fetch of `key` until [`Gate::open`] is called.
    pub fn gate(&self, key: u64) -> Gate {
        let (sender, receiver) = watch::channel(false);
        self.state.lock().unwrap().gates.insert(key, receiver);
        Gate(sender)
    }

    /// How often `fetch` was called for `key`.
    pub fn calls(&self, key: u64) -> usize {
        let state = self.state.lock().unwrap();
        state.calls.get(&key).copied().unwrap_or_default()
    }

    /// How often `fetch` was called in total.
    pub fn total_calls(&self) -> usize {
        self.state.lock().unwrap().calls.values().sum()
    }

    /// Number of fetches currently running.
    pub fn running(&self) -> usize {
        self.state.lock().unwrap().running
    }

    /// The highest number of fetches that ran at the same time.
    pub fn max_running(&self) -> usize {
        self.state.lock().unwrap().max_running
    }

    pub fn shared(&self) -> Arc<dyn Fetcher<u64>> {
        Arc::new(self.clone())
    }
}

impl Fetcher<u64> for ScriptedFetcher {
    fn fetch(&self, key: u64) -> BoxFuture<'static, FetchResult> {
        let (script, gate) = {
            let mut state = self.state.lock().unwrap();
            *state.calls.entry(key).or_default() += 1;
            (
                state.scripts.get(&key).cloned(),
                state.gates.get(&key).cloned(),
            )
        };

        let state = Arc::clone(&self.state);
        async move {
            let _running = Running::enter(state);

            if let Some(mut gate) = gate {
                let _ = gate.wait_for(|open| *open).await;
            }

            match script {
                Some(Script::Payload(payload)) => Ok(payload),
                Some(Script::Fail(error)) => Err(error),
                Some(Script::Panic) => panic!("scripted fetcher panic for {key}"),
                None => Err(FetchError::NotFound),
            }
        }
        .boxed()
    }
}

/// Tracks a running fetch, including fetches that are dropped before completion.
struct Running(Arc<Mutex<State>>);

impl Running {
    fn enter(state: Arc<Mutex<State>>) -> Self {
        {
            let mut guard = state.lock().unwrap();
            guard.running += 1;
            guard.max_running = guard.max_running.max(guard.running);
        }
        Self(state)
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        if let Ok(mut state) = self.0.lock() {
            state.running -= 1;
        }
    }
}

/// Releases a gated fetch. Dropping the gate releases it as well.
#[derive(Debug)]
pub struct Gate(watch::Sender<bool>);

impl Gate {
    pub fn open(&self) {
        self.0.send_replace(true);
    }
}

/// A grid of slots that records everything applied to it.
#[derive(Debug, Default)]
pub struct Grid {
    assigned: HashMap<usize, u64>,
    shown: HashMap<usize, Bytes>,
    applied: Vec<(usize, Bytes)>,
}

impl Grid {
    pub fn assign(&mut self, slot: usize, key: u64) {
        self.assigned.insert(slot, key);
    }

    pub fn clear(&mut self, slot: usize) {
        self.assigned.remove(&slot);
    }

    /// The payload currently shown in `slot`.
    pub fn shown(&self, slot: usize) -> Option<&Bytes> {
        self.shown.get(&slot)
    }

    /// Every payload applied so far, in order.
    pub fn applied(&self) -> &[(usize, Bytes)] {
        &self.applied
    }
}

impl Presenter for Grid {
    type Key = u64;
    type Slot = usize;

    fn current_key(&self, slot: usize) -> Option<u64> {
        self.assigned.get(&slot).copied()
    }

    fn apply(&mut self, slot: usize, payload: &Bytes) {
        self.shown.insert(slot, payload.clone());
        self.applied.push((slot, payload.clone()));
    }
}

/// Setup tests and create a pipeline on the current runtime, backed by a fresh cache.
pub fn setup_pipeline(
    fetcher: &ScriptedFetcher,
    max_concurrent_fetches: usize,
) -> FetchPipeline<u64, usize> {
    test::setup();

    let cache = SerialCache::new("photos").unwrap();
    let handle = tokio::runtime::Handle::current();
    FetchPipeline::new(cache, fetcher.shared(), handle, max_concurrent_fetches)
}

/// Polls `check` until it returns `true`.
///
/// # Panics
///
/// Panics if the condition does not hold within five seconds.
#[track_caller]
pub fn wait_until(mut check: impl FnMut() -> bool) -> impl Future<Output = ()> {
    let caller = std::panic::Location::caller();
    async move {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition at {caller} not reached in time");
    }
}

/// Waits for the cache to contain `key`.
///
/// Caching and delivery of a fetch are not ordered, so a delivered photo may not be cached yet.
pub async fn wait_for_cache(cache: &SerialCache<u64, Bytes>, key: u64) -> Bytes {
    for _ in 0..500 {
        if let Some(payload) = cache.get_async(&key).await {
            return payload;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("photo {key} never arrived in the cache");
}
