//! Bookkeeping of in-flight requests and fetch chains.
//!
//! The registry lives on the delivery context together with the slots, so it is only ever
//! touched through `&mut` and needs no locking.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use futures::future::{BoxFuture, Shared};
use tokio_util::sync::CancellationToken;

use crate::fetch::FetchResult;

/// The completed-once result of a fetch, awaited by every stage that depends on it.
pub(crate) type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// Identifies a single request, i.e. one slot waiting for one key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies a fetch chain, i.e. one fetch of one key shared by any number of requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ChainId(u64);

/// A request as it travels through the chain.
///
/// Carries its originating identity so the delivery step can revalidate it.
#[derive(Clone, Debug)]
pub(crate) struct Request<K, S> {
    pub id: RequestId,
    pub key: K,
    pub slot: S,
    pub chain: ChainId,
}

/// The in-flight request of a slot.
#[derive(Debug)]
struct InFlight<K> {
    request: RequestId,
    key: K,
}

/// How a finished request relates to its slot, see [`Registry::finish`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Finished {
    /// The slot still waits for this request.
    Current,
    /// The slot was served by a newer request or from the cache in the meantime.
    Superseded,
    /// The request was canceled before it finished.
    Canceled,
}

/// A running fetch for one key.
pub(crate) struct Chain {
    id: ChainId,
    result: SharedFetch,
    cancel: CancellationToken,
    waiters: HashSet<RequestId>,
}

impl Chain {
    pub fn result(&self) -> SharedFetch {
        self.result.clone()
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("id", &self.id)
            .field("canceled", &self.cancel.is_cancelled())
            .field("waiters", &self.waiters)
            .finish()
    }
}

/// Tracks which slot waits for which key, and which keys are being fetched.
#[derive(Debug)]
pub(crate) struct Registry<K, S> {
    next_id: u64,
    slots: HashMap<S, InFlight<K>>,
    chains: HashMap<K, Chain>,
}

impl<K, S> Default for Registry<K, S> {
    fn default() -> Self {
        Self {
            next_id: 0,
            slots: HashMap::new(),
            chains: HashMap::new(),
        }
    }
}

impl<K, S> Registry<K, S>
where
    K: Eq + Hash + Clone,
    S: Eq + Hash + Copy,
{
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Number of slots with an in-flight request.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Number of running fetch chains.
    #[cfg(test)]
    pub fn chains(&self) -> usize {
        self.chains.len()
    }

    /// `true` once no slot waits for anything and no chain has pending deliveries.
    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        self.slots.is_empty() && self.chains.is_empty()
    }

    /// Whether `slot` currently waits for `key`.
    pub fn is_pending(&self, slot: S, key: &K) -> bool {
        self.slots.get(&slot).is_some_and(|pending| pending.key == *key)
    }

    /// Whether `slot` currently waits for anything.
    pub fn contains_slot(&self, slot: S) -> bool {
        self.slots.contains_key(&slot)
    }

    /// Drops the in-flight entry of `slot` without canceling anything.
    ///
    /// The request stays attached to its chain. It is no longer the slot's current request, so
    /// its delivery is never applied.
    pub fn forget_slot(&mut self, slot: S) -> Option<RequestId> {
        self.slots.remove(&slot).map(|pending| pending.request)
    }

    /// Registers a new request of `slot` for `key`, superseding any older request of the slot.
    ///
    /// If a chain for `key` is already running, the request joins it. Otherwise `start` is
    /// called to create the chain, which is signaled by the returned `bool`.
    pub fn register(
        &mut self,
        slot: S,
        key: K,
        start: impl FnOnce() -> (SharedFetch, CancellationToken),
    ) -> (Request<K, S>, SharedFetch, bool) {
        let request = RequestId(self.next_id());
        self.slots.insert(
            slot,
            InFlight {
                request,
                key: key.clone(),
            },
        );

        let (chain, started) = match self.chains.entry(key.clone()) {
            Entry::Occupied(entry) => (entry.into_mut(), false),
            Entry::Vacant(entry) => {
                self.next_id += 1;
                let id = ChainId(self.next_id);
                let (result, cancel) = start();
                let chain = Chain {
                    id,
                    result,
                    cancel,
                    waiters: HashSet::new(),
                };
                (entry.insert(chain), true)
            }
        };
        chain.waiters.insert(request);

        let request = Request {
            id: request,
            key,
            slot,
            chain: chain.id,
        };
        (request, chain.result(), started)
    }

    /// Cancels the in-flight request of `slot`.
    ///
    /// The request is detached from its chain. A chain without any remaining requests is
    /// removed and its fetch is asked to stop.
    pub fn cancel(&mut self, slot: S) -> Option<RequestId> {
        let pending = self.slots.remove(&slot)?;
        if let Entry::Occupied(mut entry) = self.chains.entry(pending.key) {
            let chain = entry.get_mut();
            chain.waiters.remove(&pending.request);
            if chain.waiters.is_empty() {
                entry.remove().cancel.cancel();
            }
        }
        Some(pending.request)
    }

    /// Removes every trace of a finished request.
    ///
    /// Only the slot's latest request is [`Finished::Current`]. A request that was replaced by
    /// [`register`](Self::register) or dropped by [`forget_slot`](Self::forget_slot) is
    /// [`Finished::Superseded`], even if the slot asks for the same key again.
    pub fn finish(&mut self, request: &Request<K, S>) -> Finished {
        let current = match self.slots.entry(request.slot) {
            Entry::Occupied(entry) if entry.get().request == request.id => {
                entry.remove();
                true
            }
            _ => false,
        };

        let Entry::Occupied(mut entry) = self.chains.entry(request.key.clone()) else {
            return Finished::Canceled;
        };
        let chain = entry.get_mut();
        if chain.id != request.chain {
            // a newer chain for the same key, ours is long gone
            return Finished::Canceled;
        }

        let was_waiting = chain.waiters.remove(&request.id);
        if chain.waiters.is_empty() {
            entry.remove();
        }
        match (was_waiting, current) {
            (false, _) => Finished::Canceled,
            (true, true) => Finished::Current,
            (true, false) => Finished::Superseded,
        }
    }
}
