use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::io;
use std::sync::Arc;
use std::thread;

use tokio::sync::{mpsc, oneshot};

/// A single operation on the cache, processed in queue order by the cache worker.
enum Command<K, V> {
    Put { key: K, value: V },
    Get { key: K, reply: oneshot::Sender<Option<V>> },
    Len { reply: oneshot::Sender<usize> },
}

/// An in-memory key/value store with serialized access.
///
/// The backing map is owned by a dedicated worker thread. Every [`put`](Self::put) and
/// [`get`](Self::get) is a message on one FIFO queue, so writes never interleave and a read
/// observes every write that was enqueued before it, regardless of which thread issued it.
///
/// Writes are fire-and-forget, reads wait for their turn in the queue. Values are handed out
/// as clones; the map itself is never exposed.
///
/// Cloning a `SerialCache` yields another handle to the same store. The worker thread exits
/// once the last handle is dropped.
pub struct SerialCache<K, V> {
    name: Arc<str>,
    queue: mpsc::UnboundedSender<Command<K, V>>,
}

impl<K, V> Clone for SerialCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            queue: self.queue.clone(),
        }
    }
}

impl<K, V> fmt::Debug for SerialCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialCache")
            .field("name", &self.name)
            .field("closed", &self.queue.is_closed())
            .finish()
    }
}

impl<K, V> SerialCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Creates a new, empty cache and spawns its worker thread.
    ///
    /// The `name` is used for the worker thread and in log messages.
    pub fn new(name: &str) -> io::Result<Self> {
        let (queue, commands) = mpsc::unbounded_channel();
        let name: Arc<str> = Arc::from(name);

        let worker_name = Arc::clone(&name);
        thread::Builder::new()
            .name(format!("cache-{name}"))
            .spawn(move || run_worker(&worker_name, commands))?;

        Ok(Self { name, queue })
    }

    /// The name this cache was created with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schedules `value` to be stored under `key`, replacing any previous value.
    ///
    /// Returns immediately. The write becomes visible to every read enqueued after this call.
    pub fn put(&self, key: K, value: V) {
        if self.queue.send(Command::Put { key, value }).is_err() {
            tracing::debug!(cache = %self.name, "Dropping write to a closed cache");
        }
    }

    /// Looks up `key`, blocking the current thread until the worker answers.
    ///
    /// # Panics
    ///
    /// Like every blocking call this must not be used from within an asynchronous execution
    /// context. Use [`get_async`](Self::get_async) there.
    pub fn get(&self, key: &K) -> Option<V> {
        let reply = self.request(|reply| Command::Get {
            key: key.clone(),
            reply,
        })?;
        reply.blocking_recv().ok().flatten()
    }

    /// Looks up `key`, waiting for the worker without blocking the thread.
    pub async fn get_async(&self, key: &K) -> Option<V> {
        let reply = self.request(|reply| Command::Get {
            key: key.clone(),
            reply,
        })?;
        reply.await.ok().flatten()
    }

    /// Returns the number of stored entries, blocking the current thread.
    pub fn len(&self) -> usize {
        self.request(|reply| Command::Len { reply })
            .and_then(|reply| reply.blocking_recv().ok())
            .unwrap_or_default()
    }

    /// Returns the number of stored entries.
    pub async fn len_async(&self) -> usize {
        match self.request(|reply| Command::Len { reply }) {
            Some(reply) => reply.await.unwrap_or_default(),
            None => 0,
        }
    }

    /// Returns `true` if the cache holds no entries, blocking the current thread.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command<K, V>,
    ) -> Option<oneshot::Receiver<T>> {
        let (tx, rx) = oneshot::channel();
        match self.queue.send(command(tx)) {
            Ok(()) => Some(rx),
            Err(_) => {
                tracing::debug!(cache = %self.name, "Reading from a closed cache");
                None
            }
        }
    }
}

/// The cache worker loop. Owns the map for its entire lifetime.
fn run_worker<K, V>(name: &str, mut commands: mpsc::UnboundedReceiver<Command<K, V>>)
where
    K: Eq + Hash,
    V: Clone,
{
    let mut entries = HashMap::new();

    while let Some(command) = commands.blocking_recv() {
        match command {
            Command::Put { key, value } => {
                entries.insert(key, value);
            }
            Command::Get { key, reply } => {
                // the reader may have given up waiting, which is fine
                let _ = reply.send(entries.get(&key).cloned());
            }
            Command::Len { reply } => {
                let _ = reply.send(entries.len());
            }
        }
    }

    tracing::trace!(cache = name, entries = entries.len(), "Cache worker terminated");
}
