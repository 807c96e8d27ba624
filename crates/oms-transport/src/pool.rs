//! Connection reuse
//!
//! [`LruCache`] is a plain fixed-capacity LRU; [`ClientPool`] wraps one in a
//! mutex, keyed by [`pool_key`], and closes clients as they fall out. Close
//! always happens after the lock is released.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::client::{Client, ClientConfig};
use crate::error::Result;

/// Default number of live connections kept
pub const DEFAULT_POOL_CAPACITY: usize = 1000;

/// Stable 64-bit key for `host:port`.
///
/// IPv4 literals map directly (address in the high half, port in the low);
/// anything else is hashed.
pub fn pool_key(host: &str, port: u16) -> u64 {
    match host.parse::<Ipv4Addr>() {
        Ok(ip) => (u64::from(u32::from(ip)) << 32) | u64::from(port),
        Err(_) => {
            let digest = Sha256::digest(format!("{host}:{port}").as_bytes());
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&digest[..8]);
            u64::from_be_bytes(bytes)
        }
    }
}

struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Fixed-capacity least-recently-used map.
///
/// Entries live in a slot arena linked newest (`head`) to oldest (`tail`).
pub struct LruCache<K, V> {
    capacity: usize,
    index: HashMap<K, usize>,
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K: Hash + Eq + Clone, V> LruCache<K, V> {
    /// `capacity` of zero means unbounded
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Look up and mark as most recently used
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let slot = *self.index.get(key)?;
        self.detach(slot);
        self.push_front(slot);
        self.slots[slot].as_ref().map(|n| &n.value)
    }

    /// Membership test that leaves recency alone
    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Insert or replace, marking the entry most recently used.
    ///
    /// Returns the value pushed out: the previous value for `key`, or the
    /// evicted oldest entry when the cache was full.
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        if let Some(&slot) = self.index.get(&key) {
            self.detach(slot);
            self.push_front(slot);
            let node = self.slots[slot].as_mut()?;
            return Some(std::mem::replace(&mut node.value, value));
        }

        let node = Node {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, slot);
        self.push_front(slot);

        if self.capacity != 0 && self.index.len() > self.capacity {
            return self.remove_oldest().map(|(_, v)| v);
        }
        None
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.index.remove(key)?;
        self.take(slot).map(|(_, v)| v)
    }

    pub fn remove_oldest(&mut self) -> Option<(K, V)> {
        let slot = self.tail?;
        let (key, value) = self.take(slot)?;
        self.index.remove(&key);
        Some((key, value))
    }

    /// Keys from oldest to newest
    pub fn keys(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.tail;
        while let Some(slot) = cursor {
            let Some(node) = self.slots[slot].as_ref() else {
                break;
            };
            keys.push(node.key.clone());
            cursor = node.prev;
        }
        keys
    }

    /// Empty the cache, handing back every value
    pub fn clear(&mut self) -> Vec<V> {
        let values = self
            .slots
            .drain(..)
            .flatten()
            .map(|n| n.value)
            .collect();
        self.index.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        values
    }

    fn take(&mut self, slot: usize) -> Option<(K, V)> {
        self.detach(slot);
        let node = self.slots[slot].take()?;
        self.free.push(slot);
        Some((node.key, node.value))
    }

    fn detach(&mut self, slot: usize) {
        let Some(node) = self.slots[slot].as_mut() else {
            return;
        };
        let (prev, next) = (node.prev.take(), node.next.take());
        match prev {
            Some(p) => {
                if let Some(n) = self.slots[p].as_mut() {
                    n.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.slots[n].as_mut() {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(node) = self.slots[slot].as_mut() {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(node) = self.slots[h].as_mut() {
                node.prev = Some(slot);
            }
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }
}

/// What the pool needs from a connection
#[async_trait]
pub trait PooledClient: Send + Sync + 'static {
    async fn connect(config: ClientConfig) -> Result<Arc<Self>>
    where
        Self: Sized;

    /// Cheap liveness check run before a cached client is handed out
    async fn ping(&self) -> Result<()>;

    async fn close(&self);
}

#[async_trait]
impl PooledClient for Client {
    async fn connect(config: ClientConfig) -> Result<Arc<Self>> {
        Client::connect(config).await
    }

    async fn ping(&self) -> Result<()> {
        Client::ping(self).await
    }

    async fn close(&self) {
        Client::close(self).await
    }
}

/// Shared, bounded set of live connections
pub struct ClientPool<C: PooledClient = Client> {
    cache: Mutex<LruCache<u64, Arc<C>>>,
}

impl<C: PooledClient> Default for ClientPool<C> {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl<C: PooledClient> ClientPool<C> {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Cached client for `config` if it still answers, otherwise a fresh one.
    pub async fn get_or_connect(&self, config: &ClientConfig) -> Result<Arc<C>> {
        let key = pool_key(&config.host, config.port);

        let cached = self.cache.lock().get(&key).cloned();
        if let Some(client) = cached {
            match client.ping().await {
                Ok(()) => return Ok(client),
                Err(e) => {
                    tracing::debug!(host = %config.address(), "pooled client is dead: {}", e);
                    self.remove_client(key, &client).await;
                }
            }
        }

        let client = C::connect(config.clone()).await?;
        Ok(self.insert_or_existing(key, client).await)
    }

    /// Keep the first client stored under `key`; a racing duplicate is closed.
    async fn insert_or_existing(&self, key: u64, client: Arc<C>) -> Arc<C> {
        let (kept, displaced) = {
            let mut cache = self.cache.lock();
            match cache.get(&key).cloned() {
                Some(existing) => (existing, Some(client)),
                None => {
                    let evicted = cache.put(key, Arc::clone(&client));
                    (client, evicted)
                }
            }
        };
        if let Some(old) = displaced {
            old.close().await;
        }
        kept
    }

    /// Insert, closing whatever the insert pushed out
    pub async fn insert(&self, key: u64, client: Arc<C>) {
        let displaced = self.cache.lock().put(key, client);
        if let Some(old) = displaced {
            old.close().await;
        }
    }

    pub fn get(&self, key: u64) -> Option<Arc<C>> {
        self.cache.lock().get(&key).cloned()
    }

    pub fn contains(&self, key: u64) -> bool {
        self.cache.lock().contains(&key)
    }

    /// Drop and close the client under `key`
    pub async fn remove(&self, key: u64) {
        let removed = self.cache.lock().remove(&key);
        if let Some(client) = removed {
            client.close().await;
        }
    }

    /// Remove `key` only if it still maps to `client`
    async fn remove_client(&self, key: u64, client: &Arc<C>) {
        let removed = {
            let mut cache = self.cache.lock();
            let same = cache
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, client));
            if same {
                cache.remove(&key)
            } else {
                None
            }
        };
        if let Some(client) = removed {
            client.close().await;
        }
    }

    pub fn keys(&self) -> Vec<u64> {
        self.cache.lock().keys()
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    pub async fn close_all(&self) {
        let clients = self.cache.lock().clear();
        for client in clients {
            client.close().await;
        }
    }
}
