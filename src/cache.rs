use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, ResponseCode};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

const DEFAULT_SHARDS: usize = 256;
const DEFAULT_TTL: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Sentinel index for the intrusive list.
const NIL: usize = usize::MAX;

/// Lookup key for a query: first question, name folded to a lowercase
/// FQDN so case variants share an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    name: String,
    qtype: u16,
    qclass: u16,
}

impl CacheKey {
    pub fn from_message(msg: &Message) -> Option<Self> {
        let q = msg.queries().first()?;
        Some(Self {
            name: q.name().to_lowercase().to_string(),
            qtype: u16::from(q.query_type()),
            qclass: u16::from(q.query_class()),
        })
    }

    /// FNV-1a 64 over the key bytes; low bits route to a shard, and
    /// the pipeline reuses the full value for in-flight dedupe.
    pub(crate) fn hash64(&self) -> u64 {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        let mut step = |b: u8| {
            h ^= u64::from(b);
            h = h.wrapping_mul(0x0000_0100_0000_01b3);
        };
        for b in self.name.as_bytes() {
            step(*b);
        }
        for b in self.qtype.to_be_bytes() {
            step(b);
        }
        for b in self.qclass.to_be_bytes() {
            step(b);
        }
        h
    }
}

struct Node {
    key: CacheKey,
    msg: Message,
    expires_at: Instant,
    prev: usize,
    next: usize,
}

/// One shard: hash map into a slab of list nodes, MRU at the front.
/// The map holds slot indices, never owning references, so moves and
/// evictions are pointer surgery on `prev`/`next`.
struct Shard {
    map: FxHashMap<CacheKey, usize>,
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    capacity: usize,
}

impl Shard {
    fn new(capacity: usize) -> Self {
        Self {
            map: FxHashMap::default(),
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            capacity,
        }
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn get(&mut self, key: &CacheKey, now: Instant) -> Option<Message> {
        let idx = *self.map.get(key)?;
        if self.slots[idx].as_ref().expect("mapped slot").expires_at <= now {
            self.remove_idx(idx);
            return None;
        }
        self.unlink(idx);
        self.push_front(idx);
        Some(self.slots[idx].as_ref().expect("mapped slot").msg.clone())
    }

    fn insert(&mut self, key: CacheKey, msg: Message, expires_at: Instant) {
        if let Some(&idx) = self.map.get(&key) {
            let node = self.slots[idx].as_mut().expect("mapped slot");
            node.msg = msg;
            node.expires_at = expires_at;
            self.unlink(idx);
            self.push_front(idx);
            return;
        }

        if self.map.len() >= self.capacity {
            let oldest = self.tail;
            if oldest != NIL {
                self.remove_idx(oldest);
            }
        }

        let node = Node {
            key: key.clone(),
            msg,
            expires_at,
            prev: NIL,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.push_front(idx);
        self.map.insert(key, idx);
    }

    fn remove_idx(&mut self, idx: usize) {
        self.unlink(idx);
        let node = self.slots[idx].take().expect("mapped slot");
        self.map.remove(&node.key);
        self.free.push(idx);
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| {
                slot.as_ref()
                    .filter(|node| node.expires_at <= now)
                    .map(|_| idx)
            })
            .collect();
        let removed = expired.len();
        for idx in expired {
            self.remove_idx(idx);
        }
        removed
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.slots[idx].as_ref().expect("mapped slot");
            (node.prev, node.next)
        };
        match prev {
            NIL => {
                if self.head == idx {
                    self.head = next;
                }
            }
            p => self.slots[p].as_mut().expect("linked slot").next = next,
        }
        match next {
            NIL => {
                if self.tail == idx {
                    self.tail = prev;
                }
            }
            n => self.slots[n].as_mut().expect("linked slot").prev = prev,
        }
        let node = self.slots[idx].as_mut().expect("mapped slot");
        node.prev = NIL;
        node.next = NIL;
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.slots[idx].as_mut().expect("mapped slot");
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head != NIL {
            self.slots[old_head].as_mut().expect("linked slot").prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    /// Walks the list front to back. Test support.
    #[cfg(test)]
    fn list_keys(&self) -> Vec<CacheKey> {
        let mut keys = Vec::new();
        let mut idx = self.head;
        while idx != NIL {
            let node = self.slots[idx].as_ref().expect("linked slot");
            keys.push(node.key.clone());
            idx = node.next;
        }
        keys
    }
}

/// Sharded TTL cache with per-shard LRU eviction. Get mutates recency
/// order, so shards sit behind plain mutexes; shards are independent
/// and never locked together.
pub struct DnsCache {
    enabled: bool,
    shards: Vec<Mutex<Shard>>,
    shard_mask: u64,
    default_ttl: Duration,
    min_ttl: Duration,
    neg_ttl: Duration,
    stop_tx: watch::Sender<bool>,
}

impl DnsCache {
    pub fn new(size: usize, shards: usize, min_ttl: u64, neg_ttl: u64) -> Self {
        let shard_count = if shards < 1 { DEFAULT_SHARDS } else { shards }.next_power_of_two();
        let shard_capacity = size.div_ceil(shard_count).max(1);

        let (stop_tx, _) = watch::channel(false);
        Self {
            enabled: size > 0,
            shards: (0..shard_count)
                .map(|_| Mutex::new(Shard::new(shard_capacity)))
                .collect(),
            shard_mask: (shard_count - 1) as u64,
            default_ttl: DEFAULT_TTL,
            min_ttl: Duration::from_secs(min_ttl),
            neg_ttl: Duration::from_secs(neg_ttl),
            stop_tx,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Deep copy of the stored response, or a miss. Expired entries are
    /// removed on sight.
    pub fn get(&self, req: &Message) -> Option<Message> {
        if !self.enabled {
            return None;
        }
        let key = CacheKey::from_message(req)?;
        let shard = &self.shards[(key.hash64() & self.shard_mask) as usize];
        shard.lock().get(&key, Instant::now())
    }

    /// Stores a deep copy of the response under its question key.
    /// Messages without a question are ignored.
    pub fn set(&self, resp: &Message) {
        if !self.enabled {
            return;
        }
        let Some(key) = CacheKey::from_message(resp) else {
            return;
        };
        let ttl = self.compute_ttl(resp);
        let shard = &self.shards[(key.hash64() & self.shard_mask) as usize];
        shard.lock().insert(key, resp.clone(), Instant::now() + ttl);
    }

    fn compute_ttl(&self, resp: &Message) -> Duration {
        match resp.response_code() {
            ResponseCode::NXDomain | ResponseCode::ServFail => self.neg_ttl,
            _ => {
                let min_found = resp.answers().iter().map(|r| r.ttl()).min().unwrap_or(0);
                let mut ttl = if min_found > 0 {
                    Duration::from_secs(u64::from(min_found))
                } else {
                    self.default_ttl
                };
                if ttl < self.min_ttl {
                    ttl = self.min_ttl;
                }
                ttl
            }
        }
    }

    /// Spawns the background expiry task. One per cache; runs until
    /// `stop` is called. No-op when the cache is disabled.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        if !self.enabled {
            return;
        }
        let cache = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(Instant::now() + SWEEP_INTERVAL, SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        let mut removed = 0;
                        for shard in &cache.shards {
                            removed += shard.lock().sweep(now);
                        }
                        if removed > 0 {
                            debug!(target = "cache", removed, "expired entries swept");
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        });
    }

    /// Signals the sweeper to exit. Called once when the owning
    /// snapshot is retired; meaningful only for an enabled cache.
    pub fn stop(&self) {
        if self.enabled {
            let _ = self.stop_tx.send(true);
        }
    }

    #[cfg(test)]
    fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[cfg(test)]
    fn total_len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}
