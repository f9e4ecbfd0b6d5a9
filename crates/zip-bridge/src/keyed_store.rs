//! Injected keyed store with age- and capacity-based eviction.
//!
//! Per-client tables (rate limiters, sessions) live in a [`KeyedStore`]
//! owned by whoever needs them, with time supplied by a [`Clock`].  Tests
//! swap in a [`ManualClock`] to drive ageing deterministically.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Monotonic time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.  Clones share one time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|p| p.into_inner());
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Debug)]
struct Slot<V> {
    value: V,
    inserted_at: Instant,
    last_access: Instant,
}

/// Map with explicit eviction.
///
/// * `max_idle` – entries untouched for longer are dropped by
///   [`KeyedStore::evict_idle`] (and lazily on access).
/// * `capacity` – inserting a new key into a full store first evicts the
///   least recently used entry.
pub struct KeyedStore<K, V> {
    entries: HashMap<K, Slot<V>>,
    max_idle: Option<Duration>,
    capacity: Option<usize>,
    clock: Arc<dyn Clock>,
}

impl<K, V> KeyedStore<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: HashMap::new(),
            max_idle: None,
            capacity: None,
            clock,
        }
    }

    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = Some(max_idle);
        self
    }

    /// A capacity of zero is treated as one.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity.max(1));
        self
    }

    /// Look up `key`, refreshing its access time.  Idle-expired entries are
    /// removed and reported as missing.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let now = self.clock.now();
        if self.is_idle(key, now) {
            self.entries.remove(key);
            return None;
        }
        let slot = self.entries.get_mut(key)?;
        slot.last_access = now;
        Some(&slot.value)
    }

    /// Insert or replace `key`.
    pub fn set(&mut self, key: K, value: V) {
        let now = self.clock.now();
        if !self.entries.contains_key(&key) {
            self.make_room();
        }
        self.entries.insert(
            key,
            Slot {
                value,
                inserted_at: now,
                last_access: now,
            },
        );
    }

    /// Return the value for `key`, inserting `make()` if absent.
    pub fn get_or_insert_with(&mut self, key: K, make: impl FnOnce() -> V) -> &V {
        let now = self.clock.now();
        if self.is_idle(&key, now) {
            self.entries.remove(&key);
        }
        if !self.entries.contains_key(&key) {
            self.make_room();
        }
        let slot = self.entries.entry(key).or_insert_with(|| Slot {
            value: make(),
            inserted_at: now,
            last_access: now,
        });
        slot.last_access = now;
        &slot.value
    }

    /// Drop every entry for which `predicate(key, value, age)` holds, where
    /// `age` is the time since insertion.  Returns how many were removed.
    pub fn evict<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&K, &V, Duration) -> bool,
    {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|k, slot| {
            !predicate(k, &slot.value, now.saturating_duration_since(slot.inserted_at))
        });
        before - self.entries.len()
    }

    /// Drop entries idle for longer than `max_idle`.
    pub fn evict_idle(&mut self) -> usize {
        let Some(max_idle) = self.max_idle else {
            return 0;
        };
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries
            .retain(|_, slot| now.saturating_duration_since(slot.last_access) <= max_idle);
        before - self.entries.len()
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|slot| slot.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    fn is_idle(&self, key: &K, now: Instant) -> bool {
        match (self.max_idle, self.entries.get(key)) {
            (Some(max_idle), Some(slot)) => {
                now.saturating_duration_since(slot.last_access) > max_idle
            }
            _ => false,
        }
    }

    fn make_room(&mut self) {
        let Some(capacity) = self.capacity else {
            return;
        };
        if self.entries.len() < capacity {
            return;
        }
        self.evict_idle();
        while self.entries.len() >= capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, slot)| slot.last_access)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}
