//! Least-recently-used store for query results.
//!
//! Keys are composite (player, slot, id) tuples; every read refreshes
//! the entry's recency and eviction removes exactly the
//! oldest-by-last-access entries down to the configured limit. Entries
//! for a (player, slot) pair are dropped wholesale when that slot's
//! media changes. The store is safe for concurrent use from worker
//! threads; any periodic sweep is owned by the caller.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::debug;

use crate::packets::PlayerSlot;

/// Keys that carry a (player, slot) scope for media-change invalidation.
pub trait SlotScoped {
    fn matches_slot(&self, player_number: u8, slot: PlayerSlot) -> bool;
}

impl SlotScoped for (u8, PlayerSlot) {
    fn matches_slot(&self, player_number: u8, slot: PlayerSlot) -> bool {
        self.0 == player_number && self.1 == slot
    }
}

impl SlotScoped for (u8, PlayerSlot, u32) {
    fn matches_slot(&self, player_number: u8, slot: PlayerSlot) -> bool {
        self.0 == player_number && self.1 == slot
    }
}

pub struct DataStore<K, V> {
    entries: Mutex<HashMap<K, (u64, V)>>,
    /// Monotonic access counter; larger means more recently used.
    clock: AtomicU64,
    size_limit: usize,
}

const DEFAULT_SIZE_LIMIT: usize = 15;

impl<K, V> Default for DataStore<K, V>
where
    K: Eq + Hash + Clone + SlotScoped,
    V: Clone,
{
    fn default() -> Self {
        Self::new(DEFAULT_SIZE_LIMIT)
    }
}

impl<K, V> DataStore<K, V>
where
    K: Eq + Hash + Clone + SlotScoped,
    V: Clone,
{
    pub fn new(size_limit: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
            size_limit,
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads refresh the entry's recency.
    pub fn get(&self, key: &K) -> Option<V> {
        let tick = self.tick();
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(key)?;
        entry.0 = tick;
        Some(entry.1.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        let tick = self.tick();
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key, (tick, value));
        Self::evict_locked(&mut entries, self.size_limit);
    }

    /// Drops the oldest entries until the store fits its limit.
    pub fn evict(&self) {
        let mut entries = self.entries.lock().unwrap();
        Self::evict_locked(&mut entries, self.size_limit);
    }

    fn evict_locked(entries: &mut HashMap<K, (u64, V)>, size_limit: usize) {
        while entries.len() > size_limit {
            let oldest = entries
                .iter()
                .min_by_key(|(_, (tick, _))| *tick)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Invalidation on media change (eject/insert).
    pub fn remove_player_slot(&self, player_number: u8, slot: PlayerSlot) {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|key, _| !key.matches_slot(player_number, slot));
        let dropped = before - entries.len();
        if dropped > 0 {
            debug!(player_number, %slot, dropped, "store entries dropped for changed media");
        }
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Key = (u8, PlayerSlot, u32);

    fn key(id: u32) -> Key {
        (1, PlayerSlot::Usb, id)
    }

    #[test]
    fn test_size_limit_evicts_oldest() {
        let store: DataStore<Key, u32> = DataStore::new(3);
        for id in 0..4 {
            store.insert(key(id), id * 10);
        }
        assert_eq!(store.len(), 3);
        // the first-inserted entry was the least recently accessed
        assert_eq!(store.get(&key(0)), None);
        assert_eq!(store.get(&key(3)), Some(30));
    }

    #[test]
    fn test_read_refreshes_recency() {
        let store: DataStore<Key, u32> = DataStore::new(3);
        for id in 0..3 {
            store.insert(key(id), id);
        }
        // touch the oldest entry so the next eviction takes key 1
        assert_eq!(store.get(&key(0)), Some(0));
        store.insert(key(3), 3);
        assert_eq!(store.get(&key(0)), Some(0));
        assert_eq!(store.get(&key(1)), None);
    }

    #[test]
    fn test_media_change_invalidation() {
        let store: DataStore<Key, u32> = DataStore::new(10);
        store.insert((1, PlayerSlot::Usb, 1), 1);
        store.insert((1, PlayerSlot::Sd, 2), 2);
        store.insert((2, PlayerSlot::Usb, 3), 3);
        store.remove_player_slot(1, PlayerSlot::Usb);
        assert_eq!(store.get(&(1, PlayerSlot::Usb, 1)), None);
        assert_eq!(store.get(&(1, PlayerSlot::Sd, 2)), Some(2));
        assert_eq!(store.get(&(2, PlayerSlot::Usb, 3)), Some(3));
    }

    #[test]
    fn test_overwrite_same_key() {
        let store: DataStore<Key, u32> = DataStore::new(2);
        store.insert(key(1), 1);
        store.insert(key(1), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&key(1)), Some(2));
    }
}
