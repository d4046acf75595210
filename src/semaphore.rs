//! Per-key counting semaphores used to cap per-host fetch concurrency.
//!
//! An entry is created the first time a key is acquired and reaped once the
//! last holder releases it. Capacity is first-writer-wins: whichever
//! `acquire` call creates the entry decides `max` for every later caller of
//! that key, even if they pass a different value. This mirrors a known quirk
//! of the limiter this type is modeled on and is preserved deliberately
//! rather than "fixed" (see DESIGN.md).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

struct Entry {
    max: u32,
    value: AtomicU32,
    refs: AtomicU32,
    notify: Notify,
}

type EntryMap = Arc<Mutex<HashMap<String, Arc<Entry>>>>;

/// A map of named counting semaphores.
///
/// ```
/// # use swarmfetch::semaphore::KeyedSemaphoreMap;
/// # #[tokio::main]
/// # async fn main() {
/// let map = KeyedSemaphoreMap::new();
/// let guard = map.acquire("example.com", 2).await;
/// drop(guard);
/// # }
/// ```
#[derive(Clone, Default)]
pub struct KeyedSemaphoreMap {
    entries: EntryMap,
}

/// RAII guard returned by [`KeyedSemaphoreMap::acquire`]. Releases the slot
/// on drop.
pub struct SemaphoreGuard {
    entries: EntryMap,
    key: String,
    entry: Arc<Entry>,
}

impl KeyedSemaphoreMap {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Acquires one slot for `key`, creating the entry with capacity `max`
    /// if it does not already exist. Blocks until a slot is free.
    pub async fn acquire(&self, key: &str, max: u32) -> SemaphoreGuard {
        let entry = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries
                .entry(key.to_string())
                .or_insert_with(|| {
                    Arc::new(Entry {
                        max,
                        value: AtomicU32::new(0),
                        refs: AtomicU32::new(0),
                        notify: Notify::new(),
                    })
                })
                .clone();
            entry.refs.fetch_add(1, Ordering::SeqCst);
            entry
        };

        loop {
            let current = entry.value.load(Ordering::SeqCst);
            if current >= entry.max {
                entry.notify.notified().await;
                continue;
            }
            if entry
                .value
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        SemaphoreGuard {
            entries: self.entries.clone(),
            key: key.to_string(),
            entry,
        }
    }

    /// Snapshot used only for status reporting: (distinct keys, total
    /// outstanding holders across all keys).
    pub async fn size(&self) -> (usize, u32) {
        let entries = self.entries.lock().unwrap();
        let total = entries.values().map(|e| e.value.load(Ordering::SeqCst)).sum();
        (entries.len(), total)
    }
}

fn release(entries: &EntryMap, key: &str, entry: &Entry) {
    {
        let mut entries = entries.lock().unwrap();
        let remaining = entry.refs.fetch_sub(1, Ordering::SeqCst).wrapping_sub(1);
        if remaining == 0 {
            entries.remove(key);
        } else if remaining == u32::MAX {
            panic!("KeyedSemaphoreMap: release without a matching acquire for {key:?}");
        }
    }

    let prev = entry.value.fetch_sub(1, Ordering::SeqCst);
    if prev == 0 {
        panic!("KeyedSemaphoreMap: semaphore value went negative for {key:?}");
    }
    entry.notify.notify_one();
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        release(&self.entries, &self.key, &self.entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_release_cycles() {
        let map = KeyedSemaphoreMap::new();
        let g1 = map.acquire("h", 1).await;
        let (keys, holders) = map.size().await;
        assert_eq!(keys, 1);
        assert_eq!(holders, 1);
        drop(g1);
        let (keys, holders) = map.size().await;
        assert_eq!(keys, 0);
        assert_eq!(holders, 0);
    }

    #[tokio::test]
    async fn second_acquire_blocks_until_release() {
        let map = KeyedSemaphoreMap::new();
        let g1 = map.acquire("h", 1).await;

        let map2 = map.clone();
        let handle = tokio::spawn(async move {
            let _g2 = map2.acquire("h", 1).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        drop(g1);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn first_writer_wins_capacity() {
        let map = KeyedSemaphoreMap::new();
        let _g1 = map.acquire("h", 1).await;
        // second acquire names a larger max, but the entry already exists
        // with max=1, so this call still blocks behind g1.
        let map2 = map.clone();
        let handle = tokio::spawn(async move {
            let _g2 = map2.acquire("h", 5).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        drop(_g1);
        handle.await.unwrap();
    }
}
