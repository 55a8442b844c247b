//! Per-key deduplication of in-flight work.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::{OnceCell, OwnedMutexGuard};

/// Runs at most one initializer per key at a time and shares its outcome.
///
/// Callers arriving while the work for a key is in flight wait for it and
/// receive the same value, or the same error. Once the work has finished the
/// key is cleared, so the next caller starts fresh.
pub struct Singleflight<K, V, E> {
    cells: Mutex<HashMap<K, Arc<OnceCell<Result<V, Arc<E>>>>>>,
}

impl<K, V, E> Default for Singleflight<K, V, E> {
    fn default() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V, E> Singleflight<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<F, Fut>(&self, key: K, work: F) -> Result<V, Arc<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = {
            let mut cells = self.lock();
            cells.entry(key.clone()).or_default().clone()
        };
        let outcome = cell
            .get_or_init(|| async move { work().await.map_err(Arc::new) })
            .await
            .clone();

        // Only clear the cell this call joined; a newer one may have replaced it.
        let mut cells = self.lock();
        if cells.get(&key).is_some_and(|current| Arc::ptr_eq(current, &cell)) {
            cells.remove(&key);
        }
        outcome
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, Arc<OnceCell<Result<V, Arc<E>>>>>> {
        self.cells.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One async mutex per key, for work that must not overlap but whose
/// output cannot be shared between callers.
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other holder of `key` remains.
    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Entries nobody holds or waits for are dropped.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn race(outcome: Result<u32, String>) -> (Vec<Result<u32, Arc<String>>>, usize) {
        let flight: Arc<Singleflight<&'static str, u32, String>> = Arc::new(Singleflight::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = Arc::clone(&flight);
            let runs = Arc::clone(&runs);
            let outcome = outcome.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run("shard-1", || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        outcome
                    })
                    .await
            }));
        }
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        (results, runs.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let (results, runs) = race(Ok(7)).await;
        assert!(results.iter().all(|r| r.as_ref().ok() == Some(&7)));
        assert_eq!(runs, 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_failure() {
        let (results, runs) = race(Err("boom".to_string())).await;
        assert!(results
            .iter()
            .all(|r| r.as_ref().err().map(|e| e.as_str()) == Some("boom")));
        assert_eq!(runs, 1);
    }

    #[tokio::test]
    async fn test_finished_work_is_not_kept() {
        let flight: Singleflight<u8, u8, &str> = Singleflight::new();
        let first = flight.run(1, || async { Err::<u8, _>("boom") }).await;
        assert_eq!(first.unwrap_err().as_ref(), &"boom");
        let second = flight.run(1, || async { Ok(2) }).await;
        assert_eq!(second.unwrap(), 2);
        let third = flight.run(1, || async { Ok(3) }).await;
        assert_eq!(third.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_keyed_locks_serialize_one_key() {
        let locks: Arc<KeyedLocks<&'static str>> = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("shard-1").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);

        // Other keys are independent.
        let _a = locks.lock("shard-1").await;
        let _b = locks.lock("shard-2").await;
    }
}
