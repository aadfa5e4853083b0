use std::collections::HashMap;
use std::sync::Arc;

use manager_sdk::protocol::WorkerType;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, info, warn};

use super::hash::{murmur3_32, HashRing};
use super::{RunConfig, Worker, WorkerError, WorkerSnapshot};
use crate::metrics::{REGISTERED_WORKERS, WORKER_SELECTIONS};

#[derive(Default)]
struct PoolState {
    workers: HashMap<String, Arc<dyn Worker>>,
    /// Registration order per type.
    by_type: HashMap<WorkerType, Vec<String>>,
    rings: HashMap<WorkerType, HashRing>,
}

impl PoolState {
    fn candidates(&self, order: Vec<&str>) -> Vec<Arc<dyn Worker>> {
        order
            .into_iter()
            .filter_map(|id| self.workers.get(id).cloned())
            .collect()
    }
}

/// Workers known to this manager, grouped by type and placed on one hash ring
/// per type.
#[derive(Default)]
pub struct WorkerPool {
    state: RwLock<PoolState>,
}

fn usable(worker: &Arc<dyn Worker>) -> bool {
    worker.is_healthy() && worker.is_accepting_jobs()
}

impl WorkerPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Starts the worker and adds it. Registering a known id is a no-op that
    /// returns `false`.
    pub async fn register_worker(&self, worker: Arc<dyn Worker>) -> Result<bool, WorkerError> {
        let id = worker.worker_id().to_string();
        if self.state.read().workers.contains_key(&id) {
            debug!(worker_id = %id, "worker already registered");
            return Ok(false);
        }

        worker.start().await?;

        let duplicate = {
            let mut state = self.state.write();
            if state.workers.contains_key(&id) {
                true
            } else {
                let worker_type = worker.worker_type();
                state.workers.insert(id.clone(), Arc::clone(&worker));
                state.by_type.entry(worker_type).or_default().push(id.clone());
                state.rings.entry(worker_type).or_default().insert(&id);
                REGISTERED_WORKERS.set(state.workers.len() as i64);
                false
            }
        };
        if duplicate {
            // Lost a registration race; the winner's transport stays.
            worker.stop().await;
            return Ok(false);
        }
        info!(
            worker_id = %id,
            worker_type = %worker.worker_type(),
            address = %worker.address(),
            standalone = worker.is_standalone(),
            "worker registered"
        );
        Ok(true)
    }

    pub fn get_worker(&self, id: &str) -> Option<Arc<dyn Worker>> {
        self.state.read().workers.get(id).cloned()
    }

    pub fn list_workers(&self) -> Vec<Arc<dyn Worker>> {
        let state = self.state.read();
        let mut types: Vec<_> = state.by_type.keys().copied().collect();
        types.sort();
        types
            .into_iter()
            .flat_map(|t| state.by_type[&t].iter())
            .filter_map(|id| state.workers.get(id).cloned())
            .collect()
    }

    pub fn list_workers_by_type(&self, worker_type: WorkerType) -> Vec<Arc<dyn Worker>> {
        let state = self.state.read();
        state
            .by_type
            .get(&worker_type)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.workers.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn worker_count(&self) -> usize {
        self.state.read().workers.len()
    }

    pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
        self.list_workers().iter().map(|w| w.snapshot()).collect()
    }

    pub fn connection_hash(&self, run: &RunConfig) -> Vec<u8> {
        run.connection_hash()
    }

    /// First healthy, accepting worker at or after the key's ring position.
    ///
    /// Workers sit on a ring of virtual nodes rather than at `hash % len`,
    /// so removing one worker only remaps the keys that landed on it.
    pub fn pick_worker_by_hash(
        &self,
        worker_type: WorkerType,
        key: &[u8],
    ) -> Option<Arc<dyn Worker>> {
        let candidates = {
            let state = self.state.read();
            let ring = state.rings.get(&worker_type)?;
            state.candidates(ring.walk(murmur3_32(key, 0)))
        };
        let picked = candidates.into_iter().find(usable);
        record_selection(worker_type, "hash", picked.is_some());
        picked
    }

    /// Same probe as [`WorkerPool::pick_worker_by_hash`] from a random point.
    pub fn pick_worker_randomly(&self, worker_type: WorkerType) -> Option<Arc<dyn Worker>> {
        let candidates = {
            let state = self.state.read();
            let ring = state.rings.get(&worker_type)?;
            if ring.is_empty() {
                return None;
            }
            let start = rand::thread_rng().gen_range(0..ring.point_count());
            state.candidates(ring.walk_from_index(start))
        };
        let picked = candidates.into_iter().find(usable);
        record_selection(worker_type, "random", picked.is_some());
        picked
    }

    /// Removes the worker and stops it in the background.
    pub fn unregister_worker(&self, id: &str) -> Option<Arc<dyn Worker>> {
        let removed = {
            let mut state = self.state.write();
            let removed = state.workers.remove(id)?;
            let worker_type = removed.worker_type();
            if let Some(ids) = state.by_type.get_mut(&worker_type) {
                ids.retain(|existing| existing != id);
            }
            if let Some(ring) = state.rings.get_mut(&worker_type) {
                ring.remove(id);
            }
            REGISTERED_WORKERS.set(state.workers.len() as i64);
            removed
        };
        info!(worker_id = %id, "worker unregistered");
        let worker = Arc::clone(&removed);
        tokio::spawn(async move { worker.stop().await });
        Some(removed)
    }

    /// Called when a worker's transport drops. Standalone workers stay.
    pub fn self_unregister_worker(&self, id: &str) -> bool {
        match self.get_worker(id) {
            Some(worker) if worker.is_standalone() => {
                warn!(worker_id = %id, "standalone worker lost its connection; keeping it registered");
                false
            }
            Some(_) => self.unregister_worker(id).is_some(),
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let workers: Vec<_> = {
            let mut state = self.state.write();
            state.by_type.clear();
            state.rings.clear();
            state.workers.drain().map(|(_, w)| w).collect()
        };
        REGISTERED_WORKERS.set(0);
        for worker in workers {
            worker.stop().await;
        }
    }
}

fn record_selection(worker_type: WorkerType, strategy: &str, found: bool) {
    let result = match (strategy, found) {
        (_, false) => "none",
        ("hash", true) => "hash",
        _ => "random",
    };
    WORKER_SELECTIONS
        .with_label_values(&[worker_type.as_str(), result])
        .inc();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::workers::{WorkerConnection, WorkerConnectionInput};

    struct StubWorker {
        id: String,
        standalone: bool,
        healthy: AtomicBool,
        starts: AtomicUsize,
        stopped: AtomicBool,
    }

    impl StubWorker {
        fn new(id: &str) -> Arc<Self> {
            Self::build(id, false)
        }

        fn build(id: &str, standalone: bool) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                standalone,
                healthy: AtomicBool::new(true),
                starts: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Worker for StubWorker {
        fn worker_id(&self) -> &str {
            &self.id
        }

        fn worker_type(&self) -> WorkerType {
            WorkerType::Container
        }

        fn address(&self) -> &str {
            "stub://"
        }

        fn is_standalone(&self) -> bool {
            self.standalone
        }

        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        fn is_accepting_jobs(&self) -> bool {
            true
        }

        async fn start(&self) -> Result<(), WorkerError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        async fn create_connection(
            &self,
            _input: WorkerConnectionInput,
        ) -> Result<Arc<dyn WorkerConnection>, WorkerError> {
            Err(WorkerError::Unsupported("create_connection"))
        }
    }

    async fn pool_with(ids: &[&str]) -> (WorkerPool, Vec<Arc<StubWorker>>) {
        let pool = WorkerPool::default();
        let mut workers = Vec::new();
        for id in ids {
            let worker = StubWorker::new(id);
            assert!(pool.register_worker(worker.clone()).await.unwrap());
            workers.push(worker);
        }
        (pool, workers)
    }

    #[tokio::test]
    async fn register_is_idempotent_by_id() {
        let (pool, workers) = pool_with(&["w1"]).await;
        assert!(!pool.register_worker(StubWorker::new("w1")).await.unwrap());
        assert_eq!(pool.worker_count(), 1);
        assert_eq!(workers[0].starts.load(Ordering::SeqCst), 1);
        assert_eq!(pool.list_workers_by_type(WorkerType::Container).len(), 1);
        assert!(pool.list_workers_by_type(WorkerType::Remote).is_empty());
    }

    #[tokio::test]
    async fn hash_pick_is_stable_while_set_unchanged() {
        let (pool, _) = pool_with(&["w1", "w2", "w3", "w4"]).await;
        let first = pool
            .pick_worker_by_hash(WorkerType::Container, b"demo:latest")
            .unwrap();
        for _ in 0..20 {
            let again = pool
                .pick_worker_by_hash(WorkerType::Container, b"demo:latest")
                .unwrap();
            assert_eq!(again.worker_id(), first.worker_id());
        }
    }

    #[tokio::test]
    async fn removing_a_worker_moves_about_one_in_n_keys() {
        let ids: Vec<String> = (0..8).map(|n| format!("w{n}")).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let (pool, _) = pool_with(&refs).await;
        let keys: Vec<String> = (0..4000).map(|n| format!("registry/image-{n}:1.0")).collect();
        let before: Vec<String> = keys
            .iter()
            .map(|k| {
                pool.pick_worker_by_hash(WorkerType::Container, k.as_bytes())
                    .unwrap()
                    .worker_id()
                    .to_string()
            })
            .collect();

        pool.unregister_worker("w5");
        let mut changed = 0;
        for (key, owner) in keys.iter().zip(&before) {
            let now = pool
                .pick_worker_by_hash(WorkerType::Container, key.as_bytes())
                .unwrap();
            if now.worker_id() != owner {
                assert_eq!(owner, "w5", "key {key} moved off a surviving worker");
                changed += 1;
            }
        }
        let fraction = changed as f64 / keys.len() as f64;
        assert!(fraction < 2.0 / 8.0, "changed fraction {fraction}");
    }

    #[tokio::test]
    async fn unhealthy_pick_falls_through_to_next_in_ring() {
        let (pool, workers) = pool_with(&["w1", "w2", "w3"]).await;
        let first = pool
            .pick_worker_by_hash(WorkerType::Container, b"demo:latest")
            .unwrap();
        let victim = workers
            .iter()
            .find(|w| w.id == first.worker_id())
            .unwrap();
        victim.healthy.store(false, Ordering::SeqCst);

        let next = pool
            .pick_worker_by_hash(WorkerType::Container, b"demo:latest")
            .unwrap();
        assert_ne!(next.worker_id(), first.worker_id());

        for worker in &workers {
            worker.healthy.store(false, Ordering::SeqCst);
        }
        assert!(pool
            .pick_worker_by_hash(WorkerType::Container, b"demo:latest")
            .is_none());
        assert!(pool.pick_worker_randomly(WorkerType::Container).is_none());
    }

    #[tokio::test]
    async fn random_pick_only_returns_usable_workers() {
        let (pool, workers) = pool_with(&["w1", "w2"]).await;
        workers[0].healthy.store(false, Ordering::SeqCst);
        for _ in 0..20 {
            let picked = pool.pick_worker_randomly(WorkerType::Container).unwrap();
            assert_eq!(picked.worker_id(), "w2");
        }
        assert!(pool.pick_worker_randomly(WorkerType::Launcher).is_none());
    }

    #[tokio::test]
    async fn self_unregister_skips_standalone_workers() {
        let pool = WorkerPool::default();
        let standalone = StubWorker::build("fixed", true);
        let dynamic = StubWorker::new("dyn");
        pool.register_worker(standalone.clone()).await.unwrap();
        pool.register_worker(dynamic.clone()).await.unwrap();

        assert!(!pool.self_unregister_worker("fixed"));
        assert!(pool.self_unregister_worker("dyn"));
        assert!(!pool.self_unregister_worker("dyn"));
        assert!(pool.get_worker("fixed").is_some());
        assert!(pool.get_worker("dyn").is_none());

        for _ in 0..50 {
            if dynamic.stopped.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(dynamic.stopped.load(Ordering::SeqCst));
    }
}
