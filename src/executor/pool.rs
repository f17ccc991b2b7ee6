//! Bounded pool of sandbox workers.
//!
//! At most `size` workers are alive at once. `acquire` hands out an idle
//! worker, spawns one if the pool is below its bound, or waits until a lease
//! is released or discarded. Killed workers never re-enter the idle set; the
//! slot is refilled lazily by the next `acquire`. A slot reserved for a spawn
//! is given back if the spawn fails or the acquiring future is dropped.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

use super::protocol::{HostMessage, WorkerMessage};
use super::worker::{WorkerHandle, WorkerSpawner};
use super::ExecutionError;

/// Pool sizing and timing.
#[derive(Clone, Debug)]
pub struct PoolOptions {
    /// Upper bound on live workers.
    pub size: usize,
    /// Workers started by [`WorkerPool::prewarm`].
    pub prewarm: usize,
    /// How long `acquire` may wait for a free slot; `None` waits forever.
    pub acquire_timeout: Option<Duration>,
    /// How long a new worker has to send `ready`.
    pub handshake_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: 4,
            prewarm: 0,
            acquire_timeout: None,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

struct PoolState {
    idle: Vec<WorkerHandle>,
    closed: bool,
}

/// Bounded set of reusable workers.
pub struct WorkerPool {
    spawner: Arc<dyn WorkerSpawner>,
    options: PoolOptions,
    state: Mutex<PoolState>,
    available: Notify,
    live: AtomicUsize,
    busy: AtomicUsize,
    next_id: AtomicU64,
}

impl WorkerPool {
    /// Pool creating workers through `spawner`.
    pub fn new(spawner: Arc<dyn WorkerSpawner>, options: PoolOptions) -> Arc<Self> {
        Arc::new(Self {
            spawner,
            options: PoolOptions {
                size: options.size.max(1),
                ..options
            },
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                closed: false,
            }),
            available: Notify::new(),
            live: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        })
    }

    /// Upper bound on live workers.
    pub fn size(&self) -> usize {
        self.options.size
    }

    /// Workers waiting for a script.
    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Workers alive, idle or leased.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Workers currently leased.
    pub fn busy_count(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// Starts workers until `prewarm` are idle or the bound is reached.
    /// Returns how many were started.
    pub async fn prewarm(&self) -> Result<usize, ExecutionError> {
        let target = self.options.prewarm.min(self.options.size);
        let mut started = 0;
        while self.idle_count() < target {
            let Some(slot) = self.reserve_slot() else {
                break;
            };
            let worker = self.start_worker(slot).await?;
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                self.retire(worker);
                return Err(ExecutionError::PoolClosed);
            }
            state.idle.push(worker);
            started += 1;
        }
        debug!(started, "pool prewarmed");
        Ok(started)
    }

    /// Leases a worker, waiting while the pool is exhausted.
    pub async fn acquire(self: &Arc<Self>) -> Result<WorkerLease, ExecutionError> {
        let deadline = self.options.acquire_timeout.map(|limit| Instant::now() + limit);
        loop {
            let notified = self.available.notified();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(ExecutionError::PoolClosed);
                }
                if let Some(worker) = state.idle.pop() {
                    return Ok(self.lease(worker));
                }
            }
            if let Some(slot) = self.reserve_slot() {
                let worker = self.start_worker(slot).await?;
                if self.state.lock().closed {
                    self.retire(worker);
                    return Err(ExecutionError::PoolClosed);
                }
                return Ok(self.lease(worker));
            }
            match deadline {
                None => notified.await,
                Some(limit) => {
                    let now = Instant::now();
                    if now >= limit {
                        return Err(ExecutionError::AcquireTimeout);
                    }
                    tokio::select! {
                        _ = notified => {}
                        _ = sleep(limit - now) => return Err(ExecutionError::AcquireTimeout),
                    }
                }
            }
        }
    }

    /// Refuses new leases and stops every idle worker. Leased workers are
    /// stopped when their lease ends.
    pub fn shutdown(&self) {
        let idle = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        for worker in idle {
            let _ = worker.send(HostMessage::Shutdown);
            self.retire(worker);
        }
        self.available.notify_waiters();
        debug!("pool shut down");
    }

    fn reserve_slot(&self) -> Option<SlotReservation<'_>> {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < self.options.size).then_some(live + 1)
            })
            .ok()
            .map(|_| SlotReservation {
                pool: self,
                armed: true,
            })
    }

    /// Spawns into `slot` and waits for the handshake. The slot passes to
    /// the worker only once it is ready.
    async fn start_worker(&self, slot: SlotReservation<'_>) -> Result<WorkerHandle, ExecutionError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut worker = self.spawner.spawn(id).await?;
        let failure = match timeout(self.options.handshake_timeout, worker.recv()).await {
            Ok(Ok(WorkerMessage::Ready { pid })) => {
                debug!(worker = id, pid, "worker ready");
                slot.keep();
                return Ok(worker);
            }
            Ok(Ok(_)) => format!("worker {id} skipped its handshake"),
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!("worker {id} did not become ready"),
        };
        worker.kill();
        Err(ExecutionError::Spawn(failure))
    }

    fn lease(self: &Arc<Self>, worker: WorkerHandle) -> WorkerLease {
        self.busy.fetch_add(1, Ordering::SeqCst);
        WorkerLease {
            pool: Arc::clone(self),
            worker: Some(worker),
        }
    }

    fn release(&self, worker: WorkerHandle) {
        self.busy.fetch_sub(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            let _ = worker.send(HostMessage::Shutdown);
            self.retire(worker);
            return;
        }
        state.idle.push(worker);
        drop(state);
        self.available.notify_one();
    }

    fn discard(&self, worker: WorkerHandle) {
        self.busy.fetch_sub(1, Ordering::SeqCst);
        self.retire(worker);
    }

    fn retire(&self, worker: WorkerHandle) {
        debug!(worker = worker.id(), "discarding worker");
        worker.kill();
        self.free_slot();
    }

    fn free_slot(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.available.notify_one();
    }
}

/// A live slot claimed for a worker that is still starting.
struct SlotReservation<'a> {
    pool: &'a WorkerPool,
    armed: bool,
}

impl SlotReservation<'_> {
    /// Hands the slot to a ready worker.
    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.free_slot();
        }
    }
}

/// Exclusive use of one worker. Dropping a lease without calling
/// [`WorkerLease::release`] kills the worker.
pub struct WorkerLease {
    pool: Arc<WorkerPool>,
    worker: Option<WorkerHandle>,
}

impl WorkerLease {
    /// Leased worker's id.
    pub fn id(&self) -> u64 {
        self.worker.as_ref().map(WorkerHandle::id).unwrap_or(0)
    }

    /// Sends to the leased worker.
    pub fn send(&self, message: HostMessage) -> Result<(), ExecutionError> {
        match &self.worker {
            Some(worker) => worker.send(message),
            None => Err(ExecutionError::PoolClosed),
        }
    }

    /// Receives from the leased worker.
    pub async fn recv(&mut self) -> Result<WorkerMessage, ExecutionError> {
        match &mut self.worker {
            Some(worker) => worker.recv().await,
            None => Err(ExecutionError::PoolClosed),
        }
    }

    /// Returns a healthy worker to the idle set.
    pub fn release(mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.release(worker);
        }
    }

    /// Kills the worker and frees its slot.
    pub fn kill(mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.discard(worker);
        }
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.discard(worker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::worker::ThreadSpawner;
    use async_trait::async_trait;

    /// Spawns thread workers after a delay.
    struct SlowSpawner(Duration);

    #[async_trait]
    impl WorkerSpawner for SlowSpawner {
        async fn spawn(&self, id: u64) -> Result<WorkerHandle, ExecutionError> {
            sleep(self.0).await;
            ThreadSpawner.spawn(id).await
        }
    }

    fn pool(size: usize) -> Arc<WorkerPool> {
        WorkerPool::new(
            Arc::new(ThreadSpawner),
            PoolOptions {
                size,
                prewarm: 2,
                acquire_timeout: Some(Duration::from_millis(100)),
                ..PoolOptions::default()
            },
        )
    }

    #[tokio::test]
    async fn released_workers_are_reused() {
        let pool = pool(2);
        assert_eq!(pool.prewarm().await.expect("prewarm"), 2);
        let lease = pool.acquire().await.expect("acquire");
        let id = lease.id();
        assert_eq!(pool.busy_count(), 1);
        assert_eq!(pool.idle_count(), 1);
        lease.release();
        assert_eq!(pool.busy_count(), 0);
        let again = pool.acquire().await.expect("acquire");
        assert_eq!(again.id(), id);
        again.release();
        assert_eq!(pool.live_count(), 2);
    }

    #[tokio::test]
    async fn killed_workers_free_their_slot() {
        let pool = pool(1);
        let lease = pool.acquire().await.expect("acquire");
        let id = lease.id();
        assert!(matches!(
            pool.acquire().await,
            Err(ExecutionError::AcquireTimeout)
        ));
        lease.kill();
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.idle_count(), 0);
        let fresh = pool.acquire().await.expect("replacement");
        assert_ne!(fresh.id(), id);
    }

    #[tokio::test]
    async fn dropped_leases_are_discarded() {
        let pool = pool(1);
        drop(pool.acquire().await.expect("acquire"));
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.busy_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_leases() {
        let pool = pool(2);
        pool.prewarm().await.expect("prewarm");
        pool.shutdown();
        assert_eq!(pool.live_count(), 0);
        assert!(matches!(pool.acquire().await, Err(ExecutionError::PoolClosed)));
    }

    #[tokio::test]
    async fn abandoned_spawns_return_their_slot() {
        let pool = WorkerPool::new(
            Arc::new(SlowSpawner(Duration::from_millis(200))),
            PoolOptions {
                size: 1,
                acquire_timeout: Some(Duration::from_millis(50)),
                ..PoolOptions::default()
            },
        );
        assert!(timeout(Duration::from_millis(50), pool.acquire()).await.is_err());
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.busy_count(), 0);

        let lease = pool.acquire().await.expect("slot was returned");
        assert_eq!(pool.live_count(), 1);
        lease.release();
        assert_eq!(pool.idle_count(), 1);
    }
}
