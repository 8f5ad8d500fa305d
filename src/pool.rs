//! Process-wide pool of compute workers for entry compression.
//!
//! Workers are plain threads fed through per-worker job channels. An idle
//! worker parks in `recv_timeout(terminate_worker_timeout)` and removes
//! itself from the pool when the timer fires; leases are granted in strict
//! FIFO order up to the configured cap. Terminating the pool cancels every
//! active lease (their pipelines observe `Aborted`), wakes idle workers
//! with a poison job, and leaves the pool ready to re-initialize on the
//! next acquire.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use crate::result::{ZipError, ZipResult};

/// Granularity at which lease waiters re-check cancellation.
const ACQUIRE_POLL: Duration = Duration::from_millis(25);

/// Default chunk size pulled from a source per codec update.
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// Default idle time before a worker terminates itself.
pub const DEFAULT_TERMINATE_WORKER_TIMEOUT: Duration = Duration::from_secs(5);

/// Cancellation token shared between callers, the assembler and workers.
///
/// Cloning hands out another handle to the same token; any holder may
/// signal it. Cancellation is cooperative: pipelines observe the token
/// between chunks, so up to one chunk in flight may still reach the sink.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal {
    aborted: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals cancellation to every holder of this token.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self) -> ZipResult<()> {
        if self.is_aborted() {
            Err(ZipError::Aborted)
        } else {
            Ok(())
        }
    }
}

/// Process-wide pool configuration.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Run codecs on pool workers; false executes them on the calling thread.
    pub use_workers: bool,
    /// Cap on concurrently live workers; 0 means the host CPU count.
    pub max_workers: usize,
    /// Idle time after which a worker terminates itself, and the bound on
    /// how long [`WorkerPool::terminate_all`] waits for stragglers.
    pub terminate_worker_timeout: Duration,
    /// Bytes pulled from an entry source per codec update.
    pub chunk_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            use_workers: true,
            max_workers: 0,
            terminate_worker_timeout: DEFAULT_TERMINATE_WORKER_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl PoolConfig {
    fn effective_max_workers(&self) -> usize {
        if self.max_workers > 0 {
            self.max_workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

type Job = Box<dyn FnOnce() -> bool + Send + 'static>;

struct IdleWorker {
    id: u64,
    tx: Sender<Job>,
}

struct PoolState {
    config: PoolConfig,
    idle: Vec<IdleWorker>,
    live: usize,
    /// FIFO tickets of blocked acquire calls.
    queue: VecDeque<u64>,
    next_ticket: u64,
    next_worker_id: u64,
    /// Bumped when stragglers are detached; workers from an older epoch no
    /// longer touch the live count.
    epoch: u64,
    draining: bool,
    /// Cancellation tokens of in-flight leases, keyed by worker id.
    active: Vec<(u64, AbortSignal)>,
}

pub struct WorkerPool {
    state: Mutex<PoolState>,
    cond: Condvar,
}

/// Exclusive right to run one job on one worker.
pub(crate) struct WorkerLease {
    tx: Sender<Job>,
}

impl WorkerLease {
    /// Hands the job to the leased worker. The job returns whether the
    /// worker may be recycled; aborted jobs return false so the worker is
    /// destroyed rather than reused in an indeterminate state.
    pub(crate) fn dispatch(self, job: impl FnOnce() -> bool + Send + 'static) -> ZipResult<()> {
        self.tx.send(Box::new(job)).map_err(|_| ZipError::Aborted)
    }
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Arc<WorkerPool> {
        Arc::new(WorkerPool {
            state: Mutex::new(PoolState {
                config,
                idle: Vec::new(),
                live: 0,
                queue: VecDeque::new(),
                next_ticket: 0,
                next_worker_id: 0,
                epoch: 0,
                draining: false,
                active: Vec::new(),
            }),
            cond: Condvar::new(),
        })
    }

    /// The shared process-wide pool.
    pub fn global() -> Arc<WorkerPool> {
        static GLOBAL: OnceLock<Arc<WorkerPool>> = OnceLock::new();
        GLOBAL.get_or_init(|| WorkerPool::new(PoolConfig::default())).clone()
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn use_workers(&self) -> bool {
        self.lock().config.use_workers
    }

    pub(crate) fn chunk_size(&self) -> usize {
        self.lock().config.chunk_size.max(1)
    }

    /// Replaces the pool configuration, draining the pool first.
    pub fn configure(self: &Arc<Self>, config: PoolConfig) -> ZipResult<()> {
        self.terminate_all()?;
        self.lock().config = config;
        Ok(())
    }

    /// Blocks until a worker is available, in FIFO order over concurrent
    /// callers. `cancel` is polled while queued; it is also the token the
    /// pool signals when [`WorkerPool::terminate_all`] cancels the lease.
    pub(crate) fn acquire(self: &Arc<Self>, cancel: &AbortSignal) -> ZipResult<WorkerLease> {
        let mut state = self.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(ticket);

        loop {
            if cancel.is_aborted() || state.draining {
                state.queue.retain(|t| *t != ticket);
                self.cond.notify_all();
                return Err(ZipError::Aborted);
            }

            if state.queue.front() == Some(&ticket) {
                if let Some(worker) = state.idle.pop() {
                    return Ok(self.serve(&mut state, ticket, worker, cancel));
                }
                if state.live < state.config.effective_max_workers() {
                    state.live += 1;
                    let worker = self.spawn_worker(&mut state);
                    return Ok(self.serve(&mut state, ticket, worker, cancel));
                }
            }

            let (guard, _timeout) = self
                .cond
                .wait_timeout(state, ACQUIRE_POLL)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    fn serve(
        &self,
        state: &mut PoolState,
        ticket: u64,
        worker: IdleWorker,
        cancel: &AbortSignal,
    ) -> WorkerLease {
        state.queue.retain(|t| *t != ticket);
        state.active.push((worker.id, cancel.clone()));
        self.cond.notify_all();
        WorkerLease { tx: worker.tx }
    }

    fn spawn_worker(self: &Arc<Self>, state: &mut PoolState) -> IdleWorker {
        let id = state.next_worker_id;
        state.next_worker_id += 1;
        let epoch = state.epoch;
        let (tx, rx) = mpsc::channel::<Job>();
        let pool = Arc::clone(self);
        let tx_self = tx.clone();
        std::thread::Builder::new()
            .name(format!("zipstream-worker-{id}"))
            .spawn(move || worker_loop(pool, rx, tx_self, id, epoch))
            .expect("failed to spawn compression worker");
        IdleWorker { id, tx }
    }

    /// Cancels all leases, destroys all workers and waits (bounded by
    /// `terminate_worker_timeout`) for them to exit. Idempotent; the next
    /// acquire re-initializes the pool.
    pub fn terminate_all(self: &Arc<Self>) -> ZipResult<()> {
        let mut state = self.lock();
        if state.draining {
            // another terminate call is already draining; wait it out
            while state.draining {
                let (guard, _timeout) = self
                    .cond
                    .wait_timeout(state, ACQUIRE_POLL)
                    .unwrap_or_else(PoisonError::into_inner);
                state = guard;
            }
            return Ok(());
        }

        state.draining = true;
        for (_, cancel) in state.active.drain(..) {
            cancel.abort();
        }
        let idle = std::mem::take(&mut state.idle);
        for worker in &idle {
            // poison job: wakes the parked worker, which then sees the
            // drain and exits instead of re-idling
            let _ = worker.tx.send(Box::new(|| false));
        }
        drop(idle);
        self.cond.notify_all();

        let deadline = Instant::now() + state.config.terminate_worker_timeout;
        while state.live > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _timeout) = self
                .cond
                .wait_timeout(state, (deadline - now).min(ACQUIRE_POLL))
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }

        // detach stragglers; their LiveGuard epoch no longer matches
        state.epoch += 1;
        state.live = 0;
        state.idle.clear();
        state.active.clear();
        state.draining = false;
        self.cond.notify_all();
        Ok(())
    }
}

/// Decrements the live count exactly once when a worker exits, even if its
/// job panicked, unless the worker was detached by a terminate.
struct LiveGuard {
    pool: Arc<WorkerPool>,
    id: u64,
    epoch: u64,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        let mut state = self.pool.lock();
        if state.epoch == self.epoch {
            state.live = state.live.saturating_sub(1);
            state.active.retain(|(id, _)| *id != self.id);
            state.idle.retain(|w| w.id != self.id);
            self.pool.cond.notify_all();
        }
    }
}

fn worker_loop(
    pool: Arc<WorkerPool>,
    rx: Receiver<Job>,
    tx_self: Sender<Job>,
    id: u64,
    epoch: u64,
) {
    let _guard = LiveGuard {
        pool: Arc::clone(&pool),
        id,
        epoch,
    };

    loop {
        let timeout = {
            let state = pool.lock();
            if state.epoch != epoch || state.draining {
                return;
            }
            state.config.terminate_worker_timeout
        };

        match rx.recv_timeout(timeout) {
            Ok(job) => {
                let recycle = job();
                let mut state = pool.lock();
                state.active.retain(|(wid, _)| *wid != id);
                if state.epoch != epoch || state.draining || !recycle {
                    return;
                }
                state.idle.push(IdleWorker {
                    id,
                    tx: tx_self.clone(),
                });
                pool.cond.notify_all();
            }
            Err(RecvTimeoutError::Timeout) => {
                let mut state = pool.lock();
                let before = state.idle.len();
                state.idle.retain(|w| w.id != id);
                if state.idle.len() != before {
                    return;
                }
                // a lease was granted concurrently; the job is on its way
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Reconfigures the process-wide pool; the pool drains first.
pub fn configure(config: PoolConfig) -> ZipResult<()> {
    WorkerPool::global().configure(config)
}

/// Terminates every worker of the process-wide pool. Idempotent; callers
/// suspended on leases observe [`ZipError::Aborted`].
pub fn terminate_workers() -> ZipResult<()> {
    WorkerPool::global().terminate_all()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_pool(max_workers: usize) -> Arc<WorkerPool> {
        WorkerPool::new(PoolConfig {
            use_workers: true,
            max_workers,
            terminate_worker_timeout: Duration::from_millis(200),
            chunk_size: 1024,
        })
    }

    #[test]
    fn runs_jobs_and_recycles_workers() {
        let pool = test_pool(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let cancel = AbortSignal::new();
            let lease = pool.acquire(&cancel).unwrap();
            let counter = Arc::clone(&counter);
            lease
                .dispatch(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    true
                })
                .unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 8 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        // never more than the cap
        assert!(pool.lock().live <= 2);
    }

    #[test]
    fn acquire_respects_cancellation_while_queued() {
        let pool = test_pool(1);
        let cancel = AbortSignal::new();
        let lease = pool.acquire(&cancel).unwrap();

        let blocked_cancel = AbortSignal::new();
        let blocked_cancel2 = blocked_cancel.clone();
        let pool2 = Arc::clone(&pool);
        let waiter = std::thread::spawn(move || pool2.acquire(&blocked_cancel2).map(|_| ()));
        std::thread::sleep(Duration::from_millis(50));
        blocked_cancel.abort();
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(ZipError::Aborted)));

        lease.dispatch(|| true).unwrap();
    }

    #[test]
    fn terminate_cancels_active_leases_and_reinitializes() {
        let pool = test_pool(1);
        let cancel = AbortSignal::new();
        let lease = pool.acquire(&cancel).unwrap();
        let cancel_seen = cancel.clone();
        lease
            .dispatch(move || {
                let deadline = Instant::now() + Duration::from_secs(5);
                while !cancel_seen.is_aborted() && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(5));
                }
                // a cancelled worker must not be recycled
                false
            })
            .unwrap();

        pool.terminate_all().unwrap();
        assert!(cancel.is_aborted());
        pool.terminate_all().unwrap();

        // pool comes back after termination
        let cancel = AbortSignal::new();
        let lease = pool.acquire(&cancel).unwrap();
        lease.dispatch(|| true).unwrap();
        pool.terminate_all().unwrap();
    }

    #[test]
    fn idle_workers_expire() {
        let pool = test_pool(1);
        let cancel = AbortSignal::new();
        let lease = pool.acquire(&cancel).unwrap();
        lease.dispatch(|| true).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.lock().live > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(pool.lock().live, 0);
    }
}
