//! Worker pool
//!
//! Inbound delivery never blocks: anything that may wait (request handlers,
//! hotplug sequences) is handed to a worker. Keyed workers run their jobs
//! one at a time in submission order, so all hotplug work for one
//! interface is serialized while different interfaces proceed in parallel.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

type Job = BoxFuture<'static, ()>;

/// Spawner for detached and per-key serialized work
#[derive(Clone)]
pub struct WorkerPool {
    handle: Handle,
    queues: Arc<Mutex<HashMap<u16, mpsc::UnboundedSender<Job>>>>,
}

impl WorkerPool {
    /// Pool running on the given runtime
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Pool running on the current runtime, if there is one
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    /// Run a detached job
    pub fn spawn<F>(&self, job: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(job)
    }

    /// Queue a job on the worker for `key`, creating the worker on first use
    pub fn spawn_keyed<F>(&self, key: u16, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut job: Job = job.boxed();
        let mut queues = self.queues.lock();

        if let Some(tx) = queues.get(&key) {
            match tx.send(job) {
                Ok(()) => return,
                // Worker loop ended, start a fresh one below
                Err(mpsc::error::SendError(returned)) => job = returned,
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        // A freshly created receiver is alive, so this cannot fail
        let _ = tx.send(job);
        queues.insert(key, tx);

        debug!(key, "keyed worker started");
        self.handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            trace!(key, "keyed worker stopped");
        });
    }

    /// Stop the worker for `key` once its queued jobs are done
    pub fn retire(&self, key: u16) {
        self.queues.lock().remove(&key);
    }

    /// Number of keyed workers currently running
    pub fn keyed_workers(&self) -> usize {
        self.queues.lock().len()
    }

    /// Stop all keyed workers once their queues drain
    pub fn retire_all(&self) {
        self.queues.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_keyed_jobs_run_in_order() {
        let pool = WorkerPool::new(Handle::current());
        let log = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        for i in 0..5u32 {
            let log = Arc::clone(&log);
            pool.spawn_keyed(3, async move {
                // Later jobs sleep less; order must still hold
                tokio::time::sleep(Duration::from_millis(u64::from(5 - i))).await;
                log.lock().push(i);
            });
        }
        pool.spawn_keyed(3, async move {
            let _ = done_tx.send(());
        });

        done_rx.await.unwrap();
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(pool.keyed_workers(), 1);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block_each_other() {
        let pool = WorkerPool::new(Handle::current());
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        // Key 3 is stuck until the gate opens
        pool.spawn_keyed(3, async move {
            let _ = gate_rx.await;
        });
        pool.spawn_keyed(4, async move {
            let _ = done_tx.send(());
        });

        tokio::time::timeout(Duration::from_secs(1), done_rx).await.unwrap().unwrap();
        let _ = gate_tx.send(());
    }

    #[tokio::test]
    async fn test_retire_restarts_on_next_job() {
        let pool = WorkerPool::try_current().unwrap();
        pool.spawn_keyed(7, async {});
        pool.retire(7);
        assert_eq!(pool.keyed_workers(), 0);

        let (tx, rx) = tokio::sync::oneshot::channel();
        pool.spawn_keyed(7, async move {
            let _ = tx.send(42);
        });
        assert_eq!(rx.await.unwrap(), 42);
    }
}
