//! Tokio worker pool around [`BackgroundValidator`].
//!
//! - **Intake** subscribes to store events and enqueues `(id, content_hash)` pairs. Pairs
//!   already queued are dropped, so at-least-once delivery never means double work.
//! - **Workers** pull batches from the shared queue and run them on the blocking pool.
//!   Batch size grows with backlog up to `max_batch_size`.
//! - **Supervisor** restarts workers that died on a fatal error, adds workers up to
//!   `max_workers` while the backlog exceeds `backlog_per_worker` each, and periodically
//!   re-derives pending work from the store.
//!
//! The queue is unbounded: ingestion never waits on validation. Shutdown stops intake and
//! lets every in-flight batch finish.

use super::BackgroundValidator;
use crate::config::TrustConfig;
use crate::error::Result;
use crate::memory::{EntryId, StoreEvent, UpdateOrigin};
use dashmap::DashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WorkItem {
    id: EntryId,
    content_hash: String,
}

/// Deduplicating multi-consumer queue of entries awaiting a pass.
struct WorkQueue {
    tx: mpsc::UnboundedSender<WorkItem>,
    rx: Mutex<mpsc::UnboundedReceiver<WorkItem>>,
    queued: DashSet<WorkItem>,
    backlog: AtomicUsize,
}

impl WorkQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            queued: DashSet::new(),
            backlog: AtomicUsize::new(0),
        }
    }

    /// Returns false when the pair is already queued or in flight.
    fn push(&self, id: EntryId, content_hash: String) -> bool {
        let item = WorkItem { id, content_hash };
        if !self.queued.insert(item.clone()) {
            return false;
        }
        self.backlog.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(item.clone()).is_err() {
            self.queued.remove(&item);
            self.backlog.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Waits for one item, then takes whatever else is ready up to `max`.
    async fn next_batch(&self, max: usize) -> Vec<WorkItem> {
        let mut rx = self.rx.lock().await;
        let Some(first) = rx.recv().await else {
            return Vec::new();
        };
        let mut batch = vec![first];
        while batch.len() < max {
            match rx.try_recv() {
                Ok(item) => batch.push(item),
                Err(_) => break,
            }
        }
        batch
    }

    fn finish(&self, batch: &[WorkItem]) {
        for item in batch {
            self.queued.remove(item);
        }
        self.backlog.fetch_sub(batch.len(), Ordering::Relaxed);
    }

    fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy)]
struct Sizing {
    batch_size: usize,
    max_batch_size: usize,
    workers: usize,
    max_workers: usize,
    backlog_per_worker: usize,
}

impl Sizing {
    fn from_config(config: &TrustConfig) -> Self {
        let c = config.clone().normalized();
        Self {
            batch_size: c.batch_size,
            max_batch_size: c.max_batch_size,
            workers: c.workers,
            max_workers: c.max_workers,
            backlog_per_worker: c.backlog_per_worker,
        }
    }

    /// Backlog shared across the live workers, clamped to the configured floor and ceiling.
    fn batch_for(&self, backlog: usize, live_workers: usize) -> usize {
        (backlog / live_workers.max(1)).clamp(self.batch_size, self.max_batch_size)
    }

    fn wants_another_worker(&self, backlog: usize, live_workers: usize) -> bool {
        live_workers < self.max_workers && backlog > self.backlog_per_worker * live_workers
    }
}

/// Shared state for intake, workers and the supervisor.
pub struct ValidatorPool {
    validator: Arc<BackgroundValidator>,
    queue: WorkQueue,
    sizing: Sizing,
    live_workers: AtomicUsize,
    idle_poll: std::time::Duration,
    sweep_interval: std::time::Duration,
}

impl ValidatorPool {
    pub fn new(validator: Arc<BackgroundValidator>, config: &TrustConfig) -> Arc<Self> {
        Arc::new(Self {
            validator,
            queue: WorkQueue::new(),
            sizing: Sizing::from_config(config),
            live_workers: AtomicUsize::new(0),
            idle_poll: config.idle_poll(),
            sweep_interval: config.sweep_interval(),
        })
    }

    /// Entries queued or in flight.
    pub fn backlog(&self) -> usize {
        self.queue.backlog()
    }

    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::Relaxed)
    }

    /// Re-enqueues everything the store says is still pending. Returns how many were new.
    pub fn recover(&self) -> Result<usize> {
        let mut enqueued = 0;
        for (id, hash) in self.validator.pending_work()? {
            if self.queue.push(id, hash) {
                enqueued += 1;
            }
        }
        if enqueued > 0 {
            info!(target: "memtrust::validator", enqueued, "pending entries re-enqueued from store");
        }
        Ok(enqueued)
    }

    /// Runs [`recover`](Self::recover) on the blocking pool; it walks the whole sled tree.
    async fn recover_offloaded(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        match tokio::task::spawn_blocking(move || pool.recover()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(target: "memtrust::validator", error = %e, "failed to re-derive pending work"),
            Err(join) => error!(target: "memtrust::validator", error = %join, "pending-work recovery panicked"),
        }
    }

    /// Starts intake, workers and supervisor.
    pub fn start(self: &Arc<Self>) -> ValidatorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // Subscribe before the supervisor's startup recovery so nothing appended in between
        // is missed.
        let events = self.validator.store().subscribe();

        let intake = tokio::spawn(Arc::clone(self).run_intake(events, shutdown_rx.clone()));
        let supervisor = tokio::spawn(Arc::clone(self).run_supervisor(shutdown_rx));
        info!(
            target: "memtrust::validator",
            workers = self.sizing.workers,
            max_workers = self.sizing.max_workers,
            ruleset_version = self.validator.ruleset_version(),
            "🛡️ background validator started"
        );
        ValidatorHandle {
            pool: Arc::clone(self),
            shutdown_tx,
            intake,
            supervisor,
        }
    }

    async fn run_intake(self: Arc<Self>, mut events: broadcast::Receiver<StoreEvent>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => {
                    self.validator.telemetry().observe_store_event(&event);
                    match event {
                        StoreEvent::Appended { id, content_hash, .. }
                        | StoreEvent::Updated {
                            id,
                            content_hash,
                            origin: UpdateOrigin::Writer,
                            ..
                        } => {
                            if !self.queue.push(id, content_hash) {
                                debug!(target: "memtrust::validator", id = %id, "already queued");
                            }
                        }
                        StoreEvent::Updated { .. } | StoreEvent::Deleted { .. } => {}
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(target: "memtrust::validator", missed, "intake lagged; re-deriving from store");
                    self.recover_offloaded().await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!(target: "memtrust::validator", "intake stopped");
    }

    fn spawn_worker(self: &Arc<Self>, worker_id: usize, shutdown: watch::Receiver<bool>) -> (usize, JoinHandle<Result<()>>) {
        self.live_workers.fetch_add(1, Ordering::Relaxed);
        let pool = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let outcome = pool.clone().run_worker(worker_id, shutdown).await;
            pool.live_workers.fetch_sub(1, Ordering::Relaxed);
            outcome
        });
        (worker_id, handle)
    }

    async fn run_worker(self: Arc<Self>, worker_id: usize, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        debug!(target: "memtrust::validator", worker = worker_id, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let size = self.sizing.batch_for(self.queue.backlog(), self.live_workers());
            let batch = tokio::select! {
                _ = shutdown.changed() => break,
                batch = self.queue.next_batch(size) => batch,
            };
            if batch.is_empty() {
                break;
            }

            let ids: Vec<EntryId> = batch.iter().map(|item| item.id).collect();
            let validator = Arc::clone(&self.validator);
            let job_ids = ids.clone();
            let outcome = tokio::task::spawn_blocking(move || validator.process_batch(&job_ids)).await;
            self.queue.finish(&batch);

            match outcome {
                Ok(Ok(summary)) => {
                    debug!(target: "memtrust::validator", worker = worker_id, %summary, "batch complete");
                }
                Ok(Err(e)) if e.is_fatal() => {
                    error!(
                        target: "memtrust::validator",
                        worker = worker_id,
                        batch = ?ids,
                        error = %e,
                        "fatal error in validation batch"
                    );
                    return Err(e);
                }
                Ok(Err(e)) => {
                    error!(
                        target: "memtrust::validator",
                        worker = worker_id,
                        batch_len = ids.len(),
                        error = %e,
                        "validation batch failed; entries stay pending"
                    );
                }
                Err(join) => {
                    error!(
                        target: "memtrust::validator",
                        worker = worker_id,
                        batch = ?ids,
                        error = %join,
                        "validation batch panicked; entries stay pending"
                    );
                }
            }
        }
        debug!(target: "memtrust::validator", worker = worker_id, "worker stopped");
        Ok(())
    }

    async fn run_supervisor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut next_id = 0usize;
        let mut workers = Vec::with_capacity(self.sizing.max_workers);
        for _ in 0..self.sizing.workers {
            workers.push(self.spawn_worker(next_id, shutdown.clone()));
            next_id += 1;
        }
        self.recover_offloaded().await;

        let mut poll = tokio::time::interval(self.idle_poll);
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = poll.tick() => {
                    let mut i = 0;
                    while i < workers.len() {
                        if !workers[i].1.is_finished() {
                            i += 1;
                            continue;
                        }
                        let (worker_id, handle) = workers.swap_remove(i);
                        match handle.await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => error!(
                                target: "memtrust::validator",
                                worker = worker_id,
                                error = %e,
                                detail = ?e,
                                "validator worker died; restarting"
                            ),
                            Err(join) => error!(
                                target: "memtrust::validator",
                                worker = worker_id,
                                error = %join,
                                "validator worker panicked; restarting"
                            ),
                        }
                        if !*shutdown.borrow() {
                            workers.push(self.spawn_worker(next_id, shutdown.clone()));
                            next_id += 1;
                        }
                    }

                    let backlog = self.queue.backlog();
                    if self.sizing.wants_another_worker(backlog, workers.len()) {
                        info!(
                            target: "memtrust::validator",
                            backlog,
                            workers = workers.len() + 1,
                            "backlog growing; adding validator worker"
                        );
                        workers.push(self.spawn_worker(next_id, shutdown.clone()));
                        next_id += 1;
                    }
                }
                _ = sweep.tick() => self.recover_offloaded().await,
            }
        }

        for (worker_id, handle) in workers {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(target: "memtrust::validator", worker = worker_id, error = %e, "worker exited with error during shutdown"),
                Err(join) => warn!(target: "memtrust::validator", worker = worker_id, error = %join, "worker panicked during shutdown"),
            }
        }
        info!(target: "memtrust::validator", "background validator stopped");
    }
}

/// Running pool. Dropping it without [`ValidatorHandle::shutdown`] leaves the tasks running
/// until the runtime stops.
pub struct ValidatorHandle {
    pool: Arc<ValidatorPool>,
    shutdown_tx: watch::Sender<bool>,
    intake: JoinHandle<()>,
    supervisor: JoinHandle<()>,
}

impl ValidatorHandle {
    pub fn pool(&self) -> &Arc<ValidatorPool> {
        &self.pool
    }

    pub fn backlog(&self) -> usize {
        self.pool.backlog()
    }

    /// Stops intake and waits for every in-flight batch to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.intake.await;
        let _ = self.supervisor.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn batch_size_follows_backlog_within_bounds() {
        let sizing = Sizing::from_config(&TrustConfig::default());
        assert_eq!(sizing.batch_for(0, 1), 16);
        assert_eq!(sizing.batch_for(100, 2), 50);
        assert_eq!(sizing.batch_for(10_000, 1), 128);
    }

    #[test]
    fn workers_scale_with_backlog_up_to_ceiling() {
        let sizing = Sizing::from_config(&TrustConfig::default());
        assert!(!sizing.wants_another_worker(64, 1));
        assert!(sizing.wants_another_worker(65, 1));
        assert!(!sizing.wants_another_worker(10_000, 4));
    }

    #[tokio::test]
    async fn queue_deduplicates_until_finished() {
        let q = WorkQueue::new();
        let id = Uuid::new_v4();
        assert!(q.push(id, "h1".into()));
        assert!(!q.push(id, "h1".into()));
        assert!(q.push(id, "h2".into()), "new content is new work");
        assert_eq!(q.backlog(), 2);

        let batch = q.next_batch(8).await;
        assert_eq!(batch.len(), 2);
        assert!(!q.push(id, "h1".into()), "still in flight");
        q.finish(&batch);
        assert_eq!(q.backlog(), 0);
        assert!(q.push(id, "h1".into()));
    }
}
