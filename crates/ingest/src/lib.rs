//! Change delivery: a coalescing queue in front of the reconcile engine.
//!
//! The watcher may report the same object many times in a burst; only the
//! last kind per object matters, because the engine fetches the current body
//! anyway. Notifications are handed to the engine one at a time.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hrx_core::{Change, ChangeKind, ObjectKey};
use hrx_engine::{ReconcileEngine, ReconcileError};
use metrics::{counter, gauge, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Coalescing queue keyed by object with FIFO order. The capacity bounds
/// queued upserts; deletes may exceed it.
pub struct Coalescer {
    map: FxHashMap<ObjectKey, ChangeKind>,
    order: VecDeque<ObjectKey>,
    cap: usize,
    dropped: u64,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1), dropped: 0 }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn dropped(&self) -> u64 { self.dropped }

    /// Queue `c`. A key already queued keeps its position and takes the new kind.
    ///
    /// At capacity the oldest queued upsert is dropped; if none is queued the
    /// incoming upsert is. Deletes are never dropped: once the object is gone
    /// no relist mentions it again. Returns the key that was dropped, if any.
    pub fn push(&mut self, c: Change) -> Option<ObjectKey> {
        if self.map.contains_key(&c.key) {
            self.map.insert(c.key, c.kind);
            return None;
        }
        let mut dropped = None;
        if self.order.len() >= self.cap {
            let oldest_upsert = self.order.iter().position(|k| self.map.get(k) == Some(&ChangeKind::Upsert));
            match (oldest_upsert, c.kind) {
                (Some(idx), _) => {
                    if let Some(old) = self.order.remove(idx) {
                        self.map.remove(&old);
                        dropped = Some(old);
                    }
                }
                (None, ChangeKind::Upsert) => dropped = Some(c.key.clone()),
                (None, ChangeKind::Delete) => {}
            }
        }
        if let Some(key) = &dropped {
            self.dropped += 1;
            counter!("hrx_queue_dropped_total").increment(1);
            warn!(key = %key, "change queue full; dropped upsert until next relist");
            if *key == c.key {
                return dropped;
            }
        }
        self.order.push_back(c.key.clone());
        self.map.insert(c.key, c.kind);
        dropped
    }

    /// Drain all currently coalesced changes in arrival order.
    pub fn drain_ready(&mut self) -> Vec<Change> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(kind) = self.map.remove(&key) {
                out.push(Change { key, kind });
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub queue_cap: usize,
    /// How often the queue is drained.
    pub tick: Duration,
    /// Redeliveries of a notification that failed transiently.
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_cap: 4096,
            tick: Duration::from_millis(8),
            max_retries: 5,
            retry_base: Duration::from_millis(500),
            retry_max: Duration::from_secs(30),
        }
    }
}

/// Delay before redelivery number `attempt` (1-based).
pub fn backoff(cfg: &IngestConfig, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    cfg.retry_base.saturating_mul(factor).min(cfg.retry_max)
}

/// Handle on a running ingest loop.
pub struct IngestHandle {
    epoch_rx: watch::Receiver<u64>,
    task: JoinHandle<()>,
}

impl IngestHandle {
    /// Number of batches processed so far.
    pub fn epoch(&self) -> u64 { *self.epoch_rx.borrow() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    /// Resolves once every sender is dropped and the queue is drained.
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "ingest loop ended abnormally");
        }
    }
}

struct Worker {
    engine: Arc<ReconcileEngine>,
    cfg: IngestConfig,
    coalescer: Coalescer,
    attempts: FxHashMap<ObjectKey, u32>,
    retry_tx: mpsc::UnboundedSender<Change>,
    epoch: u64,
    epoch_tx: watch::Sender<u64>,
}

impl Worker {
    fn enqueue(&mut self, change: Change) {
        if let Some(dropped) = self.coalescer.push(change) {
            self.attempts.remove(&dropped);
        }
    }

    async fn flush(&mut self) {
        let batch = self.coalescer.drain_ready();
        if batch.is_empty() {
            return;
        }
        gauge!("hrx_queue_depth").set(batch.len() as f64);
        for change in batch {
            let started = Instant::now();
            let res = self.engine.handle(&change).await;
            histogram!("hrx_reconcile_ms").record(started.elapsed().as_secs_f64() * 1000.0);
            match res {
                Ok(outcome) => {
                    self.attempts.remove(&change.key);
                    counter!("hrx_changes_total", "outcome" => outcome.as_str()).increment(1);
                }
                Err(e) if e.is_transient() => self.retry(change, &e),
                Err(e) => {
                    self.attempts.remove(&change.key);
                    counter!("hrx_changes_total", "outcome" => "failed").increment(1);
                    debug!(key = %change.key, error = %e, "notification skipped");
                }
            }
        }
        gauge!("hrx_queue_depth").set(self.coalescer.len() as f64);
        self.epoch = self.epoch.saturating_add(1);
        let _ = self.epoch_tx.send(self.epoch);
    }

    fn retry(&mut self, change: Change, err: &ReconcileError) {
        let attempt = {
            let n = self.attempts.entry(change.key.clone()).or_insert(0);
            *n += 1;
            *n
        };
        if attempt > self.cfg.max_retries {
            self.attempts.remove(&change.key);
            counter!("hrx_changes_total", "outcome" => "abandoned").increment(1);
            warn!(key = %change.key, attempts = attempt - 1, error = %err, "giving up on notification until next resync");
            return;
        }
        let delay = backoff(&self.cfg, attempt);
        counter!("hrx_retries_total").increment(1);
        debug!(key = %change.key, attempt, delay_ms = delay.as_millis() as u64, error = %err, "redelivering notification");
        let tx = self.retry_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(change);
        });
    }
}

/// Spawn the ingest loop. Returns the sender the watcher feeds and a handle for readers.
pub fn spawn_ingest(engine: Arc<ReconcileEngine>, cfg: IngestConfig) -> (mpsc::Sender<Change>, IngestHandle) {
    let (tx, mut rx) = mpsc::channel::<Change>(cfg.queue_cap.max(1));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<Change>();

    let mut worker = Worker {
        engine,
        coalescer: Coalescer::with_capacity(cfg.queue_cap),
        attempts: FxHashMap::default(),
        retry_tx,
        epoch: 0,
        epoch_tx,
        cfg,
    };

    let task = tokio::spawn(async move {
        let tick = worker.cfg.tick;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(c) => worker.enqueue(c),
                        None => {
                            debug!("change channel closed; draining and exiting ingest loop");
                            worker.flush().await;
                            break;
                        }
                    }
                }
                Some(c) = retry_rx.recv() => worker.enqueue(c),
                _ = ticker.tick() => worker.flush().await,
            }
        }
        info!(epoch = worker.epoch, "ingest loop stopped");
    });

    (tx, IngestHandle { epoch_rx, task })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hrx_core::{FetchError, ReleaseSource};
    use hrx_engine::{release_registry, EngineConfig};

    struct Gone;

    #[async_trait::async_trait]
    impl ReleaseSource for Gone {
        async fn fetch(&self, _key: &ObjectKey) -> Result<Vec<u8>, FetchError> {
            Err(FetchError::NotFound)
        }
    }

    fn worker(cap: usize) -> Worker {
        let engine = Arc::new(ReconcileEngine::new(Arc::new(release_registry()), Arc::new(Gone), EngineConfig::default()));
        let (retry_tx, _retry_rx) = mpsc::unbounded_channel();
        let (epoch_tx, _epoch_rx) = watch::channel(0);
        Worker {
            engine,
            cfg: IngestConfig { queue_cap: cap, ..IngestConfig::default() },
            coalescer: Coalescer::with_capacity(cap),
            attempts: FxHashMap::default(),
            retry_tx,
            epoch: 0,
            epoch_tx,
        }
    }

    #[test]
    fn dropped_key_forgets_its_retry_count() {
        let mut w = worker(1);
        let a = ObjectKey::new("ns", "sh.helm.release.v1.a.v1");
        let b = ObjectKey::new("ns", "sh.helm.release.v1.b.v1");
        w.enqueue(Change::upsert(a.clone()));
        w.attempts.insert(a.clone(), 3);
        w.attempts.insert(b.clone(), 1);

        w.enqueue(Change::upsert(b.clone()));
        assert!(!w.attempts.contains_key(&a));
        assert_eq!(w.attempts.get(&b), Some(&1));
        assert_eq!(w.coalescer.drain_ready(), vec![Change::upsert(b)]);
    }
}
