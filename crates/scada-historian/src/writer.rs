//! ---
//! scada_section: "03-persistence-metrics"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "Historian schema rows, sinks, and the batching writer."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use scada_common::Backoff;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::rows::HistorianRow;
use crate::sink::HistorianSink;

/// Tuning knobs for the batching writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Flush cadence when the batch threshold is not reached.
    pub flush_interval: Duration,
    /// Flush immediately once this many rows are pending.
    pub max_batch: usize,
    /// Spillover buffer capacity; oldest rows beyond it are dropped.
    pub spill_capacity: usize,
    /// Initial retry backoff after a sink failure.
    pub retry_initial: Duration,
    /// Retry backoff cap.
    pub retry_cap: Duration,
    /// Depth of the inbound row queue.
    pub queue_depth: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            max_batch: 500,
            spill_capacity: 100_000,
            retry_initial: Duration::from_secs(1),
            retry_cap: Duration::from_secs(60),
            queue_depth: 4096,
        }
    }
}

/// Counters exposed by the writer, read by the metrics bridge.
#[derive(Debug, Default)]
pub struct WriterStats {
    written: AtomicU64,
    lost: AtomicU64,
    spill_depth: AtomicU64,
}

impl WriterStats {
    /// Rows the sink accepted.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Rows dropped from the spillover buffer.
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Rows currently parked in the spillover buffer.
    pub fn spill_depth(&self) -> u64 {
        self.spill_depth.load(Ordering::Relaxed)
    }
}

/// Handle shared by every producer; the bootstrap owns the shutdown.
pub struct HistorianHandle {
    tx: mpsc::Sender<HistorianRow>,
    stats: Arc<WriterStats>,
    shutdown: watch::Sender<bool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl HistorianHandle {
    /// Enqueue a row without blocking. Returns false if the inbound queue is
    /// full or the writer is gone; the row is then lost and the caller is not
    /// expected to care (historian failures are never surfaced).
    pub fn record(&self, row: HistorianRow) -> bool {
        match self.tx.try_send(row) {
            Ok(()) => true,
            Err(err) => {
                debug!(error = %err, "historian intake full; dropping row");
                self.stats.lost.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Counter snapshot access.
    pub fn stats(&self) -> Arc<WriterStats> {
        self.stats.clone()
    }

    /// Flush what can be flushed and stop, bounded by `grace`. Idempotent.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().expect("task slot poisoned").take();
        if let Some(task) = task {
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!("historian writer did not stop within grace period; abandoning");
            }
        }
    }
}

/// Spawn the writer task draining rows into `sink`.
pub fn spawn_writer(sink: Arc<dyn HistorianSink>, config: WriterConfig) -> HistorianHandle {
    let (tx, rx) = mpsc::channel(config.queue_depth);
    let stats = Arc::new(WriterStats::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(writer_loop(sink, config, rx, shutdown_rx, stats.clone()));
    HistorianHandle {
        tx,
        stats,
        shutdown: shutdown_tx,
        task: std::sync::Mutex::new(Some(task)),
    }
}

async fn writer_loop(
    sink: Arc<dyn HistorianSink>,
    config: WriterConfig,
    mut rx: mpsc::Receiver<HistorianRow>,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<WriterStats>,
) {
    let mut pending: Vec<HistorianRow> = Vec::with_capacity(config.max_batch);
    let mut spill: VecDeque<HistorianRow> = VecDeque::new();
    let mut backoff = Backoff::new(config.retry_initial, config.retry_cap);
    let mut retry_at: Option<Instant> = None;
    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            row = rx.recv() => {
                match row {
                    Some(row) => {
                        pending.push(row);
                        if pending.len() >= config.max_batch {
                            flush(
                                sink.as_ref(),
                                &config,
                                &mut pending,
                                &mut spill,
                                &mut backoff,
                                &mut retry_at,
                                &stats,
                            )
                            .await;
                        }
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                flush(
                    sink.as_ref(),
                    &config,
                    &mut pending,
                    &mut spill,
                    &mut backoff,
                    &mut retry_at,
                    &stats,
                )
                .await;
            }
        }
    }

    // Final flush on the way out; a single attempt, losses are counted.
    retry_at = None;
    while let Ok(row) = rx.try_recv() {
        pending.push(row);
    }
    flush(
        sink.as_ref(),
        &config,
        &mut pending,
        &mut spill,
        &mut backoff,
        &mut retry_at,
        &stats,
    )
    .await;
    debug!(
        written = stats.written(),
        lost = stats.lost(),
        "historian writer stopped"
    );
}

async fn flush(
    sink: &dyn HistorianSink,
    config: &WriterConfig,
    pending: &mut Vec<HistorianRow>,
    spill: &mut VecDeque<HistorianRow>,
    backoff: &mut Backoff,
    retry_at: &mut Option<Instant>,
    stats: &WriterStats,
) {
    // Everything pending joins the tail of the spillover queue so order is
    // preserved across retries. Capacity is enforced oldest-first.
    for row in pending.drain(..) {
        if spill.len() >= config.spill_capacity {
            spill.pop_front();
            stats.lost.fetch_add(1, Ordering::Relaxed);
        }
        spill.push_back(row);
    }
    stats.spill_depth.store(spill.len() as u64, Ordering::Relaxed);

    if let Some(at) = retry_at {
        if Instant::now() < *at {
            return;
        }
    }

    while !spill.is_empty() {
        let take = spill.len().min(config.max_batch);
        let batch: Vec<HistorianRow> = spill.iter().take(take).cloned().collect();
        match sink.write_batch(&batch).await {
            Ok(()) => {
                spill.drain(..take);
                stats.written.fetch_add(take as u64, Ordering::Relaxed);
                stats.spill_depth.store(spill.len() as u64, Ordering::Relaxed);
                backoff.reset();
                *retry_at = None;
            }
            Err(err) => {
                let delay = backoff.next_delay();
                warn!(error = %err, rows = spill.len(), retry_in = ?delay, "historian write failed; will retry");
                *retry_at = Some(Instant::now() + delay);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::{HistorianRow, SecurityEventRow};
    use crate::HistorianError;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use uuid::Uuid;

    struct FlakySink {
        fail_first: Mutex<u32>,
        accepted: Mutex<Vec<HistorianRow>>,
    }

    impl FlakySink {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                fail_first: Mutex::new(failures),
                accepted: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HistorianSink for FlakySink {
        async fn write_batch(&self, rows: &[HistorianRow]) -> crate::Result<()> {
            let mut remaining = self.fail_first.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(HistorianError::Io(std::io::Error::other("sink down")));
            }
            self.accepted.lock().unwrap().extend(rows.iter().cloned());
            Ok(())
        }
    }

    fn event_row(n: u64) -> HistorianRow {
        HistorianRow::SecurityEvents(SecurityEventRow {
            event_id: Uuid::new_v4(),
            event_type: "UnknownConnection".into(),
            severity: "warning".into(),
            node_id: None,
            client_ip: None,
            description: format!("event {n}"),
            timestamp: Utc::now(),
            metadata_json: serde_json::json!({ "n": n }),
        })
    }

    fn fast_config() -> WriterConfig {
        WriterConfig {
            flush_interval: Duration::from_millis(10),
            max_batch: 8,
            spill_capacity: 16,
            retry_initial: Duration::from_millis(5),
            retry_cap: Duration::from_millis(20),
            queue_depth: 64,
        }
    }

    #[tokio::test]
    async fn rows_are_flushed_in_order() {
        let sink = FlakySink::new(0);
        let handle = spawn_writer(sink.clone(), fast_config());
        for n in 0..20 {
            assert!(handle.record(event_row(n)));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown(Duration::from_secs(1)).await;

        let accepted = sink.accepted.lock().unwrap();
        assert_eq!(accepted.len(), 20);
        let descriptions: Vec<String> = accepted
            .iter()
            .map(|row| match row {
                HistorianRow::SecurityEvents(e) => e.description.clone(),
                other => panic!("unexpected row {other:?}"),
            })
            .collect();
        let expected: Vec<String> = (0..20).map(|n| format!("event {n}")).collect();
        assert_eq!(descriptions, expected);
    }

    #[tokio::test]
    async fn failures_are_retried_until_the_sink_recovers() {
        let sink = FlakySink::new(3);
        let handle = spawn_writer(sink.clone(), fast_config());
        for n in 0..5 {
            handle.record(event_row(n));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handle.stats().written(), 5);
        handle.shutdown(Duration::from_secs(1)).await;
        assert_eq!(sink.accepted.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn spill_overflow_drops_oldest_and_counts_losses() {
        // Sink never recovers within the test window.
        let sink = FlakySink::new(u32::MAX);
        let handle = spawn_writer(sink.clone(), fast_config());
        for n in 0..40 {
            handle.record(event_row(n));
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        let stats = handle.stats();
        assert!(stats.lost() >= 24, "lost {} rows", stats.lost());
        assert!(stats.spill_depth() <= 16);
        handle.shutdown(Duration::from_millis(200)).await;
    }
}
