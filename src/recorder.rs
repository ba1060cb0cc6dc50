use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::configuration::Configuration;

// 3 is the recommended value and gives 0.1% precision
const HISTOGRAM_PRECISION: u8 = 3;

/// One successfully measured statement.
#[derive(Clone, Copy, Debug)]
pub struct LatencySample {
    /// When the statement finished.
    pub timestamp: Instant,
    pub duration: Duration,
}

struct RecorderState {
    latencies: Histogram<u64>,
    // Executions per second, keyed by seconds elapsed since the start
    per_second: BTreeMap<u64, u64>,
}

impl RecorderState {
    fn new() -> Self {
        Self {
            // Auto-resizing histogram, cannot fail for a valid precision
            latencies: Histogram::new(HISTOGRAM_PRECISION)
                .unwrap_or_else(|err| unreachable!("invalid histogram precision: {err}")),
            per_second: BTreeMap::new(),
        }
    }

    fn ingest(&mut self, started_at: Instant, batch: &[LatencySample]) {
        for sample in batch {
            // Auto-resizing, so only absurd values can be rejected
            let nanos = u64::try_from(sample.duration.as_nanos()).unwrap_or(u64::MAX);
            if let Err(err) = self.latencies.record(nanos) {
                tracing::debug!(error = %err, nanos, "latency out of the histogram's range");
                continue;
            }

            let second = sample.timestamp.saturating_duration_since(started_at).as_secs();
            *self.per_second.entry(second).or_default() += 1;
        }
    }
}

/// Aggregates latency samples sent by the agents.
///
/// Agents hand over batches of samples through a bounded queue; a background
/// task drains the queue into a histogram. The cumulative count is kept
/// in an atomic so that progress can be sampled without touching the queue.
pub struct Recorder {
    started_at: Instant,
    started_at_wall: DateTime<Utc>,
    count: Arc<AtomicU64>,
    state: Arc<Mutex<RecorderState>>,
    sender: Mutex<Option<mpsc::Sender<Vec<LatencySample>>>>,
    ingestion: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    elapsed: Mutex<Option<Duration>>,
}

impl Recorder {
    /// Starts the ingestion task. The queue holds up to `capacity` batches.
    pub fn start(capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Vec<LatencySample>>(capacity.max(1));
        let started_at = Instant::now();
        let count = Arc::new(AtomicU64::new(0));
        let state = Arc::new(Mutex::new(RecorderState::new()));

        let task_count = Arc::clone(&count);
        let task_state = Arc::clone(&state);
        let ingestion = tokio::spawn(async move {
            while let Some(batch) = receiver.recv().await {
                task_state.lock().ingest(started_at, &batch);
                task_count.fetch_add(batch.len() as u64, Ordering::Relaxed);
            }
        });

        Self {
            started_at,
            started_at_wall: Utc::now(),
            count,
            state,
            sender: Mutex::new(Some(sender)),
            ingestion: tokio::sync::Mutex::new(Some(ingestion)),
            elapsed: Mutex::new(None),
        }
    }

    /// Enqueues a batch without waiting. If the queue is full or the recorder
    /// is already closed, the batch is handed back to the caller.
    pub fn add(&self, batch: Vec<LatencySample>) -> Result<(), Vec<LatencySample>> {
        if batch.is_empty() {
            return Ok(());
        }
        let sender = match self.sender.lock().as_ref() {
            Some(sender) => sender.clone(),
            None => return Err(batch),
        };
        sender.try_send(batch).map_err(|err| match err {
            mpsc::error::TrySendError::Full(batch) => batch,
            mpsc::error::TrySendError::Closed(batch) => batch,
        })
    }

    /// Enqueues a batch, waiting for room in the queue if necessary.
    /// Meant for the last batch of an agent, off the hot path.
    pub async fn deliver(&self, batch: Vec<LatencySample>) -> Result<(), Vec<LatencySample>> {
        if batch.is_empty() {
            return Ok(());
        }
        let sender = match self.sender.lock().as_ref() {
            Some(sender) => sender.clone(),
            None => return Err(batch),
        };
        sender.send(batch).await.map_err(|err| err.0)
    }

    /// The number of samples ingested so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Stops accepting new samples and waits until the queued ones are ingested.
    pub async fn close(&self) {
        self.elapsed.lock().get_or_insert_with(|| self.started_at.elapsed());
        drop(self.sender.lock().take());

        let handle = self.ingestion.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "recorder ingestion task failed");
            }
        }
    }

    /// Summarizes the samples ingested so far. Meant to be called after `close`.
    pub fn report(&self) -> Report {
        let elapsed = self
            .elapsed
            .lock()
            .unwrap_or_else(|| self.started_at.elapsed());
        let state = self.state.lock();
        let count = state.latencies.len();

        let elapsed_secs = elapsed.as_secs_f64();
        let queries_per_second = if elapsed_secs > 0.0 {
            count as f64 / elapsed_secs
        } else {
            0.0
        };

        Report {
            started_at: self.started_at_wall,
            count,
            elapsed: elapsed_secs,
            queries_per_second,
            latency: LatencySummary::from_histogram(&state.latencies),
            throughput: ThroughputSummary::from_buckets(&state.per_second, elapsed),
            configuration: None,
        }
    }
}

/// The final summary of a run.
#[derive(Clone, Debug, Serialize)]
pub struct Report {
    pub started_at: DateTime<Utc>,
    /// The number of measured statements.
    pub count: u64,
    /// Seconds.
    pub elapsed: f64,
    pub queries_per_second: f64,
    pub latency: LatencySummary,
    pub throughput: ThroughputSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<Configuration>,
}

/// Latency distribution, in milliseconds.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub min: f64,
    pub mean: f64,
    pub median: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub p999: f64,
    pub max: f64,
}

impl LatencySummary {
    fn from_histogram(histogram: &Histogram<u64>) -> Self {
        if histogram.is_empty() {
            return Self::default();
        }

        let to_ms = |nanos: u64| nanos as f64 * 1e-6;
        Self {
            min: to_ms(histogram.min()),
            mean: histogram.mean() * 1e-6,
            median: to_ms(histogram.value_at_quantile(0.5)),
            p90: to_ms(histogram.value_at_quantile(0.9)),
            p95: to_ms(histogram.value_at_quantile(0.95)),
            p99: to_ms(histogram.value_at_quantile(0.99)),
            p999: to_ms(histogram.value_at_quantile(0.999)),
            max: to_ms(histogram.max()),
        }
    }
}

/// Executions per second over the whole run.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ThroughputSummary {
    pub min: u64,
    pub max: u64,
    pub median: f64,
    pub mean: f64,
}

impl ThroughputSummary {
    fn from_buckets(buckets: &BTreeMap<u64, u64>, elapsed: Duration) -> Self {
        // Seconds without any execution count as zero, except for the
        // trailing partial second
        let seconds = elapsed.as_secs().max(buckets.keys().last().map_or(0, |s| s + 1));
        if seconds == 0 {
            return Self::default();
        }

        let mut per_second: Vec<u64> = (0..seconds)
            .map(|s| buckets.get(&s).copied().unwrap_or(0))
            .collect();
        per_second.sort_unstable();

        let len = per_second.len();
        let median = if len % 2 == 1 {
            per_second[len / 2] as f64
        } else {
            (per_second[len / 2 - 1] + per_second[len / 2]) as f64 / 2.0
        };
        let total: u64 = per_second.iter().sum();

        Self {
            min: per_second[0],
            max: per_second[len - 1],
            median,
            mean: total as f64 / len as f64,
        }
    }
}
