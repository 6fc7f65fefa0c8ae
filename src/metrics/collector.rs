//! # Async Metrics Collector Module
//!
//! Bounded, non-blocking metrics pipeline between the request path and the
//! counter registry. Producers hand events to a bounded queue with a
//! `try_send` that never suspends; when the queue is full the event is
//! dropped silently and the drop counter incremented. A single consumer
//! task drains the queue in batches of up to 100 events, flushing at least
//! every 100 ms, and updates the registry plus a per-route request-rate
//! gauge. Shutdown drains whatever is queued, flushes the final batch and
//! lets the task be joined.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Metrics;

/// Queue depth sized for bursts well above the steady-state event rate.
pub const QUEUE_CAPACITY: usize = 10_000;

const BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);
const RATE_INTERVAL: Duration = Duration::from_secs(1);

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// One observation emitted by the request path.
#[derive(Debug, Clone)]
pub enum MetricEvent {
    Request {
        method: String,
        route: String,
        status: u16,
        duration: Duration,
    },
    Quota {
        dimension: &'static str,
        key: String,
        admitted: bool,
    },
}

/// Cloneable producer handle. Emitting is wait-free from the caller's
/// perspective: either the event lands on the queue or it is dropped and
/// counted.
#[derive(Clone)]
pub struct MetricsRecorder {
    tx: mpsc::Sender<MetricEvent>,
    metrics: Arc<Metrics>,
}

impl MetricsRecorder {
    pub fn record_request(&self, method: &str, route: &str, status: u16, duration: Duration) {
        self.emit(MetricEvent::Request {
            method: method.to_string(),
            route: route.to_string(),
            status,
            duration,
        });
    }

    pub fn record_quota(&self, dimension: &'static str, key: &str, admitted: bool) {
        self.emit(MetricEvent::Quota {
            dimension,
            key: key.to_string(),
            admitted,
        });
    }

    fn emit(&self, event: MetricEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(event) {
            self.metrics.dropped_events_total.inc();
            warn!("metrics queue full, dropping event");
        }
    }
}

/// The consumer half of the pipeline.
pub struct MetricsCollector {
    rx: mpsc::Receiver<MetricEvent>,
    metrics: Arc<Metrics>,
    shutdown: broadcast::Receiver<()>,
    rate_counts: HashMap<String, u64>,
    rate_marked_at: Instant,
}

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

impl MetricsCollector {
    /// Start the consumer task and return the producer handle plus the
    /// join handle the shutdown path awaits.
    pub fn spawn(
        metrics: Arc<Metrics>,
        shutdown: broadcast::Receiver<()>,
    ) -> (MetricsRecorder, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);

        let recorder = MetricsRecorder {
            tx,
            metrics: metrics.clone(),
        };
        let collector = MetricsCollector {
            rx,
            metrics,
            shutdown,
            rate_counts: HashMap::new(),
            rate_marked_at: Instant::now(),
        };

        let handle = tokio::spawn(collector.run());
        (recorder, handle)
    }

    async fn run(mut self) {
        let mut batch: Vec<MetricEvent> = Vec::with_capacity(BATCH_SIZE);
        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                received = self.rx.recv() => match received {
                    Some(event) => {
                        batch.push(event);
                        if batch.len() >= BATCH_SIZE {
                            self.process_batch(&mut batch);
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.process_batch(&mut batch);
                    }
                    self.update_request_rates();
                }
                _ = self.shutdown.recv() => {
                    debug!("metrics collector draining for shutdown");
                    while let Ok(event) = self.rx.try_recv() {
                        batch.push(event);
                        if batch.len() >= BATCH_SIZE {
                            self.process_batch(&mut batch);
                        }
                    }
                    break;
                }
            }
        }

        self.process_batch(&mut batch);
        info!("metrics collector shutdown complete");
    }

    fn process_batch(&mut self, batch: &mut Vec<MetricEvent>) {
        for event in batch.drain(..) {
            match event {
                MetricEvent::Request {
                    method,
                    route,
                    status,
                    duration,
                } => {
                    let status = status_label(status);
                    self.metrics
                        .requests_total
                        .with_label_values(&[&method, &route, status])
                        .inc();
                    self.metrics
                        .request_duration_seconds
                        .with_label_values(&[&method, &route, status])
                        .observe(duration.as_secs_f64());
                    *self.rate_counts.entry(route).or_insert(0) += 1;
                }
                MetricEvent::Quota {
                    dimension,
                    key,
                    admitted,
                } => {
                    if !admitted {
                        self.metrics
                            .rate_limit_blocked_total
                            .with_label_values(&[dimension, &key])
                            .inc();
                    }
                }
            }
        }
    }

    fn update_request_rates(&mut self) {
        let elapsed = self.rate_marked_at.elapsed();
        if elapsed < RATE_INTERVAL {
            return;
        }

        for (route, count) in self.rate_counts.drain() {
            self.metrics
                .requests_per_second
                .with_label_values(&[&route])
                .set(count as f64 / elapsed.as_secs_f64());
        }
        self.rate_marked_at = Instant::now();
    }
}

/// Coarsen status codes to the known label set to bound cardinality.
fn status_label(status: u16) -> &'static str {
    match status {
        200 => "200",
        404 => "404",
        429 => "429",
        500 => "500",
        502 => "502",
        _ => "other",
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_collector() -> (MetricsRecorder, JoinHandle<()>, Arc<Metrics>, broadcast::Sender<()>) {
        let metrics = Arc::new(Metrics::new().unwrap());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (recorder, handle) = MetricsCollector::spawn(metrics.clone(), shutdown_rx);
        (recorder, handle, metrics, shutdown_tx)
    }

    #[tokio::test]
    async fn test_request_events_update_counters() {
        let (recorder, handle, metrics, shutdown_tx) = spawn_collector();

        recorder.record_request("GET", "/items/*", 200, Duration::from_millis(12));
        recorder.record_request("GET", "/items/*", 200, Duration::from_millis(8));
        recorder.record_request("GET", "/items/*", 429, Duration::from_millis(1));

        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(
            metrics
                .requests_total
                .with_label_values(&["GET", "/items/*", "200"])
                .get(),
            2
        );
        assert_eq!(
            metrics
                .requests_total
                .with_label_values(&["GET", "/items/*", "429"])
                .get(),
            1
        );

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_quota_events_count_blocks_only() {
        let (recorder, handle, metrics, shutdown_tx) = spawn_collector();

        recorder.record_quota("route", "route::/users/*", false);
        recorder.record_quota("route", "route::/users/*", true);

        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(
            metrics
                .rate_limit_blocked_total
                .with_label_values(&["route", "route::/users/*"])
                .get(),
            1
        );

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_events() {
        let (recorder, handle, metrics, shutdown_tx) = spawn_collector();

        for _ in 0..250 {
            recorder.record_request("GET", "/search", 200, Duration::from_millis(1));
        }

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(
            metrics
                .requests_total
                .with_label_values(&["GET", "/search", "200"])
                .get(),
            250
        );
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let (tx, _rx) = mpsc::channel(2);
        let recorder = MetricsRecorder {
            tx,
            metrics: metrics.clone(),
        };

        // No consumer is draining: the queue fills after two events and
        // the rest are dropped and counted.
        for _ in 0..10 {
            recorder.record_request("GET", "/search", 200, Duration::from_millis(1));
        }

        assert_eq!(metrics.dropped_events_total.get(), 8);
    }

    #[test]
    fn test_status_label_coarsening() {
        assert_eq!(status_label(200), "200");
        assert_eq!(status_label(429), "429");
        assert_eq!(status_label(502), "502");
        assert_eq!(status_label(301), "other");
        assert_eq!(status_label(418), "other");
    }
}
