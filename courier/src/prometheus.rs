//! Prometheus metrics built from [`Stats`].
//!
//! # Example
//!
//! ```rust,ignore
//! use courier::Storage;
//!
//! async fn example(storage: &Storage) -> Result<(), courier::CourierError> {
//!     let metrics = storage.metrics().await?;
//!     println!("{}", metrics.encode_to_string()?);
//!     Ok(())
//! }
//! ```

use prometheus_client::{
    encoding::{EncodeLabelSet, text::encode},
    metrics::{family::Family, gauge::Gauge},
    registry::Registry,
};
use std::sync::atomic::AtomicI64;

use crate::stats::Stats;

/// Label set for queue-level metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct QueueLabels {
    pub queue: String,
}

/// A registry snapshot of the store. Build one per scrape.
pub struct PrometheusMetrics {
    registry: Registry,
}

fn gauge(value: usize) -> Gauge<i64, AtomicI64> {
    let gauge = Gauge::<i64, AtomicI64>::default();
    gauge.set(i64::try_from(value).unwrap_or(i64::MAX));
    gauge
}

impl PrometheusMetrics {
    #[must_use]
    pub fn from_stats(stats: &Stats) -> Self {
        Self::from_stats_with_prefix(stats, "courier")
    }

    #[must_use]
    pub fn from_stats_with_prefix(stats: &Stats, prefix: &str) -> Self {
        let mut registry = Registry::with_prefix(prefix);

        registry.register(
            "waiting_total",
            "Jobs waiting to be claimed",
            gauge(stats.global.waiting),
        );
        registry.register(
            "delayed_total",
            "Jobs not due yet",
            gauge(stats.global.delayed),
        );
        registry.register(
            "active_total",
            "Jobs currently leased by a worker",
            gauge(stats.global.active),
        );
        registry.register(
            "completed_total",
            "Completed jobs still retained",
            gauge(stats.global.completed),
        );
        registry.register(
            "dead_total",
            "Dead jobs still retained",
            gauge(stats.global.dead),
        );

        let queue_waiting = Family::<QueueLabels, Gauge<i64, AtomicI64>>::default();
        let queue_delayed = Family::<QueueLabels, Gauge<i64, AtomicI64>>::default();
        let queue_active = Family::<QueueLabels, Gauge<i64, AtomicI64>>::default();
        let queue_repeating = Family::<QueueLabels, Gauge<i64, AtomicI64>>::default();

        for queue_stats in &stats.queues {
            let labels = QueueLabels {
                queue: queue_stats.queue.clone(),
            };
            queue_waiting
                .get_or_create(&labels)
                .set(queue_stats.waiting as i64);
            queue_delayed
                .get_or_create(&labels)
                .set(queue_stats.delayed as i64);
            queue_active
                .get_or_create(&labels)
                .set(queue_stats.active as i64);
            queue_repeating
                .get_or_create(&labels)
                .set(queue_stats.repeating as i64);
        }

        registry.register(
            "queue_waiting",
            "Jobs waiting to be claimed per queue",
            queue_waiting,
        );
        registry.register("queue_delayed", "Jobs not due yet per queue", queue_delayed);
        registry.register(
            "queue_active",
            "Jobs currently leased per queue",
            queue_active,
        );
        registry.register(
            "queue_repeating",
            "Repeating schedules per queue",
            queue_repeating,
        );

        Self { registry }
    }

    /// Returns a reference to the underlying Prometheus registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encodes the metrics to the `OpenMetrics` text format.
    pub fn encode(&self, writer: &mut String) -> Result<(), std::fmt::Error> {
        encode(writer, &self.registry)
    }

    pub fn encode_to_string(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        self.encode(&mut buffer)?;
        Ok(buffer)
    }
}
