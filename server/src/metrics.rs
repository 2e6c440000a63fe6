//! Prometheus metrics for the mirror and the firehose consumers.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Labels for per-event-type firehose counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EventLabels {
    pub kind: String,
}

pub struct Metrics {
    registry: Registry,

    /// Unix timestamp of the newest directory log entry seen.
    pub plc_last_event_timestamp: Gauge,

    /// Counter of directory log entries appended.
    pub plc_log_entries_total: Counter,

    /// Counter of firehose events processed, by event type.
    pub firehose_events_total: Family<EventLabels, Counter>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let plc_last_event_timestamp = Gauge::default();
        registry.register(
            "plc_last_event_timestamp_seconds",
            "Unix timestamp of the newest directory log entry seen",
            plc_last_event_timestamp.clone(),
        );

        let plc_log_entries_total = Counter::default();
        registry.register(
            "plc_log_entries_total",
            "Total number of directory log entries appended",
            plc_log_entries_total.clone(),
        );

        let firehose_events_total = Family::<EventLabels, Counter>::default();
        registry.register(
            "firehose_events_total",
            "Total number of firehose events processed",
            firehose_events_total.clone(),
        );

        Self {
            registry,
            plc_last_event_timestamp,
            plc_log_entries_total,
            firehose_events_total,
        }
    }

    pub fn record_event(&self, kind: &str) {
        self.firehose_events_total
            .get_or_create(&EventLabels {
                kind: kind.to_string(),
            })
            .inc();
    }

    /// Encode all metrics to Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)
            .expect("encoding metrics should not fail");
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_all_metrics() {
        let metrics = Metrics::new();
        metrics.plc_last_event_timestamp.set(1_700_000_000);
        metrics.plc_log_entries_total.inc();
        metrics.record_event("commit");

        let encoded = metrics.encode();
        assert!(encoded.contains("# HELP plc_last_event_timestamp_seconds"));
        assert!(encoded.contains("# HELP plc_log_entries_total"));
        assert!(encoded.contains("# HELP firehose_events_total"));
        assert!(encoded.contains("kind=\"commit\""));
    }
}
