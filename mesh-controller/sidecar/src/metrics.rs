use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter,
        family::Family,
        gauge::Gauge,
        histogram::{exponential_buckets, Histogram},
    },
    registry::Registry,
};

/// Proxy reconciliation metrics.
#[derive(Clone, Debug)]
pub struct ProxyMetrics {
    connected: Gauge,
    config_updates: Family<ResultLabels, Counter>,
    broadcast_events: Counter,
    job_duration: Histogram,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ResultLabels {
    result: String,
}

/// The outcome of publishing a proxy's document.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum UpdateResult {
    Published,
    Unchanged,
    Failed,
}

// === impl ProxyMetrics ===

impl ProxyMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let connected = Gauge::default();
        prom.register(
            "proxy_connect_count",
            "Number of registered proxies",
            connected.clone(),
        );

        let config_updates = Family::default();
        prom.register(
            "proxy_config_update",
            "Count of proxy configuration rebuilds by result",
            config_updates.clone(),
        );

        let broadcast_events = Counter::default();
        prom.register(
            "proxy_broadcast_event_count",
            "Count of update events broadcast to proxies",
            broadcast_events.clone(),
        );

        // 1ms to ~16s
        let job_duration = Histogram::new(exponential_buckets(0.001, 2.0, 15));
        prom.register(
            "proxy_job_duration_seconds",
            "Time taken to rebuild a proxy configuration",
            job_duration.clone(),
        );

        Self {
            connected,
            config_updates,
            broadcast_events,
            job_duration,
        }
    }

    pub(crate) fn set_connected(&self, count: usize) {
        self.connected.set(count as i64);
    }

    pub(crate) fn config_update(&self, result: UpdateResult) {
        let result = match result {
            UpdateResult::Published => "published",
            UpdateResult::Unchanged => "unchanged",
            UpdateResult::Failed => "failed",
        };
        self.config_updates
            .get_or_create(&ResultLabels {
                result: result.to_string(),
            })
            .inc();
    }

    pub(crate) fn broadcast_event(&self) {
        self.broadcast_events.inc();
    }

    pub(crate) fn job_duration(&self, elapsed: std::time::Duration) {
        self.job_duration.observe(elapsed.as_secs_f64());
    }
}

impl Default for ProxyMetrics {
    /// Metrics recorded into a throwaway registry.
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn updates_are_counted_by_result() {
        let mut prom = Registry::with_prefix("fsm");
        let metrics = ProxyMetrics::register(&mut prom);
        metrics.set_connected(3);
        metrics.config_update(UpdateResult::Published);
        metrics.config_update(UpdateResult::Published);
        metrics.config_update(UpdateResult::Unchanged);

        let mut text = String::new();
        encode(&mut text, &prom).unwrap();
        assert!(text.contains("fsm_proxy_connect_count 3"), "{text}");
        assert!(
            text.contains("fsm_proxy_config_update_total{result=\"published\"} 2"),
            "{text}"
        );
        assert!(
            text.contains("fsm_proxy_config_update_total{result=\"unchanged\"} 1"),
            "{text}"
        );
    }
}
