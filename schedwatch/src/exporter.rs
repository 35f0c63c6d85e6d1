use std::sync::Arc;

use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};

use crate::cache::SchedCache;
use crate::decode::sanitize_file_name;

const LABELS: [&str; 2] = ["pid", "comm"];

/// Republishes the aggregation cache as Prometheus gauges.
///
/// Every render is a full resync from the cache. Series of exited tasks stay
/// visible because the cache never evicts.
pub struct SchedExporter {
    cache: Arc<SchedCache>,
    registry: Registry,
    sched_latencies: GaugeVec,
    sched_preempte: GaugeVec,
    sched_preempted: GaugeVec,
}

impl SchedExporter {
    pub fn new(cache: Arc<SchedCache>) -> prometheus::Result<Self> {
        let registry = Registry::new();

        let sched_latencies = GaugeVec::new(
            Opts::new("sched_latencies", "Cumulative CPU scheduling latency per task in ns."),
            &LABELS,
        )?;
        let sched_preempte = GaugeVec::new(
            Opts::new("sched_preempte", "Times the task preempted another task."),
            &LABELS,
        )?;
        let sched_preempted = GaugeVec::new(
            Opts::new("sched_preempted", "Times the task was preempted."),
            &LABELS,
        )?;

        registry.register(Box::new(sched_latencies.clone()))?;
        registry.register(Box::new(sched_preempte.clone()))?;
        registry.register(Box::new(sched_preempted.clone()))?;

        Ok(Self {
            cache,
            registry,
            sched_latencies,
            sched_preempte,
            sched_preempted,
        })
    }

    /// Copy the current cache contents into the gauges.
    pub fn update_from_cache(&self) {
        for metrics in self.cache.sched_metrics() {
            let pid = metrics.pid.to_string();
            let comm = sanitize_file_name(metrics.comm.as_bytes());
            let labels = [pid.as_str(), comm.as_str()];

            self.sched_latencies
                .with_label_values(&labels)
                .set(metrics.delay_ns as f64);
            if metrics.preempte_count > 0 {
                self.sched_preempte
                    .with_label_values(&labels)
                    .set(metrics.preempte_count as f64);
            }
        }

        for preempted in self.cache.sched_preempted() {
            let pid = preempted.pid.to_string();
            let comm = sanitize_file_name(preempted.comm.as_bytes());
            self.sched_preempted
                .with_label_values(&[pid.as_str(), comm.as_str()])
                .set(preempted.count as f64);
        }
    }

    /// Resync from the cache and encode the text exposition format.
    pub fn render(&self) -> prometheus::Result<String> {
        self.update_from_cache();

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
