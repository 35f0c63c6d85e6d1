//! Per-task scheduling aggregates.
//!
//! Two maps keyed by pid, both living for the whole process:
//! - `sched_metrics`: cumulative delay and how often the task preempted
//!   someone else,
//! - `sched_preempted`: how often the task was preempted.
//!
//! Entries are never evicted. Readers only ever get copies.
//!
//! Each `update` mutates a key through the map entry API, so the
//! load-mutate-store of one pid holds that key's shard lock. Concurrent
//! writers for the same pid therefore cannot lose increments.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::decode::SchedLatencyEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedMetrics {
    pub pid: u32,
    /// Last seen task name.
    pub comm: String,
    /// Timestamp of the last event for this pid.
    pub ts: u64,
    /// Sum of every observed scheduling delay.
    pub delay_ns: u64,
    /// Number of times this pid preempted another task.
    pub preempte_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedPreempted {
    pub pid: u32,
    pub comm: String,
    /// Number of times this pid was preempted by any other task.
    pub count: u64,
}

#[derive(Debug, Default)]
pub struct SchedCache {
    sched_metrics: DashMap<u32, SchedMetrics>,
    sched_preempted: DashMap<u32, SchedPreempted>,
}

impl SchedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the aggregates.
    pub fn update(&self, event: &SchedLatencyEvent) {
        let mut metrics = match self.sched_metrics.entry(event.pid) {
            Entry::Vacant(vacant) => {
                // First sighting only records the delay; preemption
                // bookkeeping starts with the next event.
                vacant.insert(SchedMetrics {
                    pid: event.pid,
                    comm: event.comm.clone(),
                    ts: event.ts,
                    delay_ns: event.delay_ns,
                    preempte_count: 0,
                });
                return;
            }
            Entry::Occupied(occupied) => occupied.into_ref(),
        };

        metrics.delay_ns = metrics.delay_ns.saturating_add(event.delay_ns);
        metrics.ts = event.ts;
        if !event.comm.is_empty() {
            metrics.comm.clone_from(&event.comm);
        }

        if !event.is_preempt {
            return;
        }

        metrics.preempte_count += 1;
        // Release the pid shard before touching the second map.
        drop(metrics);

        self.sched_preempted
            .entry(event.preempted_pid)
            .and_modify(|preempted| preempted.count += 1)
            .or_insert_with(|| SchedPreempted {
                pid: event.preempted_pid,
                comm: event.preempted_comm.clone(),
                count: 1,
            });
    }

    pub fn get_sched_metrics(&self, pid: u32) -> Option<SchedMetrics> {
        self.sched_metrics.get(&pid).map(|entry| entry.value().clone())
    }

    pub fn get_sched_preempted(&self, pid: u32) -> Option<SchedPreempted> {
        self.sched_preempted.get(&pid).map(|entry| entry.value().clone())
    }

    /// Snapshot of every tracked task, in no particular order.
    pub fn sched_metrics(&self) -> Vec<SchedMetrics> {
        self.sched_metrics
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Snapshot of every preempted task, in no particular order.
    pub fn sched_preempted(&self) -> Vec<SchedPreempted> {
        self.sched_preempted
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sched_metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sched_metrics.is_empty()
    }
}
