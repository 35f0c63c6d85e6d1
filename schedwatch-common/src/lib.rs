#![cfg_attr(not(test), no_std)]

//! Record contract shared with the kernel-side scheduler program.
//!
//! The kernel program emits one [`SchedLatencyRecord`] per `sched_switch`
//! that crossed its latency threshold. The layout is packed and
//! little-endian; user space decodes it field by field in this order.

/// Length of `task_struct::comm`.
pub const TASK_COMM_LEN: usize = 16;

/// Perf event array the kernel program writes records into.
pub const SCHED_EVENTS_MAP: &str = "sched_events";

/// Tracepoint group of every scheduler program.
pub const SCHED_TRACEPOINT_GROUP: &str = "sched";

/// Tracepoints the collector knows how to attach, keyed by program name.
pub const SCHED_TRACEPOINTS: [&str; 3] = ["sched_wakeup", "sched_wakeup_new", "sched_switch"];

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct SchedLatencyRecord {
    /// Thread group id of the task that was switched in.
    pub pid: u32,
    pub tid: u32,
    /// Time between wakeup and switch-in.
    pub delay_ns: u64,
    pub ts: u64,
    /// Thread group id of the task that was switched out while still runnable.
    pub preempted_pid: u32,
    pub preempted_comm: [i8; TASK_COMM_LEN],
    /// 1 when the previous task was preempted, 0 otherwise.
    pub is_preempt: u64,
    pub comm: [i8; TASK_COMM_LEN],
}

pub const SCHED_LATENCY_RECORD_SIZE: usize = core::mem::size_of::<SchedLatencyRecord>();

const _: () = assert!(SCHED_LATENCY_RECORD_SIZE == 68);
