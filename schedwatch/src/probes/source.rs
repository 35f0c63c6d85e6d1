use std::future::Future;

use anyhow::{Context, Result};
use aya::{
    Ebpf,
    maps::{
        MapData,
        perf::{AsyncPerfEventArray, AsyncPerfEventArrayBuffer},
    },
    util::online_cpus,
};
use bytes::{Bytes, BytesMut};
use log::{debug, error, info, warn};
use schedwatch_common::SCHED_LATENCY_RECORD_SIZE;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::telemetry;

/// Samples buffered between the per-CPU readers and the ingestion loop.
const CHANNEL_CAPACITY: usize = 4096;

/// Samples read from a CPU buffer per wakeup.
const READ_BATCH: usize = 16;

/// A stream of raw kernel samples.
pub trait EventSource: Send {
    /// Wait for the next sample. `None` means the source is closed.
    fn next_record(&mut self) -> impl Future<Output = Option<Bytes>> + Send;
}

impl EventSource for mpsc::Receiver<Bytes> {
    fn next_record(&mut self) -> impl Future<Output = Option<Bytes>> + Send {
        self.recv()
    }
}

/// Fans in every per-CPU perf buffer into one ordered stream.
///
/// eBPF programs write to the buffer of whichever CPU they run on, so one
/// reader task per online CPU forwards samples into a bounded channel.
/// The channel has exactly one consumer: the ingestion loop.
pub struct PerfEventSource {
    rx: mpsc::Receiver<Bytes>,
    readers: Vec<JoinHandle<()>>,
}

impl PerfEventSource {
    pub fn open(bpf: &mut Ebpf, map_name: &str, cancel: CancellationToken) -> Result<Self> {
        let mut perf_array = AsyncPerfEventArray::try_from(
            bpf.take_map(map_name)
                .with_context(|| format!("Failed to get {} map", map_name))?,
        )?;

        let cpus = online_cpus()
            .map_err(|(_, error)| error)
            .context("Failed to list online CPUs")?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut readers = Vec::with_capacity(cpus.len());
        for cpu_id in cpus {
            let buf = perf_array
                .open(cpu_id, None)
                .with_context(|| format!("Failed to open perf buffer for CPU {}", cpu_id))?;
            readers.push(tokio::spawn(read_cpu(cpu_id, buf, tx.clone(), cancel.clone())));
        }
        info!("Reading {} from {} CPUs", map_name, readers.len());

        Ok(Self { rx, readers })
    }
}

impl EventSource for PerfEventSource {
    fn next_record(&mut self) -> impl Future<Output = Option<Bytes>> + Send {
        self.rx.recv()
    }
}

impl Drop for PerfEventSource {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

async fn read_cpu(
    cpu_id: u32,
    mut buf: AsyncPerfEventArrayBuffer<MapData>,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    let mut buffers = (0..READ_BATCH)
        .map(|_| BytesMut::with_capacity(SCHED_LATENCY_RECORD_SIZE + 8))
        .collect::<Vec<_>>();

    loop {
        let events = tokio::select! {
            _ = cancel.cancelled() => break,
            events = buf.read_events(&mut buffers) => events,
        };

        let events = match events {
            Ok(events) => events,
            Err(e) => {
                error!("[CPU {}] perf buffer read failed: {}", cpu_id, e);
                break;
            }
        };

        if events.lost > 0 {
            warn!("[CPU {}] lost {} sched samples", cpu_id, events.lost);
            telemetry::record_events_lost(events.lost as u64);
        }

        for sample in buffers.iter().take(events.read) {
            if tx.send(Bytes::copy_from_slice(sample)).await.is_err() {
                debug!("[CPU {}] ingestion stopped; reader exiting", cpu_id);
                return;
            }
        }
    }
    debug!("[CPU {}] reader exiting", cpu_id);
}
