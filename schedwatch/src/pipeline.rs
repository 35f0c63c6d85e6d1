use std::sync::Arc;

use anyhow::Result;
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::cache::SchedCache;
use crate::decode::read_event;
use crate::output::{BatchBackend, MessageProducer, Output};
use crate::probes::EventSource;
use crate::telemetry;

/// The single consumer of the kernel event stream.
///
/// Each decoded event updates the cache and is pushed to the output.
/// Malformed samples and sink failures are logged and skipped. Returns when
/// `cancel` fires or the source closes, after flushing the output.
pub async fn run_ingestion<S, B, P>(
    mut source: S,
    cache: Arc<SchedCache>,
    mut output: Output<B, P>,
    cancel: CancellationToken,
) -> Result<()>
where
    S: EventSource,
    B: BatchBackend,
    P: MessageProducer,
{
    info!("Sched delay ingestion started");

    loop {
        let record = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Stopping sched delay ingestion");
                break;
            }
            record = read_event(&mut source) => record,
        };

        let Some(record) = record else {
            warn!("Sched event source closed");
            break;
        };
        telemetry::record_event_received();

        let event = match record {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping sched event: {}", e);
                telemetry::record_decode_error();
                continue;
            }
        };
        debug!(
            "pid={} tid={} comm={} delay_ns={} preempt={}",
            event.pid, event.tid, event.comm, event.delay_ns, event.is_preempt
        );

        cache.update(&event);

        if let Err(e) = output.push(&event).await {
            error!("Failed to push sched event: {}", e);
        }
    }

    if let Err(e) = output.close().await {
        error!("Failed to close output: {}", e);
    }
    Ok(())
}
