//! Event dispatch to the configured primary sink plus the local mirror.
//!
//! The output is owned by the ingestion loop; nothing else pushes to it.

use log::{info, warn};
use thiserror::Error;

pub mod clickhouse;
pub mod event_log;
pub mod kafka;

pub use self::clickhouse::{BATCH_FLUSH_ROWS, BatchBackend, BatchSink, ClickHouseBackend};
pub use self::event_log::EventLog;
pub use self::kafka::{KafkaProducer, MessageProducer, StreamSink};

use crate::decode::SchedLatencyEvent;
use crate::settings::{OutputSettings, OutputType};
use crate::telemetry;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("clickhouse: {0}")]
    ClickHouse(#[from] ::clickhouse::error::Error),

    #[error("kafka: {0}")]
    Kafka(#[from] ::kafka::Error),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("event log: {0}")]
    Io(#[from] std::io::Error),

    #[error("sink worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("no open batch")]
    NoBatch,

    #[error("sink is closed")]
    Closed,
}

/// The primary destination chosen by `output.type`.
pub enum PrimarySink<B = ClickHouseBackend, P = KafkaProducer> {
    /// `file` and `stdout`: the mirror is the only destination.
    MirrorOnly,
    Batch(BatchSink<B>),
    Stream(StreamSink<P>),
}

impl<B, P> PrimarySink<B, P> {
    fn name(&self) -> &'static str {
        match self {
            PrimarySink::MirrorOnly => "mirror",
            PrimarySink::Batch(_) => "clickhouse",
            PrimarySink::Stream(_) => "kafka",
        }
    }
}

pub struct Output<B = ClickHouseBackend, P = KafkaProducer> {
    primary: PrimarySink<B, P>,
    mirror: EventLog,
}

impl Output {
    /// Connect the configured primary sink and open the mirror.
    pub async fn new(settings: &OutputSettings) -> Result<Self, SinkError> {
        let primary = match settings.output_type {
            OutputType::File | OutputType::Stdout => PrimarySink::MirrorOnly,
            OutputType::Clickhouse => {
                let backend = ClickHouseBackend::new(&settings.clickhouse);
                if settings.clickhouse.create_table {
                    backend.create_table().await?;
                }
                PrimarySink::Batch(BatchSink::new(backend).await?)
            }
            OutputType::Kafka => {
                let kafka = settings.kafka.clone();
                let producer =
                    tokio::task::spawn_blocking(move || KafkaProducer::connect(&kafka)).await??;
                PrimarySink::Stream(StreamSink::new(producer))
            }
        };

        let mirror = match settings.output_type {
            OutputType::Stdout => EventLog::stdout(),
            _ => EventLog::open_file(&settings.file.path)?,
        };

        info!("Output ready: primary sink {}", primary.name());
        Ok(Self::with_sinks(primary, mirror))
    }
}

impl<B: BatchBackend, P: MessageProducer> Output<B, P> {
    pub fn with_sinks(primary: PrimarySink<B, P>, mirror: EventLog) -> Self {
        Self { primary, mirror }
    }

    /// Deliver `event` to the primary sink and the mirror.
    ///
    /// The mirror is written even when the primary sink fails; the primary
    /// sink's error wins.
    pub async fn push(&mut self, event: &SchedLatencyEvent) -> Result<(), SinkError> {
        let primary = match &mut self.primary {
            PrimarySink::MirrorOnly => Ok(()),
            PrimarySink::Batch(sink) => sink.push(event).await,
            PrimarySink::Stream(sink) => sink.push(event).await,
        };
        if primary.is_err() {
            telemetry::record_sink_error(self.primary.name());
        }

        let mirrored = self.mirror.write_event(event);
        if mirrored.is_err() {
            telemetry::record_sink_error("mirror");
        }

        primary.and(mirrored)
    }

    /// Flush what is still buffered and release the connections.
    pub async fn close(&mut self) -> Result<(), SinkError> {
        let primary = match &mut self.primary {
            PrimarySink::MirrorOnly => Ok(()),
            PrimarySink::Batch(sink) => sink.close().await,
            PrimarySink::Stream(sink) => {
                sink.close();
                Ok(())
            }
        };
        if let Err(e) = self.mirror.flush() {
            warn!("Failed to flush event log: {}", e);
        }

        info!("Closed {} output", self.primary.name());
        self.primary = PrimarySink::MirrorOnly;
        primary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::clickhouse::tests::{MockBackend, Recorded, event};
    use std::sync::{Arc, atomic::Ordering};

    struct NoProducer;

    impl MessageProducer for NoProducer {
        fn send(&mut self, _key: &str, _value: &[u8]) -> Result<(), SinkError> {
            Err(SinkError::Closed)
        }
    }

    #[tokio::test]
    async fn test_batch_output_mirrors_every_event_and_flushes_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sched_events.log");
        let recorded = Arc::new(Recorded::default());

        let primary = PrimarySink::<_, NoProducer>::Batch(
            BatchSink::new(MockBackend::new(&recorded)).await.unwrap(),
        );
        let mut output = Output::with_sinks(primary, EventLog::open_file(&path).unwrap());

        for pid in 0..12 {
            output.push(&event(pid)).await.unwrap();
        }
        assert_eq!(recorded.sends.load(Ordering::SeqCst), 1);

        output.close().await.unwrap();
        assert_eq!(recorded.sends.load(Ordering::SeqCst), 2);
        assert_eq!(recorded.sent_rows.lock().unwrap().len(), 12);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 12);
    }

    #[tokio::test]
    async fn test_mirror_is_written_when_primary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sched_events.log");

        let primary = PrimarySink::<MockBackend, _>::Stream(StreamSink::new(NoProducer));
        let mut output = Output::with_sinks(primary, EventLog::open_file(&path).unwrap());

        assert!(output.push(&event(1)).await.is_err());
        assert!(output.push(&event(2)).await.is_err());
        output.close().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_file_output_only_mirrors() {
        let dir = tempfile::tempdir().unwrap();
        let settings = OutputSettings {
            output_type: OutputType::File,
            file: crate::settings::FileSettings {
                path: dir.path().join("nested").join("events.log"),
            },
            ..Default::default()
        };

        let mut output = Output::new(&settings).await.unwrap();
        output.push(&event(5)).await.unwrap();
        output.close().await.unwrap();

        let contents = std::fs::read_to_string(&settings.file.path).unwrap();
        assert!(contents.contains("\"pid\":5"));
    }
}
