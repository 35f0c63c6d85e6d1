//! Batched inserts into the `sched_latency` ClickHouse table.

use std::future::Future;

use clickhouse::insert::Insert;
use clickhouse::{Client, Compression, Row};
use log::{debug, info};
use serde::Serialize;

use super::SinkError;
use crate::decode::{SchedLatencyEvent, sanitize_string};
use crate::settings::ClickHouseSettings;
use crate::telemetry;

pub const SCHED_LATENCY_TABLE: &str = "sched_latency";

/// Rows buffered before the open batch is sent.
pub const BATCH_FLUSH_ROWS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Row, Serialize)]
pub struct SchedLatencyRow {
    pub pid: u32,
    pub tid: u32,
    pub delay_ns: u64,
    pub ts: u64,
    pub preempted_pid: u32,
    pub preempted_comm: String,
    pub is_preempt: u64,
    pub comm: String,
}

impl From<&SchedLatencyEvent> for SchedLatencyRow {
    fn from(event: &SchedLatencyEvent) -> Self {
        Self {
            pid: event.pid,
            tid: event.tid,
            delay_ns: event.delay_ns,
            ts: event.ts,
            preempted_pid: event.preempted_pid,
            preempted_comm: sanitize_string(&event.preempted_comm),
            is_preempt: event.is_preempt as u64,
            comm: sanitize_string(&event.comm),
        }
    }
}

/// A store that accepts rows through one open batch at a time.
pub trait BatchBackend: Send {
    /// Open a new batch.
    fn prepare(&mut self) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Add a row to the open batch.
    fn append(
        &mut self,
        row: &SchedLatencyRow,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Send the open batch. The batch is consumed even if sending fails.
    fn send(&mut self) -> impl Future<Output = Result<(), SinkError>> + Send;
}

pub struct ClickHouseBackend {
    client: Client,
    insert: Option<Insert<SchedLatencyRow>>,
}

impl ClickHouseBackend {
    pub fn new(settings: &ClickHouseSettings) -> Self {
        let client = Client::default()
            .with_url(settings.url())
            .with_user(&settings.username)
            .with_password(&settings.password)
            .with_database(&settings.database)
            .with_compression(Compression::Lz4);

        Self {
            client,
            insert: None,
        }
    }

    /// Create `sched_latency` if it does not exist yet.
    pub async fn create_table(&self) -> Result<(), SinkError> {
        let schema = include_str!("schema.sql");
        for statement in schema.split(';') {
            let statement = statement
                .lines()
                .filter(|line| !line.trim_start().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");
            if statement.trim().is_empty() {
                continue;
            }
            self.client.query(&statement).execute().await?;
        }
        info!("Ensured ClickHouse table {} exists", SCHED_LATENCY_TABLE);
        Ok(())
    }
}

impl BatchBackend for ClickHouseBackend {
    async fn prepare(&mut self) -> Result<(), SinkError> {
        self.insert = Some(self.client.insert(SCHED_LATENCY_TABLE)?);
        Ok(())
    }

    async fn append(&mut self, row: &SchedLatencyRow) -> Result<(), SinkError> {
        let insert = self.insert.as_mut().ok_or(SinkError::NoBatch)?;
        insert.write(row).await?;
        Ok(())
    }

    async fn send(&mut self) -> Result<(), SinkError> {
        let insert = self.insert.take().ok_or(SinkError::NoBatch)?;
        insert.end().await?;
        Ok(())
    }
}

/// Columnar sink: appends rows and sends every [`BATCH_FLUSH_ROWS`] rows.
///
/// A failed send drops the rows of that batch. A batch that cannot be
/// opened, or that rejects a row, is reopened on the next push.
pub struct BatchSink<B> {
    backend: B,
    open: bool,
    rows: usize,
}

impl<B: BatchBackend> BatchSink<B> {
    pub async fn new(mut backend: B) -> Result<Self, SinkError> {
        backend.prepare().await?;
        Ok(Self {
            backend,
            open: true,
            rows: 0,
        })
    }

    pub async fn push(&mut self, event: &SchedLatencyEvent) -> Result<(), SinkError> {
        if !self.open {
            self.backend.prepare().await?;
            self.open = true;
        }

        let row = SchedLatencyRow::from(event);
        if let Err(e) = self.backend.append(&row).await {
            self.open = false;
            self.rows = 0;
            return Err(e);
        }
        self.rows += 1;

        if self.rows >= BATCH_FLUSH_ROWS {
            self.flush().await?;
        }
        Ok(())
    }

    /// Rows appended to the open batch.
    pub fn pending_rows(&self) -> usize {
        self.rows
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        let rows = std::mem::take(&mut self.rows);
        let sent = self.backend.send().await;
        let prepared = self.backend.prepare().await;
        self.open = prepared.is_ok();

        sent?;
        debug!("Flushed {} rows to {}", rows, SCHED_LATENCY_TABLE);
        telemetry::record_batch_flushed();
        prepared
    }

    /// Send a partially filled batch.
    pub async fn close(&mut self) -> Result<(), SinkError> {
        if self.rows == 0 {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.rows);
        self.open = false;
        self.backend.send().await?;
        info!("Flushed final {} rows to {}", rows, SCHED_LATENCY_TABLE);
        telemetry::record_batch_flushed();
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    #[derive(Default)]
    pub(crate) struct Recorded {
        pub prepares: AtomicUsize,
        pub sends: AtomicUsize,
        pub fail_send: AtomicBool,
        pub fail_append: AtomicBool,
        pub failing_prepares: AtomicUsize,
        pub sent_rows: Mutex<Vec<SchedLatencyRow>>,
    }

    pub(crate) struct MockBackend {
        pub recorded: Arc<Recorded>,
        open: Option<Vec<SchedLatencyRow>>,
    }

    impl MockBackend {
        pub fn new(recorded: &Arc<Recorded>) -> Self {
            Self {
                recorded: recorded.clone(),
                open: None,
            }
        }
    }

    impl BatchBackend for MockBackend {
        async fn prepare(&mut self) -> Result<(), SinkError> {
            self.recorded.prepares.fetch_add(1, Ordering::SeqCst);
            self.open = None;
            let failing = &self.recorded.failing_prepares;
            if failing
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SinkError::NoBatch);
            }
            self.open = Some(Vec::new());
            Ok(())
        }

        async fn append(&mut self, row: &SchedLatencyRow) -> Result<(), SinkError> {
            if self.recorded.fail_append.load(Ordering::SeqCst) {
                return Err(SinkError::Closed);
            }
            let open = self.open.as_mut().ok_or(SinkError::NoBatch)?;
            open.push(row.clone());
            Ok(())
        }

        async fn send(&mut self) -> Result<(), SinkError> {
            let rows = self.open.take().ok_or(SinkError::NoBatch)?;
            if self.recorded.fail_send.load(Ordering::SeqCst) {
                return Err(SinkError::NoBatch);
            }
            self.recorded.sends.fetch_add(1, Ordering::SeqCst);
            self.recorded.sent_rows.lock().unwrap().extend(rows);
            Ok(())
        }
    }

    pub(crate) fn event(pid: u32) -> SchedLatencyEvent {
        SchedLatencyEvent {
            pid,
            tid: pid,
            delay_ns: 100,
            ts: pid as u64,
            preempted_pid: 7,
            preempted_comm: " kworker ".to_string(),
            is_preempt: true,
            comm: "nginx".to_string(),
        }
    }

    #[tokio::test]
    async fn test_ten_rows_flush_once() {
        let recorded = Arc::new(Recorded::default());
        let mut sink = BatchSink::new(MockBackend::new(&recorded)).await.unwrap();

        for pid in 0..10 {
            sink.push(&event(pid)).await.unwrap();
        }

        assert_eq!(recorded.sends.load(Ordering::SeqCst), 1);
        assert_eq!(recorded.prepares.load(Ordering::SeqCst), 2);
        assert_eq!(sink.pending_rows(), 0);

        let sent = recorded.sent_rows.lock().unwrap();
        assert_eq!(sent.len(), 10);
        assert_eq!(sent[3].pid, 3);
        assert_eq!(sent[3].preempted_comm, "kworker");
        assert_eq!(sent[3].is_preempt, 1);
    }

    #[tokio::test]
    async fn test_nine_rows_do_not_flush() {
        let recorded = Arc::new(Recorded::default());
        let mut sink = BatchSink::new(MockBackend::new(&recorded)).await.unwrap();

        for pid in 0..9 {
            sink.push(&event(pid)).await.unwrap();
        }

        assert_eq!(recorded.sends.load(Ordering::SeqCst), 0);
        assert_eq!(recorded.prepares.load(Ordering::SeqCst), 1);
        assert_eq!(sink.pending_rows(), 9);
    }

    #[tokio::test]
    async fn test_close_sends_partial_batch() {
        let recorded = Arc::new(Recorded::default());
        let mut sink = BatchSink::new(MockBackend::new(&recorded)).await.unwrap();

        for pid in 0..13 {
            sink.push(&event(pid)).await.unwrap();
        }
        sink.close().await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(recorded.sends.load(Ordering::SeqCst), 2);
        assert_eq!(recorded.sent_rows.lock().unwrap().len(), 13);
    }

    #[tokio::test]
    async fn test_failed_flush_drops_batch_and_continues() {
        let recorded = Arc::new(Recorded::default());
        let mut sink = BatchSink::new(MockBackend::new(&recorded)).await.unwrap();

        recorded.fail_send.store(true, Ordering::SeqCst);
        for pid in 0..9 {
            sink.push(&event(pid)).await.unwrap();
        }
        assert!(sink.push(&event(9)).await.is_err());
        assert_eq!(sink.pending_rows(), 0);
        assert_eq!(recorded.prepares.load(Ordering::SeqCst), 2);

        recorded.fail_send.store(false, Ordering::SeqCst);
        for pid in 10..20 {
            sink.push(&event(pid)).await.unwrap();
        }
        let sent = recorded.sent_rows.lock().unwrap();
        assert_eq!(sent.len(), 10);
        assert_eq!(sent[0].pid, 10);
    }

    #[tokio::test]
    async fn test_failed_prepare_is_retried_on_next_push() {
        let recorded = Arc::new(Recorded::default());
        let mut sink = BatchSink::new(MockBackend::new(&recorded)).await.unwrap();

        recorded.failing_prepares.store(1, Ordering::SeqCst);
        for pid in 0..9 {
            sink.push(&event(pid)).await.unwrap();
        }
        assert!(sink.push(&event(9)).await.is_err());
        assert_eq!(recorded.sends.load(Ordering::SeqCst), 1);

        for pid in 10..20 {
            sink.push(&event(pid)).await.unwrap();
        }
        assert_eq!(recorded.sends.load(Ordering::SeqCst), 2);
        assert_eq!(recorded.prepares.load(Ordering::SeqCst), 4);

        let sent = recorded.sent_rows.lock().unwrap();
        assert_eq!(sent.len(), 20);
        assert_eq!(sent[10].pid, 10);
    }

    #[tokio::test]
    async fn test_rejected_row_reopens_batch() {
        let recorded = Arc::new(Recorded::default());
        let mut sink = BatchSink::new(MockBackend::new(&recorded)).await.unwrap();

        for pid in 0..3 {
            sink.push(&event(pid)).await.unwrap();
        }
        recorded.fail_append.store(true, Ordering::SeqCst);
        assert!(sink.push(&event(3)).await.is_err());
        assert_eq!(sink.pending_rows(), 0);

        recorded.fail_append.store(false, Ordering::SeqCst);
        for pid in 4..14 {
            sink.push(&event(pid)).await.unwrap();
        }
        assert_eq!(recorded.prepares.load(Ordering::SeqCst), 3);

        let sent = recorded.sent_rows.lock().unwrap();
        assert_eq!(sent.len(), 10);
        assert_eq!(sent[0].pid, 4);
    }
}
