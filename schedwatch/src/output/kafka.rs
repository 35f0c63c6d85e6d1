use std::time::Duration;

use kafka::producer::{Producer, Record, RequiredAcks};
use log::{info, warn};

use super::SinkError;
use crate::decode::SchedLatencyEvent;
use crate::settings::KafkaSettings;

const ACK_TIMEOUT: Duration = Duration::from_secs(1);
const SEND_RETRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Synchronous keyed message delivery to a single topic.
pub trait MessageProducer: Send + 'static {
    fn send(&mut self, key: &str, value: &[u8]) -> Result<(), SinkError>;
}

pub struct KafkaProducer {
    producer: Producer,
    topic: String,
}

impl KafkaProducer {
    /// Connect to `brokers`; every send waits for all in-sync replicas.
    pub fn connect(settings: &KafkaSettings) -> Result<Self, SinkError> {
        let producer = Producer::from_hosts(settings.brokers.clone())
            .with_ack_timeout(ACK_TIMEOUT)
            .with_required_acks(RequiredAcks::All)
            .create()?;
        info!(
            "Connected kafka producer to {:?}, topic {}",
            settings.brokers, settings.topic
        );

        Ok(Self {
            producer,
            topic: settings.topic.clone(),
        })
    }
}

impl MessageProducer for KafkaProducer {
    fn send(&mut self, key: &str, value: &[u8]) -> Result<(), SinkError> {
        let Self { producer, topic } = self;
        with_retries(SEND_RETRIES, RETRY_BACKOFF, || {
            producer.send(&Record::from_key_value(topic.as_str(), key, value))?;
            Ok(())
        })
    }
}

/// Run `send` up to `retries + 1` times, sleeping `backoff` between attempts.
fn with_retries<F>(retries: u32, backoff: Duration, mut send: F) -> Result<(), SinkError>
where
    F: FnMut() -> Result<(), SinkError>,
{
    let mut attempt = 0;
    loop {
        match send() {
            Ok(()) => return Ok(()),
            Err(e) if attempt < retries => {
                attempt += 1;
                warn!("Kafka send failed (retry {}/{}): {}", attempt, retries, e);
                std::thread::sleep(backoff);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Streaming sink: one JSON message per event, keyed by the send time in
/// Unix seconds. Sends block off the async runtime.
pub struct StreamSink<P> {
    producer: Option<P>,
}

impl<P: MessageProducer> StreamSink<P> {
    pub fn new(producer: P) -> Self {
        Self {
            producer: Some(producer),
        }
    }

    pub async fn push(&mut self, event: &SchedLatencyEvent) -> Result<(), SinkError> {
        let value = serde_json::to_vec(event)?;
        let key = chrono::Utc::now().timestamp().to_string();

        let mut producer = self.producer.take().ok_or(SinkError::Closed)?;
        let (producer, sent) = tokio::task::spawn_blocking(move || {
            let sent = producer.send(&key, &value);
            (producer, sent)
        })
        .await?;
        self.producer = Some(producer);
        sent
    }

    pub fn close(&mut self) {
        self.producer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct MockProducer {
        messages: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
        fail: bool,
    }

    impl MessageProducer for MockProducer {
        fn send(&mut self, key: &str, value: &[u8]) -> Result<(), SinkError> {
            if self.fail {
                return Err(SinkError::Closed);
            }
            self.messages
                .lock()
                .unwrap()
                .push((key.to_string(), value.to_vec()));
            Ok(())
        }
    }

    fn event() -> SchedLatencyEvent {
        SchedLatencyEvent {
            pid: 31,
            tid: 32,
            delay_ns: 9_000,
            ts: 1_234,
            preempted_pid: 40,
            preempted_comm: "java".to_string(),
            is_preempt: true,
            comm: "envoy".to_string(),
        }
    }

    #[tokio::test]
    async fn test_push_sends_json_keyed_by_unix_seconds() {
        let producer = MockProducer::default();
        let messages = producer.messages.clone();
        let mut sink = StreamSink::new(producer);

        let before = chrono::Utc::now().timestamp();
        sink.push(&event()).await.unwrap();
        sink.push(&event()).await.unwrap();
        let after = chrono::Utc::now().timestamp();

        let messages = messages.lock().unwrap();
        assert_eq!(messages.len(), 2);

        let (key, value) = &messages[0];
        let key: i64 = key.parse().unwrap();
        assert!((before..=after).contains(&key));

        let value: serde_json::Value = serde_json::from_slice(value).unwrap();
        assert_eq!(value["pid"], 31);
        assert_eq!(value["preempted_comm"], "java");
        assert_eq!(value["is_preempt"], true);
    }

    #[tokio::test]
    async fn test_send_failure_is_returned_and_sink_stays_usable() {
        let mut sink = StreamSink::new(MockProducer {
            fail: true,
            ..Default::default()
        });
        assert!(sink.push(&event()).await.is_err());
        assert!(sink.push(&event()).await.is_err());

        sink.close();
        assert!(matches!(sink.push(&event()).await, Err(SinkError::Closed)));
    }

    #[test]
    fn test_send_is_retried_until_success() {
        let mut calls = 0;
        let result = with_retries(3, Duration::ZERO, || {
            calls += 1;
            if calls < 3 {
                return Err(SinkError::Closed);
            }
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_send_gives_up_after_retries() {
        let mut calls = 0;
        let result = with_retries(3, Duration::ZERO, || {
            calls += 1;
            Err(SinkError::Closed)
        });
        assert!(matches!(result, Err(SinkError::Closed)));
        assert_eq!(calls, 4);
    }
}
