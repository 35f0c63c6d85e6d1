//! Decoding of raw `sched_events` samples into [`SchedLatencyEvent`]s.
//!
//! The record layout is a hard contract with the kernel program (see
//! `schedwatch_common::SchedLatencyRecord`): fixed-width little-endian
//! fields, no versioning. Fields are read one by one so the decoder never
//! depends on host alignment or endianness.

use bytes::Buf;
use schedwatch_common::{SCHED_LATENCY_RECORD_SIZE, TASK_COMM_LEN};
use serde::Serialize;
use thiserror::Error;

use crate::probes::EventSource;

/// Perf samples are padded to 8 bytes together with their 4-byte size header.
const MAX_TRAILING_PADDING: usize = 7;

/// One scheduling transition as reported by the kernel program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedLatencyEvent {
    pub pid: u32,
    pub tid: u32,
    pub delay_ns: u64,
    pub ts: u64,
    pub preempted_pid: u32,
    pub preempted_comm: String,
    pub is_preempt: bool,
    pub comm: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty sched latency sample")]
    Empty,

    #[error("sched latency sample too short: {size} bytes, expected {expected}")]
    Truncated { size: usize, expected: usize },

    #[error("sched latency sample has unexpected length: {size} bytes, expected {expected}")]
    LengthMismatch { size: usize, expected: usize },
}

/// Decode one raw sample.
pub fn decode_event(data: &[u8]) -> Result<SchedLatencyEvent, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }
    if data.len() < SCHED_LATENCY_RECORD_SIZE {
        return Err(DecodeError::Truncated {
            size: data.len(),
            expected: SCHED_LATENCY_RECORD_SIZE,
        });
    }
    if data.len() > SCHED_LATENCY_RECORD_SIZE + MAX_TRAILING_PADDING {
        return Err(DecodeError::LengthMismatch {
            size: data.len(),
            expected: SCHED_LATENCY_RECORD_SIZE,
        });
    }

    let mut buf = &data[..SCHED_LATENCY_RECORD_SIZE];
    let mut preempted_comm = [0u8; TASK_COMM_LEN];
    let mut comm = [0u8; TASK_COMM_LEN];

    let pid = buf.get_u32_le();
    let tid = buf.get_u32_le();
    let delay_ns = buf.get_u64_le();
    let ts = buf.get_u64_le();
    let preempted_pid = buf.get_u32_le();
    buf.copy_to_slice(&mut preempted_comm);
    let is_preempt = buf.get_u64_le() != 0;
    buf.copy_to_slice(&mut comm);

    Ok(SchedLatencyEvent {
        pid,
        tid,
        delay_ns,
        ts,
        preempted_pid,
        preempted_comm: comm_to_string(&preempted_comm),
        is_preempt,
        comm: comm_to_string(&comm),
    })
}

/// Wait for the next sample from `source` and decode it.
///
/// Returns `None` once the source is closed.
pub async fn read_event<S: EventSource>(
    source: &mut S,
) -> Option<Result<SchedLatencyEvent, DecodeError>> {
    let record = source.next_record().await?;
    Some(decode_event(&record))
}

/// Convert a NUL-padded `comm` buffer into a task name.
pub fn comm_to_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    sanitize_string(&String::from_utf8_lossy(&raw[..end]))
}

pub fn sanitize_string(s: &str) -> String {
    s.trim().to_string()
}

/// Keep only printable ASCII (0x20..=0x7E).
///
/// Used for identifiers that may originate from file paths and for metric
/// label values.
pub fn sanitize_file_name(raw: &[u8]) -> String {
    raw.iter()
        .filter(|b| (0x20..=0x7e).contains(*b))
        .map(|&b| b as char)
        .collect()
}

#[cfg(test)]
pub(crate) fn encode_event(event: &SchedLatencyEvent) -> Vec<u8> {
    use bytes::BufMut;

    fn comm_bytes(comm: &str) -> [u8; TASK_COMM_LEN] {
        let mut out = [0u8; TASK_COMM_LEN];
        let len = comm.len().min(TASK_COMM_LEN - 1);
        out[..len].copy_from_slice(&comm.as_bytes()[..len]);
        out
    }

    let mut buf = Vec::with_capacity(SCHED_LATENCY_RECORD_SIZE);
    buf.put_u32_le(event.pid);
    buf.put_u32_le(event.tid);
    buf.put_u64_le(event.delay_ns);
    buf.put_u64_le(event.ts);
    buf.put_u32_le(event.preempted_pid);
    buf.put_slice(&comm_bytes(&event.preempted_comm));
    buf.put_u64_le(event.is_preempt as u64);
    buf.put_slice(&comm_bytes(&event.comm));
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn sample() -> SchedLatencyEvent {
        SchedLatencyEvent {
            pid: 4242,
            tid: 4243,
            delay_ns: 1_500_000,
            ts: 987_654_321,
            preempted_pid: 77,
            preempted_comm: "kworker/0:1".to_string(),
            is_preempt: true,
            comm: "postgres".to_string(),
        }
    }

    #[test]
    fn test_decode_event() {
        let event = sample();
        let raw = encode_event(&event);
        assert_eq!(raw.len(), SCHED_LATENCY_RECORD_SIZE);
        assert_eq!(decode_event(&raw), Ok(event));
    }

    #[test]
    fn test_decode_accepts_alignment_padding() {
        let mut raw = encode_event(&sample());
        raw.extend_from_slice(&[0u8; 4]);
        assert_eq!(decode_event(&raw), Ok(sample()));
    }

    #[test]
    fn test_decode_rejects_empty_sample() {
        assert_eq!(decode_event(&[]), Err(DecodeError::Empty));
    }

    #[test]
    fn test_decode_rejects_short_sample() {
        let raw = encode_event(&sample());
        assert_eq!(
            decode_event(&raw[..SCHED_LATENCY_RECORD_SIZE - 1]),
            Err(DecodeError::Truncated {
                size: SCHED_LATENCY_RECORD_SIZE - 1,
                expected: SCHED_LATENCY_RECORD_SIZE,
            })
        );
    }

    #[test]
    fn test_decode_rejects_oversized_sample() {
        let raw = vec![0u8; SCHED_LATENCY_RECORD_SIZE * 2];
        assert!(matches!(
            decode_event(&raw),
            Err(DecodeError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_comm_is_trimmed_at_first_nul() {
        assert_eq!(comm_to_string(b"bash\0\0\0\0"), "bash");
        assert_eq!(comm_to_string(b"  nginx \0garbage"), "nginx");
        assert_eq!(comm_to_string(b"\0\0\0"), "");
        assert_eq!(comm_to_string(b"0123456789abcdef"), "0123456789abcdef");
    }

    #[test]
    fn test_non_preempt_flag() {
        let mut event = sample();
        event.is_preempt = false;
        event.preempted_pid = 0;
        event.preempted_comm = String::new();
        let decoded = decode_event(&encode_event(&event)).unwrap();
        assert!(!decoded.is_preempt);
        assert_eq!(decoded.preempted_comm, "");
    }

    #[test]
    fn test_sanitize_file_name_keeps_printable_ascii() {
        assert_eq!(sanitize_file_name(b"/var/log/\x01app\x7f.log\n"), "/var/log/app.log");
        assert_eq!(sanitize_file_name("caf\u{e9}".as_bytes()), "caf");
    }

    #[tokio::test]
    async fn test_read_event_from_source() {
        let (tx, mut rx) = mpsc::channel::<Bytes>(4);
        tx.send(Bytes::from(encode_event(&sample()))).await.unwrap();
        tx.send(Bytes::new()).await.unwrap();
        drop(tx);

        assert_eq!(read_event(&mut rx).await, Some(Ok(sample())));
        assert_eq!(read_event(&mut rx).await, Some(Err(DecodeError::Empty)));
        assert_eq!(read_event(&mut rx).await, None);
    }
}
