//! Local mirror of every dispatched event.
//!
//! One line per event: `<RFC 3339 local time> <event as JSON>`.

use std::fs::{self, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::Path;

use chrono::{Local, SecondsFormat};

use super::SinkError;
use crate::decode::SchedLatencyEvent;

pub struct EventLog {
    writer: Box<dyn Write + Send>,
}

impl EventLog {
    pub fn stdout() -> Self {
        Self {
            writer: Box::new(io::stdout()),
        }
    }

    /// Append to `path`, creating it and its parent directories if needed.
    pub fn open_file(path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Box::new(LineWriter::new(file)),
        })
    }

    pub fn write_event(&mut self, event: &SchedLatencyEvent) -> Result<(), SinkError> {
        let json = serde_json::to_string(event)?;
        let now = Local::now().to_rfc3339_opts(SecondsFormat::Secs, false);
        writeln!(self.writer, "{} {}", now, json)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn event(pid: u32) -> SchedLatencyEvent {
        SchedLatencyEvent {
            pid,
            tid: pid + 1,
            delay_ns: 2_000,
            ts: 42,
            preempted_pid: 0,
            preempted_comm: String::new(),
            is_preempt: false,
            comm: "redis-server".to_string(),
        }
    }

    #[test]
    fn test_appends_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log").join("sched_events.log");

        let mut log = EventLog::open_file(&path).unwrap();
        log.write_event(&event(1)).unwrap();
        log.write_event(&event(2)).unwrap();
        log.flush().unwrap();
        drop(log);

        // Reopening appends instead of truncating.
        let mut log = EventLog::open_file(&path).unwrap();
        log.write_event(&event(3)).unwrap();
        log.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);

        for (line, pid) in lines.iter().zip([1u32, 2, 3]) {
            let (ts, json) = line.split_once(' ').unwrap();
            assert!(DateTime::parse_from_rfc3339(ts).is_ok(), "bad timestamp {ts}");

            let value: serde_json::Value = serde_json::from_str(json).unwrap();
            assert_eq!(value["pid"], pid);
            assert_eq!(value["comm"], "redis-server");
            assert_eq!(value["is_preempt"], false);
        }
    }
}
