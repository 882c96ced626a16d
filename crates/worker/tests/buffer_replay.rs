//! Buffer and recovery behavior that needs no datastore: checkpoint
//! truncation, crash retention, bad-line quarantine, and replay.

use std::collections::{HashMap, VecDeque};
use std::fs;

use siwatt_common::types::{BufferedRecord, Sample};
use siwatt_worker::buffer::recovery::{HandlerFactory, RecoveryManager};
use siwatt_worker::buffer::{FileBuffer, ProcessDecision, RecordHandler};

fn record(device_code: &str, datetime: &str, energy: f64) -> BufferedRecord {
    BufferedRecord {
        username: "alice".into(),
        device_code: device_code.into(),
        device_id: 1,
        payload: Sample {
            datetime: datetime.into(),
            voltage: 220.0,
            current: 1.0,
            power: 220.0,
            energy,
            frequency: 50.0,
            pf: 1.0,
            device_id: None,
        },
    }
}

/// Handler that replays a scripted list of decisions and records what it saw.
#[derive(Default)]
struct Script {
    decisions: VecDeque<ProcessDecision>,
    seen: Vec<String>,
}

impl Script {
    fn with(decisions: Vec<ProcessDecision>) -> Self {
        Self {
            decisions: decisions.into(),
            seen: Vec::new(),
        }
    }
}

impl RecordHandler for Script {
    async fn handle(&mut self, record: &BufferedRecord) -> ProcessDecision {
        self.seen.push(record.payload.datetime.clone());
        self.decisions
            .pop_front()
            .unwrap_or_else(ProcessDecision::checkpoint)
    }
}

#[tokio::test]
async fn draining_with_checkpoints_removes_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = FileBuffer::new(dir.path()).unwrap();

    for i in 0..3 {
        let rec = record("SWM001", &format!("01-01-2024 10:00:{i:02}"), 100.0);
        buffer.append("SWM001", &rec).await.unwrap();
    }

    let mut handler = Script::default();
    let outcome = buffer.process("SWM001", &mut handler).await.unwrap();

    assert_eq!(outcome.processed, 3);
    assert_eq!(outcome.remaining, 0);
    assert_eq!(handler.seen.len(), 3);
    assert!(!dir.path().join("SWM001.jsonl").exists());
}

#[tokio::test]
async fn failure_stops_the_pass_and_retains_from_last_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = FileBuffer::new(dir.path()).unwrap();

    for i in 0..4 {
        let rec = record("SWM001", &format!("01-01-2024 10:00:{i:02}"), 100.0);
        buffer.append("SWM001", &rec).await.unwrap();
    }

    // First line checkpoints, second fails: lines 2-4 must survive.
    let mut handler = Script::with(vec![
        ProcessDecision::checkpoint(),
        ProcessDecision::failure(),
    ]);
    let outcome = buffer.process("SWM001", &mut handler).await.unwrap();

    assert_eq!(outcome.processed, 1);
    assert_eq!(outcome.remaining, 3);
    assert_eq!(handler.seen.len(), 2);

    let kept = fs::read_to_string(dir.path().join("SWM001.jsonl")).unwrap();
    assert_eq!(kept.lines().count(), 3);
    assert!(kept.contains("10:00:01"));
    assert!(!kept.contains("10:00:00\""));
}

#[tokio::test]
async fn success_without_checkpoint_leaves_the_file_for_replay() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = FileBuffer::new(dir.path()).unwrap();

    for i in 0..3 {
        let rec = record("SWM001", &format!("01-01-2024 10:00:{i:02}"), 100.0);
        buffer.append("SWM001", &rec).await.unwrap();
    }

    // Processed but never checkpointed — the open-minute crash case.
    let mut handler = Script::with(vec![
        ProcessDecision::processed(),
        ProcessDecision::processed(),
        ProcessDecision::processed(),
    ]);
    let outcome = buffer.process("SWM001", &mut handler).await.unwrap();

    assert_eq!(outcome.processed, 3);
    assert_eq!(outcome.remaining, 3);
    assert!(dir.path().join("SWM001.jsonl").exists());

    // A later pass (post-restart) sees the same three records again.
    let mut replay = Script::default();
    let outcome = buffer.process("SWM001", &mut replay).await.unwrap();
    assert_eq!(outcome.processed, 3);
    assert_eq!(outcome.remaining, 0);
    assert_eq!(replay.seen, handler.seen);
    assert!(!dir.path().join("SWM001.jsonl").exists());
}

#[tokio::test]
async fn checkpoint_mid_pass_truncates_only_up_to_the_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = FileBuffer::new(dir.path()).unwrap();

    for i in 0..4 {
        let rec = record("SWM001", &format!("01-01-2024 10:00:{i:02}"), 100.0);
        buffer.append("SWM001", &rec).await.unwrap();
    }

    // Lines 1-2 stay buffered, line 3 checkpoints (covering 1-3), line 4 stays.
    let mut handler = Script::with(vec![
        ProcessDecision::processed(),
        ProcessDecision::processed(),
        ProcessDecision::checkpoint(),
        ProcessDecision::processed(),
    ]);
    let outcome = buffer.process("SWM001", &mut handler).await.unwrap();

    assert_eq!(outcome.processed, 4);
    assert_eq!(outcome.remaining, 1);

    let kept = fs::read_to_string(dir.path().join("SWM001.jsonl")).unwrap();
    assert_eq!(kept.lines().count(), 1);
    assert!(kept.contains("10:00:03"));
}

#[tokio::test]
async fn bad_lines_are_quarantined_without_breaking_the_pass() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = FileBuffer::new(dir.path()).unwrap();

    let good1 = serde_json::to_string(&record("SWM001", "01-01-2024 10:00:00", 100.0)).unwrap();
    let good2 = serde_json::to_string(&record("SWM001", "01-01-2024 10:00:10", 100.1)).unwrap();
    fs::write(
        dir.path().join("SWM001.jsonl"),
        format!("{good1}\n{{broken\n{good2}\n"),
    )
    .unwrap();

    let mut handler = Script::default();
    let outcome = buffer.process("SWM001", &mut handler).await.unwrap();

    // Two handler successes, one quarantined line, buffer fully drained.
    assert_eq!(outcome.processed, 2);
    assert_eq!(outcome.remaining, 0);
    assert_eq!(handler.seen, vec!["01-01-2024 10:00:00", "01-01-2024 10:00:10"]);
    assert!(!dir.path().join("SWM001.jsonl").exists());

    let bad = fs::read_to_string(dir.path().join("bad").join("SWM001.jsonl")).unwrap();
    assert_eq!(bad.lines().count(), 1);
    assert_eq!(bad.trim(), "{broken");
}

#[tokio::test]
async fn processing_a_missing_file_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = FileBuffer::new(dir.path()).unwrap();

    let mut handler = Script::default();
    let outcome = buffer.process("GHOST", &mut handler).await.unwrap();
    assert_eq!(outcome.processed, 0);
    assert_eq!(outcome.remaining, 0);
    assert!(handler.seen.is_empty());
}

#[tokio::test]
async fn list_devices_skips_the_quarantine_directory() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = FileBuffer::new(dir.path()).unwrap();

    buffer
        .append("SWM001", &record("SWM001", "01-01-2024 10:00:00", 100.0))
        .await
        .unwrap();
    buffer
        .append("SWM002", &record("SWM002", "01-01-2024 10:00:00", 50.0))
        .await
        .unwrap();
    fs::write(dir.path().join("bad").join("SWM003.jsonl"), "{broken\n").unwrap();

    let mut devices = buffer.list_devices().await.unwrap();
    devices.sort();
    assert_eq!(devices, vec!["SWM001", "SWM002"]);
}

#[derive(Default)]
struct ScriptFactory {
    handlers: HashMap<String, Script>,
}

impl HandlerFactory for ScriptFactory {
    type Handler = Script;

    fn handler_for(&mut self, device_code: &str) -> &mut Script {
        self.handlers.entry(device_code.to_string()).or_default()
    }
}

#[tokio::test]
async fn recovery_drains_every_device_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = FileBuffer::new(dir.path()).unwrap();

    buffer
        .append("SWM001", &record("SWM001", "01-01-2024 10:00:00", 100.0))
        .await
        .unwrap();
    buffer
        .append("SWM001", &record("SWM001", "01-01-2024 10:00:10", 100.1))
        .await
        .unwrap();
    buffer
        .append("SWM002", &record("SWM002", "01-01-2024 11:00:00", 50.0))
        .await
        .unwrap();

    let mut factory = ScriptFactory::default();
    RecoveryManager::new(&buffer)
        .replay_all(&mut factory)
        .await
        .unwrap();

    assert_eq!(factory.handlers["SWM001"].seen.len(), 2);
    assert_eq!(factory.handlers["SWM002"].seen.len(), 1);
    assert!(!dir.path().join("SWM001.jsonl").exists());
    assert!(!dir.path().join("SWM002.jsonl").exists());
}
