pub mod recovery;

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use tokio::sync::Mutex;

use siwatt_common::types::BufferedRecord;
use siwatt_common::WorkerError;

/// Verdict a handler returns for one buffered record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessDecision {
    pub success: bool,
    /// Offset relative to the current line that becomes safe to truncate.
    /// `-1` means "everything up to and including this line". `None` means
    /// the record was handled but must stay buffered for replay.
    pub checkpoint_offset: Option<i64>,
}

impl ProcessDecision {
    /// Handled and durable: truncate up to and including this line.
    pub fn checkpoint() -> Self {
        Self {
            success: true,
            checkpoint_offset: Some(-1),
        }
    }

    /// Handled, but the line must survive a crash until a later checkpoint.
    pub fn processed() -> Self {
        Self {
            success: true,
            checkpoint_offset: None,
        }
    }

    /// Not handled: stop draining and retry from the last checkpoint.
    pub fn failure() -> Self {
        Self {
            success: false,
            checkpoint_offset: None,
        }
    }
}

/// Outcome of one `process` pass over a device's buffer file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub processed: usize,
    pub remaining: usize,
}

/// Capability the buffer drives for each decoded record.
#[allow(async_fn_in_trait)]
pub trait RecordHandler {
    async fn handle(&mut self, record: &BufferedRecord) -> ProcessDecision;
}

/// Durable per-device append-only queue between message arrival and
/// successful aggregation.
///
/// One `<base>/<device_code>.jsonl` file per device, one JSON record per
/// line. Lines that fail to decode are quarantined under `<base>/bad/`.
/// Every read and rewrite holds the single process-wide lock, so the atomic
/// temp-file-and-rename rewrite stays safe if callers ever run concurrently.
pub struct FileBuffer {
    base_dir: PathBuf,
    bad_dir: PathBuf,
    lock: Mutex<()>,
}

impl FileBuffer {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, WorkerError> {
        let base_dir = base_dir.into();
        let bad_dir = base_dir.join("bad");
        fs::create_dir_all(&base_dir)?;
        fs::create_dir_all(&bad_dir)?;
        Ok(Self {
            base_dir,
            bad_dir,
            lock: Mutex::new(()),
        })
    }

    fn device_path(&self, device_code: &str) -> PathBuf {
        self.base_dir.join(format!("{device_code}.jsonl"))
    }

    fn bad_path(&self, device_code: &str) -> PathBuf {
        self.bad_dir.join(format!("{device_code}.jsonl"))
    }

    /// Append one record to the device's buffer file.
    pub async fn append(
        &self,
        device_code: &str,
        record: &BufferedRecord,
    ) -> Result<(), WorkerError> {
        let line = serde_json::to_string(record)?;

        let _guard = self.lock.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.device_path(device_code))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Every device code with a buffer file under the base directory.
    /// The `bad` quarantine directory is not a device.
    pub async fn list_devices(&self) -> Result<Vec<String>, WorkerError> {
        let _guard = self.lock.lock().await;

        let mut devices = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().is_some_and(|ext| ext == "jsonl") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    devices.push(stem.to_string());
                }
            }
        }
        Ok(devices)
    }

    /// Drain the device's buffer through `handler`, in line order.
    ///
    /// Undecodable lines go to the bad file and the pass continues. The first
    /// `success=false` stops the pass. Afterwards, lines at or before the
    /// highest checkpointed index are dropped by rewriting the remainder to a
    /// temp file and renaming it over the original; a fully drained file is
    /// removed, and a pass with no checkpoint leaves the file untouched.
    pub async fn process<H: RecordHandler>(
        &self,
        device_code: &str,
        handler: &mut H,
    ) -> Result<ProcessOutcome, WorkerError> {
        let path = self.device_path(device_code);

        let _guard = self.lock.lock().await;
        if !path.exists() {
            return Ok(ProcessOutcome::default());
        }

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();

        let mut processed = 0usize;
        let mut safe_index: i64 = -1;

        for (index, line) in lines.iter().enumerate() {
            let raw = line.trim();
            if raw.is_empty() {
                continue;
            }

            let record: BufferedRecord = match serde_json::from_str(raw) {
                Ok(record) => record,
                Err(err) => {
                    self.quarantine(device_code, raw)?;
                    tracing::error!(device_code, error = %err, "buffer line failed to decode, quarantined");
                    metrics::counter!("worker.buffer.bad_lines").increment(1);
                    continue;
                }
            };

            let decision = handler.handle(&record).await;
            if !decision.success {
                break;
            }

            processed += 1;
            if let Some(offset) = decision.checkpoint_offset {
                // Offset is relative to the line after this one, so `-1`
                // marks the current line itself as safe to drop.
                let checkpoint_index = index as i64 + offset + 1;
                if checkpoint_index >= safe_index {
                    safe_index = checkpoint_index;
                }
            }
        }

        let start = usize::try_from(safe_index + 1).unwrap_or(0).min(lines.len());
        let remaining = &lines[start..];

        if safe_index < 0 {
            return Ok(ProcessOutcome {
                processed,
                remaining: remaining.len(),
            });
        }

        if remaining.is_empty() {
            fs::remove_file(&path)?;
            return Ok(ProcessOutcome {
                processed,
                remaining: 0,
            });
        }

        let mut kept = remaining.join("\n");
        kept.push('\n');

        let temp_path = path.with_extension("jsonl.tmp");
        fs::write(&temp_path, kept)?;
        fs::rename(&temp_path, &path)?;

        Ok(ProcessOutcome {
            processed,
            remaining: remaining.len(),
        })
    }

    fn quarantine(&self, device_code: &str, raw: &str) -> Result<(), WorkerError> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.bad_path(device_code))?;
        writeln!(file, "{raw}")?;
        Ok(())
    }
}
