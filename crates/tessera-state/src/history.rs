use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tessera_core::{now_millis, Hash};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::StateError;
use crate::kv::ExecutionMode;

const READ_CHUNK_SIZE: usize = 4096;
const RECORD_TERMINATOR: u8 = b';';

/// Append-only log of executed command hashes for one execution mode
pub struct HistoryLog {
    entries: Mutex<HashMap<Hash, u64>>,
    file: Mutex<Option<File>>,
    path: Option<PathBuf>,
    window_ms: u64,
}

impl HistoryLog {
    fn in_memory(window_ms: u64) -> Self {
        HistoryLog {
            entries: Mutex::new(HashMap::new()),
            file: Mutex::new(None),
            path: None,
            window_ms,
        }
    }

    async fn open(path: PathBuf, window_ms: u64) -> Result<Self, StateError> {
        let cutoff = now_millis().saturating_sub(window_ms);
        let entries = match File::open(&path).await {
            Ok(file) => read_records(file, cutoff).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("Loaded {} history entries from {:?}", entries.len(), path);

        Ok(HistoryLog {
            entries: Mutex::new(entries),
            file: Mutex::new(None),
            path: Some(path),
            window_ms,
        })
    }

    /// Record a command hash.
    ///
    /// Membership is checked and claimed under one lock before the append, so
    /// of several concurrent calls for the same hash exactly one succeeds. If
    /// the append fails the claim is released.
    pub async fn add(&self, hash: Hash) -> Result<(), StateError> {
        let timestamp = now_millis();
        {
            let mut entries = self.entries.lock().await;
            if let Some(&recorded) = entries.get(&hash) {
                if !self.is_expired(recorded, timestamp) {
                    return Err(StateError::AlreadyRecorded(hash.to_hex()));
                }
            }
            entries.insert(hash, timestamp);
        }

        if let Err(e) = self.append(timestamp, &hash).await {
            warn!("Failed to append history record {}: {}", hash, e);
            self.entries.lock().await.remove(&hash);
            return Err(e);
        }
        Ok(())
    }

    /// Whether the hash was recorded within the retention window
    pub async fn has(&self, hash: &Hash) -> bool {
        let now = now_millis();
        self.entries
            .lock()
            .await
            .get(hash)
            .map(|&recorded| !self.is_expired(recorded, now))
            .unwrap_or(false)
    }

    /// Drop expired entries from memory, returning how many were removed
    pub async fn prune(&self) -> usize {
        let now = now_millis();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, &mut recorded| !self.is_expired(recorded, now));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn is_expired(&self, recorded: u64, now: u64) -> bool {
        recorded.saturating_add(self.window_ms) < now
    }

    async fn append(&self, timestamp: u64, hash: &Hash) -> Result<(), StateError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut file = self.file.lock().await;
        if file.is_none() {
            *file = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?,
            );
        }

        if let Some(file) = file.as_mut() {
            let record = format!("{}:{}{}", timestamp, hash.to_hex(), RECORD_TERMINATOR as char);
            file.write_all(record.as_bytes()).await?;
            file.flush().await?;
        }
        Ok(())
    }
}

/// Stream `<ms>:<hex>;` records, tolerating a trailing partial record
async fn read_records(mut file: File, cutoff: u64) -> Result<HashMap<Hash, u64>, StateError> {
    let mut entries = HashMap::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    let mut carry: Vec<u8> = Vec::new();

    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        carry.extend_from_slice(&chunk[..n]);

        let mut start = 0;
        while let Some(offset) = carry[start..].iter().position(|&b| b == RECORD_TERMINATOR) {
            let end = start + offset;
            if let Some((timestamp, hash)) = parse_record(&carry[start..end]) {
                if timestamp >= cutoff {
                    entries.insert(hash, timestamp);
                }
            }
            start = end + 1;
        }
        carry.drain(..start);
    }

    if !carry.iter().all(u8::is_ascii_whitespace) {
        warn!("Ignoring {} bytes of partial history record", carry.len());
    }
    Ok(entries)
}

fn parse_record(bytes: &[u8]) -> Option<(u64, Hash)> {
    let text = std::str::from_utf8(bytes).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    let parsed = text.split_once(':').and_then(|(ts, hex)| {
        let timestamp = ts.parse::<u64>().ok()?;
        let hash = Hash::from_hex(hex).ok()?;
        Some((timestamp, hash))
    });
    if parsed.is_none() {
        warn!("Skipping malformed history record {:?}", text);
    }
    parsed
}

/// Replay protection: hashes of executed commands per execution mode
pub struct CommandHistory {
    optimistic: HistoryLog,
    validated: HistoryLog,
}

impl CommandHistory {
    /// Open the logs under `dir`, creating it when missing
    pub async fn open(dir: &Path, window: Duration) -> Result<Self, StateError> {
        fs::create_dir_all(dir).await?;
        let window_ms = window.as_millis() as u64;

        let history = CommandHistory {
            optimistic: HistoryLog::open(dir.join("optimistic.log"), window_ms).await?,
            validated: HistoryLog::open(dir.join("validated.log"), window_ms).await?,
        };
        info!(
            "Command history opened ({} optimistic, {} validated)",
            history.optimistic.len().await,
            history.validated.len().await
        );
        Ok(history)
    }

    pub fn in_memory(window: Duration) -> Self {
        let window_ms = window.as_millis() as u64;
        CommandHistory {
            optimistic: HistoryLog::in_memory(window_ms),
            validated: HistoryLog::in_memory(window_ms),
        }
    }

    pub fn log(&self, mode: ExecutionMode) -> &HistoryLog {
        match mode {
            ExecutionMode::Optimistic => &self.optimistic,
            ExecutionMode::Validated => &self.validated,
        }
    }

    pub async fn add(&self, mode: ExecutionMode, hash: Hash) -> Result<(), StateError> {
        self.log(mode).add(hash).await
    }

    pub async fn has(&self, mode: ExecutionMode, hash: &Hash) -> bool {
        self.log(mode).has(hash).await
    }

    pub async fn prune(&self) -> usize {
        self.optimistic.prune().await + self.validated.prune().await
    }

    pub fn window_ms(&self) -> u64 {
        self.optimistic.window_ms
    }
}
