//! Full-state snapshots of the [`Store`].
//!
//! The file is a protobuf message holding one `map<string, bytes>`; each value is
//! the raw JSON text of the stored value. Every save replaces the previous file
//! (write to `<name>.tmp`, then rename).

use std::{
    collections::BTreeMap,
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use prost::Message as _;
use tokio::{
    sync::{Mutex, oneshot},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::store::{Entries, Store, Value};

#[derive(Clone, PartialEq, prost::Message)]
struct SnapshotMessage {
    #[prost(btree_map = "string, bytes", tag = "1")]
    entries: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug)]
pub enum SnapshotError {
    Io(io::Error),
    Decode(prost::DecodeError),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
        }
    }
}

impl std::error::Error for SnapshotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Decode(e) => Some(e),
        }
    }
}

impl From<io::Error> for SnapshotError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<prost::DecodeError> for SnapshotError {
    fn from(value: prost::DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Result of decoding a snapshot: the usable entries plus the keys whose stored
/// bytes were not valid JSON.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Decoded {
    pub entries: Entries,
    pub skipped: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No snapshot file; the store is left as it was.
    Missing,
    Loaded { entries: usize, skipped: usize },
    /// The file could not be read or decoded; the store is left as it was.
    Malformed { reason: String },
}

pub fn encode(entries: &Entries) -> Vec<u8> {
    let message = SnapshotMessage {
        entries: entries
            .iter()
            .map(|(k, v)| (k.clone(), v.as_bytes().to_vec()))
            .collect(),
    };
    message.encode_to_vec()
}

pub fn decode(bytes: &[u8]) -> Result<Decoded, SnapshotError> {
    let message = SnapshotMessage::decode(bytes)?;
    let mut decoded = Decoded::default();
    for (key, raw) in message.entries {
        match Value::from_json_bytes(&raw) {
            Ok(value) => {
                decoded.entries.insert(key, value);
            }
            Err(_) => decoded.skipped.push(key),
        }
    }
    Ok(decoded)
}

/// Reads and decodes `path`; `Ok(None)` when the file does not exist.
pub fn read(path: &Path) -> Result<Option<Decoded>, SnapshotError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    decode(&bytes).map(Some)
}

/// Writes the whole store to `path` while holding the shared lock.
///
/// Concurrent saves each write their own temporary file; the last rename wins and
/// the file on disk is always one complete snapshot.
pub async fn save(store: &Store, path: &Path) -> Result<usize, SnapshotError> {
    let entries = store.read().await;
    let bytes = encode(&entries);
    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
        .await
        .map_err(io::Error::other)??;
    Ok(entries.len())
}

/// Replaces the store's contents with the snapshot at `path`, holding the exclusive
/// lock throughout. Never fails: a missing file is a cold start and a bad file is
/// logged.
pub async fn load(store: &Store, path: &Path) -> LoadOutcome {
    let mut entries = store.write().await;
    match read(path) {
        Ok(None) => {
            info!(path = %path.display(), "no snapshot found, starting fresh");
            LoadOutcome::Missing
        }
        Ok(Some(decoded)) => {
            for key in &decoded.skipped {
                warn!(
                    path = %path.display(),
                    key = %key,
                    "snapshot entry is not valid json; skipped"
                );
            }
            let outcome = LoadOutcome::Loaded {
                entries: decoded.entries.len(),
                skipped: decoded.skipped.len(),
            };
            *entries = decoded.entries;
            info!(path = %path.display(), ?outcome, "snapshot loaded");
            outcome
        }
        Err(err) => {
            error!(
                path = %path.display(),
                error = %err,
                "snapshot unreadable; keeping current state"
            );
            LoadOutcome::Malformed {
                reason: err.to_string(),
            }
        }
    }
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), io::Error> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp_path = dir.join(format!(
        "{}.{}.{seq}.tmp",
        file_name.to_string_lossy(),
        std::process::id()
    ));
    let written = fs::File::create(&tmp_path).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    #[cfg(windows)]
    {
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }

    fs::rename(tmp_path, path)
}

#[derive(Debug, Clone)]
pub struct SnapshotHandle {
    store: Arc<Store>,
    path: PathBuf,
    save_lock: Arc<Mutex<()>>,
    shutdown: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SnapshotHandle {
    /// Saves right away. Never runs concurrently with a periodic save, so the file
    /// left on disk is the newer of the two.
    pub async fn save_now(&self) {
        let _saving = self.save_lock.lock().await;
        save_or_exit(&self.store, &self.path).await;
    }

    /// Stops the periodic timer and waits for a save that is already running to
    /// finish. Safe to call more than once.
    pub async fn shutdown(&self) {
        let tx = self.shutdown.lock().await.take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
        let task = self.task.lock().await.take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "snapshot worker ended abnormally");
        }
    }
}

/// Saves the store every `interval`. A failed save terminates the process.
pub fn spawn_snapshot_worker(
    store: Arc<Store>,
    path: PathBuf,
    interval: Duration,
) -> SnapshotHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let save_lock = Arc::new(Mutex::new(()));

    let task = tokio::spawn({
        let store = store.clone();
        let path = path.clone();
        let save_lock = save_lock.clone();
        async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _saving = save_lock.lock().await;
                        save_or_exit(&store, &path).await;
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
            debug!("snapshot worker stopped");
        }
    });

    SnapshotHandle {
        store,
        path,
        save_lock,
        shutdown: Arc::new(Mutex::new(Some(shutdown_tx))),
        task: Arc::new(Mutex::new(Some(task))),
    }
}

/// Exits the process with status 1 when the save fails.
pub async fn save_or_exit(store: &Store, path: &Path) {
    match save(store, path).await {
        Ok(entries) => info!(path = %path.display(), entries, "snapshot saved"),
        Err(err) => {
            error!(path = %path.display(), error = %err, "failed to save snapshot");
            std::process::exit(1);
        }
    }
}
