//! Crash-safe JSON persistence for a single value.
//!
//! Files next to the configured path:
//! - `<path>`: the current state, pretty-printed UTF-8 JSON
//! - `<path>.backup`: the previous successfully saved version
//! - `<path>.tmp`: only exists while a write is in progress
//!
//! Saves go through write-to-temp, read-back verification and a rename, so the
//! primary file is never observed half-written. `set` marks the store dirty and
//! wakes a single flush task that writes once the debounce window has been
//! quiet.

use crate::utils::error::{MonitorError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Deletes a leftover tmp file; a missing file is not an error.
fn remove_tmp(tmp_path: &Path) {
    if let Err(e) = fs::remove_file(tmp_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Could not remove {}: {}", tmp_path.display(), e);
        }
    }
}

fn persistence_error(path: &Path, message: impl Into<String>) -> MonitorError {
    MonitorError::PersistenceError {
        path: path.display().to_string(),
        message: message.into(),
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Err(persistence_error(path, "file is empty"));
    }
    Ok(serde_json::from_str(&content)?)
}

struct StoreInner<T> {
    path: PathBuf,
    backup_path: PathBuf,
    tmp_path: PathBuf,
    value: RwLock<T>,
    dirty: AtomicBool,
    write_lock: Mutex<()>,
    notify: Notify,
    debounce: Duration,
}

impl<T> StoreInner<T>
where
    T: Serialize + DeserializeOwned,
{
    fn save(&self) -> Result<()> {
        let _write = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        // cleared before the snapshot so a concurrent set() re-marks it
        self.dirty.store(false, Ordering::SeqCst);

        let json = {
            let value = self.value.read().unwrap_or_else(PoisonError::into_inner);
            serde_json::to_string_pretty(&*value)
        };

        let outcome = json
            .map_err(MonitorError::from)
            .and_then(|json| self.write_atomically(&json));

        if let Err(e) = &outcome {
            self.dirty.store(true, Ordering::SeqCst);
            tracing::error!("Failed to save state to {}: {}", self.path.display(), e);
        }
        outcome
    }

    fn flush(&self) -> Result<bool> {
        if !self.dirty.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.save().map(|_| true)
    }

    fn write_atomically(&self, json: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        if self.path.exists() {
            if let Err(e) = fs::copy(&self.path, &self.backup_path) {
                tracing::warn!(
                    "Could not back up {} to {}: {}",
                    self.path.display(),
                    self.backup_path.display(),
                    e
                );
            }
        }

        let written = self.write_verified_tmp(json).and_then(|_| {
            fs::rename(&self.tmp_path, &self.path)
                .map_err(|e| persistence_error(&self.path, format!("rename failed: {}", e)))
        });

        if written.is_err() {
            remove_tmp(&self.tmp_path);
        }
        written?;

        tracing::debug!("Saved state to {}", self.path.display());
        Ok(())
    }

    fn write_verified_tmp(&self, json: &str) -> Result<()> {
        let mut file = File::create(&self.tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        drop(file);

        read_json::<T>(&self.tmp_path).map_err(|e| {
            persistence_error(&self.tmp_path, format!("verification failed: {}", e))
        })?;
        Ok(())
    }
}

/// Loads primary, then backup (restoring the primary from it), else `None`.
fn load<T: DeserializeOwned>(path: &Path, backup_path: &Path, tmp_path: &Path) -> Option<T> {
    if tmp_path.exists() {
        tracing::warn!(
            "Removing leftover {} from an interrupted save",
            tmp_path.display()
        );
        remove_tmp(tmp_path);
    }

    match read_json::<T>(path) {
        Ok(value) => return Some(value),
        Err(MonitorError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("No state file at {}", path.display());
        }
        Err(e) => tracing::warn!("State file {} is unreadable: {}", path.display(), e),
    }

    match read_json::<T>(backup_path) {
        Ok(value) => {
            tracing::warn!("Recovered state from {}", backup_path.display());
            let restored = fs::copy(backup_path, tmp_path).and_then(|_| fs::rename(tmp_path, path));
            if let Err(e) = restored {
                tracing::warn!("Could not restore {} from backup: {}", path.display(), e);
                remove_tmp(tmp_path);
            }
            Some(value)
        }
        Err(e) => {
            tracing::debug!("No usable backup at {}: {}", backup_path.display(), e);
            None
        }
    }
}

/// Durable, debounced store for one serializable value.
///
/// One instance per state file per process; the on-disk files must only be
/// touched through this type.
pub struct StateStore<T> {
    inner: Arc<StoreInner<T>>,
    cancel: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl<T> StateStore<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Loads the state, falling back to the backup and then to `initial`.
    /// Never fails.
    ///
    /// Inside a tokio runtime a flush task is spawned for debounced saves;
    /// outside one, `set` saves immediately.
    pub fn open(path: impl Into<PathBuf>, initial: T, debounce: Duration) -> Self {
        let path = path.into();
        let backup_path = sibling(&path, ".backup");
        let tmp_path = sibling(&path, ".tmp");

        let value = load(&path, &backup_path, &tmp_path).unwrap_or_else(|| {
            tracing::info!("Starting with initial state for {}", path.display());
            initial
        });

        let inner = Arc::new(StoreInner {
            path,
            backup_path,
            tmp_path,
            value: RwLock::new(value),
            dirty: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            notify: Notify::new(),
            debounce,
        });

        let cancel = CancellationToken::new();
        let flusher = tokio::runtime::Handle::try_current()
            .ok()
            .map(|handle| handle.spawn(run_flusher(inner.clone(), cancel.clone())));

        Self {
            inner,
            cancel,
            flusher: Mutex::new(flusher),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn backup_path(&self) -> &Path {
        &self.inner.backup_path
    }

    pub fn get(&self) -> T {
        self.inner
            .value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.value.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn set(&self, value: T) {
        *self.inner.value.write().unwrap_or_else(PoisonError::into_inner) = value;
        self.schedule_save();
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.inner.value.write().unwrap_or_else(PoisonError::into_inner));
        self.schedule_save();
        result
    }

    /// Writes the current value now. On failure the in-memory copy is kept
    /// and the store stays dirty.
    pub fn save(&self) -> Result<()> {
        self.inner.save()
    }

    /// Saves only if there are unsaved changes. Returns whether a write
    /// happened.
    pub fn flush(&self) -> Result<bool> {
        self.inner.flush()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::SeqCst)
    }

    /// Stops the flush task and writes any pending changes.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        let flusher = self
            .flusher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(flusher) = flusher {
            if let Err(e) = flusher.await {
                tracing::debug!("State flush task ended abnormally: {}", e);
            }
        }
        self.inner.flush().map(|_| ())
    }

    fn schedule_save(&self) {
        self.inner.dirty.store(true, Ordering::SeqCst);
        if self.cancel.is_cancelled() || !self.has_flusher() {
            if let Err(e) = self.inner.save() {
                tracing::warn!("Immediate state save failed: {}", e);
            }
        } else {
            self.inner.notify.notify_one();
        }
    }

    fn has_flusher(&self) -> bool {
        self.flusher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl<T> Drop for StateStore<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_flusher<T>(inner: Arc<StoreInner<T>>, cancel: CancellationToken)
where
    T: Serialize + DeserializeOwned,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = inner.notify.notified() => {}
        }

        // every further notification restarts the quiet window
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = inner.notify.notified() => continue,
                _ = tokio::time::sleep(inner.debounce) => break,
            }
        }

        if let Err(e) = inner.flush() {
            tracing::warn!("Debounced state save failed: {}", e);
        }
    }
}
