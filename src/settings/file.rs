//! File-backed settings source with change notification.
//!
//! Reads a settings TOML file and an optional `.env` secrets file, the way
//! mounted config maps and secrets appear inside a container. Watches the
//! parent directories rather than the files themselves, since mounted
//! volumes replace files by swapping symlinks.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use super::secrets::{load_secrets, Secrets};
use super::subscription::{Publisher, Subscription};
use super::{Settings, SettingsError, SettingsSource};

/// Default location of the settings file inside the container.
pub const DEFAULT_SETTINGS_PATH: &str = "/app/config/settings.toml";

/// Events closer together than this are handled as one change.
const QUIET_PERIOD: Duration = Duration::from_millis(250);

/// File contents a snapshot was built from.
#[derive(Debug, PartialEq, Eq)]
struct RawSettings {
    text: String,
    secrets: Secrets,
}

/// State shared between the source and its reload thread.
#[derive(Debug)]
struct Shared {
    settings_path: PathBuf,
    secrets_path: Option<PathBuf>,
    generation: AtomicU64,
    publisher: Publisher<Settings>,
    /// Inputs of the last snapshot handed out, by `current()` or a reload.
    last: Mutex<Option<RawSettings>>,
}

impl Shared {
    fn read(&self) -> Result<RawSettings, SettingsError> {
        let text = std::fs::read_to_string(&self.settings_path).map_err(|source| {
            SettingsError::Read {
                path: self.settings_path.clone(),
                source,
            }
        })?;
        let secrets = match &self.secrets_path {
            Some(path) => load_secrets(path)?,
            None => Secrets::default(),
        };
        Ok(RawSettings { text, secrets })
    }

    fn snapshot(&self, raw: &RawSettings) -> Result<Settings, SettingsError> {
        let mut settings = Settings::from_toml(&raw.text, &self.settings_path)?;
        settings.secrets = raw.secrets.clone();
        settings.generation = self.generation.fetch_add(1, Ordering::Relaxed);
        Ok(settings)
    }

    fn last(&self) -> std::sync::MutexGuard<'_, Option<RawSettings>> {
        self.last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn load(&self) -> Result<Settings, SettingsError> {
        let raw = self.read()?;
        let settings = self.snapshot(&raw)?;
        *self.last() = Some(raw);
        Ok(settings)
    }

    fn reload_and_publish(&self) {
        let raw = match self.read() {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "failed to reload settings, keeping current snapshot");
                return;
            }
        };

        let mut last = self.last();
        if let Some(previous) = last.as_ref() {
            if *previous == raw {
                debug!("settings files unchanged");
                return;
            }
            // A writer truncates before it writes; an empty file after a
            // good snapshot is a write in progress.
            if raw.text.trim().is_empty() {
                warn!("settings file is empty, keeping current snapshot");
                return;
            }
        }

        match self.snapshot(&raw) {
            Ok(settings) => {
                debug!(generation = settings.generation, "settings reloaded");
                *last = Some(raw);
                drop(last);
                self.publisher.publish(settings);
            }
            Err(e) => {
                warn!(error = %e, "failed to reload settings, keeping current snapshot");
            }
        }
    }

    /// File names whose events trigger a reload.
    fn watched_names(&self) -> BTreeSet<OsString> {
        std::iter::once(&self.settings_path)
            .chain(self.secrets_path.iter())
            .filter_map(|path| path.file_name().map(OsString::from))
            .collect()
    }
}

/// Whether an event on `path` can change one of `names`.
///
/// Mounted volumes are updated by swapping a `..data` symlink, so those
/// entries count as well.
fn affects_watched_files(path: &Path, names: &BTreeSet<OsString>) -> bool {
    path.file_name().is_some_and(|name| {
        names.contains(name) || name.to_string_lossy().starts_with("..")
    })
}

/// Reload once per burst of relevant events, after `QUIET_PERIOD` without
/// further events. Runs until the watcher is dropped.
fn reload_loop(shared: &Shared, events: &mpsc::Receiver<PathBuf>) {
    let names = shared.watched_names();
    while let Ok(first) = events.recv() {
        let mut relevant = affects_watched_files(&first, &names);
        loop {
            match events.recv_timeout(QUIET_PERIOD) {
                Ok(path) => relevant |= affects_watched_files(&path, &names),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
        if relevant {
            shared.reload_and_publish();
        }
    }
}

/// Settings source backed by files on disk.
pub struct FileSettingsSource {
    shared: Arc<Shared>,
    /// Kept alive for as long as the source to maintain notifications.
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl std::fmt::Debug for FileSettingsSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSettingsSource")
            .field("settings_path", &self.shared.settings_path)
            .field("secrets_path", &self.shared.secrets_path)
            .finish()
    }
}

impl FileSettingsSource {
    /// Create a source for the given settings file and optional secrets file.
    pub fn new(settings_path: PathBuf, secrets_path: Option<PathBuf>) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings_path,
                secrets_path,
                generation: AtomicU64::new(0),
                publisher: Publisher::new(),
                last: Mutex::new(None),
            }),
            watcher: Mutex::new(None),
        }
    }

    /// Path of the settings file.
    pub fn settings_path(&self) -> &Path {
        &self.shared.settings_path
    }

    /// Directories to watch: the parents of every configured file.
    fn watch_dirs(&self) -> BTreeSet<PathBuf> {
        std::iter::once(&self.shared.settings_path)
            .chain(self.shared.secrets_path.iter())
            .map(|path| match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            })
            .collect()
    }

    fn start_watcher(&self) -> Result<(), SettingsError> {
        let mut slot = self
            .watcher
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel();
        let catch_up = tx.clone();
        let mut watcher =
            notify::recommended_watcher(move |event: notify::Result<notify::Event>| match event {
                Ok(event) if event.kind.is_access() => {}
                Ok(event) => {
                    for path in event.paths {
                        if let Err(e) = tx.send(path) {
                            warn!(error = %e, "failed to send settings watch event");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "settings watch error"),
            })?;

        for dir in self.watch_dirs() {
            watcher.watch(&dir, RecursiveMode::NonRecursive)?;
            info!(dir = %dir.display(), "watching settings directory");
        }

        let shared = Arc::clone(&self.shared);
        std::thread::spawn(move || reload_loop(&shared, &rx));

        *slot = Some(watcher);

        // Changes made between `current()` and the watcher starting would
        // otherwise go unnoticed until the next event.
        if let Err(e) = catch_up.send(self.shared.settings_path.clone()) {
            warn!(error = %e, "failed to queue initial settings reload");
        }
        Ok(())
    }
}

#[async_trait]
impl SettingsSource for FileSettingsSource {
    async fn current(&self) -> Result<Settings, SettingsError> {
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || shared.load())
            .await
            .map_err(|e| SettingsError::Read {
                path: self.shared.settings_path.clone(),
                source: std::io::Error::other(e),
            })?
    }

    fn subscribe(&self) -> Result<Subscription<Settings>, SettingsError> {
        let subscription = self.shared.publisher.subscribe();
        self.start_watcher()?;
        Ok(subscription)
    }
}
