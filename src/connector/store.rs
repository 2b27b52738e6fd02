use anyhow::{anyhow, Context, Result};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use sha2::{Digest, Sha256};
use tracing::info;

use super::config::Settings;

/// Read side of the host's settings store.
///
/// A snapshot is immutable; callers hold it for the whole of one decision, so
/// edits committed meanwhile only affect later requests.
pub trait SettingsStore: Send + Sync + Debug {
    fn snapshot(&self) -> Result<Arc<Settings>>;
}

/// Settings held in process, swapped wholesale by the owner.
#[derive(Debug)]
pub struct MemorySettingsStore {
    current: RwLock<Arc<Settings>>,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            current: RwLock::new(Arc::new(settings)),
        }
    }

    pub fn replace(&self, settings: Settings) {
        let mut guard = match self.current.write() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        *guard = Arc::new(settings);
    }

    /// Copy-on-write edit of the current settings.
    pub fn update(&self, edit: impl FnOnce(&mut Settings)) {
        let mut guard = match self.current.write() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        let mut next = (**guard).clone();
        edit(&mut next);
        *guard = Arc::new(next);
    }
}

impl SettingsStore for MemorySettingsStore {
    fn snapshot(&self) -> Result<Arc<Settings>> {
        self.current
            .read()
            .map(|g| Arc::clone(&g))
            .map_err(|_| anyhow!("settings lock poisoned"))
    }
}

/// JSON settings file, re-parsed whenever its contents change.
///
/// Change detection digests the bytes on every snapshot; timestamps are not
/// trusted since an edit can land within the same mtime tick as the last load.
#[derive(Debug)]
pub struct FileSettingsStore {
    path: PathBuf,
    cached: RwLock<Option<(Vec<u8>, Arc<Settings>)>>,
}

impl FileSettingsStore {
    /// Load eagerly so a broken file is reported at startup.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            cached: RwLock::new(None),
        };
        store.snapshot()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for FileSettingsStore {
    fn snapshot(&self) -> Result<Arc<Settings>> {
        let raw = std::fs::read(&self.path)
            .with_context(|| format!("reading settings file {}", self.path.display()))?;
        let digest = Sha256::digest(&raw).to_vec();
        {
            let cached = self
                .cached
                .read()
                .map_err(|_| anyhow!("settings cache poisoned"))?;
            if let Some((seen, settings)) = cached.as_ref() {
                if *seen == digest {
                    return Ok(Arc::clone(settings));
                }
            }
        }

        let text = std::str::from_utf8(&raw).context("settings file is not UTF-8")?;
        let settings = Arc::new(Settings::from_json(text)?);
        let mut cached = self
            .cached
            .write()
            .map_err(|_| anyhow!("settings cache poisoned"))?;
        *cached = Some((digest, Arc::clone(&settings)));
        info!(path = %self.path.display(), credentials = settings.credentials.len(), "settings loaded");
        Ok(settings)
    }
}
