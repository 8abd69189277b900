use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Last applied digest/tag for one tracked image. Persisted across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageState {
    pub base_tag: String,
    pub tag: String,
    pub digest: String,
    pub last_updated: String,
}

/// File-backed store mapping image name to [`ImageState`].
///
/// Writes go through an exclusive advisory lock on a sibling `.lock` file
/// and a temp-file-plus-atomic-rename, so a concurrent reader never sees a
/// half-written file and two processes never interleave saves.
pub struct StateStore {
    path: PathBuf,
}

struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    fn acquire(path: PathBuf) -> std::io::Result<Self> {
        let file = File::create(&path)?;
        file.lock()?;
        Ok(Self { file, path })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("Failed to release state lock: {}", e);
        }
        // The lock file is only a rendezvous point; remove it after release.
        let _ = fs::remove_file(&self.path);
    }
}

impl StateStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Loads the persisted state. A missing file yields an empty map;
    /// corrupt JSON logs a warning and starts fresh rather than failing.
    pub fn load(&self) -> HashMap<String, ImageState> {
        if !self.path.exists() {
            return HashMap::new();
        }

        let raw = {
            let _lock = match FileLock::acquire(self.lock_path()) {
                Ok(lock) => lock,
                Err(e) => {
                    warn!("Could not lock state file, starting fresh: {}", e);
                    return HashMap::new();
                }
            };
            match fs::read_to_string(&self.path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("Error reading state file, starting fresh: {}", e);
                    return HashMap::new();
                }
            }
        };

        let entries: HashMap<String, serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Error parsing state file, starting fresh: {}", e);
                return HashMap::new();
            }
        };

        // Per-entry tolerance: one bad record should not discard the rest.
        let mut state = HashMap::new();
        for (image, value) in entries {
            match serde_json::from_value::<ImageState>(value) {
                Ok(image_state) => {
                    state.insert(image, image_state);
                }
                Err(e) => warn!("Invalid state data for {}: {}", image, e),
            }
        }
        state
    }

    /// Persists the state atomically under the cross-process lock.
    pub fn save(&self, state: &HashMap<String, ImageState>) -> Result<()> {
        let dir = self.path.parent().filter(|p| !p.as_os_str().is_empty());

        let _lock = FileLock::acquire(self.lock_path())
            .with_context(|| format!("Failed to lock state file {}", self.path.display()))?;

        let mut tmp = match dir {
            Some(dir) => tempfile::NamedTempFile::new_in(dir),
            None => tempfile::NamedTempFile::new_in("."),
        }
        .context("Failed to create temporary state file")?;

        let serialized =
            serde_json::to_string_pretty(state).context("Failed to serialize state")?;
        tmp.write_all(serialized.as_bytes())
            .context("Failed to write temporary state file")?;

        tmp.persist(&self.path)
            .with_context(|| format!("Failed to replace state file {}", self.path.display()))?;

        debug!(
            "Saved state for {} image(s) to {}",
            state.len(),
            self.path.display()
        );
        Ok(())
    }
}
