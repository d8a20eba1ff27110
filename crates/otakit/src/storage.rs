//! Storage adapter - durable state document plus per-bundle file trees.
//!
//! Layout under the storage root:
//!
//! ```text
//! <root>/state.json          persisted state (atomic temp + rename)
//! <root>/bundles/<id>/...    extracted bundle files
//! <root>/downloads/          archives in transit
//! ```

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::bundle::BundleId;
use crate::error::OtaResult;
use crate::state::PersistedState;

const STATE_FILE: &str = "state.json";
const BUNDLES_DIR: &str = "bundles";
const DOWNLOADS_DIR: &str = "downloads";

pub trait Storage: Send + Sync {
    /// Read the persisted state; `None` when nothing was ever written
    fn read_state(&self) -> OtaResult<Option<PersistedState>>;

    /// Durably replace the persisted state
    fn write_state(&self, state: &PersistedState) -> OtaResult<()>;

    /// Directory holding the files of one bundle
    fn bundle_dir(&self, id: &BundleId) -> PathBuf;

    /// Scratch directory for archives being downloaded
    fn download_dir(&self) -> PathBuf;

    /// Whether the bundle's entry file is present
    fn has_entry_file(&self, id: &BundleId, entry_file: &str) -> bool {
        self.bundle_dir(id).join(entry_file).is_file()
    }

    /// Remove the files of one bundle; removing nothing is not an error
    fn remove_bundle_files(&self, id: &BundleId) -> OtaResult<()>;

    /// Ids of every bundle directory present on disk
    fn list_bundle_dirs(&self) -> OtaResult<Vec<BundleId>>;
}

/// Filesystem-backed storage rooted at one directory
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Default root: `$XDG_DATA_HOME/otakit`
    pub fn default_root() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("otakit")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }
}

impl Storage for FileStorage {
    fn read_state(&self) -> OtaResult<Option<PersistedState>> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let state = serde_json::from_str(&content)?;
        Ok(Some(state))
    }

    fn write_state(&self, state: &PersistedState) -> OtaResult<()> {
        let data = serde_json::to_vec_pretty(state)?;
        atomic_write(&self.state_path(), &data)?;
        Ok(())
    }

    fn bundle_dir(&self, id: &BundleId) -> PathBuf {
        self.root.join(BUNDLES_DIR).join(id.as_str())
    }

    fn download_dir(&self) -> PathBuf {
        self.root.join(DOWNLOADS_DIR)
    }

    fn remove_bundle_files(&self, id: &BundleId) -> OtaResult<()> {
        let dir = self.bundle_dir(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!("Removed bundle files at {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_bundle_dirs(&self) -> OtaResult<Vec<BundleId>> {
        let dir = self.root.join(BUNDLES_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(BundleId::from(name));
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Write data to a file atomically using temp file + fsync + rename
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)
}
