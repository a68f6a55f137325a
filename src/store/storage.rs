//! Preference storage backends

use directories::ProjectDirs;
use parking_lot::Mutex;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::config::Preferences;
use crate::error::StorageError;

/// Durable home of the preference record.
///
/// Calls block on disk I/O; the config store runs them on the blocking pool.
pub trait PreferenceStorage: Send + Sync + 'static {
    /// Current record. A missing record reads as the defaults.
    fn load(&self) -> Result<Preferences, StorageError>;

    /// Replace the record with `transform(current)` atomically: on error the
    /// stored record is unchanged. Returns the record now stored.
    fn update(
        &self,
        transform: &(dyn Fn(&Preferences) -> Preferences + Send + Sync),
    ) -> Result<Preferences, StorageError>;
}

/// TOML file written through a temp file and rename
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub const FILE_NAME: &'static str = "preferences.toml";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<platform config dir>/live-relay/preferences.toml`
    pub fn default_location() -> Option<PathBuf> {
        ProjectDirs::from("org", "LiveRelay", "live-relay")
            .map(|dirs| dirs.config_dir().join(Self::FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| Self::FILE_NAME.into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn write_atomic(&self, prefs: &Preferences) -> Result<(), StorageError> {
        let text = toml::to_string_pretty(prefs).map_err(|e| StorageError::Other(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp = self.temp_path();
        let written = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&temp)?;
            file.write_all(text.as_bytes())?;
            file.sync_all()?;
            fs::rename(&temp, &self.path)
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        Ok(())
    }
}

impl PreferenceStorage for FileStorage {
    fn load(&self) -> Result<Preferences, StorageError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => toml::from_str(&text).map_err(|e| StorageError::Corrupt(e.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Preferences::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn update(
        &self,
        transform: &(dyn Fn(&Preferences) -> Preferences + Send + Sync),
    ) -> Result<Preferences, StorageError> {
        // Readers already see defaults for a corrupt record; an edit replaces it
        let current = match self.load() {
            Err(StorageError::Corrupt(reason)) => {
                tracing::warn!("Replacing corrupt preferences at {}: {}", self.path.display(), reason);
                Preferences::default()
            }
            other => other?,
        };
        let next = transform(&current);
        self.write_atomic(&next)?;
        Ok(next)
    }
}

/// Volatile storage, for dry runs and tests
#[derive(Debug, Default)]
pub struct MemoryStorage {
    record: Mutex<Preferences>,
}

impl MemoryStorage {
    pub fn new(initial: Preferences) -> Self {
        Self {
            record: Mutex::new(initial),
        }
    }
}

impl PreferenceStorage for MemoryStorage {
    fn load(&self) -> Result<Preferences, StorageError> {
        Ok(self.record.lock().clone())
    }

    fn update(
        &self,
        transform: &(dyn Fn(&Preferences) -> Preferences + Send + Sync),
    ) -> Result<Preferences, StorageError> {
        let mut record = self.record.lock();
        let next = transform(&*record);
        *record = next.clone();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamProtocol;

    #[test]
    fn test_missing_file_reads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("nested").join("prefs.toml"));
        assert_eq!(storage.load().unwrap(), Preferences::default());
    }

    #[test]
    fn test_update_persists_and_cleans_temp() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("nested").join("prefs.toml"));

        let next = storage
            .update(&|p: &Preferences| Preferences {
                protocol: StreamProtocol::Tcp,
                host: "10.1.2.3".into(),
                ..p.clone()
            })
            .unwrap();
        assert_eq!(next.host, "10.1.2.3");

        let reloaded = FileStorage::new(storage.path()).load().unwrap();
        assert_eq!(reloaded, next);
        assert!(!storage.temp_path().exists());
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.toml");
        fs::write(&path, "protocol = [not toml").unwrap();
        let storage = FileStorage::new(&path);

        let err = storage.load().unwrap_err();
        assert!(matches!(err, StorageError::Corrupt(_)));
        assert!(err.is_recoverable());

        // an update starts over from defaults and repairs the file
        let stored = storage
            .update(&|p: &Preferences| Preferences {
                protocol: StreamProtocol::Tcp,
                ..p.clone()
            })
            .unwrap();
        assert_eq!(stored.protocol, StreamProtocol::Tcp);
        assert_eq!(stored.host, Preferences::default().host);
        assert_eq!(storage.load().unwrap(), stored);
    }

    #[test]
    fn test_default_location_names_file() {
        if let Some(path) = FileStorage::default_location() {
            assert!(path.ends_with(FileStorage::FILE_NAME));
        }
    }
}
