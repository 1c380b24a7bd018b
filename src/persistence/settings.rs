use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SETTINGS_DIR: &str = "relaycontrol";
const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to access settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Default)]
struct SettingsData {
    values: BTreeMap<String, String>,
    dirty: bool,
}

/// Small persistent key/value store for last-known device state.
///
/// Values live in memory and reach disk only on [`flush`](Self::flush), which
/// is a no-op while nothing changed. An ephemeral store never touches disk.
#[derive(Debug)]
pub struct SettingsStore {
    path: Option<PathBuf>,
    data: Mutex<SettingsData>,
}

impl SettingsStore {
    /// `dirs::data_local_dir()/relaycontrol/settings.toml`, if the platform has one.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_local_dir().map(|mut path| {
            path.push(SETTINGS_DIR);
            path.push(SETTINGS_FILE);
            path
        })
    }

    /// Key under which a device stores one of its values.
    pub fn key(identifier: &str, suffix: &str) -> String {
        format!("{}.{}", identifier, suffix)
    }

    /// A missing file yields an empty store. So does an unreadable or unparsable
    /// one, with a warning, since losing remembered state must not stop startup.
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let values = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match toml::from_str::<BTreeMap<String, String>>(&content) {
                Ok(values) => {
                    info!("Loaded {} settings from {}", values.len(), path.display());
                    values
                }
                Err(e) => {
                    warn!("Ignoring unparsable settings file {}: {}", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings file at {}, starting empty", path.display());
                BTreeMap::new()
            }
            Err(e) => {
                warn!("Unable to read settings file {}: {}", path.display(), e);
                BTreeMap::new()
            }
        };

        Self {
            path: Some(path),
            data: Mutex::new(SettingsData {
                values,
                dirty: false,
            }),
        }
    }

    pub fn ephemeral() -> Self {
        Self {
            path: None,
            data: Mutex::new(SettingsData::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.data.lock().await.values.get(key).cloned()
    }

    /// Returns false and leaves the store clean if the value is unchanged.
    pub async fn set(&self, key: &str, value: &str) -> bool {
        let mut data = self.data.lock().await;
        if data.values.get(key).map(String::as_str) == Some(value) {
            return false;
        }
        data.values.insert(key.to_string(), value.to_string());
        data.dirty = true;
        true
    }

    pub async fn is_dirty(&self) -> bool {
        self.data.lock().await.dirty
    }

    pub async fn flush(&self) -> Result<(), SettingsError> {
        let mut data = self.data.lock().await;
        if !data.dirty {
            return Ok(());
        }
        let Some(path) = &self.path else {
            data.dirty = false;
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| SettingsError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let content = toml::to_string_pretty(&data.values)?;
        tokio::fs::write(path, content)
            .await
            .map_err(|source| SettingsError::Io {
                path: path.clone(),
                source,
            })?;

        data.dirty = false;
        debug!("Settings written to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");

        let store = SettingsStore::load(&path).await;
        assert!(store.set(&SettingsStore::key("relay1", "LastRelayState"), "open").await);
        store.flush().await.unwrap();

        let reloaded = SettingsStore::load(&path).await;
        assert_eq!(
            reloaded.get("relay1.LastRelayState").await.as_deref(),
            Some("open")
        );
        assert!(!reloaded.is_dirty().await);
    }

    #[tokio::test]
    async fn unchanged_values_do_not_dirty_the_store() {
        let store = SettingsStore::ephemeral();
        assert!(store.set("a.b", "1").await);
        store.flush().await.unwrap();

        assert!(!store.set("a.b", "1").await);
        assert!(!store.is_dirty().await);
        assert!(store.set("a.b", "2").await);
        assert!(store.is_dirty().await);
    }

    #[tokio::test]
    async fn garbage_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        tokio::fs::write(&path, "this is [not toml").await.unwrap();

        let store = SettingsStore::load(&path).await;
        assert_eq!(store.get("anything").await, None);
    }

    #[tokio::test]
    async fn clean_store_does_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");

        let store = SettingsStore::load(&path).await;
        store.flush().await.unwrap();

        assert!(!path.exists());
    }
}
