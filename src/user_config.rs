//! Per-user settings store.
//!
//! A flat JSON object of key/value pairs persisted next to the user's other
//! configuration. Devices keep their remembered defaults here (for example a
//! camera stores `<camera>_SETTINGS`), and experiments read the data
//! directory from the `data-dir` key.

use crate::error::{AppResult, CockpitError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// Key holding the directory experiments write their data to.
pub const DATA_DIR_KEY: &str = "data-dir";

/// File name inside the platform configuration directory.
const USER_CONFIG_FILE: &str = "user_config.json";

/// Shared handle to the user settings.
#[derive(Clone, Default)]
pub struct UserConfig {
    values: Arc<RwLock<Map<String, Value>>>,
    path: Option<PathBuf>,
}

impl UserConfig {
    /// Store that lives only in memory
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Platform default location, e.g. `~/.config/rust_cockpit/user_config.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("rust_cockpit").join(USER_CONFIG_FILE))
    }

    /// Load from `path`. A missing file yields an empty store that will be
    /// created on the first write.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let text = fs::read_to_string(&path)?;
            match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    return Err(CockpitError::Configuration(format!(
                        "user configuration {:?} is not a JSON object",
                        path
                    )))
                }
                Err(e) => {
                    return Err(CockpitError::Configuration(format!(
                        "user configuration {:?}: {}",
                        path, e
                    )))
                }
            }
        } else {
            tracing::debug!(?path, "no user configuration yet");
            Map::new()
        };
        Ok(Self {
            values: Arc::new(RwLock::new(values)),
            path: Some(path),
        })
    }

    /// Load from an explicit path or fall back to the platform default.
    pub fn load_or_default(path: Option<&Path>) -> AppResult<Self> {
        match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(p) => Self::load(p),
            None => Ok(Self::in_memory()),
        }
    }

    /// Backing file, if persisted
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Raw value for `key`
    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Value for `key` deserialized into `T`; `None` if absent or of the wrong shape.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_value(key)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Set `key` and persist the store.
    pub fn set_value<T: Serialize>(&self, key: &str, value: T) -> AppResult<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| CockpitError::Configuration(format!("{}: {}", key, e)))?;
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
        self.save()
    }

    /// Directory for experiment output: the `data-dir` value, else the home
    /// directory, else the working directory.
    pub fn data_dir(&self) -> PathBuf {
        self.get::<String>(DATA_DIR_KEY)
            .map(PathBuf::from)
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn save(&self) -> AppResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = {
            let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
            serde_json::to_string_pretty(&*values)
                .map_err(|e| CockpitError::Configuration(e.to_string()))?
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn values_persist_across_loads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("user.json");

        let config = UserConfig::load(&path).unwrap();
        assert!(config.get_value("camera_SETTINGS").is_none());
        config
            .set_value("camera_SETTINGS", json!({"gain": 3}))
            .unwrap();

        let reloaded = UserConfig::load(&path).unwrap();
        assert_eq!(
            reloaded.get_value("camera_SETTINGS"),
            Some(json!({"gain": 3}))
        );
    }

    #[test]
    fn data_dir_prefers_configured_value() {
        let config = UserConfig::in_memory();
        config.set_value(DATA_DIR_KEY, "/tmp/cockpit-data").unwrap();
        assert_eq!(config.data_dir(), PathBuf::from("/tmp/cockpit-data"));
    }

    #[test]
    fn rejects_non_object_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("user.json");
        fs::write(&path, "[1, 2, 3]").unwrap();
        assert!(matches!(
            UserConfig::load(&path),
            Err(CockpitError::Configuration(_))
        ));
    }
}
