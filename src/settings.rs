//! Small persisted key/value settings (`settings.json`).

use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use serde_json::{Map, Value};
use tracing::warn;

use crate::error::EngineResult;

/// Capture device chosen during setup (a path or `-` for stdin)
pub const CAPTURE_DEVICE: &str = "capture_device";

/// Whether first-run setup has completed
pub const SETUP_COMPLETE: &str = "setup_complete";

/// Key/value settings persisted across runs
pub trait Settings: Send + Sync {
    /// Stored value, or `default` when the key is absent
    fn get(&self, key: &str, default: Value) -> Value;

    fn set(&self, key: &str, value: Value) -> EngineResult<()>;

    fn capture_device(&self) -> Option<String> {
        match self.get(CAPTURE_DEVICE, Value::Null) {
            Value::String(device) if !device.is_empty() => Some(device),
            _ => None,
        }
    }

    fn setup_complete(&self) -> bool {
        self.get(SETUP_COMPLETE, Value::Bool(false)).as_bool().unwrap_or(false)
    }
}

/// Settings stored as a pretty-printed JSON object
pub struct JsonSettings {
    path: PathBuf,
    data: RwLock<Map<String, Value>>,
}

impl JsonSettings {
    /// Load settings from `path`; a missing or unreadable file starts empty
    pub fn open(path: PathBuf) -> EngineResult<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            match serde_json::from_str::<Map<String, Value>>(&contents) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), "Ignoring unreadable settings: {}", e);
                    Map::new()
                }
            }
        } else {
            Map::new()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Open the settings file in the configured location
    pub fn open_default() -> anyhow::Result<Self> {
        let home = &crate::config::config()?.home;
        Ok(Self::open(crate::config::paths::settings_file_in(home))?)
    }

    fn persist(&self, data: &Map<String, Value>) -> EngineResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serialized)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Settings for JsonSettings {
    fn get(&self, key: &str, default: Value) -> Value {
        let data = match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        data.get(key).cloned().unwrap_or(default)
    }

    fn set(&self, key: &str, value: Value) -> EngineResult<()> {
        let mut data = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut updated = data.clone();
        updated.insert(key.to_string(), value);
        self.persist(&updated)?;
        *data = updated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_when_missing() {
        let temp = TempDir::new().unwrap();
        let settings = JsonSettings::open(temp.path().join("settings.json")).unwrap();

        assert_eq!(settings.get("volume", json!(7)), json!(7));
        assert_eq!(settings.capture_device(), None);
        assert!(!settings.setup_complete());
    }

    #[test]
    fn test_failed_write_leaves_value_unchanged() {
        let temp = TempDir::new().unwrap();
        // A regular file where the settings directory should be
        let blocker = temp.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let settings = JsonSettings::open(blocker.join("settings.json")).unwrap();
        assert!(settings.set(CAPTURE_DEVICE, json!("/dev/audio0")).is_err());
        assert_eq!(settings.capture_device(), None);
    }

    #[test]
    fn test_values_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.json");

        let settings = JsonSettings::open(path.clone()).unwrap();
        settings.set(CAPTURE_DEVICE, json!("/dev/audio0")).unwrap();
        settings.set(SETUP_COMPLETE, json!(true)).unwrap();

        let reopened = JsonSettings::open(path).unwrap();
        assert_eq!(reopened.capture_device().as_deref(), Some("/dev/audio0"));
        assert!(reopened.setup_complete());
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        let settings = JsonSettings::open(path).unwrap();
        assert!(!settings.setup_complete());
    }
}
