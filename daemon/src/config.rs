use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use common::{Config, ConfigError, CONFIG_DIR_NAME, CONFIG_FILE_NAME};
use uuid::Uuid;

/// Owns the durable configuration: the server credentials and the monitored
/// path list. The in-memory snapshot is an `Arc<Config>` swapped atomically
/// on save, so a pass that captured the previous snapshot keeps reading it
/// untorn while a save lands.
pub struct ConfigStore {
    file_path: PathBuf,
    current: Mutex<Option<Arc<Config>>>,
}

impl ConfigStore {
    pub fn new(file_path: PathBuf) -> Self {
        Self {
            file_path,
            current: Mutex::new(None),
        }
    }

    /// `$XDG_CONFIG_HOME/shuttersync/config.json`, falling back to
    /// `~/.config/shuttersync/config.json`, then the working directory.
    pub fn default_path() -> PathBuf {
        if let Some(base) = std::env::var_os("XDG_CONFIG_HOME") {
            return PathBuf::from(base).join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME);
        }
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home)
                .join(".config")
                .join(CONFIG_DIR_NAME)
                .join(CONFIG_FILE_NAME);
        }
        PathBuf::from(CONFIG_FILE_NAME)
    }

    /// The active snapshot, if any.
    pub fn current(&self) -> Option<Arc<Config>> {
        self.current.lock().unwrap().clone()
    }

    /// Read the persisted config. A missing file means "no configuration
    /// yet" (`Ok(None)`). A malformed or invalid file is an error surfaced
    /// to the caller; the in-memory snapshot is left untouched, never
    /// silently reset.
    pub fn load(&self) -> Result<Option<Arc<Config>>, ConfigError> {
        if !self.file_path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.file_path)?;
        let mut config: Config = serde_json::from_str(&raw)?;
        // Hand-edited files go through the same gate as saves.
        config.validate()?;
        assign_ids(&mut config);

        let snapshot = Arc::new(config);
        *self.current.lock().unwrap() = Some(snapshot.clone());
        Ok(Some(snapshot))
    }

    /// Validate, persist, then swap the in-memory snapshot. Validation is
    /// all-or-nothing: an invalid config is rejected at this point and
    /// nothing is applied. Concurrent saves serialize on the store lock.
    pub fn save(&self, mut config: Config) -> Result<Arc<Config>, ConfigError> {
        config.validate()?;
        assign_ids(&mut config);

        let mut current = self.current.lock().unwrap();
        if let Some(dir) = self.file_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&config)?;
        // Write-then-rename so a crash mid-save never leaves a torn file.
        let tmp = self.file_path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.file_path)?;

        let snapshot = Arc::new(config);
        *current = Some(snapshot.clone());
        Ok(snapshot)
    }
}

/// Path ids are assigned once and stay stable; the UI addresses manual
/// triggers by them.
fn assign_ids(config: &mut Config) {
    for path in &mut config.paths {
        if path.id.is_empty() {
            path.id = Uuid::new_v4().to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::PathConfig;
    use tempfile::TempDir;

    fn sample() -> Config {
        Config {
            server_url: "https://photos.example.com".to_string(),
            api_key: "secret".to_string(),
            paths: vec![PathConfig {
                id: String::new(),
                directory: "/home/user/Pictures".to_string(),
                cron_expressions: vec!["0 2 * * *".to_string()],
                recursive: true,
            }],
        }
    }

    #[test]
    fn missing_file_is_no_configuration_yet() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        assert!(store.load().unwrap().is_none());
        assert!(store.current().is_none());
    }

    #[test]
    fn malformed_file_is_an_error_not_a_reset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = ConfigStore::new(path);
        assert!(matches!(store.load(), Err(ConfigError::Malformed(_))));
        assert!(store.current().is_none());
    }

    #[test]
    fn save_assigns_ids_and_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));

        let saved = store.save(sample()).unwrap();
        let id = saved.paths[0].id.clone();
        assert!(!id.is_empty());

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.paths[0].id, id);
        assert_eq!(loaded.server_url, "https://photos.example.com");
    }

    #[test]
    fn invalid_config_is_rejected_and_not_written() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::new(path.clone());

        let mut bad = sample();
        bad.paths[0].cron_expressions = vec!["61 * * * *".to_string()];
        assert!(store.save(bad).is_err());
        assert!(!path.exists());
        assert!(store.current().is_none());
    }

    #[test]
    fn save_replaces_the_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));

        let first = store.save(sample()).unwrap();
        let mut updated = sample();
        updated.api_key = "rotated".to_string();
        let second = store.save(updated).unwrap();

        assert_eq!(first.api_key, "secret");
        assert_eq!(second.api_key, "rotated");
        assert_eq!(store.current().unwrap().api_key, "rotated");
    }
}
