use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

use crate::{ConfigService, LayoutConfig, LayoutMode};

pub const BOOK_LOCATION: &str = "book_location";
pub const ENDLESS_SCROLL: &str = "endless_scroll";
pub const COVER_BACKGROUND: &str = "cover_background";

pub const SETTINGS_FILE_NAME: &str = "shelf_settings.conf";

pub const DEFAULT_SETTINGS: &[(&str, &str)] = &[
    (BOOK_LOCATION, ""),
    (ENDLESS_SCROLL, "false"),
    (COVER_BACKGROUND, "false"),
];

pub fn parse_flag(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

#[derive(Clone)]
pub struct ConfigResolver {
    service: Arc<dyn ConfigService>,
}

impl ConfigResolver {
    pub fn new(service: Arc<dyn ConfigService>) -> Self {
        Self { service }
    }

    #[instrument(skip(self))]
    pub async fn resolve(&self) -> LayoutConfig {
        let (endless, cover) = tokio::join!(self.flag(ENDLESS_SCROLL), self.flag(COVER_BACKGROUND));
        let mode = if endless {
            LayoutMode::Continuous
        } else {
            LayoutMode::Paginated
        };
        debug!(?mode, show_cover_background = cover, "layout resolved");
        LayoutConfig {
            mode,
            show_cover_background: cover,
        }
    }

    async fn flag(&self, name: &str) -> bool {
        match self.service.get_option(name).await {
            Ok(Some(value)) if !value.trim().is_empty() => parse_flag(&value),
            Ok(_) => {
                debug!(option = name, "option not set, using default");
                false
            }
            Err(err) => {
                warn!(?err, option = name, "configuration unavailable, using default");
                false
            }
        }
    }
}

fn default_map() -> BTreeMap<String, String> {
    DEFAULT_SETTINGS
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn parse_settings(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .filter_map(|line| line.trim().split_once('='))
        .filter(|(key, _)| !key.trim().is_empty())
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

pub struct FileConfigStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileConfigStore {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create settings directory at {:?}", dir))?;
        let path = dir.join(SETTINGS_FILE_NAME);
        let values = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings file {:?}", path))?;
            parse_settings(&contents)
        } else {
            let defaults = default_map();
            write_settings(&path, &defaults)?;
            defaults
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.values.lock().get(name).cloned()
    }

    pub fn set_option(&self, name: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock();
        values.insert(name.to_string(), value.to_string());
        write_settings(&self.path, &values)
    }

    pub fn values(&self) -> Vec<(String, String)> {
        let values = self.values.lock();
        let mut listed: Vec<(String, String)> = DEFAULT_SETTINGS
            .iter()
            .map(|(key, default)| {
                let value = values
                    .get(*key)
                    .cloned()
                    .unwrap_or_else(|| default.to_string());
                (key.to_string(), value)
            })
            .collect();
        listed.extend(
            values
                .iter()
                .filter(|(key, _)| !DEFAULT_SETTINGS.iter().any(|(known, _)| known == key))
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        listed
    }

    pub fn reset(&self) -> Result<()> {
        let mut values = self.values.lock();
        *values = default_map();
        write_settings(&self.path, &values)
    }
}

fn write_settings(path: &Path, values: &BTreeMap<String, String>) -> Result<()> {
    let tmp = path.with_extension("conf.tmp");
    let payload: String = values
        .iter()
        .map(|(key, value)| format!("{key}={value}\n"))
        .collect();
    let mut file =
        File::create(&tmp).with_context(|| format!("failed to open temp settings file {:?}", tmp))?;
    file.write_all(payload.as_bytes())
        .with_context(|| format!("failed to write temp settings file {:?}", tmp))?;
    file.flush()
        .with_context(|| format!("failed to flush temp settings file {:?}", tmp))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace settings file {:?}", path))?;
    Ok(())
}

#[async_trait::async_trait]
impl ConfigService for FileConfigStore {
    async fn get_option(&self, name: &str) -> Result<Option<String>> {
        Ok(self.get(name))
    }
}

pub struct MemoryConfigStore {
    inner: Mutex<BTreeMap<String, String>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with(self, name: &str, value: &str) -> Self {
        self.inner.lock().insert(name.to_string(), value.to_string());
        self
    }
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ConfigService for MemoryConfigStore {
    async fn get_option(&self, name: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use tempfile::tempdir;

    struct BrokenService;

    #[async_trait::async_trait]
    impl ConfigService for BrokenService {
        async fn get_option(&self, _name: &str) -> Result<Option<String>> {
            Err(anyhow!("backend offline"))
        }
    }

    #[tokio::test]
    async fn endless_scroll_true_selects_continuous() {
        let store = MemoryConfigStore::new().with(ENDLESS_SCROLL, "true");
        let config = ConfigResolver::new(Arc::new(store)).resolve().await;
        assert_eq!(config.mode, LayoutMode::Continuous);
        assert!(!config.show_cover_background);
    }

    #[tokio::test]
    async fn empty_options_fall_back_to_defaults() {
        let store = MemoryConfigStore::new()
            .with(ENDLESS_SCROLL, "")
            .with(COVER_BACKGROUND, "  ");
        let config = ConfigResolver::new(Arc::new(store)).resolve().await;
        assert_eq!(config, LayoutConfig::default());
        assert_eq!(config.mode, LayoutMode::Paginated);
    }

    #[tokio::test]
    async fn backend_errors_degrade_to_defaults() {
        let config = ConfigResolver::new(Arc::new(BrokenService)).resolve().await;
        assert_eq!(config, LayoutConfig::default());
    }

    #[tokio::test]
    async fn cover_background_flag_is_read() {
        let store = MemoryConfigStore::new()
            .with(ENDLESS_SCROLL, "false")
            .with(COVER_BACKGROUND, "TRUE");
        let config = ConfigResolver::new(Arc::new(store)).resolve().await;
        assert_eq!(config.mode, LayoutMode::Paginated);
        assert!(config.show_cover_background);
    }

    #[test]
    fn flags_only_accept_true() {
        assert!(parse_flag("true"));
        assert!(parse_flag(" True\n"));
        assert!(!parse_flag("yes"));
        assert!(!parse_flag("1"));
        assert!(!parse_flag(""));
    }

    #[test]
    fn file_store_creates_defaults_on_first_open() {
        let dir = tempdir().unwrap();
        let store = FileConfigStore::open(dir.path()).unwrap();
        assert!(store.path().exists());
        assert_eq!(store.get(ENDLESS_SCROLL).as_deref(), Some("false"));
        assert_eq!(store.get(BOOK_LOCATION).as_deref(), Some(""));
    }

    #[test]
    fn file_store_persists_changes_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileConfigStore::open(dir.path()).unwrap();
            store.set_option(ENDLESS_SCROLL, "true").unwrap();
            store.set_option(BOOK_LOCATION, "/books").unwrap();
        }

        let reopened = FileConfigStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get(ENDLESS_SCROLL).as_deref(), Some("true"));
        assert_eq!(reopened.get(BOOK_LOCATION).as_deref(), Some("/books"));
    }

    #[test]
    fn file_store_ignores_malformed_lines() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(SETTINGS_FILE_NAME),
            "endless_scroll=true\nnot a setting\n=orphan\ncover_background = true\n",
        )
        .unwrap();

        let store = FileConfigStore::open(dir.path()).unwrap();
        assert_eq!(store.get(ENDLESS_SCROLL).as_deref(), Some("true"));
        assert_eq!(store.get(COVER_BACKGROUND).as_deref(), Some("true"));
        assert_eq!(store.get(""), None);
    }

    #[test]
    fn values_lists_known_keys_first_and_reset_restores_defaults() {
        let dir = tempdir().unwrap();
        let store = FileConfigStore::open(dir.path()).unwrap();
        store.set_option("theme", "dark").unwrap();
        store.set_option(ENDLESS_SCROLL, "true").unwrap();

        let listed = store.values();
        let keys: Vec<_> = listed.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec![BOOK_LOCATION, ENDLESS_SCROLL, COVER_BACKGROUND, "theme"]);
        assert_eq!(listed[1].1, "true");

        store.reset().unwrap();
        assert_eq!(store.get(ENDLESS_SCROLL).as_deref(), Some("false"));
        assert_eq!(store.get("theme"), None);
    }

    #[test]
    fn failed_writes_name_the_settings_file() {
        let dir = tempdir().unwrap();
        let store = FileConfigStore::open(dir.path()).unwrap();
        fs::create_dir(dir.path().join("shelf_settings.conf.tmp")).unwrap();

        let err = store.set_option(ENDLESS_SCROLL, "true").unwrap_err();
        assert!(format!("{err:#}").contains("shelf_settings.conf.tmp"));
    }
}
