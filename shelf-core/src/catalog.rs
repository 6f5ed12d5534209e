use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{DocumentSource, StorageService};

pub const CATALOG_FILE_NAME: &str = "book_cache.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub title: String,
    pub book_location: PathBuf,
    #[serde(default)]
    pub cover_location: Option<PathBuf>,
}

impl CatalogEntry {
    fn source(&self) -> DocumentSource {
        DocumentSource {
            content_location: self.book_location.clone(),
            cover_location: self.cover_location.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("no book titled {0:?} in the catalog")]
    NotFound(String),
    #[error("book catalog {0:?} does not exist")]
    Missing(PathBuf),
}

pub fn file_url(path: &Path) -> Result<Url> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Url::from_file_path(&absolute).map_err(|_| anyhow!("cannot express {:?} as a file URL", absolute))
}

pub struct JsonCatalog {
    path: PathBuf,
}

impl JsonCatalog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> Result<Vec<CatalogEntry>> {
        load_entries(&self.path)
    }

    pub fn store(&self, entries: &[CatalogEntry]) -> Result<()> {
        let mut sorted = entries.to_vec();
        sorted.sort_by(|a, b| a.title.cmp(&b.title));
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create catalog directory {:?}", parent))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let file =
            File::create(&tmp).with_context(|| format!("failed to open temp catalog {:?}", tmp))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &sorted)
            .with_context(|| format!("failed to encode catalog {:?}", tmp))?;
        writer
            .flush()
            .with_context(|| format!("failed to flush temp catalog {:?}", tmp))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace catalog {:?}", self.path))?;
        debug!(books = sorted.len(), path = ?self.path, "catalog written");
        Ok(())
    }
}

fn load_entries(path: &Path) -> Result<Vec<CatalogEntry>> {
    if !path.exists() {
        return Err(CatalogError::Missing(path.to_path_buf()).into());
    }
    let file = File::open(path).with_context(|| format!("failed to open catalog {:?}", path))?;
    let mut entries: Vec<CatalogEntry> = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to decode catalog {:?}", path))?;
    entries.sort_by(|a, b| a.title.cmp(&b.title));
    Ok(entries)
}

fn lookup(entries: &[CatalogEntry], title: &str) -> Result<DocumentSource> {
    entries
        .binary_search_by(|entry| entry.title.as_str().cmp(title))
        .map(|index| entries[index].source())
        .map_err(|_| CatalogError::NotFound(title.to_string()).into())
}

#[async_trait::async_trait]
impl StorageService for JsonCatalog {
    async fn fetch_document_source(&self, identifier: &str) -> Result<DocumentSource> {
        let path = self.path.clone();
        let entries = tokio::task::spawn_blocking(move || load_entries(&path))
            .await
            .context("catalog loader panicked")??;
        debug!(books = entries.len(), identifier, "catalog loaded");
        lookup(&entries, identifier)
    }

    fn resolve_local_path(&self, path: &Path) -> Result<Url> {
        file_url(path)
    }
}

pub struct MemoryCatalog {
    inner: Mutex<HashMap<String, DocumentSource>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, title: &str, source: DocumentSource) {
        self.inner.lock().insert(title.to_string(), source);
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StorageService for MemoryCatalog {
    async fn fetch_document_source(&self, identifier: &str) -> Result<DocumentSource> {
        self.inner
            .lock()
            .get(identifier)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(identifier.to_string()).into())
    }

    fn resolve_local_path(&self, path: &Path) -> Result<Url> {
        file_url(path)
    }
}
