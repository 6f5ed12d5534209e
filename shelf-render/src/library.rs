use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use epub::doc::EpubDoc;
use rayon::prelude::*;
use shelf_core::{CatalogEntry, CatalogError, JsonCatalog};
use tracing::{debug, info, instrument, warn};

pub const COVER_DIR_NAME: &str = "cover_cache";

pub fn list_epubs(book_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(book_dir)
        .with_context(|| format!("failed to read book directory {:?}", book_dir))?;
    let mut books = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("failed to list book directory {:?}", book_dir))?
            .path();
        let is_epub = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("epub"));
        if is_epub && path.is_file() {
            books.push(path);
        }
    }
    books.sort();
    Ok(books)
}

pub struct LibraryScanner {
    book_dir: PathBuf,
    cover_dir: PathBuf,
}

impl LibraryScanner {
    pub fn new(book_dir: impl Into<PathBuf>, cache_dir: &Path) -> Self {
        Self {
            book_dir: book_dir.into(),
            cover_dir: cache_dir.join(COVER_DIR_NAME),
        }
    }

    pub fn book_dir(&self) -> &Path {
        &self.book_dir
    }

    #[instrument(skip(self), fields(book_dir = ?self.book_dir))]
    pub fn scan(&self) -> Result<Vec<CatalogEntry>> {
        let books = list_epubs(&self.book_dir)?;
        fs::create_dir_all(&self.cover_dir)
            .with_context(|| format!("failed to create cover cache {:?}", self.cover_dir))?;

        let mut entries: Vec<CatalogEntry> = books
            .par_iter()
            .filter_map(|path| match self.read_book(path) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(?path, "skipping unreadable book: {err:#}");
                    None
                }
            })
            .collect();
        entries.sort_by(|a, b| a.title.cmp(&b.title));
        info!(found = books.len(), indexed = entries.len(), "library scanned");
        Ok(entries)
    }

    pub fn refresh(&self, catalog: &JsonCatalog) -> Result<Vec<CatalogEntry>> {
        let entries = self.scan()?;
        catalog.store(&entries)?;
        Ok(entries)
    }

    // Missing, unreadable, or listing other files than the folder holds.
    pub fn is_stale(&self, catalog: &JsonCatalog) -> Result<bool> {
        let entries = match catalog.entries() {
            Ok(entries) => entries,
            Err(err) => {
                if !matches!(err.downcast_ref::<CatalogError>(), Some(CatalogError::Missing(_))) {
                    warn!(path = ?catalog.path(), "catalog unreadable, rescanning: {err:#}");
                }
                return Ok(true);
            }
        };
        let on_disk: BTreeSet<PathBuf> = list_epubs(&self.book_dir)?.into_iter().collect();
        let listed: BTreeSet<PathBuf> = entries.into_iter().map(|entry| entry.book_location).collect();
        Ok(on_disk != listed)
    }

    fn read_book(&self, path: &Path) -> Result<CatalogEntry> {
        let mut doc =
            EpubDoc::new(path).with_context(|| format!("failed to open EPUB at {}", path.display()))?;
        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let title = doc
            .mdata("title")
            .map(|item| item.value.trim().to_string())
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| stem.clone());

        let cover_location = match doc.get_cover() {
            Some((bytes, mime)) => {
                let cover = self.cover_dir.join(format!("{stem}.{}", cover_extension(&mime)));
                match fs::write(&cover, bytes) {
                    Ok(()) => Some(cover),
                    Err(err) => {
                        warn!(?cover, ?err, "failed to write cover image");
                        None
                    }
                }
            }
            None => {
                debug!(?path, "book has no cover");
                None
            }
        };

        Ok(CatalogEntry {
            title,
            book_location: path.to_path_buf(),
            cover_location,
        })
    }
}

fn cover_extension(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        _ => "img",
    }
}
