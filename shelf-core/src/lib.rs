use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use url::Url;

mod adapter;
mod catalog;
mod config;
mod session;
mod viewport;

pub use adapter::{apply_layout, RenderingAdapter};
pub use catalog::{file_url, CatalogEntry, CatalogError, JsonCatalog, MemoryCatalog, CATALOG_FILE_NAME};
pub use config::{
    parse_flag, ConfigResolver, FileConfigStore, MemoryConfigStore, BOOK_LOCATION,
    COVER_BACKGROUND, DEFAULT_SETTINGS, ENDLESS_SCROLL, SETTINGS_FILE_NAME,
};
pub use session::{
    Acquisition, ControllerServices, NavigationBridge, ReaderController, ResizeCoordinator,
    SessionGuard, SessionState, FALLBACK_TITLE,
};
pub use viewport::{
    ResizeSubscription, ViewportGeometry, ViewportTracker, WindowSize, CELL_HEIGHT, CELL_WIDTH,
    CHROME_HEIGHT, CHROME_WIDTH, MAX_CONTENT_WIDTH,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayoutMode {
    #[default]
    Paginated,
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LayoutConfig {
    pub mode: LayoutMode,
    pub show_cover_background: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Manager {
    Default,
    Continuous,
}

impl Manager {
    pub fn as_str(self) -> &'static str {
        match self {
            Manager::Default => "default",
            Manager::Continuous => "continuous",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Scrolled,
}

impl Flow {
    pub fn as_str(self) -> &'static str {
        match self {
            Flow::Scrolled => "scrolled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spread {
    Disabled,
}

impl Spread {
    pub fn as_str(self) -> &'static str {
        match self {
            Spread::Disabled => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderSettings {
    pub manager: Manager,
    pub flow: Option<Flow>,
    pub spread: Option<Spread>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSource {
    pub content_location: PathBuf,
    pub cover_location: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("no document named {0:?}")]
    DocumentNotFound(String),
    #[error("failed to fetch document: {0}")]
    DocumentFetch(String),
    #[error("engine could not open the document: {0}")]
    EngineOpen(String),
    #[error("engine never became ready: {0}")]
    EngineReady(String),
    #[error("failed to render the document: {0}")]
    Render(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageView {
    pub title: String,
    pub lines: Vec<String>,
    /// Zero-based section index and the section count.
    pub position: Option<(usize, usize)>,
    pub width: u32,
    pub height: u32,
}

pub trait Surface: Send + Sync {
    fn present(&self, view: &PageView) -> Result<()>;

    fn set_backdrop(&self, _cover: Option<&Url>) {}
}

pub trait RenderingEngine: Send + Sync {
    fn create(&self) -> Box<dyn EngineInstance>;
}

#[async_trait::async_trait]
pub trait EngineInstance: Send {
    async fn open(&mut self, location: &Url) -> Result<()>;

    async fn ready(&mut self) -> Result<()>;

    fn render_to(
        self: Box<Self>,
        surface: Arc<dyn Surface>,
        settings: RenderSettings,
    ) -> Result<Box<dyn Rendition>>;
}

pub trait Rendition: Send {
    fn display(&mut self) -> Result<()>;
    fn resize(&mut self, width: u32, height: u32);
    fn prev(&mut self) -> Result<()>;
    fn next(&mut self) -> Result<()>;
}

#[async_trait::async_trait]
pub trait ConfigService: Send + Sync {
    async fn get_option(&self, name: &str) -> Result<Option<String>>;
}

#[async_trait::async_trait]
pub trait StorageService: Send + Sync {
    async fn fetch_document_source(&self, identifier: &str) -> Result<DocumentSource>;

    fn resolve_local_path(&self, path: &Path) -> Result<Url>;
}

pub trait HostShell: Send + Sync {
    fn window_size(&self) -> WindowSize;
    fn set_title(&self, title: &str);
}
