use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use epub::doc::EpubDoc;
use shelf_core::{
    EngineInstance, Manager, PageView, RenderSettings, RenderingEngine, Rendition, Surface,
    CELL_HEIGHT, CELL_WIDTH,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use url::Url;

mod library;

pub use library::{list_epubs, LibraryScanner, COVER_DIR_NAME};

const MIN_COLUMNS: usize = 10;

type Book = EpubDoc<BufReader<File>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NavigationError {
    #[error("already at the beginning of the book")]
    AtStart,
    #[error("already at the end of the book")]
    AtEnd,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EpubEngine;

impl EpubEngine {
    pub fn new() -> Self {
        Self
    }
}

impl RenderingEngine for EpubEngine {
    fn create(&self) -> Box<dyn EngineInstance> {
        Box::new(EpubInstance::default())
    }
}

#[derive(Debug, Clone, Default)]
struct BookContents {
    title: String,
    sections: Vec<String>,
}

#[derive(Default)]
pub struct EpubInstance {
    book: Option<Book>,
    contents: Option<BookContents>,
}

#[async_trait]
impl EngineInstance for EpubInstance {
    #[instrument(skip_all, fields(location = %location))]
    async fn open(&mut self, location: &Url) -> Result<()> {
        let path: PathBuf = location
            .to_file_path()
            .map_err(|_| anyhow!("{location} is not a local file"))?;
        let book = tokio::task::spawn_blocking(move || {
            EpubDoc::new(&path).with_context(|| format!("failed to open EPUB at {}", path.display()))
        })
        .await
        .context("EPUB loader panicked")??;
        debug!(chapters = book.get_num_chapters(), "EPUB container opened");
        self.book = Some(book);
        Ok(())
    }

    async fn ready(&mut self) -> Result<()> {
        if self.contents.is_some() {
            return Ok(());
        }
        let book = self
            .book
            .take()
            .ok_or_else(|| anyhow!("no document has been opened"))?;
        let contents = tokio::task::spawn_blocking(move || index_book(book))
            .await
            .context("EPUB indexer panicked")??;
        info!(
            title = %contents.title,
            sections = contents.sections.len(),
            "EPUB ready"
        );
        self.contents = Some(contents);
        Ok(())
    }

    fn render_to(
        self: Box<Self>,
        surface: Arc<dyn Surface>,
        settings: RenderSettings,
    ) -> Result<Box<dyn Rendition>> {
        let contents = self
            .contents
            .ok_or_else(|| anyhow!("engine is not ready"))?;
        Ok(Box::new(EpubRendition::new(contents, surface, settings)))
    }
}

fn index_book(mut book: Book) -> Result<BookContents> {
    let title = book
        .mdata("title")
        .map(|item| item.value.clone())
        .unwrap_or_default();

    let mut sections = Vec::new();
    loop {
        if let Some((html, _mime)) = book.get_current_str() {
            sections.push(html);
        }
        if !book.go_next() {
            break;
        }
    }
    if sections.is_empty() {
        bail!("EPUB has no readable sections");
    }
    Ok(BookContents { title, sections })
}

fn html_to_lines(html: &str, columns: usize) -> Vec<String> {
    let text = match html2text::from_read(html.as_bytes(), columns) {
        Ok(text) => text,
        Err(err) => {
            warn!("html2text failed, showing raw markup: {err}");
            html.to_string()
        }
    };
    let mut lines: Vec<String> = text.lines().map(str::to_owned).collect();
    while lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }
    lines
}

#[derive(Debug, Default)]
struct TextFlow {
    lines: Vec<String>,
    // first line of each section
    starts: Vec<usize>,
}

impl TextFlow {
    fn from_sections(sections: Vec<Vec<String>>) -> Self {
        let mut flow = TextFlow::default();
        for section in sections {
            flow.starts.push(flow.lines.len());
            flow.lines.extend(section);
        }
        flow
    }

    fn section_count(&self) -> usize {
        self.starts.len()
    }

    fn section_of(&self, line: usize) -> usize {
        self.starts
            .partition_point(|&start| start <= line)
            .saturating_sub(1)
    }

    fn section_end(&self, section: usize) -> usize {
        self.starts
            .get(section + 1)
            .copied()
            .unwrap_or(self.lines.len())
    }

    fn is_blank(&self, section: usize) -> bool {
        self.starts
            .get(section)
            .map_or(true, |&start| start == self.section_end(section))
    }

    fn next_filled(&self, after: usize) -> Option<usize> {
        (after + 1..self.section_count()).find(|&section| !self.is_blank(section))
    }

    fn prev_filled(&self, before: usize) -> Option<usize> {
        (0..before).rev().find(|&section| !self.is_blank(section))
    }
}

pub struct EpubRendition {
    title: String,
    sections: Vec<String>,
    surface: Arc<dyn Surface>,
    manager: Manager,
    width: u32,
    height: u32,
    flow: TextFlow,
    top: usize,
}

impl EpubRendition {
    fn new(contents: BookContents, surface: Arc<dyn Surface>, settings: RenderSettings) -> Self {
        let mut rendition = Self {
            title: contents.title,
            sections: contents.sections,
            surface,
            manager: settings.manager,
            width: settings.width,
            height: settings.height,
            flow: TextFlow::default(),
            top: 0,
        };
        rendition.reflow();
        rendition
    }

    fn columns(&self) -> usize {
        ((self.width / CELL_WIDTH) as usize).max(MIN_COLUMNS)
    }

    fn rows(&self) -> usize {
        ((self.height / CELL_HEIGHT) as usize).max(1)
    }

    fn reflow(&mut self) {
        let section = self.flow.section_of(self.top);
        let columns = self.columns();
        let wrapped = self
            .sections
            .iter()
            .map(|html| html_to_lines(html, columns))
            .collect();
        self.flow = TextFlow::from_sections(wrapped);
        self.top = self.flow.starts.get(section).copied().unwrap_or(0);
    }

    fn visible_end(&self) -> usize {
        let limit = match self.manager {
            Manager::Default => self.flow.section_end(self.flow.section_of(self.top)),
            Manager::Continuous => self.flow.lines.len(),
        };
        (self.top + self.rows()).min(limit)
    }

    fn view(&self) -> PageView {
        let end = self.visible_end();
        let lines = self.flow.lines.get(self.top..end).unwrap_or_default().to_vec();
        PageView {
            title: self.title.clone(),
            lines,
            position: Some((self.flow.section_of(self.top), self.flow.section_count())),
            width: self.width,
            height: self.height,
        }
    }

    fn advance(&mut self) -> Result<(), NavigationError> {
        let rows = self.rows();
        match self.manager {
            Manager::Default => {
                let section = self.flow.section_of(self.top);
                if self.top + rows < self.flow.section_end(section) {
                    self.top += rows;
                } else if let Some(next) = self.flow.next_filled(section) {
                    self.top = self.flow.starts[next];
                } else {
                    return Err(NavigationError::AtEnd);
                }
            }
            Manager::Continuous => {
                if self.top + rows < self.flow.lines.len() {
                    self.top += rows;
                } else {
                    return Err(NavigationError::AtEnd);
                }
            }
        }
        Ok(())
    }

    fn retreat(&mut self) -> Result<(), NavigationError> {
        let rows = self.rows();
        match self.manager {
            Manager::Default => {
                let section = self.flow.section_of(self.top);
                let start = self.flow.starts.get(section).copied().unwrap_or(0);
                if self.top > start {
                    self.top = self.top.saturating_sub(rows).max(start);
                } else if let Some(previous) = self.flow.prev_filled(section) {
                    let start = self.flow.starts[previous];
                    let len = self.flow.section_end(previous) - start;
                    self.top = start + (len.saturating_sub(1) / rows) * rows;
                } else {
                    return Err(NavigationError::AtStart);
                }
            }
            Manager::Continuous => {
                if self.top == 0 {
                    return Err(NavigationError::AtStart);
                }
                self.top = self.top.saturating_sub(rows);
            }
        }
        Ok(())
    }
}

impl Rendition for EpubRendition {
    fn display(&mut self) -> Result<()> {
        self.surface.present(&self.view())
    }

    fn resize(&mut self, width: u32, height: u32) {
        if (width, height) == (self.width, self.height) {
            return;
        }
        self.width = width;
        self.height = height;
        self.reflow();
        if let Err(err) = self.display() {
            warn!(?err, width, height, "failed to redraw after resize");
        }
    }

    fn prev(&mut self) -> Result<()> {
        self.retreat()?;
        self.display()
    }

    fn next(&mut self) -> Result<()> {
        self.advance()?;
        self.display()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use shelf_core::{Flow, Spread};

    #[derive(Default)]
    struct RecordingSurface {
        frames: Mutex<Vec<PageView>>,
    }

    impl Surface for RecordingSurface {
        fn present(&self, view: &PageView) -> Result<()> {
            self.frames.lock().push(view.clone());
            Ok(())
        }
    }

    impl RecordingSurface {
        fn last(&self) -> PageView {
            self.frames.lock().last().cloned().unwrap()
        }
    }

    fn settings(manager: Manager, rows: u32) -> RenderSettings {
        RenderSettings {
            manager,
            flow: (manager == Manager::Continuous).then_some(Flow::Scrolled),
            spread: (manager == Manager::Default).then_some(Spread::Disabled),
            width: 320,
            height: rows * CELL_HEIGHT,
        }
    }

    fn lines(prefix: &str, count: usize) -> Vec<String> {
        (0..count).map(|i| format!("{prefix}{i}")).collect()
    }

    fn rendition_over(
        manager: Manager,
        rows: u32,
        surface: Arc<RecordingSurface>,
        sections: Vec<Vec<String>>,
    ) -> EpubRendition {
        let mut rendition =
            EpubRendition::new(BookContents::default(), surface, settings(manager, rows));
        rendition.flow = TextFlow::from_sections(sections);
        rendition
    }

    fn rendition(manager: Manager, rows: u32, surface: Arc<RecordingSurface>) -> EpubRendition {
        rendition_over(manager, rows, surface, vec![lines("a", 5), lines("b", 3)])
    }

    #[test]
    fn paginated_turns_stop_at_section_boundaries() {
        let surface = Arc::new(RecordingSurface::default());
        let mut book = rendition(Manager::Default, 2, surface.clone());

        book.display().unwrap();
        assert_eq!(surface.last().lines, vec!["a0", "a1"]);

        book.next().unwrap();
        book.next().unwrap();
        assert_eq!(surface.last().lines, vec!["a4"]);
        assert_eq!(surface.last().position, Some((0, 2)));

        book.next().unwrap();
        assert_eq!(surface.last().lines, vec!["b0", "b1"]);
        assert_eq!(surface.last().position, Some((1, 2)));

        book.next().unwrap();
        assert_eq!(
            book.next().unwrap_err().downcast_ref::<NavigationError>(),
            Some(&NavigationError::AtEnd)
        );

        book.prev().unwrap();
        book.prev().unwrap();
        assert_eq!(surface.last().lines, vec!["a4"]);
    }

    #[test]
    fn paginated_prev_skips_blank_sections() {
        let surface = Arc::new(RecordingSurface::default());
        let sections = vec![lines("a", 3), Vec::new(), lines("c", 3)];
        let mut book = rendition_over(Manager::Default, 2, surface.clone(), sections);

        book.next().unwrap();
        book.next().unwrap();
        assert_eq!(surface.last().lines, vec!["c0", "c1"]);
        assert_eq!(surface.last().position, Some((2, 3)));

        book.prev().unwrap();
        assert_eq!(surface.last().lines, vec!["a2"]);
        book.prev().unwrap();
        assert_eq!(surface.last().lines, vec!["a0", "a1"]);
        assert_eq!(
            book.prev().unwrap_err().downcast_ref::<NavigationError>(),
            Some(&NavigationError::AtStart)
        );
    }

    #[test]
    fn paginated_next_stops_before_trailing_blank_section() {
        let surface = Arc::new(RecordingSurface::default());
        let sections = vec![lines("a", 5), lines("b", 3), Vec::new()];
        let mut book = rendition_over(Manager::Default, 2, surface.clone(), sections);

        for _ in 0..4 {
            book.next().unwrap();
        }
        assert_eq!(surface.last().lines, vec!["b2"]);
        assert_eq!(surface.last().position, Some((1, 3)));

        assert_eq!(
            book.next().unwrap_err().downcast_ref::<NavigationError>(),
            Some(&NavigationError::AtEnd)
        );
        assert_eq!(surface.last().lines, vec!["b2"]);
    }

    #[test]
    fn paginated_start_skips_leading_blank_sections() {
        let surface = Arc::new(RecordingSurface::default());
        let sections = vec![Vec::new(), lines("b", 3)];
        let mut book = rendition_over(Manager::Default, 2, surface.clone(), sections);

        book.display().unwrap();
        assert_eq!(surface.last().lines, vec!["b0", "b1"]);
        assert_eq!(surface.last().position, Some((1, 2)));
        assert!(book.prev().is_err());
    }

    #[test]
    fn continuous_scrolls_across_sections() {
        let surface = Arc::new(RecordingSurface::default());
        let mut book = rendition(Manager::Continuous, 3, surface.clone());

        book.next().unwrap();
        assert_eq!(surface.last().lines, vec!["a3", "a4", "b0"]);
        book.next().unwrap();
        assert_eq!(surface.last().lines, vec!["b1", "b2"]);
        assert!(book.next().is_err());

        book.prev().unwrap();
        book.prev().unwrap();
        assert_eq!(surface.last().lines, vec!["a0", "a1", "a2"]);
        assert_eq!(
            book.prev().unwrap_err().downcast_ref::<NavigationError>(),
            Some(&NavigationError::AtStart)
        );
    }

    #[test]
    fn resize_reflows_and_redraws_from_section_start() {
        let surface = Arc::new(RecordingSurface::default());
        let contents = BookContents {
            title: "Dune".into(),
            sections: vec![
                "<p>A beginning is the time for taking the most delicate care.</p>".into(),
                "<p>Arrakis teaches the attitude of the knife.</p>".into(),
            ],
        };
        let mut book = EpubRendition::new(contents, surface.clone(), settings(Manager::Default, 4));
        book.next().unwrap();
        let frame = surface.last();
        assert_eq!(frame.title, "Dune");
        assert!(frame.lines.join(" ").contains("Arrakis"));

        book.resize(800, 160);
        let frame = surface.last();
        assert_eq!((frame.width, frame.height), (800, 160));
        assert_eq!(frame.position, Some((1, 2)));
        assert!(frame.lines.join(" ").contains("Arrakis"));

        let frames = surface.frames.lock().len();
        book.resize(800, 160);
        assert_eq!(surface.frames.lock().len(), frames);
    }

    #[test]
    fn wrapping_respects_column_count() {
        let wrapped = html_to_lines(
            "<p>The spice must flow through every narrow column of text.</p>",
            MIN_COLUMNS * 2,
        );
        assert!(wrapped.len() > 1);
        assert!(wrapped.iter().all(|line| line.chars().count() <= MIN_COLUMNS * 2));
    }

    #[tokio::test]
    async fn open_rejects_non_epub_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.epub");
        std::fs::write(&path, b"plain text, not a zip container").unwrap();
        let url = Url::from_file_path(&path).unwrap();

        let mut instance = EpubEngine::new().create();
        assert!(instance.open(&url).await.is_err());
        assert!(instance.ready().await.is_err());
    }

    #[tokio::test]
    async fn open_rejects_remote_locations() {
        let url = Url::parse("https://example.com/dune.epub").unwrap();
        let mut instance = EpubEngine::new().create();
        let err = instance.open(&url).await.unwrap_err();
        assert!(err.to_string().contains("not a local file"));
    }

    #[test]
    fn render_requires_readiness() {
        let instance = EpubEngine::new().create();
        let surface: Arc<dyn Surface> = Arc::new(RecordingSurface::default());
        assert!(instance
            .render_to(surface, settings(Manager::Default, 2))
            .is_err());
    }
}
