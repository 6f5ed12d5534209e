use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use crossterm::cursor;
use crossterm::event::{self, Event};
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use shelf_core::{
    ControllerServices, FileConfigStore, JsonCatalog, ReaderController, SessionState,
    BOOK_LOCATION, CATALOG_FILE_NAME, DEFAULT_SETTINGS,
};
use shelf_render::{EpubEngine, LibraryScanner};
use shelf_tty::{EventMapper, TerminalShell, TerminalSurface, UiEvent};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "shelf", version, about = "terminal EPUB reader")]
struct Args {
    /// Directory holding shelf_settings.conf
    #[arg(long = "config-dir", global = true)]
    config_dir: Option<PathBuf>,

    /// Path to the book catalog (book_cache.json)
    #[arg(long = "catalog", global = true)]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Open a book from the catalog by its exact title
    Read { title: String },
    /// List the titles in the catalog
    List,
    /// Rebuild the catalog from a folder of EPUB files
    Scan { dir: Option<PathBuf> },
    /// Inspect or change reader settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    Get { key: String },
    Set { key: String, value: String },
    List,
    Reset,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, Clear(ClearType::All), cursor::MoveTo(0, 0), cursor::Show);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "shelf", "shelf")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let interactive = matches!(args.command, Command::Read { .. });
    let _log_guard = init_logging(&project_dirs, !interactive)?;

    let config_dir = args
        .config_dir
        .clone()
        .unwrap_or_else(|| project_dirs.config_dir().to_path_buf());
    let store = Arc::new(FileConfigStore::open(&config_dir)?);
    let cache_dir = project_dirs.cache_dir().to_path_buf();
    let catalog = JsonCatalog::new(resolve_catalog_path(args.catalog.clone(), &cache_dir));

    match args.command {
        Command::Read { title } => {
            refresh_if_stale(&store, &catalog, &cache_dir).await;
            read(title, store, catalog).await
        }
        Command::List => {
            refresh_if_stale(&store, &catalog, &cache_dir).await;
            list(&catalog)
        }
        Command::Scan { dir } => {
            let book_dir = match dir.or_else(|| book_location(&store)) {
                Some(dir) => dir,
                None => bail!("no book folder given; pass one or run `shelf config set {BOOK_LOCATION} <dir>`"),
            };
            let entries = rescan(LibraryScanner::new(book_dir, &cache_dir), catalog).await?;
            println!("indexed {entries} books");
            Ok(())
        }
        Command::Config { action } => configure(&store, action),
    }
}

fn resolve_catalog_path(explicit: Option<PathBuf>, cache_dir: &Path) -> PathBuf {
    explicit.unwrap_or_else(|| cache_dir.join(CATALOG_FILE_NAME))
}

fn book_location(store: &FileConfigStore) -> Option<PathBuf> {
    store
        .get(BOOK_LOCATION)
        .map(|location| location.trim().to_string())
        .filter(|location| !location.is_empty())
        .map(PathBuf::from)
}

async fn rescan(scanner: LibraryScanner, catalog: JsonCatalog) -> Result<usize> {
    tokio::task::spawn_blocking(move || scanner.refresh(&catalog).map(|entries| entries.len()))
        .await
        .context("library scan task failed")?
}

// A failed refresh leaves the existing catalog in place.
async fn refresh_if_stale(store: &FileConfigStore, catalog: &JsonCatalog, cache_dir: &Path) {
    let Some(book_dir) = book_location(store) else {
        return;
    };
    let scanner = LibraryScanner::new(book_dir, cache_dir);
    match scanner.is_stale(catalog) {
        Ok(true) => {}
        Ok(false) => return,
        Err(err) => {
            warn!("cannot check book folder: {err:#}");
            return;
        }
    }
    info!(book_dir = ?scanner.book_dir(), "catalog out of date, rescanning");
    if let Err(err) = rescan(scanner, JsonCatalog::new(catalog.path().to_path_buf())).await {
        warn!("library scan failed: {err:#}");
    }
}

fn list(catalog: &JsonCatalog) -> Result<()> {
    let entries = catalog
        .entries()
        .with_context(|| format!("failed to load catalog {:?}", catalog.path()))?;
    for entry in entries {
        println!("{}", entry.title);
    }
    Ok(())
}

fn configure(store: &FileConfigStore, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Get { key } => match store.get(&key) {
            Some(value) => println!("{value}"),
            None => bail!("unknown setting {key:?}"),
        },
        ConfigAction::Set { key, value } => {
            if !DEFAULT_SETTINGS.iter().any(|(known, _)| *known == key) {
                warn!(key = %key, "storing unrecognised setting");
            }
            store.set_option(&key, &value)?;
            info!(key = %key, path = ?store.path(), "setting updated");
        }
        ConfigAction::List => {
            for (key, value) in store.values() {
                println!("{key}={value}");
            }
        }
        ConfigAction::Reset => {
            store.reset()?;
            info!(path = ?store.path(), "settings restored to defaults");
        }
    }
    Ok(())
}

async fn read(title: String, store: Arc<FileConfigStore>, catalog: JsonCatalog) -> Result<()> {
    let _raw = RawModeGuard::new()?;
    crossterm::execute!(io::stdout(), cursor::Hide)?;

    let surface = Arc::new(TerminalSurface::new(io::stdout()));
    let services = ControllerServices {
        config: store,
        storage: Arc::new(catalog),
        engine: Arc::new(EpubEngine::new()),
        shell: Arc::new(TerminalShell::new(io::stdout())),
    };
    let controller = ReaderController::new(title.clone(), services, surface.clone());

    let (resize_tx, resize_rx) = mpsc::unbounded_channel();
    controller.attach_resizes(resize_rx);
    let mut states = controller.subscribe();
    controller.mount();

    let (event_tx, mut events) = mpsc::unbounded_channel();
    spawn_event_reader(event_tx);
    let mut mapper = EventMapper::new();

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                match state {
                    SessionState::Failed(err) => {
                        surface.show_message(&format!("{err} (press q to quit)"))?;
                    }
                    SessionState::FetchingDocument | SessionState::Opening => {
                        surface.show_message(&format!("Opening {title}..."))?;
                    }
                    _ => {}
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                match mapper.map_event(event) {
                    UiEvent::Next { count } => (0..count).for_each(|_| controller.next()),
                    UiEvent::Prev { count } => (0..count).for_each(|_| controller.prev()),
                    UiEvent::Resize(size) => {
                        if resize_tx.send(size).is_err() {
                            warn!("resize subscription closed");
                        }
                    }
                    UiEvent::Quit => break,
                    UiEvent::None => {}
                }
            }
        }
    }

    controller.unmount();
    Ok(())
}

fn spawn_event_reader(events: mpsc::UnboundedSender<Event>) {
    thread::spawn(move || loop {
        match event::poll(Duration::from_millis(100)) {
            Ok(true) => match event::read() {
                Ok(event) => {
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(?err, "failed to read terminal event");
                    break;
                }
            },
            Ok(false) => {
                if events.is_closed() {
                    break;
                }
            }
            Err(err) => {
                warn!(?err, "failed to poll terminal events");
                break;
            }
        }
    });
}

fn init_logging(project_dirs: &ProjectDirs, console: bool) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "shelf.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    // The reader owns the screen, so it only logs to the file.
    let console_layer = console.then(|| tracing_subscriber::fmt::layer().with_writer(io::stderr));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_read_with_global_overrides() {
        let args = Args::try_parse_from([
            "shelf",
            "read",
            "Dune",
            "--catalog",
            "/books/book_cache.json",
        ])
        .unwrap();
        assert!(matches!(args.command, Command::Read { ref title } if title == "Dune"));
        assert_eq!(args.catalog, Some(PathBuf::from("/books/book_cache.json")));
    }

    #[test]
    fn parses_config_set() {
        let args =
            Args::try_parse_from(["shelf", "--config-dir", "/tmp/x", "config", "set", "endless_scroll", "true"])
                .unwrap();
        assert_eq!(args.config_dir, Some(PathBuf::from("/tmp/x")));
        match args.command {
            Command::Config {
                action: ConfigAction::Set { key, value },
            } => {
                assert_eq!(key, "endless_scroll");
                assert_eq!(value, "true");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn catalog_lives_in_cache_dir_unless_overridden() {
        let cache_dir = PathBuf::from("/home/reader/.cache/shelf");
        assert_eq!(
            resolve_catalog_path(None, &cache_dir),
            cache_dir.join(CATALOG_FILE_NAME)
        );

        let explicit = PathBuf::from("/elsewhere/catalog.json");
        assert_eq!(resolve_catalog_path(Some(explicit.clone()), &cache_dir), explicit);
    }

    #[test]
    fn book_location_is_the_epub_folder() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::open(dir.path()).unwrap();
        assert_eq!(book_location(&store), None);

        store.set_option(BOOK_LOCATION, " /srv/books ").unwrap();
        assert_eq!(book_location(&store), Some(PathBuf::from("/srv/books")));
    }

    #[test]
    fn parses_scan_with_optional_folder() {
        let args = Args::try_parse_from(["shelf", "scan", "/srv/books"]).unwrap();
        assert!(matches!(args.command, Command::Scan { dir: Some(ref dir) } if dir == Path::new("/srv/books")));

        let args = Args::try_parse_from(["shelf", "scan"]).unwrap();
        assert!(matches!(args.command, Command::Scan { dir: None }));
    }

    #[tokio::test]
    async fn stale_catalog_is_rebuilt_from_book_location() {
        let dir = tempfile::tempdir().unwrap();
        let books = dir.path().join("books");
        fs::create_dir(&books).unwrap();
        fs::write(books.join("broken.epub"), b"not an epub").unwrap();
        let store = FileConfigStore::open(dir.path()).unwrap();
        let catalog = JsonCatalog::new(dir.path().join("cache").join(CATALOG_FILE_NAME));

        refresh_if_stale(&store, &catalog, dir.path()).await;
        assert!(!catalog.path().exists());

        store.set_option(BOOK_LOCATION, "/no/such/folder").unwrap();
        refresh_if_stale(&store, &catalog, dir.path()).await;
        assert!(!catalog.path().exists());

        store.set_option(BOOK_LOCATION, books.to_str().unwrap()).unwrap();
        refresh_if_stale(&store, &catalog, dir.path()).await;
        assert!(catalog.entries().unwrap().is_empty());
    }
}
