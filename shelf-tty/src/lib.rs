use std::io::{self, Write};

use anyhow::Result;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyModifiers},
    style::{Attribute, Print, SetAttribute},
    terminal::{self, Clear, ClearType, SetTitle},
};
use parking_lot::Mutex;
use shelf_core::{HostShell, PageView, Surface, WindowSize, CELL_HEIGHT, CELL_WIDTH, CHROME_WIDTH};
use tracing::warn;
use url::Url;

const LEFT_MARGIN: u16 = (CHROME_WIDTH / CELL_WIDTH / 2) as u16;

pub fn window_size_for(columns: u16, rows: u16) -> WindowSize {
    WindowSize::new(
        u32::from(columns) * CELL_WIDTH,
        u32::from(rows) * CELL_HEIGHT,
    )
}

pub struct TerminalSurface<W: Write + Send> {
    writer: Mutex<W>,
    backdrop: Mutex<Option<String>>,
}

impl<W: Write + Send> TerminalSurface<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
            backdrop: Mutex::new(None),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    pub fn show_message(&self, message: &str) -> Result<()> {
        let mut writer = self.writer.lock();
        crossterm::queue!(
            writer,
            Clear(ClearType::All),
            cursor::MoveTo(LEFT_MARGIN, 0),
            Print(message)
        )?;
        writer.flush()?;
        Ok(())
    }
}

fn begin_sync_update<W: Write>(writer: &mut W) -> io::Result<()> {
    write!(writer, "\u{1b}[?2026h")
}

fn end_sync_update<W: Write>(writer: &mut W) -> io::Result<()> {
    write!(writer, "\u{1b}[?2026l")?;
    writer.flush()
}

impl<W: Write + Send> Surface for TerminalSurface<W> {
    fn present(&self, view: &PageView) -> Result<()> {
        let backdrop = self.backdrop.lock().clone();
        let mut writer = self.writer.lock();
        begin_sync_update(&mut *writer)?;
        crossterm::queue!(
            writer,
            Clear(ClearType::All),
            cursor::MoveTo(LEFT_MARGIN, 0),
            SetAttribute(Attribute::Bold),
            Print(&view.title),
            SetAttribute(Attribute::Reset)
        )?;
        if let Some(cover) = backdrop {
            crossterm::queue!(
                writer,
                SetAttribute(Attribute::Dim),
                Print(format!("  [{cover}]")),
                SetAttribute(Attribute::Reset)
            )?;
        }

        let columns = (view.width / CELL_WIDTH) as usize;
        let mut row: u16 = 1;
        for line in &view.lines {
            let clipped: String = line.chars().take(columns).collect();
            crossterm::queue!(writer, cursor::MoveTo(LEFT_MARGIN, row), Print(clipped))?;
            row = row.saturating_add(1);
        }

        if let Some((section, count)) = view.position {
            let footer_row = 1 + (view.height / CELL_HEIGHT) as u16;
            crossterm::queue!(
                writer,
                cursor::MoveTo(LEFT_MARGIN, footer_row),
                SetAttribute(Attribute::Dim),
                Print(format!("{}/{}", section + 1, count)),
                SetAttribute(Attribute::Reset)
            )?;
        }
        end_sync_update(&mut *writer)?;
        Ok(())
    }

    fn set_backdrop(&self, cover: Option<&Url>) {
        let label = cover.map(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back())
                .map(str::to_owned)
                .unwrap_or_else(|| url.to_string())
        });
        *self.backdrop.lock() = label;
    }
}

pub struct TerminalShell<W: Write + Send> {
    writer: Mutex<W>,
    fallback: WindowSize,
}

impl<W: Write + Send> TerminalShell<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
            fallback: window_size_for(80, 24),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> HostShell for TerminalShell<W> {
    fn window_size(&self) -> WindowSize {
        match terminal::size() {
            Ok((columns, rows)) => window_size_for(columns, rows),
            Err(err) => {
                warn!(?err, "terminal size unavailable");
                self.fallback
            }
        }
    }

    fn set_title(&self, title: &str) {
        let mut writer = self.writer.lock();
        if let Err(err) = crossterm::execute!(writer, SetTitle(title)) {
            warn!(?err, title, "failed to set window title");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Prev { count: usize },
    Next { count: usize },
    Resize(WindowSize),
    Quit,
    None,
}

/// Maps terminal events to reader actions. A numeric prefix repeats a
/// page turn (`3l` turns three pages).
#[derive(Debug, Default)]
pub struct EventMapper {
    pending_count: Option<usize>,
    pending_digits: String,
}

impl EventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_input(&self) -> Option<String> {
        if self.pending_digits.is_empty() {
            None
        } else {
            Some(self.pending_digits.clone())
        }
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(KeyEvent {
                code, modifiers, ..
            }) => match (code, modifiers) {
                (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                    if let Some(digit) = c.to_digit(10) {
                        self.push_digit(digit as usize);
                    }
                    UiEvent::None
                }
                (KeyCode::Char('c'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                    self.reset_count();
                    UiEvent::Quit
                }
                (KeyCode::Char('q'), _) | (KeyCode::Esc, _) => {
                    self.reset_count();
                    UiEvent::Quit
                }
                (KeyCode::Char('l'), KeyModifiers::NONE)
                | (KeyCode::Char('j'), KeyModifiers::NONE)
                | (KeyCode::Char(' '), KeyModifiers::NONE)
                | (KeyCode::Right, _)
                | (KeyCode::Down, _)
                | (KeyCode::PageDown, _) => UiEvent::Next {
                    count: self.take_count(),
                },
                (KeyCode::Char('h'), KeyModifiers::NONE)
                | (KeyCode::Char('k'), KeyModifiers::NONE)
                | (KeyCode::Left, _)
                | (KeyCode::Up, _)
                | (KeyCode::PageUp, _) => UiEvent::Prev {
                    count: self.take_count(),
                },
                _ => {
                    self.reset_count();
                    UiEvent::None
                }
            },
            Event::Resize(columns, rows) => UiEvent::Resize(window_size_for(columns, rows)),
            _ => UiEvent::None,
        }
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        self.pending_count = Some(current.saturating_mul(10).saturating_add(digit));
        self.pending_digits.push(char::from_digit(digit as u32, 10).unwrap_or('0'));
    }

    fn take_count(&mut self) -> usize {
        let count = self.pending_count.take().unwrap_or(1).max(1);
        self.pending_digits.clear();
        count
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }
}
