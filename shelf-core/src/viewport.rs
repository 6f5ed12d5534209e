use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::trace;

/// Horizontal space taken by the navigation rail and page margins.
pub const CHROME_WIDTH: u32 = 160;
pub const CHROME_HEIGHT: u32 = 40;
pub const MAX_CONTENT_WIDTH: u32 = 800;

pub const CELL_WIDTH: u32 = 8;
pub const CELL_HEIGHT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSize {
    pub width: u32,
    pub height: u32,
}

impl WindowSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewportGeometry {
    pub width: u32,
    pub height: u32,
}

impl ViewportGeometry {
    pub fn from_window(size: WindowSize) -> Self {
        Self {
            width: size.width.saturating_sub(CHROME_WIDTH).min(MAX_CONTENT_WIDTH),
            height: size.height.saturating_sub(CHROME_HEIGHT),
        }
    }
}

#[derive(Debug)]
pub struct ViewportTracker {
    latest: Mutex<ViewportGeometry>,
}

impl ViewportTracker {
    pub fn new(initial: WindowSize) -> Self {
        Self {
            latest: Mutex::new(ViewportGeometry::from_window(initial)),
        }
    }

    pub fn current(&self) -> ViewportGeometry {
        *self.latest.lock()
    }

    pub fn observe(&self, size: WindowSize) -> ViewportGeometry {
        let geometry = ViewportGeometry::from_window(size);
        *self.latest.lock() = geometry;
        trace!(width = geometry.width, height = geometry.height, "viewport updated");
        geometry
    }

    pub fn on_change<F>(
        self: &Arc<Self>,
        mut events: UnboundedReceiver<WindowSize>,
        callback: F,
    ) -> ResizeSubscription
    where
        F: Fn(ViewportGeometry) + Send + 'static,
    {
        let tracker = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(size) = events.recv().await {
                let geometry = tracker.observe(size);
                callback(geometry);
            }
        });
        ResizeSubscription { task }
    }
}

#[derive(Debug)]
pub struct ResizeSubscription {
    task: JoinHandle<()>,
}

impl ResizeSubscription {
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for ResizeSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn geometry_subtracts_chrome_and_caps_width() {
        let wide = ViewportGeometry::from_window(WindowSize::new(1200, 800));
        assert_eq!(wide, ViewportGeometry { width: 800, height: 760 });

        let narrow = ViewportGeometry::from_window(WindowSize::new(700, 500));
        assert_eq!(narrow, ViewportGeometry { width: 540, height: 460 });
    }

    #[test]
    fn geometry_saturates_on_tiny_windows() {
        let tiny = ViewportGeometry::from_window(WindowSize::new(100, 20));
        assert_eq!(tiny, ViewportGeometry { width: 0, height: 0 });
    }

    #[test]
    fn tracker_keeps_latest_observation() {
        let tracker = ViewportTracker::new(WindowSize::new(1200, 800));
        tracker.observe(WindowSize::new(900, 600));
        tracker.observe(WindowSize::new(1000, 700));
        assert_eq!(tracker.current(), ViewportGeometry { width: 800, height: 660 });
    }

    #[tokio::test]
    async fn on_change_fires_for_every_event() {
        let tracker = Arc::new(ViewportTracker::new(WindowSize::new(1200, 800)));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();

        let sink = Arc::clone(&seen);
        let subscription = tracker.on_change(rx, move |geometry| sink.lock().push(geometry));

        tx.send(WindowSize::new(900, 600)).unwrap();
        tx.send(WindowSize::new(600, 300)).unwrap();
        drop(tx);
        while subscription.is_active() {
            tokio::task::yield_now().await;
        }

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], ViewportGeometry { width: 440, height: 260 });
        assert_eq!(tracker.current(), seen[1]);
    }
}
