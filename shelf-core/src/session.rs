use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc::UnboundedReceiver, watch};
use tracing::{debug, error, info, instrument, trace, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    CatalogError, ConfigResolver, ConfigService, HostShell, LayoutConfig, RenderingAdapter,
    RenderingEngine, Rendition, ResizeSubscription, SessionError, StorageService, Surface,
    ViewportGeometry, ViewportTracker, WindowSize,
};

pub const FALLBACK_TITLE: &str = "Shelf";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    ResolvingConfig,
    FetchingDocument,
    Opening,
    Ready,
    Failed(SessionError),
}

impl SessionState {
    pub fn is_settled(&self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Failed(_))
    }
}

/// Grants the acquisition routine to exactly one caller per session.
///
/// The flag flips at call time, so repeated synchronous calls made before any
/// asynchronous work has run still see it taken.
#[derive(Debug, Default)]
pub struct SessionGuard {
    acquired: AtomicBool,
}

impl SessionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> bool {
        !self.acquired.swap(true, Ordering::AcqRel)
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::Acquire)
    }
}

struct Live {
    state: SessionState,
    rendition: Option<Box<dyn Rendition>>,
    config: Option<LayoutConfig>,
    document_fetched: bool,
    torn_down: bool,
}

/// Mutable state of one session. The rendition is only ever stored together
/// with `Ready`, under the same lock.
struct SessionCell {
    id: Uuid,
    live: Mutex<Live>,
    states: Arc<watch::Sender<SessionState>>,
}

impl SessionCell {
    fn new(states: Arc<watch::Sender<SessionState>>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            live: Mutex::new(Live {
                state: SessionState::Idle,
                rendition: None,
                config: None,
                document_fetched: false,
                torn_down: false,
            }),
            states,
        })
    }

    fn publish(&self, live: &mut Live, next: SessionState) {
        live.state = next.clone();
        self.states.send_replace(next);
    }

    fn transition(&self, next: SessionState) -> bool {
        let mut live = self.live.lock();
        if live.torn_down {
            return false;
        }
        self.publish(&mut live, next);
        true
    }

    fn settle_config(&self, config: LayoutConfig) {
        let mut live = self.live.lock();
        if live.torn_down {
            return;
        }
        live.config = Some(config);
        if !live.document_fetched && live.state == SessionState::ResolvingConfig {
            self.publish(&mut live, SessionState::FetchingDocument);
        }
    }

    fn settle_document(&self) {
        self.live.lock().document_fetched = true;
    }

    fn fail(&self, err: SessionError) -> SessionState {
        error!(session = %self.id, %err, "reader session failed");
        let failed = SessionState::Failed(err);
        if self.transition(failed.clone()) {
            failed
        } else {
            SessionState::Idle
        }
    }

    fn commit(&self, rendition: Box<dyn Rendition>) -> bool {
        let mut live = self.live.lock();
        if live.torn_down {
            return false;
        }
        live.rendition = Some(rendition);
        self.publish(&mut live, SessionState::Ready);
        true
    }

    fn teardown(&self) -> Option<Box<dyn Rendition>> {
        let mut live = self.live.lock();
        live.torn_down = true;
        live.state = SessionState::Idle;
        live.config = None;
        live.rendition.take()
    }

    fn with_handle<R>(&self, f: impl FnOnce(&mut Box<dyn Rendition>) -> R) -> Option<R> {
        self.live.lock().rendition.as_mut().map(f)
    }
}

#[derive(Clone)]
pub struct NavigationBridge {
    cell: Arc<SessionCell>,
}

impl NavigationBridge {
    pub fn prev(&self) {
        self.forward("prev", |rendition| rendition.prev());
    }

    pub fn next(&self) {
        self.forward("next", |rendition| rendition.next());
    }

    fn forward(
        &self,
        direction: &'static str,
        turn: impl FnOnce(&mut Box<dyn Rendition>) -> anyhow::Result<()>,
    ) {
        match self.cell.with_handle(turn) {
            None => debug!(direction, "no rendered document, ignoring navigation"),
            // First/last page is the engine's own boundary.
            Some(Err(err)) => debug!(direction, ?err, "engine declined navigation"),
            Some(Ok(())) => trace!(direction, "page turned"),
        }
    }
}

#[derive(Clone)]
pub struct ResizeCoordinator {
    viewport: Arc<ViewportTracker>,
    cell: Arc<SessionCell>,
}

impl ResizeCoordinator {
    pub fn handle(&self, size: WindowSize) {
        let geometry = self.viewport.observe(size);
        self.apply(geometry);
    }

    pub fn apply(&self, geometry: ViewportGeometry) {
        let forwarded = self
            .cell
            .with_handle(|rendition| RenderingAdapter::resize(Some(rendition), geometry))
            .is_some();
        if !forwarded {
            trace!(
                width = geometry.width,
                height = geometry.height,
                "no rendition yet, geometry stored"
            );
        }
    }
}

#[derive(Clone)]
pub struct ControllerServices {
    pub config: Arc<dyn ConfigService>,
    pub storage: Arc<dyn StorageService>,
    pub engine: Arc<dyn RenderingEngine>,
    pub shell: Arc<dyn HostShell>,
}

struct ResolvedSource {
    content: Url,
    cover: Option<Url>,
}

pub struct Acquisition {
    identifier: String,
    cell: Arc<SessionCell>,
    services: ControllerServices,
    surface: Arc<dyn Surface>,
    viewport: Arc<ViewportTracker>,
}

impl Acquisition {
    #[instrument(skip(self), fields(session = %self.cell.id, identifier = %self.identifier))]
    pub async fn run(self) -> SessionState {
        if !self.cell.transition(SessionState::ResolvingConfig) {
            return SessionState::Idle;
        }

        let resolver = ConfigResolver::new(Arc::clone(&self.services.config));
        let config_step = async {
            let config = resolver.resolve().await;
            self.cell.settle_config(config);
            config
        };
        let fetch_step = async {
            let source = self.fetch_source().await;
            self.cell.settle_document();
            source
        };
        let (config, source) = tokio::join!(config_step, fetch_step);

        let source = match source {
            Ok(source) => source,
            Err(err) => return self.cell.fail(err),
        };
        if !self.cell.transition(SessionState::Opening) {
            debug!("session torn down before the document was opened");
            return SessionState::Idle;
        }

        let mut adapter = RenderingAdapter::new(Arc::clone(&self.services.engine));
        if let Err(err) = adapter.open(&source.content).await {
            return self.cell.fail(err);
        }
        if config.show_cover_background {
            self.surface.set_backdrop(source.cover.as_ref());
        }
        drop(source);

        let mut rendition = match adapter
            .render(Arc::clone(&self.surface), &config, &self.viewport)
            .await
        {
            Ok(rendition) => rendition,
            Err(err) => return self.cell.fail(err),
        };
        if let Err(err) = rendition.display() {
            return self.cell.fail(SessionError::Render(format!("{err:#}")));
        }

        if self.cell.commit(rendition) {
            info!("document ready");
            SessionState::Ready
        } else {
            debug!("session torn down while opening, rendition discarded");
            SessionState::Idle
        }
    }

    async fn fetch_source(&self) -> Result<ResolvedSource, SessionError> {
        let storage = &self.services.storage;
        let source = storage
            .fetch_document_source(&self.identifier)
            .await
            .map_err(|err| match err.downcast_ref::<CatalogError>() {
                Some(CatalogError::NotFound(_)) => {
                    SessionError::DocumentNotFound(self.identifier.clone())
                }
                _ => SessionError::DocumentFetch(format!("{err:#}")),
            })?;

        let content = storage
            .resolve_local_path(&source.content_location)
            .map_err(|err| SessionError::DocumentFetch(format!("{err:#}")))?;
        let cover = source
            .cover_location
            .as_deref()
            .and_then(|path| match storage.resolve_local_path(path) {
                Ok(url) => Some(url),
                Err(err) => {
                    warn!(?err, "cover location cannot be resolved");
                    None
                }
            });
        Ok(ResolvedSource { content, cover })
    }
}

struct Scope {
    identifier: String,
    guard: SessionGuard,
    cell: Arc<SessionCell>,
    resizes: Option<ResizeSubscription>,
}

impl Scope {
    fn new(identifier: String, states: &Arc<watch::Sender<SessionState>>) -> Self {
        Self {
            identifier,
            guard: SessionGuard::new(),
            cell: SessionCell::new(Arc::clone(states)),
            resizes: None,
        }
    }
}

pub struct ReaderController {
    services: ControllerServices,
    surface: Arc<dyn Surface>,
    viewport: Arc<ViewportTracker>,
    states: Arc<watch::Sender<SessionState>>,
    scope: Mutex<Scope>,
}

impl ReaderController {
    pub fn new(
        identifier: impl Into<String>,
        services: ControllerServices,
        surface: Arc<dyn Surface>,
    ) -> Self {
        let viewport = Arc::new(ViewportTracker::new(services.shell.window_size()));
        let (states, _) = watch::channel(SessionState::Idle);
        let states = Arc::new(states);
        let scope = Scope::new(identifier.into(), &states);
        Self {
            services,
            surface,
            viewport,
            states,
            scope: Mutex::new(scope),
        }
    }

    pub fn identifier(&self) -> String {
        self.scope.lock().identifier.clone()
    }

    pub fn state(&self) -> SessionState {
        self.states.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.states.subscribe()
    }

    pub fn layout(&self) -> Option<LayoutConfig> {
        let cell = Arc::clone(&self.scope.lock().cell);
        let config = cell.live.lock().config;
        config
    }

    pub fn viewport(&self) -> ViewportGeometry {
        self.viewport.current()
    }

    pub fn start(&self) -> Option<Acquisition> {
        let scope = self.scope.lock();
        if !scope.guard.try_acquire() {
            debug!(identifier = %scope.identifier, "session already started");
            return None;
        }
        info!(
            session = %scope.cell.id,
            identifier = %scope.identifier,
            "starting reader session"
        );
        self.services.shell.set_title(&scope.identifier);
        Some(Acquisition {
            identifier: scope.identifier.clone(),
            cell: Arc::clone(&scope.cell),
            services: self.services.clone(),
            surface: Arc::clone(&self.surface),
            viewport: Arc::clone(&self.viewport),
        })
    }

    pub fn mount(&self) -> bool {
        match self.start() {
            Some(acquisition) => {
                tokio::spawn(acquisition.run());
                true
            }
            None => false,
        }
    }

    pub fn attach_resizes(&self, events: UnboundedReceiver<WindowSize>) {
        let coordinator = self.resize_coordinator();
        let subscription = self
            .viewport
            .on_change(events, move |geometry| coordinator.apply(geometry));
        self.scope.lock().resizes = Some(subscription);
    }

    pub fn on_resize(&self, size: WindowSize) {
        self.resize_coordinator().handle(size);
    }

    pub fn resize_coordinator(&self) -> ResizeCoordinator {
        ResizeCoordinator {
            viewport: Arc::clone(&self.viewport),
            cell: Arc::clone(&self.scope.lock().cell),
        }
    }

    pub fn navigation(&self) -> NavigationBridge {
        NavigationBridge {
            cell: Arc::clone(&self.scope.lock().cell),
        }
    }

    pub fn prev(&self) {
        self.navigation().prev();
    }

    pub fn next(&self) {
        self.navigation().next();
    }

    pub fn unmount(&self) {
        let mut scope = self.scope.lock();
        let identifier = scope.identifier.clone();
        self.teardown(&mut scope, identifier);
    }

    pub fn retarget(&self, identifier: impl Into<String>) {
        let identifier = identifier.into();
        let mut scope = self.scope.lock();
        if scope.identifier == identifier {
            return;
        }
        self.teardown(&mut scope, identifier);
    }

    fn teardown(&self, scope: &mut Scope, next_identifier: String) {
        scope.resizes = None;
        if scope.cell.teardown().is_some() {
            debug!(session = %scope.cell.id, "rendition released");
        }
        info!(session = %scope.cell.id, identifier = %scope.identifier, "reader session closed");
        self.services.shell.set_title(FALLBACK_TITLE);
        *scope = Scope::new(next_identifier, &self.states);
        self.states.send_replace(SessionState::Idle);
    }
}

impl Drop for ReaderController {
    fn drop(&mut self) {
        self.scope.get_mut().cell.teardown();
    }
}
