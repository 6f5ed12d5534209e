use std::sync::Arc;

use tracing::{debug, info, instrument};
use url::Url;

use crate::{
    EngineInstance, Flow, LayoutConfig, LayoutMode, Manager, RenderSettings, RenderingEngine,
    Rendition, SessionError, Spread, Surface, ViewportGeometry, ViewportTracker,
};

pub fn apply_layout(config: &LayoutConfig, geometry: ViewportGeometry) -> RenderSettings {
    match config.mode {
        LayoutMode::Paginated => RenderSettings {
            manager: Manager::Default,
            flow: None,
            spread: Some(Spread::Disabled),
            width: geometry.width,
            height: geometry.height,
        },
        LayoutMode::Continuous => RenderSettings {
            manager: Manager::Continuous,
            flow: Some(Flow::Scrolled),
            spread: None,
            width: geometry.width,
            height: geometry.height,
        },
    }
}

pub struct RenderingAdapter {
    engine: Arc<dyn RenderingEngine>,
    instance: Option<Box<dyn EngineInstance>>,
}

impl RenderingAdapter {
    pub fn new(engine: Arc<dyn RenderingEngine>) -> Self {
        Self {
            engine,
            instance: None,
        }
    }

    #[instrument(skip_all, fields(location = %location))]
    pub async fn open(&mut self, location: &Url) -> Result<(), SessionError> {
        let mut instance = self.engine.create();
        instance
            .open(location)
            .await
            .map_err(|err| SessionError::EngineOpen(format!("{err:#}")))?;
        self.instance = Some(instance);
        debug!("document opened");
        Ok(())
    }

    #[instrument(skip_all)]
    pub async fn render(
        &mut self,
        surface: Arc<dyn Surface>,
        config: &LayoutConfig,
        viewport: &ViewportTracker,
    ) -> Result<Box<dyn Rendition>, SessionError> {
        let mut instance = self
            .instance
            .take()
            .ok_or_else(|| SessionError::Render("no document has been opened".into()))?;
        instance
            .ready()
            .await
            .map_err(|err| SessionError::EngineReady(format!("{err:#}")))?;

        let settings = apply_layout(config, viewport.current());
        info!(
            manager = settings.manager.as_str(),
            width = settings.width,
            height = settings.height,
            "rendering document"
        );
        instance
            .render_to(surface, settings)
            .map_err(|err| SessionError::Render(format!("{err:#}")))
    }

    pub fn resize(handle: Option<&mut Box<dyn Rendition>>, geometry: ViewportGeometry) {
        if let Some(rendition) = handle {
            rendition.resize(geometry.width, geometry.height);
        }
    }
}
