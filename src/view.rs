//! Per-view state owned by the world.

use std::fmt;

use crate::clipboard::Clipboard;
use crate::event::{Event, Rect, ViewState};
use crate::hints::{FramebufferConfig, HintTable, SizeHints};
use crate::platform::Window;
use crate::surface::{NullSurface, Surface};
use crate::world::World;

/// Handle to a view inside a [`World`].
///
/// Ids are never reused within a world, so a stale handle simply stops
/// resolving once its view is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(u64);

impl ViewId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view#{}", self.0)
    }
}

/// Receives the events of one view.
///
/// The sink gets the world back so it can call any operation on it,
/// including ones on its own view. Calling [`World::update`] from here
/// returns [`crate::Error::Busy`].
pub trait EventSink {
    fn on_event(&mut self, world: &mut World, view: ViewId, event: &Event);
}

impl<F> EventSink for F
where
    F: FnMut(&mut World, ViewId, &Event),
{
    fn on_event(&mut self, world: &mut World, view: ViewId, event: &Event) {
        self(world, view, event)
    }
}

pub(crate) struct View {
    pub(crate) hints: HintTable,
    pub(crate) sizes: SizeHints,
    pub(crate) title: String,
    /// `None` while the sink is running (or if none was set).
    pub(crate) sink: Option<Box<dyn EventSink>>,
    pub(crate) surface: Box<dyn Surface>,
    pub(crate) window: Option<Window>,
    pub(crate) config: Option<FramebufferConfig>,
    pub(crate) frame: Rect,
    pub(crate) pending_configure: Option<Rect>,
    pub(crate) pending_expose: Option<Rect>,
    pub(crate) clipboard: Clipboard,
    pub(crate) visible: bool,
    /// Last window manager state delivered.
    pub(crate) state: ViewState,
}

impl View {
    pub(crate) fn new(sink: Box<dyn EventSink>) -> Self {
        Self {
            hints: HintTable::new(),
            sizes: SizeHints::default(),
            title: String::new(),
            sink: Some(sink),
            surface: Box::new(NullSurface),
            window: None,
            config: None,
            frame: Rect::default(),
            pending_configure: None,
            pending_expose: None,
            clipboard: Clipboard::new(),
            visible: false,
            state: ViewState::empty(),
        }
    }

    pub(crate) fn is_realized(&self) -> bool {
        self.window.is_some()
    }

    /// Latest configure wins.
    pub(crate) fn queue_configure(&mut self, frame: Rect) {
        self.pending_configure = Some(frame);
    }

    /// Exposes accumulate into one covering rectangle.
    pub(crate) fn queue_expose(&mut self, area: Rect) {
        self.pending_expose = Some(match self.pending_expose {
            Some(pending) => pending.union(&area),
            None => area,
        });
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("title", &self.title)
            .field("window", &self.window)
            .field("frame", &self.frame)
            .field("pending_configure", &self.pending_configure)
            .field("pending_expose", &self.pending_expose)
            .field("visible", &self.visible)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
