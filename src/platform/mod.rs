//! Native display abstraction: the seam between the event bridge and
//! a concrete window system connection.
//!
//! The world talks to the window system exclusively through
//! [`NativeDisplay`]. Events are plain `x11rb` protocol events, so the
//! translator is the same whether they came off a socket or out of the
//! headless queue.
//!
//! - [`x11::X11Display`]: `x11rb` `RustConnection` to a real server,
//!   with an XIM input method through the `xim` crate when one runs.
//! - [`headless::HeadlessDisplay`]: in-memory server used for headless
//!   runs and tests.

pub mod headless;
pub mod x11;
mod xim;

use std::sync::Arc;
use std::time::Duration;

pub use x11rb::protocol::Event as NativeEvent;
pub use x11rb::protocol::xproto::{Atom, Keysym, Window};

use crate::Result;
use crate::hints::FramebufferConfig;
use crate::timer::Alarm;

/// Geometry and visual of a window to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowParams {
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
    /// Depth and visual from the chosen framebuffer config.
    /// `None` copies the parent's.
    pub visual: Option<(u8, u32)>,
    /// Input-only helper window that never maps (the world's event window).
    pub hidden: bool,
}

impl WindowParams {
    /// A 1×1 unmapped helper window.
    pub fn hidden() -> Self {
        Self {
            x: 0,
            y: 0,
            width: 1,
            height: 1,
            visual: None,
            hidden: true,
        }
    }
}

/// A window property value as returned by `GetProperty`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub type_: Atom,
    pub format: u8,
    pub value: Vec<u8>,
}

impl Property {
    /// Interpret a format-32 property as a list of atoms.
    pub fn atoms(&self) -> Vec<Atom> {
        if self.format != 32 {
            return Vec::new();
        }
        self.value
            .chunks_exact(4)
            .map(|chunk| u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }
}

/// Encode 32-bit values in the native byte order used for format-32
/// property data.
pub fn encode_u32s(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

/// Output of an input method for one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImeUpdate {
    /// The composition in progress changed. An empty `text` ends it.
    /// `cursor` is a character offset into `text`.
    Preedit { text: String, cursor: Option<usize> },
    /// Finished text to insert.
    Commit(String),
}

/// One item read from the display.
#[derive(Debug, Clone)]
pub enum DisplayEvent {
    Native(NativeEvent),
    Ime { window: Window, update: ImeUpdate },
}

impl DisplayEvent {
    pub fn native(&self) -> Option<&NativeEvent> {
        match self {
            DisplayEvent::Native(event) => Some(event),
            DisplayEvent::Ime { .. } => None,
        }
    }
}

/// Cross-thread handle that wakes a blocked dispatch call.
pub trait WakeSignal: Send + Sync {
    fn wake(&self) -> Result<()>;
}

/// Operations the event bridge needs from a native window system.
///
/// All methods are called from the thread that owns the world. Request
/// methods may buffer; [`NativeDisplay::flush`] pushes them out.
pub trait NativeDisplay {
    /// Intern every name, in order. Called once at world creation.
    fn intern_atoms(&self, names: &[&str]) -> Result<Vec<Atom>>;

    /// Name of an atom, for clipboard targets the table does not know.
    fn atom_name(&self, atom: Atom) -> Result<String>;

    /// Framebuffer configurations windows can be created with.
    fn framebuffer_configs(&self) -> Vec<FramebufferConfig>;

    /// Refresh rates, current rate first. Empty if unknown.
    fn refresh_rates(&self) -> Vec<u32>;

    fn create_window(&self, params: &WindowParams) -> Result<Window>;
    fn destroy_window(&self, window: Window) -> Result<()>;
    fn map_window(&self, window: Window) -> Result<()>;
    fn unmap_window(&self, window: Window) -> Result<()>;

    fn change_property(
        &self,
        window: Window,
        property: Atom,
        type_: Atom,
        format: u8,
        data: &[u8],
    ) -> Result<()>;

    /// Read (and optionally delete) a property. `None` if unset.
    fn get_property(&self, window: Window, property: Atom, delete: bool)
    -> Result<Option<Property>>;

    fn set_selection_owner(&self, window: Window, selection: Atom) -> Result<()>;
    fn selection_owner(&self, selection: Atom) -> Result<Window>;
    fn convert_selection(
        &self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
    ) -> Result<()>;

    /// Answer a selection request. `property` is `NONE` to deny.
    fn send_selection_notify(
        &self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
    ) -> Result<()>;

    fn send_client_message(&self, window: Window, type_: Atom, data: [u32; 5]) -> Result<()>;

    /// Send a client message about `window` to the window manager
    /// (root window, substructure redirect).
    fn send_wm_message(&self, window: Window, type_: Atom, data: [u32; 5]) -> Result<()>;

    /// Create a recurring alarm firing every `interval`.
    /// Fails if the platform has no alarm support.
    fn create_alarm(&self, interval: Duration) -> Result<Alarm>;
    fn destroy_alarm(&self, alarm: Alarm) -> Result<()>;

    /// Keysym for a keycode in the unshifted or shifted column.
    fn keysym(&self, keycode: u8, shifted: bool) -> Keysym;

    /// Attach an input context to a view window. Key presses on it are
    /// then routed through the input method, if one is running; without
    /// one this does nothing and keys arrive unfiltered.
    fn create_input_context(&self, window: Window) -> Result<()>;
    fn destroy_input_context(&self, window: Window);

    /// Next already-available event, without blocking. Key presses the
    /// input method consumes come back as [`DisplayEvent::Ime`] updates.
    fn poll_event(&self) -> Result<Option<DisplayEvent>>;

    /// Block until an event may be available or `timeout` elapses.
    fn wait_for_event(&self, timeout: Option<Duration>) -> Result<()>;

    fn flush(&self) -> Result<()>;

    /// A thread-safe signal that sends a `type_` client message to `window`.
    fn wake_signal(&self, window: Window, type_: Atom) -> Arc<dyn WakeSignal>;
}

/// Window id of an event, for routing to a view.
pub fn event_window(event: &NativeEvent) -> Option<Window> {
    let window = match event {
        NativeEvent::KeyPress(e) | NativeEvent::KeyRelease(e) => e.event,
        NativeEvent::ButtonPress(e) | NativeEvent::ButtonRelease(e) => e.event,
        NativeEvent::MotionNotify(e) => e.event,
        NativeEvent::EnterNotify(e) | NativeEvent::LeaveNotify(e) => e.event,
        NativeEvent::FocusIn(e) | NativeEvent::FocusOut(e) => e.event,
        NativeEvent::Expose(e) => e.window,
        NativeEvent::ConfigureNotify(e) => e.window,
        NativeEvent::MapNotify(e) => e.window,
        NativeEvent::UnmapNotify(e) => e.window,
        NativeEvent::ClientMessage(e) => e.window,
        NativeEvent::SelectionClear(e) => e.owner,
        NativeEvent::SelectionRequest(e) => e.owner,
        NativeEvent::SelectionNotify(e) => e.requestor,
        NativeEvent::PropertyNotify(e) => e.window,
        _ => return None,
    };
    Some(window)
}
