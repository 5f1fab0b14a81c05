//! Unified event model delivered to view event sinks.
//!
//! Every native event the dispatch loop understands is translated into
//! one of these variants. Coordinates are in window-relative pixels.

use bitflags::bitflags;
use x11rb::protocol::xproto::KeyButMask;

use crate::keys::Key;

bitflags! {
    /// Keyboard modifier state at the time of an input event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Modifiers: u16 {
        const SHIFT = 1 << 0;
        const CAPS_LOCK = 1 << 1;
        const CTRL = 1 << 2;
        const ALT = 1 << 3;
        const NUM_LOCK = 1 << 4;
        const SUPER = 1 << 6;
    }
}

bitflags! {
    /// Window manager state of a view, from `_NET_WM_STATE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ViewState: u8 {
        /// Minimized (iconified) or otherwise not visible on screen.
        const HIDDEN = 1 << 0;
        /// Urgent; the window manager is highlighting the view.
        const DEMANDS_ATTENTION = 1 << 1;
    }
}

impl Modifiers {
    /// Convert an X11 `KeyButMask` state value.
    ///
    /// Mod1 is Alt, Mod2 NumLock and Mod4 Super on every common keymap.
    pub fn from_x11_state(state: u16) -> Self {
        const MAPPING: [(KeyButMask, Modifiers); 6] = [
            (KeyButMask::SHIFT, Modifiers::SHIFT),
            (KeyButMask::LOCK, Modifiers::CAPS_LOCK),
            (KeyButMask::CONTROL, Modifiers::CTRL),
            (KeyButMask::MOD1, Modifiers::ALT),
            (KeyButMask::MOD2, Modifiers::NUM_LOCK),
            (KeyButMask::MOD4, Modifiers::SUPER),
        ];
        MAPPING
            .iter()
            .filter(|(mask, _)| state & u16::from(*mask) != 0)
            .fold(Modifiers::empty(), |mods, (_, m)| mods | *m)
    }
}

/// An axis-aligned rectangle in window coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Smallest rectangle covering both `self` and `other`.
    pub fn union(&self, other: &Rect) -> Rect {
        let left = self.x.min(other.x);
        let top = self.y.min(other.y);
        let right = (self.x + self.width as i32).max(other.x + other.width as i32);
        let bottom = (self.y + self.height as i32).max(other.y + other.height as i32);
        Rect {
            x: left,
            y: top,
            width: (right - left) as u32,
            height: (bottom - top) as u32,
        }
    }
}

/// A unified view event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The view was realized and its surface created.
    Realize,
    /// The view is being unrealized; its surface is about to be destroyed.
    Unrealize,
    /// Position or size changed. Coalesced: only the final state of a
    /// burst is delivered.
    Configure { frame: Rect },
    /// A region needs redrawing. Coalesced into the union of the burst.
    Expose { area: Rect },
    /// The window was mapped.
    Map,
    /// The window was unmapped.
    Unmap,
    /// The window manager asked the view to close.
    Close,
    FocusIn,
    FocusOut,
    PointerIn { x: f64, y: f64 },
    PointerOut { x: f64, y: f64 },
    Motion { x: f64, y: f64, modifiers: Modifiers },
    /// Buttons are 1 left, 2 middle, 3 right, 4 back, 5 forward.
    Button {
        pressed: bool,
        button: u8,
        x: f64,
        y: f64,
        modifiers: Modifiers,
    },
    Scroll {
        dx: f64,
        dy: f64,
        x: f64,
        y: f64,
        modifiers: Modifiers,
    },
    Key {
        pressed: bool,
        keycode: u8,
        key: Key,
        modifiers: Modifiers,
        repeat: bool,
    },
    /// Text produced by a key press, from the keysym. Keys consumed by
    /// an input method produce [`Event::ImeCommit`] instead.
    Text { character: char },
    /// The input method's composition in progress changed. An empty
    /// `text` ends the composition. `cursor` counts characters.
    ImePreedit { text: String, cursor: Option<usize> },
    /// The input method finished composing `text`.
    ImeCommit { text: String },
    /// The window manager changed the view's state.
    StateChanged { state: ViewState },
    /// A timer started with `World::start_timer` fired.
    Timer { id: usize },
    /// A client message posted with `World::post_client_event`.
    Client { data1: u32, data2: u32 },
    /// Clipboard contents requested with `World::request_clipboard`.
    ClipboardData { mime: String, data: Vec<u8> },
    /// A clipboard request could not be completed.
    ClipboardFailed,
    /// Another client took the selection this view was offering.
    ClipboardLost,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_of_disjoint_rects() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(20, 5, 10, 10);
        assert_eq!(a.union(&b), Rect::new(0, 0, 30, 15));
    }

    #[test]
    fn union_with_contained_rect() {
        let outer = Rect::new(0, 0, 100, 100);
        let inner = Rect::new(10, 10, 5, 5);
        assert_eq!(outer.union(&inner), outer);
        assert_eq!(inner.union(&outer), outer);
    }

    #[test]
    fn modifiers_follow_keybutmask_bits() {
        let state = u16::from(KeyButMask::LOCK | KeyButMask::MOD1 | KeyButMask::MOD2);
        assert_eq!(
            Modifiers::from_x11_state(state),
            Modifiers::CAPS_LOCK | Modifiers::ALT | Modifiers::NUM_LOCK
        );
        // Mod3, Mod5 and button bits carry no modifier.
        let ignored = KeyButMask::MOD3 | KeyButMask::MOD5 | KeyButMask::BUTTON1;
        assert!(Modifiers::from_x11_state(u16::from(ignored)).is_empty());
    }

    #[test]
    fn modifiers_from_state() {
        let mods = Modifiers::from_x11_state(0x0001 | 0x0004 | 0x0040);
        assert_eq!(mods, Modifiers::SHIFT | Modifiers::CTRL | Modifiers::SUPER);
        assert!(Modifiers::from_x11_state(0).is_empty());
    }
}
