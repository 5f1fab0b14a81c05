//! Native event translation.
//!
//! Turns one `x11rb` event into what the world should do with it. Most
//! events become an [`Event`] right away; configure and expose go to the
//! coalescing slots, keys need the keymap and a look at the next queued
//! event, and selection traffic belongs to the clipboard negotiator.
//! Window manager state changes only say the property changed; the world
//! reads it back.

use x11rb::protocol::xproto::{
    ButtonPressEvent, KeyPressEvent, NotifyDetail, SelectionClearEvent, SelectionNotifyEvent,
    SelectionRequestEvent,
};

use crate::atoms::Atoms;
use crate::event::{Event, Modifiers, Rect, ViewState};
use crate::keys::{key_from_keysym, keysym_to_char};
use crate::platform::{Atom, ImeUpdate, NativeDisplay, NativeEvent};
use crate::timer::Alarm;

/// What to do with one native event.
#[derive(Debug)]
pub(crate) enum Translated {
    Deliver(Event),
    Configure(Rect),
    Expose(Rect),
    Key { event: KeyPressEvent, pressed: bool },
    Alarm(Alarm),
    SelectionRequest(SelectionRequestEvent),
    SelectionClear(SelectionClearEvent),
    SelectionNotify(SelectionNotifyEvent),
    /// `_NET_WM_STATE` changed.
    WmState,
    Ignore,
}

pub(crate) fn translate(atoms: &Atoms, event: &NativeEvent) -> Translated {
    match event {
        NativeEvent::KeyPress(e) => Translated::Key {
            event: *e,
            pressed: true,
        },
        NativeEvent::KeyRelease(e) => Translated::Key {
            event: *e,
            pressed: false,
        },
        NativeEvent::ButtonPress(e) => button(e, true),
        NativeEvent::ButtonRelease(e) => button(e, false),
        NativeEvent::MotionNotify(e) => Translated::Deliver(Event::Motion {
            x: e.event_x.into(),
            y: e.event_y.into(),
            modifiers: Modifiers::from_x11_state(e.state.into()),
        }),
        NativeEvent::EnterNotify(e) => Translated::Deliver(Event::PointerIn {
            x: e.event_x.into(),
            y: e.event_y.into(),
        }),
        NativeEvent::LeaveNotify(e) => Translated::Deliver(Event::PointerOut {
            x: e.event_x.into(),
            y: e.event_y.into(),
        }),
        // Focus moving between the pointer's windows is not a keyboard focus change.
        NativeEvent::FocusIn(e) if e.detail != NotifyDetail::POINTER => {
            Translated::Deliver(Event::FocusIn)
        }
        NativeEvent::FocusOut(e) if e.detail != NotifyDetail::POINTER => {
            Translated::Deliver(Event::FocusOut)
        }
        NativeEvent::ConfigureNotify(e) => Translated::Configure(Rect::new(
            e.x.into(),
            e.y.into(),
            e.width.into(),
            e.height.into(),
        )),
        NativeEvent::Expose(e) => Translated::Expose(Rect::new(
            e.x.into(),
            e.y.into(),
            e.width.into(),
            e.height.into(),
        )),
        NativeEvent::MapNotify(_) => Translated::Deliver(Event::Map),
        NativeEvent::UnmapNotify(_) => Translated::Deliver(Event::Unmap),
        NativeEvent::ClientMessage(e) if e.format == 32 => {
            let data = e.data.as_data32();
            if e.type_ == atoms.wm_protocols && data[0] == atoms.wm_delete_window {
                Translated::Deliver(Event::Close)
            } else if e.type_ == atoms.client_msg {
                Translated::Deliver(Event::Client {
                    data1: data[0],
                    data2: data[1],
                })
            } else {
                Translated::Ignore
            }
        }
        NativeEvent::SyncAlarmNotify(e) => Translated::Alarm(e.alarm),
        NativeEvent::SelectionRequest(e) => Translated::SelectionRequest(*e),
        NativeEvent::SelectionClear(e) => Translated::SelectionClear(*e),
        NativeEvent::SelectionNotify(e) => Translated::SelectionNotify(*e),
        NativeEvent::PropertyNotify(e) if e.atom == atoms.net_wm_state => Translated::WmState,
        _ => Translated::Ignore,
    }
}

fn button(e: &ButtonPressEvent, pressed: bool) -> Translated {
    let x = f64::from(e.event_x);
    let y = f64::from(e.event_y);
    let modifiers = Modifiers::from_x11_state(e.state.into());

    let (dx, dy) = match e.detail {
        4 => (0.0, 1.0),
        5 => (0.0, -1.0),
        6 => (-1.0, 0.0),
        7 => (1.0, 0.0),
        // Back/forward sit above the wheel buttons on the wire.
        detail => {
            let button = if detail > 7 { detail - 4 } else { detail };
            return Translated::Deliver(Event::Button {
                pressed,
                button,
                x,
                y,
                modifiers,
            });
        }
    };

    // Each wheel click is a press/release pair; the release carries nothing.
    if !pressed {
        return Translated::Ignore;
    }
    Translated::Deliver(Event::Scroll {
        dx,
        dy,
        x,
        y,
        modifiers,
    })
}

/// View state flags present in a `_NET_WM_STATE` atom list.
pub(crate) fn view_state(atoms: &Atoms, states: &[Atom]) -> ViewState {
    let mut state = ViewState::empty();
    if states.contains(&atoms.net_wm_state_hidden) {
        state |= ViewState::HIDDEN;
    }
    if states.contains(&atoms.net_wm_state_demands_attention) {
        state |= ViewState::DEMANDS_ATTENTION;
    }
    state
}

pub(crate) fn ime_event(update: ImeUpdate) -> Event {
    match update {
        ImeUpdate::Preedit { text, cursor } => Event::ImePreedit { text, cursor },
        ImeUpdate::Commit(text) => Event::ImeCommit { text },
    }
}

/// If `release` is the first half of an auto-repeat pair, the press
/// that completes it.
///
/// The server reports a held key as release/press pairs sharing keycode,
/// window and timestamp.
pub(crate) fn repeat_press(
    release: &KeyPressEvent,
    next: Option<&NativeEvent>,
) -> Option<KeyPressEvent> {
    match next {
        Some(NativeEvent::KeyPress(press))
            if press.detail == release.detail
                && press.time == release.time
                && press.event == release.event =>
        {
            Some(*press)
        }
        _ => None,
    }
}

/// Key event plus, for presses that produce a character, the text.
pub(crate) fn key_events(
    display: &dyn NativeDisplay,
    event: &KeyPressEvent,
    pressed: bool,
    repeat: bool,
) -> Vec<Event> {
    let modifiers = Modifiers::from_x11_state(event.state.into());
    let key = key_from_keysym(display.keysym(event.detail, false));

    let mut events = vec![Event::Key {
        pressed,
        keycode: event.detail,
        key,
        modifiers,
        repeat,
    }];

    if pressed
        && !modifiers.intersects(Modifiers::CTRL | Modifiers::SUPER)
        && let Some(character) = composed_char(display, event.detail, modifiers)
    {
        events.push(Event::Text { character });
    }
    events
}

fn composed_char(display: &dyn NativeDisplay, keycode: u8, modifiers: Modifiers) -> Option<char> {
    let shifted = modifiers.contains(Modifiers::SHIFT);
    let c = keysym_to_char(display.keysym(keycode, shifted))?;
    if !modifiers.contains(Modifiers::CAPS_LOCK) || !c.is_alphabetic() {
        return Some(c);
    }
    // Caps lock inverts the case of letters only.
    let flipped = if c.is_uppercase() {
        c.to_lowercase().next()
    } else {
        c.to_uppercase().next()
    };
    flipped.or(Some(c))
}
