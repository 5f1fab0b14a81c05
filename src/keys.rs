//! Keysym translation: X11 keysym → [`Key`] and composed text.
//!
//! Keycodes are resolved to keysyms by the display (keyboard mapping
//! fetched once at connect); this module only interprets keysyms.

use x11rb::protocol::xproto::Keysym;

/// A logical key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    /// A key producing a character. Letters are reported unshifted.
    Character(char),
    Backspace,
    Tab,
    Enter,
    Escape,
    Delete,
    Insert,
    Home,
    End,
    PageUp,
    PageDown,
    Left,
    Up,
    Right,
    Down,
    /// Function key F1–F24.
    F(u8),
    ShiftL,
    ShiftR,
    CtrlL,
    CtrlR,
    AltL,
    AltR,
    SuperL,
    SuperR,
    CapsLock,
    NumLock,
    Menu,
    /// No mapping; carries the raw keysym.
    Unknown(Keysym),
}

const XK_F1: Keysym = 0xffbe;
const XK_F24: Keysym = 0xffd5;

/// Map a keysym to a logical key.
pub fn key_from_keysym(keysym: Keysym) -> Key {
    if (XK_F1..=XK_F24).contains(&keysym) {
        return Key::F((keysym - XK_F1 + 1) as u8);
    }

    match keysym {
        0xff08 => Key::Backspace,
        0xff09 => Key::Tab,
        0xff0d | 0xff8d => Key::Enter,
        0xff1b => Key::Escape,
        0xffff => Key::Delete,
        0xff63 => Key::Insert,
        0xff50 => Key::Home,
        0xff57 => Key::End,
        0xff55 => Key::PageUp,
        0xff56 => Key::PageDown,
        0xff51 => Key::Left,
        0xff52 => Key::Up,
        0xff53 => Key::Right,
        0xff54 => Key::Down,
        0xffe1 => Key::ShiftL,
        0xffe2 => Key::ShiftR,
        0xffe3 => Key::CtrlL,
        0xffe4 => Key::CtrlR,
        0xffe9 => Key::AltL,
        0xffea => Key::AltR,
        0xffeb => Key::SuperL,
        0xffec => Key::SuperR,
        0xffe5 => Key::CapsLock,
        0xff7f => Key::NumLock,
        0xff67 => Key::Menu,
        _ => match keysym_to_char(keysym) {
            Some(ch) => Key::Character(ch.to_lowercase().next().unwrap_or(ch)),
            None => Key::Unknown(keysym),
        },
    }
}

/// The character a keysym types, if it is printable.
///
/// Latin-1 keysyms equal their code point; the `0x0100_0000` range
/// carries arbitrary Unicode code points. Keypad digits and operators
/// map to their ASCII equivalents.
pub fn keysym_to_char(keysym: Keysym) -> Option<char> {
    let code = match keysym {
        0x0020..=0x007e | 0x00a0..=0x00ff => keysym,
        0x0100_0100..=0x0110_ffff => keysym - 0x0100_0000,
        // KP_0..KP_9
        0xffb0..=0xffb9 => u32::from(b'0') + (keysym - 0xffb0),
        0xffaa => u32::from(b'*'),
        0xffab => u32::from(b'+'),
        0xffad => u32::from(b'-'),
        0xffae => u32::from(b'.'),
        0xffaf => u32::from(b'/'),
        _ => return None,
    };

    char::from_u32(code).filter(|c| !c.is_control())
}
