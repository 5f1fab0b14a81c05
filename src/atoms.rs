//! Atom table: protocol identifiers interned once per world.

use crate::platform::{Atom, NativeDisplay};
use crate::{Error, Result};

/// Atoms the bridge needs, interned at world creation and immutable
/// afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Atoms {
    pub clipboard: Atom,
    pub targets: Atom,
    pub incr: Atom,
    pub utf8_string: Atom,
    pub string: Atom,
    pub text_plain: Atom,
    pub text_plain_utf8: Atom,
    pub atom: Atom,
    pub wm_protocols: Atom,
    pub wm_delete_window: Atom,
    pub wm_name: Atom,
    pub wm_class: Atom,
    pub wm_normal_hints: Atom,
    pub wm_size_hints: Atom,
    pub net_wm_name: Atom,
    pub net_wm_state: Atom,
    pub net_wm_state_hidden: Atom,
    pub net_wm_state_demands_attention: Atom,
    /// `text/uri-list`, for dropped or copied files and links.
    pub uri_list: Atom,
    /// Client message type for wake-ups and posted client events.
    pub client_msg: Atom,
    /// Property selection data is transferred through.
    pub transfer: Atom,
}

const NAMES: [&str; 21] = [
    "CLIPBOARD",
    "TARGETS",
    "INCR",
    "UTF8_STRING",
    "STRING",
    "text/plain",
    "text/plain;charset=utf-8",
    "ATOM",
    "WM_PROTOCOLS",
    "WM_DELETE_WINDOW",
    "WM_NAME",
    "WM_CLASS",
    "WM_NORMAL_HINTS",
    "WM_SIZE_HINTS",
    "_NET_WM_NAME",
    "_NET_WM_STATE",
    "_NET_WM_STATE_HIDDEN",
    "_NET_WM_STATE_DEMANDS_ATTENTION",
    "text/uri-list",
    "_PORTVIEW_CLIENT_MSG",
    "_PORTVIEW_SELECTION",
];

impl Atoms {
    /// Intern every atom in one batch.
    pub fn intern(display: &dyn NativeDisplay) -> Result<Self> {
        let atoms = display.intern_atoms(&NAMES)?;
        let [
            clipboard,
            targets,
            incr,
            utf8_string,
            string,
            text_plain,
            text_plain_utf8,
            atom,
            wm_protocols,
            wm_delete_window,
            wm_name,
            wm_class,
            wm_normal_hints,
            wm_size_hints,
            net_wm_name,
            net_wm_state,
            net_wm_state_hidden,
            net_wm_state_demands_attention,
            uri_list,
            client_msg,
            transfer,
        ] = <[Atom; 21]>::try_from(atoms).map_err(|got| {
            Error::Failure(format!(
                "interned {} atoms, expected {}",
                got.len(),
                NAMES.len()
            ))
        })?;

        tracing::debug!(clipboard, targets, client_msg, "atoms interned");

        Ok(Self {
            clipboard,
            targets,
            incr,
            utf8_string,
            string,
            text_plain,
            text_plain_utf8,
            atom,
            wm_protocols,
            wm_delete_window,
            wm_name,
            wm_class,
            wm_normal_hints,
            wm_size_hints,
            net_wm_name,
            net_wm_state,
            net_wm_state_hidden,
            net_wm_state_demands_attention,
            uri_list,
            client_msg,
            transfer,
        })
    }

    /// Known text formats, most preferred first, with their MIME names.
    pub fn text_formats(&self) -> [(Atom, &'static str); 4] {
        [
            (self.utf8_string, "text/plain;charset=utf-8"),
            (self.text_plain_utf8, "text/plain;charset=utf-8"),
            (self.text_plain, "text/plain"),
            (self.string, "text/plain"),
        ]
    }

    /// MIME name for a text format atom, if it is one.
    pub fn text_mime(&self, atom: Atom) -> Option<&'static str> {
        self.text_formats()
            .into_iter()
            .find(|&(a, _)| a == atom)
            .map(|(_, mime)| mime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::headless::HeadlessDisplay;

    #[test]
    fn interned_atoms_are_distinct() {
        let display = HeadlessDisplay::new();
        let atoms = Atoms::intern(&display).unwrap();
        let all = [
            atoms.clipboard,
            atoms.targets,
            atoms.incr,
            atoms.utf8_string,
            atoms.string,
            atoms.text_plain,
            atoms.text_plain_utf8,
            atoms.atom,
            atoms.wm_protocols,
            atoms.wm_delete_window,
            atoms.wm_name,
            atoms.wm_class,
            atoms.wm_normal_hints,
            atoms.wm_size_hints,
            atoms.net_wm_name,
            atoms.net_wm_state,
            atoms.net_wm_state_hidden,
            atoms.net_wm_state_demands_attention,
            atoms.uri_list,
            atoms.client_msg,
            atoms.transfer,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(!all[i + 1..].contains(a), "duplicate atom {a}");
        }
    }

    #[test]
    fn interning_is_stable() {
        let display = HeadlessDisplay::new();
        let first = Atoms::intern(&display).unwrap();
        let second = Atoms::intern(&display).unwrap();
        assert_eq!(first, second);
        assert_eq!(display.atom("CLIPBOARD"), first.clipboard);
        assert_eq!(display.atom("text/uri-list"), first.uri_list);
        assert_eq!(
            display.atom("_NET_WM_STATE_HIDDEN"),
            first.net_wm_state_hidden
        );
    }

    #[test]
    fn text_mime_lookup() {
        let display = HeadlessDisplay::new();
        let atoms = Atoms::intern(&display).unwrap();
        assert_eq!(atoms.text_mime(atoms.string), Some("text/plain"));
        assert_eq!(atoms.text_mime(atoms.targets), None);
    }
}
