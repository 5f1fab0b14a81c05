//! XIM client for [`super::x11::X11Display`], on the `xim` crate.
//!
//! Key presses on a window with an input context are forwarded to the
//! input method server instead of being delivered. The server answers
//! asynchronously over the same connection: preedit changes, committed
//! text, and keys it does not want, which it sends back. Those answers
//! are queued here and handed out ahead of the next native event.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use x11rb::protocol::xproto::{self, KeyPressEvent};
use x11rb::rust_connection::RustConnection;
use xim::x11rb::X11rbClient;
use xim::{
    AHashMap, AttributeName, CaretDirection, CaretStyle, Client, ClientError, ClientHandler,
    Extension, Feedback, ForwardEventFlag, InputStyle, PreeditDrawStatus,
};

use super::{DisplayEvent, ImeUpdate, NativeEvent, Window};
use crate::{Error, Result};

type XimResult = std::result::Result<(), ClientError>;

pub(super) struct XimBridge {
    client: X11rbClient<Arc<RustConnection>>,
    handler: Handler,
}

impl XimBridge {
    /// Start the handshake with the server `XMODIFIERS` names.
    pub(super) fn connect(conn: Arc<RustConnection>, screen_num: usize) -> Result<Self> {
        let client = X11rbClient::init(conn, screen_num, None)
            .map_err(|e| Error::Unsupported(format!("no XIM server: {e}")))?;
        Ok(Self {
            client,
            handler: Handler::default(),
        })
    }

    pub(super) fn create_context(&mut self, window: Window) -> Result<()> {
        match self.handler.im {
            Some(im) => {
                create_ic(&mut self.client, im, window).map_err(xim_error)?;
                self.handler.creating.push_back(Some(window));
            }
            None => self.handler.waiting.push(window),
        }
        Ok(())
    }

    pub(super) fn destroy_context(&mut self, window: Window) -> Result<()> {
        self.handler.waiting.retain(|&w| w != window);
        for slot in &mut self.handler.creating {
            if *slot == Some(window) {
                *slot = None;
            }
        }
        self.handler.output.retain(|event| match event {
            DisplayEvent::Ime { window: w, .. } => *w != window,
            DisplayEvent::Native(_) => true,
        });
        let Some(ic) = self.handler.contexts.remove(&window) else {
            return Ok(());
        };
        self.handler.preedits.remove(&ic);
        if let Some(im) = self.handler.im {
            self.client.destroy_ic(im, ic).map_err(xim_error)?;
        }
        Ok(())
    }

    pub(super) fn next_output(&mut self) -> Option<DisplayEvent> {
        self.handler.output.pop_front()
    }

    /// Run one native event past the input method. Returns `true` if
    /// the event was consumed.
    pub(super) fn filter(&mut self, event: &NativeEvent) -> Result<bool> {
        if self
            .client
            .filter_event(event, &mut self.handler)
            .map_err(xim_error)?
        {
            return Ok(true);
        }
        let Some(im) = self.handler.im else {
            return Ok(false);
        };
        match event {
            NativeEvent::KeyPress(key) => {
                let Some(&ic) = self.handler.contexts.get(&key.event) else {
                    return Ok(false);
                };
                self.client
                    .forward_event(im, ic, ForwardEventFlag::empty(), key)
                    .map_err(xim_error)?;
                Ok(true)
            }
            NativeEvent::FocusIn(focus) => {
                if let Some(&ic) = self.handler.contexts.get(&focus.event) {
                    self.client.set_focus(im, ic).map_err(xim_error)?;
                }
                Ok(false)
            }
            NativeEvent::FocusOut(focus) => {
                if let Some(&ic) = self.handler.contexts.get(&focus.event) {
                    self.client.unset_focus(im, ic).map_err(xim_error)?;
                }
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}

fn xim_error(e: ClientError) -> Error {
    Error::Failure(format!("xim: {e}"))
}

fn create_ic<C: Client>(client: &mut C, im: u16, window: Window) -> XimResult {
    let attributes = client
        .build_ic_attributes()
        .push(
            AttributeName::InputStyle,
            InputStyle::PREEDIT_CALLBACKS | InputStyle::STATUS_NOTHING,
        )
        .push(AttributeName::ClientWindow, window)
        .push(AttributeName::FocusWindow, window)
        .build();
    client.create_ic(im, attributes)
}

/// Locale name the input method is opened with, from the usual
/// environment variables with the codeset stripped.
fn locale_from(value: Option<&str>) -> String {
    value
        .and_then(|value| value.split(['.', '@']).next())
        .filter(|name| !name.is_empty() && *name != "C" && *name != "POSIX")
        .unwrap_or("en_US")
        .to_string()
}

fn locale() -> String {
    let value = ["LC_ALL", "LC_CTYPE", "LANG"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|value| !value.is_empty());
    locale_from(value.as_deref())
}

/// Replace `len` characters at `first` with `text`, clamped to the
/// current preedit.
fn splice_preedit(preedit: &mut Vec<char>, first: i32, len: i32, text: &str) {
    let start = usize::try_from(first).unwrap_or(0).min(preedit.len());
    let end = start
        .saturating_add(usize::try_from(len).unwrap_or(0))
        .min(preedit.len());
    preedit.splice(start..end, text.chars());
}

#[derive(Debug, Default)]
struct Handler {
    im: Option<u16>,
    /// Windows asked for before the input method opened.
    waiting: Vec<Window>,
    /// Context creations in flight. Replies come in request order;
    /// `None` marks a window destroyed before its reply.
    creating: VecDeque<Option<Window>>,
    contexts: HashMap<Window, u16>,
    preedits: HashMap<u16, Vec<char>>,
    output: VecDeque<DisplayEvent>,
}

impl Handler {
    fn window_of(&self, ic: u16) -> Option<Window> {
        self.contexts
            .iter()
            .find(|&(_, &id)| id == ic)
            .map(|(&window, _)| window)
    }

    fn emit(&mut self, ic: u16, update: ImeUpdate) {
        match self.window_of(ic) {
            Some(window) => self.output.push_back(DisplayEvent::Ime { window, update }),
            None => tracing::debug!(ic, "input method update for unknown context"),
        }
    }

    fn reset(&mut self) {
        self.im = None;
        self.preedits.clear();
        // Windows keep working without composition; they get a context
        // again if the server comes back.
        self.waiting
            .extend(self.contexts.drain().map(|(window, _)| window));
        self.waiting.extend(self.creating.drain(..).flatten());
    }
}

impl<C: Client<XEvent = KeyPressEvent>> ClientHandler<C> for Handler {
    fn handle_connect(&mut self, client: &mut C) -> XimResult {
        let locale = locale();
        tracing::debug!(%locale, "XIM server connected");
        client.open(&locale)
    }

    fn handle_disconnect(&mut self) {
        tracing::info!("XIM server disconnected, composing text from keysyms");
        self.reset();
    }

    fn handle_open(&mut self, client: &mut C, input_method_id: u16) -> XimResult {
        tracing::debug!(im = input_method_id, "input method opened");
        self.im = Some(input_method_id);
        for window in std::mem::take(&mut self.waiting) {
            create_ic(client, input_method_id, window)?;
            self.creating.push_back(Some(window));
        }
        Ok(())
    }

    fn handle_close(&mut self, _client: &mut C, input_method_id: u16) -> XimResult {
        tracing::debug!(im = input_method_id, "input method closed");
        self.reset();
        Ok(())
    }

    fn handle_query_extension(&mut self, _client: &mut C, _extensions: &[Extension]) -> XimResult {
        Ok(())
    }

    fn handle_get_im_values(
        &mut self,
        _client: &mut C,
        _input_method_id: u16,
        _attributes: AHashMap<AttributeName, Vec<u8>>,
    ) -> XimResult {
        Ok(())
    }

    fn handle_set_ic_values(
        &mut self,
        _client: &mut C,
        _input_method_id: u16,
        _input_context_id: u16,
    ) -> XimResult {
        Ok(())
    }

    fn handle_create_ic(
        &mut self,
        client: &mut C,
        input_method_id: u16,
        input_context_id: u16,
    ) -> XimResult {
        match self.creating.pop_front().flatten() {
            Some(window) => {
                tracing::debug!(window, ic = input_context_id, "input context created");
                self.contexts.insert(window, input_context_id);
                Ok(())
            }
            None => client.destroy_ic(input_method_id, input_context_id),
        }
    }

    fn handle_destroy_ic(
        &mut self,
        _client: &mut C,
        _input_method_id: u16,
        input_context_id: u16,
    ) -> XimResult {
        self.preedits.remove(&input_context_id);
        Ok(())
    }

    fn handle_commit(
        &mut self,
        _client: &mut C,
        _input_method_id: u16,
        input_context_id: u16,
        text: &str,
    ) -> XimResult {
        self.preedits.remove(&input_context_id);
        self.emit(input_context_id, ImeUpdate::Commit(text.to_string()));
        Ok(())
    }

    fn handle_forward_event(
        &mut self,
        _client: &mut C,
        _input_method_id: u16,
        _input_context_id: u16,
        _flag: ForwardEventFlag,
        xev: C::XEvent,
    ) -> XimResult {
        let event = if xev.response_type & 0x7f == xproto::KEY_RELEASE_EVENT {
            NativeEvent::KeyRelease(xev)
        } else {
            NativeEvent::KeyPress(xev)
        };
        self.output.push_back(DisplayEvent::Native(event));
        Ok(())
    }

    fn handle_set_event_mask(
        &mut self,
        _client: &mut C,
        _input_method_id: u16,
        _input_context_id: u16,
        _forward_event_mask: u32,
        _synchronous_event_mask: u32,
    ) -> XimResult {
        Ok(())
    }

    fn handle_preedit_start(
        &mut self,
        _client: &mut C,
        _input_method_id: u16,
        input_context_id: u16,
    ) -> XimResult {
        self.preedits.insert(input_context_id, Vec::new());
        Ok(())
    }

    fn handle_preedit_done(
        &mut self,
        _client: &mut C,
        _input_method_id: u16,
        input_context_id: u16,
    ) -> XimResult {
        self.preedits.remove(&input_context_id);
        self.emit(
            input_context_id,
            ImeUpdate::Preedit {
                text: String::new(),
                cursor: None,
            },
        );
        Ok(())
    }

    fn handle_preedit_draw(
        &mut self,
        _client: &mut C,
        _input_method_id: u16,
        input_context_id: u16,
        caret: i32,
        chg_first: i32,
        chg_len: i32,
        status: PreeditDrawStatus,
        preedit_string: &str,
        _feedbacks: Vec<Feedback>,
    ) -> XimResult {
        let preedit = self.preedits.entry(input_context_id).or_default();
        let inserted = if status.contains(PreeditDrawStatus::NO_STRING) {
            ""
        } else {
            preedit_string
        };
        splice_preedit(preedit, chg_first, chg_len, inserted);
        let text: String = preedit.iter().collect();
        let cursor = usize::try_from(caret).ok().map(|c| c.min(preedit.len()));
        self.emit(input_context_id, ImeUpdate::Preedit { text, cursor });
        Ok(())
    }

    fn handle_preedit_caret(
        &mut self,
        _client: &mut C,
        _input_method_id: u16,
        _input_context_id: u16,
        _position: &mut i32,
        _direction: CaretDirection,
        _style: CaretStyle,
    ) -> XimResult {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preedit_splice_replaces_changed_range() {
        let mut preedit = Vec::new();
        splice_preedit(&mut preedit, 0, 0, "にほ");
        splice_preedit(&mut preedit, 2, 0, "ん");
        assert_eq!(preedit.iter().collect::<String>(), "にほん");
        splice_preedit(&mut preedit, 0, 3, "日本");
        assert_eq!(preedit.iter().collect::<String>(), "日本");
    }

    #[test]
    fn preedit_splice_clamps_out_of_range() {
        let mut preedit: Vec<char> = "ab".chars().collect();
        splice_preedit(&mut preedit, 5, 9, "c");
        assert_eq!(preedit.iter().collect::<String>(), "abc");
        splice_preedit(&mut preedit, -1, 1, "");
        assert_eq!(preedit.iter().collect::<String>(), "bc");
    }

    #[test]
    fn locale_strips_codeset() {
        assert_eq!(locale_from(Some("ja_JP.UTF-8")), "ja_JP");
        assert_eq!(locale_from(Some("de_DE@euro")), "de_DE");
        assert_eq!(locale_from(Some("C")), "en_US");
        assert_eq!(locale_from(None), "en_US");
    }

    #[test]
    fn updates_route_to_context_window() {
        let mut handler = Handler::default();
        handler.contexts.insert(0x40_0001, 3);
        handler.emit(3, ImeUpdate::Commit("é".into()));
        handler.emit(9, ImeUpdate::Commit("lost".into()));
        assert_eq!(handler.output.len(), 1);
        let Some(DisplayEvent::Ime { window, update }) = handler.output.pop_front() else {
            panic!("expected an input method update");
        };
        assert_eq!(window, 0x40_0001);
        assert_eq!(update, ImeUpdate::Commit("é".into()));
    }

    #[test]
    fn reset_requeues_windows_for_new_contexts() {
        let mut handler = Handler::default();
        handler.im = Some(1);
        handler.contexts.insert(0x40_0001, 3);
        handler.creating.push_back(Some(0x40_0002));
        handler.reset();
        assert_eq!(handler.im, None);
        assert!(handler.contexts.is_empty());
        assert!(handler.creating.is_empty());
        assert_eq!(handler.waiting, vec![0x40_0001, 0x40_0002]);
    }
}
