//! Clipboard negotiator: per-view selection ownership and transfer.
//!
//! # Offering
//!
//! `set_clipboard` caches the data, claims `CLIPBOARD` and checks the
//! claim stuck. `SelectionRequest`s are then answered straight from the
//! cache: `TARGETS` gets the advertised atom list, an advertised format
//! gets the bytes, anything else is refused. `SelectionClear` drops the
//! cache.
//!
//! # Requesting
//!
//! Two round trips:
//! 1. `ConvertSelection(CLIPBOARD, TARGETS)` → pick the best format
//!    (registered custom formats first, then `text/uri-list`, then text).
//! 2. `ConvertSelection(CLIPBOARD, format)` → read the property and
//!    deliver the bytes.
//!
//! Every failure, including the deadline passing, ends in
//! [`Event::ClipboardFailed`] and an idle request side.

use std::time::{Duration, Instant};

use x11rb::NONE;
use x11rb::protocol::xproto::{SelectionClearEvent, SelectionNotifyEvent, SelectionRequestEvent};

use crate::atoms::Atoms;
use crate::event::Event;
use crate::platform::{Atom, NativeDisplay, Window, encode_u32s};
use crate::{Error, Result};

/// Offer side of the negotiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferState {
    Idle,
    /// Data cached, ownership claimed but not yet confirmed.
    Pending,
    /// This view owns the selection and serves requests from the cache.
    Owned,
}

/// Request side of the negotiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    /// Waiting for the owner's `TARGETS` list.
    Targets,
    /// Waiting for the data in the chosen format.
    Data,
}

#[derive(Debug)]
struct Offer {
    data: Vec<u8>,
    formats: Vec<Atom>,
    format_names: Vec<String>,
    owned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Targets,
    Data { format: Atom, mime: String },
}

#[derive(Debug)]
struct Request {
    phase: Phase,
    deadline: Instant,
}

/// Per-view clipboard state.
#[derive(Debug, Default)]
pub struct Clipboard {
    offer: Option<Offer>,
    request: Option<Request>,
    /// Custom formats this view decodes, in preference order.
    registered: Vec<(String, Atom)>,
}

/// Formats also offered as plain text. A URI list is readable text too.
fn has_text_aliases(mime: &str) -> bool {
    mime == "text/plain" || mime.starts_with("text/plain;") || mime == "text/uri-list"
}

impl Clipboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer_state(&self) -> OfferState {
        match &self.offer {
            None => OfferState::Idle,
            Some(offer) if offer.owned => OfferState::Owned,
            Some(_) => OfferState::Pending,
        }
    }

    pub fn request_state(&self) -> RequestState {
        match self.request.as_ref().map(|r| &r.phase) {
            None => RequestState::Idle,
            Some(Phase::Targets) => RequestState::Targets,
            Some(Phase::Data { .. }) => RequestState::Data,
        }
    }

    /// Cached data while offering.
    pub fn offered_data(&self) -> Option<&[u8]> {
        self.offer.as_ref().map(|o| o.data.as_slice())
    }

    /// Names of the advertised formats while offering.
    pub fn offered_formats(&self) -> &[String] {
        self.offer.as_ref().map_or(&[], |o| o.format_names.as_slice())
    }

    pub fn registered_formats(&self) -> impl Iterator<Item = &str> {
        self.registered.iter().map(|(mime, _)| mime.as_str())
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.request.as_ref().map(|r| r.deadline)
    }

    /// Drop all state (the view is going away).
    pub(crate) fn reset(&mut self) {
        self.offer = None;
        self.request = None;
    }

    /// Add a custom format this view can decode.
    pub(crate) fn register_format(&mut self, display: &dyn NativeDisplay, mime: &str) -> Result<()> {
        if mime.is_empty() {
            return Err(Error::BadParameter("empty clipboard format".into()));
        }
        if self.registered.iter().any(|(m, _)| m == mime) {
            return Ok(());
        }
        let atom = intern_one(display, mime)?;
        self.registered.push((mime.to_string(), atom));
        Ok(())
    }

    /// Cache `data` and claim the selection for `window`.
    pub(crate) fn offer(
        &mut self,
        display: &dyn NativeDisplay,
        atoms: &Atoms,
        window: Window,
        mime: &str,
        data: &[u8],
    ) -> Result<()> {
        if mime.is_empty() {
            return Err(Error::BadParameter("empty clipboard format".into()));
        }

        let mut formats = vec![intern_one(display, mime)?];
        let mut format_names = vec![mime.to_string()];
        if has_text_aliases(mime) {
            for (atom, name) in [
                (atoms.utf8_string, "UTF8_STRING"),
                (atoms.text_plain, "text/plain"),
                (atoms.string, "STRING"),
            ] {
                if !formats.contains(&atom) {
                    formats.push(atom);
                    format_names.push(name.to_string());
                }
            }
        }

        self.offer = Some(Offer {
            data: data.to_vec(),
            formats,
            format_names,
            owned: false,
        });

        let claimed = display
            .set_selection_owner(window, atoms.clipboard)
            .and_then(|()| display.selection_owner(atoms.clipboard));
        match claimed {
            Ok(owner) if owner == window => {
                if let Some(offer) = self.offer.as_mut() {
                    offer.owned = true;
                }
                tracing::debug!(window, mime, bytes = data.len(), "clipboard ownership granted");
                Ok(())
            }
            Ok(owner) => {
                self.offer = None;
                tracing::warn!(window, owner, "clipboard ownership claim lost the race");
                Err(Error::Failure("another client owns the clipboard".into()))
            }
            Err(e) => {
                self.offer = None;
                Err(e)
            }
        }
    }

    /// Start a two-phase request for the current clipboard contents.
    pub(crate) fn request(
        &mut self,
        display: &dyn NativeDisplay,
        atoms: &Atoms,
        window: Window,
        timeout: Duration,
    ) -> Result<()> {
        if self.request.is_some() {
            return Err(Error::BadParameter("clipboard request already pending".into()));
        }
        display.convert_selection(window, atoms.clipboard, atoms.targets, atoms.transfer)?;
        self.request = Some(Request {
            phase: Phase::Targets,
            deadline: Instant::now() + timeout,
        });
        Ok(())
    }

    /// Answer another client's request from the cache.
    pub(crate) fn handle_selection_request(
        &self,
        display: &dyn NativeDisplay,
        atoms: &Atoms,
        request: &SelectionRequestEvent,
    ) {
        // Obsolete clients pass no property and expect the target name.
        let property = if request.property == NONE {
            request.target
        } else {
            request.property
        };

        let reply = match &self.offer {
            Some(offer) if offer.owned && request.selection == atoms.clipboard => {
                if request.target == atoms.targets {
                    let mut targets = vec![atoms.targets];
                    targets.extend_from_slice(&offer.formats);
                    Some((atoms.atom, 32, encode_u32s(&targets)))
                } else if offer.formats.contains(&request.target) {
                    Some((request.target, 8, offer.data.clone()))
                } else {
                    None
                }
            }
            _ => None,
        };

        let answered = match reply {
            Some((type_, format, bytes)) => {
                match display.change_property(request.requestor, property, type_, format, &bytes) {
                    Ok(()) => property,
                    Err(e) => {
                        tracing::warn!(requestor = request.requestor, error = %e, "failed to write selection data");
                        NONE
                    }
                }
            }
            None => {
                tracing::debug!(
                    requestor = request.requestor,
                    target = request.target,
                    "refusing selection request"
                );
                NONE
            }
        };

        if let Err(e) = display.send_selection_notify(
            request.requestor,
            request.selection,
            request.target,
            answered,
        ) {
            tracing::warn!(requestor = request.requestor, error = %e, "failed to answer selection request");
        }
    }

    /// Another client took the selection.
    pub(crate) fn handle_selection_clear(
        &mut self,
        atoms: &Atoms,
        clear: &SelectionClearEvent,
    ) -> Option<Event> {
        if clear.selection != atoms.clipboard {
            return None;
        }
        self.offer.take()?;
        tracing::debug!(window = clear.owner, "clipboard ownership lost");
        Some(Event::ClipboardLost)
    }

    /// Progress a pending request with the owner's reply.
    pub(crate) fn handle_selection_notify(
        &mut self,
        display: &dyn NativeDisplay,
        atoms: &Atoms,
        window: Window,
        notify: &SelectionNotifyEvent,
    ) -> Option<Event> {
        if notify.selection != atoms.clipboard {
            return None;
        }
        let phase = self.request.as_ref()?.phase.clone();

        let expected = match &phase {
            Phase::Targets => atoms.targets,
            Phase::Data { format, .. } => *format,
        };
        if notify.target != expected {
            tracing::debug!(window, target = notify.target, "ignoring stale SelectionNotify");
            return None;
        }

        match self.advance(display, atoms, window, notify, phase) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(window, error = %e, "clipboard request failed");
                self.request = None;
                Some(Event::ClipboardFailed)
            }
        }
    }

    fn advance(
        &mut self,
        display: &dyn NativeDisplay,
        atoms: &Atoms,
        window: Window,
        notify: &SelectionNotifyEvent,
        phase: Phase,
    ) -> Result<Option<Event>> {
        if notify.property == NONE {
            return Err(Error::Failure("selection owner refused the conversion".into()));
        }
        let property = display
            .get_property(window, notify.property, true)?
            .ok_or_else(|| Error::Failure("selection property missing".into()))?;

        match phase {
            Phase::Targets => {
                let offered = property.atoms();
                let Some((format, mime)) = self.choose_format(atoms, &offered) else {
                    let names: Vec<String> = offered
                        .iter()
                        .filter_map(|&atom| display.atom_name(atom).ok())
                        .collect();
                    return Err(Error::Unsupported(format!(
                        "no common clipboard format in [{}]",
                        names.join(", ")
                    )));
                };
                display.convert_selection(window, atoms.clipboard, format, atoms.transfer)?;
                if let Some(request) = self.request.as_mut() {
                    request.phase = Phase::Data { format, mime };
                }
                Ok(None)
            }
            Phase::Data { mime, .. } => {
                if property.type_ == atoms.incr {
                    return Err(Error::Unsupported("incremental selection transfer".into()));
                }
                self.request = None;
                Ok(Some(Event::ClipboardData {
                    mime,
                    data: property.value,
                }))
            }
        }
    }

    /// Best format this view can decode out of `offered`.
    fn choose_format(&self, atoms: &Atoms, offered: &[Atom]) -> Option<(Atom, String)> {
        self.registered
            .iter()
            .find(|(_, atom)| offered.contains(atom))
            .map(|(mime, atom)| (*atom, mime.clone()))
            .or_else(|| {
                offered
                    .contains(&atoms.uri_list)
                    .then(|| (atoms.uri_list, "text/uri-list".to_string()))
            })
            .or_else(|| {
                atoms
                    .text_formats()
                    .into_iter()
                    .find(|(atom, _)| offered.contains(atom))
                    .map(|(atom, mime)| (atom, mime.to_string()))
            })
    }

    /// Fail a request whose deadline has passed.
    pub(crate) fn check_timeout(&mut self, now: Instant) -> Option<Event> {
        if self.request.as_ref()?.deadline > now {
            return None;
        }
        self.request = None;
        tracing::debug!("clipboard request timed out");
        Some(Event::ClipboardFailed)
    }
}

fn intern_one(display: &dyn NativeDisplay, name: &str) -> Result<Atom> {
    display
        .intern_atoms(&[name])?
        .first()
        .copied()
        .ok_or_else(|| Error::Failure(format!("intern_atom {name}: no reply")))
}
