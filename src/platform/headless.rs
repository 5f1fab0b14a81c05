//! Headless display: an in-memory stand-in for an X server.
//!
//! Keeps just enough server state (atoms, windows, properties,
//! selection owners, alarms, an event queue) for the bridge to run
//! without a display. Selection traffic between windows of the same
//! headless display is routed the way a server would route it, and a
//! *foreign* owner can be installed to play the other application.
//!
//! Two more clients can be simulated: a window manager that answers
//! `_NET_WM_STATE` requests, and an input method that composes text
//! from keysym sequences registered with
//! [`HeadlessDisplay::add_compose_sequence`].
//!
//! Clones share the same server, so a test can keep a handle while the
//! world owns another.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use x11rb::NONE;
use x11rb::protocol::sync::{ALARMSTATE, AlarmNotifyEvent, Int64};
use x11rb::protocol::xproto::{
    self, AtomEnum, ClientMessageEvent, ConfigureNotifyEvent, ExposeEvent, KeyButMask,
    KeyPressEvent, MapNotifyEvent, PropertyNotifyEvent, SelectionClearEvent,
    SelectionNotifyEvent, SelectionRequestEvent, UnmapNotifyEvent,
};

use super::{
    Atom, DisplayEvent, ImeUpdate, Keysym, NativeDisplay, NativeEvent, Property, WakeSignal,
    Window, WindowParams, encode_u32s,
};
use crate::hints::FramebufferConfig;
use crate::keys::keysym_to_char;
use crate::timer::Alarm;
use crate::{Error, Result};

/// First atom id handed out for names that are not predefined.
const FIRST_DYNAMIC_ATOM: Atom = 69;

/// First resource id handed out for windows and alarms.
const FIRST_XID: u32 = 0x0040_0001;

/// A selection owned by a simulated other client.
#[derive(Debug, Clone)]
struct ForeignSelection {
    formats: Vec<(Atom, Vec<u8>)>,
    /// Never answers conversion requests.
    silent: bool,
}

#[derive(Debug, Clone)]
enum SelectionOwner {
    Local(Window),
    Foreign(ForeignSelection),
}

#[derive(Debug, Clone, Copy)]
struct WindowRecord {
    mapped: bool,
    width: u16,
    height: u16,
}

#[derive(Debug)]
struct State {
    atoms: HashMap<String, Atom>,
    atom_names: HashMap<Atom, String>,
    next_atom: Atom,
    next_xid: u32,
    windows: HashMap<Window, WindowRecord>,
    properties: HashMap<(Window, Atom), Property>,
    selections: HashMap<Atom, SelectionOwner>,
    refuse_selection_ownership: bool,
    alarms: HashSet<Alarm>,
    alarms_supported: bool,
    configs: Vec<FramebufferConfig>,
    refresh_rates: Vec<u32>,
    keymap: HashMap<u8, (Keysym, Keysym)>,
    events: VecDeque<NativeEvent>,
    /// Compose sequences of the simulated input method; `None` when no
    /// input method runs.
    compose: Option<Vec<(Vec<Keysym>, String)>>,
    /// Windows with an input context, and the keysyms typed so far.
    input_contexts: HashMap<Window, Vec<Keysym>>,
    ime_output: VecDeque<DisplayEvent>,
}

impl State {
    fn new() -> Self {
        let mut state = Self {
            atoms: HashMap::new(),
            atom_names: HashMap::new(),
            next_atom: FIRST_DYNAMIC_ATOM,
            next_xid: FIRST_XID,
            windows: HashMap::new(),
            properties: HashMap::new(),
            selections: HashMap::new(),
            refuse_selection_ownership: false,
            alarms: HashSet::new(),
            alarms_supported: true,
            configs: vec![
                FramebufferConfig {
                    visual_id: 0x21,
                    depth: 24,
                    red_bits: 8,
                    green_bits: 8,
                    blue_bits: 8,
                    alpha_bits: 0,
                    double_buffer: true,
                    ..Default::default()
                },
                FramebufferConfig {
                    visual_id: 0x5e,
                    depth: 32,
                    red_bits: 8,
                    green_bits: 8,
                    blue_bits: 8,
                    alpha_bits: 8,
                    double_buffer: true,
                    ..Default::default()
                },
            ],
            refresh_rates: vec![60],
            keymap: HashMap::new(),
            events: VecDeque::new(),
            compose: None,
            input_contexts: HashMap::new(),
            ime_output: VecDeque::new(),
        };
        for (name, atom) in [
            ("PRIMARY", AtomEnum::PRIMARY),
            ("ATOM", AtomEnum::ATOM),
            ("CARDINAL", AtomEnum::CARDINAL),
            ("STRING", AtomEnum::STRING),
            ("WINDOW", AtomEnum::WINDOW),
            ("WM_NAME", AtomEnum::WM_NAME),
            ("WM_NORMAL_HINTS", AtomEnum::WM_NORMAL_HINTS),
            ("WM_SIZE_HINTS", AtomEnum::WM_SIZE_HINTS),
            ("WM_CLASS", AtomEnum::WM_CLASS),
        ] {
            state.atoms.insert(name.to_string(), atom.into());
            state.atom_names.insert(atom.into(), name.to_string());
        }
        state
    }

    fn intern(&mut self, name: &str) -> Atom {
        if let Some(&atom) = self.atoms.get(name) {
            return atom;
        }
        let atom = self.next_atom;
        self.next_atom += 1;
        self.atoms.insert(name.to_string(), atom);
        self.atom_names.insert(atom, name.to_string());
        atom
    }

    fn idle(&self) -> bool {
        self.events.is_empty() && self.ime_output.is_empty()
    }

    fn keysym(&self, keycode: u8, shifted: bool) -> Keysym {
        match self.keymap.get(&keycode) {
            Some(&(lower, upper)) => {
                if shifted {
                    upper
                } else {
                    lower
                }
            }
            None => 0,
        }
    }

    /// Run a key press through the simulated input method. Returns
    /// `true` if it was consumed.
    fn compose(&mut self, key: &KeyPressEvent) -> bool {
        let Some(sequences) = &self.compose else {
            return false;
        };
        let Some(typed) = self.input_contexts.get(&key.event) else {
            return false;
        };
        let window = key.event;
        let shifted = u16::from(key.state) & u16::from(KeyButMask::SHIFT) != 0;
        let mut sequence = typed.clone();
        sequence.push(self.keysym(key.detail, shifted));

        let end = ImeUpdate::Preedit {
            text: String::new(),
            cursor: None,
        };
        if let Some((_, text)) = sequences.iter().find(|(seq, _)| *seq == sequence) {
            let commit = ImeUpdate::Commit(text.clone());
            self.input_contexts.insert(window, Vec::new());
            for update in [end, commit] {
                self.ime_output
                    .push_back(DisplayEvent::Ime { window, update });
            }
            return true;
        }
        if sequences.iter().any(|(seq, _)| seq.starts_with(&sequence)) {
            let text: String = sequence.iter().filter_map(|&k| keysym_to_char(k)).collect();
            let cursor = Some(text.chars().count());
            self.input_contexts.insert(window, sequence);
            self.ime_output.push_back(DisplayEvent::Ime {
                window,
                update: ImeUpdate::Preedit { text, cursor },
            });
            return true;
        }
        if typed.is_empty() {
            return false;
        }
        // The sequence broke off: end the composition, then pass the key on.
        self.input_contexts.insert(window, Vec::new());
        self.ime_output
            .push_back(DisplayEvent::Ime { window, update: end });
        self.ime_output
            .push_back(DisplayEvent::Native(NativeEvent::KeyPress(*key)));
        true
    }

    fn set_wm_state(&mut self, window: Window, states: &[Atom]) {
        let net_wm_state = self.intern("_NET_WM_STATE");
        self.properties.insert(
            (window, net_wm_state),
            Property {
                type_: AtomEnum::ATOM.into(),
                format: 32,
                value: encode_u32s(states),
            },
        );
        self.events
            .push_back(NativeEvent::PropertyNotify(PropertyNotifyEvent {
                response_type: xproto::PROPERTY_NOTIFY_EVENT,
                sequence: 0,
                window,
                atom: net_wm_state,
                time: x11rb::CURRENT_TIME,
                state: xproto::Property::NEW_VALUE,
            }));
    }

    /// Apply a `_NET_WM_STATE` change request the way a window manager
    /// would: 0 removes, 1 adds, 2 toggles.
    fn apply_wm_state_request(&mut self, window: Window, data: [u32; 5]) {
        let net_wm_state = self.intern("_NET_WM_STATE");
        let mut states = self
            .properties
            .get(&(window, net_wm_state))
            .map(Property::atoms)
            .unwrap_or_default();
        for atom in [data[1], data[2]].into_iter().filter(|&a| a != NONE) {
            let present = states.contains(&atom);
            match data[0] {
                0 => states.retain(|&a| a != atom),
                1 if !present => states.push(atom),
                2 if present => states.retain(|&a| a != atom),
                2 => states.push(atom),
                _ => {}
            }
        }
        self.set_wm_state(window, &states);
    }

    fn alloc_xid(&mut self) -> u32 {
        let id = self.next_xid;
        self.next_xid += 1;
        id
    }

    fn push_selection_clear(&mut self, owner: Window, selection: Atom) {
        self.events
            .push_back(NativeEvent::SelectionClear(SelectionClearEvent {
                response_type: xproto::SELECTION_CLEAR_EVENT,
                sequence: 0,
                time: x11rb::CURRENT_TIME,
                owner,
                selection,
            }));
    }

    fn push_selection_notify(
        &mut self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
    ) {
        self.events
            .push_back(NativeEvent::SelectionNotify(SelectionNotifyEvent {
                response_type: xproto::SELECTION_NOTIFY_EVENT,
                sequence: 0,
                time: x11rb::CURRENT_TIME,
                requestor,
                selection,
                target,
                property,
            }));
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    ready: Condvar,
}

/// In-memory display. See the module docs.
#[derive(Debug, Clone)]
pub struct HeadlessDisplay {
    shared: Arc<Shared>,
}

impl Default for HeadlessDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDisplay {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::new()),
                ready: Condvar::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Intern `name` (or look it up).
    pub fn atom(&self, name: &str) -> Atom {
        self.state().intern(name)
    }

    /// Queue a raw native event.
    pub fn push_event(&self, event: NativeEvent) {
        self.state().events.push_back(event);
        self.shared.ready.notify_all();
    }

    /// Number of events not yet polled.
    pub fn pending_events(&self) -> usize {
        self.state().events.len()
    }

    /// Replace the advertised framebuffer configs.
    pub fn set_framebuffer_configs(&self, configs: Vec<FramebufferConfig>) {
        self.state().configs = configs;
    }

    /// Replace the advertised refresh rates (current first).
    pub fn set_refresh_rates(&self, rates: Vec<u32>) {
        self.state().refresh_rates = rates;
    }

    /// Simulate a server without the Sync extension.
    pub fn set_alarms_supported(&self, supported: bool) {
        self.state().alarms_supported = supported;
    }

    /// Make `set_selection_owner` silently lose the race.
    pub fn set_refuse_selection_ownership(&self, refuse: bool) {
        self.state().refuse_selection_ownership = refuse;
    }

    /// Map `keycode` to an unshifted and shifted keysym.
    pub fn map_key(&self, keycode: u8, lower: Keysym, upper: Keysym) {
        self.state().keymap.insert(keycode, (lower, upper));
    }

    pub fn live_alarms(&self) -> Vec<Alarm> {
        let mut alarms: Vec<Alarm> = self.state().alarms.iter().copied().collect();
        alarms.sort_unstable();
        alarms
    }

    pub fn window_exists(&self, window: Window) -> bool {
        self.state().windows.contains_key(&window)
    }

    pub fn is_mapped(&self, window: Window) -> bool {
        self.state().windows.get(&window).is_some_and(|w| w.mapped)
    }

    /// Current value of a property, by property name.
    pub fn property(&self, window: Window, name: &str) -> Option<Property> {
        let mut state = self.state();
        let atom = state.intern(name);
        state.properties.get(&(window, atom)).cloned()
    }

    /// Local window owning `selection`, `NONE` otherwise.
    pub fn local_selection_owner(&self, selection: &str) -> Window {
        let mut state = self.state();
        let atom = state.intern(selection);
        match state.selections.get(&atom) {
            Some(SelectionOwner::Local(window)) => *window,
            _ => NONE,
        }
    }

    /// Hand `selection` to a simulated other client offering `formats`
    /// (target name, bytes). A local owner receives `SelectionClear`.
    pub fn claim_selection_foreign(&self, selection: &str, formats: &[(&str, &[u8])]) {
        self.install_foreign(selection, formats, false);
    }

    /// Like [`Self::claim_selection_foreign`] but the other client
    /// never answers conversion requests.
    pub fn claim_selection_unresponsive(&self, selection: &str) {
        self.install_foreign(selection, &[], true);
    }

    fn install_foreign(&self, selection: &str, formats: &[(&str, &[u8])], silent: bool) {
        let mut state = self.state();
        let selection = state.intern(selection);
        let formats: Vec<(Atom, Vec<u8>)> = formats
            .iter()
            .map(|(name, data)| (state.intern(name), data.to_vec()))
            .collect();
        if let Some(SelectionOwner::Local(owner)) = state.selections.get(&selection).cloned() {
            state.push_selection_clear(owner, selection);
        }
        state.selections.insert(
            selection,
            SelectionOwner::Foreign(ForeignSelection { formats, silent }),
        );
        drop(state);
        self.shared.ready.notify_all();
    }

    /// Queue an alarm notification as the server would when it fires.
    pub fn fire_alarm(&self, alarm: Alarm) {
        self.push_event(NativeEvent::SyncAlarmNotify(AlarmNotifyEvent {
            response_type: 0,
            kind: 0,
            sequence: 0,
            alarm,
            counter_value: Int64 { hi: 0, lo: 0 },
            alarm_value: Int64 { hi: 0, lo: 0 },
            timestamp: x11rb::CURRENT_TIME,
            state: ALARMSTATE::ACTIVE,
        }));
    }

    /// Queue a `ConfigureNotify` for `window`.
    pub fn configure(&self, window: Window, x: i16, y: i16, width: u16, height: u16) {
        if let Some(record) = self.state().windows.get_mut(&window) {
            record.width = width;
            record.height = height;
        }
        self.push_event(NativeEvent::ConfigureNotify(ConfigureNotifyEvent {
            response_type: xproto::CONFIGURE_NOTIFY_EVENT,
            sequence: 0,
            event: window,
            window,
            above_sibling: NONE,
            x,
            y,
            width,
            height,
            border_width: 0,
            override_redirect: false,
        }));
    }

    /// Queue an `Expose` for a region of `window`.
    pub fn expose(&self, window: Window, x: u16, y: u16, width: u16, height: u16) {
        self.push_event(NativeEvent::Expose(ExposeEvent {
            response_type: xproto::EXPOSE_EVENT,
            sequence: 0,
            window,
            x,
            y,
            width,
            height,
            count: 0,
        }));
    }

    /// Queue a key press or release.
    pub fn key(&self, window: Window, keycode: u8, pressed: bool, time: u32, state: u16) {
        let event = KeyPressEvent {
            response_type: if pressed {
                xproto::KEY_PRESS_EVENT
            } else {
                xproto::KEY_RELEASE_EVENT
            },
            detail: keycode,
            sequence: 0,
            time,
            root: NONE,
            event: window,
            child: NONE,
            root_x: 0,
            root_y: 0,
            event_x: 0,
            event_y: 0,
            state: KeyButMask::from(state),
            same_screen: true,
        };
        self.push_event(if pressed {
            NativeEvent::KeyPress(event)
        } else {
            NativeEvent::KeyRelease(event)
        });
    }

    /// Run a simulated input method (if none runs yet) and teach it to
    /// turn `sequence` into `text`. Partial sequences show the printable
    /// keysyms typed so far as preedit.
    pub fn add_compose_sequence(&self, sequence: &[Keysym], text: &str) {
        self.state()
            .compose
            .get_or_insert_with(Vec::new)
            .push((sequence.to_vec(), text.to_string()));
    }

    pub fn has_input_context(&self, window: Window) -> bool {
        self.state().input_contexts.contains_key(&window)
    }

    /// Act as the window manager changing `window`'s `_NET_WM_STATE`
    /// to the named states, e.g. `_NET_WM_STATE_HIDDEN` when iconified.
    pub fn set_wm_state(&self, window: Window, states: &[&str]) {
        let mut state = self.state();
        let atoms: Vec<Atom> = states.iter().map(|name| state.intern(name)).collect();
        state.set_wm_state(window, &atoms);
        drop(state);
        self.shared.ready.notify_all();
    }

    /// Queue a window-manager close request (`WM_DELETE_WINDOW`).
    pub fn request_close(&self, window: Window) {
        let protocols = self.atom("WM_PROTOCOLS");
        let delete = self.atom("WM_DELETE_WINDOW");
        self.push_event(NativeEvent::ClientMessage(ClientMessageEvent::new(
            32,
            window,
            protocols,
            [delete, 0, 0, 0, 0],
        )));
    }
}

struct HeadlessWake {
    shared: Arc<Shared>,
    window: Window,
    type_: Atom,
}

impl WakeSignal for HeadlessWake {
    fn wake(&self) -> Result<()> {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state
            .events
            .push_back(NativeEvent::ClientMessage(ClientMessageEvent::new(
                32,
                self.window,
                self.type_,
                [0, 0, 0, 0, 0],
            )));
        drop(state);
        self.shared.ready.notify_all();
        Ok(())
    }
}

impl NativeDisplay for HeadlessDisplay {
    fn intern_atoms(&self, names: &[&str]) -> Result<Vec<Atom>> {
        let mut state = self.state();
        Ok(names.iter().map(|name| state.intern(name)).collect())
    }

    fn atom_name(&self, atom: Atom) -> Result<String> {
        self.state()
            .atom_names
            .get(&atom)
            .cloned()
            .ok_or_else(|| Error::Failure(format!("get_atom_name: bad atom {atom}")))
    }

    fn framebuffer_configs(&self) -> Vec<FramebufferConfig> {
        self.state().configs.clone()
    }

    fn refresh_rates(&self) -> Vec<u32> {
        self.state().refresh_rates.clone()
    }

    fn create_window(&self, params: &WindowParams) -> Result<Window> {
        let mut state = self.state();
        if let Some((depth, visual)) = params.visual
            && !state
                .configs
                .iter()
                .any(|c| c.depth == depth && c.visual_id == visual)
        {
            return Err(Error::Failure(format!(
                "create_window: BadMatch for visual 0x{visual:x} depth {depth}"
            )));
        }
        let window = state.alloc_xid();
        state.windows.insert(
            window,
            WindowRecord {
                mapped: false,
                width: params.width,
                height: params.height,
            },
        );
        Ok(window)
    }

    fn destroy_window(&self, window: Window) -> Result<()> {
        let mut state = self.state();
        if state.windows.remove(&window).is_none() {
            return Err(Error::Failure(format!(
                "destroy_window: BadWindow 0x{window:x}"
            )));
        }
        state.properties.retain(|&(w, _), _| w != window);
        state
            .selections
            .retain(|_, owner| !matches!(owner, SelectionOwner::Local(w) if *w == window));
        state.events.retain(|event| super::event_window(event) != Some(window));
        state.input_contexts.remove(&window);
        state
            .ime_output
            .retain(|event| !matches!(event, DisplayEvent::Ime { window: w, .. } if *w == window));
        Ok(())
    }

    fn map_window(&self, window: Window) -> Result<()> {
        let mut state = self.state();
        let record = state
            .windows
            .get_mut(&window)
            .ok_or_else(|| Error::Failure(format!("map_window: BadWindow 0x{window:x}")))?;
        if record.mapped {
            return Ok(());
        }
        record.mapped = true;
        let (width, height) = (record.width, record.height);
        state.events.push_back(NativeEvent::MapNotify(MapNotifyEvent {
            response_type: xproto::MAP_NOTIFY_EVENT,
            sequence: 0,
            event: window,
            window,
            override_redirect: false,
        }));
        state.events.push_back(NativeEvent::Expose(ExposeEvent {
            response_type: xproto::EXPOSE_EVENT,
            sequence: 0,
            window,
            x: 0,
            y: 0,
            width,
            height,
            count: 0,
        }));
        drop(state);
        self.shared.ready.notify_all();
        Ok(())
    }

    fn unmap_window(&self, window: Window) -> Result<()> {
        let mut state = self.state();
        let record = state
            .windows
            .get_mut(&window)
            .ok_or_else(|| Error::Failure(format!("unmap_window: BadWindow 0x{window:x}")))?;
        if !record.mapped {
            return Ok(());
        }
        record.mapped = false;
        state
            .events
            .push_back(NativeEvent::UnmapNotify(UnmapNotifyEvent {
                response_type: xproto::UNMAP_NOTIFY_EVENT,
                sequence: 0,
                event: window,
                window,
                from_configure: false,
            }));
        Ok(())
    }

    fn change_property(
        &self,
        window: Window,
        property: Atom,
        type_: Atom,
        format: u8,
        data: &[u8],
    ) -> Result<()> {
        let mut state = self.state();
        if !state.windows.contains_key(&window) {
            return Err(Error::Failure(format!(
                "change_property: BadWindow 0x{window:x}"
            )));
        }
        state.properties.insert(
            (window, property),
            Property {
                type_,
                format,
                value: data.to_vec(),
            },
        );
        Ok(())
    }

    fn get_property(
        &self,
        window: Window,
        property: Atom,
        delete: bool,
    ) -> Result<Option<Property>> {
        let mut state = self.state();
        let key = (window, property);
        if delete {
            Ok(state.properties.remove(&key))
        } else {
            Ok(state.properties.get(&key).cloned())
        }
    }

    fn set_selection_owner(&self, window: Window, selection: Atom) -> Result<()> {
        let mut state = self.state();
        if state.refuse_selection_ownership {
            return Ok(());
        }
        if let Some(SelectionOwner::Local(previous)) = state.selections.get(&selection).cloned()
            && previous != window
        {
            state.push_selection_clear(previous, selection);
        }
        if window == NONE {
            state.selections.remove(&selection);
        } else {
            state
                .selections
                .insert(selection, SelectionOwner::Local(window));
        }
        Ok(())
    }

    fn selection_owner(&self, selection: Atom) -> Result<Window> {
        // A foreign owner's window is not ours; report a window id we never allocate.
        Ok(match self.state().selections.get(&selection) {
            Some(SelectionOwner::Local(window)) => *window,
            Some(SelectionOwner::Foreign(_)) => 1,
            None => NONE,
        })
    }

    fn convert_selection(
        &self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
    ) -> Result<()> {
        let mut state = self.state();
        match state.selections.get(&selection).cloned() {
            None => state.push_selection_notify(requestor, selection, target, NONE),
            Some(SelectionOwner::Local(owner)) => {
                state
                    .events
                    .push_back(NativeEvent::SelectionRequest(SelectionRequestEvent {
                        response_type: xproto::SELECTION_REQUEST_EVENT,
                        sequence: 0,
                        time: x11rb::CURRENT_TIME,
                        owner,
                        requestor,
                        selection,
                        target,
                        property,
                    }));
            }
            Some(SelectionOwner::Foreign(foreign)) if foreign.silent => {}
            Some(SelectionOwner::Foreign(foreign)) => {
                let targets = state.intern("TARGETS");
                let reply = if target == targets {
                    let mut atoms = vec![targets];
                    atoms.extend(foreign.formats.iter().map(|(atom, _)| *atom));
                    Some(Property {
                        type_: AtomEnum::ATOM.into(),
                        format: 32,
                        value: encode_u32s(&atoms),
                    })
                } else {
                    foreign
                        .formats
                        .iter()
                        .find(|(atom, _)| *atom == target)
                        .map(|(atom, data)| Property {
                            type_: *atom,
                            format: 8,
                            value: data.clone(),
                        })
                };
                match reply {
                    Some(prop) => {
                        state.properties.insert((requestor, property), prop);
                        state.push_selection_notify(requestor, selection, target, property);
                    }
                    None => state.push_selection_notify(requestor, selection, target, NONE),
                }
            }
        }
        drop(state);
        self.shared.ready.notify_all();
        Ok(())
    }

    fn send_selection_notify(
        &self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
    ) -> Result<()> {
        self.state()
            .push_selection_notify(requestor, selection, target, property);
        self.shared.ready.notify_all();
        Ok(())
    }

    fn send_client_message(&self, window: Window, type_: Atom, data: [u32; 5]) -> Result<()> {
        self.push_event(NativeEvent::ClientMessage(ClientMessageEvent::new(
            32, window, type_, data,
        )));
        Ok(())
    }

    fn send_wm_message(&self, window: Window, type_: Atom, data: [u32; 5]) -> Result<()> {
        let mut state = self.state();
        if !state.windows.contains_key(&window) {
            return Err(Error::Failure(format!("send_event: BadWindow 0x{window:x}")));
        }
        if state.atom_names.get(&type_).map(String::as_str) == Some("_NET_WM_STATE") {
            state.apply_wm_state_request(window, data);
        }
        drop(state);
        self.shared.ready.notify_all();
        Ok(())
    }

    fn create_alarm(&self, _interval: Duration) -> Result<Alarm> {
        let mut state = self.state();
        if !state.alarms_supported {
            return Err(Error::Failure("SYNC extension not available".into()));
        }
        let alarm = state.alloc_xid();
        state.alarms.insert(alarm);
        Ok(alarm)
    }

    fn destroy_alarm(&self, alarm: Alarm) -> Result<()> {
        let mut state = self.state();
        if !state.alarms.remove(&alarm) {
            return Err(Error::Failure(format!("destroy_alarm: BadAlarm 0x{alarm:x}")));
        }
        // A destroyed alarm never fires again, queued notifications included.
        state.events.retain(
            |event| !matches!(event, NativeEvent::SyncAlarmNotify(e) if e.alarm == alarm),
        );
        Ok(())
    }

    fn keysym(&self, keycode: u8, shifted: bool) -> Keysym {
        self.state().keysym(keycode, shifted)
    }

    fn create_input_context(&self, window: Window) -> Result<()> {
        let mut state = self.state();
        if !state.windows.contains_key(&window) {
            return Err(Error::Failure(format!("create_ic: BadWindow 0x{window:x}")));
        }
        state.input_contexts.insert(window, Vec::new());
        Ok(())
    }

    fn destroy_input_context(&self, window: Window) {
        self.state().input_contexts.remove(&window);
    }

    fn poll_event(&self) -> Result<Option<DisplayEvent>> {
        let mut state = self.state();
        loop {
            if let Some(update) = state.ime_output.pop_front() {
                return Ok(Some(update));
            }
            let Some(event) = state.events.pop_front() else {
                return Ok(None);
            };
            if let NativeEvent::KeyPress(key) = &event
                && state.compose(key)
            {
                continue;
            }
            return Ok(Some(DisplayEvent::Native(event)));
        }
    }

    fn wait_for_event(&self, timeout: Option<Duration>) -> Result<()> {
        let state = self.state();
        if !state.idle() {
            return Ok(());
        }
        match timeout {
            Some(timeout) => {
                let (_guard, _timed_out) = self
                    .shared
                    .ready
                    .wait_timeout_while(state, timeout, |s| s.idle())
                    .unwrap_or_else(PoisonError::into_inner);
            }
            None => {
                drop(
                    self.shared
                        .ready
                        .wait_while(state, |s| s.idle())
                        .unwrap_or_else(PoisonError::into_inner),
                );
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn wake_signal(&self, window: Window, type_: Atom) -> Arc<dyn WakeSignal> {
        Arc::new(HeadlessWake {
            shared: Arc::clone(&self.shared),
            window,
            type_,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn next_native(display: &HeadlessDisplay) -> Option<NativeEvent> {
        match display.poll_event().unwrap() {
            Some(DisplayEvent::Native(event)) => Some(event),
            None => None,
            other => panic!("expected a native event, got {other:?}"),
        }
    }

    fn next_ime(display: &HeadlessDisplay) -> (Window, ImeUpdate) {
        match display.poll_event().unwrap() {
            Some(DisplayEvent::Ime { window, update }) => (window, update),
            other => panic!("expected an input method update, got {other:?}"),
        }
    }

    fn view_window(display: &HeadlessDisplay) -> Window {
        display
            .create_window(&WindowParams {
                x: 0,
                y: 0,
                width: 100,
                height: 100,
                visual: None,
                hidden: false,
            })
            .unwrap()
    }

    #[test]
    fn foreign_owner_answers_targets_and_data() {
        let display = HeadlessDisplay::new();
        let window = display.create_window(&WindowParams::hidden()).unwrap();
        let clipboard = display.atom("CLIPBOARD");
        let targets = display.atom("TARGETS");
        let utf8 = display.atom("UTF8_STRING");
        let prop = display.atom("XFER");
        display.claim_selection_foreign("CLIPBOARD", &[("UTF8_STRING", b"hi".as_slice())]);

        display
            .convert_selection(window, clipboard, targets, prop)
            .unwrap();
        let Some(NativeEvent::SelectionNotify(n)) = next_native(&display) else {
            panic!("expected SelectionNotify");
        };
        assert_eq!(n.property, prop);
        let list = display.get_property(window, prop, true).unwrap().unwrap();
        assert_eq!(list.atoms(), vec![targets, utf8]);

        display.convert_selection(window, clipboard, utf8, prop).unwrap();
        next_native(&display);
        let data = display.get_property(window, prop, true).unwrap().unwrap();
        assert_eq!(data.value, b"hi");
    }

    #[test]
    fn conversion_without_owner_is_refused() {
        let display = HeadlessDisplay::new();
        let window = display.create_window(&WindowParams::hidden()).unwrap();
        let clipboard = display.atom("CLIPBOARD");
        display.convert_selection(window, clipboard, 5, 6).unwrap();
        let Some(NativeEvent::SelectionNotify(n)) = next_native(&display) else {
            panic!("expected SelectionNotify");
        };
        assert_eq!(n.property, NONE);
    }

    #[test]
    fn new_local_owner_clears_previous() {
        let display = HeadlessDisplay::new();
        let a = display.create_window(&WindowParams::hidden()).unwrap();
        let b = display.create_window(&WindowParams::hidden()).unwrap();
        let clipboard = display.atom("CLIPBOARD");
        display.set_selection_owner(a, clipboard).unwrap();
        display.set_selection_owner(b, clipboard).unwrap();
        let Some(NativeEvent::SelectionClear(clear)) = next_native(&display) else {
            panic!("expected SelectionClear");
        };
        assert_eq!(clear.owner, a);
        assert_eq!(display.selection_owner(clipboard).unwrap(), b);
    }

    #[test]
    fn destroyed_alarm_notifications_are_dropped() {
        let display = HeadlessDisplay::new();
        let alarm = display.create_alarm(Duration::from_millis(10)).unwrap();
        display.fire_alarm(alarm);
        display.destroy_alarm(alarm).unwrap();
        assert_eq!(display.pending_events(), 0);
        assert!(display.destroy_alarm(alarm).is_err());
    }

    #[test]
    fn wake_signal_unblocks_waiter() {
        let display = HeadlessDisplay::new();
        let signal = display.wake_signal(7, 8);
        let handle = std::thread::spawn(move || signal.wake());
        display.wait_for_event(Some(Duration::from_secs(5))).unwrap();
        handle.join().unwrap().unwrap();
        assert_eq!(display.pending_events(), 1);
    }

    #[test]
    fn timed_wait_returns_and_releases_the_lock() {
        let display = HeadlessDisplay::new();
        display.wait_for_event(Some(Duration::from_millis(10))).unwrap();
        display.fire_alarm(3);
        assert_eq!(display.pending_events(), 1);
        display.wait_for_event(Some(Duration::from_secs(5))).unwrap();
    }

    #[test]
    fn unbounded_wait_wakes_on_push() {
        let display = HeadlessDisplay::new();
        let pusher = display.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            pusher.fire_alarm(9);
        });
        display.wait_for_event(None).unwrap();
        handle.join().unwrap();
        assert!(matches!(
            next_native(&display),
            Some(NativeEvent::SyncAlarmNotify(e)) if e.alarm == 9
        ));
    }

    #[test]
    fn input_method_composes_sequences() {
        let display = HeadlessDisplay::new();
        let window = view_window(&display);
        display.map_key(20, 0x27, 0x22);
        display.map_key(26, 0x65, 0x45);
        display.add_compose_sequence(&[0x27, 0x65], "é");
        display.create_input_context(window).unwrap();

        display.key(window, 20, true, 1, 0);
        display.key(window, 20, false, 2, 0);
        display.key(window, 26, true, 3, 0);
        assert_eq!(
            next_ime(&display),
            (
                window,
                ImeUpdate::Preedit {
                    text: "'".into(),
                    cursor: Some(1)
                }
            )
        );
        // Releases are not filtered.
        assert!(matches!(next_native(&display), Some(NativeEvent::KeyRelease(_))));
        assert_eq!(
            next_ime(&display).1,
            ImeUpdate::Preedit {
                text: String::new(),
                cursor: None
            }
        );
        assert_eq!(next_ime(&display).1, ImeUpdate::Commit("é".into()));
        assert!(next_native(&display).is_none());
    }

    #[test]
    fn broken_sequence_passes_key_through() {
        let display = HeadlessDisplay::new();
        let window = view_window(&display);
        display.map_key(20, 0x27, 0x22);
        display.map_key(27, 0x72, 0x52);
        display.add_compose_sequence(&[0x27, 0x65], "é");
        display.create_input_context(window).unwrap();

        display.key(window, 20, true, 1, 0);
        display.key(window, 27, true, 2, 0);
        assert!(matches!(next_ime(&display).1, ImeUpdate::Preedit { .. }));
        assert_eq!(
            next_ime(&display).1,
            ImeUpdate::Preedit {
                text: String::new(),
                cursor: None
            }
        );
        assert!(matches!(
            next_native(&display),
            Some(NativeEvent::KeyPress(k)) if k.detail == 27
        ));
    }

    #[test]
    fn keys_pass_unfiltered_without_input_context() {
        let display = HeadlessDisplay::new();
        let window = view_window(&display);
        display.map_key(20, 0x27, 0x22);
        display.add_compose_sequence(&[0x27, 0x65], "é");
        display.key(window, 20, true, 1, 0);
        assert!(matches!(next_native(&display), Some(NativeEvent::KeyPress(_))));
        assert!(!display.has_input_context(window));
    }

    #[test]
    fn window_manager_applies_state_requests() {
        let display = HeadlessDisplay::new();
        let window = view_window(&display);
        let net_wm_state = display.atom("_NET_WM_STATE");
        let attention = display.atom("_NET_WM_STATE_DEMANDS_ATTENTION");

        display
            .send_wm_message(window, net_wm_state, [1, attention, 0, 1, 0])
            .unwrap();
        let Some(NativeEvent::PropertyNotify(notify)) = next_native(&display) else {
            panic!("expected PropertyNotify");
        };
        assert_eq!((notify.window, notify.atom), (window, net_wm_state));
        let states = display.property(window, "_NET_WM_STATE").unwrap();
        assert_eq!(states.atoms(), vec![attention]);

        display
            .send_wm_message(window, net_wm_state, [2, attention, 0, 1, 0])
            .unwrap();
        next_native(&display);
        let states = display.property(window, "_NET_WM_STATE").unwrap();
        assert!(states.atoms().is_empty());
    }
}
