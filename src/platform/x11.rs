//! X11 display: `x11rb` connection to a real X server.
//!
//! Wraps `x11rb::rust_connection::RustConnection` behind
//! [`NativeDisplay`]. The connection is shared through an `Arc` so the
//! cross-thread wake signal can send client messages without touching
//! world state. Timers use the SYNC extension's `SERVERTIME` counter;
//! refresh rates come from RandR. Both are optional: without SYNC alarm
//! creation fails, without RandR no rates are reported. An XIM server,
//! when `XMODIFIERS` names one, filters key presses on view windows.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use x11rb::connection::Connection;
use x11rb::protocol::randr;
use x11rb::protocol::sync;
use x11rb::protocol::xproto::{
    self, ClientMessageEvent, ColormapAlloc, CreateWindowAux, EventMask, GetPropertyType,
    PropMode, SelectionNotifyEvent, VisualClass, WindowClass,
};
use x11rb::rust_connection::RustConnection;

use super::xim::XimBridge;
use super::{
    Atom, DisplayEvent, Keysym, NativeDisplay, Property, WakeSignal, Window, WindowParams,
};
use crate::hints::FramebufferConfig;
use crate::timer::Alarm;
use crate::{Error, Result};

/// Events every view window listens for.
fn view_event_mask() -> EventMask {
    EventMask::EXPOSURE
        | EventMask::STRUCTURE_NOTIFY
        | EventMask::KEY_PRESS
        | EventMask::KEY_RELEASE
        | EventMask::BUTTON_PRESS
        | EventMask::BUTTON_RELEASE
        | EventMask::POINTER_MOTION
        | EventMask::ENTER_WINDOW
        | EventMask::LEAVE_WINDOW
        | EventMask::FOCUS_CHANGE
        | EventMask::PROPERTY_CHANGE
}

/// Keyboard mapping fetched once at connect.
struct Keymap {
    min_keycode: u8,
    keysyms_per_keycode: usize,
    keysyms: Vec<Keysym>,
}

impl Keymap {
    fn fetch(conn: &RustConnection) -> Result<Self> {
        let setup = conn.setup();
        let min_keycode = setup.min_keycode;
        let count = setup.max_keycode - min_keycode + 1;
        let reply = xproto::get_keyboard_mapping(conn, min_keycode, count)
            .map_err(|e| Error::Failure(format!("get_keyboard_mapping: {e}")))?
            .reply()
            .map_err(|e| Error::Failure(format!("get_keyboard_mapping reply: {e}")))?;
        Ok(Self {
            min_keycode,
            keysyms_per_keycode: reply.keysyms_per_keycode as usize,
            keysyms: reply.keysyms,
        })
    }

    fn lookup(&self, keycode: u8, shifted: bool) -> Keysym {
        if keycode < self.min_keycode || self.keysyms_per_keycode == 0 {
            return 0;
        }
        let base = (keycode - self.min_keycode) as usize * self.keysyms_per_keycode;
        let lower = self.keysyms.get(base).copied().unwrap_or(0);
        if !shifted || self.keysyms_per_keycode < 2 {
            return lower;
        }
        match self.keysyms.get(base + 1).copied().unwrap_or(0) {
            0 => lower,
            upper => upper,
        }
    }
}

/// X11 connection state.
pub struct X11Display {
    conn: Arc<RustConnection>,
    screen_num: usize,
    root: Window,
    root_visual: u32,
    /// `SERVERTIME` system counter, if SYNC is available.
    server_time: Option<sync::Counter>,
    keymap: Keymap,
    /// Colormaps created for windows with a non-default visual.
    colormaps: RefCell<HashMap<Window, xproto::Colormap>>,
    /// `None` without an input method server.
    ime: RefCell<Option<XimBridge>>,
}

impl X11Display {
    /// Connect to `display` (`$DISPLAY` when `None`).
    pub fn connect(display: Option<&str>) -> Result<Self> {
        let (conn, screen_num) = RustConnection::connect(display)
            .map_err(|e| Error::Failure(format!("X11 connect failed: {e}")))?;

        let screen = &conn.setup().roots[screen_num];
        let root = screen.root;
        let root_visual = screen.root_visual;

        let server_time = find_server_time_counter(&conn);
        if server_time.is_none() {
            tracing::warn!("SYNC extension unavailable, timers disabled");
        }

        let keymap = Keymap::fetch(&conn)?;

        tracing::info!(screen = screen_num, root, "connected to X11 display");

        let conn = Arc::new(conn);
        let ime = match XimBridge::connect(Arc::clone(&conn), screen_num) {
            Ok(bridge) => Some(bridge),
            Err(e) => {
                tracing::info!(error = %e, "no input method, composing text from keysyms");
                None
            }
        };

        Ok(Self {
            conn,
            screen_num,
            root,
            root_visual,
            server_time,
            keymap,
            colormaps: RefCell::new(HashMap::new()),
            ime: RefCell::new(ime),
        })
    }

    pub fn screen_num(&self) -> usize {
        self.screen_num
    }
}

/// Initialize SYNC and find the `SERVERTIME` counter.
fn find_server_time_counter(conn: &RustConnection) -> Option<sync::Counter> {
    let version = sync::initialize(conn, 3, 1).ok()?.reply().ok()?;
    tracing::debug!(
        major = version.major_version,
        minor = version.minor_version,
        "SYNC extension initialized"
    );

    let counters = sync::list_system_counters(conn).ok()?.reply().ok()?;
    counters
        .counters
        .iter()
        .find(|c| c.name == b"SERVERTIME")
        .map(|c| c.counter)
}

fn to_int64(value: i64) -> sync::Int64 {
    sync::Int64 {
        hi: (value >> 32) as i32,
        lo: value as u32,
    }
}

impl NativeDisplay for X11Display {
    fn intern_atoms(&self, names: &[&str]) -> Result<Vec<Atom>> {
        // Send every request before waiting on the first reply.
        let cookies = names
            .iter()
            .map(|name| xproto::intern_atom(&*self.conn, false, name.as_bytes()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Failure(format!("intern_atom: {e}")))?;

        cookies
            .into_iter()
            .map(|cookie| {
                cookie
                    .reply()
                    .map(|reply| reply.atom)
                    .map_err(|e| Error::Failure(format!("intern_atom reply: {e}")))
            })
            .collect()
    }

    fn atom_name(&self, atom: Atom) -> Result<String> {
        let reply = xproto::get_atom_name(&*self.conn, atom)
            .map_err(|e| Error::Failure(format!("get_atom_name: {e}")))?
            .reply()
            .map_err(|e| Error::Failure(format!("get_atom_name reply: {e}")))?;
        Ok(String::from_utf8_lossy(&reply.name).into_owned())
    }

    fn framebuffer_configs(&self) -> Vec<FramebufferConfig> {
        let screen = &self.conn.setup().roots[self.screen_num];
        let mut configs = Vec::new();
        for depth in &screen.allowed_depths {
            for visual in &depth.visuals {
                if visual.class != VisualClass::TRUE_COLOR {
                    continue;
                }
                let red_bits = visual.red_mask.count_ones() as i32;
                let green_bits = visual.green_mask.count_ones() as i32;
                let blue_bits = visual.blue_mask.count_ones() as i32;
                let alpha_bits = (i32::from(depth.depth) - red_bits - green_bits - blue_bits).max(0);
                configs.push(FramebufferConfig {
                    visual_id: visual.visual_id,
                    depth: depth.depth,
                    red_bits,
                    green_bits,
                    blue_bits,
                    alpha_bits,
                    // Presentation is double buffered by the surface.
                    double_buffer: true,
                    ..Default::default()
                });
            }
        }
        configs
    }

    fn refresh_rates(&self) -> Vec<u32> {
        let reply = match randr::get_screen_info(&*self.conn, self.root) {
            Ok(cookie) => match cookie.reply() {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::debug!(error = %e, "RandR screen info unavailable");
                    return Vec::new();
                }
            },
            Err(e) => {
                tracing::debug!(error = %e, "RandR unavailable");
                return Vec::new();
            }
        };

        let mut rates = vec![u32::from(reply.rate)];
        if let Some(available) = reply.rates.get(usize::from(reply.size_id)) {
            for &rate in &available.rates {
                let rate = u32::from(rate);
                if rate != 0 && !rates.contains(&rate) {
                    rates.push(rate);
                }
            }
        }
        rates.retain(|&r| r != 0);
        rates
    }

    fn create_window(&self, params: &WindowParams) -> Result<Window> {
        let window = self
            .conn
            .generate_id()
            .map_err(|e| Error::Failure(format!("generate_id: {e}")))?;

        if params.hidden {
            xproto::create_window(
                &*self.conn,
                0,
                window,
                self.root,
                params.x,
                params.y,
                params.width,
                params.height,
                0,
                WindowClass::INPUT_ONLY,
                x11rb::COPY_FROM_PARENT,
                &CreateWindowAux::new().event_mask(EventMask::PROPERTY_CHANGE),
            )
            .map_err(|e| Error::Failure(format!("create_window: {e}")))?;
            return Ok(window);
        }

        let (depth, visual) = params
            .visual
            .unwrap_or((x11rb::COPY_DEPTH_FROM_PARENT, self.root_visual));
        let mut aux = CreateWindowAux::new()
            .event_mask(view_event_mask())
            .background_pixel(0)
            .border_pixel(0);

        if visual != self.root_visual {
            let colormap = self
                .conn
                .generate_id()
                .map_err(|e| Error::Failure(format!("generate_id: {e}")))?;
            xproto::create_colormap(&*self.conn, ColormapAlloc::NONE, colormap, self.root, visual)
                .map_err(|e| Error::Failure(format!("create_colormap: {e}")))?;
            aux = aux.colormap(colormap);
            self.colormaps.borrow_mut().insert(window, colormap);
        }

        xproto::create_window(
            &*self.conn,
            depth,
            window,
            self.root,
            params.x,
            params.y,
            params.width,
            params.height,
            0,
            WindowClass::INPUT_OUTPUT,
            visual,
            &aux,
        )
        .map_err(|e| Error::Failure(format!("create_window: {e}")))?
        .check()
        .map_err(|e| Error::Failure(format!("create_window: {e}")))?;

        Ok(window)
    }

    fn destroy_window(&self, window: Window) -> Result<()> {
        xproto::destroy_window(&*self.conn, window)
            .map_err(|e| Error::Failure(format!("destroy_window: {e}")))?;
        if let Some(colormap) = self.colormaps.borrow_mut().remove(&window) {
            xproto::free_colormap(&*self.conn, colormap)
                .map_err(|e| Error::Failure(format!("free_colormap: {e}")))?;
        }
        Ok(())
    }

    fn map_window(&self, window: Window) -> Result<()> {
        xproto::map_window(&*self.conn, window)
            .map_err(|e| Error::Failure(format!("map_window: {e}")))?;
        Ok(())
    }

    fn unmap_window(&self, window: Window) -> Result<()> {
        xproto::unmap_window(&*self.conn, window)
            .map_err(|e| Error::Failure(format!("unmap_window: {e}")))?;
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
        let unit = usize::from(format / 8).max(1);
        xproto::change_property(
            &*self.conn,
            PropMode::REPLACE,
            window,
            property,
            type_,
            format,
            (data.len() / unit) as u32,
            data,
        )
        .map_err(|e| Error::Failure(format!("change_property: {e}")))?;
        Ok(())
    }

    fn get_property(
        &self,
        window: Window,
        property: Atom,
        delete: bool,
    ) -> Result<Option<Property>> {
        let reply = xproto::get_property(
            &*self.conn,
            delete,
            window,
            property,
            GetPropertyType::ANY,
            0,
            u32::MAX,
        )
        .map_err(|e| Error::Failure(format!("get_property: {e}")))?
        .reply()
        .map_err(|e| Error::Failure(format!("get_property reply: {e}")))?;

        if reply.type_ == x11rb::NONE {
            return Ok(None);
        }
        Ok(Some(Property {
            type_: reply.type_,
            format: reply.format,
            value: reply.value,
        }))
    }

    fn set_selection_owner(&self, window: Window, selection: Atom) -> Result<()> {
        xproto::set_selection_owner(&*self.conn, window, selection, x11rb::CURRENT_TIME)
            .map_err(|e| Error::Failure(format!("set_selection_owner: {e}")))?;
        Ok(())
    }

    fn selection_owner(&self, selection: Atom) -> Result<Window> {
        let reply = xproto::get_selection_owner(&*self.conn, selection)
            .map_err(|e| Error::Failure(format!("get_selection_owner: {e}")))?
            .reply()
            .map_err(|e| Error::Failure(format!("get_selection_owner reply: {e}")))?;
        Ok(reply.owner)
    }

    fn convert_selection(
        &self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
    ) -> Result<()> {
        xproto::convert_selection(
            &*self.conn,
            requestor,
            selection,
            target,
            property,
            x11rb::CURRENT_TIME,
        )
        .map_err(|e| Error::Failure(format!("convert_selection: {e}")))?;
        Ok(())
    }

    fn send_selection_notify(
        &self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
    ) -> Result<()> {
        let event = SelectionNotifyEvent {
            response_type: xproto::SELECTION_NOTIFY_EVENT,
            sequence: 0,
            time: x11rb::CURRENT_TIME,
            requestor,
            selection,
            target,
            property,
        };
        xproto::send_event(&*self.conn, false, requestor, EventMask::NO_EVENT, event)
            .map_err(|e| Error::Failure(format!("send_event SelectionNotify: {e}")))?;
        Ok(())
    }

    fn send_client_message(&self, window: Window, type_: Atom, data: [u32; 5]) -> Result<()> {
        send_client_message(&self.conn, window, type_, data)
    }

    fn send_wm_message(&self, window: Window, type_: Atom, data: [u32; 5]) -> Result<()> {
        let event = ClientMessageEvent::new(32, window, type_, data);
        xproto::send_event(
            &*self.conn,
            false,
            self.root,
            EventMask::SUBSTRUCTURE_REDIRECT | EventMask::SUBSTRUCTURE_NOTIFY,
            event,
        )
        .map_err(|e| Error::Failure(format!("send_event to window manager: {e}")))?;
        Ok(())
    }

    fn create_alarm(&self, interval: Duration) -> Result<Alarm> {
        let counter = self
            .server_time
            .ok_or_else(|| Error::Failure("SYNC extension not available".into()))?;
        let alarm = self
            .conn
            .generate_id()
            .map_err(|e| Error::Failure(format!("generate_id: {e}")))?;

        let millis = to_int64(interval.as_millis().min(i64::MAX as u128) as i64);
        let aux = sync::CreateAlarmAux::new()
            .counter(counter)
            .value_type(sync::VALUETYPE::RELATIVE)
            .value(millis)
            .test_type(sync::TESTTYPE::POSITIVE_COMPARISON)
            .delta(millis)
            .events(1);

        sync::create_alarm(&*self.conn, alarm, &aux)
            .map_err(|e| Error::Failure(format!("sync create_alarm: {e}")))?
            .check()
            .map_err(|e| Error::Failure(format!("sync create_alarm: {e}")))?;

        tracing::debug!(alarm, interval_ms = interval.as_millis() as u64, "alarm created");
        Ok(alarm)
    }

    fn destroy_alarm(&self, alarm: Alarm) -> Result<()> {
        sync::destroy_alarm(&*self.conn, alarm)
            .map_err(|e| Error::Failure(format!("sync destroy_alarm: {e}")))?;
        Ok(())
    }

    fn keysym(&self, keycode: u8, shifted: bool) -> Keysym {
        self.keymap.lookup(keycode, shifted)
    }

    fn create_input_context(&self, window: Window) -> Result<()> {
        match self.ime.borrow_mut().as_mut() {
            Some(bridge) => bridge.create_context(window),
            None => Ok(()),
        }
    }

    fn destroy_input_context(&self, window: Window) {
        if let Some(bridge) = self.ime.borrow_mut().as_mut()
            && let Err(e) = bridge.destroy_context(window)
        {
            tracing::warn!(window, error = %e, "failed to destroy input context");
        }
    }

    fn poll_event(&self) -> Result<Option<DisplayEvent>> {
        let mut ime = self.ime.borrow_mut();
        loop {
            if let Some(output) = ime.as_mut().and_then(XimBridge::next_output) {
                return Ok(Some(output));
            }
            let Some(event) = self.conn.poll_for_event().map_err(|e| {
                tracing::error!(error = %e, "X11 connection error");
                Error::Failure(format!("poll_for_event: {e}"))
            })?
            else {
                return Ok(None);
            };
            if let Some(bridge) = ime.as_mut() {
                match bridge.filter(&event) {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "input method failed, composing text from keysyms");
                        *ime = None;
                    }
                }
            }
            return Ok(Some(DisplayEvent::Native(event)));
        }
    }

    fn wait_for_event(&self, timeout: Option<Duration>) -> Result<()> {
        // SAFETY: the fd belongs to `self.conn`, which outlives this call.
        let fd = unsafe { BorrowedFd::borrow_raw(self.conn.stream().as_raw_fd()) };
        let deadline = timeout.map(|t| Instant::now() + t);
        wait_readable(fd, deadline).map_err(|e| Error::Failure(format!("poll on X11 fd: {e}")))
    }

    fn flush(&self) -> Result<()> {
        self.conn
            .flush()
            .map_err(|e| Error::Failure(format!("flush: {e}")))
    }

    fn wake_signal(&self, window: Window, type_: Atom) -> Arc<dyn WakeSignal> {
        Arc::new(X11Wake {
            conn: Arc::clone(&self.conn),
            window,
            type_,
        })
    }
}

/// Milliseconds to poll for the time left, rounded up and capped at the
/// longest single `poll` wait.
fn poll_chunk(left: Duration) -> u16 {
    u16::try_from(left.as_micros().div_ceil(1000)).unwrap_or(u16::MAX)
}

/// Wait until `fd` is readable or `deadline` passes, polling in chunks
/// for deadlines beyond a single `poll` timeout.
fn wait_readable(fd: BorrowedFd<'_>, deadline: Option<Instant>) -> nix::Result<()> {
    loop {
        let timeout = match deadline {
            None => PollTimeout::NONE,
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Ok(());
                }
                PollTimeout::from(poll_chunk(left))
            }
        };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(0) => {}
            Ok(_) | Err(nix::Error::EINTR) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

fn send_client_message(
    conn: &RustConnection,
    window: Window,
    type_: Atom,
    data: [u32; 5],
) -> Result<()> {
    let event = ClientMessageEvent::new(32, window, type_, data);
    xproto::send_event(conn, false, window, EventMask::NO_EVENT, event)
        .map_err(|e| Error::Failure(format!("send_event ClientMessage: {e}")))?;
    Ok(())
}

/// Sends a client message from any thread. `RustConnection` is
/// `Send + Sync`, so only the connection is shared.
struct X11Wake {
    conn: Arc<RustConnection>,
    window: Window,
    type_: Atom,
}

impl WakeSignal for X11Wake {
    fn wake(&self) -> Result<()> {
        send_client_message(&self.conn, self.window, self.type_, [0; 5])?;
        self.conn
            .flush()
            .map_err(|e| Error::Failure(format!("flush: {e}")))
    }
}
