//! World: one display connection and every view on it.
//!
//! The world owns the native display, the atom table, the timer
//! registry and the views. All view operations go through it by
//! [`ViewId`]. [`World::update`] runs one bounded dispatch pass:
//!
//! 1. Snapshot the events queued right now, waiting first if none are
//!    (the wait is capped by the nearest clipboard deadline). A snapshot
//!    holds at most [`WorldConfig::max_events_per_pass`] events; the
//!    rest wait for the next pass.
//! 2. Translate and route each one. Configure and expose only fill the
//!    view's coalescing slots.
//! 3. Fail expired clipboard requests, then flush every view's
//!    configure and expose.
//!
//! Events produced while the pass runs, including those caused by the
//! sinks, wait for the next pass.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use x11rb::protocol::xproto::KeyPressEvent;

use crate::atoms::Atoms;
use crate::clipboard::Clipboard;
use crate::dispatch::{self, Translated};
use crate::event::{Event, Rect, ViewState};
use crate::hints::{HintKey, HintValue, SizeHint};
use crate::platform::x11::X11Display;
use crate::platform::{
    self, DisplayEvent, ImeUpdate, NativeDisplay, NativeEvent, WakeSignal, Window, WindowParams,
    encode_u32s,
};
use crate::surface::{Surface, SurfaceInfo};
use crate::timer::TimerRegistry;
use crate::view::{EventSink, View, ViewId};
use crate::{Error, Result};

/// Default time a clipboard request may wait for the owner.
pub const DEFAULT_CLIPBOARD_TIMEOUT: Duration = Duration::from_secs(2);

/// Default bound on the events one dispatch pass takes.
pub const DEFAULT_MAX_EVENTS_PER_PASS: usize = 1024;

/// `_NET_WM_STATE` client message action adding a state.
const NET_WM_STATE_ADD: u32 = 1;

/// World construction options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldConfig {
    /// `WM_CLASS` of every view.
    pub class_name: String,
    /// X display name; `None` uses `$DISPLAY`.
    pub display: Option<String>,
    pub clipboard_timeout: Duration,
    /// Bound on the events one [`World::update`] pass takes, so a
    /// flood of events cannot keep a pass from finishing.
    pub max_events_per_pass: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            class_name: "portview".to_string(),
            display: None,
            clipboard_timeout: DEFAULT_CLIPBOARD_TIMEOUT,
            max_events_per_pass: DEFAULT_MAX_EVENTS_PER_PASS,
        }
    }
}

/// Wakes a world blocked in [`World::update`] from any thread.
#[derive(Clone)]
pub struct Waker {
    signal: Arc<dyn WakeSignal>,
}

impl Waker {
    pub fn wake(&self) -> Result<()> {
        self.signal.wake()
    }
}

impl fmt::Debug for Waker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waker").finish_non_exhaustive()
    }
}

pub struct World {
    display: Box<dyn NativeDisplay>,
    atoms: Atoms,
    config: WorldConfig,
    /// Hidden window that receives wake-ups.
    event_window: Window,
    views: BTreeMap<ViewId, View>,
    windows: HashMap<Window, ViewId>,
    timers: TimerRegistry,
    next_view: u64,
    dispatching: bool,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("config", &self.config)
            .field("event_window", &self.event_window)
            .field("views", &self.views)
            .field("timers", &self.timers)
            .field("dispatching", &self.dispatching)
            .finish_non_exhaustive()
    }
}

impl World {
    /// Connect to an X server.
    pub fn connect(config: WorldConfig) -> Result<Self> {
        let name = config.display.as_deref().filter(|name| !name.is_empty());
        let display = X11Display::connect(name)?;
        Self::with_display(Box::new(display), config)
    }

    /// Build a world on an already open display.
    pub fn with_display(display: Box<dyn NativeDisplay>, config: WorldConfig) -> Result<Self> {
        let atoms = Atoms::intern(&*display)?;
        let event_window = display.create_window(&WindowParams::hidden())?;
        display.flush()?;

        tracing::info!(
            event_window,
            class = %config.class_name,
            "world created"
        );

        Ok(Self {
            display,
            atoms,
            config,
            event_window,
            views: BTreeMap::new(),
            windows: HashMap::new(),
            timers: TimerRegistry::new(),
            next_view: 1,
            dispatching: false,
        })
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn atoms(&self) -> &Atoms {
        &self.atoms
    }

    pub fn display(&self) -> &dyn NativeDisplay {
        &*self.display
    }

    /// Create an unrealized view delivering its events to `sink`.
    pub fn create_view(&mut self, sink: impl EventSink + 'static) -> ViewId {
        let id = ViewId::from_raw(self.next_view);
        self.next_view += 1;
        self.views.insert(id, View::new(Box::new(sink)));
        tracing::debug!(view = %id, "view created");
        id
    }

    /// Attach a rendering surface. Only before realization.
    pub fn set_surface(&mut self, id: ViewId, surface: impl Surface + 'static) -> Result<()> {
        let view = self.view_mut(id)?;
        if view.is_realized() {
            return Err(Error::BadParameter(format!(
                "{id}: surface cannot change after realization"
            )));
        }
        view.surface = Box::new(surface);
        Ok(())
    }

    pub fn views(&self) -> impl Iterator<Item = ViewId> + '_ {
        self.views.keys().copied()
    }

    pub fn is_realized(&self, id: ViewId) -> bool {
        self.views.get(&id).is_some_and(View::is_realized)
    }

    pub fn is_visible(&self, id: ViewId) -> bool {
        self.views.get(&id).is_some_and(|v| v.visible)
    }

    /// Native window of a realized view.
    pub fn native_window(&self, id: ViewId) -> Option<Window> {
        self.views.get(&id).and_then(|v| v.window)
    }

    /// Last configured frame.
    pub fn frame(&self, id: ViewId) -> Result<Rect> {
        Ok(self.view(id)?.frame)
    }

    /// Window manager state as last delivered in [`Event::StateChanged`].
    pub fn view_state(&self, id: ViewId) -> Result<ViewState> {
        Ok(self.view(id)?.state)
    }

    // ---- hints ----

    pub fn set_hint(&mut self, id: ViewId, key: HintKey, value: HintValue) -> Result<()> {
        self.view_mut(id)?.hints.set(key, value)
    }

    /// Requested value before realization, resolved value after.
    pub fn hint(&self, id: ViewId, key: HintKey) -> Result<HintValue> {
        Ok(self.view(id)?.hints.get(key))
    }

    pub fn set_size_hint(
        &mut self,
        id: ViewId,
        which: SizeHint,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let view = self.view_mut(id)?;
        view.sizes.set(which, width, height)?;
        let Some(window) = view.window else {
            return Ok(());
        };
        let hints = view
            .sizes
            .to_wm_normal_hints(view.hints.flag(HintKey::Resizable));
        self.display.change_property(
            window,
            self.atoms.wm_normal_hints,
            self.atoms.wm_size_hints,
            32,
            &encode_u32s(&hints),
        )?;
        self.display.flush()
    }

    pub fn size_hint(&self, id: ViewId, which: SizeHint) -> Result<Option<(u32, u32)>> {
        Ok(self.view(id)?.sizes.get(which))
    }

    pub fn set_title(&mut self, id: ViewId, title: &str) -> Result<()> {
        let view = self.view_mut(id)?;
        view.title = title.to_string();
        if let Some(window) = view.window {
            self.publish_title(window, title)?;
            self.display.flush()?;
        }
        Ok(())
    }

    pub fn title(&self, id: ViewId) -> Result<&str> {
        Ok(&self.view(id)?.title)
    }

    fn publish_title(&self, window: Window, title: &str) -> Result<()> {
        self.display.change_property(
            window,
            self.atoms.wm_name,
            self.atoms.string,
            8,
            title.as_bytes(),
        )?;
        self.display.change_property(
            window,
            self.atoms.net_wm_name,
            self.atoms.utf8_string,
            8,
            title.as_bytes(),
        )
    }

    // ---- lifecycle ----

    /// Resolve hints, create the native window and the surface.
    ///
    /// Delivers [`Event::Realize`] on success. On failure the view stays
    /// unrealized with its hints unresolved.
    pub fn realize(&mut self, id: ViewId) -> Result<()> {
        let configs = self.display.framebuffer_configs();
        let rates = self.display.refresh_rates();

        let view = self.view_mut(id)?;
        if view.is_realized() {
            return Err(Error::BadParameter(format!("{id} is already realized")));
        }
        let config = view.hints.resolve(&configs, &rates)?;
        let (width, height) = view.sizes.resolve_default();
        let normal_hints = view
            .sizes
            .to_wm_normal_hints(view.hints.flag(HintKey::Resizable));
        let title = view.title.clone();

        let params = WindowParams {
            x: 0,
            y: 0,
            width: u16::try_from(width).unwrap_or(u16::MAX),
            height: u16::try_from(height).unwrap_or(u16::MAX),
            visual: Some((config.depth, config.visual_id)),
            hidden: false,
        };
        let created = self.display.create_window(&params).and_then(|window| {
            match self.publish_window_properties(window, &normal_hints, &title) {
                Ok(()) => Ok(window),
                Err(e) => {
                    self.destroy_native_window(window);
                    Err(e)
                }
            }
        });
        let window = match created {
            Ok(window) => window,
            Err(e) => {
                if let Some(view) = self.views.get_mut(&id) {
                    view.hints.clear_resolved();
                }
                return Err(e);
            }
        };

        let info = SurfaceInfo {
            window,
            width,
            height,
            config,
        };
        let view = self.view_mut(id)?;
        if let Err(e) = view.surface.create(&info) {
            view.hints.clear_resolved();
            self.destroy_native_window(window);
            return Err(e);
        }
        view.window = Some(window);
        view.config = Some(config);
        view.frame = Rect::new(0, 0, width, height);
        self.windows.insert(window, id);
        if let Err(e) = self.display.create_input_context(window) {
            tracing::warn!(view = %id, window, error = %e, "no input context, composing text from keysyms");
        }
        self.display.flush()?;

        tracing::info!(
            view = %id,
            window,
            visual = config.visual_id,
            width,
            height,
            "view realized"
        );
        self.deliver(id, Event::Realize);
        Ok(())
    }

    fn publish_window_properties(
        &self,
        window: Window,
        normal_hints: &[u32; 18],
        title: &str,
    ) -> Result<()> {
        let atoms = &self.atoms;
        self.display.change_property(
            window,
            atoms.wm_protocols,
            atoms.atom,
            32,
            &encode_u32s(&[atoms.wm_delete_window]),
        )?;
        self.display.change_property(
            window,
            atoms.wm_normal_hints,
            atoms.wm_size_hints,
            32,
            &encode_u32s(normal_hints),
        )?;
        let class = format!("{0}\0{0}\0", self.config.class_name);
        self.display
            .change_property(window, atoms.wm_class, atoms.string, 8, class.as_bytes())?;
        if !title.is_empty() {
            self.publish_title(window, title)?;
        }
        Ok(())
    }

    fn destroy_native_window(&self, window: Window) {
        if let Err(e) = self.display.destroy_window(window) {
            tracing::warn!(window, error = %e, "failed to destroy window");
        }
    }

    /// Tear down the native window, keeping the view and its requested
    /// hints. Delivers [`Event::Unrealize`] first.
    pub fn unrealize(&mut self, id: ViewId) -> Result<()> {
        if !self.view(id)?.is_realized() {
            return Err(Error::BadParameter(format!("{id} is not realized")));
        }
        self.teardown(id)
    }

    /// Unrealize if needed and forget the view.
    pub fn destroy_view(&mut self, id: ViewId) -> Result<()> {
        self.view(id)?;
        let result = self.teardown(id);
        self.views.remove(&id);
        tracing::debug!(view = %id, "view destroyed");
        result
    }

    fn teardown(&mut self, id: ViewId) -> Result<()> {
        // Alarms go before the window so nothing fires for a dead view.
        for timer in self.timers.remove_view(id) {
            if let Err(e) = self.display.destroy_alarm(timer.alarm) {
                tracing::warn!(view = %id, timer = timer.id, error = %e, "failed to destroy alarm");
            }
        }

        if !self.is_realized(id) {
            return Ok(());
        }
        self.deliver(id, Event::Unrealize);

        // The sink may have torn the view down itself.
        let Some(view) = self.views.get_mut(&id) else {
            return Ok(());
        };
        let Some(window) = view.window.take() else {
            return Ok(());
        };
        view.surface.destroy();
        view.clipboard.reset();
        view.config = None;
        view.pending_configure = None;
        view.pending_expose = None;
        view.visible = false;
        view.state = ViewState::empty();
        view.hints.clear_resolved();
        self.windows.remove(&window);

        self.display.destroy_input_context(window);
        self.display.destroy_window(window)?;
        self.display.flush()?;
        tracing::info!(view = %id, window, "view unrealized");
        Ok(())
    }

    /// Map the window, realizing the view first if needed.
    pub fn show(&mut self, id: ViewId) -> Result<()> {
        if !self.view(id)?.is_realized() {
            self.realize(id)?;
        }
        let window = self.realized_window(id)?;
        self.display.map_window(window)?;
        self.view_mut(id)?.visible = true;
        self.display.flush()
    }

    pub fn hide(&mut self, id: ViewId) -> Result<()> {
        let Some(window) = self.view(id)?.window else {
            return Ok(());
        };
        self.display.unmap_window(window)?;
        self.view_mut(id)?.visible = false;
        self.display.flush()
    }

    /// Ask the window manager to flag the view as needing attention.
    /// The flag shows up as [`ViewState::DEMANDS_ATTENTION`] once the
    /// window manager applies it.
    pub fn request_attention(&mut self, id: ViewId) -> Result<()> {
        let window = self.realized_window(id)?;
        self.display.send_wm_message(
            window,
            self.atoms.net_wm_state,
            [
                NET_WM_STATE_ADD,
                self.atoms.net_wm_state_demands_attention,
                0,
                1,
                0,
            ],
        )?;
        self.display.flush()
    }

    // ---- timers ----

    /// Start (or restart) timer `timer` on a realized view.
    ///
    /// Restarting replaces the old alarm only once the new one exists;
    /// if creation fails the old timer keeps running.
    pub fn start_timer(&mut self, id: ViewId, timer: usize, interval: Duration) -> Result<()> {
        self.realized_window(id)?;
        if interval.is_zero() {
            return Err(Error::BadParameter("timer interval must be non-zero".into()));
        }
        let alarm = self.display.create_alarm(interval)?;
        if let Some(old) = self.timers.insert(id, timer, alarm)
            && let Err(e) = self.display.destroy_alarm(old.alarm)
        {
            tracing::warn!(view = %id, timer, error = %e, "failed to destroy replaced alarm");
        }
        tracing::debug!(view = %id, timer, alarm, ?interval, "timer started");
        self.display.flush()
    }

    /// Stop a timer. Unknown ids are not an error.
    pub fn stop_timer(&mut self, id: ViewId, timer: usize) -> Result<()> {
        let Some(removed) = self.timers.remove(id, timer) else {
            return Ok(());
        };
        self.display.destroy_alarm(removed.alarm)?;
        tracing::debug!(view = %id, timer, "timer stopped");
        self.display.flush()
    }

    // ---- clipboard ----

    /// Offer `data` as `mime` on the clipboard.
    pub fn set_clipboard(&mut self, id: ViewId, mime: &str, data: &[u8]) -> Result<()> {
        let window = self.realized_window(id)?;
        let display = &*self.display;
        let atoms = &self.atoms;
        let view = self
            .views
            .get_mut(&id)
            .ok_or_else(|| Error::BadParameter(format!("unknown {id}")))?;
        view.clipboard.offer(display, atoms, window, mime, data)?;
        display.flush()
    }

    /// Declare a custom format this view prefers when pasting.
    pub fn register_clipboard_format(&mut self, id: ViewId, mime: &str) -> Result<()> {
        let display = &*self.display;
        let view = self
            .views
            .get_mut(&id)
            .ok_or_else(|| Error::BadParameter(format!("unknown {id}")))?;
        view.clipboard.register_format(display, mime)
    }

    /// Ask for the clipboard contents. The answer arrives as
    /// [`Event::ClipboardData`] or [`Event::ClipboardFailed`].
    pub fn request_clipboard(&mut self, id: ViewId) -> Result<()> {
        let window = self.realized_window(id)?;
        let timeout = self.config.clipboard_timeout;
        let display = &*self.display;
        let atoms = &self.atoms;
        let view = self
            .views
            .get_mut(&id)
            .ok_or_else(|| Error::BadParameter(format!("unknown {id}")))?;
        view.clipboard.request(display, atoms, window, timeout)?;
        display.flush()
    }

    pub fn clipboard(&self, id: ViewId) -> Result<&Clipboard> {
        Ok(&self.view(id)?.clipboard)
    }

    // ---- messages ----

    pub fn waker(&self) -> Waker {
        Waker {
            signal: self
                .display
                .wake_signal(self.event_window, self.atoms.client_msg),
        }
    }

    /// Send [`Event::Client`] to a realized view through the server.
    pub fn post_client_event(&mut self, id: ViewId, data1: u32, data2: u32) -> Result<()> {
        let window = self.realized_window(id)?;
        self.display
            .send_client_message(window, self.atoms.client_msg, [data1, data2, 0, 0, 0])?;
        self.display.flush()
    }

    // ---- dispatch ----

    /// Run one dispatch pass.
    ///
    /// `Some(Duration::ZERO)` only polls, `Some(t)` waits up to `t` for
    /// the first event, `None` waits indefinitely. Returns
    /// [`Error::Busy`] when called from an event sink.
    pub fn update(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.dispatching {
            return Err(Error::Busy);
        }
        self.display.flush()?;

        let mut snapshot = self.drain_events()?;
        if snapshot.is_empty() {
            let budget = self.wait_budget(timeout);
            if budget != Some(Duration::ZERO) {
                self.display.wait_for_event(budget)?;
                snapshot = self.drain_events()?;
            }
        }

        self.dispatching = true;
        self.dispatch_pass(snapshot);
        self.dispatching = false;

        self.display.flush()
    }

    fn drain_events(&self) -> Result<Vec<DisplayEvent>> {
        let limit = self.config.max_events_per_pass.max(1);
        let mut events = Vec::new();
        while events.len() < limit {
            let Some(event) = self.display.poll_event()? else {
                break;
            };
            events.push(event);
        }
        if events.len() == limit {
            tracing::debug!(limit, "event snapshot full, rest waits for the next pass");
        }
        Ok(events)
    }

    /// `timeout`, shortened to the nearest clipboard deadline.
    fn wait_budget(&self, timeout: Option<Duration>) -> Option<Duration> {
        let now = Instant::now();
        let deadline = self
            .views
            .values()
            .filter_map(|v| v.clipboard.deadline())
            .min()
            .map(|d| d.saturating_duration_since(now));
        match (timeout, deadline) {
            (Some(t), Some(d)) => Some(t.min(d)),
            (t, d) => t.or(d),
        }
    }

    fn dispatch_pass(&mut self, snapshot: Vec<DisplayEvent>) {
        tracing::trace!(events = snapshot.len(), "dispatch pass");
        let mut events = snapshot.into_iter().peekable();
        while let Some(event) = events.next() {
            match event {
                DisplayEvent::Native(event) => {
                    let next = events.peek().and_then(DisplayEvent::native);
                    if self.handle_event(&event, next) {
                        events.next();
                    }
                }
                DisplayEvent::Ime { window, update } => self.handle_ime(window, update),
            }
        }

        let now = Instant::now();
        let ids: Vec<ViewId> = self.views.keys().copied().collect();
        for &id in &ids {
            let failed = self
                .views
                .get_mut(&id)
                .and_then(|v| v.clipboard.check_timeout(now));
            if let Some(event) = failed {
                self.deliver(id, event);
            }
        }
        for id in ids {
            self.flush_pending(id);
        }
    }

    /// Route one event. Returns `true` if it also consumed `next`.
    fn handle_event(&mut self, event: &NativeEvent, next: Option<&NativeEvent>) -> bool {
        let translated = dispatch::translate(&self.atoms, event);

        if let Translated::Alarm(alarm) = translated {
            match self.timers.lookup(alarm).copied() {
                Some(timer) => self.deliver(timer.view, Event::Timer { id: timer.id }),
                None => tracing::debug!(alarm, "discarding notification for unknown alarm"),
            }
            return false;
        }

        let Some(window) = platform::event_window(event) else {
            return false;
        };
        let Some(&id) = self.windows.get(&window) else {
            if window != self.event_window {
                tracing::trace!(window, "discarding event for unknown window");
            }
            return false;
        };

        match translated {
            Translated::Deliver(event) => self.deliver(id, event),
            Translated::Configure(frame) => {
                if let Some(view) = self.views.get_mut(&id) {
                    view.queue_configure(frame);
                }
            }
            Translated::Expose(area) => {
                if let Some(view) = self.views.get_mut(&id) {
                    view.queue_expose(area);
                }
            }
            Translated::Key { event, pressed } => {
                return self.handle_key(id, &event, pressed, next);
            }
            Translated::SelectionRequest(request) => {
                if let Some(view) = self.views.get(&id) {
                    view.clipboard
                        .handle_selection_request(&*self.display, &self.atoms, &request);
                }
            }
            Translated::SelectionClear(clear) => {
                let lost = self
                    .views
                    .get_mut(&id)
                    .and_then(|v| v.clipboard.handle_selection_clear(&self.atoms, &clear));
                if let Some(event) = lost {
                    self.deliver(id, event);
                }
            }
            Translated::SelectionNotify(notify) => {
                let display = &*self.display;
                let atoms = &self.atoms;
                let result = self.views.get_mut(&id).and_then(|v| {
                    v.clipboard
                        .handle_selection_notify(display, atoms, window, &notify)
                });
                if let Some(event) = result {
                    self.deliver(id, event);
                }
            }
            Translated::WmState => self.refresh_state(id, window),
            Translated::Alarm(_) | Translated::Ignore => {}
        }
        false
    }

    fn handle_ime(&mut self, window: Window, update: ImeUpdate) {
        match self.windows.get(&window) {
            Some(&id) => self.deliver(id, dispatch::ime_event(update)),
            None => tracing::trace!(window, "discarding input method update for unknown window"),
        }
    }

    /// Re-read `_NET_WM_STATE` and deliver a change. Bursts of property
    /// changes read the same final value, so only one event goes out.
    fn refresh_state(&mut self, id: ViewId, window: Window) {
        let states = match self
            .display
            .get_property(window, self.atoms.net_wm_state, false)
        {
            Ok(property) => property.map(|p| p.atoms()).unwrap_or_default(),
            Err(e) => {
                tracing::warn!(view = %id, window, error = %e, "failed to read _NET_WM_STATE");
                return;
            }
        };
        let state = dispatch::view_state(&self.atoms, &states);
        let Some(view) = self.views.get_mut(&id) else {
            return;
        };
        if view.state == state {
            return;
        }
        view.state = state;
        tracing::debug!(view = %id, ?state, "window manager state changed");
        self.deliver(id, Event::StateChanged { state });
    }

    fn handle_key(
        &mut self,
        id: ViewId,
        key: &KeyPressEvent,
        pressed: bool,
        next: Option<&NativeEvent>,
    ) -> bool {
        if !pressed && let Some(press) = dispatch::repeat_press(key, next) {
            let ignore = self
                .views
                .get(&id)
                .is_some_and(|v| v.hints.flag(HintKey::IgnoreKeyRepeat));
            if !ignore {
                for event in dispatch::key_events(&*self.display, &press, true, true) {
                    self.deliver(id, event);
                }
            }
            return true;
        }

        for event in dispatch::key_events(&*self.display, key, pressed, false) {
            self.deliver(id, event);
        }
        false
    }

    /// Deliver the coalesced configure, then the coalesced expose.
    fn flush_pending(&mut self, id: ViewId) {
        let Some(view) = self.views.get_mut(&id) else {
            return;
        };
        if let Some(frame) = view.pending_configure.take() {
            let resized = (frame.width, frame.height) != (view.frame.width, view.frame.height);
            view.frame = frame;
            if resized {
                view.surface.resize(frame.width, frame.height);
            }
            self.deliver(id, Event::Configure { frame });
        }

        let Some(view) = self.views.get_mut(&id) else {
            return;
        };
        if let Some(area) = view.pending_expose.take() {
            self.deliver(id, Event::Expose { area });
        }
    }

    /// Hand `event` to the view's sink.
    ///
    /// The sink is taken out of the view for the call so it can borrow
    /// the world mutably. Events for a view whose sink is already running
    /// are dropped.
    fn deliver(&mut self, id: ViewId, event: Event) {
        let Some(mut sink) = self.views.get_mut(&id).and_then(|v| v.sink.take()) else {
            tracing::debug!(view = %id, ?event, "dropping event, sink unavailable");
            return;
        };
        let outer = std::mem::replace(&mut self.dispatching, true);
        sink.on_event(self, id, &event);
        self.dispatching = outer;
        if let Some(view) = self.views.get_mut(&id) {
            view.sink = Some(sink);
        }
    }

    // ---- lookup ----

    fn view(&self, id: ViewId) -> Result<&View> {
        self.views
            .get(&id)
            .ok_or_else(|| Error::BadParameter(format!("unknown {id}")))
    }

    fn view_mut(&mut self, id: ViewId) -> Result<&mut View> {
        self.views
            .get_mut(&id)
            .ok_or_else(|| Error::BadParameter(format!("unknown {id}")))
    }

    fn realized_window(&self, id: ViewId) -> Result<Window> {
        self.view(id)?
            .window
            .ok_or_else(|| Error::BadParameter(format!("{id} is not realized")))
    }
}

impl Drop for World {
    fn drop(&mut self) {
        let ids: Vec<ViewId> = self.views.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.destroy_view(id) {
                tracing::warn!(view = %id, error = %e, "failed to destroy view");
            }
        }
        self.destroy_native_window(self.event_window);
        if let Err(e) = self.display.flush() {
            tracing::warn!(error = %e, "flush on close failed");
        }
        tracing::debug!("world closed");
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::clipboard::{OfferState, RequestState};
    use crate::keys::Key;
    use crate::platform::headless::HeadlessDisplay;
    use crate::test_support::init_tracing;

    type Log = Rc<RefCell<Vec<(ViewId, Event)>>>;

    fn world_with(config: WorldConfig) -> (World, HeadlessDisplay) {
        init_tracing();
        let display = HeadlessDisplay::new();
        let world = World::with_display(Box::new(display.clone()), config).unwrap();
        (world, display)
    }

    fn world() -> (World, HeadlessDisplay) {
        world_with(WorldConfig::default())
    }

    fn recorder(log: &Log) -> impl FnMut(&mut World, ViewId, &Event) + 'static {
        let log = Rc::clone(log);
        move |_: &mut World, view: ViewId, event: &Event| {
            log.borrow_mut().push((view, event.clone()));
        }
    }

    fn recorded_view(world: &mut World) -> (ViewId, Log) {
        let log = Log::default();
        let view = world.create_view(recorder(&log));
        (view, log)
    }

    fn events(log: &Log) -> Vec<Event> {
        log.borrow_mut().drain(..).map(|(_, e)| e).collect()
    }

    fn poll(world: &mut World) {
        world.update(Some(Duration::ZERO)).unwrap();
    }

    #[test]
    fn requested_default_size_is_kept() {
        let (mut world, display) = world();
        let (view, log) = recorded_view(&mut world);
        world
            .set_size_hint(view, SizeHint::Default, 512, 512)
            .unwrap();
        world.realize(view).unwrap();

        assert_eq!(
            world.size_hint(view, SizeHint::Default).unwrap(),
            Some((512, 512))
        );
        assert_eq!(world.frame(view).unwrap(), Rect::new(0, 0, 512, 512));
        assert_eq!(events(&log), vec![Event::Realize]);

        let window = world.native_window(view).unwrap();
        let hints = display.property(window, "WM_NORMAL_HINTS").unwrap();
        let words: Vec<u32> = hints
            .value
            .chunks_exact(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!((words[3], words[4]), (512, 512));
    }

    #[test]
    fn unset_default_size_falls_back() {
        let (mut world, _display) = world();
        let (view, _log) = recorded_view(&mut world);
        world.set_size_hint(view, SizeHint::Min, 800, 600).unwrap();
        world.realize(view).unwrap();
        assert_eq!(
            world.size_hint(view, SizeHint::Default).unwrap(),
            Some((800, 600))
        );
    }

    #[test]
    fn dont_care_hints_resolve_on_realize() {
        let (mut world, _display) = world();
        let (view, _log) = recorded_view(&mut world);
        world
            .set_hint(view, HintKey::RedBits, HintValue::DontCare)
            .unwrap();
        assert_eq!(
            world.hint(view, HintKey::RedBits).unwrap(),
            HintValue::DontCare
        );

        world.realize(view).unwrap();
        for key in HintKey::ALL {
            assert!(
                !world.hint(view, key).unwrap().is_dont_care(),
                "{key:?} still DontCare"
            );
        }
        assert_eq!(
            world.hint(view, HintKey::RedBits).unwrap(),
            HintValue::Value(8)
        );
        assert_eq!(
            world.hint(view, HintKey::RefreshRate).unwrap(),
            HintValue::Value(60)
        );
    }

    #[test]
    fn dont_care_rejected_where_unsupported() {
        let (mut world, _display) = world();
        let (view, _log) = recorded_view(&mut world);
        world
            .set_hint(view, HintKey::Resizable, HintValue::Value(1))
            .unwrap();
        let err = world
            .set_hint(view, HintKey::Resizable, HintValue::DontCare)
            .unwrap_err();
        assert!(matches!(err, Error::BadParameter(_)));
        assert_eq!(
            world.hint(view, HintKey::Resizable).unwrap(),
            HintValue::Value(1)
        );
    }

    #[test]
    fn hints_freeze_after_realize() {
        let (mut world, _display) = world();
        let (view, _log) = recorded_view(&mut world);
        world.realize(view).unwrap();
        let err = world
            .set_hint(view, HintKey::AlphaBits, HintValue::Value(8))
            .unwrap_err();
        assert!(matches!(err, Error::BadParameter(_)));
    }

    #[test]
    fn alpha_request_picks_alpha_visual() {
        let (mut world, _display) = world();
        let (view, _log) = recorded_view(&mut world);
        world
            .set_hint(view, HintKey::AlphaBits, HintValue::Value(8))
            .unwrap();
        world.realize(view).unwrap();
        assert_eq!(
            world.hint(view, HintKey::AlphaBits).unwrap(),
            HintValue::Value(8)
        );
    }

    #[test]
    fn realize_without_configs_is_unsupported() {
        let (mut world, display) = world();
        display.set_framebuffer_configs(Vec::new());
        let (view, log) = recorded_view(&mut world);
        let err = world.realize(view).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert!(!world.is_realized(view));
        assert_eq!(
            world.hint(view, HintKey::RedBits).unwrap(),
            HintValue::Value(8)
        );
        assert!(events(&log).is_empty());
    }

    struct RecordingSurface(Rc<RefCell<Vec<String>>>);

    impl Surface for RecordingSurface {
        fn create(&mut self, info: &SurfaceInfo) -> Result<()> {
            self.0
                .borrow_mut()
                .push(format!("create {}x{}", info.width, info.height));
            Ok(())
        }

        fn resize(&mut self, width: u32, height: u32) {
            self.0.borrow_mut().push(format!("resize {width}x{height}"));
        }

        fn destroy(&mut self) {
            self.0.borrow_mut().push("destroy".to_string());
        }
    }

    struct FailingSurface;

    impl Surface for FailingSurface {
        fn create(&mut self, _info: &SurfaceInfo) -> Result<()> {
            Err(Error::Unsupported("no GPU".into()))
        }

        fn resize(&mut self, _width: u32, _height: u32) {}

        fn destroy(&mut self) {}
    }

    #[test]
    fn surface_follows_lifecycle() {
        let (mut world, display) = world();
        let (view, log) = recorded_view(&mut world);
        let calls = Rc::new(RefCell::new(Vec::new()));
        world
            .set_surface(view, RecordingSurface(Rc::clone(&calls)))
            .unwrap();
        world.realize(view).unwrap();
        let window = world.native_window(view).unwrap();

        display.configure(window, 0, 0, 300, 200);
        poll(&mut world);
        world.unrealize(view).unwrap();

        assert_eq!(
            *calls.borrow(),
            vec!["create 640x480", "resize 300x200", "destroy"]
        );
        assert_eq!(
            events(&log),
            vec![
                Event::Realize,
                Event::Configure {
                    frame: Rect::new(0, 0, 300, 200)
                },
                Event::Unrealize,
            ]
        );
        assert!(!display.window_exists(window));
        assert!(!world.is_realized(view));
    }

    #[test]
    fn surface_failure_aborts_realize() {
        let (mut world, _display) = world();
        let (view, log) = recorded_view(&mut world);
        world.set_surface(view, FailingSurface).unwrap();
        let err = world.realize(view).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert!(!world.is_realized(view));
        assert!(events(&log).is_empty());
    }

    #[test]
    fn title_is_published() {
        let (mut world, display) = world();
        let (view, _log) = recorded_view(&mut world);
        world.set_title(view, "Grüße").unwrap();
        world.realize(view).unwrap();
        let window = world.native_window(view).unwrap();
        let net = display.property(window, "_NET_WM_NAME").unwrap();
        assert_eq!(net.value, "Grüße".as_bytes());
        assert_eq!(net.type_, world.atoms().utf8_string);

        world.set_title(view, "Two").unwrap();
        assert_eq!(display.property(window, "WM_NAME").unwrap().value, b"Two");
    }

    #[test]
    fn show_realizes_and_maps() {
        let (mut world, display) = world();
        let (view, log) = recorded_view(&mut world);
        world.show(view).unwrap();
        let window = world.native_window(view).unwrap();
        assert!(display.is_mapped(window));
        assert!(world.is_visible(view));

        poll(&mut world);
        assert_eq!(
            events(&log),
            vec![
                Event::Realize,
                Event::Map,
                Event::Expose {
                    area: Rect::new(0, 0, 640, 480)
                },
            ]
        );

        world.hide(view).unwrap();
        poll(&mut world);
        assert_eq!(events(&log), vec![Event::Unmap]);
        assert!(!world.is_visible(view));
    }

    #[test]
    fn configure_burst_coalesces() {
        let (mut world, display) = world();
        let (view, log) = recorded_view(&mut world);
        world.realize(view).unwrap();
        events(&log);
        let window = world.native_window(view).unwrap();

        display.configure(window, 0, 0, 100, 100);
        display.configure(window, 10, 20, 300, 200);
        poll(&mut world);

        assert_eq!(
            events(&log),
            vec![Event::Configure {
                frame: Rect::new(10, 20, 300, 200)
            }]
        );
        assert_eq!(world.frame(view).unwrap(), Rect::new(10, 20, 300, 200));
    }

    #[test]
    fn expose_burst_merges_after_configure() {
        let (mut world, display) = world();
        let (view, log) = recorded_view(&mut world);
        world.realize(view).unwrap();
        events(&log);
        let window = world.native_window(view).unwrap();

        display.expose(window, 0, 0, 10, 10);
        display.expose(window, 90, 40, 10, 10);
        display.configure(window, 0, 0, 200, 100);
        poll(&mut world);

        assert_eq!(
            events(&log),
            vec![
                Event::Configure {
                    frame: Rect::new(0, 0, 200, 100)
                },
                Event::Expose {
                    area: Rect::new(0, 0, 100, 50)
                },
            ]
        );
    }

    #[test]
    fn update_from_sink_is_busy() {
        let (mut world, display) = world();
        let results = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&results);
        let view = world.create_view(move |world: &mut World, _: ViewId, event: &Event| {
            if *event == Event::Close {
                seen.borrow_mut().push(world.update(Some(Duration::ZERO)));
            }
        });
        world.realize(view).unwrap();
        display.request_close(world.native_window(view).unwrap());
        poll(&mut world);

        assert_eq!(*results.borrow(), vec![Err(Error::Busy)]);
        // The guard is released once the pass ends.
        poll(&mut world);
    }

    #[test]
    fn close_request_delivers_close() {
        let (mut world, display) = world();
        let (view, log) = recorded_view(&mut world);
        world.realize(view).unwrap();
        events(&log);
        display.request_close(world.native_window(view).unwrap());
        poll(&mut world);
        assert_eq!(events(&log), vec![Event::Close]);
    }

    #[test]
    fn events_raised_during_pass_wait_for_next_pass() {
        let (mut world, display) = world();
        let log = Log::default();
        let mut record = recorder(&log);
        let view = world.create_view(move |world: &mut World, view: ViewId, event: &Event| {
            record(world, view, event);
            if *event == Event::Close {
                world.post_client_event(view, 1, 2).unwrap();
            }
        });
        world.realize(view).unwrap();
        events(&log);

        display.request_close(world.native_window(view).unwrap());
        poll(&mut world);
        assert_eq!(events(&log), vec![Event::Close]);

        poll(&mut world);
        assert_eq!(events(&log), vec![Event::Client { data1: 1, data2: 2 }]);
    }

    #[test]
    fn events_for_unknown_windows_are_dropped() {
        let (mut world, display) = world();
        let (view, log) = recorded_view(&mut world);
        world.realize(view).unwrap();
        events(&log);
        display.request_close(0x7777);
        poll(&mut world);
        assert!(events(&log).is_empty());
        assert_eq!(display.pending_events(), 0);
    }

    #[test]
    fn key_repeat_pair_collapses() {
        let (mut world, display) = world();
        display.map_key(38, 'a' as u32, 'A' as u32);
        let (view, log) = recorded_view(&mut world);
        world.realize(view).unwrap();
        events(&log);
        let window = world.native_window(view).unwrap();

        display.key(window, 38, true, 100, 0);
        display.key(window, 38, false, 130, 0);
        display.key(window, 38, true, 130, 0);
        display.key(window, 38, false, 160, 0);
        poll(&mut world);

        let key = |pressed, repeat| Event::Key {
            pressed,
            keycode: 38,
            key: Key::Character('a'),
            modifiers: crate::Modifiers::empty(),
            repeat,
        };
        assert_eq!(
            events(&log),
            vec![
                key(true, false),
                Event::Text { character: 'a' },
                key(true, true),
                Event::Text { character: 'a' },
                key(false, false),
            ]
        );
    }

    #[test]
    fn key_repeat_ignored_when_hinted() {
        let (mut world, display) = world();
        display.map_key(38, 'a' as u32, 'A' as u32);
        let (view, log) = recorded_view(&mut world);
        world
            .set_hint(view, HintKey::IgnoreKeyRepeat, HintValue::Value(1))
            .unwrap();
        world.realize(view).unwrap();
        events(&log);
        let window = world.native_window(view).unwrap();

        display.key(window, 38, false, 130, 0);
        display.key(window, 38, true, 130, 0);
        poll(&mut world);
        assert!(events(&log).is_empty());
    }

    #[test]
    fn timer_fires_until_stopped() {
        let (mut world, display) = world();
        let (view, log) = recorded_view(&mut world);
        world.realize(view).unwrap();
        events(&log);

        world
            .start_timer(view, 4, Duration::from_millis(10))
            .unwrap();
        let alarms = display.live_alarms();
        assert_eq!(alarms.len(), 1);
        display.fire_alarm(alarms[0]);
        display.fire_alarm(alarms[0]);
        poll(&mut world);
        assert_eq!(
            events(&log),
            vec![Event::Timer { id: 4 }, Event::Timer { id: 4 }]
        );

        world.stop_timer(view, 4).unwrap();
        assert!(display.live_alarms().is_empty());
    }

    #[test]
    fn stopping_unknown_timer_is_ok() {
        let (mut world, _display) = world();
        let (view, _log) = recorded_view(&mut world);
        world.realize(view).unwrap();
        assert_eq!(world.stop_timer(view, 99), Ok(()));
    }

    #[test]
    fn restarting_timer_replaces_alarm() {
        let (mut world, display) = world();
        let (view, _log) = recorded_view(&mut world);
        world.realize(view).unwrap();
        world.start_timer(view, 1, Duration::from_millis(10)).unwrap();
        let first = display.live_alarms();
        world.start_timer(view, 1, Duration::from_millis(20)).unwrap();
        let second = display.live_alarms();
        assert_eq!(second.len(), 1);
        assert_ne!(first, second);
    }

    #[test]
    fn failed_restart_keeps_old_timer() {
        let (mut world, display) = world();
        let (view, log) = recorded_view(&mut world);
        world.realize(view).unwrap();
        events(&log);
        world.start_timer(view, 1, Duration::from_millis(10)).unwrap();
        let alarm = display.live_alarms()[0];

        display.set_alarms_supported(false);
        let err = world
            .start_timer(view, 1, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, Error::Failure(_)));
        assert_eq!(display.live_alarms(), vec![alarm]);

        display.fire_alarm(alarm);
        poll(&mut world);
        assert_eq!(events(&log), vec![Event::Timer { id: 1 }]);
    }

    #[test]
    fn timer_rejects_bad_parameters() {
        let (mut world, _display) = world();
        let (view, _log) = recorded_view(&mut world);
        assert!(matches!(
            world.start_timer(view, 1, Duration::from_millis(10)),
            Err(Error::BadParameter(_))
        ));
        world.realize(view).unwrap();
        assert!(matches!(
            world.start_timer(view, 1, Duration::ZERO),
            Err(Error::BadParameter(_))
        ));
    }

    #[test]
    fn destroyed_view_gets_no_timer_events() {
        let (mut world, display) = world();
        let (view, log) = recorded_view(&mut world);
        world.realize(view).unwrap();
        world.start_timer(view, 1, Duration::from_millis(10)).unwrap();
        let alarm = display.live_alarms()[0];
        display.fire_alarm(alarm);

        world.destroy_view(view).unwrap();
        assert!(display.live_alarms().is_empty());

        // A late notification for the dead alarm is discarded.
        display.fire_alarm(alarm);
        poll(&mut world);
        assert_eq!(events(&log), vec![Event::Realize, Event::Unrealize]);
        assert!(world.views().next().is_none());
    }

    #[test]
    fn clipboard_loss_returns_to_idle() {
        let (mut world, display) = world();
        let (view, log) = recorded_view(&mut world);
        world.realize(view).unwrap();
        events(&log);

        world.set_clipboard(view, "text/plain", b"copied").unwrap();
        assert_eq!(
            world.clipboard(view).unwrap().offer_state(),
            OfferState::Owned
        );

        display.claim_selection_foreign("CLIPBOARD", &[("UTF8_STRING", b"theirs".as_slice())]);
        poll(&mut world);

        assert_eq!(events(&log), vec![Event::ClipboardLost]);
        let clipboard = world.clipboard(view).unwrap();
        assert_eq!(clipboard.offer_state(), OfferState::Idle);
        assert!(clipboard.offered_data().is_none());
        assert!(clipboard.offered_formats().is_empty());
    }

    #[test]
    fn copy_paste_between_views() {
        let (mut world, display) = world();
        let (source, _source_log) = recorded_view(&mut world);
        let (target, target_log) = recorded_view(&mut world);
        world.realize(source).unwrap();
        world.realize(target).unwrap();
        events(&target_log);

        world
            .set_clipboard(source, "application/x-notes", b"\x00rich\xff")
            .unwrap();
        assert_eq!(
            display.local_selection_owner("CLIPBOARD"),
            world.native_window(source).unwrap()
        );
        world
            .register_clipboard_format(target, "application/x-notes")
            .unwrap();
        world.request_clipboard(target).unwrap();
        assert_eq!(
            world.clipboard(target).unwrap().request_state(),
            RequestState::Targets
        );

        // Two round trips, each needing a pass on both ends.
        for _ in 0..4 {
            poll(&mut world);
        }

        assert_eq!(
            events(&target_log),
            vec![Event::ClipboardData {
                mime: "application/x-notes".into(),
                data: b"\x00rich\xff".to_vec(),
            }]
        );
        assert_eq!(
            world.clipboard(target).unwrap().request_state(),
            RequestState::Idle
        );
        assert_eq!(
            world.clipboard(source).unwrap().offer_state(),
            OfferState::Owned
        );
    }

    #[test]
    fn request_without_owner_fails() {
        let (mut world, _display) = world();
        let (view, log) = recorded_view(&mut world);
        world.realize(view).unwrap();
        events(&log);

        world.request_clipboard(view).unwrap();
        poll(&mut world);
        assert_eq!(events(&log), vec![Event::ClipboardFailed]);
        assert_eq!(
            world.clipboard(view).unwrap().request_state(),
            RequestState::Idle
        );
    }

    #[test]
    fn unanswered_request_times_out() {
        let (mut world, display) = world_with(WorldConfig {
            clipboard_timeout: Duration::from_millis(20),
            ..WorldConfig::default()
        });
        let (view, log) = recorded_view(&mut world);
        world.realize(view).unwrap();
        events(&log);
        display.claim_selection_unresponsive("CLIPBOARD");

        world.request_clipboard(view).unwrap();
        let started = Instant::now();
        let mut delivered = Vec::new();
        while delivered.is_empty() && started.elapsed() < Duration::from_secs(5) {
            // The wait is capped by the deadline, not by this timeout.
            world.update(Some(Duration::from_secs(10))).unwrap();
            delivered = events(&log);
        }
        assert_eq!(delivered, vec![Event::ClipboardFailed]);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(
            world.clipboard(view).unwrap().request_state(),
            RequestState::Idle
        );
    }

    #[test]
    fn waker_unblocks_update() {
        let (mut world, _display) = world();
        let (view, log) = recorded_view(&mut world);
        world.realize(view).unwrap();
        events(&log);

        let waker = world.waker();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            waker.wake()
        });
        world.update(None).unwrap();
        handle.join().unwrap().unwrap();
        assert!(events(&log).is_empty());
    }

    #[test]
    fn sink_can_drive_world_operations() {
        let (mut world, display) = world();
        let view = world.create_view(|world: &mut World, view: ViewId, event: &Event| {
            if *event == Event::Realize {
                world
                    .start_timer(view, 7, Duration::from_millis(5))
                    .unwrap();
            }
        });
        world.realize(view).unwrap();
        assert_eq!(display.live_alarms().len(), 1);
    }

    #[test]
    fn drop_destroys_every_window() {
        let (mut world, display) = world();
        let (a, _log_a) = recorded_view(&mut world);
        let (b, log_b) = recorded_view(&mut world);
        world.realize(a).unwrap();
        world.realize(b).unwrap();
        world.start_timer(b, 1, Duration::from_millis(10)).unwrap();
        let windows = [world.native_window(a).unwrap(), world.native_window(b).unwrap()];
        events(&log_b);

        drop(world);
        for window in windows {
            assert!(!display.window_exists(window));
        }
        assert!(display.live_alarms().is_empty());
        assert_eq!(events(&log_b), vec![Event::Unrealize]);
    }

    #[test]
    fn extreme_channel_request_still_realizes() {
        let (mut world, _display) = world();
        let (view, log) = recorded_view(&mut world);
        for key in [HintKey::RedBits, HintKey::DepthBits, HintKey::Samples] {
            world
                .set_hint(view, key, HintValue::Value(i32::MAX))
                .unwrap();
        }
        world.realize(view).unwrap();
        assert_eq!(events(&log), vec![Event::Realize]);
    }

    #[test]
    fn event_flood_is_split_across_passes() {
        let (mut world, display) = world_with(WorldConfig {
            max_events_per_pass: 2,
            ..WorldConfig::default()
        });
        let (view, log) = recorded_view(&mut world);
        world.realize(view).unwrap();
        events(&log);
        let window = world.native_window(view).unwrap();
        for _ in 0..5 {
            display.request_close(window);
        }

        poll(&mut world);
        assert_eq!(events(&log), vec![Event::Close; 2]);
        assert_eq!(display.pending_events(), 3);
        poll(&mut world);
        poll(&mut world);
        assert_eq!(events(&log), vec![Event::Close; 3]);
        assert_eq!(display.pending_events(), 0);
    }

    #[test]
    fn input_context_follows_realization() {
        let (mut world, display) = world();
        let (view, _log) = recorded_view(&mut world);
        world.realize(view).unwrap();
        let window = world.native_window(view).unwrap();
        assert!(display.has_input_context(window));

        world.unrealize(view).unwrap();
        assert!(!display.has_input_context(window));
    }

    #[test]
    fn input_method_composes_text() {
        let (mut world, display) = world();
        display.map_key(20, 0x27, 0x22);
        display.map_key(26, 0x65, 0x45);
        display.add_compose_sequence(&[0x27, 0x65], "é");
        let (view, log) = recorded_view(&mut world);
        world.realize(view).unwrap();
        events(&log);
        let window = world.native_window(view).unwrap();

        display.key(window, 20, true, 1, 0);
        display.key(window, 26, true, 2, 0);
        poll(&mut world);

        assert_eq!(
            events(&log),
            vec![
                Event::ImePreedit {
                    text: "'".into(),
                    cursor: Some(1)
                },
                Event::ImePreedit {
                    text: String::new(),
                    cursor: None
                },
                Event::ImeCommit { text: "é".into() },
            ]
        );
    }

    #[test]
    fn keys_outside_a_sequence_fall_back_to_keysym_text() {
        let (mut world, display) = world();
        display.map_key(20, 0x27, 0x22);
        display.map_key(38, 'a' as u32, 'A' as u32);
        display.add_compose_sequence(&[0x27, 0x65], "é");
        let (view, log) = recorded_view(&mut world);
        world.realize(view).unwrap();
        events(&log);
        let window = world.native_window(view).unwrap();

        display.key(window, 38, true, 1, 0);
        poll(&mut world);
        let delivered = events(&log);
        assert!(delivered.contains(&Event::Text { character: 'a' }));
        assert!(
            !delivered
                .iter()
                .any(|e| matches!(e, Event::ImePreedit { .. } | Event::ImeCommit { .. }))
        );
    }

    #[test]
    fn hidden_state_is_reported_once_per_change() {
        let (mut world, display) = world();
        let (view, log) = recorded_view(&mut world);
        world.realize(view).unwrap();
        events(&log);
        let window = world.native_window(view).unwrap();

        display.set_wm_state(window, &["_NET_WM_STATE_HIDDEN"]);
        display.set_wm_state(window, &["_NET_WM_STATE_HIDDEN"]);
        poll(&mut world);
        assert_eq!(
            events(&log),
            vec![Event::StateChanged {
                state: ViewState::HIDDEN
            }]
        );
        assert_eq!(world.view_state(view).unwrap(), ViewState::HIDDEN);

        display.set_wm_state(window, &[]);
        poll(&mut world);
        assert_eq!(
            events(&log),
            vec![Event::StateChanged {
                state: ViewState::empty()
            }]
        );
    }

    #[test]
    fn attention_request_reaches_window_manager() {
        let (mut world, _display) = world();
        let (view, log) = recorded_view(&mut world);
        assert!(matches!(
            world.request_attention(view),
            Err(Error::BadParameter(_))
        ));
        world.realize(view).unwrap();
        events(&log);

        world.request_attention(view).unwrap();
        poll(&mut world);
        assert_eq!(
            events(&log),
            vec![Event::StateChanged {
                state: ViewState::DEMANDS_ATTENTION
            }]
        );
        assert_eq!(
            world.view_state(view).unwrap(),
            ViewState::DEMANDS_ATTENTION
        );
    }

    #[test]
    fn unknown_view_is_bad_parameter() {
        let (mut world, _display) = world();
        let ghost = ViewId::from_raw(999);
        assert!(matches!(world.realize(ghost), Err(Error::BadParameter(_))));
        assert!(matches!(world.destroy_view(ghost), Err(Error::BadParameter(_))));
        assert!(matches!(
            world.hint(ghost, HintKey::Samples),
            Err(Error::BadParameter(_))
        ));
    }
}
