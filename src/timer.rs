//! Timer registry: application timer ids ↔ native alarms.
//!
//! Pure bookkeeping; the world performs the native alarm calls and
//! feeds the results in here. Ids are unique within a world: inserting
//! an id that is already registered hands back the alarm it replaced so
//! the caller can destroy it.

use crate::view::ViewId;

/// Native alarm handle (an X Sync `Alarm` XID).
pub type Alarm = u32;

/// A registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    pub alarm: Alarm,
    pub view: ViewId,
    pub id: usize,
}

#[derive(Debug, Default)]
pub struct TimerRegistry {
    timers: Vec<Timer>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self { timers: Vec::new() }
    }

    /// Register `id` → `alarm` for `view`.
    ///
    /// Returns the previous timer with the same id, whose alarm the
    /// caller must cancel.
    pub fn insert(&mut self, view: ViewId, id: usize, alarm: Alarm) -> Option<Timer> {
        let timer = Timer { alarm, view, id };
        match self.timers.iter_mut().find(|t| t.id == id) {
            Some(slot) => Some(std::mem::replace(slot, timer)),
            None => {
                self.timers.push(timer);
                None
            }
        }
    }

    /// Remove `id` if `view` owns it.
    pub fn remove(&mut self, view: ViewId, id: usize) -> Option<Timer> {
        let pos = self
            .timers
            .iter()
            .position(|t| t.id == id && t.view == view)?;
        Some(self.timers.swap_remove(pos))
    }

    /// Remove every timer owned by `view`.
    pub fn remove_view(&mut self, view: ViewId) -> Vec<Timer> {
        let (removed, kept): (Vec<Timer>, Vec<Timer>) =
            self.timers.drain(..).partition(|t| t.view == view);
        self.timers = kept;
        removed
    }

    /// Reverse-map a fired alarm.
    pub fn lookup(&self, alarm: Alarm) -> Option<&Timer> {
        self.timers.iter().find(|t| t.alarm == alarm)
    }

    pub fn get(&self, id: usize) -> Option<&Timer> {
        self.timers.iter().find(|t| t.id == id)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}
