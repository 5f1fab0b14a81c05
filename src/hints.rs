//! View hints: requested vs. negotiated view capabilities.
//!
//! A [`HintTable`] records what the application asked for and, once the
//! view is realized, what the platform actually provided. Resolution is
//! total: after [`HintTable::resolve`] no entry reports
//! [`HintValue::DontCare`].

use crate::{Error, Result};

/// A negotiable view capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HintKey {
    UseCompatProfile,
    UseDebugContext,
    ContextVersionMajor,
    ContextVersionMinor,
    RedBits,
    GreenBits,
    BlueBits,
    AlphaBits,
    DepthBits,
    StencilBits,
    SampleBuffers,
    Samples,
    DoubleBuffer,
    SwapInterval,
    Resizable,
    IgnoreKeyRepeat,
    RefreshRate,
}

impl HintKey {
    pub const COUNT: usize = 17;

    /// Every key, in table order.
    pub const ALL: [HintKey; Self::COUNT] = [
        HintKey::UseCompatProfile,
        HintKey::UseDebugContext,
        HintKey::ContextVersionMajor,
        HintKey::ContextVersionMinor,
        HintKey::RedBits,
        HintKey::GreenBits,
        HintKey::BlueBits,
        HintKey::AlphaBits,
        HintKey::DepthBits,
        HintKey::StencilBits,
        HintKey::SampleBuffers,
        HintKey::Samples,
        HintKey::DoubleBuffer,
        HintKey::SwapInterval,
        HintKey::Resizable,
        HintKey::IgnoreKeyRepeat,
        HintKey::RefreshRate,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Whether the platform can pick a value when asked for `DontCare`.
    ///
    /// Version numbers, swap interval and on/off toggles have no
    /// meaningful platform default, so the caller must be explicit.
    pub fn supports_dont_care(self) -> bool {
        !matches!(
            self,
            HintKey::UseCompatProfile
                | HintKey::UseDebugContext
                | HintKey::ContextVersionMajor
                | HintKey::ContextVersionMinor
                | HintKey::SwapInterval
                | HintKey::Resizable
                | HintKey::IgnoreKeyRepeat
        )
    }

    /// Whether the hint only takes 0 or 1.
    pub fn is_boolean(self) -> bool {
        matches!(
            self,
            HintKey::UseCompatProfile
                | HintKey::UseDebugContext
                | HintKey::DoubleBuffer
                | HintKey::Resizable
                | HintKey::IgnoreKeyRepeat
        )
    }

    /// Requested value of a fresh view.
    pub fn default_value(self) -> HintValue {
        match self {
            HintKey::ContextVersionMajor => HintValue::Value(2),
            HintKey::RedBits | HintKey::GreenBits | HintKey::BlueBits => HintValue::Value(8),
            HintKey::DoubleBuffer => HintValue::Value(1),
            HintKey::RefreshRate => HintValue::DontCare,
            _ => HintValue::Value(0),
        }
    }

    /// Whether the value is picked by framebuffer config matching.
    fn is_framebuffer(self) -> bool {
        matches!(
            self,
            HintKey::RedBits
                | HintKey::GreenBits
                | HintKey::BlueBits
                | HintKey::AlphaBits
                | HintKey::DepthBits
                | HintKey::StencilBits
                | HintKey::SampleBuffers
                | HintKey::Samples
                | HintKey::DoubleBuffer
        )
    }
}

/// A requested or resolved hint value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintValue {
    /// Let the platform choose.
    DontCare,
    Value(i32),
}

impl HintValue {
    pub fn is_dont_care(self) -> bool {
        matches!(self, HintValue::DontCare)
    }

    fn concrete(self) -> Option<i32> {
        match self {
            HintValue::DontCare => None,
            HintValue::Value(v) => Some(v),
        }
    }
}

/// One framebuffer configuration the display can provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FramebufferConfig {
    /// Native visual id, used as the final tie-breaker.
    pub visual_id: u32,
    /// Window depth to create the native window with.
    pub depth: u8,
    pub red_bits: i32,
    pub green_bits: i32,
    pub blue_bits: i32,
    pub alpha_bits: i32,
    pub depth_bits: i32,
    pub stencil_bits: i32,
    pub sample_buffers: i32,
    pub samples: i32,
    pub double_buffer: bool,
}

impl FramebufferConfig {
    fn value(&self, key: HintKey) -> Option<i32> {
        let v = match key {
            HintKey::RedBits => self.red_bits,
            HintKey::GreenBits => self.green_bits,
            HintKey::BlueBits => self.blue_bits,
            HintKey::AlphaBits => self.alpha_bits,
            HintKey::DepthBits => self.depth_bits,
            HintKey::StencilBits => self.stencil_bits,
            HintKey::SampleBuffers => self.sample_buffers,
            HintKey::Samples => self.samples,
            HintKey::DoubleBuffer => i32::from(self.double_buffer),
            _ => return None,
        };
        Some(v)
    }

    fn color_bits(&self) -> i32 {
        self.red_bits + self.green_bits + self.blue_bits + self.alpha_bits
    }
}

/// Weight of a framebuffer key in the closest-config score.
fn weight(key: HintKey) -> u64 {
    match key {
        HintKey::RedBits | HintKey::GreenBits | HintKey::BlueBits | HintKey::AlphaBits => 4,
        HintKey::DepthBits | HintKey::StencilBits => 2,
        HintKey::DoubleBuffer => 8,
        _ => 1,
    }
}

/// Refresh rate used when the display reports none.
pub const FALLBACK_REFRESH_RATE: i32 = 60;

/// Requested and resolved value of a single hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HintEntry {
    pub requested: HintValue,
    /// `None` until the owning view is realized.
    pub resolved: Option<i32>,
}

/// Per-view hint table.
#[derive(Debug, Clone)]
pub struct HintTable {
    entries: [HintEntry; HintKey::COUNT],
}

impl Default for HintTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HintTable {
    pub fn new() -> Self {
        let mut entries = [HintEntry {
            requested: HintValue::DontCare,
            resolved: None,
        }; HintKey::COUNT];
        for key in HintKey::ALL {
            entries[key.index()].requested = key.default_value();
        }
        Self { entries }
    }

    /// Record a requested value.
    ///
    /// Fails without touching the table if `value` is `DontCare` for a
    /// key that needs an explicit value, if a boolean key gets something
    /// other than 0 or 1, if a value is negative, or if the table has
    /// already been resolved.
    pub fn set(&mut self, key: HintKey, value: HintValue) -> Result<()> {
        if self.is_resolved() {
            return Err(Error::BadParameter(format!(
                "{key:?} cannot change after realization"
            )));
        }
        match value {
            HintValue::DontCare if !key.supports_dont_care() => {
                return Err(Error::BadParameter(format!(
                    "{key:?} does not accept DontCare"
                )));
            }
            HintValue::Value(v) if v < 0 => {
                return Err(Error::BadParameter(format!("{key:?} = {v} is negative")));
            }
            HintValue::Value(v) if key.is_boolean() && v > 1 => {
                return Err(Error::BadParameter(format!("{key:?} = {v} is not 0 or 1")));
            }
            _ => {}
        }
        self.entries[key.index()].requested = value;
        Ok(())
    }

    /// The requested value before resolution, the resolved value after.
    pub fn get(&self, key: HintKey) -> HintValue {
        let entry = &self.entries[key.index()];
        match entry.resolved {
            Some(v) => HintValue::Value(v),
            None => entry.requested,
        }
    }

    pub fn entry(&self, key: HintKey) -> &HintEntry {
        &self.entries[key.index()]
    }

    pub fn is_resolved(&self) -> bool {
        self.entries.iter().all(|e| e.resolved.is_some())
    }

    /// Drop resolved values, e.g. when a view is unrealized.
    pub fn clear_resolved(&mut self) {
        for entry in &mut self.entries {
            entry.resolved = None;
        }
    }

    /// Resolved value as a boolean, falling back to the request.
    pub fn flag(&self, key: HintKey) -> bool {
        matches!(self.get(key), HintValue::Value(v) if v != 0)
    }

    /// Score of `config` against the requested framebuffer keys.
    /// Lower is closer; zero is an exact match. Saturates instead of
    /// overflowing on extreme requests.
    pub fn score(&self, config: &FramebufferConfig) -> u64 {
        HintKey::ALL
            .iter()
            .filter(|key| key.is_framebuffer())
            .filter_map(|&key| {
                let wanted = self.entries[key.index()].requested.concrete()?;
                let got = config.value(key)?;
                Some(weight(key).saturating_mul(u64::from(wanted.abs_diff(got))))
            })
            .fold(0, u64::saturating_add)
    }

    /// Pick the closest framebuffer config.
    ///
    /// Ties go to more total color bits, then to the lower visual id, so
    /// the result does not depend on enumeration order.
    pub fn choose_config<'a>(
        &self,
        configs: &'a [FramebufferConfig],
    ) -> Option<&'a FramebufferConfig> {
        configs.iter().min_by(|a, b| {
            self.score(a)
                .cmp(&self.score(b))
                .then_with(|| b.color_bits().cmp(&a.color_bits()))
                .then_with(|| a.visual_id.cmp(&b.visual_id))
        })
    }

    /// Resolve every entry to a concrete value.
    ///
    /// Returns the chosen framebuffer config. Fails with `Unsupported`
    /// if the display offers no configs at all.
    pub fn resolve(
        &mut self,
        configs: &[FramebufferConfig],
        refresh_rates: &[u32],
    ) -> Result<FramebufferConfig> {
        let chosen = *self
            .choose_config(configs)
            .ok_or_else(|| Error::Unsupported("display offers no framebuffer configs".into()))?;

        let score = self.score(&chosen);
        if score > 0 {
            tracing::warn!(
                visual = chosen.visual_id,
                score,
                "no exact framebuffer match, using closest configuration"
            );
        }

        for key in HintKey::ALL {
            let requested = self.entries[key.index()].requested;
            let resolved = if key.is_framebuffer() {
                chosen.value(key).unwrap_or(0)
            } else if key == HintKey::RefreshRate {
                resolve_refresh_rate(requested, refresh_rates)
            } else {
                // Keys that reject DontCare always hold a concrete request.
                requested
                    .concrete()
                    .or_else(|| key.default_value().concrete())
                    .unwrap_or(0)
            };
            self.entries[key.index()].resolved = Some(resolved);
        }

        Ok(chosen)
    }
}

fn resolve_refresh_rate(requested: HintValue, rates: &[u32]) -> i32 {
    let Some(&current) = rates.first() else {
        return requested.concrete().unwrap_or(FALLBACK_REFRESH_RATE);
    };
    let Some(wanted) = requested.concrete() else {
        return current as i32;
    };

    rates
        .iter()
        .copied()
        .min_by_key(|&rate| ((rate as i32).abs_diff(wanted), rate))
        .map_or(current as i32, |rate| rate as i32)
}

/// Which size constraint a size hint sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeHint {
    /// Initial size of the view.
    Default,
    Min,
    Max,
    /// Exact aspect ratio as width:height.
    FixedAspect,
    MinAspect,
    MaxAspect,
}

impl SizeHint {
    const COUNT: usize = 6;

    fn index(self) -> usize {
        self as usize
    }
}

/// Default size used when the application sets none.
pub const FALLBACK_DEFAULT_SIZE: (u32, u32) = (640, 480);

/// Size constraints of a view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeHints {
    slots: [Option<(u32, u32)>; SizeHint::COUNT],
}

impl SizeHints {
    pub fn set(&mut self, which: SizeHint, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(Error::BadParameter(format!(
                "{which:?} size {width}x{height} has a zero dimension"
            )));
        }
        self.slots[which.index()] = Some((width, height));
        Ok(())
    }

    pub fn get(&self, which: SizeHint) -> Option<(u32, u32)> {
        self.slots[which.index()]
    }

    /// The size a view is created with: the requested default (or the
    /// fallback) clamped into the min/max constraints.
    pub fn resolve_default(&mut self) -> (u32, u32) {
        let (mut w, mut h) = self.get(SizeHint::Default).unwrap_or(FALLBACK_DEFAULT_SIZE);
        if let Some((min_w, min_h)) = self.get(SizeHint::Min) {
            w = w.max(min_w);
            h = h.max(min_h);
        }
        if let Some((max_w, max_h)) = self.get(SizeHint::Max) {
            w = w.min(max_w);
            h = h.min(max_h);
        }
        self.slots[SizeHint::Default.index()] = Some((w, h));
        (w, h)
    }

    /// Encode as an ICCCM `WM_NORMAL_HINTS` (`WM_SIZE_HINTS`) property.
    ///
    /// Non-resizable views pin min and max to the current size.
    pub fn to_wm_normal_hints(&self, resizable: bool) -> [u32; 18] {
        const P_SIZE: u32 = 1 << 3;
        const P_MIN_SIZE: u32 = 1 << 4;
        const P_MAX_SIZE: u32 = 1 << 5;
        const P_ASPECT: u32 = 1 << 7;

        let mut hints = [0u32; 18];
        let size = self.get(SizeHint::Default).unwrap_or(FALLBACK_DEFAULT_SIZE);
        hints[0] |= P_SIZE;
        hints[3] = size.0;
        hints[4] = size.1;

        let (min, max) = if resizable {
            (self.get(SizeHint::Min), self.get(SizeHint::Max))
        } else {
            (Some(size), Some(size))
        };
        if let Some((w, h)) = min {
            hints[0] |= P_MIN_SIZE;
            hints[5] = w;
            hints[6] = h;
        }
        if let Some((w, h)) = max {
            hints[0] |= P_MAX_SIZE;
            hints[7] = w;
            hints[8] = h;
        }

        // A missing bound is left open: the widest ratio WM_SIZE_HINTS can
        // express on that side.
        const OPEN_MIN_ASPECT: (u32, u32) = (1, i32::MAX as u32);
        const OPEN_MAX_ASPECT: (u32, u32) = (i32::MAX as u32, 1);

        let fixed = self.get(SizeHint::FixedAspect);
        let min_aspect = fixed.or(self.get(SizeHint::MinAspect));
        let max_aspect = fixed.or(self.get(SizeHint::MaxAspect));
        if min_aspect.is_some() || max_aspect.is_some() {
            let lo = min_aspect.unwrap_or(OPEN_MIN_ASPECT);
            let hi = max_aspect.unwrap_or(OPEN_MAX_ASPECT);
            hints[0] |= P_ASPECT;
            hints[11] = lo.0;
            hints[12] = lo.1;
            hints[13] = hi.0;
            hints[14] = hi.1;
        }
        hints
    }
}
