//! Surface seam: what the rendering backend sees of a view.
//!
//! The bridge never draws. It tells the surface when the native window
//! exists, when its size changes, and when it goes away.

use crate::Result;
use crate::hints::FramebufferConfig;
use crate::platform::Window;

/// Native window handed to the surface at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceInfo {
    pub window: Window,
    pub width: u32,
    pub height: u32,
    /// Framebuffer config the window was created with.
    pub config: FramebufferConfig,
}

/// A rendering surface attached to a view.
pub trait Surface {
    /// The native window exists. An error aborts realization.
    fn create(&mut self, info: &SurfaceInfo) -> Result<()>;

    /// The window was resized (delivered with the coalesced configure).
    fn resize(&mut self, width: u32, height: u32);

    /// The native window is about to be destroyed.
    fn destroy(&mut self);
}

/// Surface for views that do their own drawing, or none at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSurface;

impl Surface for NullSurface {
    fn create(&mut self, _info: &SurfaceInfo) -> Result<()> {
        Ok(())
    }

    fn resize(&mut self, _width: u32, _height: u32) {}

    fn destroy(&mut self) {}
}
