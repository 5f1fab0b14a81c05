//! portview: X11 event and state bridge for a portable view library.
//!
//! Applications create a [`World`] per display connection, create views
//! inside it, configure their hints, realize them, and then drive
//! [`World::update`] to receive unified [`Event`] values.
//!
//! The native connection sits behind [`platform::NativeDisplay`]:
//! [`platform::x11::X11Display`] talks to a real X server through
//! `x11rb`, [`platform::headless::HeadlessDisplay`] is an in-memory
//! stand-in for headless runs and tests.

pub mod atoms;
pub mod clipboard;
mod dispatch;
pub mod event;
pub mod hints;
pub mod keys;
pub mod platform;
pub mod surface;
pub mod timer;
pub mod view;
pub mod world;

pub use clipboard::{OfferState, RequestState};
pub use event::{Event, Modifiers, Rect, ViewState};
pub use hints::{HintKey, HintValue, SizeHint};
pub use keys::Key;
pub use surface::{NullSurface, Surface, SurfaceInfo};
pub use view::{EventSink, ViewId};
pub use world::{Waker, World, WorldConfig};

/// Errors returned by fallible view and world operations.
///
/// A successful call returns `Ok`; every failure maps to one of the
/// four status classes below.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Caller misuse or an invalid hint combination. State is unchanged.
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// The platform lacks a requested capability.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A native call failed (connection lost, request error, missing
    /// extension).
    #[error("failure: {0}")]
    Failure(String),

    /// `update` was called from inside a dispatch pass.
    #[error("event dispatch already in progress")]
    Busy,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
pub(crate) mod test_support {
    use tracing_subscriber::EnvFilter;

    /// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}
