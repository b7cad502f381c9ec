//! Client sockets with cooperative blocking, packet framing, and proxy
//! tunneling.
//!
//! The entry point is [`Socket`]: create one for a [`SocketKind`],
//! optionally attach framing ([`FramingConfig`]), a proxy
//! ([`ProxyConfig`]) or a whole [`ClientSettings`] bundle, then use the
//! blocking-style async operations from inside a runtime task.

pub mod client;
pub mod framing;
pub mod proxy;
pub mod settings;
pub(crate) mod sys;

pub use client::{Socket, SocketKind};
pub use framing::{
    FramingConfig, FramingEngine, FramingMode, LengthDecision, LengthFormat,
    DEFAULT_PACKAGE_MAX_LENGTH, EOF_MARKER_MAX_LEN,
};
pub use proxy::ProxyConfig;
pub use settings::ClientSettings;
