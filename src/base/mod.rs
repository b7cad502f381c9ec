//! Base types and error handling.
//!
//! - [`neterror::NetError`]: error codes for transport, protocol, usage,
//!   and timeout failures, with a stable numeric code surface.

pub mod neterror;
