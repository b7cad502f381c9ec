//! # coronet
//!
//! A single-threaded cooperative socket runtime.
//!
//! `coronet` lets many logical tasks make ordinary-looking blocking socket
//! calls while a scheduler transparently suspends the calling task at any
//! call that would block and resumes it when the descriptor becomes ready,
//! a timer fires, or the socket is closed out from under it.
//!
//! ## Features
//!
//! - **Cooperative scheduling**: one task runs at a time; suspension points
//!   are socket I/O, sleeps, and timeouts. No preemption, no locking.
//! - **Packet framing**: EOF-delimited, length-prefixed, and
//!   callback-determined packet assembly with a hard size ceiling.
//! - **Proxy tunneling**: SOCKS5 (with username/password) and HTTP CONNECT
//!   negotiation before the application protocol starts.
//! - **Hook table**: per-category selection of cooperative vs direct
//!   blocking primitives, reversible and strict-mode aware.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use coronet::runtime::Runtime;
//! use coronet::socket::{Socket, SocketKind};
//! use coronet::socket::framing::FramingConfig;
//!
//! let rt = Runtime::new()?;
//! rt.block_on(async {
//!     let sock = Socket::new(SocketKind::Tcp)?;
//!     sock.set_framing(FramingConfig::eof(&b"\r\n"[..], true)?);
//!     sock.connect("example.com", 7000).await?;
//!     sock.send_all(b"hello\r\n").await?;
//!     let packet = sock.recv_packet().await?;
//!     sock.close();
//!     Ok::<_, coronet::NetError>(())
//! })?;
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Core error types
//! - [`runtime`] - Scheduler, reactor, timers, hook table
//! - [`socket`] - Socket, framing engine, proxy negotiation, settings

pub mod base;
pub mod runtime;
pub mod socket;

pub use base::neterror::NetError;
pub use runtime::hook::{HookFlags, HookTable, IoMode};
pub use runtime::{Handle, Runtime};
pub use socket::client::{Socket, SocketKind};
pub use socket::framing::{FramingConfig, LengthDecision, LengthFormat};
pub use socket::proxy::ProxyConfig;
pub use socket::settings::ClientSettings;
