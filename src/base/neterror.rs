use thiserror::Error;

/// Error surface for every socket, framing, proxy, and scheduler operation.
///
/// Four families, each with its own code range:
/// - transport (`-100..`): OS-level connect/send/recv failures
/// - protocol (`-200..`): framing violations and proxy rejections
/// - usage (`-300..`): caller bugs; the failed call leaves state unchanged
/// - timeout (`-400..`): deadline expiry on the timed-out operation only
///
/// Raw OS errors are carried as [`NetError::Os`] with the positive errno.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum NetError {
    // Transport errors
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error("Connection reset")]
    ConnectionReset,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("Address invalid")]
    AddressInvalid,
    #[error("Address unreachable")]
    AddressUnreachable,
    #[error("Address in use")]
    AddressInUse,

    // Protocol errors
    #[error("Packet exceeds package_max_length")]
    PacketTooLong,
    #[error("Peer closed mid-packet (incomplete packet)")]
    IncompletePacket,
    #[error("Invalid packet length header")]
    InvalidPacketHeader,
    #[error("Proxy negotiation failed")]
    ProxyHandshakeFailed,
    #[error("Proxy authentication failed")]
    ProxyAuthFailed,
    #[error("Tunnel connection failed")]
    TunnelConnectionFailed,
    #[error("TLS is not available on this socket")]
    SslNotSupported,

    // Usage errors
    #[error("Socket not connected")]
    SocketNotConnected,
    #[error("Socket busy: another task has a call in flight")]
    SocketBusy,
    #[error("Socket closed")]
    SocketClosed,
    #[error("Not inside a coronet runtime context")]
    NoRuntimeContext,
    #[error("Hook table conflicts with strict mode")]
    HookConflict,
    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    // Timeout errors
    #[error("Connection timed out")]
    ConnectionTimedOut,
    #[error("Operation timed out")]
    OperationTimedOut,

    /// An OS error in errno space (positive errno value).
    #[error("OS error {0}")]
    Os(i32),
}

impl NetError {
    /// Stable numeric code for the error, errno passthrough for [`Os`].
    ///
    /// [`Os`]: NetError::Os
    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::ConnectionClosed => -100,
            NetError::ConnectionReset => -101,
            NetError::ConnectionRefused => -102,
            NetError::ConnectionAborted => -103,
            NetError::ConnectionFailed => -104,
            NetError::NameNotResolved => -105,
            NetError::AddressInvalid => -108,
            NetError::AddressUnreachable => -109,
            NetError::AddressInUse => -147,

            NetError::PacketTooLong => -200,
            NetError::IncompletePacket => -201,
            NetError::InvalidPacketHeader => -202,
            NetError::ProxyHandshakeFailed => -210,
            NetError::ProxyAuthFailed => -211,
            NetError::TunnelConnectionFailed => -212,
            NetError::SslNotSupported => -213,

            NetError::SocketNotConnected => -300,
            NetError::SocketBusy => -301,
            NetError::SocketClosed => -302,
            NetError::NoRuntimeContext => -303,
            NetError::HookConflict => -304,
            NetError::InvalidSetting(_) => -305,

            NetError::ConnectionTimedOut => -400,
            NetError::OperationTimedOut => -401,

            NetError::Os(code) => *code,
        }
    }

    /// True for the timeout family.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            NetError::ConnectionTimedOut | NetError::OperationTimedOut
        )
    }

    /// Maps an `io::Error` from a transport syscall to the matching variant.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
            ErrorKind::ConnectionReset => NetError::ConnectionReset,
            ErrorKind::ConnectionAborted => NetError::ConnectionAborted,
            ErrorKind::NotConnected => NetError::SocketNotConnected,
            ErrorKind::AddrInUse => NetError::AddressInUse,
            ErrorKind::AddrNotAvailable => NetError::AddressInvalid,
            ErrorKind::BrokenPipe => NetError::ConnectionClosed,
            ErrorKind::TimedOut => NetError::OperationTimedOut,
            _ => NetError::Os(err.raw_os_error().unwrap_or(0)),
        }
    }

    /// Maps a raw errno value to the matching variant.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ECONNREFUSED => NetError::ConnectionRefused,
            libc::ECONNRESET => NetError::ConnectionReset,
            libc::ECONNABORTED => NetError::ConnectionAborted,
            libc::ENOTCONN => NetError::SocketNotConnected,
            libc::EADDRINUSE => NetError::AddressInUse,
            libc::EADDRNOTAVAIL => NetError::AddressInvalid,
            libc::EHOSTUNREACH | libc::ENETUNREACH => NetError::AddressUnreachable,
            libc::EPIPE => NetError::ConnectionClosed,
            libc::ETIMEDOUT => NetError::ConnectionTimedOut,
            other => NetError::Os(other),
        }
    }
}

impl From<i32> for NetError {
    fn from(code: i32) -> Self {
        match code {
            -100 => NetError::ConnectionClosed,
            -101 => NetError::ConnectionReset,
            -102 => NetError::ConnectionRefused,
            -103 => NetError::ConnectionAborted,
            -104 => NetError::ConnectionFailed,
            -105 => NetError::NameNotResolved,
            -108 => NetError::AddressInvalid,
            -109 => NetError::AddressUnreachable,
            -147 => NetError::AddressInUse,

            -200 => NetError::PacketTooLong,
            -201 => NetError::IncompletePacket,
            -202 => NetError::InvalidPacketHeader,
            -210 => NetError::ProxyHandshakeFailed,
            -211 => NetError::ProxyAuthFailed,
            -212 => NetError::TunnelConnectionFailed,
            -213 => NetError::SslNotSupported,

            -300 => NetError::SocketNotConnected,
            -301 => NetError::SocketBusy,
            -302 => NetError::SocketClosed,
            -303 => NetError::NoRuntimeContext,
            -304 => NetError::HookConflict,
            -305 => NetError::InvalidSetting(String::new()),

            -400 => NetError::ConnectionTimedOut,
            -401 => NetError::OperationTimedOut,

            _ => NetError::Os(code),
        }
    }
}
