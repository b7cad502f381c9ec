//! The client socket.
//!
//! A [`Socket`] wraps one descriptor. In cooperative mode every blocking
//! operation suspends only the calling task; in direct mode the same
//! operations block the thread. The mode is captured at construction from
//! the runtime's hook table, so a socket never changes mode mid-life.
//!
//! At most one operation may be in flight per socket. A second task
//! calling into a busy socket gets [`NetError::SocketBusy`] instead of
//! queueing behind the first.

use crate::base::neterror::NetError;
use crate::runtime::hook::{HookFlags, IoMode};
use crate::runtime::{Handle, Interest, SuspendReason, WaitId, WaitOutcome, WaitSpec};
use crate::socket::framing::{FramingConfig, FramingEngine};
use crate::socket::proxy::{self, ProxyConfig};
use crate::socket::settings::ClientSettings;
use crate::socket::sys::{self, SockAddr};
use bytes::{Bytes, BytesMut};
use std::cell::{Cell, RefCell};
use std::fs::File;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::time::{Duration, Instant};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const RECV_CHUNK: usize = 8 * 1024;

/// Address family and protocol of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Tcp,
    Tcp6,
    Udp,
    Udp6,
    UnixStream,
    UnixDgram,
}

impl SocketKind {
    fn domain(self) -> libc::c_int {
        match self {
            SocketKind::Tcp | SocketKind::Udp => libc::AF_INET,
            SocketKind::Tcp6 | SocketKind::Udp6 => libc::AF_INET6,
            SocketKind::UnixStream | SocketKind::UnixDgram => libc::AF_UNIX,
        }
    }

    fn sock_type(self) -> libc::c_int {
        if self.is_stream() {
            libc::SOCK_STREAM
        } else {
            libc::SOCK_DGRAM
        }
    }

    /// The hook category governing this kind of socket.
    pub fn hook_flag(self) -> HookFlags {
        match self {
            SocketKind::Tcp | SocketKind::Tcp6 => HookFlags::TCP,
            SocketKind::Udp | SocketKind::Udp6 => HookFlags::UDP,
            SocketKind::UnixStream => HookFlags::UNIX,
            SocketKind::UnixDgram => HookFlags::UDG,
        }
    }

    pub fn is_stream(self) -> bool {
        matches!(
            self,
            SocketKind::Tcp | SocketKind::Tcp6 | SocketKind::UnixStream
        )
    }

    fn is_inet(self) -> bool {
        !matches!(self, SocketKind::UnixStream | SocketKind::UnixDgram)
    }

    fn is_ipv6(self) -> bool {
        matches!(self, SocketKind::Tcp6 | SocketKind::Udp6)
    }
}

/// A client socket with cooperative blocking semantics.
pub struct Socket {
    kind: SocketKind,
    mode: IoMode,
    handle: Option<Handle>,
    fd: Cell<RawFd>,
    connected: Cell<bool>,
    closed: Cell<bool>,
    timeout: Cell<Option<Duration>>,
    connect_timeout: Cell<Duration>,
    framing: RefCell<FramingEngine>,
    /// Bytes read past a proxy handshake, handed to the next receive.
    pending: RefCell<BytesMut>,
    proxy: RefCell<Option<ProxyConfig>>,
    busy: Cell<bool>,
    pending_wait: Cell<Option<WaitId>>,
    last_error: RefCell<Option<NetError>>,
}

impl Socket {
    /// Creates an unconnected socket. The blocking mode is decided here:
    /// cooperative when a runtime is driving this thread and the hook for
    /// this socket's category is enabled, direct otherwise.
    pub fn new(kind: SocketKind) -> Result<Socket, NetError> {
        let handle = Handle::try_current();
        let mode = match &handle {
            Some(h) => h.hook_mode(kind.hook_flag()),
            None => IoMode::Direct,
        };
        let fd = sys::socket(kind.domain(), kind.sock_type())
            .map_err(|e| NetError::from_io(&e))?;
        if kind.is_stream() && kind.is_inet() {
            // Client sockets default to nodelay; settings can turn it off.
            let _ = sys::set_nodelay(fd, true);
        }
        tracing::debug!(fd, ?kind, ?mode, "socket created");
        Ok(Socket {
            kind,
            mode,
            handle: if mode == IoMode::Cooperative {
                handle
            } else {
                None
            },
            fd: Cell::new(fd),
            connected: Cell::new(false),
            closed: Cell::new(false),
            timeout: Cell::new(None),
            connect_timeout: Cell::new(DEFAULT_CONNECT_TIMEOUT),
            framing: RefCell::new(FramingEngine::new(FramingConfig::default())),
            pending: RefCell::new(BytesMut::new()),
            proxy: RefCell::new(None),
            busy: Cell::new(false),
            pending_wait: Cell::new(None),
            last_error: RefCell::new(None),
        })
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn mode(&self) -> IoMode {
        self.mode
    }

    pub fn is_connected(&self) -> bool {
        self.connected.get() && !self.closed.get()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// The error that failed the most recent operation.
    pub fn last_error(&self) -> Option<NetError> {
        self.last_error.borrow().clone()
    }

    /// Read/write timeout for subsequent operations. `None` waits forever.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.timeout.set(timeout);
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.connect_timeout.set(timeout);
    }

    pub fn set_framing(&self, config: FramingConfig) {
        self.framing.borrow_mut().set_config(config);
    }

    /// Attaches a proxy for the next `connect`. Datagram sockets cannot
    /// be proxied.
    pub fn set_proxy(&self, proxy: Option<ProxyConfig>) -> Result<(), NetError> {
        if proxy.is_some() && !self.kind.is_stream() {
            return Err(NetError::InvalidSetting(
                "proxies require a stream socket".into(),
            ));
        }
        *self.proxy.borrow_mut() = proxy;
        Ok(())
    }

    /// Applies a settings bundle (timeouts, framing, proxy, socket
    /// options) in one call.
    pub fn apply(&self, settings: &ClientSettings) -> Result<(), NetError> {
        if let Some(t) = settings.timeout {
            self.set_timeout(Some(t));
        }
        if let Some(t) = settings.connect_timeout {
            self.set_connect_timeout(t);
        }
        if let Some(framing) = settings.framing()? {
            self.set_framing(framing);
        }
        if let Some(proxy) = settings.proxy()? {
            self.set_proxy(Some(proxy))?;
        }
        if let Some(size) = settings.socket_buffer_size {
            self.set_buffer_size(size)?;
        }
        if let Some(nodelay) = settings.open_tcp_nodelay {
            self.set_nodelay(nodelay)?;
        }
        if let Some(addr) = &settings.bind_address {
            self.bind(addr, settings.bind_port.unwrap_or(0))?;
        }
        Ok(())
    }

    pub fn set_buffer_size(&self, size: usize) -> Result<(), NetError> {
        self.ensure_open()?;
        sys::set_buffer_size(self.fd.get(), size).map_err(|e| self.record_io(&e))
    }

    pub fn set_nodelay(&self, enabled: bool) -> Result<(), NetError> {
        self.ensure_open()?;
        if !self.kind.is_inet() || !self.kind.is_stream() {
            return Ok(());
        }
        sys::set_nodelay(self.fd.get(), enabled).map_err(|e| self.record_io(&e))
    }

    /// Binds the local side. For unix sockets `host` is a filesystem path
    /// and `port` is ignored.
    pub fn bind(&self, host: &str, port: u16) -> Result<(), NetError> {
        self.ensure_open()?;
        let addr = self.resolve(host, port)?;
        sys::bind(self.fd.get(), &addr).map_err(|e| self.record_io(&e))
    }

    /// Local address, once bound or connected. `None` for unix sockets.
    pub fn local_addr(&self) -> Result<Option<SocketAddr>, NetError> {
        self.ensure_open()?;
        sys::local_addr(self.fd.get()).map_err(|e| self.record_io(&e))
    }

    /// Connects to `host:port` (or a filesystem path for unix sockets),
    /// bounded by the configured connect timeout. On failure the socket
    /// is closed; a failed socket is never left half-open.
    ///
    /// With a proxy attached, connects to the proxy server and then
    /// negotiates a tunnel to the target.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), NetError> {
        let timeout = self.connect_timeout.get();
        self.connect_with_timeout(host, port, Some(timeout)).await
    }

    pub async fn connect_with_timeout(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<(), NetError> {
        let _busy = self.enter_busy()?;
        self.ensure_open()?;
        if self.connected.get() {
            return Err(NetError::InvalidSetting("socket already connected".into()));
        }
        let result = self.connect_inner(host, port, timeout).await;
        if let Err(err) = &result {
            self.record(err.clone());
            self.close_fd();
        }
        result
    }

    async fn connect_inner(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<(), NetError> {
        let proxy = self.proxy.borrow().clone();
        if let Some(p) = &proxy {
            if p.is_ssl() {
                return Err(NetError::SslNotSupported);
            }
        }
        let (peer_host, peer_port) = match &proxy {
            Some(p) => {
                let (h, port) = p.server();
                (h.to_string(), port)
            }
            None => (host.to_string(), port),
        };

        let deadline = timeout.map(|t| Instant::now() + t);
        let addr = self.resolve(&peer_host, peer_port)?;
        match sys::connect(self.fd.get(), &addr) {
            Ok(()) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
                self.wait_io(Interest::WRITABLE, deadline, NetError::ConnectionTimedOut)
                    .await?;
                if let Some(code) = sys::take_socket_error(self.fd.get())
                    .map_err(|e| NetError::from_io(&e))?
                {
                    return Err(NetError::from_errno(code));
                }
            }
            Err(e) => return Err(NetError::from_io(&e)),
        }
        self.connected.set(true);
        tracing::debug!(fd = self.fd.get(), host = %peer_host, port = peer_port, "connected");

        if let Some(p) = &proxy {
            // The handshake counts against the same connect deadline.
            proxy::negotiate(self, p, host, port, deadline)
                .await
                .map_err(|e| match e {
                    NetError::OperationTimedOut => NetError::ConnectionTimedOut,
                    other => other,
                })?;
            tracing::debug!(host, port, "proxy tunnel established");
        }
        Ok(())
    }

    /// Sends as much of `data` as the kernel accepts in one call,
    /// suspending until the socket is writable first if necessary.
    pub async fn send(&self, data: &[u8]) -> Result<usize, NetError> {
        let _busy = self.enter_busy()?;
        self.send_inner(data, self.deadline()).await
    }

    /// Sends all of `data`, suspending as needed.
    pub async fn send_all(&self, data: &[u8]) -> Result<(), NetError> {
        let _busy = self.enter_busy()?;
        let deadline = self.deadline();
        let mut sent = 0;
        while sent < data.len() {
            sent += self.send_inner(&data[sent..], deadline).await?;
        }
        Ok(())
    }

    /// [`send`] with a one-shot timeout overriding the configured one.
    ///
    /// [`send`]: Socket::send
    pub async fn send_timeout(
        &self,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, NetError> {
        let _busy = self.enter_busy()?;
        self.send_inner(data, Some(Instant::now() + timeout)).await
    }

    /// Receives into `buf`, suspending until data is available. Returns 0
    /// when the peer has closed the stream.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize, NetError> {
        let _busy = self.enter_busy()?;
        self.recv_with_deadline(buf, self.deadline()).await
    }

    /// [`recv`] with a one-shot timeout overriding the configured one.
    ///
    /// [`recv`]: Socket::recv
    pub async fn recv_timeout(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, NetError> {
        let _busy = self.enter_busy()?;
        self.recv_with_deadline(buf, Some(Instant::now() + timeout))
            .await
    }

    /// Copies already-arrived bytes without consuming them. Never
    /// suspends; returns `Ok(0)` when nothing is queued.
    pub fn peek(&self, buf: &mut [u8]) -> Result<usize, NetError> {
        self.ensure_open()?;
        {
            let pending = self.pending.borrow();
            if !pending.is_empty() {
                let n = pending.len().min(buf.len());
                buf[..n].copy_from_slice(&pending[..n]);
                return Ok(n);
            }
        }
        match sys::peek(self.fd.get(), buf) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(self.record_io(&e)),
        }
    }

    /// Receives one complete frame under the configured framing mode.
    ///
    /// Returns `Ok(None)` on clean end of stream at a frame boundary;
    /// a peer close mid-frame is [`NetError::IncompletePacket`]. The
    /// whole assembly, across however many reads it takes, is bounded by
    /// the socket timeout.
    pub async fn recv_packet(&self) -> Result<Option<Bytes>, NetError> {
        let _busy = self.enter_busy()?;
        self.recv_packet_with_deadline(self.deadline()).await
    }

    /// [`recv_packet`] with a one-shot timeout.
    ///
    /// [`recv_packet`]: Socket::recv_packet
    pub async fn recv_packet_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<Bytes>, NetError> {
        let _busy = self.enter_busy()?;
        self.recv_packet_with_deadline(Some(Instant::now() + timeout))
            .await
    }

    async fn recv_packet_with_deadline(
        &self,
        deadline: Option<Instant>,
    ) -> Result<Option<Bytes>, NetError> {
        let mut chunk = [0u8; RECV_CHUNK];
        loop {
            {
                let mut pending = self.pending.borrow_mut();
                if !pending.is_empty() {
                    let leftover = pending.split();
                    drop(pending);
                    self.framing.borrow_mut().feed(&leftover);
                }
            }
            {
                let mut framing = self.framing.borrow_mut();
                if let Some(frame) = framing.next_frame().inspect_err(|e| {
                    self.record(e.clone());
                })? {
                    return Ok(Some(frame));
                }
            }
            let n = self.recv_with_deadline(&mut chunk, deadline).await?;
            if n == 0 {
                let mut framing = self.framing.borrow_mut();
                if framing.is_empty() {
                    return Ok(None);
                }
                framing.clear();
                let err = NetError::IncompletePacket;
                self.record(err.clone());
                return Err(err);
            }
            self.framing.borrow_mut().feed(&chunk[..n]);
        }
    }

    /// Sends `length` bytes of `file` starting at `offset` (`None` for
    /// the rest of the file), suspending between kernel pushes. Returns
    /// the number of bytes sent.
    pub async fn sendfile(
        &self,
        file: &File,
        offset: i64,
        length: Option<usize>,
    ) -> Result<usize, NetError> {
        let _busy = self.enter_busy()?;
        self.ensure_open()?;
        let deadline = self.deadline();
        let total = match length {
            Some(n) => n,
            None => {
                let meta = file.metadata().map_err(|e| self.record_io(&e))?;
                (meta.len() as i64 - offset).max(0) as usize
            }
        };
        let mut offset = offset;
        let mut sent = 0;
        while sent < total {
            match sys::sendfile(self.fd.get(), file.as_raw_fd(), &mut offset, total - sent) {
                Ok(0) => break,
                Ok(n) => sent += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.wait_io(Interest::WRITABLE, deadline, NetError::OperationTimedOut)
                        .await?;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.record_io(&e)),
            }
        }
        Ok(sent)
    }

    /// Sends a datagram to `host:port` without connecting first.
    pub async fn send_to(&self, host: &str, port: u16, data: &[u8]) -> Result<usize, NetError> {
        let _busy = self.enter_busy()?;
        self.ensure_open()?;
        let deadline = self.deadline();
        let addr = self.resolve(host, port)?;
        loop {
            match sys::send_to(self.fd.get(), data, &addr) {
                Ok(n) => return Ok(n),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.wait_io(Interest::WRITABLE, deadline, NetError::OperationTimedOut)
                        .await?;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.record_io(&e)),
            }
        }
    }

    /// Receives one datagram along with the sender's address, when the
    /// kernel reports one.
    pub async fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> Result<(usize, Option<SocketAddr>), NetError> {
        let _busy = self.enter_busy()?;
        self.ensure_open()?;
        let deadline = self.deadline();
        loop {
            match sys::recv_from(self.fd.get(), buf) {
                Ok(out) => return Ok(out),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.wait_io(Interest::READABLE, deadline, NetError::OperationTimedOut)
                        .await?;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.record_io(&e)),
            }
        }
    }

    /// Closes the socket. Idempotent. A task suspended on this socket is
    /// resumed with [`NetError::SocketClosed`].
    pub fn close(&self) {
        if self.closed.get() {
            return;
        }
        if let (Some(handle), Some(wait)) = (&self.handle, self.pending_wait.take()) {
            handle.cancel_wait(wait);
        }
        self.close_fd();
        tracing::debug!(?self.kind, "socket closed");
    }

    fn close_fd(&self) {
        if self.closed.replace(true) {
            return;
        }
        self.connected.set(false);
        let fd = self.fd.replace(-1);
        if fd >= 0 {
            sys::close(fd);
        }
    }

    pub(crate) async fn send_all_inner(
        &self,
        data: &[u8],
        deadline: Option<Instant>,
    ) -> Result<(), NetError> {
        let mut sent = 0;
        while sent < data.len() {
            sent += self.send_inner(&data[sent..], deadline).await?;
        }
        Ok(())
    }

    pub(crate) async fn recv_inner(
        &self,
        buf: &mut [u8],
        deadline: Option<Instant>,
    ) -> Result<usize, NetError> {
        self.recv_with_deadline(buf, deadline).await
    }

    /// Stashes bytes that arrived ahead of the application, to be
    /// delivered by the next receive before touching the descriptor.
    pub(crate) fn push_pending(&self, data: &[u8]) {
        if !data.is_empty() {
            self.pending.borrow_mut().extend_from_slice(data);
        }
    }

    async fn send_inner(
        &self,
        data: &[u8],
        deadline: Option<Instant>,
    ) -> Result<usize, NetError> {
        self.ensure_open()?;
        loop {
            match sys::send(self.fd.get(), data) {
                Ok(n) => return Ok(n),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.wait_io(Interest::WRITABLE, deadline, NetError::OperationTimedOut)
                        .await?;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.record_io(&e)),
            }
        }
    }

    async fn recv_with_deadline(
        &self,
        buf: &mut [u8],
        deadline: Option<Instant>,
    ) -> Result<usize, NetError> {
        self.ensure_open()?;
        {
            let mut pending = self.pending.borrow_mut();
            if !pending.is_empty() {
                let n = pending.len().min(buf.len());
                buf[..n].copy_from_slice(&pending.split_to(n));
                return Ok(n);
            }
        }
        loop {
            match sys::recv(self.fd.get(), buf) {
                Ok(n) => return Ok(n),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.wait_io(Interest::READABLE, deadline, NetError::OperationTimedOut)
                        .await?;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.record_io(&e)),
            }
        }
    }

    /// Suspends until the descriptor is ready, the deadline passes, or
    /// the socket is closed under us.
    async fn wait_io(
        &self,
        interest: Interest,
        deadline: Option<Instant>,
        on_timeout: NetError,
    ) -> Result<(), NetError> {
        match self.mode {
            IoMode::Cooperative => {
                let handle = self
                    .handle
                    .as_ref()
                    .ok_or(NetError::NoRuntimeContext)?;
                let wait = handle.register_wait(WaitSpec {
                    fd: Some((self.fd.get(), interest)),
                    deadline,
                    reason: SuspendReason::Io,
                })?;
                self.pending_wait.set(Some(wait.id()));
                let outcome = wait.await;
                self.pending_wait.set(None);
                match outcome {
                    WaitOutcome::Io(_) => Ok(()),
                    WaitOutcome::TimedOut => {
                        self.record(on_timeout.clone());
                        Err(on_timeout)
                    }
                    WaitOutcome::Closed => {
                        self.record(NetError::SocketClosed);
                        Err(NetError::SocketClosed)
                    }
                }
            }
            IoMode::Direct => {
                let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
                let ready = sys::poll_one(self.fd.get(), interest.is_readable(), timeout)
                    .map_err(|e| self.record_io(&e))?;
                if ready {
                    Ok(())
                } else {
                    self.record(on_timeout.clone());
                    Err(on_timeout)
                }
            }
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.timeout.get().map(|t| Instant::now() + t)
    }

    fn ensure_open(&self) -> Result<(), NetError> {
        if self.closed.get() || self.fd.get() < 0 {
            Err(NetError::SocketClosed)
        } else {
            Ok(())
        }
    }

    fn enter_busy(&self) -> Result<BusyGuard<'_>, NetError> {
        if self.busy.replace(true) {
            let err = NetError::SocketBusy;
            self.record(err.clone());
            return Err(err);
        }
        Ok(BusyGuard { socket: self })
    }

    fn resolve(&self, host: &str, port: u16) -> Result<SockAddr, NetError> {
        if !self.kind.is_inet() {
            return SockAddr::unix(Path::new(host))
                .map_err(|e| NetError::InvalidSetting(e.to_string()));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(sys::inet_addr(ip, port));
        }
        let want_v6 = self.kind.is_ipv6();
        (host, port)
            .to_socket_addrs()
            .map_err(|_| NetError::NameNotResolved)?
            .find(|a| a.is_ipv6() == want_v6)
            .map(SockAddr::Inet)
            .ok_or(NetError::NameNotResolved)
    }

    fn record(&self, err: NetError) {
        *self.last_error.borrow_mut() = Some(err);
    }

    fn record_io(&self, err: &std::io::Error) -> NetError {
        let mapped = NetError::from_io(err);
        self.record(mapped.clone());
        mapped
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("kind", &self.kind)
            .field("fd", &self.fd.get())
            .field("mode", &self.mode)
            .field("connected", &self.connected.get())
            .field("closed", &self.closed.get())
            .finish()
    }
}

struct BusyGuard<'a> {
    socket: &'a Socket,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.socket.busy.set(false);
    }
}
