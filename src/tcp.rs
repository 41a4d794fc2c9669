use crate::endpoint;
use crate::error;
use crate::event::event_id;
use crate::event::Event;
use crate::event_loop::Context;
use crate::socket::NetSocket;
use crate::socket::SocketOption;
use crate::socket_controller::ChannelId;
use crate::socket_controller::SocketController;
use crate::thread::ThreadHandle;
use crate::tls::TlsClientContext;
use crate::tls::TlsServerContext;
use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use rustls_pki_types::ServerName;
use std::cell::Cell;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

pub type AcceptHandler = Box<dyn FnMut(&Context, &TcpServer, TcpChannel)>;
pub type ConnectHandler = Box<dyn FnOnce(&Context, &TcpClient, i32)>;
pub type ReceiveHandler = Box<dyn FnMut(&Context, &TcpChannel)>;
pub type SendHandler = Box<dyn FnOnce(&Context, &TcpChannel, i32)>;
pub type CloseHandler = Box<dyn FnOnce(&Context, &TcpChannel)>;

/// An accepted socket not yet owned by any controller.
///
/// This is what crosses threads inside a `TCP_ACCEPT` event; the receiving
/// thread adopts it into its own arena.
pub(crate) struct DetachedChannel {
    pub socket: NetSocket,
    pub local: SocketAddr,
    pub peer: SocketAddr,
}

/// Where a channel handle currently points.
pub(crate) enum ChannelCore {
    /// Created but never connected.
    Idle,
    /// A connect request is in flight on `ctrl`.
    Connecting { ctrl: SocketController },
    /// Registered with a controller under `id`.
    Bound { ctrl: SocketController, id: ChannelId },
    /// Accepted, waiting to be adopted by a thread.
    Detached(Box<DetachedChannel>),
    Closed,
}

/// A connected, bidirectional byte stream with a single owning thread.
///
/// Handles are cheap to clone and shared between user code and the
/// controller; all methods other than cloning must be called on the owning
/// thread (the handle is not `Send`).
#[derive(Clone)]
pub struct TcpChannel {
    core: Rc<RefCell<ChannelCore>>,
}

impl PartialEq for TcpChannel {
    fn eq(&self, other: &TcpChannel) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }
}

impl TcpChannel {
    pub(crate) fn from_core(core: Rc<RefCell<ChannelCore>>) -> TcpChannel {
        TcpChannel { core }
    }

    pub(crate) fn core(&self) -> &Rc<RefCell<ChannelCore>> {
        &self.core
    }

    fn bound(&self) -> Option<(SocketController, ChannelId)> {
        match &*self.core.borrow() {
            ChannelCore::Bound { ctrl, id } => Some((ctrl.clone(), *id)),
            _ => None,
        }
    }

    /// Queues bytes for transmission. Returns `0` on success (sent or
    /// queued), negative when the channel is closed or unknown; never
    /// blocks. A zero-length send is a successful no-op.
    pub fn send(&self, data: &[u8]) -> i32 {
        match self.bound() {
            Some((ctrl, id)) => ctrl.send(id, data.to_vec(), None),
            None => error::ERR_CLOSED,
        }
    }

    /// Like `send`, with a completion handler fired on the owning thread
    /// once the whole buffer has been handed to the kernel. Completion
    /// handlers fire in submission order.
    pub fn send_with<F>(&self, data: &[u8], handler: F) -> i32
    where
        F: FnOnce(&Context, &TcpChannel, i32) + 'static,
    {
        match self.bound() {
            Some((ctrl, id)) => ctrl.send(id, data.to_vec(), Some(Box::new(handler))),
            None => error::ERR_CLOSED,
        }
    }

    pub fn send_string(&self, data: &str) -> i32 {
        self.send(data.as_bytes())
    }

    /// Drains bytes from the kernel. `0` means no more for now, negative
    /// means error, positive is the byte count.
    pub fn receive(&self, buf: &mut [u8]) -> i32 {
        match self.bound() {
            Some((ctrl, id)) => ctrl.receive(id, buf),
            None => error::ERR_CLOSED,
        }
    }

    /// Repeated `receive` until the socket is drained.
    pub fn receive_all(&self, reserve: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(reserve);
        let mut buf = [0_u8; 4096];
        loop {
            let n = self.receive(&mut buf);
            if n <= 0 {
                break;
            }
            out.extend_from_slice(&buf[..n as usize]);
        }
        out
    }

    /// Requests a graceful close: queued sends drain, the write side shuts
    /// down, and the close handler fires once the peer acknowledges (or a
    /// timer forces the issue).
    pub fn close(&self) {
        if let Some((ctrl, id)) = self.bound() {
            ctrl.request_close(id);
        }
    }

    /// Clears pending send entries; their handlers do not fire.
    pub fn cancel_send(&self) -> bool {
        match self.bound() {
            Some((ctrl, id)) => ctrl.cancel_send(id),
            None => false,
        }
    }

    /// Installs the callback invoked when the socket has bytes to read.
    pub fn set_receive_handler<F>(&self, handler: F) -> bool
    where
        F: FnMut(&Context, &TcpChannel) + 'static,
    {
        match self.bound() {
            Some((ctrl, id)) => ctrl.set_receive_handler(id, Box::new(handler)),
            None => false,
        }
    }

    /// Installs the close callback: at most once per channel, and always
    /// the last callback the channel delivers.
    pub fn set_close_handler<F>(&self, handler: F) -> bool
    where
        F: FnOnce(&Context, &TcpChannel) + 'static,
    {
        match self.bound() {
            Some((ctrl, id)) => ctrl.set_close_handler(id, Box::new(handler)),
            None => false,
        }
    }

    pub(crate) fn clear_receive_handler(&self) {
        if let Some((ctrl, id)) = self.bound() {
            ctrl.clear_receive_handler(id);
        }
    }

    pub fn is_closed(&self) -> bool {
        match &*self.core.borrow() {
            ChannelCore::Bound { ctrl, id } => !ctrl.contains_channel(*id),
            ChannelCore::Detached(_) => false,
            ChannelCore::Connecting { .. } => false,
            ChannelCore::Idle | ChannelCore::Closed => true,
        }
    }

    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        match &*self.core.borrow() {
            ChannelCore::Bound { ctrl, id } => ctrl.channel_local(*id),
            ChannelCore::Detached(detached) => Some(detached.local),
            _ => None,
        }
    }

    pub fn peer_endpoint(&self) -> Option<SocketAddr> {
        match &*self.core.borrow() {
            ChannelCore::Bound { ctrl, id } => ctrl.channel_peer(*id),
            ChannelCore::Detached(detached) => Some(detached.peer),
            _ => None,
        }
    }

    pub fn set_nodelay(&self, nodelay: bool) {
        if let Some((ctrl, id)) = self.bound() {
            ctrl.set_channel_nodelay(id, nodelay);
        }
    }
}

/// A non-blocking TCP listener.
#[derive(Clone)]
pub struct TcpServer {
    ctrl: SocketController,
    id: ChannelId,
    local: SocketAddr,
}

impl TcpServer {
    /// Binds, listens and registers with the thread's controller. The
    /// accept handler fires once per incoming connection; it must adopt
    /// the channel (`TcpServer::accept` or `accept_on`) or let it drop,
    /// which closes the socket.
    pub fn open<F>(ctx: &Context, local: SocketAddr, accept: F) -> Result<TcpServer>
    where
        F: FnMut(&Context, &TcpServer, TcpChannel) + 'static,
    {
        TcpServer::open_with(ctx, local, accept, None)
    }

    /// Like `open`, with accepted sockets bracketed by server-side TLS.
    pub fn open_tls<F>(
        ctx: &Context,
        local: SocketAddr,
        tls: &TlsServerContext,
        accept: F,
    ) -> Result<TcpServer>
    where
        F: FnMut(&Context, &TcpServer, TcpChannel) + 'static,
    {
        TcpServer::open_with(ctx, local, accept, Some(tls))
    }

    fn open_with<F>(
        ctx: &Context,
        local: SocketAddr,
        accept: F,
        tls: Option<&TlsServerContext>,
    ) -> Result<TcpServer>
    where
        F: FnMut(&Context, &TcpServer, TcpChannel) + 'static,
    {
        let ctrl = ctx
            .sockets()
            .ok_or_else(|| anyhow!("this thread has no socket controller"))?
            .clone();
        let (id, local) =
            ctrl.open_server(local, Box::new(accept), tls.map(|t| t.config()))?;
        Ok(TcpServer { ctrl, id, local })
    }

    pub(crate) fn from_raw(ctrl: SocketController, id: ChannelId, local: SocketAddr) -> TcpServer {
        TcpServer { ctrl, id, local }
    }

    /// Adopts an accepted channel onto the calling thread's controller.
    pub fn accept(ctx: &Context, channel: &TcpChannel) -> Result<()> {
        let ctrl = ctx
            .sockets()
            .ok_or_else(|| anyhow!("this thread has no socket controller"))?;
        ctrl.adopt(channel.core())?;
        Ok(())
    }

    /// Hands an accepted channel to another thread. The channel's socket
    /// crosses inside a `TCP_ACCEPT` event; the target thread adopts it in
    /// its `TCP_ACCEPT` handler via [`TcpServer::accept_event`].
    pub fn accept_on(target: &ThreadHandle, channel: &TcpChannel) -> Result<()> {
        let detached = {
            let mut core = channel.core().borrow_mut();
            match std::mem::replace(&mut *core, ChannelCore::Closed) {
                ChannelCore::Detached(detached) => *detached,
                other => {
                    *core = other;
                    bail!("channel is not adoptable");
                }
            }
        };
        if !target.post(Event::with_param(event_id::TCP_ACCEPT, detached)) {
            bail!("target thread is shutting down");
        }
        Ok(())
    }

    /// Reconstructs the channel carried by a `TCP_ACCEPT` event and
    /// registers it with the calling thread's controller.
    pub fn accept_event(ctx: &Context, event: &mut Event) -> Result<TcpChannel> {
        let detached = event
            .take_param::<DetachedChannel>()
            .ok_or_else(|| anyhow!("event carries no channel"))?;
        let core = Rc::new(RefCell::new(ChannelCore::Detached(Box::new(detached))));
        let channel = TcpChannel::from_core(core);
        TcpServer::accept(ctx, &channel)?;
        Ok(channel)
    }

    pub fn close(&self) {
        self.ctrl.close_server(self.id);
    }

    pub fn is_closed(&self) -> bool {
        !self.ctrl.server_open(self.id)
    }

    pub fn local_endpoint(&self) -> SocketAddr {
        self.ctrl.server_local(self.id).unwrap_or(self.local)
    }
}

/// An outbound TCP connection with connect timeout and endpoint fallback.
#[derive(Clone)]
pub struct TcpClient {
    chan: TcpChannel,
    request: Rc<Cell<Option<ChannelId>>>,
    option: Rc<Cell<SocketOption>>,
}

impl Default for TcpClient {
    fn default() -> Self {
        TcpClient::new()
    }
}

impl TcpClient {
    pub const DEFAULT_TIMEOUT_MS: u32 = 15_000;

    pub fn new() -> TcpClient {
        TcpClient {
            chan: TcpChannel::from_core(Rc::new(RefCell::new(ChannelCore::Idle))),
            request: Rc::new(Cell::new(None)),
            option: Rc::new(Cell::new(SocketOption::new())),
        }
    }

    /// Resolves `host:port` and connects, walking the endpoint list in
    /// order. Each candidate gets its own `timeout_ms` window; the handler
    /// fires once with `0` or the last error.
    pub fn connect<F>(
        &self,
        ctx: &Context,
        address: &str,
        handler: F,
        timeout_ms: u32,
    ) -> Result<()>
    where
        F: FnOnce(&Context, &TcpClient, i32) + 'static,
    {
        let endpoints = endpoint::resolve_address(address)?;
        self.connect_endpoints(ctx, endpoints, handler, timeout_ms)
    }

    pub fn connect_endpoints<F>(
        &self,
        ctx: &Context,
        endpoints: Vec<SocketAddr>,
        handler: F,
        timeout_ms: u32,
    ) -> Result<()>
    where
        F: FnOnce(&Context, &TcpClient, i32) + 'static,
    {
        self.connect_raw(ctx, endpoints, timeout_ms, Box::new(handler), None)
    }

    /// Connects and negotiates TLS before the handler reports success.
    /// The host part of `address` doubles as the SNI name.
    pub fn connect_tls<F>(
        &self,
        ctx: &Context,
        address: &str,
        tls: &TlsClientContext,
        handler: F,
        timeout_ms: u32,
    ) -> Result<()>
    where
        F: FnOnce(&Context, &TcpClient, i32) + 'static,
    {
        let (host, _) = endpoint::split_host_port(address)?;
        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|_| anyhow!("invalid TLS server name: {host}"))?;
        let endpoints = endpoint::resolve_address(address)?;
        self.connect_raw(
            ctx,
            endpoints,
            timeout_ms,
            Box::new(handler),
            Some((tls.config(), server_name)),
        )
    }

    pub(crate) fn connect_raw(
        &self,
        ctx: &Context,
        endpoints: Vec<SocketAddr>,
        timeout_ms: u32,
        handler: ConnectHandler,
        tls: Option<(
            std::sync::Arc<rustls::ClientConfig>,
            ServerName<'static>,
        )>,
    ) -> Result<()> {
        if endpoints.is_empty() {
            bail!("no endpoints to connect to");
        }
        match &*self.chan.core().borrow() {
            ChannelCore::Idle | ChannelCore::Closed => {}
            _ => bail!("client is already connecting or connected"),
        }
        let ctrl = ctx
            .sockets()
            .ok_or_else(|| anyhow!("this thread has no socket controller"))?;
        ctrl.request_connect(self, endpoints, timeout_ms, handler, tls, self.option.get());
        Ok(())
    }

    /// Abandons an in-flight connect; no callback fires.
    pub fn cancel_connect(&self) -> bool {
        let ctrl = match &*self.chan.core().borrow() {
            ChannelCore::Connecting { ctrl } => ctrl.clone(),
            _ => return false,
        };
        match self.request.get() {
            Some(id) => ctrl.cancel_connect(id),
            None => false,
        }
    }

    pub(crate) fn set_request_id(&self, id: Option<ChannelId>) {
        self.request.set(id);
    }

    pub fn channel(&self) -> &TcpChannel {
        &self.chan
    }

    /// Socket options applied to the connect socket after creation.
    pub fn set_socket_option(&self, option: SocketOption) {
        self.option.set(option);
    }

    pub fn send(&self, data: &[u8]) -> i32 {
        self.chan.send(data)
    }

    pub fn send_with<F>(&self, data: &[u8], handler: F) -> i32
    where
        F: FnOnce(&Context, &TcpChannel, i32) + 'static,
    {
        self.chan.send_with(data, handler)
    }

    pub fn send_string(&self, data: &str) -> i32 {
        self.chan.send_string(data)
    }

    pub fn receive(&self, buf: &mut [u8]) -> i32 {
        self.chan.receive(buf)
    }

    pub fn receive_all(&self, reserve: usize) -> Vec<u8> {
        self.chan.receive_all(reserve)
    }

    pub fn close(&self) {
        self.chan.close();
    }

    pub fn cancel_send(&self) -> bool {
        self.chan.cancel_send()
    }

    pub fn set_receive_handler<F>(&self, handler: F) -> bool
    where
        F: FnMut(&Context, &TcpChannel) + 'static,
    {
        self.chan.set_receive_handler(handler)
    }

    pub fn set_close_handler<F>(&self, handler: F) -> bool
    where
        F: FnOnce(&Context, &TcpChannel) + 'static,
    {
        self.chan.set_close_handler(handler)
    }

    pub fn is_closed(&self) -> bool {
        self.chan.is_closed()
    }

    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.chan.local_endpoint()
    }

    pub fn peer_endpoint(&self) -> Option<SocketAddr> {
        self.chan.peer_endpoint()
    }
}
