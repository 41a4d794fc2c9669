use crate::error;
use crate::event::Event;
use crate::event_loop::Context;
use crate::queue::EventController;
use crate::queue::EventQueue;
use crate::queue::WaitResult;
use crate::selector::Selector;
use crate::selector::SocketEvents;
use crate::socket::NetSocket;
use crate::socket::SocketOption;
use crate::tcp::AcceptHandler;
use crate::tcp::ChannelCore;
use crate::tcp::CloseHandler;
use crate::tcp::ConnectHandler;
use crate::tcp::DetachedChannel;
use crate::tcp::ReceiveHandler;
use crate::tcp::SendHandler;
use crate::tcp::TcpChannel;
use crate::tcp::TcpClient;
use crate::tcp::TcpServer;
use crate::timer::Timer;
use crate::timer::TimerId;
use crate::timer::TimerManager;
use crate::tls::TlsStream;
use crate::udp::UdpReceiveHandler;
use crate::udp::UdpReceiver;
use anyhow::Result;
use mio::net::TcpListener;
use mio::net::TcpStream;
use mio::net::UdpSocket;
use mio::Interest;
use mio::Token;
use rustls::ClientConfig;
use rustls::ServerConfig;
use rustls_pki_types::ServerName;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::io;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing::warn;

/// Stable key identifying a socket owned by a controller.
///
/// Ids are allocated monotonically and never reused, so a stale handle can
/// always be detected by an arena miss.
pub type ChannelId = usize;

/// How long a graceful close waits for the peer's FIN before forcing the
/// socket shut.
pub const DEFAULT_CLOSE_TIMEOUT_MS: u32 = 15_000;

struct ServerItem {
    socket: TcpListener,
    local: SocketAddr,
    accept: Rc<RefCell<AcceptHandler>>,
    tls: Option<Arc<ServerConfig>>,
}

enum ConnectPhase {
    Tcp,
    Tls,
}

struct ClientItem {
    client: TcpClient,
    socket: Option<NetSocket>,
    phase: ConnectPhase,
    endpoints: VecDeque<SocketAddr>,
    timeout_ms: u32,
    cancel_timer: Option<TimerId>,
    last_error: i32,
    handler: Option<ConnectHandler>,
    tls: Option<(Arc<ClientConfig>, ServerName<'static>)>,
    option: SocketOption,
}

struct SendEntry {
    buf: Vec<u8>,
    index: usize,
    handler: Option<SendHandler>,
}

struct ChannelItem {
    core: Rc<RefCell<ChannelCore>>,
    socket: NetSocket,
    local: SocketAddr,
    peer: SocketAddr,
    send_queue: VecDeque<SendEntry>,
    send_blocked: bool,
    receive: Option<Rc<RefCell<ReceiveHandler>>>,
    close_cb: Option<CloseHandler>,
    close_timer: Option<TimerId>,
    closing: bool,
    shutdown_done: bool,
    eof: bool,
    error: i32,
}

impl ChannelItem {
    fn new(
        core: Rc<RefCell<ChannelCore>>,
        socket: NetSocket,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> ChannelItem {
        ChannelItem {
            core,
            socket,
            local,
            peer,
            send_queue: VecDeque::new(),
            send_blocked: false,
            receive: None,
            close_cb: None,
            close_timer: None,
            closing: false,
            shutdown_done: false,
            eof: false,
            error: error::OK,
        }
    }
}

struct UdpItem {
    socket: UdpSocket,
    local: SocketAddr,
    receive: Rc<RefCell<UdpReceiveHandler>>,
}

// Callbacks deferred until the controller is back outside its own borrow.
// Once queued here they fire even if the operation is cancelled afterwards.
enum Pending {
    Connect {
        client: TcpClient,
        handler: ConnectHandler,
        code: i32,
    },
    SendDone {
        chan: TcpChannel,
        handler: SendHandler,
        code: i32,
    },
    Close {
        chan: TcpChannel,
        handler: CloseHandler,
    },
}

struct Inner {
    selector: Selector,
    timers: Rc<RefCell<TimerManager>>,
    next_id: ChannelId,
    servers: HashMap<ChannelId, ServerItem>,
    clients: HashMap<ChannelId, ClientItem>,
    channels: HashMap<ChannelId, ChannelItem>,
    udp: HashMap<ChannelId, UdpItem>,
    pending: VecDeque<Pending>,
}

impl Inner {
    fn alloc_id(&mut self) -> ChannelId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Kind {
    Server,
    Client,
    Channel,
    Udp,
    Gone,
}

/// Owns every registered socket on its thread and translates raw readiness
/// into channel callbacks.
///
/// Specializes the event controller: `wait` first polls the selector and
/// dispatches socket events, then falls back to the queued-event path.
#[derive(Clone)]
pub struct SocketController {
    inner: Rc<RefCell<Inner>>,
    queue: Arc<EventQueue>,
}

impl SocketController {
    pub(crate) fn new(
        queue: Arc<EventQueue>,
        selector: Selector,
        timers: Rc<RefCell<TimerManager>>,
    ) -> SocketController {
        SocketController {
            inner: Rc::new(RefCell::new(Inner {
                selector,
                timers,
                next_id: 1,
                servers: HashMap::new(),
                clients: HashMap::new(),
                channels: HashMap::new(),
                udp: HashMap::new(),
                pending: VecDeque::new(),
            })),
            queue,
        }
    }

    pub fn socket_count(&self) -> usize {
        self.inner.borrow().selector.socket_count()
    }

    pub fn is_full(&self) -> bool {
        self.inner.borrow().selector.is_full()
    }

    //-----------------------------------------------------------------
    //  TCP server.
    //-----------------------------------------------------------------

    pub(crate) fn open_server(
        &self,
        local: SocketAddr,
        accept: AcceptHandler,
        tls: Option<Arc<ServerConfig>>,
    ) -> Result<(ChannelId, SocketAddr)> {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;

        let mut listener = TcpListener::bind(local)?;
        let local = listener.local_addr()?;
        let id = inner.alloc_id();
        inner
            .selector
            .register(&mut listener, Token(id), Interest::READABLE)?;
        inner.servers.insert(
            id,
            ServerItem {
                socket: listener,
                local,
                accept: Rc::new(RefCell::new(accept)),
                tls,
            },
        );
        Ok((id, local))
    }

    pub(crate) fn close_server(&self, id: ChannelId) {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        if let Some(mut item) = inner.servers.remove(&id) {
            inner.selector.unregister(&mut item.socket);
        }
    }

    pub(crate) fn server_local(&self, id: ChannelId) -> Option<SocketAddr> {
        self.inner.borrow().servers.get(&id).map(|item| item.local)
    }

    pub(crate) fn server_open(&self, id: ChannelId) -> bool {
        self.inner.borrow().servers.contains_key(&id)
    }

    /// Registers an accepted (detached) channel with this controller.
    pub(crate) fn adopt(&self, core: &Rc<RefCell<ChannelCore>>) -> Result<ChannelId> {
        let detached = {
            let mut state = core.borrow_mut();
            match std::mem::replace(&mut *state, ChannelCore::Closed) {
                ChannelCore::Detached(detached) => *detached,
                other => {
                    *state = other;
                    anyhow::bail!("channel is not adoptable");
                }
            }
        };
        let DetachedChannel {
            mut socket,
            local,
            peer,
        } = detached;

        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let id = inner.alloc_id();

        let mut interest = Interest::READABLE;
        if socket.wants_write() || socket.is_handshaking() {
            interest |= Interest::WRITABLE;
        }
        inner.selector.register(socket.source(), Token(id), interest)?;

        inner
            .channels
            .insert(id, ChannelItem::new(core.clone(), socket, local, peer));
        *core.borrow_mut() = ChannelCore::Bound {
            ctrl: self.clone(),
            id,
        };
        Ok(id)
    }

    //-----------------------------------------------------------------
    //  TCP connect with candidate list and per-attempt timeout.
    //-----------------------------------------------------------------

    pub(crate) fn request_connect(
        &self,
        client: &TcpClient,
        endpoints: Vec<SocketAddr>,
        timeout_ms: u32,
        handler: ConnectHandler,
        tls: Option<(Arc<ClientConfig>, ServerName<'static>)>,
        option: SocketOption,
    ) {
        let (id, started) = {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;
            let id = inner.alloc_id();

            *client.channel().core().borrow_mut() = ChannelCore::Connecting {
                ctrl: self.clone(),
            };
            client.set_request_id(Some(id));

            inner.clients.insert(
                id,
                ClientItem {
                    client: client.clone(),
                    socket: None,
                    phase: ConnectPhase::Tcp,
                    endpoints: endpoints.into(),
                    timeout_ms,
                    cancel_timer: None,
                    last_error: error::ERR_RESOLVE,
                    handler: Some(handler),
                    tls,
                    option,
                },
            );
            (id, Self::start_attempt(inner, self, id))
        };

        if !started {
            let code = self
                .inner
                .borrow()
                .clients
                .get(&id)
                .map(|item| item.last_error)
                .unwrap_or(error::ERR_IO);
            self.finish_connect(id, code);
        }
    }

    /// Removes an in-flight connect. No callback fires afterwards.
    pub(crate) fn cancel_connect(&self, id: ChannelId) -> bool {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let Some(mut item) = inner.clients.remove(&id) else {
            return false;
        };
        if let Some(mut socket) = item.socket.take() {
            inner.selector.unregister(socket.source());
        }
        if let Some(timer) = item.cancel_timer.take() {
            inner.timers.borrow_mut().cancel(timer);
        }
        *item.client.channel().core().borrow_mut() = ChannelCore::Closed;
        true
    }

    /// Pops endpoints until a non-blocking connect can be issued.
    fn start_attempt(inner: &mut Inner, ctrl: &SocketController, id: ChannelId) -> bool {
        let timers = inner.timers.clone();
        let Some(item) = inner.clients.get_mut(&id) else {
            return false;
        };

        while let Some(addr) = item.endpoints.pop_front() {
            match TcpStream::connect(addr) {
                Ok(sock) => {
                    item.option.apply(&sock);
                    let mut socket = NetSocket::Plain(sock);
                    if inner
                        .selector
                        .register(socket.source(), Token(id), Interest::WRITABLE)
                        .is_err()
                    {
                        item.last_error = error::ERR_IO;
                        continue;
                    }
                    item.socket = Some(socket);
                    item.phase = ConnectPhase::Tcp;

                    let ctrl = ctrl.clone();
                    let timer = Timer::new(item.timeout_ms as u64, false, move |ctx| {
                        ctrl.on_connect_timeout(ctx, id);
                    });
                    item.cancel_timer = Some(timers.borrow_mut().start(timer));
                    return true;
                }
                Err(err) => {
                    item.last_error = error::from_io(&err);
                }
            }
        }
        false
    }

    fn on_connect_timeout(&self, _ctx: &Context, id: ChannelId) {
        {
            let mut inner = self.inner.borrow_mut();
            let Some(item) = inner.clients.get_mut(&id) else {
                return;
            };
            item.cancel_timer = None;
            item.last_error = error::ERR_TIMEOUT;
        }
        debug!(id, "connect attempt timed out");
        self.advance_connect(id);
    }

    /// Drops the current attempt and moves to the next endpoint, failing
    /// the whole request when the list is exhausted.
    fn advance_connect(&self, id: ChannelId) {
        let (started, code) = {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;
            {
                let Some(item) = inner.clients.get_mut(&id) else {
                    return;
                };
                if let Some(mut socket) = item.socket.take() {
                    inner.selector.unregister(socket.source());
                }
                if let Some(timer) = item.cancel_timer.take() {
                    inner.timers.borrow_mut().cancel(timer);
                }
            }
            let started = Self::start_attempt(inner, self, id);
            let code = inner
                .clients
                .get(&id)
                .map(|item| item.last_error)
                .unwrap_or(error::ERR_IO);
            (started, code)
        };
        if !started {
            self.finish_connect(id, code);
        }
    }

    fn on_client_ready(&self, _ctx: &Context, id: ChannelId) {
        enum Step {
            Done(i32),
            Next,
            Wait,
        }

        let step = {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;
            let Some(item) = inner.clients.get_mut(&id) else {
                return;
            };
            if item.socket.is_none() {
                return;
            }

            enum Probe {
                Connected,
                Pending,
                Failed(i32),
            }

            match item.phase {
                ConnectPhase::Tcp => {
                    let probe = {
                        let socket = item.socket.as_mut().unwrap();
                        match socket.take_error() {
                            Ok(Some(err)) | Err(err) => Probe::Failed(error::from_io(&err)),
                            Ok(None) => match socket.peer_addr() {
                                Ok(_) => Probe::Connected,
                                Err(err) if err.kind() == io::ErrorKind::NotConnected => {
                                    // Spurious wakeup; the attempt continues.
                                    Probe::Pending
                                }
                                Err(err) => Probe::Failed(error::from_io(&err)),
                            },
                        }
                    };
                    match probe {
                        Probe::Pending => Step::Wait,
                        Probe::Failed(code) => {
                            item.last_error = code;
                            Step::Next
                        }
                        Probe::Connected => {
                            if let Some((config, name)) = item.tls.take() {
                                let plain = match item.socket.take() {
                                    Some(NetSocket::Plain(sock)) => sock,
                                    other => {
                                        item.socket = other;
                                        return;
                                    }
                                };
                                match TlsStream::client(plain, config, name) {
                                    Ok(tls) => {
                                        item.socket = Some(NetSocket::Tls(Box::new(tls)));
                                        item.phase = ConnectPhase::Tls;
                                        match item.socket.as_mut().unwrap().handshake() {
                                            Ok(true) => Step::Done(error::OK),
                                            Ok(false) => {
                                                let socket = item.socket.as_mut().unwrap();
                                                let _ = inner.selector.reregister(
                                                    socket.source(),
                                                    Token(id),
                                                    Interest::READABLE | Interest::WRITABLE,
                                                );
                                                Step::Wait
                                            }
                                            Err(err) => {
                                                warn!(id, error = %err, "TLS handshake failed");
                                                Step::Done(error::ERR_TLS)
                                            }
                                        }
                                    }
                                    Err(err) => {
                                        warn!(id, error = %err, "TLS session setup failed");
                                        Step::Done(error::ERR_TLS)
                                    }
                                }
                            } else {
                                Step::Done(error::OK)
                            }
                        }
                    }
                }
                ConnectPhase::Tls => {
                    let socket = item.socket.as_mut().unwrap();
                    match socket.handshake() {
                        Ok(true) => Step::Done(error::OK),
                        Ok(false) => Step::Wait,
                        Err(err) => {
                            warn!(id, error = %err, "TLS handshake failed");
                            Step::Done(error::ERR_TLS)
                        }
                    }
                }
            }
        };

        match step {
            Step::Done(code) => self.finish_connect(id, code),
            Step::Next => self.advance_connect(id),
            Step::Wait => {}
        }
    }

    /// Finalizes the connect request: on success the socket is promoted
    /// into the channel arena under the same id.
    fn finish_connect(&self, id: ChannelId, code: i32) {
        let callback = {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;
            let Some(mut item) = inner.clients.remove(&id) else {
                return;
            };
            if let Some(timer) = item.cancel_timer.take() {
                inner.timers.borrow_mut().cancel(timer);
            }

            let mut code = code;
            if code == error::OK {
                match item.socket.take() {
                    Some(mut socket) => {
                        let fallback =
                            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0);
                        let local = socket.local_addr().unwrap_or(fallback);
                        let peer = socket.peer_addr().unwrap_or(fallback);

                        let mut interest = Interest::READABLE;
                        if socket.wants_write() {
                            interest |= Interest::WRITABLE;
                        }
                        if inner
                            .selector
                            .reregister(socket.source(), Token(id), interest)
                            .is_ok()
                        {
                            let core = item.client.channel().core().clone();
                            inner
                                .channels
                                .insert(id, ChannelItem::new(core.clone(), socket, local, peer));
                            *core.borrow_mut() = ChannelCore::Bound {
                                ctrl: self.clone(),
                                id,
                            };
                        } else {
                            code = error::ERR_IO;
                        }
                    }
                    None => code = error::ERR_IO,
                }
            }
            if code != error::OK {
                if let Some(mut socket) = item.socket.take() {
                    inner.selector.unregister(socket.source());
                }
                *item.client.channel().core().borrow_mut() = ChannelCore::Closed;
            }

            item.client.set_request_id(None);
            item.handler
                .take()
                .map(|handler| (item.client.clone(), handler, code))
        };

        if let Some((client, handler, code)) = callback {
            self.inner.borrow_mut().pending.push_back(Pending::Connect {
                client,
                handler,
                code,
            });
        }
    }

    //-----------------------------------------------------------------
    //  TCP channel I/O.
    //-----------------------------------------------------------------

    /// Queues `data` and pushes as much of the send buffer as the socket
    /// accepts. Bytes are never reordered per channel.
    pub(crate) fn send(&self, id: ChannelId, data: Vec<u8>, handler: Option<SendHandler>) -> i32 {
        let fatal = {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;
            let Some(item) = inner.channels.get_mut(&id) else {
                return error::ERR_CLOSED;
            };
            if item.closing {
                return error::ERR_CLOSED;
            }
            item.send_queue.push_back(SendEntry {
                buf: data,
                index: 0,
                handler,
            });
            if item.send_blocked || item.socket.is_handshaking() {
                false
            } else {
                Self::drain_send(inner, id)
            }
        };
        if fatal {
            self.finalize_close(id);
        }
        error::OK
    }

    /// Clears pending send entries without firing their handlers.
    pub(crate) fn cancel_send(&self, id: ChannelId) -> bool {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let Some(item) = inner.channels.get_mut(&id) else {
            return false;
        };
        item.send_queue.clear();
        if !item.socket.wants_write() {
            item.send_blocked = false;
            let _ = inner.selector.reregister(
                item.socket.source(),
                Token(id),
                Interest::READABLE,
            );
        }
        true
    }

    /// Drains from the kernel. Returns bytes read, `0` for would-block and
    /// a negative code on error; EOF is recorded and surfaced through the
    /// close handler.
    pub(crate) fn receive(&self, id: ChannelId, buf: &mut [u8]) -> i32 {
        let mut inner = self.inner.borrow_mut();
        let Some(item) = inner.channels.get_mut(&id) else {
            return error::ERR_CLOSED;
        };
        if item.socket.is_handshaking() {
            return 0;
        }
        loop {
            match item.socket.recv(buf) {
                Ok(0) => {
                    if !buf.is_empty() {
                        item.eof = true;
                    }
                    return 0;
                }
                Ok(n) => return n as i32,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return 0,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    let code = error::from_io(&err);
                    item.error = code;
                    return code;
                }
            }
        }
    }

    /// Shuts down the write side once the send buffer drains, then waits
    /// for the peer's FIN under a liveness timer.
    pub(crate) fn request_close(&self, id: ChannelId) {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let Some(item) = inner.channels.get_mut(&id) else {
            return;
        };
        if item.closing {
            return;
        }
        item.closing = true;
        if item.send_queue.is_empty() && !item.socket.wants_write() {
            item.socket.shutdown_write();
            item.shutdown_done = true;
        }

        let ctrl = self.clone();
        let timer = Timer::new(DEFAULT_CLOSE_TIMEOUT_MS as u64, false, move |_ctx| {
            debug!(id, "close timed out, forcing");
            ctrl.finalize_close(id);
        });
        item.close_timer = Some(inner.timers.borrow_mut().start(timer));
    }

    pub(crate) fn set_receive_handler(&self, id: ChannelId, handler: ReceiveHandler) -> bool {
        let mut inner = self.inner.borrow_mut();
        let Some(item) = inner.channels.get_mut(&id) else {
            return false;
        };
        item.receive = Some(Rc::new(RefCell::new(handler)));
        true
    }

    pub(crate) fn set_close_handler(&self, id: ChannelId, handler: CloseHandler) -> bool {
        let mut inner = self.inner.borrow_mut();
        let Some(item) = inner.channels.get_mut(&id) else {
            return false;
        };
        item.close_cb = Some(handler);
        true
    }

    pub(crate) fn clear_receive_handler(&self, id: ChannelId) {
        if let Some(item) = self.inner.borrow_mut().channels.get_mut(&id) {
            item.receive = None;
        }
    }

    pub(crate) fn contains_channel(&self, id: ChannelId) -> bool {
        self.inner.borrow().channels.contains_key(&id)
    }

    pub(crate) fn channel_local(&self, id: ChannelId) -> Option<SocketAddr> {
        self.inner.borrow().channels.get(&id).map(|item| item.local)
    }

    pub(crate) fn channel_peer(&self, id: ChannelId) -> Option<SocketAddr> {
        self.inner.borrow().channels.get(&id).map(|item| item.peer)
    }

    pub(crate) fn set_channel_nodelay(&self, id: ChannelId, nodelay: bool) {
        let mut inner = self.inner.borrow_mut();
        if let Some(item) = inner.channels.get_mut(&id) {
            let _ = item.socket.source().set_nodelay(nodelay);
        }
    }

    /// Writes the head of the send buffer until it would block, completing
    /// entries in order.
    fn drain_send(inner: &mut Inner, id: ChannelId) -> bool {
        let Some(item) = inner.channels.get_mut(&id) else {
            return false;
        };
        if item.socket.is_handshaking() {
            return false;
        }

        if let Err(err) = item.socket.flush_out() {
            if err.kind() != io::ErrorKind::WouldBlock {
                item.error = error::from_io(&err);
                return true;
            }
        }

        let mut fatal = false;
        loop {
            let finished = match item.send_queue.front() {
                None => break,
                Some(entry) => entry.index >= entry.buf.len(),
            };
            if finished {
                if let Some(entry) = item.send_queue.pop_front() {
                    if let Some(handler) = entry.handler {
                        let chan = TcpChannel::from_core(item.core.clone());
                        inner.pending.push_back(Pending::SendDone {
                            chan,
                            handler,
                            code: error::OK,
                        });
                    }
                }
                continue;
            }

            let Some(head) = item.send_queue.front_mut() else {
                break;
            };
            match item.socket.send(&head.buf[head.index..]) {
                Ok(0) => break,
                Ok(n) => head.index += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    item.send_blocked = true;
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    item.error = error::from_io(&err);
                    fatal = true;
                    break;
                }
            }
        }

        if item.send_queue.is_empty() && !item.socket.wants_write() {
            item.send_blocked = false;
            // Deferred half-close: the buffer finally drained.
            if item.closing && !item.shutdown_done {
                item.socket.shutdown_write();
                item.shutdown_done = true;
            }
        }

        let interest = if item.send_blocked || item.socket.wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let _ = inner
            .selector
            .reregister(item.socket.source(), Token(id), interest);

        fatal
    }

    /// Tears the channel down and schedules its close callback, exactly
    /// once.
    fn finalize_close(&self, id: ChannelId) {
        let callback = {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;
            let Some(mut item) = inner.channels.remove(&id) else {
                return;
            };
            if let Some(timer) = item.close_timer.take() {
                inner.timers.borrow_mut().cancel(timer);
            }
            inner.selector.unregister(item.socket.source());
            *item.core.borrow_mut() = ChannelCore::Closed;

            item.close_cb.take().map(|handler| Pending::Close {
                chan: TcpChannel::from_core(item.core.clone()),
                handler,
            })
            // The item (and its socket) drops here.
        };
        if let Some(callback) = callback {
            self.inner.borrow_mut().pending.push_back(callback);
        }
    }

    //-----------------------------------------------------------------
    //  UDP.
    //-----------------------------------------------------------------

    pub(crate) fn open_udp(
        &self,
        local: SocketAddr,
        receive: UdpReceiveHandler,
    ) -> Result<(ChannelId, SocketAddr)> {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;

        let mut socket = UdpSocket::bind(local)?;
        let local = socket.local_addr()?;
        let id = inner.alloc_id();
        inner
            .selector
            .register(&mut socket, Token(id), Interest::READABLE)?;
        inner.udp.insert(
            id,
            UdpItem {
                socket,
                local,
                receive: Rc::new(RefCell::new(receive)),
            },
        );
        Ok((id, local))
    }

    pub(crate) fn close_udp(&self, id: ChannelId) {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        if let Some(mut item) = inner.udp.remove(&id) {
            inner.selector.unregister(&mut item.socket);
        }
    }

    pub(crate) fn udp_local(&self, id: ChannelId) -> Option<SocketAddr> {
        self.inner.borrow().udp.get(&id).map(|item| item.local)
    }

    pub(crate) fn udp_open(&self, id: ChannelId) -> bool {
        self.inner.borrow().udp.contains_key(&id)
    }

    /// Receives one datagram; `(0, None)` means nothing is pending.
    pub(crate) fn udp_receive_from(
        &self,
        id: ChannelId,
        buf: &mut [u8],
    ) -> (i32, Option<SocketAddr>) {
        let inner = self.inner.borrow();
        let Some(item) = inner.udp.get(&id) else {
            return (error::ERR_CLOSED, None);
        };
        loop {
            match item.socket.recv_from(buf) {
                Ok((n, addr)) => return (n as i32, Some(addr)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return (0, None),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return (error::from_io(&err), None),
            }
        }
    }

    //-----------------------------------------------------------------
    //  Readiness dispatch.
    //-----------------------------------------------------------------

    fn kind_of(&self, id: ChannelId) -> Kind {
        let inner = self.inner.borrow();
        if inner.servers.contains_key(&id) {
            Kind::Server
        } else if inner.channels.contains_key(&id) {
            Kind::Channel
        } else if inner.clients.contains_key(&id) {
            Kind::Client
        } else if inner.udp.contains_key(&id) {
            Kind::Udp
        } else {
            Kind::Gone
        }
    }

    /// Translates one batch of selector readiness into channel operations.
    ///
    /// Reads run before writes, and closes strictly last, so data that
    /// arrives together with a FIN is delivered before the close callback.
    fn dispatch(&self, ctx: &Context, events: &SocketEvents) {
        for token in &events.read {
            let id = token.0;
            match self.kind_of(id) {
                Kind::Server => self.on_accept_ready(ctx, id),
                Kind::Channel => self.on_receive_ready(ctx, id),
                Kind::Client => self.on_client_ready(ctx, id),
                Kind::Udp => self.on_udp_ready(ctx, id),
                Kind::Gone => {}
            }
        }
        for token in &events.write {
            let id = token.0;
            match self.kind_of(id) {
                Kind::Channel => self.on_send_ready(ctx, id),
                Kind::Client => self.on_client_ready(ctx, id),
                _ => {}
            }
        }
        for token in &events.close {
            let id = token.0;
            match self.kind_of(id) {
                Kind::Channel => self.finalize_close(id),
                Kind::Client => self.on_client_ready(ctx, id),
                _ => {}
            }
        }
    }

    /// Accepts until the listener would block; each new channel is offered
    /// to the accept handler, which adopts it or lets it drop.
    fn on_accept_ready(&self, ctx: &Context, id: ChannelId) {
        enum Step {
            Got {
                sock: TcpStream,
                peer: SocketAddr,
                tls: Option<Arc<ServerConfig>>,
                handler: Rc<RefCell<AcceptHandler>>,
                server_local: SocketAddr,
            },
            Retry,
            Done,
        }

        loop {
            let step = {
                let mut inner = self.inner.borrow_mut();
                let inner = &mut *inner;
                let full = inner.selector.is_full();
                let Some(item) = inner.servers.get_mut(&id) else {
                    return;
                };
                match item.socket.accept() {
                    Ok((sock, peer)) => {
                        if full {
                            warn!(%peer, "socket table full, dropping connection");
                            Step::Retry
                        } else {
                            Step::Got {
                                sock,
                                peer,
                                tls: item.tls.clone(),
                                handler: item.accept.clone(),
                                server_local: item.local,
                            }
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => Step::Done,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => Step::Retry,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        Step::Done
                    }
                }
            };

            match step {
                Step::Got {
                    sock,
                    peer,
                    tls,
                    handler,
                    server_local,
                } => {
                    let fallback = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0);
                    let local = sock.local_addr().unwrap_or(fallback);
                    let socket = match tls {
                        Some(config) => match TlsStream::server(sock, config) {
                            Ok(tls) => NetSocket::Tls(Box::new(tls)),
                            Err(err) => {
                                warn!(%peer, error = %err, "TLS accept setup failed");
                                continue;
                            }
                        },
                        None => NetSocket::Plain(sock),
                    };

                    let core = Rc::new(RefCell::new(ChannelCore::Detached(Box::new(
                        DetachedChannel {
                            socket,
                            local,
                            peer,
                        },
                    ))));
                    let chan = TcpChannel::from_core(core);
                    let server = TcpServer::from_raw(self.clone(), id, server_local);
                    // An unadopted channel drops here, closing the socket.
                    (handler.borrow_mut())(ctx, &server, chan);
                }
                Step::Retry => continue,
                Step::Done => break,
            }
        }
    }

    fn on_receive_ready(&self, ctx: &Context, id: ChannelId) {
        let handshaking = self
            .inner
            .borrow()
            .channels
            .get(&id)
            .map(|item| item.socket.is_handshaking())
            .unwrap_or(false);
        if handshaking {
            self.drive_handshake(id);
            let still = self
                .inner
                .borrow()
                .channels
                .get(&id)
                .map(|item| item.socket.is_handshaking())
                .unwrap_or(true);
            if still {
                return;
            }
        }

        let invoke = {
            let inner = self.inner.borrow();
            inner
                .channels
                .get(&id)
                .map(|item| (item.receive.clone(), item.core.clone()))
        };
        if let Some((Some(handler), core)) = invoke {
            let chan = TcpChannel::from_core(core);
            (handler.borrow_mut())(ctx, &chan);
        }

        // EOF or a fatal error observed by receive() during the handler.
        let broken = self
            .inner
            .borrow()
            .channels
            .get(&id)
            .map(|item| item.eof || item.error != error::OK)
            .unwrap_or(false);
        if broken {
            self.finalize_close(id);
        }
    }

    fn on_send_ready(&self, _ctx: &Context, id: ChannelId) {
        let handshaking = self
            .inner
            .borrow()
            .channels
            .get(&id)
            .map(|item| item.socket.is_handshaking())
            .unwrap_or(false);
        if handshaking {
            self.drive_handshake(id);
            return;
        }

        let fatal = {
            let mut inner = self.inner.borrow_mut();
            Self::drain_send(&mut inner, id)
        };
        if fatal {
            self.finalize_close(id);
        }
    }

    /// Treats TLS handshake progress like ordinary readiness, re-invoking
    /// until the session reports completion.
    fn drive_handshake(&self, id: ChannelId) {
        let outcome = {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;
            let Some(item) = inner.channels.get_mut(&id) else {
                return;
            };
            match item.socket.handshake() {
                Ok(true) => 1,
                Ok(false) => {
                    let _ = inner.selector.reregister(
                        item.socket.source(),
                        Token(id),
                        Interest::READABLE | Interest::WRITABLE,
                    );
                    0
                }
                Err(err) => {
                    warn!(id, error = %err, "TLS handshake failed");
                    item.error = error::ERR_TLS;
                    -1
                }
            }
        };

        match outcome {
            1 => {
                // Established: flush anything queued during the handshake.
                let fatal = {
                    let mut inner = self.inner.borrow_mut();
                    Self::drain_send(&mut inner, id)
                };
                if fatal {
                    self.finalize_close(id);
                }
            }
            -1 => self.finalize_close(id),
            _ => {}
        }
    }

    fn on_udp_ready(&self, ctx: &Context, id: ChannelId) {
        let invoke = {
            let inner = self.inner.borrow();
            inner
                .udp
                .get(&id)
                .map(|item| (item.receive.clone(), item.local))
        };
        if let Some((handler, local)) = invoke {
            let receiver = UdpReceiver::from_raw(self.clone(), id, local);
            (handler.borrow_mut())(ctx, &receiver);
        }
    }

    /// Fires callbacks deferred during dispatch. Close callbacks were
    /// queued last for their channel, preserving the ordering contract.
    fn drain_pending(&self, ctx: &Context) {
        loop {
            let next = self.inner.borrow_mut().pending.pop_front();
            let Some(callback) = next else { break };
            match callback {
                Pending::Connect {
                    client,
                    handler,
                    code,
                } => handler(ctx, &client, code),
                Pending::SendDone {
                    chan,
                    handler,
                    code,
                } => handler(ctx, &chan, code),
                Pending::Close { chan, handler } => handler(ctx, &chan),
            }
        }
    }

    /// Drops every owned socket without firing callbacks. Teardown only.
    pub(crate) fn close_all(&self) {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;

        for (_, mut item) in inner.channels.drain() {
            inner.selector.unregister(item.socket.source());
            *item.core.borrow_mut() = ChannelCore::Closed;
        }
        for (_, mut item) in inner.clients.drain() {
            if let Some(mut socket) = item.socket.take() {
                inner.selector.unregister(socket.source());
            }
            *item.client.channel().core().borrow_mut() = ChannelCore::Closed;
        }
        for (_, mut item) in inner.servers.drain() {
            inner.selector.unregister(&mut item.socket);
        }
        for (_, mut item) in inner.udp.drain() {
            inner.selector.unregister(&mut item.socket);
        }
        inner.pending.clear();
    }
}

impl EventController for SocketController {
    fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// Two-source merge: socket readiness first, queued events second.
    fn wait(&self, timeout: Option<Duration>, ctx: &Context) -> (WaitResult, Option<Event>) {
        // Work already waiting means the poll must not block.
        let has_backlog =
            self.queue.pending() > 0 || !self.inner.borrow().pending.is_empty();
        let timeout = if has_backlog {
            Some(Duration::ZERO)
        } else {
            timeout
        };

        let events = match self.inner.borrow_mut().selector.wait(timeout) {
            Ok(events) => events,
            Err(err) => {
                warn!(error = %err, "selector wait failed");
                return (WaitResult::Error, None);
            }
        };

        if !events.is_empty() {
            self.dispatch(ctx, &events);
        }
        self.drain_pending(ctx);

        if self.queue.is_closed() {
            return (WaitResult::Cancel, None);
        }
        let (signalled, event) = self.queue.try_take();
        if event.is_some() {
            (WaitResult::Success, event)
        } else if signalled || events.woken {
            (WaitResult::Success, None)
        } else {
            (WaitResult::Timeout, None)
        }
    }

    fn wakeup(&self) {
        self.queue.wakeup();
    }
}
