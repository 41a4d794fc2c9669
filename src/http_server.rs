use crate::error;
use crate::event::event_id;
use crate::event_loop::Context;
use crate::http;
use crate::http::ContentReceiver;
use crate::http::HttpRequest;
use crate::http::HttpResponse;
use crate::tcp::TcpChannel;
use crate::tcp::TcpServer;
use crate::thread::Application;
use crate::thread::NetThread;
use crate::thread::ThreadHandle;
use crate::tls::TlsServerContext;
use crate::ws;
use crate::ws::WsChannel;
use anyhow::bail;
use anyhow::Result;
use serde::Deserialize;
use std::cell::Cell;
use std::cell::Ref;
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;
use tracing::warn;

pub type HttpRequestHandler = Rc<dyn Fn(&Context, &HttpChannel)>;

/// Routes request paths to handlers.
///
/// Keys ending in `/` are directory keys and match any request path they
/// prefix, longest key first. Other keys match exactly. Unrouted requests
/// go to the default handler, or a built-in 404.
#[derive(Default)]
pub struct HttpHandlerMap {
    files: HashMap<String, HttpRequestHandler>,
    dirs: HashMap<String, HttpRequestHandler>,
    default_handler: Option<HttpRequestHandler>,
}

impl HttpHandlerMap {
    pub fn new() -> HttpHandlerMap {
        HttpHandlerMap::default()
    }

    pub fn set_handler<F>(&mut self, path: &str, handler: F)
    where
        F: Fn(&Context, &HttpChannel) + 'static,
    {
        let handler: HttpRequestHandler = Rc::new(handler);
        if path.ends_with('/') {
            self.dirs.insert(path.to_owned(), handler);
        } else {
            self.files.insert(path.to_owned(), handler);
        }
    }

    pub fn set_default_handler<F>(&mut self, handler: F)
    where
        F: Fn(&Context, &HttpChannel) + 'static,
    {
        self.default_handler = Some(Rc::new(handler));
    }

    pub fn remove_handler(&mut self, path: &str) {
        if path.ends_with('/') {
            self.dirs.remove(path);
        } else {
            self.files.remove(path);
        }
    }

    pub fn clear(&mut self) {
        self.files.clear();
        self.dirs.clear();
        self.default_handler = None;
    }

    /// Exact file match, longest directory prefix, then the default.
    pub fn route(&self, path: &str) -> HttpRequestHandler {
        if let Some(handler) = self.files.get(path) {
            return handler.clone();
        }
        let mut best: Option<(&String, &HttpRequestHandler)> = None;
        for (key, handler) in &self.dirs {
            if path.starts_with(key.as_str()) {
                match best {
                    Some((current, _)) if current.len() >= key.len() => {}
                    _ => best = Some((key, handler)),
                }
            }
        }
        if let Some((_, handler)) = best {
            return handler.clone();
        }
        self.default_handler
            .clone()
            .unwrap_or_else(|| Rc::new(HttpHandlerMap::not_found))
    }

    /// The built-in default: `404 Not Found`.
    pub fn not_found(_ctx: &Context, channel: &HttpChannel) {
        channel.send_status(http::status::NOT_FOUND, "", "404 Not Found");
        channel.close();
    }
}

struct HttpChannelState {
    request: HttpRequest,
    buffer: Vec<u8>,
    head_done: bool,
    content: Option<ContentReceiver>,
    router: Option<HttpRequestHandler>,
    upgraded: bool,
}

/// A TCP channel speaking server-side HTTP/1.1.
///
/// Installs its own receive handler that parses requests off the stream
/// and invokes the routed handler once per complete message. Supports the
/// WebSocket upgrade.
#[derive(Clone)]
pub struct HttpChannel {
    chan: TcpChannel,
    state: Rc<RefCell<HttpChannelState>>,
}

impl HttpChannel {
    /// Takes over `chan`'s receive path. `router` is invoked for every
    /// parsed request.
    pub(crate) fn attach(chan: TcpChannel, router: HttpRequestHandler) -> HttpChannel {
        let channel = HttpChannel {
            chan: chan.clone(),
            state: Rc::new(RefCell::new(HttpChannelState {
                request: HttpRequest::default(),
                buffer: Vec::new(),
                head_done: false,
                content: None,
                router: Some(router),
                upgraded: false,
            })),
        };
        let me = channel.clone();
        chan.set_receive_handler(move |ctx, chan| me.on_tcp_receive(ctx, chan));
        channel
    }

    /// The most recently parsed request.
    pub fn request(&self) -> Ref<'_, HttpRequest> {
        Ref::map(self.state.borrow(), |state| &state.request)
    }

    pub fn take_request(&self) -> HttpRequest {
        std::mem::take(&mut self.state.borrow_mut().request)
    }

    pub fn tcp(&self) -> &TcpChannel {
        &self.chan
    }

    pub fn peer_endpoint(&self) -> Option<SocketAddr> {
        self.chan.peer_endpoint()
    }

    /// Serializes and sends the response; `Content-Length` is computed
    /// from the body.
    pub fn send_response(&self, response: &mut HttpResponse) -> i32 {
        if response.message.is_empty() {
            response.message = http::status_message(response.status_code).to_owned();
        }
        if response.status_code != http::status::SWITCHING_PROTOCOLS
            && !response.header.is_chunked()
        {
            response.header.set_content_length(response.body.len());
        }
        let mut wire = Vec::with_capacity(128 + response.body.len());
        response.serialize(&mut wire);
        self.chan.send(&wire)
    }

    pub fn send_status(&self, status_code: u16, message: &str, body: &str) -> i32 {
        let mut response = HttpResponse::new(status_code);
        if !message.is_empty() {
            response.message = message.to_owned();
        }
        response.set_body(body.as_bytes());
        self.send_response(&mut response)
    }

    /// Graceful close; queued response bytes drain first.
    pub fn close(&self) {
        self.chan.close();
    }

    pub fn set_close_handler<F>(&self, handler: F) -> bool
    where
        F: FnOnce(&Context, &TcpChannel) + 'static,
    {
        self.chan.set_close_handler(move |ctx, chan| handler(ctx, chan))
    }

    //-----------------------------------------------------------------
    //  WebSocket upgrade.
    //-----------------------------------------------------------------

    /// Whether the parsed request carries all required upgrade headers.
    pub fn is_ws_handshake_request(&self) -> bool {
        ws::is_handshake_request(&self.state.borrow().request)
    }

    /// Responds `101 Switching Protocols` with the computed accept key.
    pub fn send_ws_handshake_response(&self, protocol: &str) -> i32 {
        let key = {
            let state = self.state.borrow();
            match state.request.header.find_one("Sec-WebSocket-Key") {
                Some(key) => key.to_owned(),
                None => return error::ERR_PROTOCOL,
            }
        };
        let mut response = HttpResponse::new(http::status::SWITCHING_PROTOCOLS);
        response.header.add("Upgrade", "websocket");
        response.header.add("Connection", "Upgrade");
        response
            .header
            .add("Sec-WebSocket-Accept", &ws::accept_key(&key));
        if !protocol.is_empty() {
            response.header.add("Sec-WebSocket-Protocol", protocol);
        }
        self.send_response(&mut response)
    }

    /// Transfers the TCP channel to a server-side `WsChannel`; this
    /// channel stops parsing HTTP. Bytes received past the handshake
    /// request carry over into the frame parser.
    pub fn upgrade_to_web_socket(&self, ctx: &Context) -> Result<WsChannel> {
        if self.chan.is_closed() {
            bail!("connection is closed");
        }
        let leftover = {
            let mut state = self.state.borrow_mut();
            state.upgraded = true;
            std::mem::take(&mut state.buffer)
        };
        let ws = WsChannel::attach_with(self.chan.clone(), false, leftover);
        ws.schedule_cache_parse(ctx);
        Ok(ws)
    }

    //-----------------------------------------------------------------
    //  Parsing.
    //-----------------------------------------------------------------

    fn on_tcp_receive(&self, ctx: &Context, chan: &TcpChannel) {
        let data = chan.receive_all(4096);
        if data.is_empty() {
            return;
        }
        if self.state.borrow().upgraded {
            return;
        }
        self.state.borrow_mut().buffer.extend_from_slice(&data);

        loop {
            enum Step {
                NeedMore,
                Bad,
                Dispatch,
            }

            let step = {
                let mut state = self.state.borrow_mut();
                if state.upgraded {
                    return;
                }

                if !state.head_done {
                    match http::parse_request_head(&state.buffer) {
                        Err(err) => {
                            debug!(error = %err, "bad request");
                            Step::Bad
                        }
                        Ok(None) => Step::NeedMore,
                        Ok(Some((head, consumed))) => {
                            state.buffer.drain(..consumed);
                            state.content = Some(ContentReceiver::for_request(&head.header));
                            state.request = head;
                            state.head_done = true;
                            Step::NeedMore // fall through to the body below
                        }
                    }
                } else {
                    Step::NeedMore
                }
            };
            if matches!(step, Step::Bad) {
                self.reject(ctx);
                return;
            }

            let step = {
                let mut state = self.state.borrow_mut();
                if !state.head_done {
                    Step::NeedMore
                } else {
                    let buffer = std::mem::take(&mut state.buffer);
                    let outcome = match state.content.as_mut() {
                        Some(content) => content.feed(&buffer),
                        None => Ok(0),
                    };
                    match outcome {
                        Err(err) => {
                            debug!(error = %err, "bad request body");
                            Step::Bad
                        }
                        Ok(consumed) => {
                            state.buffer = buffer[consumed..].to_vec();
                            let done = state
                                .content
                                .as_ref()
                                .map(|content| content.is_done())
                                .unwrap_or(true);
                            if done {
                                let body = state
                                    .content
                                    .as_mut()
                                    .map(|content| content.take_body())
                                    .unwrap_or_default();
                                state.request.body = body;
                                state.head_done = false;
                                state.content = None;
                                Step::Dispatch
                            } else {
                                Step::NeedMore
                            }
                        }
                    }
                }
            };

            match step {
                Step::Bad => {
                    self.reject(ctx);
                    return;
                }
                Step::Dispatch => {
                    let router = self.state.borrow().router.clone();
                    if let Some(router) = router {
                        router(ctx, self);
                    }
                    let state = self.state.borrow();
                    if state.upgraded || state.buffer.is_empty() {
                        return;
                    }
                    // Pipelined request: keep parsing.
                }
                Step::NeedMore => return,
            }
        }
    }

    /// Protocol violation: answer 400 and close.
    fn reject(&self, _ctx: &Context) {
        self.send_status(http::status::BAD_REQUEST, "", "400 Bad Request");
        self.close();
    }
}

/// A single-threaded HTTP server: listener, channels and handlers all on
/// the opening thread.
pub struct HttpServer {
    server: TcpServer,
    handlers: Rc<RefCell<HttpHandlerMap>>,
}

impl HttpServer {
    pub fn open(ctx: &Context, local: SocketAddr) -> Result<HttpServer> {
        HttpServer::open_with(ctx, local, None)
    }

    pub fn open_tls(
        ctx: &Context,
        local: SocketAddr,
        tls: &TlsServerContext,
    ) -> Result<HttpServer> {
        HttpServer::open_with(ctx, local, Some(tls))
    }

    fn open_with(
        ctx: &Context,
        local: SocketAddr,
        tls: Option<&TlsServerContext>,
    ) -> Result<HttpServer> {
        let handlers = Rc::new(RefCell::new(HttpHandlerMap::new()));

        let map = handlers.clone();
        let accept = move |ctx: &Context, _server: &TcpServer, chan: TcpChannel| {
            if TcpServer::accept(ctx, &chan).is_err() {
                return;
            }
            attach_routed_channel(&map, chan);
        };

        let server = match tls {
            Some(tls) => TcpServer::open_tls(ctx, local, tls, accept)?,
            None => TcpServer::open(ctx, local, accept)?,
        };
        Ok(HttpServer { server, handlers })
    }

    pub fn set_request_handler<F>(&self, path: &str, handler: F)
    where
        F: Fn(&Context, &HttpChannel) + 'static,
    {
        self.handlers.borrow_mut().set_handler(path, handler);
    }

    pub fn set_default_request_handler<F>(&self, handler: F)
    where
        F: Fn(&Context, &HttpChannel) + 'static,
    {
        self.handlers.borrow_mut().set_default_handler(handler);
    }

    pub fn close(&self) {
        self.server.close();
    }

    pub fn local_endpoint(&self) -> SocketAddr {
        self.server.local_endpoint()
    }
}

/// Wraps an adopted channel in an `HttpChannel` routed through `map`.
fn attach_routed_channel(map: &Rc<RefCell<HttpHandlerMap>>, chan: TcpChannel) {
    let map = map.clone();
    let router: HttpRequestHandler = Rc::new(move |ctx: &Context, http: &HttpChannel| {
        let path = {
            let request = http.request();
            // Route on the path alone, not the query.
            match request.path.split('?').next() {
                Some(path) if !path.is_empty() => path.to_owned(),
                _ => "/".to_owned(),
            }
        };
        let handler = map.borrow().route(&path);
        handler(ctx, http);
    });
    HttpChannel::attach(chan, router);
}

/// Handlers shared across worker threads.
type SharedHandler = Arc<dyn Fn(&Context, &HttpChannel) + Send + Sync>;

/// Multi-worker pool configuration.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ServerOption {
    pub workers: usize,
    /// A worker refuses new channels past this count.
    pub max_channels_per_worker: usize,
}

impl Default for ServerOption {
    fn default() -> ServerOption {
        ServerOption {
            workers: 4,
            max_channels_per_worker: 100,
        }
    }
}

/// An HTTP server with one listener thread (the application thread) and a
/// pool of worker threads. Accepted channels are handed out round-robin;
/// each worker caps its channel count and refuses overflow.
///
/// Register handlers before calling `open`; they are snapshotted into
/// each worker at spawn time.
pub struct HttpServerApp {
    app: Application,
    option: ServerOption,
    routes: Vec<(String, SharedHandler)>,
    default_route: Option<SharedHandler>,
    tls: Option<TlsServerContext>,
    workers: Vec<NetThread>,
    server: Option<TcpServer>,
}

impl HttpServerApp {
    pub fn new(option: ServerOption) -> Result<HttpServerApp> {
        Ok(HttpServerApp {
            app: Application::new("http-server")?,
            option,
            routes: Vec::new(),
            default_route: None,
            tls: None,
            workers: Vec::new(),
            server: None,
        })
    }

    pub fn set_request_handler<F>(&mut self, path: &str, handler: F)
    where
        F: Fn(&Context, &HttpChannel) + Send + Sync + 'static,
    {
        self.routes.push((path.to_owned(), Arc::new(handler)));
    }

    pub fn set_default_request_handler<F>(&mut self, handler: F)
    where
        F: Fn(&Context, &HttpChannel) + Send + Sync + 'static,
    {
        self.default_route = Some(Arc::new(handler));
    }

    pub fn set_tls(&mut self, tls: TlsServerContext) {
        self.tls = Some(tls);
    }

    /// Spawns the workers and opens the listener. Returns the bound
    /// address.
    pub fn open(&mut self, listen: SocketAddr) -> Result<SocketAddr> {
        if self.server.is_some() {
            bail!("server is already open");
        }

        let worker_count = self.option.workers.max(1);
        let cap = self.option.max_channels_per_worker;
        let mut handles: Vec<ThreadHandle> = Vec::with_capacity(worker_count);

        for index in 0..worker_count {
            let routes = self.routes.clone();
            let default_route = self.default_route.clone();
            let worker = NetThread::spawn_child(
                &format!("http-worker-{index}"),
                self.app.context(),
                move |ctx| {
                    let mut map = HttpHandlerMap::new();
                    for (path, handler) in routes {
                        map.set_handler(&path, move |ctx: &Context, chan: &HttpChannel| {
                            handler(ctx, chan)
                        });
                    }
                    if let Some(handler) = default_route {
                        map.set_default_handler(move |ctx: &Context, chan: &HttpChannel| {
                            handler(ctx, chan)
                        });
                    }
                    let map = Rc::new(RefCell::new(map));

                    ctx.set_handler(event_id::TCP_ACCEPT, move |ctx, event| {
                        let at_capacity = ctx
                            .sockets()
                            .map(|sockets| sockets.socket_count() >= cap)
                            .unwrap_or(true);
                        if at_capacity {
                            // Dropping the event closes the carried socket.
                            warn!("worker at capacity, refusing channel");
                            return;
                        }
                        match TcpServer::accept_event(ctx, event) {
                            Ok(chan) => attach_routed_channel(&map, chan),
                            Err(err) => debug!(error = %err, "accept handoff failed"),
                        }
                    });
                    Ok(())
                },
            )?;
            handles.push(worker.handle());
            self.workers.push(worker);
        }

        let next = Cell::new(0_usize);
        let accept = move |_ctx: &Context, _server: &TcpServer, chan: TcpChannel| {
            let index = next.get();
            next.set((index + 1) % handles.len());
            if let Err(err) = TcpServer::accept_on(&handles[index], &chan) {
                debug!(error = %err, "worker handoff failed");
            }
        };

        let ctx = self.app.context();
        let server = match &self.tls {
            Some(tls) => TcpServer::open_tls(ctx, listen, tls, accept)?,
            None => TcpServer::open(ctx, listen, accept)?,
        };
        let local = server.local_endpoint();
        self.server = Some(server);
        Ok(local)
    }

    pub fn context(&self) -> &Context {
        self.app.context()
    }

    /// A handle for stopping the listener from another thread.
    pub fn handle(&self) -> ThreadHandle {
        self.app.handle()
    }

    /// Runs the listener loop until stopped, then winds the workers down.
    pub fn run(&mut self) {
        self.app.run();
        if let Some(server) = self.server.take() {
            server.close();
        }
        for worker in self.workers.drain(..) {
            worker.stop();
            worker.join();
        }
    }

    pub fn stop(&self) {
        self.app.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(tag: &'static str) -> (HttpRequestHandler, Rc<RefCell<Vec<&'static str>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();
        let handler: HttpRequestHandler = Rc::new(move |_ctx: &Context, _chan: &HttpChannel| {
            log2.borrow_mut().push(tag);
        });
        (handler, log)
    }

    #[test]
    fn file_keys_match_exactly() {
        let mut map = HttpHandlerMap::new();
        let (file, _log) = handler("file");
        map.files.insert("/index.html".to_owned(), file);

        assert!(Rc::ptr_eq(
            &map.route("/index.html"),
            map.files.get("/index.html").unwrap()
        ));
    }

    #[test]
    fn directory_keys_use_longest_prefix() {
        let mut map = HttpHandlerMap::new();
        let (short, _a) = handler("short");
        let (long, _b) = handler("long");
        map.dirs.insert("/api/".to_owned(), short);
        map.dirs.insert("/api/v2/".to_owned(), long);

        assert!(Rc::ptr_eq(
            &map.route("/api/v2/users"),
            map.dirs.get("/api/v2/").unwrap()
        ));
        assert!(Rc::ptr_eq(
            &map.route("/api/other"),
            map.dirs.get("/api/").unwrap()
        ));
    }

    #[test]
    fn exact_file_wins_over_directory() {
        let mut map = HttpHandlerMap::new();
        let (file, _a) = handler("file");
        let (dir, _b) = handler("dir");
        map.files.insert("/api/status".to_owned(), file);
        map.dirs.insert("/api/".to_owned(), dir);

        assert!(Rc::ptr_eq(
            &map.route("/api/status"),
            map.files.get("/api/status").unwrap()
        ));
    }

    #[test]
    fn unrouted_paths_fall_back_to_default() {
        let mut map = HttpHandlerMap::new();
        let (default_handler, log) = handler("default");
        map.default_handler = Some(default_handler);

        let routed = map.route("/nowhere");
        assert!(log.borrow().is_empty());
        drop(routed);

        // Without a default the built-in 404 handler is returned.
        map.default_handler = None;
        let _ = map.route("/nowhere");
    }
}
