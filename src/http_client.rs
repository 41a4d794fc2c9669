use crate::error;
use crate::event_loop::Context;
use crate::http;
use crate::http::HttpRequest;
use crate::http::HttpResponse;
use crate::http::HttpUrl;
use crate::http::ContentReceiver;
use crate::tcp::TcpChannel;
use crate::tcp::TcpClient;
use crate::thread::Worker;
use crate::tls::TlsClientContext;
use crate::ws;
use crate::ws::WsChannel;
use anyhow::bail;
use anyhow::Result;
use serde::Deserialize;
use sha::sha1::Sha1;
use sha::utils::Digest;
use sha::utils::DigestExt;
use std::cell::Cell;
use std::cell::Ref;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

const DEFAULT_USER_AGENT: &str = concat!("sirocco/", env!("CARGO_PKG_VERSION"));

/// Per-request knobs. Loadable from configuration; the TLS context is
/// supplied programmatically.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct RequestOption {
    /// Connect timeout per endpoint candidate, in milliseconds.
    pub timeout_ms: u32,
    pub allow_redirect: bool,
    pub max_redirects: u32,
    pub user_agent: String,
    #[serde(skip)]
    pub tls: Option<TlsClientContext>,
}

impl Default for RequestOption {
    fn default() -> RequestOption {
        RequestOption {
            timeout_ms: TcpClient::DEFAULT_TIMEOUT_MS,
            allow_redirect: true,
            max_redirects: 10,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            tls: None,
        }
    }
}

pub type ResponseHandler = Box<dyn FnOnce(&Context, &HttpClient, i32)>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    Idle,
    Resolving,
    Connecting,
    Sending,
    Receiving,
    Redirecting,
    Done,
}

struct ClientState {
    url: HttpUrl,
    request: HttpRequest,
    response: HttpResponse,
    phase: Phase,
    tcp: TcpClient,
    handler: Option<ResponseHandler>,
    option: RequestOption,
    // SHA-1 digests of every absolute URL visited, for cycle detection.
    history: Vec<String>,
    redirects: u32,
    buffer: Vec<u8>,
    head_done: bool,
    content: Option<ContentReceiver>,
    ws_key: Option<String>,
}

/// An HTTP/1.1 client driving one request at a time over a fresh
/// connection, with redirect handling and the WebSocket upgrade path.
#[derive(Clone)]
pub struct HttpClient {
    state: Rc<RefCell<ClientState>>,
}

impl Default for HttpClient {
    fn default() -> Self {
        HttpClient::new()
    }
}

impl HttpClient {
    pub fn new() -> HttpClient {
        HttpClient {
            state: Rc::new(RefCell::new(ClientState {
                url: HttpUrl::default(),
                request: HttpRequest::default(),
                response: HttpResponse::default(),
                phase: Phase::Idle,
                tcp: TcpClient::new(),
                handler: None,
                option: RequestOption::default(),
                history: Vec::new(),
                redirects: 0,
                buffer: Vec::new(),
                head_done: false,
                content: None,
                ws_key: None,
            })),
        }
    }

    //-----------------------------------------------------------------
    //  Issuing requests.
    //-----------------------------------------------------------------

    /// Starts `method url` and reports the terminal outcome to `handler`
    /// (`0` on success). Redirects are followed per the option, with
    /// SHA-1 URL history breaking cycles.
    pub fn request<F>(
        &self,
        ctx: &Context,
        method: &str,
        url: &str,
        body: Vec<u8>,
        option: RequestOption,
        handler: F,
    ) -> Result<()>
    where
        F: FnOnce(&Context, &HttpClient, i32) + 'static,
    {
        self.prepare(method, url, body, option, Box::new(handler))?;
        self.start(ctx).map_err(|err| {
            self.abandon();
            err
        })
    }

    pub fn get<F>(&self, ctx: &Context, url: &str, handler: F) -> Result<()>
    where
        F: FnOnce(&Context, &HttpClient, i32) + 'static,
    {
        self.request(ctx, "GET", url, Vec::new(), RequestOption::default(), handler)
    }

    pub fn post<F>(&self, ctx: &Context, url: &str, body: Vec<u8>, handler: F) -> Result<()>
    where
        F: FnOnce(&Context, &HttpClient, i32) + 'static,
    {
        self.request(ctx, "POST", url, body, RequestOption::default(), handler)
    }

    pub fn put<F>(&self, ctx: &Context, url: &str, body: Vec<u8>, handler: F) -> Result<()>
    where
        F: FnOnce(&Context, &HttpClient, i32) + 'static,
    {
        self.request(ctx, "PUT", url, body, RequestOption::default(), handler)
    }

    pub fn delete<F>(&self, ctx: &Context, url: &str, handler: F) -> Result<()>
    where
        F: FnOnce(&Context, &HttpClient, i32) + 'static,
    {
        self.request(ctx, "DELETE", url, Vec::new(), RequestOption::default(), handler)
    }

    pub fn patch<F>(&self, ctx: &Context, url: &str, body: Vec<u8>, handler: F) -> Result<()>
    where
        F: FnOnce(&Context, &HttpClient, i32) + 'static,
    {
        self.request(ctx, "PATCH", url, body, RequestOption::default(), handler)
    }

    pub fn head<F>(&self, ctx: &Context, url: &str, handler: F) -> Result<()>
    where
        F: FnOnce(&Context, &HttpClient, i32) + 'static,
    {
        self.request(ctx, "HEAD", url, Vec::new(), RequestOption::default(), handler)
    }

    /// Synchronous convenience: drives a private event loop on the
    /// calling thread until the request completes.
    pub fn request_sync(
        method: &str,
        url: &str,
        body: Vec<u8>,
        option: RequestOption,
    ) -> Result<(i32, HttpResponse)> {
        let mut worker = Worker::new_net("http-client")?;
        let client = HttpClient::new();

        let code = Rc::new(Cell::new(None));
        let seen = code.clone();
        client.request(worker.context(), method, url, body, option, move |ctx, _client, rc| {
            seen.set(Some(rc));
            ctx.stop();
        })?;
        worker.run();

        let rc = code.get().unwrap_or(error::ERR_INCOMPLETE);
        Ok((rc, client.take_response()))
    }

    //-----------------------------------------------------------------
    //  Results.
    //-----------------------------------------------------------------

    pub fn response(&self) -> Ref<'_, HttpResponse> {
        Ref::map(self.state.borrow(), |state| &state.response)
    }

    pub fn take_response(&self) -> HttpResponse {
        std::mem::take(&mut self.state.borrow_mut().response)
    }

    pub fn status_code(&self) -> u16 {
        self.state.borrow().response.status_code
    }

    pub fn url(&self) -> HttpUrl {
        self.state.borrow().url.clone()
    }

    pub fn is_response_completed(&self) -> bool {
        self.state.borrow().phase == Phase::Done
    }

    //-----------------------------------------------------------------
    //  WebSocket handshake.
    //-----------------------------------------------------------------

    /// Sends the `ws`/`wss` upgrade request. On completion the caller
    /// checks status 101, `verify_ws_handshake_response`, then
    /// `upgrade_to_web_socket`.
    pub fn request_ws_handshake<F>(
        &self,
        ctx: &Context,
        url: &str,
        protocol: &str,
        handler: F,
    ) -> Result<()>
    where
        F: FnOnce(&Context, &HttpClient, i32) + 'static,
    {
        let mut option = RequestOption::default();
        option.allow_redirect = false;
        self.prepare("GET", url, Vec::new(), option, Box::new(handler))?;

        let key = ws::generate_key();
        {
            let mut state = self.state.borrow_mut();
            if !state.url.is_websocket() {
                state.phase = Phase::Idle;
                bail!("not a websocket URL");
            }
            state.request.header.add("Upgrade", "websocket");
            state.request.header.add("Connection", "Upgrade");
            state.request.header.add("Sec-WebSocket-Version", "13");
            state.request.header.add("Sec-WebSocket-Key", &key);
            if !protocol.is_empty() {
                state.request.header.add("Sec-WebSocket-Protocol", protocol);
            }
            state.ws_key = Some(key);
        }
        self.start(ctx).map_err(|err| {
            self.abandon();
            err
        })
    }

    /// Verifies status, upgrade headers and the `Sec-WebSocket-Accept`
    /// digest of the handshake response.
    pub fn verify_ws_handshake_response(&self) -> bool {
        let state = self.state.borrow();
        let Some(key) = &state.ws_key else {
            return false;
        };
        let response = &state.response;
        response.status_code == http::status::SWITCHING_PROTOCOLS
            && response
                .header
                .find_one("Upgrade")
                .map(|value| value.eq_ignore_ascii_case("websocket"))
                .unwrap_or(false)
            && response.header.value_has_token("Connection", "upgrade")
            && response.header.find_one("Sec-WebSocket-Accept")
                == Some(ws::accept_key(key).as_str())
    }

    /// Transfers the underlying TCP channel to a new client-side
    /// `WsChannel`. Bytes received past the handshake response carry
    /// over into the frame parser.
    pub fn upgrade_to_web_socket(&self, ctx: &Context) -> Result<WsChannel> {
        let (channel, leftover) = {
            let mut state = self.state.borrow_mut();
            let leftover = std::mem::take(&mut state.buffer);
            (state.tcp.channel().clone(), leftover)
        };
        if channel.is_closed() {
            bail!("connection is closed");
        }
        let ws = WsChannel::attach_with(channel, true, leftover);
        ws.schedule_cache_parse(ctx);
        Ok(ws)
    }

    //-----------------------------------------------------------------
    //  Internals.
    //-----------------------------------------------------------------

    fn prepare(
        &self,
        method: &str,
        url: &str,
        body: Vec<u8>,
        option: RequestOption,
        handler: ResponseHandler,
    ) -> Result<()> {
        let parsed = HttpUrl::parse(url)?;
        let mut state = self.state.borrow_mut();
        if !matches!(state.phase, Phase::Idle | Phase::Done) {
            bail!("a request is already in flight");
        }
        state.url = parsed;
        state.request = HttpRequest::new(method, "/");
        state.request.body = body;
        state.response = HttpResponse::default();
        state.handler = Some(handler);
        state.option = option;
        state.history.clear();
        state.redirects = 0;
        state.buffer.clear();
        state.head_done = false;
        state.content = None;
        state.ws_key = None;
        state.phase = Phase::Idle;
        Ok(())
    }

    /// Connects to the current URL; one hop of the request state machine.
    fn start(&self, ctx: &Context) -> Result<()> {
        let (address, secure, timeout, tls) = {
            let mut state = self.state.borrow_mut();
            state.phase = Phase::Resolving;
            let url_hash = sha1_hex(&state.url.compose());
            state.history.push(url_hash);
            state.tcp = TcpClient::new();
            (
                state.url.address(),
                state.url.is_secure(),
                state.option.timeout_ms,
                state.option.tls.clone(),
            )
        };

        let me = self.clone();
        let on_connect = move |ctx: &Context, _client: &TcpClient, code: i32| {
            if code != error::OK {
                me.finish(ctx, code);
            } else {
                me.on_connected(ctx);
            }
        };

        let tcp = self.state.borrow().tcp.clone();
        let connected = if secure {
            let tls = match tls {
                Some(tls) => tls,
                None => TlsClientContext::new()?,
            };
            tcp.connect_tls(ctx, &address, &tls, on_connect, timeout)
        } else {
            tcp.connect(ctx, &address, on_connect, timeout)
        };
        self.state.borrow_mut().phase = Phase::Connecting;
        connected
    }

    fn on_connected(&self, ctx: &Context) {
        let (wire, channel) = {
            let mut state = self.state.borrow_mut();
            state.phase = Phase::Sending;
            state.request.path = state.url.request_target();

            let host = state.url.host_header();
            let user_agent = state.option.user_agent.clone();
            let body_len = state.request.body.len();
            let header = &mut state.request.header;
            if !header.contains("Host") {
                header.set("Host", &host);
            }
            if !header.contains("User-Agent") {
                header.set("User-Agent", &user_agent);
            }
            if !header.contains("Accept") {
                header.set("Accept", "*/*");
            }
            if !header.contains("Connection") {
                header.set("Connection", "close");
            }
            if body_len > 0 {
                header.set_content_length(body_len);
            } else {
                header.remove("Content-Length");
            }

            let mut wire = Vec::with_capacity(256 + body_len);
            state.request.serialize(&mut wire);
            (wire, state.tcp.channel().clone())
        };

        let me = self.clone();
        channel.set_receive_handler(move |ctx, chan| me.on_receive(ctx, chan));
        let me = self.clone();
        channel.set_close_handler(move |ctx, chan| me.on_close(ctx, chan));

        let me = self.clone();
        let rc = channel.send_with(&wire, move |ctx, chan, code| {
            if !me.is_current_hop(chan) {
                return;
            }
            if code == error::OK {
                let mut state = me.state.borrow_mut();
                if state.phase == Phase::Sending {
                    state.phase = Phase::Receiving;
                }
            } else {
                me.finish(ctx, code);
            }
        });
        if rc < 0 {
            self.finish(ctx, rc);
        }
    }

    /// Whether `chan` is the transport of the hop currently in flight.
    /// Channels from earlier redirect hops still deliver callbacks while
    /// they wind down; those are ignored.
    fn is_current_hop(&self, chan: &TcpChannel) -> bool {
        let state = self.state.borrow();
        *chan == *state.tcp.channel()
    }

    /// Drops request state after a synchronous start failure, so the
    /// client can be reused.
    fn abandon(&self) {
        let mut state = self.state.borrow_mut();
        state.phase = Phase::Done;
        state.handler = None;
    }

    fn on_receive(&self, ctx: &Context, channel: &TcpChannel) {
        if !self.is_current_hop(channel) {
            return;
        }
        let data = channel.receive_all(4096);
        if data.is_empty() {
            return;
        }
        match self.consume(&data) {
            Err(err) => {
                debug!(error = %err, "bad response");
                channel.close();
                self.finish(ctx, error::ERR_PROTOCOL);
            }
            Ok(true) => self.on_response_complete(ctx),
            Ok(false) => {}
        }
    }

    /// Feeds received bytes through the head parser and body framer.
    /// Returns `Ok(true)` when the response is complete.
    fn consume(&self, data: &[u8]) -> Result<bool> {
        let mut state = self.state.borrow_mut();
        state.buffer.extend_from_slice(data);

        loop {
            if !state.head_done {
                let parsed = http::parse_response_head(&state.buffer)?;
                let Some((head, consumed)) = parsed else {
                    return Ok(false);
                };
                state.buffer.drain(..consumed);

                // Interim 1xx responses (other than 101) are skipped.
                if head.status_code / 100 == 1
                    && head.status_code != http::status::SWITCHING_PROTOCOLS
                {
                    continue;
                }

                let was_head = state.request.method.eq_ignore_ascii_case("HEAD");
                let receiver =
                    ContentReceiver::for_response(was_head, head.status_code, &head.header);
                state.response = head;
                state.content = Some(receiver);
                state.head_done = true;
            }

            let buffer = std::mem::take(&mut state.buffer);
            let Some(content) = state.content.as_mut() else {
                return Ok(false);
            };
            let consumed = content.feed(&buffer)?;
            state.buffer = buffer[consumed..].to_vec();

            if state
                .content
                .as_ref()
                .map(|content| content.is_done())
                .unwrap_or(false)
            {
                let body = state.content.as_mut().map(|c| c.take_body()).unwrap_or_default();
                state.response.body = body;
                return Ok(true);
            }
            return Ok(false);
        }
    }

    fn on_close(&self, ctx: &Context, channel: &TcpChannel) {
        if !self.is_current_hop(channel) {
            return;
        }
        let outcome = {
            let mut state = self.state.borrow_mut();
            match state.phase {
                Phase::Receiving => {
                    // Read-until-close framing completes here.
                    let done = state
                        .content
                        .as_mut()
                        .map(|content| content.on_eof())
                        .unwrap_or(false);
                    if done {
                        let body =
                            state.content.as_mut().map(|c| c.take_body()).unwrap_or_default();
                        state.response.body = body;
                    }
                    Some(done)
                }
                Phase::Connecting | Phase::Sending => Some(false),
                _ => None,
            }
        };
        match outcome {
            Some(true) => self.on_response_complete(ctx),
            Some(false) => self.finish(ctx, error::ERR_INCOMPLETE),
            None => {}
        }
    }

    fn on_response_complete(&self, ctx: &Context) {
        let (channel, upgraded, redirect) = {
            let state = self.state.borrow();
            let status = state.response.status_code;
            let upgraded = status == http::status::SWITCHING_PROTOCOLS;
            let redirect = state.option.allow_redirect
                && matches!(status, 301 | 302 | 303 | 307 | 308)
                && state.response.header.contains("Location");
            (state.tcp.channel().clone(), upgraded, redirect)
        };

        // The upgraded transport stays open for the WebSocket layer.
        if !upgraded {
            channel.close();
        }

        if redirect {
            self.follow_redirect(ctx);
            return;
        }
        self.finish(ctx, error::OK);
    }

    fn follow_redirect(&self, ctx: &Context) {
        let next = {
            let mut state = self.state.borrow_mut();
            if state.redirects >= state.option.max_redirects {
                None
            } else {
                let location = state
                    .response
                    .header
                    .find_one("Location")
                    .unwrap_or("")
                    .to_owned();
                match state.url.join(&location) {
                    Err(_) => Some(Err(error::ERR_PROTOCOL)),
                    Ok(next) => {
                        let digest = sha1_hex(&next.compose());
                        if state.history.contains(&digest) {
                            Some(Err(error::ERR_REDIRECT_LOOP))
                        } else {
                            if state.response.status_code == http::status::SEE_OTHER {
                                state.request.method = "GET".to_owned();
                                state.request.body.clear();
                            }
                            debug!(url = %next.compose(), hop = state.redirects + 1, "redirect");
                            state.url = next;
                            state.redirects += 1;
                            state.buffer.clear();
                            state.head_done = false;
                            state.content = None;
                            state.response = HttpResponse::default();
                            state.phase = Phase::Redirecting;
                            Some(Ok(()))
                        }
                    }
                }
            }
        };

        match next {
            None => self.finish(ctx, error::ERR_TOO_MANY_REDIRECTS),
            Some(Err(code)) => self.finish(ctx, code),
            Some(Ok(())) => {
                if self.start(ctx).is_err() {
                    self.finish(ctx, error::ERR_IO);
                }
            }
        }
    }

    fn finish(&self, ctx: &Context, code: i32) {
        let handler = {
            let mut state = self.state.borrow_mut();
            if state.phase == Phase::Done {
                return;
            }
            state.phase = Phase::Done;
            state.handler.take()
        };
        if let Some(handler) = handler {
            handler(ctx, self, code);
        }
    }
}

fn sha1_hex(input: &str) -> String {
    Sha1::default().digest(input.as_bytes()).to_hex()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_option_is_sensible() {
        let option = RequestOption::default();
        assert_eq!(option.timeout_ms, 15_000);
        assert!(option.allow_redirect);
        assert_eq!(option.max_redirects, 10);
    }

    #[test]
    fn url_digests_are_stable_per_url() {
        let a = sha1_hex("http://example.com/");
        let b = sha1_hex("http://example.com/");
        let c = sha1_hex("http://example.com/other");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn request_rejected_while_in_flight() {
        let client = HttpClient::new();
        client.state.borrow_mut().phase = Phase::Receiving;
        let result = client.prepare(
            "GET",
            "http://example.com/",
            Vec::new(),
            RequestOption::default(),
            Box::new(|_, _, _| {}),
        );
        assert!(result.is_err());
    }
}
