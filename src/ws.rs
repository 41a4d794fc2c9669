use crate::cursor::ByteReader;
use crate::cursor::ByteWriter;
use crate::error;
use crate::event_loop::Context;
use crate::http::HttpRequest;
use crate::tcp::TcpChannel;
use crate::timer::Timer;
use crate::timer::TimerId;
use anyhow::bail;
use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha::sha1::Sha1;
use sha::utils::Digest;
use sha::utils::DigestExt;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// Fixed GUID appended to the client key when computing
/// `Sec-WebSocket-Accept`.
pub const KEY_SUFFIX: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest accepted frame payload.
const MAX_PAYLOAD: u64 = 64 * 1024 * 1024;

/// How long the close handshake waits for the peer's Close frame.
const CLOSE_HANDSHAKE_TIMEOUT_MS: u64 = 15_000;

pub mod opcode {
    pub const CONTINUATION: u8 = 0x0;
    pub const TEXT: u8 = 0x1;
    pub const BINARY: u8 = 0x2;
    pub const CLOSE: u8 = 0x8;
    pub const PING: u8 = 0x9;
    pub const PONG: u8 = 0xA;
}

/// Close status codes from RFC 6455 §7.4.1.
pub mod close_code {
    pub const NORMAL_CLOSURE: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const NO_STATUS_RECEIVED: u16 = 1005;
    pub const ABNORMAL_CLOSURE: u16 = 1006;
    pub const INVALID_FRAME_PAYLOAD_DATA: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const MISSING_EXTENSION: u16 = 1010;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const TLS_HANDSHAKE: u16 = 1015;
}

/// One WebSocket protocol unit.
///
/// `payload` always holds unmasked bytes; `masked` records whether the
/// wire form carried (or will carry) a masking key.
#[derive(Clone, Debug)]
pub struct WsFrame {
    pub fin: bool,
    pub opcode: u8,
    pub masked: bool,
    pub masking_key: [u8; 4],
    pub payload: Vec<u8>,
}

impl WsFrame {
    pub fn new(opcode: u8) -> WsFrame {
        WsFrame {
            fin: true,
            opcode,
            masked: false,
            masking_key: [0; 4],
            payload: Vec::new(),
        }
    }

    pub fn binary(payload: Vec<u8>) -> WsFrame {
        WsFrame {
            payload,
            ..WsFrame::new(opcode::BINARY)
        }
    }

    pub fn text(text: &str) -> WsFrame {
        WsFrame {
            payload: text.as_bytes().to_vec(),
            ..WsFrame::new(opcode::TEXT)
        }
    }

    pub fn ping(payload: Vec<u8>) -> WsFrame {
        WsFrame {
            payload,
            ..WsFrame::new(opcode::PING)
        }
    }

    pub fn pong(payload: Vec<u8>) -> WsFrame {
        WsFrame {
            payload,
            ..WsFrame::new(opcode::PONG)
        }
    }

    /// A Close frame carrying a 2-byte big-endian status code.
    pub fn close(status_code: u16) -> WsFrame {
        let mut writer = ByteWriter::with_capacity(2);
        writer.write_u16_be(status_code);
        WsFrame {
            payload: writer.into_inner(),
            ..WsFrame::new(opcode::CLOSE)
        }
    }

    pub fn is_control(&self) -> bool {
        self.opcode & 0x08 != 0
    }

    pub fn generate_masking_key(&mut self) {
        self.masking_key = rand::random();
    }

    /// The status code of a Close frame, when present.
    pub fn close_status(&self) -> Option<u16> {
        ByteReader::new(&self.payload).read_u16_be()
    }

    pub fn text_payload(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Writes header and payload, masking the payload when `masked`.
    pub fn serialize(&self, out: &mut ByteWriter) {
        let b0 = ((self.fin as u8) << 7) | (self.opcode & 0x0F);
        out.write_u8(b0);

        let mask_bit = (self.masked as u8) << 7;
        let len = self.payload.len() as u64;
        if len < 126 {
            out.write_u8(mask_bit | len as u8);
        } else if len <= u16::MAX as u64 {
            out.write_u8(mask_bit | 126);
            out.write_u16_be(len as u16);
        } else {
            out.write_u8(mask_bit | 127);
            out.write_u64_be(len);
        }

        if self.masked {
            out.write_bytes(&self.masking_key);
            let mut masked = self.payload.clone();
            mask_in_place(&mut masked, self.masking_key);
            out.write_bytes(&masked);
        } else {
            out.write_bytes(&self.payload);
        }
    }

    /// Parses one frame. `Ok(None)` means the input is incomplete; the
    /// reader position is only meaningful on success.
    pub fn deserialize(reader: &mut ByteReader) -> Result<Option<WsFrame>> {
        let Some(b0) = reader.read_u8() else {
            return Ok(None);
        };
        if b0 & 0x70 != 0 {
            bail!("reserved bits set");
        }
        let fin = b0 & 0x80 != 0;
        let opcode = b0 & 0x0F;

        let Some(b1) = reader.read_u8() else {
            return Ok(None);
        };
        let masked = b1 & 0x80 != 0;
        let len = match b1 & 0x7F {
            126 => match reader.read_u16_be() {
                Some(len) => len as u64,
                None => return Ok(None),
            },
            127 => match reader.read_u64_be() {
                Some(len) => len,
                None => return Ok(None),
            },
            n => n as u64,
        };

        if opcode & 0x08 != 0 {
            // Control frames must not fragment and carry at most 125 bytes.
            if !fin {
                bail!("fragmented control frame");
            }
            if len > 125 {
                bail!("oversized control frame");
            }
        }
        if len > MAX_PAYLOAD {
            bail!("frame payload of {len} bytes exceeds limit");
        }

        let masking_key = if masked {
            match reader.read_bytes(4) {
                Some(bytes) => [bytes[0], bytes[1], bytes[2], bytes[3]],
                None => return Ok(None),
            }
        } else {
            [0; 4]
        };

        let Some(data) = reader.read_bytes(len as usize) else {
            return Ok(None);
        };
        let mut payload = data.to_vec();
        if masked {
            mask_in_place(&mut payload, masking_key);
        }

        Ok(Some(WsFrame {
            fin,
            opcode,
            masked,
            masking_key,
            payload,
        }))
    }
}

/// XORs the payload with the 4-byte key in round-robin. Its own inverse.
fn mask_in_place(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

//---------------------------------------------------------
//  Handshake utilities.
//---------------------------------------------------------

/// A fresh `Sec-WebSocket-Key`: base64 of 16 random bytes.
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}

/// `Sec-WebSocket-Accept` for a client key: base64 of the SHA-1 digest of
/// key + GUID.
pub fn accept_key(key: &str) -> String {
    let input = format!("{key}{KEY_SUFFIX}");
    let digest_hex = Sha1::default().digest(input.as_bytes()).to_hex();
    BASE64.encode(hex_to_bytes(&digest_hex))
}

fn hex_to_bytes(hex: &str) -> Vec<u8> {
    hex.as_bytes()
        .chunks(2)
        .filter_map(|pair| {
            let text = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(text, 16).ok()
        })
        .collect()
}

/// Whether `request` carries every header the upgrade requires.
pub(crate) fn is_handshake_request(request: &HttpRequest) -> bool {
    request.method.eq_ignore_ascii_case("GET")
        && request.header.value_has_token("Upgrade", "websocket")
        && request.header.value_has_token("Connection", "upgrade")
        && request.header.contains("Sec-WebSocket-Key")
        && request
            .header
            .find_one("Sec-WebSocket-Version")
            .map(|version| version.trim() == "13")
            .unwrap_or(false)
}

//---------------------------------------------------------
//  Channel.
//---------------------------------------------------------

pub type WsFrameHandler = Box<dyn FnMut(&Context, &WsChannel, &WsFrame)>;
pub type WsCloseHandler = Box<dyn FnOnce(&Context, &WsChannel)>;

struct WsState {
    tcp: TcpChannel,
    is_client: bool,
    data_handler: Option<Rc<RefCell<WsFrameHandler>>>,
    control_handler: Option<Rc<RefCell<WsFrameHandler>>>,
    close_handler: Option<WsCloseHandler>,
    // Frames can span TCP reads; undecoded bytes wait here.
    cache: Vec<u8>,
    continuation: Option<WsFrame>,
    close_sent: bool,
    closed: bool,
    close_timer: Option<TimerId>,
}

/// A WebSocket channel layered over an upgraded TCP channel.
///
/// Client channels mask every outgoing frame with a fresh key; server
/// channels never mask. Fragmented data frames are reassembled and
/// delivered as one frame; control frames are delivered immediately.
#[derive(Clone)]
pub struct WsChannel {
    state: Rc<RefCell<WsState>>,
}

impl WsChannel {
    /// Takes over the TCP channel's receive path with the frame parser.
    pub(crate) fn attach(tcp: TcpChannel, is_client: bool) -> WsChannel {
        WsChannel::attach_with(tcp, is_client, Vec::new())
    }

    /// Like `attach`, seeding the receive cache with bytes that arrived
    /// bundled with the handshake.
    pub(crate) fn attach_with(tcp: TcpChannel, is_client: bool, seed: Vec<u8>) -> WsChannel {
        let channel = WsChannel {
            state: Rc::new(RefCell::new(WsState {
                tcp: tcp.clone(),
                is_client,
                data_handler: None,
                control_handler: None,
                close_handler: None,
                cache: seed,
                continuation: None,
                close_sent: false,
                closed: false,
                close_timer: None,
            })),
        };

        let me = channel.clone();
        tcp.set_receive_handler(move |ctx, chan| me.on_tcp_receive(ctx, chan));
        let me = channel.clone();
        tcp.set_close_handler(move |ctx, _chan| me.on_tcp_close(ctx));
        channel
    }

    /// Defers parsing of seeded cache bytes to the next loop pass, after
    /// the caller has installed its frame handlers.
    pub(crate) fn schedule_cache_parse(&self, ctx: &Context) {
        if self.state.borrow().cache.is_empty() {
            return;
        }
        let me = self.clone();
        ctx.start_timer(Timer::new(0, false, move |ctx| {
            if !me.state.borrow().cache.is_empty() {
                me.parse_frames(ctx);
            }
        }));
    }

    /// Sends a binary data frame.
    pub fn send(&self, payload: &[u8]) -> i32 {
        self.send_frame(WsFrame::binary(payload.to_vec()))
    }

    /// Sends a text data frame.
    pub fn send_text(&self, text: &str) -> i32 {
        self.send_frame(WsFrame::text(text))
    }

    pub fn send_ping(&self, payload: &[u8]) -> i32 {
        self.send_frame(WsFrame::ping(payload.to_vec()))
    }

    pub fn send_pong(&self, payload: &[u8]) -> i32 {
        self.send_frame(WsFrame::pong(payload.to_vec()))
    }

    /// Serializes and sends one frame, applying the channel's masking
    /// policy.
    pub fn send_frame(&self, mut frame: WsFrame) -> i32 {
        let (tcp, is_client, closed) = {
            let state = self.state.borrow();
            (state.tcp.clone(), state.is_client, state.closed)
        };
        if closed {
            return error::ERR_CLOSED;
        }

        frame.masked = is_client;
        if is_client {
            frame.generate_masking_key();
        }
        let mut writer = ByteWriter::with_capacity(frame.payload.len() + 14);
        frame.serialize(&mut writer);
        tcp.send(writer.as_slice())
    }

    /// Starts the close handshake: sends a Close frame and waits for the
    /// peer's Close (or a timeout) before closing the transport.
    pub fn close(&self, ctx: &Context, status_code: u16) {
        let already_sent = {
            let state = self.state.borrow();
            state.close_sent || state.closed
        };
        if already_sent {
            return;
        }

        self.send_frame(WsFrame::close(status_code));
        self.state.borrow_mut().close_sent = true;

        let me = self.clone();
        let timer = ctx.start_timer(Timer::new(CLOSE_HANDSHAKE_TIMEOUT_MS, false, move |_ctx| {
            debug!("close handshake timed out");
            me.shutdown_transport();
        }));
        self.state.borrow_mut().close_timer = Some(timer);
    }

    pub fn set_data_frame_handler<F>(&self, handler: F)
    where
        F: FnMut(&Context, &WsChannel, &WsFrame) + 'static,
    {
        let handler: WsFrameHandler = Box::new(handler);
        self.state.borrow_mut().data_handler = Some(Rc::new(RefCell::new(handler)));
    }

    /// Replaces the control-frame handler. The handler is expected to end
    /// with `on_control_frame` to keep the default replies.
    pub fn set_control_frame_handler<F>(&self, handler: F)
    where
        F: FnMut(&Context, &WsChannel, &WsFrame) + 'static,
    {
        let handler: WsFrameHandler = Box::new(handler);
        self.state.borrow_mut().control_handler = Some(Rc::new(RefCell::new(handler)));
    }

    pub fn set_close_handler<F>(&self, handler: F)
    where
        F: FnOnce(&Context, &WsChannel) + 'static,
    {
        self.state.borrow_mut().close_handler = Some(Box::new(handler));
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    pub fn is_close_sent(&self) -> bool {
        self.state.borrow().close_sent
    }

    pub fn tcp(&self) -> TcpChannel {
        self.state.borrow().tcp.clone()
    }

    /// Default control-frame behavior: Ping is answered with an echoing
    /// Pong; Close is answered (unless already sent) and the transport
    /// closes immediately.
    pub fn on_control_frame(&self, _ctx: &Context, frame: &WsFrame) {
        match frame.opcode {
            opcode::PING => {
                self.send_pong(&frame.payload);
            }
            opcode::PONG => {}
            opcode::CLOSE => {
                let already_sent = self.state.borrow().close_sent;
                if !already_sent {
                    let status = frame
                        .close_status()
                        .unwrap_or(close_code::NORMAL_CLOSURE);
                    self.send_frame(WsFrame::close(status));
                    self.state.borrow_mut().close_sent = true;
                }
                self.shutdown_transport();
            }
            _ => {}
        }
    }

    fn on_tcp_receive(&self, ctx: &Context, chan: &TcpChannel) {
        let data = chan.receive_all(4096);
        if data.is_empty() {
            return;
        }
        self.state.borrow_mut().cache.extend_from_slice(&data);
        self.parse_frames(ctx);
    }

    fn parse_frames(&self, ctx: &Context) {
        loop {
            let parsed = {
                let state = self.state.borrow();
                if state.closed {
                    return;
                }
                let mut reader = ByteReader::new(&state.cache);
                match WsFrame::deserialize(&mut reader) {
                    Err(err) => Err(err),
                    Ok(None) => Ok(None),
                    Ok(Some(frame)) => Ok(Some((frame, reader.position()))),
                }
            };

            match parsed {
                Err(err) => {
                    debug!(error = %err, "bad frame");
                    self.protocol_violation(ctx);
                    return;
                }
                Ok(None) => return,
                Ok(Some((frame, consumed))) => {
                    self.state.borrow_mut().cache.drain(..consumed);
                    self.on_frame(ctx, frame);
                }
            }
        }
    }

    fn on_frame(&self, ctx: &Context, frame: WsFrame) {
        // Client frames must be masked, server frames must not be.
        let is_client = self.state.borrow().is_client;
        let mask_ok = if is_client { !frame.masked } else { frame.masked };
        if !mask_ok {
            debug!("masking policy violation");
            self.protocol_violation(ctx);
            return;
        }

        if frame.is_control() {
            let handler = self.state.borrow().control_handler.clone();
            match handler {
                Some(handler) => (handler.borrow_mut())(ctx, self, &frame),
                None => self.on_control_frame(ctx, &frame),
            }
            return;
        }

        // Data frames reassemble across continuations.
        let delivery = {
            let mut state = self.state.borrow_mut();
            match frame.opcode {
                opcode::CONTINUATION => match state.continuation.take() {
                    None => None,
                    Some(mut head) => {
                        head.payload.extend_from_slice(&frame.payload);
                        if frame.fin {
                            head.fin = true;
                            Some(head)
                        } else {
                            state.continuation = Some(head);
                            return;
                        }
                    }
                },
                _ if state.continuation.is_some() => None,
                _ if !frame.fin => {
                    state.continuation = Some(frame);
                    return;
                }
                _ => Some(frame),
            }
        };

        match delivery {
            None => {
                debug!("continuation sequence violation");
                self.protocol_violation(ctx);
            }
            Some(frame) => {
                let handler = self.state.borrow().data_handler.clone();
                if let Some(handler) = handler {
                    (handler.borrow_mut())(ctx, self, &frame);
                }
            }
        }
    }

    /// Peer broke the framing rules: Close(1002), then drop the
    /// transport.
    fn protocol_violation(&self, _ctx: &Context) {
        let already_sent = self.state.borrow().close_sent;
        if !already_sent {
            self.send_frame(WsFrame::close(close_code::PROTOCOL_ERROR));
            self.state.borrow_mut().close_sent = true;
        }
        self.shutdown_transport();
    }

    fn shutdown_transport(&self) {
        let tcp = self.state.borrow().tcp.clone();
        tcp.close();
    }

    fn on_tcp_close(&self, ctx: &Context) {
        let (timer, handler) = {
            let mut state = self.state.borrow_mut();
            state.closed = true;
            (state.close_timer.take(), state.close_handler.take())
        };
        if let Some(timer) = timer {
            ctx.cancel_timer(timer);
        }
        if let Some(handler) = handler {
            handler(ctx, self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: &WsFrame) -> WsFrame {
        let mut writer = ByteWriter::new();
        frame.serialize(&mut writer);
        let bytes = writer.into_inner();
        let mut reader = ByteReader::new(&bytes);
        WsFrame::deserialize(&mut reader).unwrap().unwrap()
    }

    #[test]
    fn rfc_6455_accept_key_vector() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn unmasked_frame_round_trips() {
        let frame = WsFrame::binary(vec![1, 2, 3, 4, 5]);
        let parsed = round_trip(&frame);
        assert!(parsed.fin);
        assert_eq!(parsed.opcode, opcode::BINARY);
        assert!(!parsed.masked);
        assert_eq!(parsed.payload, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn masked_payload_arrives_unmasked() {
        let mut frame = WsFrame::text("payload goes here");
        frame.masked = true;
        frame.generate_masking_key();

        let parsed = round_trip(&frame);
        assert!(parsed.masked);
        assert_eq!(parsed.text_payload(), Some("payload goes here"));
    }

    #[test]
    fn extended_length_encodings_round_trip() {
        for len in [125, 126, 65_535, 65_536, 100_000] {
            let frame = WsFrame::binary(vec![0xAB; len]);
            let parsed = round_trip(&frame);
            assert_eq!(parsed.payload.len(), len);
        }
    }

    #[test]
    fn close_frames_carry_status_codes() {
        let frame = WsFrame::close(close_code::GOING_AWAY);
        let parsed = round_trip(&frame);
        assert_eq!(parsed.opcode, opcode::CLOSE);
        assert_eq!(parsed.close_status(), Some(close_code::GOING_AWAY));
    }

    #[test]
    fn truncated_input_asks_for_more() {
        let frame = WsFrame::binary(vec![7; 300]);
        let mut writer = ByteWriter::new();
        frame.serialize(&mut writer);
        let bytes = writer.into_inner();

        for cut in [1, 2, 3, bytes.len() - 1] {
            let mut reader = ByteReader::new(&bytes[..cut]);
            assert!(WsFrame::deserialize(&mut reader).unwrap().is_none());
        }
    }

    #[test]
    fn control_frames_must_be_small_and_whole() {
        let mut oversized = WsFrame::ping(vec![0; 126]);
        let mut writer = ByteWriter::new();
        oversized.fin = true;
        oversized.serialize(&mut writer);
        let bytes = writer.into_inner();
        let mut reader = ByteReader::new(&bytes);
        assert!(WsFrame::deserialize(&mut reader).is_err());

        let mut fragmented = WsFrame::ping(Vec::new());
        fragmented.fin = false;
        let mut writer = ByteWriter::new();
        fragmented.serialize(&mut writer);
        let bytes = writer.into_inner();
        let mut reader = ByteReader::new(&bytes);
        assert!(WsFrame::deserialize(&mut reader).is_err());
    }

    #[test]
    fn reserved_bits_are_rejected() {
        let bytes = [0xC2_u8, 0x00];
        let mut reader = ByteReader::new(&bytes);
        assert!(WsFrame::deserialize(&mut reader).is_err());
    }

    #[test]
    fn handshake_request_detection() {
        let mut request = HttpRequest::new("GET", "/chat");
        request.header.add("Upgrade", "websocket");
        request.header.add("Connection", "keep-alive, Upgrade");
        request.header.add("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==");
        request.header.add("Sec-WebSocket-Version", "13");
        assert!(is_handshake_request(&request));

        request.header.remove("Sec-WebSocket-Version");
        assert!(!is_handshake_request(&request));
    }
}
