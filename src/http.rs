use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use url::Url;

pub const PROTOCOL_V1_0: &str = "HTTP/1.0";
pub const PROTOCOL_V1_1: &str = "HTTP/1.1";

/// Largest single chunk a peer may announce. Guards the decoder against
/// absurd allocations.
const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

// Longest accepted chunk-size line, extensions included.
const MAX_CHUNK_LINE: usize = 256;

/// A handful of well-known status codes.
pub mod status {
    pub const SWITCHING_PROTOCOLS: u16 = 101;
    pub const OK: u16 = 200;
    pub const MOVED_PERMANENTLY: u16 = 301;
    pub const FOUND: u16 = 302;
    pub const SEE_OTHER: u16 = 303;
    pub const TEMPORARY_REDIRECT: u16 = 307;
    pub const PERMANENT_REDIRECT: u16 = 308;
    pub const BAD_REQUEST: u16 = 400;
    pub const NOT_FOUND: u16 = 404;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
}

/// The default reason phrase for a status code.
pub fn status_message(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "",
    }
}

//---------------------------------------------------------
//  URL.
//---------------------------------------------------------

/// A parsed `http` / `https` / `ws` / `wss` URL.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HttpUrl {
    scheme: String,
    user: String,
    password: String,
    host: String,
    port: Option<u16>,
    path: String,
    query: Option<String>,
    fragment: Option<String>,
}

impl HttpUrl {
    pub fn parse(input: &str) -> Result<HttpUrl> {
        let url = Url::parse(input)?;
        HttpUrl::from_url(&url)
    }

    fn from_url(url: &Url) -> Result<HttpUrl> {
        match url.scheme() {
            "http" | "https" | "ws" | "wss" => {}
            other => bail!("unsupported scheme: {other}"),
        }
        // IPv6 hosts come back bracketed; store the bare form and add
        // brackets where the output syntax needs them.
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("URL has no host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_owned();

        Ok(HttpUrl {
            scheme: url.scheme().to_owned(),
            user: url.username().to_owned(),
            password: url.password().unwrap_or("").to_owned(),
            host,
            port: url.port(),
            path: url.path().to_owned(),
            query: url.query().map(str::to_owned),
            fragment: url.fragment().map(str::to_owned),
        })
    }

    /// Resolves `location` (absolute or relative) against this URL.
    pub fn join(&self, location: &str) -> Result<HttpUrl> {
        let base = Url::parse(&self.compose())?;
        let joined = base.join(location)?;
        HttpUrl::from_url(&joined)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn set_scheme(&mut self, scheme: &str) {
        self.scheme = scheme.to_owned();
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn set_host(&mut self, host: &str) {
        self.host = host.to_owned();
    }

    /// Explicit port or the scheme default (80 for http/ws, 443 for
    /// https/wss).
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match self.scheme.as_str() {
            "https" | "wss" => 443,
            _ => 80,
        })
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = Some(port);
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: &str) {
        self.path = path.to_owned();
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.scheme.as_str(), "https" | "wss")
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self.scheme.as_str(), "ws" | "wss")
    }

    /// `host:port` form used to open the transport connection.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port())
        } else {
            format!("{}:{}", self.host, self.port())
        }
    }

    /// Value for the `Host` header: the port is omitted when default.
    pub fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match self.port {
            Some(port) if port != HttpUrl::default_port(&self.scheme) => {
                format!("{host}:{port}")
            }
            _ => host,
        }
    }

    fn default_port(scheme: &str) -> u16 {
        match scheme {
            "https" | "wss" => 443,
            _ => 80,
        }
    }

    /// Path plus query, as it appears on the request line.
    pub fn request_target(&self) -> String {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        match &self.query {
            Some(query) => format!("{path}?{query}"),
            None => path.to_owned(),
        }
    }

    pub fn compose(&self) -> String {
        let mut out = format!("{}://", self.scheme);
        if !self.user.is_empty() {
            out.push_str(&self.user);
            if !self.password.is_empty() {
                out.push(':');
                out.push_str(&self.password);
            }
            out.push('@');
        }
        if self.host.contains(':') {
            out.push('[');
            out.push_str(&self.host);
            out.push(']');
        } else {
            out.push_str(&self.host);
        }
        if let Some(port) = self.port {
            out.push_str(&format!(":{port}"));
        }
        out.push_str(if self.path.is_empty() { "/" } else { &self.path });
        if let Some(query) = &self.query {
            out.push('?');
            out.push_str(query);
        }
        if let Some(fragment) = &self.fragment {
            out.push('#');
            out.push_str(fragment);
        }
        out
    }
}

//---------------------------------------------------------
//  Header block.
//---------------------------------------------------------

#[derive(Clone, Debug)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

/// Insertion-ordered header list with case-insensitive, multi-valued
/// lookup.
#[derive(Clone, Debug, Default)]
pub struct HttpHeader {
    fields: Vec<HeaderField>,
}

impl HttpHeader {
    pub fn new() -> HttpHeader {
        HttpHeader { fields: Vec::new() }
    }

    /// Appends a field, keeping any previous values for the same name.
    pub fn add(&mut self, name: &str, value: &str) {
        self.fields.push(HeaderField {
            name: name.to_owned(),
            value: value.to_owned(),
        });
    }

    /// Replaces every value for `name` with a single one.
    pub fn set(&mut self, name: &str, value: &str) {
        self.remove(name);
        self.add(name, value);
    }

    pub fn remove(&mut self, name: &str) {
        self.fields
            .retain(|field| !field.name.eq_ignore_ascii_case(name));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find_one(name).is_some()
    }

    pub fn find_one(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|field| field.name.eq_ignore_ascii_case(name))
            .map(|field| field.value.as_str())
    }

    pub fn find(&self, name: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|field| field.name.eq_ignore_ascii_case(name))
            .map(|field| field.value.as_str())
            .collect()
    }

    pub fn fields(&self) -> &[HeaderField] {
        &self.fields
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn content_length(&self) -> Option<usize> {
        self.find_one("Content-Length")
            .and_then(|value| value.trim().parse().ok())
    }

    pub fn set_content_length(&mut self, length: usize) {
        self.set("Content-Length", &length.to_string());
    }

    pub fn is_chunked(&self) -> bool {
        self.find("Transfer-Encoding")
            .iter()
            .any(|value| value.to_ascii_lowercase().contains("chunked"))
    }

    /// Whether `name`'s value contains `token`, case-insensitively. Used
    /// for `Connection: keep-alive, Upgrade` style lists.
    pub fn value_has_token(&self, name: &str, token: &str) -> bool {
        self.find(name).iter().any(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        for field in &self.fields {
            out.extend_from_slice(field.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(field.value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}

//---------------------------------------------------------
//  Messages.
//---------------------------------------------------------

#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub protocol: String,
    pub header: HttpHeader,
    pub body: Vec<u8>,
}

impl Default for HttpRequest {
    fn default() -> HttpRequest {
        HttpRequest {
            method: "GET".to_owned(),
            path: "/".to_owned(),
            protocol: PROTOCOL_V1_1.to_owned(),
            header: HttpHeader::new(),
            body: Vec::new(),
        }
    }
}

impl HttpRequest {
    pub fn new(method: &str, path: &str) -> HttpRequest {
        HttpRequest {
            method: method.to_owned(),
            path: path.to_owned(),
            ..HttpRequest::default()
        }
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    pub fn body_as_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Serializes request line, headers and body. The caller is expected
    /// to have set `Content-Length` for non-empty bodies.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.path.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.protocol.as_bytes());
        out.extend_from_slice(b"\r\n");
        self.header.serialize(out);
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
    }
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub protocol: String,
    pub status_code: u16,
    pub message: String,
    pub header: HttpHeader,
    pub body: Vec<u8>,
}

impl Default for HttpResponse {
    fn default() -> HttpResponse {
        HttpResponse {
            protocol: PROTOCOL_V1_1.to_owned(),
            status_code: status::OK,
            message: status_message(status::OK).to_owned(),
            header: HttpHeader::new(),
            body: Vec::new(),
        }
    }
}

impl HttpResponse {
    pub fn new(status_code: u16) -> HttpResponse {
        HttpResponse {
            status_code,
            message: status_message(status_code).to_owned(),
            ..HttpResponse::default()
        }
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    pub fn body_as_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.protocol.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status_code.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.message.as_bytes());
        out.extend_from_slice(b"\r\n");
        self.header.serialize(out);
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
    }
}

/// Parses a request head from an accumulating buffer.
///
/// Returns the request and the number of bytes consumed, or `None` while
/// the head is still incomplete.
pub(crate) fn parse_request_head(buf: &[u8]) -> Result<Option<(HttpRequest, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut headers);

    let consumed = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(err) => bail!("bad request head: {err}"),
    };

    let mut request = HttpRequest {
        method: parsed.method.unwrap_or("GET").to_owned(),
        path: parsed.path.unwrap_or("/").to_owned(),
        protocol: format!("HTTP/1.{}", parsed.version.unwrap_or(1)),
        header: HttpHeader::new(),
        body: Vec::new(),
    };
    for header in parsed.headers.iter() {
        request
            .header
            .add(header.name, &String::from_utf8_lossy(header.value));
    }
    Ok(Some((request, consumed)))
}

/// Parses a response head from an accumulating buffer.
pub(crate) fn parse_response_head(buf: &[u8]) -> Result<Option<(HttpResponse, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut headers);

    let consumed = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(err) => bail!("bad response head: {err}"),
    };

    let mut response = HttpResponse {
        protocol: format!("HTTP/1.{}", parsed.version.unwrap_or(1)),
        status_code: parsed.code.unwrap_or(0),
        message: parsed.reason.unwrap_or("").to_owned(),
        header: HttpHeader::new(),
        body: Vec::new(),
    };
    for header in parsed.headers.iter() {
        response
            .header
            .add(header.name, &String::from_utf8_lossy(header.value));
    }
    Ok(Some((response, consumed)))
}

//---------------------------------------------------------
//  Chunked transfer coding.
//---------------------------------------------------------

/// Appends one chunk (`HEX CRLF DATA CRLF`). Empty input is skipped; the
/// zero-length chunk is reserved for `encode_last_chunk`.
pub fn encode_chunk(out: &mut Vec<u8>, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Terminates a chunked body (`0 CRLF CRLF`).
pub fn encode_last_chunk(out: &mut Vec<u8>) {
    out.extend_from_slice(b"0\r\n\r\n");
}

/// Encodes a whole body as chunks of at most `chunk_size` bytes.
pub fn encode_chunked(data: &[u8], chunk_size: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 32);
    for chunk in data.chunks(chunk_size.max(1)) {
        encode_chunk(&mut out, chunk);
    }
    encode_last_chunk(&mut out);
    out
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ChunkState {
    Idle,
    ReadingSize,
    ReadingChunk,
    // CRLF that terminates a chunk's data.
    ChunkTerminator,
    ReadingTrailer,
    Done,
}

/// Incremental decoder for `Transfer-Encoding: chunked` bodies.
///
/// Feed it arbitrary slices of the wire stream; decoded body bytes are
/// appended to the output and the consumed count returned, so leftover
/// input can carry the next message.
pub struct ChunkDecoder {
    state: ChunkState,
    line: Vec<u8>,
    remaining: usize,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        ChunkDecoder::new()
    }
}

impl ChunkDecoder {
    pub fn new() -> ChunkDecoder {
        ChunkDecoder {
            state: ChunkState::Idle,
            line: Vec::with_capacity(16),
            remaining: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        let mut pos = 0;

        while pos < input.len() && self.state != ChunkState::Done {
            match self.state {
                ChunkState::Idle => {
                    self.state = ChunkState::ReadingSize;
                }
                ChunkState::ReadingSize => {
                    let byte = input[pos];
                    pos += 1;
                    self.line.push(byte);
                    if byte == b'\n' {
                        let size = self.parse_size_line()?;
                        self.line.clear();
                        if size == 0 {
                            self.state = ChunkState::ReadingTrailer;
                        } else {
                            self.remaining = size;
                            self.state = ChunkState::ReadingChunk;
                        }
                    } else if self.line.len() > MAX_CHUNK_LINE {
                        bail!("chunk size line too long");
                    }
                }
                ChunkState::ReadingChunk => {
                    let take = self.remaining.min(input.len() - pos);
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    self.remaining -= take;
                    if self.remaining == 0 {
                        self.state = ChunkState::ChunkTerminator;
                    }
                }
                ChunkState::ChunkTerminator => {
                    let byte = input[pos];
                    pos += 1;
                    self.line.push(byte);
                    if self.line.len() == 2 {
                        if self.line != b"\r\n" {
                            bail!("missing CRLF after chunk data");
                        }
                        self.line.clear();
                        self.state = ChunkState::ReadingSize;
                    }
                }
                ChunkState::ReadingTrailer => {
                    let byte = input[pos];
                    pos += 1;
                    self.line.push(byte);
                    if byte == b'\n' {
                        // Blank line ends the trailer section.
                        let blank = self.line == b"\r\n" || self.line == b"\n";
                        self.line.clear();
                        if blank {
                            self.state = ChunkState::Done;
                        }
                    }
                }
                ChunkState::Done => {}
            }
        }
        Ok(pos)
    }

    fn parse_size_line(&self) -> Result<usize> {
        let mut line = self.line.as_slice();
        while let Some((&last, rest)) = line.split_last() {
            if last == b'\r' || last == b'\n' {
                line = rest;
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(line).map_err(|_| anyhow!("bad chunk size line"))?;
        // Chunk extensions after ';' are ignored.
        let size_text = text.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| anyhow!("bad chunk size: {text}"))?;
        if size > MAX_CHUNK_SIZE {
            bail!("chunk size {size} exceeds limit");
        }
        Ok(size)
    }
}

//---------------------------------------------------------
//  Body framing.
//---------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum BodyFraming {
    None,
    Length(usize),
    Chunked,
    UntilClose,
}

/// Accumulates a message body according to its headers.
pub(crate) struct ContentReceiver {
    framing: BodyFraming,
    received: usize,
    body: Vec<u8>,
    chunks: ChunkDecoder,
    done: bool,
}

impl ContentReceiver {
    /// Request bodies exist only with an explicit length or chunked
    /// coding.
    pub fn for_request(header: &HttpHeader) -> ContentReceiver {
        if header.is_chunked() {
            ContentReceiver::with_framing(BodyFraming::Chunked)
        } else {
            match header.content_length() {
                Some(n) if n > 0 => ContentReceiver::with_framing(BodyFraming::Length(n)),
                _ => ContentReceiver::with_framing(BodyFraming::None),
            }
        }
    }

    /// Response bodies additionally support read-until-close framing.
    pub fn for_response(request_was_head: bool, status_code: u16, header: &HttpHeader) -> ContentReceiver {
        let bodyless = request_was_head
            || status_code / 100 == 1
            || status_code == 204
            || status_code == 304;
        if bodyless {
            ContentReceiver::with_framing(BodyFraming::None)
        } else if header.is_chunked() {
            ContentReceiver::with_framing(BodyFraming::Chunked)
        } else {
            match header.content_length() {
                Some(0) => ContentReceiver::with_framing(BodyFraming::None),
                Some(n) => ContentReceiver::with_framing(BodyFraming::Length(n)),
                None => ContentReceiver::with_framing(BodyFraming::UntilClose),
            }
        }
    }

    fn with_framing(framing: BodyFraming) -> ContentReceiver {
        ContentReceiver {
            framing,
            received: 0,
            body: Vec::new(),
            chunks: ChunkDecoder::new(),
            done: framing == BodyFraming::None,
        }
    }

    /// Consumes body bytes from `input`; returns how many were taken.
    /// Leftover input belongs to the next message.
    pub fn feed(&mut self, input: &[u8]) -> Result<usize> {
        match self.framing {
            BodyFraming::None => Ok(0),
            BodyFraming::Length(total) => {
                let take = (total - self.received).min(input.len());
                self.body.extend_from_slice(&input[..take]);
                self.received += take;
                self.done = self.received >= total;
                Ok(take)
            }
            BodyFraming::Chunked => {
                let consumed = self.chunks.feed(input, &mut self.body)?;
                self.done = self.chunks.is_done();
                Ok(consumed)
            }
            BodyFraming::UntilClose => {
                self.body.extend_from_slice(input);
                Ok(input.len())
            }
        }
    }

    /// Connection closed. Returns whether that completes the message.
    pub fn on_eof(&mut self) -> bool {
        if self.framing == BodyFraming::UntilClose {
            self.done = true;
        }
        self.done
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_defaults_and_compose() {
        let url = HttpUrl::parse("http://example.com/a/b?x=1#frag").unwrap();
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.port(), 80);
        assert_eq!(url.request_target(), "/a/b?x=1");
        assert_eq!(url.host_header(), "example.com");

        let url = HttpUrl::parse("wss://example.com/chat").unwrap();
        assert_eq!(url.port(), 443);
        assert!(url.is_secure());
        assert!(url.is_websocket());

        let url = HttpUrl::parse("http://user:pw@example.com:8080/").unwrap();
        assert_eq!(url.port(), 8080);
        assert_eq!(url.user(), "user");
        assert_eq!(url.host_header(), "example.com:8080");
        assert_eq!(url.compose(), "http://user:pw@example.com:8080/");
    }

    #[test]
    fn url_rejects_unknown_schemes() {
        assert!(HttpUrl::parse("ftp://example.com/").is_err());
        assert!(HttpUrl::parse("not a url").is_err());
    }

    #[test]
    fn url_join_resolves_relative_locations() {
        let base = HttpUrl::parse("http://example.com/a/b").unwrap();
        let joined = base.join("/moved").unwrap();
        assert_eq!(joined.compose(), "http://example.com/moved");

        let joined = base.join("https://other.example.com/x").unwrap();
        assert_eq!(joined.host(), "other.example.com");
        assert!(joined.is_secure());
    }

    #[test]
    fn header_lookup_is_case_insensitive_and_ordered() {
        let mut header = HttpHeader::new();
        header.add("Set-Cookie", "a=1");
        header.add("Content-Type", "text/plain");
        header.add("Set-Cookie", "b=2");

        assert_eq!(header.find_one("set-cookie"), Some("a=1"));
        assert_eq!(header.find("SET-COOKIE"), vec!["a=1", "b=2"]);
        assert!(header.contains("content-type"));

        header.remove("set-cookie");
        assert!(!header.contains("Set-Cookie"));
        assert_eq!(header.fields().len(), 1);
    }

    #[test]
    fn header_connection_token_lookup() {
        let mut header = HttpHeader::new();
        header.add("Connection", "keep-alive, Upgrade");
        assert!(header.value_has_token("Connection", "upgrade"));
        assert!(!header.value_has_token("Connection", "close"));
    }

    #[test]
    fn request_serialize_then_parse_round_trips() {
        let mut request = HttpRequest::new("POST", "/submit");
        request.header.add("Host", "example.com");
        request.set_body("hello".as_bytes());
        request.header.set_content_length(5);

        let mut wire = Vec::new();
        request.serialize(&mut wire);

        let (parsed, consumed) = parse_request_head(&wire).unwrap().unwrap();
        assert_eq!(parsed.method, "POST");
        assert_eq!(parsed.path, "/submit");
        assert_eq!(parsed.header.content_length(), Some(5));
        assert_eq!(&wire[consumed..], b"hello");
    }

    #[test]
    fn response_parse_reports_partial_heads() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Le";
        assert!(parse_response_head(wire).unwrap().is_none());
    }

    #[test]
    fn chunk_decoder_handles_the_wire_form() {
        let wire = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut decoder = ChunkDecoder::new();
        let mut body = Vec::new();
        let consumed = decoder.feed(wire, &mut body).unwrap();
        assert_eq!(consumed, wire.len());
        assert!(decoder.is_done());
        assert_eq!(body, b"hello world");
    }

    #[test]
    fn chunk_decoder_survives_byte_at_a_time_input() {
        let wire = b"4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mut decoder = ChunkDecoder::new();
        let mut body = Vec::new();
        for byte in wire.iter() {
            decoder.feed(std::slice::from_ref(byte), &mut body).unwrap();
        }
        assert!(decoder.is_done());
        assert_eq!(body, b"wikipedia");
    }

    #[test]
    fn chunk_encoder_and_decoder_are_inverses() {
        let data: Vec<u8> = (0..10_000_u32).map(|i| (i % 251) as u8).collect();
        for chunk_size in [1, 7, 256, 4096, 100_000] {
            let wire = encode_chunked(&data, chunk_size);
            let mut decoder = ChunkDecoder::new();
            let mut body = Vec::new();
            let consumed = decoder.feed(&wire, &mut body).unwrap();
            assert_eq!(consumed, wire.len());
            assert!(decoder.is_done());
            assert_eq!(body, data);
        }
    }

    #[test]
    fn chunk_decoder_rejects_garbage_sizes() {
        let mut decoder = ChunkDecoder::new();
        let mut body = Vec::new();
        assert!(decoder.feed(b"zz\r\noops", &mut body).is_err());
    }

    #[test]
    fn content_length_body_is_exact() {
        let mut header = HttpHeader::new();
        header.set_content_length(5);
        let mut receiver = ContentReceiver::for_request(&header);

        assert_eq!(receiver.feed(b"hel").unwrap(), 3);
        assert!(!receiver.is_done());
        // Two more body bytes; the rest belongs to the next message.
        assert_eq!(receiver.feed(b"loGET /next").unwrap(), 2);
        assert!(receiver.is_done());
        assert_eq!(receiver.take_body(), b"hello");
    }

    #[test]
    fn response_without_length_reads_until_close() {
        let header = HttpHeader::new();
        let mut receiver = ContentReceiver::for_response(false, 200, &header);
        receiver.feed(b"partial").unwrap();
        assert!(!receiver.is_done());
        assert!(receiver.on_eof());
        assert_eq!(receiver.take_body(), b"partial");
    }

    #[test]
    fn head_responses_have_no_body() {
        let mut header = HttpHeader::new();
        header.set_content_length(100);
        let receiver = ContentReceiver::for_response(true, 200, &header);
        assert!(receiver.is_done());
    }
}
