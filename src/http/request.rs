use crate::prelude::*;
use crate::utils::{find_subsequence, uri_format_ok};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
    Unknown,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
            Method::Unknown => "UNKNOWN",
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `WaitingData` is the default for a new client, `ReadyForResponse` is set
/// once a response has been built and queued. `Error` marks a critical
/// problem in the request, the client is dropped without a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    WaitingData,
    CompleteReq,
    ReadyForResponse,
    CgiRunning,
    RecvTimeout,
    SendTimeout,
    IdleTimeout,
    GatewayTimeout,
    Invalid,
    Error,
}

/// Headers that allow a single value only; a duplicate key is an invalid
/// request.
const UNIQUE_HEADERS: &[&str] = &[
    "access-control-request-method",
    "alt-used",
    "authorization",
    "content-length",
    "content-location",
    "content-md5",
    "date",
    "from",
    "host",
    "http2-settings",
    "if-modified-since",
    "if-range",
    "if-unmodified-since",
    "max-forwards",
    "origin",
    "pragma",
    "proxy-authorization",
    "referer",
    "sec-fetch-dest",
    "sec-fetch-mode",
    "sec-fetch-site",
    "sec-fetch-storage-access",
    "sec-fetch-user",
    "sec-purpose",
    "sec-websocket-key",
    "sec-websocket-version",
    "service-worker-header",
    "service-worker-navigation-preload",
    "upgrade-insecure-requests",
    "x-forwarded-host",
    "x-forwarded-proto",
];

const CRLF: &[u8] = b"\r\n";

/// Per-connection request state. The parser is resumable: any `process` call
/// may leave the request in `WaitingData`, and the next call continues from
/// the preserved buffer.
#[derive(Debug)]
pub struct Request {
    pub buffer: Vec<u8>,
    pub method: Method,
    pub method_string: String,
    pub target: String,
    pub query: Option<String>,
    pub http_version: String,
    pub headers: HashMap<String, Vec<String>>,
    pub body: Vec<u8>,
    pub content_length: Option<usize>,
    pub chunked: bool,
    pub boundary: Option<String>,
    pub headers_complete: bool,
    pub keep_alive: bool,
    pub status: ClientStatus,
    pub override_code: Option<u16>,
    pub is_cgi: bool,
    pub max_body_size: usize,
    pub upload_dir: Option<PathBuf>,
    pub upload_file: Option<File>,
    pub idle_start: Instant,
    pub recv_start: Option<Instant>,
    pub send_start: Option<Instant>,
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    /// The HTTP version defaults to 1.1 so that an error response to a
    /// request with a broken version line still goes out as HTTP/1.1.
    pub fn new() -> Self {
        Request {
            buffer: Vec::with_capacity(RECV_BUF_SIZE),
            method: Method::Unknown,
            method_string: String::new(),
            target: String::new(),
            query: None,
            http_version: "HTTP/1.1".to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
            content_length: None,
            chunked: false,
            boundary: None,
            headers_complete: false,
            keep_alive: false,
            status: ClientStatus::WaitingData,
            override_code: None,
            is_cgi: false,
            max_body_size: CLIENT_MAX_BODY_SIZE,
            upload_dir: None,
            upload_file: None,
            idle_start: Instant::now(),
            recv_start: None,
            send_start: None,
        }
    }

    /// Feeds freshly received bytes to the parser. Until the header section
    /// has terminated with an empty line the request is assumed partial and
    /// parsing is deferred.
    pub fn process(&mut self, buf: &[u8]) {
        self.buffer.extend_from_slice(buf);
        self.set_idle_start();
        self.set_recv_start();

        if !self.headers_complete && find_subsequence(&self.buffer, b"\r\n\r\n", 0).is_none() {
            // The unparsed buffer may hold at most a request line, a header
            // section, and one recv block. A header section that never
            // terminates does not get to grow it past that.
            if self.buffer.len() > REQLINE_MAX_SIZE + HEADERS_MAX_SIZE + RECV_BUF_SIZE {
                self.buffer.clear();
                self.status = ClientStatus::Invalid;
                return;
            }
            self.status = ClientStatus::WaitingData;
            return;
        }
        self.parse();
    }

    /// Validates and parses section by section. After the last header line,
    /// remaining data is consumed according to content-length or chunked
    /// framing; multipart bodies are drained separately by the upload module.
    fn parse(&mut self) {
        if self.method == Method::Unknown {
            let Some(req_line) = extract_until(&mut self.buffer, CRLF) else {
                self.status = ClientStatus::WaitingData;
                return;
            };
            self.parse_request_line(&req_line);
            if self.status == ClientStatus::Invalid {
                self.buffer.clear();
                return;
            }
        }

        if !self.headers_complete {
            self.parse_headers();
        }
        if self.status == ClientStatus::Invalid || self.status == ClientStatus::Error {
            self.buffer.clear();
            return;
        }

        if self.content_length == Some(0) && !self.chunked {
            self.status = ClientStatus::CompleteReq;
            self.override_code = Some(HTTP_NO_CONTENT);
        }
        if let Some(len) = self.content_length {
            if len > self.max_body_size {
                self.override_code = Some(HTTP_PAYLOAD_TOO_LARGE);
                self.status = ClientStatus::Invalid;
                return;
            }
        }
        if self.content_length.is_none() && !self.chunked {
            // A request without framing must not carry a body.
            if self.buffer.is_empty() {
                self.status = ClientStatus::CompleteReq;
            } else {
                self.status = ClientStatus::Invalid;
            }
        } else if self.method == Method::Post && self.boundary.is_some() {
            // Multipart bodies stream to disk, driven from the reactor.
        } else if !self.buffer.is_empty()
            && self
                .content_length
                .is_some_and(|len| self.body.len() < len)
        {
            self.consume_sized_body();
        } else if self.chunked {
            self.parse_chunked();
        }
        if self.status == ClientStatus::Invalid || self.status == ClientStatus::Error {
            return;
        }

        if self.target.starts_with("/cgi-bin/") {
            self.is_cgi = true;
        }

        // POST is only meaningful as a file upload or a CGI request.
        if self.method == Method::Post && !self.is_cgi && self.boundary.is_none() {
            self.override_code = Some(HTTP_METHOD_NOT_ALLOWED);
            self.status = ClientStatus::Invalid;
        }
    }

    fn consume_sized_body(&mut self) {
        let len = match self.content_length {
            Some(len) => len,
            None => return,
        };
        let missing = len - self.body.len();
        if missing < self.buffer.len() {
            // More bytes than the declared length.
            self.status = ClientStatus::Invalid;
            return;
        }
        self.body.append(&mut self.buffer);

        if self.body.len() > self.max_body_size {
            self.override_code = Some(HTTP_PAYLOAD_TOO_LARGE);
            self.status = ClientStatus::Invalid;
        } else if self.body.len() < len {
            self.status = ClientStatus::WaitingData;
        } else {
            self.status = ClientStatus::CompleteReq;
        }
    }

    /// Splits the request line into method, target, and version tokens.
    fn parse_request_line(&mut self, line: &[u8]) {
        let Ok(line) = std::str::from_utf8(line) else {
            self.status = ClientStatus::Invalid;
            return;
        };
        let mut rest = line;
        let method = take_token(&mut rest);
        let target = take_token(&mut rest);
        let version = rest.to_string();

        if method.is_empty() || target.is_empty() || version.is_empty() {
            self.status = ClientStatus::Invalid;
            return;
        }
        self.method_string = method.clone();

        self.method = match method.as_str() {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "DELETE" => Method::Delete,
            _ => {
                self.override_code = Some(HTTP_METHOD_NOT_ALLOWED);
                self.status = ClientStatus::Invalid;
                return;
            }
        };

        if method.len() + target.len() + version.len() > REQLINE_MAX_SIZE
            || !self.validate_and_assign_target(&target)
            || !self.validate_and_assign_version(&version)
        {
            self.status = ClientStatus::Invalid;
        }
    }

    /// A one-character target has to be `/`, characters are restricted, an
    /// absolute-form target must use http or https, and `?` separates the
    /// query from the path.
    fn validate_and_assign_target(&mut self, target: &str) -> bool {
        if target.len() == 1 && target != "/" {
            return false;
        }
        if !uri_format_ok(target) {
            return false;
        }

        if let Some(scheme_end) = target.find("://") {
            let scheme = &target[..scheme_end];
            if scheme != "http" && scheme != "https" {
                return false;
            }
        }

        match target.split_once('?') {
            Some((path, query)) => {
                self.target = path.to_string();
                self.query = Some(query.to_string());
            }
            None => self.target = target.to_string(),
        }
        true
    }

    fn validate_and_assign_version(&mut self, version: &str) -> bool {
        if version != "HTTP/1.0" && version != "HTTP/1.1" {
            return false;
        }
        self.http_version = version.to_string();
        true
    }

    /// Stores each header as a lowercase key and a list of values until the
    /// empty line that ends the header section.
    fn parse_headers(&mut self) {
        // An HTTP/1.0 request is valid without any headers.
        if self.http_version == "HTTP/1.0" && self.buffer == b"\r\n" {
            self.headers_complete = true;
            self.status = ClientStatus::CompleteReq;
            self.buffer.clear();
            return;
        }

        let head_end = find_subsequence(&self.buffer, b"\r\n\r\n", 0).unwrap_or(self.buffer.len());
        if head_end > HEADERS_MAX_SIZE {
            self.status = ClientStatus::Invalid;
            return;
        }

        while !self.buffer.is_empty() {
            if self.buffer.starts_with(CRLF) {
                self.buffer.drain(..CRLF.len());
                self.headers_complete = true;
                break;
            }

            let Some(line) = extract_until(&mut self.buffer, CRLF) else {
                break;
            };
            let Ok(line) = String::from_utf8(line) else {
                self.status = ClientStatus::Invalid;
                return;
            };

            // A header line without a colon marks a suspicious request, the
            // connection gets dropped without a response.
            let Some((raw_key, raw_value)) = line.split_once(':') else {
                self.status = ClientStatus::Error;
                self.keep_alive = false;
                return;
            };

            let key = raw_key.to_ascii_lowercase();
            let value = raw_value.trim_start_matches(' ');
            if value.is_empty() {
                self.status = ClientStatus::Invalid;
                return;
            }

            if self.headers.contains_key(&key) && UNIQUE_HEADERS.contains(&key.as_str()) {
                self.status = ClientStatus::Invalid;
                return;
            }

            // Content-Type keeps its case so a boundary= token stays literal,
            // and splits its values on semicolons; every other header is
            // lowercased and splits on commas.
            let (value, separator) = if key == "content-type" {
                (value.to_string(), ';')
            } else {
                (value.to_ascii_lowercase(), ',')
            };

            let values = self.headers.entry(key).or_default();
            if !value.contains(separator) {
                values.push(value);
            } else {
                for one in value.split(separator) {
                    values.push(one.strip_prefix(' ').unwrap_or(one).to_string());
                }
            }
        }

        if !self.headers_complete {
            self.status = ClientStatus::WaitingData;
        }

        if self.headers.is_empty() || !self.validate_headers() {
            self.status = ClientStatus::Invalid;
        }
    }

    /// Host is mandatory for 1.1. Connection, content-length,
    /// transfer-encoding, and a multipart content-type adjust the request
    /// state.
    fn validate_headers(&mut self) -> bool {
        if self.http_version == "HTTP/1.1"
            && self.headers.get("host").map_or(true, |v| v.is_empty())
        {
            return false;
        }

        if !self.fill_keep_alive() {
            return false;
        }

        if let Some(values) = self.headers.get("content-length") {
            let Some(len) = values.first().and_then(|v| v.parse::<usize>().ok()) else {
                return false;
            };
            self.content_length = Some(len);
        }

        if let Some(values) = self.headers.get("transfer-encoding") {
            if values.first().map(String::as_str) == Some("chunked") {
                if self.http_version == "HTTP/1.0" {
                    return false;
                }
                self.chunked = true;
            }
        }

        if let Some(values) = self.headers.get("content-type") {
            if values.iter().any(|v| v == "multipart/form-data") {
                match values
                    .iter()
                    .find_map(|v| v.strip_prefix("boundary="))
                {
                    Some(token) => self.boundary = Some(token.to_string()),
                    None => return false,
                }
            }
        }

        true
    }

    /// Connection: close / keep-alive override the per-version default; both
    /// at once is invalid.
    fn fill_keep_alive(&mut self) -> bool {
        let mut has_close = false;
        let mut has_keep_alive = false;

        if let Some(values) = self.headers.get("connection") {
            has_close = values.iter().any(|v| v == "close");
            has_keep_alive = values.iter().any(|v| v == "keep-alive");
            if has_close && has_keep_alive {
                return false;
            }
            if has_close {
                self.keep_alive = false;
            }
            if has_keep_alive {
                self.keep_alive = true;
            }
        }

        if !has_close && !has_keep_alive {
            self.keep_alive = self.http_version == "HTTP/1.1";
        }

        true
    }

    /// Chunk decoding starts once the terminator chunk is visible, since a
    /// single chunk may be split across any number of recv calls.
    fn parse_chunked(&mut self) {
        if find_subsequence(&self.buffer, b"0\r\n\r\n", 0).is_none() {
            self.status = ClientStatus::WaitingData;
            return;
        }

        loop {
            let Some(line_end) = find_subsequence(&self.buffer, CRLF, 0) else {
                self.status = ClientStatus::Invalid;
                return;
            };
            if &self.buffer[..line_end] == b"0" {
                break;
            }

            let size_line = String::from_utf8_lossy(&self.buffer[..line_end]).to_string();
            let size_line = size_line.trim();
            let len = match usize::from_str_radix(size_line, 16) {
                Ok(len) => len,
                Err(_) => {
                    // All-hex digits that still fail to parse can only mean
                    // a length far past any body limit.
                    if !size_line.is_empty()
                        && size_line.bytes().all(|b| b.is_ascii_hexdigit())
                    {
                        self.override_code = Some(HTTP_PAYLOAD_TOO_LARGE);
                    }
                    self.status = ClientStatus::Invalid;
                    return;
                }
            };
            if self.body.len() + len > self.max_body_size {
                self.override_code = Some(HTTP_PAYLOAD_TOO_LARGE);
                self.status = ClientStatus::Invalid;
                return;
            }
            self.buffer.drain(..line_end + CRLF.len());

            if self.buffer.len() < len + CRLF.len()
                || &self.buffer[len..len + CRLF.len()] != CRLF
            {
                self.status = ClientStatus::Invalid;
                return;
            }
            self.body.extend_from_slice(&self.buffer[..len]);
            self.buffer.drain(..len + CRLF.len());
        }

        // Nothing may follow the terminator chunk.
        if self.buffer == b"0\r\n\r\n" {
            self.buffer.clear();
            self.status = ClientStatus::CompleteReq;
        } else {
            self.status = ClientStatus::Invalid;
        }
    }

    /// The first value of the Host header, without an optional port suffix.
    pub fn host(&self) -> Option<&str> {
        self.headers
            .get("host")
            .and_then(|values| values.first())
            .map(|value| value.split(':').next().unwrap_or(value))
    }

    pub fn header(&self, key: &str) -> Option<&Vec<String>> {
        self.headers.get(key)
    }

    /// Clears per-request state so the connection can serve a follow-up
    /// request. Keep-alive and the idle timer survive; keep-alive is cleared
    /// separately once the post-send decision has been made.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.method = Method::Unknown;
        self.method_string.clear();
        self.target.clear();
        self.query = None;
        self.http_version = "HTTP/1.1".to_string();
        self.headers.clear();
        self.body.clear();
        self.content_length = None;
        self.chunked = false;
        self.boundary = None;
        self.headers_complete = false;
        self.override_code = None;
        self.is_cgi = false;
        self.max_body_size = CLIENT_MAX_BODY_SIZE;
        self.upload_dir = None;
        self.upload_file = None;
        self.recv_start = None;
    }

    pub fn reset_keep_alive(&mut self) {
        self.keep_alive = false;
    }

    pub fn set_idle_start(&mut self) {
        self.idle_start = Instant::now();
    }

    pub fn set_recv_start(&mut self) {
        self.recv_start = Some(Instant::now());
    }

    pub fn set_send_start(&mut self) {
        self.send_start = Some(Instant::now());
    }

    pub fn reset_send_start(&mut self) {
        self.send_start = None;
    }

    pub fn reset_recv_start(&mut self) {
        self.recv_start = None;
    }

    /// Compares the idle, recv, and send timers against the current time and
    /// moves the request to the matching timeout state.
    pub fn check_timeouts(&mut self) {
        let now = Instant::now();

        if now.duration_since(self.idle_start) > IDLE_TIMEOUT {
            debug!("idle timeout");
            self.status = ClientStatus::IdleTimeout;
            return;
        }

        if let Some(start) = self.recv_start {
            if now.duration_since(start) > RECV_TIMEOUT {
                debug!("recv timeout");
                self.status = ClientStatus::RecvTimeout;
                return;
            }
        }

        if let Some(start) = self.send_start {
            if now.duration_since(start) > SEND_TIMEOUT {
                debug!("send timeout");
                self.status = ClientStatus::SendTimeout;
            }
        }
    }
}

/// Takes the prefix of `buffer` up to `delim`, removing both from the
/// buffer. Leaves the buffer untouched when the delimiter is absent.
pub fn extract_until(buffer: &mut Vec<u8>, delim: &[u8]) -> Option<Vec<u8>> {
    let pos = find_subsequence(buffer, delim, 0)?;
    let part = buffer[..pos].to_vec();
    buffer.drain(..pos + delim.len());
    Some(part)
}

fn take_token(rest: &mut &str) -> String {
    match rest.split_once(' ') {
        Some((token, tail)) => {
            *rest = tail;
            token.to_string()
        }
        None => {
            let token = rest.to_string();
            *rest = "";
            token
        }
    }
}
