use crate::cgi::CgiOutput;
use crate::prelude::*;
use crate::utils::imf_fixdate;

/// Response payloads either own their bytes or borrow a reference-counted
/// page-cache entry, so cache evictions can never invalidate an in-flight
/// send.
#[derive(Debug, Clone)]
pub enum ResponseBody {
    Owned(Vec<u8>),
    Cached(Arc<Vec<u8>>),
}

impl ResponseBody {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            ResponseBody::Owned(bytes) => bytes,
            ResponseBody::Cached(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct Response {
    pub status_code: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
    pub keep_alive: bool,
    head: Vec<u8>,
    bytes_sent: usize,
}

pub fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        413 => "Content Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

pub fn mime_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

impl Response {
    fn assemble(
        code: u16,
        reason: Option<String>,
        body: ResponseBody,
        content_type: Option<&str>,
        request_keep_alive: bool,
    ) -> Response {
        // Anything but a 2xx closes the connection after the send.
        let keep_alive = request_keep_alive && (200..300).contains(&code);
        let reason = reason.unwrap_or_else(|| status_text(code).to_string());

        let mut headers = vec![
            ("Date".to_string(), imf_fixdate()),
            ("Server".to_string(), SERVER_SOFTWARE.to_string()),
            ("Content-Length".to_string(), body.len().to_string()),
        ];
        if let Some(ct) = content_type {
            if !body.is_empty() {
                headers.push(("Content-Type".to_string(), ct.to_string()));
            }
        }
        headers.push((
            "Connection".to_string(),
            if keep_alive { "keep-alive" } else { "close" }.to_string(),
        ));

        let mut response = Response {
            status_code: code,
            reason,
            headers,
            body,
            keep_alive,
            head: Vec::new(),
            bytes_sent: 0,
        };
        response.serialize_head();
        response
    }

    /// Builds the response for a fully classified request: a forced status
    /// code first, then the static GET / DELETE / fallthrough-404 paths. CGI
    /// responses are assembled separately from the drained child output.
    pub fn build(req: &Request, conf: &Config, pages: &mut PageCache) -> Response {
        if let Some(code) = req.override_code {
            return Self::error_page(code, req.keep_alive, conf, pages);
        }
        if req.status == ClientStatus::Invalid {
            return Self::error_page(HTTP_BAD_REQUEST, req.keep_alive, conf, pages);
        }

        match req.method {
            Method::Get => Self::build_get(req, conf, pages),
            Method::Delete => Self::build_delete(req, conf, pages),
            _ => Self::error_page(HTTP_NOT_FOUND, req.keep_alive, conf, pages),
        }
    }

    fn build_get(req: &Request, conf: &Config, pages: &mut PageCache) -> Response {
        let Some(mut path) = conf.resolve_target(&req.target) else {
            return Self::error_page(HTTP_NOT_FOUND, req.keep_alive, conf, pages);
        };
        if path.is_dir() {
            path.push("index.html");
        }
        if !path.is_file() {
            return Self::error_page(HTTP_NOT_FOUND, req.keep_alive, conf, pages);
        }

        let content_type = mime_type(&path);
        let key = match path.canonicalize() {
            Ok(abs) => abs.to_string_lossy().into_owned(),
            Err(_) => return Self::error_page(HTTP_NOT_FOUND, req.keep_alive, conf, pages),
        };

        match pages.get(&key) {
            Ok(content) => Self::assemble(
                HTTP_OK,
                None,
                ResponseBody::Cached(content),
                Some(content_type),
                req.keep_alive,
            ),
            // Too large for the cache, but still fine to serve.
            Err(PageError::FileTooLarge) => match fs::read(&path) {
                Ok(content) => Self::assemble(
                    HTTP_OK,
                    None,
                    ResponseBody::Owned(content),
                    Some(content_type),
                    req.keep_alive,
                ),
                Err(_) => {
                    Self::error_page(HTTP_INTERNAL_SERVER_ERROR, req.keep_alive, conf, pages)
                }
            },
            Err(PageError::NotFound) => Self::error_page(HTTP_NOT_FOUND, req.keep_alive, conf, pages),
            Err(PageError::Io) => {
                Self::error_page(HTTP_INTERNAL_SERVER_ERROR, req.keep_alive, conf, pages)
            }
        }
    }

    fn build_delete(req: &Request, conf: &Config, pages: &mut PageCache) -> Response {
        let Some(path) = conf.resolve_target(&req.target) else {
            return Self::error_page(HTTP_NOT_FOUND, req.keep_alive, conf, pages);
        };
        if !path.is_file() {
            return Self::error_page(HTTP_NOT_FOUND, req.keep_alive, conf, pages);
        }
        match fs::remove_file(&path) {
            Ok(()) => Self::error_page(HTTP_NO_CONTENT, req.keep_alive, conf, pages),
            Err(_) => Self::error_page(HTTP_INTERNAL_SERVER_ERROR, req.keep_alive, conf, pages),
        }
    }

    /// Produces a response for a status code: the configured error page when
    /// one exists and loads, otherwise the closest built-in default page.
    pub fn error_page(
        code: u16,
        request_keep_alive: bool,
        conf: &Config,
        pages: &mut PageCache,
    ) -> Response {
        if let Some(page_path) = conf.error_pages.get(&code) {
            if let Ok(abs) = Path::new(page_path).canonicalize() {
                if let Ok(content) = pages.get(&abs.to_string_lossy()) {
                    return Self::assemble(
                        code,
                        None,
                        ResponseBody::Cached(content),
                        Some("text/html"),
                        request_keep_alive,
                    );
                }
            }
            warn!("configured error page for {} did not load, using default", code);
        }

        let body = match pages.get(PageCache::default_key_for(code)) {
            Ok(content) => ResponseBody::Cached(content),
            Err(_) => ResponseBody::Owned(
                format!("{} {}", code, status_text(code)).into_bytes(),
            ),
        };
        Self::assemble(code, None, body, Some("text/html"), request_keep_alive)
    }

    /// Assembles a response from parsed CGI output. Unusable output is a 502.
    pub fn from_cgi(
        output: &CgiOutput,
        request_keep_alive: bool,
        conf: &Config,
        pages: &mut PageCache,
    ) -> Response {
        if output.bad_output {
            return Self::error_page(HTTP_BAD_GATEWAY, request_keep_alive, conf, pages);
        }
        Self::assemble(
            output.status,
            output.reason.clone(),
            ResponseBody::Owned(output.body.clone()),
            Some(output.content_type.as_deref().unwrap_or("text/html")),
            request_keep_alive,
        )
    }

    fn serialize_head(&mut self) {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status_code, self.reason).into_bytes();
        for (key, value) in &self.headers {
            head.extend_from_slice(key.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");
        self.head = head;
    }

    pub fn total_len(&self) -> usize {
        self.head.len() + self.body.len()
    }

    /// Full serialized form, head and body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.head.clone();
        bytes.extend_from_slice(self.body.as_slice());
        bytes
    }

    pub fn send_is_complete(&self) -> bool {
        self.bytes_sent == self.total_len()
    }

    /// Writes as much of the serialized response as the socket accepts.
    /// Partial writes are expected; the caller re-arms for writability and
    /// retries on the next event.
    pub fn send_to_client(&mut self, stream: &mut TcpStream) -> io::Result<()> {
        while !self.send_is_complete() {
            let slice = if self.bytes_sent < self.head.len() {
                &self.head[self.bytes_sent..]
            } else {
                &self.body.as_slice()[self.bytes_sent - self.head.len()..]
            };
            match stream.write(slice) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
                Ok(n) => self.bytes_sent += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
