use crate::prelude::*;
use crate::utils::trim_whitespace;

use std::os::fd::OwnedFd;

/// State of one CGI child owned by the connection that spawned it. The
/// child's stdout is a socket pair end registered with the reactor, so the
/// drain never blocks and never spins.
#[derive(Debug)]
pub struct CgiRequest {
    pub child: Child,
    pub start_time: Instant,
    pub stdout: mio::net::UnixStream,
    pub token: Option<Token>,
    pub output: Vec<u8>,
    pub eof: bool,
}

impl CgiRequest {
    /// True once the child has exited and its stdout has drained to EOF.
    pub fn is_finished(&mut self) -> bool {
        if !self.eof {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(_) => true,
        }
    }

    /// Appends everything currently readable on the child's stdout. EOF is
    /// recorded, `WouldBlock` means come back on the next event.
    pub fn drain(&mut self) -> io::Result<()> {
        let mut buf = [0u8; RECV_BUF_SIZE];
        loop {
            match self.stdout.read(&mut buf) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => self.output.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// SIGKILLs the child and reaps it. Used on gateway timeout and on
    /// connection teardown so no zombie survives the connection.
    pub fn kill_and_reap(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for CgiRequest {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            self.kill_and_reap();
        }
    }
}

/// Parsed CGI child output. `bad_output` routes the caller to a 502.
#[derive(Debug, Default)]
pub struct CgiOutput {
    pub status: u16,
    pub reason: Option<String>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub bad_output: bool,
}

/// Builds the RFC 3875 environment table from the request and the matched
/// configuration, including the `HTTP_`-prefixed copies of every request
/// header.
pub fn build_env(req: &Request, conf: &Config, script_path: &str) -> Vec<(String, String)> {
    let mut env = vec![
        ("REQUEST_METHOD".to_string(), req.method.to_string()),
        (
            "QUERY_STRING".to_string(),
            req.query.clone().unwrap_or_default(),
        ),
        ("CONTENT_LENGTH".to_string(), req.body.len().to_string()),
        ("PATH_INFO".to_string(), req.target.clone()),
        ("SCRIPT_FILENAME".to_string(), script_path.to_string()),
        ("SCRIPT_NAME".to_string(), req.target.clone()),
        ("REQUEST_URI".to_string(), req.target.clone()),
        ("SERVER_PROTOCOL".to_string(), req.http_version.clone()),
        ("SERVER_SOFTWARE".to_string(), SERVER_SOFTWARE.to_string()),
        ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
        ("REDIRECT_STATUS".to_string(), "200".to_string()),
        ("SERVER_NAME".to_string(), conf.host.clone()),
        ("SERVER_PORT".to_string(), conf.port.to_string()),
    ];

    if let Some(ct) = req.header("content-type").and_then(|v| v.first()) {
        env.push(("CONTENT_TYPE".to_string(), ct.clone()));
    }

    for (key, values) in &req.headers {
        let Some(value) = values.first() else {
            continue;
        };
        let mut env_key = String::with_capacity(5 + key.len());
        env_key.push_str("HTTP_");
        for c in key.chars() {
            env_key.push(if c == '-' { '_' } else { c.to_ascii_uppercase() });
        }
        env.push((env_key, value.clone()));
    }

    env
}

/// Launches the CGI script with its stdin and stdout wired to the server.
/// The whole request body is written to the child's stdin up front and the
/// handle dropped, so the child sees EOF; stdout comes back as a
/// non-blocking stream for the reactor to drain.
pub fn spawn(script_path: &Path, req: &Request, conf: &Config) -> io::Result<CgiRequest> {
    let script = script_path.to_string_lossy().into_owned();
    let (parent_out, child_out) = UnixStream::pair()?;
    parent_out.set_nonblocking(true)?;

    let mut child = Command::new(&script)
        .env_clear()
        .envs(build_env(req, conf, &script))
        .stdin(Stdio::piped())
        .stdout(Stdio::from(OwnedFd::from(child_out)))
        .stderr(Stdio::inherit())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        if !req.body.is_empty() {
            if let Err(e) = stdin.write_all(&req.body) {
                error!("writing request body to CGI stdin failed: {}", e);
            }
        }
        // Dropping the handle closes the child's stdin.
    }

    Ok(CgiRequest {
        child,
        start_time: Instant::now(),
        stdout: mio::net::UnixStream::from_std(parent_out),
        token: None,
        output: Vec::new(),
        eof: false,
    })
}

/// Splits the raw child output at the first blank line into headers and
/// body, recognizing `Status`, `Content-Type`, and `Content-Length`. A
/// missing `Status` means 200; anything unparseable flags the output as bad.
pub fn parse_output(raw: &[u8]) -> CgiOutput {
    let mut out = CgiOutput {
        status: 200,
        ..CgiOutput::default()
    };

    if raw.is_empty() {
        out.bad_output = true;
        return out;
    }

    let (header_section, body) =
        match crate::utils::find_subsequence(raw, b"\r\n\r\n", 0) {
            Some(pos) => (&raw[..pos], &raw[pos + 4..]),
            None => match crate::utils::find_subsequence(raw, b"\r\n", 0) {
                Some(pos) => (&raw[..pos], &raw[pos + 2..]),
                None => {
                    // No separator at all: the whole payload is the body.
                    out.body = raw.to_vec();
                    return out;
                }
            },
        };
    out.body = body.to_vec();

    let header_section = String::from_utf8_lossy(header_section);
    for line in header_section.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = trim_whitespace(key);
        let value = trim_whitespace(value);

        match key {
            "Status" => {
                let digits_end = value
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(value.len());
                match value[..digits_end].parse::<u16>() {
                    Ok(code) => {
                        out.status = code;
                        let reason = trim_whitespace(&value[digits_end..]);
                        if !reason.is_empty() {
                            out.reason = Some(reason.to_string());
                        }
                    }
                    Err(_) => {
                        out.bad_output = true;
                        return out;
                    }
                }
            }
            "Content-Type" => out.content_type = Some(value.to_string()),
            "Content-Length" => match value.parse::<usize>() {
                Ok(len) if len == out.body.len() => {}
                _ => {
                    out.bad_output = true;
                    return out;
                }
            },
            _ => {}
        }
    }

    out
}
