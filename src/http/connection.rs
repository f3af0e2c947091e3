use crate::cgi::CgiRequest;
use crate::prelude::*;

/// A client socket with its request state, pending responses, and an
/// optional running CGI child. Owned 1:1 by a poll token.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub token: Token,
    pub listener_token: Token,
    pub request: Request,
    pub responses: VecDeque<Response>,
    pub cgi: Option<CgiRequest>,
    configs: Vec<Arc<Config>>,
}

impl Connection {
    /// `configs` are the virtual hosts bound to the listener this client
    /// arrived on; the first entry is the endpoint default.
    pub fn new(
        stream: TcpStream,
        token: Token,
        listener_token: Token,
        configs: Vec<Arc<Config>>,
    ) -> Self {
        Connection {
            stream,
            token,
            listener_token,
            request: Request::new(),
            responses: VecDeque::new(),
            cgi: None,
            configs,
        }
    }

    /// Picks the virtual host whose server_name matches the Host header,
    /// falling back to the endpoint default.
    pub fn resolve_config(&self) -> Arc<Config> {
        if let Some(hostname) = self.request.host() {
            for config in &self.configs {
                if config.server_name == hostname {
                    return Arc::clone(config);
                }
            }
        }
        Arc::clone(&self.configs[0])
    }

    /// Runs the per-request timers, then the CGI deadline. A timed-out CGI
    /// child also forfeits keep-alive.
    pub fn check_timeouts(&mut self) {
        self.request.check_timeouts();

        if self.request.status == ClientStatus::CgiRunning {
            if let Some(cgi) = &self.cgi {
                if cgi.start_time.elapsed() > CGI_TIMEOUT {
                    debug!("CGI timeout");
                    self.request.status = ClientStatus::GatewayTimeout;
                    self.request.keep_alive = false;
                }
            }
        }
    }
}
