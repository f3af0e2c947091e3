use crate::cgi;
use crate::prelude::*;
use crate::upload;

use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::sync::atomic::{AtomicBool, Ordering};

/// SIGINT flag. Has to stay a process global, POSIX hands the handler no
/// context.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handler() {
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
    }
}

/// One listening endpoint and the virtual hosts bound to it. The first
/// config is the endpoint default.
pub struct ListenerGroup {
    pub token: Token,
    pub listener: TcpListener,
    pub host: String,
    pub port: u16,
    pub configs: Vec<Arc<Config>>,
}

/// Single-threaded reactor multiplexing listeners, clients, and CGI pipes
/// over one poll instance.
pub struct Server {
    poll: Poll,
    groups: Vec<ListenerGroup>,
    connections: HashMap<Token, Connection>,
    cgi_to_client: HashMap<Token, Token>,
    next_token: usize,
    pages: PageCache,
}

impl Server {
    /// Groups configs by (host, port), creates one listener per group, and
    /// registers everything with the poll instance. Any failure here is
    /// fatal.
    pub fn new(config: &AppConfig, pages: PageCache) -> Result<Server> {
        let poll = Poll::new()?;
        let configs = config.expand();

        let mut grouped: Vec<(String, u16, Vec<Arc<Config>>)> = Vec::new();
        for conf in configs {
            match grouped
                .iter_mut()
                .find(|(host, port, _)| *host == conf.host && *port == conf.port)
            {
                Some((_, _, members)) => members.push(conf),
                None => grouped.push((conf.host.clone(), conf.port, vec![conf])),
            }
        }

        let mut groups = Vec::with_capacity(grouped.len());
        for (index, (host, port, members)) in grouped.into_iter().enumerate() {
            let token = Token(index);
            let mut listener = create_listener(&host, port)?;
            poll.registry()
                .register(&mut listener, token, Interest::READABLE)?;
            info!("listening on {}:{}", host, port);
            groups.push(ListenerGroup {
                token,
                listener,
                host,
                port,
                configs: members,
            });
        }

        let next_token = groups.len();
        Ok(Server {
            poll,
            groups,
            connections: HashMap::new(),
            cgi_to_client: HashMap::new(),
            next_token,
            pages,
        })
    }

    /// Poll loop. Runs until SIGINT flips the shutdown flag; a signal
    /// interrupting poll itself shows up as EINTR and is re-checked on the
    /// next round.
    pub fn run(&mut self) -> Result<()> {
        install_signal_handler();
        let mut events = Events::with_capacity(256);

        while !SHUTDOWN.load(Ordering::SeqCst) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            let ready: Vec<(Token, bool, bool)> = events
                .iter()
                .map(|event| {
                    (
                        event.token(),
                        event.is_readable() || event.is_read_closed(),
                        event.is_writable(),
                    )
                })
                .collect();

            for (token, readable, writable) in ready {
                if token.0 < self.groups.len() {
                    self.accept_clients(token);
                } else if self.cgi_to_client.contains_key(&token) {
                    if readable {
                        self.handle_cgi_event(token);
                    }
                } else {
                    if readable {
                        self.handle_client_data(token);
                    }
                    if writable {
                        self.handle_client_write(token);
                    }
                }
            }

            self.check_timeouts();
        }

        info!("server closed with SIGINT signal");
        Ok(())
    }

    /// Accepts every pending client on a listener, rejecting past the client
    /// cap.
    fn accept_clients(&mut self, listener_token: Token) {
        loop {
            let group = &mut self.groups[listener_token.0];
            match group.listener.accept() {
                Ok((mut stream, addr)) => {
                    if self.connections.len() >= MAX_CLIENTS {
                        warn!("client limit reached, rejecting connection from {}", addr);
                        drop(stream);
                        continue;
                    }
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        error!("failed to register client {}: {}", addr, e);
                        continue;
                    }
                    let configs = group.configs.clone();
                    self.connections
                        .insert(token, Connection::new(stream, token, listener_token, configs));
                    info!("new client accepted from {}", addr);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("accept: {}", e);
                    break;
                }
            }
        }
    }

    /// Reads everything the socket currently has, one recv block at a time,
    /// advancing the request state machine after each block, then dispatches
    /// on the resulting status.
    fn handle_client_data(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        let mut peer_closed = false;
        let mut buf = [0u8; RECV_BUF_SIZE];
        while conn.request.status == ClientStatus::WaitingData {
            match conn.stream.read(&mut buf) {
                Ok(0) => {
                    peer_closed = true;
                    break;
                }
                Ok(n) => Self::advance_request(conn, &buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("recv: {}", e);
                    peer_closed = true;
                    break;
                }
            }
        }

        if peer_closed && conn.request.status == ClientStatus::WaitingData {
            info!("client disconnected");
            self.remove_client(token);
            return;
        }

        let conf = conn.resolve_config();
        match conn.request.status {
            ClientStatus::Error => {
                error!("connection dropped: suspicious request");
                self.remove_client(token);
            }
            ClientStatus::WaitingData => {}
            ClientStatus::CompleteReq
                if conn.request.is_cgi && conn.request.override_code.is_none() =>
            {
                self.start_cgi(token, conf);
            }
            ClientStatus::CompleteReq | ClientStatus::Invalid => {
                self.prepare_response(token, conf);
            }
            _ => {}
        }
    }

    /// Feeds one received block to the parser, then applies the matched
    /// virtual host's upload directory and body cap.
    fn advance_request(conn: &mut Connection, chunk: &[u8]) {
        conn.request.process(chunk);

        let conf = conn.resolve_config();
        if !conn.request.headers_complete {
            return;
        }
        conn.request.max_body_size = conf.max_body_size();

        // Multipart uploads drain from here, streaming complete parts to
        // disk as they arrive.
        if conn.request.method == Method::Post
            && conn.request.boundary.is_some()
            && !matches!(
                conn.request.status,
                ClientStatus::Invalid | ClientStatus::Error
            )
        {
            if conf.upload_dir.is_some() {
                conn.request.upload_dir = conf.upload_dir.clone();
                upload::handle_file_upload(&mut conn.request);
            } else {
                debug!("file uploading is forbidden, no upload_dir configured");
                conn.request.override_code = Some(HTTP_FORBIDDEN);
                conn.request.status = ClientStatus::Invalid;
            }
        }

        // Enforce the matched config's body cap.
        if conn.request.status != ClientStatus::Invalid {
            let cap = conf.max_body_size();
            let declared_over = conn.request.content_length.is_some_and(|len| len > cap);
            if declared_over || conn.request.body.len() > cap {
                conn.request.override_code = Some(HTTP_PAYLOAD_TOO_LARGE);
                conn.request.status = ClientStatus::Invalid;
            }
        }
    }

    /// Builds the response for the current request state and queues it for
    /// sending.
    fn prepare_response(&mut self, token: Token, conf: Arc<Config>) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        info!("building response");
        let response = Response::build(&conn.request, &conf, &mut self.pages);
        self.enqueue_response(token, response);
    }

    /// Queues a finished response: the request resets for a possible
    /// follow-up, the send timer starts, and the socket is armed for
    /// writability.
    fn enqueue_response(&mut self, token: Token, response: Response) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        conn.responses.push_back(response);
        conn.request.reset();
        conn.request.status = ClientStatus::ReadyForResponse;
        conn.request.set_idle_start();
        conn.request.set_send_start();

        if let Err(e) = self.poll.registry().reregister(
            &mut conn.stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            error!("failed to arm socket for writing: {}", e);
            self.remove_client(token);
        }
    }

    /// Resolves the script path, forks the CGI child, and hands its stdout
    /// to the poll set.
    fn start_cgi(&mut self, token: Token, conf: Arc<Config>) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        let script = conf
            .resolve_target(&conn.request.target)
            .filter(|path| path.is_file());
        let Some(script) = script else {
            conn.request.override_code = Some(HTTP_NOT_FOUND);
            self.prepare_response(token, conf);
            return;
        };

        match cgi::spawn(&script, &conn.request, &conf) {
            Ok(mut cgi_req) => {
                let cgi_token = Token(self.next_token);
                self.next_token += 1;
                if let Err(e) = self.poll.registry().register(
                    &mut cgi_req.stdout,
                    cgi_token,
                    Interest::READABLE,
                ) {
                    error!("failed to register CGI pipe: {}", e);
                    conn.request.override_code = Some(HTTP_INTERNAL_SERVER_ERROR);
                    self.prepare_response(token, conf);
                    return;
                }
                cgi_req.token = Some(cgi_token);
                self.cgi_to_client.insert(cgi_token, token);
                conn.cgi = Some(cgi_req);
                conn.request.status = ClientStatus::CgiRunning;
                conn.request.reset_recv_start();
                conn.request.set_idle_start();
                info!("CGI child started for {}", script.display());
            }
            Err(e) => {
                error!("CGI launch failed: {}", e);
                conn.request.override_code = Some(HTTP_INTERNAL_SERVER_ERROR);
                self.prepare_response(token, conf);
            }
        }
    }

    /// Drains the CGI stdout pipe; once the child has exited and the pipe
    /// hit EOF, the collected output becomes the response.
    fn handle_cgi_event(&mut self, cgi_token: Token) {
        let Some(&client_token) = self.cgi_to_client.get(&cgi_token) else {
            return;
        };
        let Some(conn) = self.connections.get_mut(&client_token) else {
            return;
        };
        let Some(cgi_req) = conn.cgi.as_mut() else {
            return;
        };

        if let Err(e) = cgi_req.drain() {
            error!("CGI pipe read failed: {}", e);
            self.abort_cgi(client_token, HTTP_INTERNAL_SERVER_ERROR);
            return;
        }

        if conn.cgi.as_mut().is_some_and(|c| c.is_finished()) {
            self.finalize_cgi(client_token);
        }
    }

    /// Turns the drained child output into the queued response.
    fn finalize_cgi(&mut self, client_token: Token) {
        let Some(mut cgi_req) = self
            .connections
            .get_mut(&client_token)
            .and_then(|conn| conn.cgi.take())
        else {
            return;
        };
        self.release_cgi(&mut cgi_req);
        let output = cgi::parse_output(&cgi_req.output);

        let Some(conn) = self.connections.get_mut(&client_token) else {
            return;
        };
        let conf = conn.resolve_config();
        let keep_alive = conn.request.keep_alive;
        let response = Response::from_cgi(&output, keep_alive, &conf, &mut self.pages);
        self.enqueue_response(client_token, response);
    }

    /// Kills the child (if still running) and responds with a server error.
    fn abort_cgi(&mut self, client_token: Token, code: u16) {
        if let Some(mut cgi_req) = self
            .connections
            .get_mut(&client_token)
            .and_then(|conn| conn.cgi.take())
        {
            cgi_req.kill_and_reap();
            self.release_cgi(&mut cgi_req);
        }

        let Some(conn) = self.connections.get_mut(&client_token) else {
            return;
        };
        conn.request.override_code = Some(code);
        let conf = conn.resolve_config();
        self.prepare_response(client_token, conf);
    }

    fn release_cgi(&mut self, cgi_req: &mut cgi::CgiRequest) {
        if let Some(token) = cgi_req.token.take() {
            self.cgi_to_client.remove(&token);
        }
        let _ = self.poll.registry().deregister(&mut cgi_req.stdout);
    }

    /// Writes as much queued response data as the socket accepts. A
    /// completed send either closes the connection or rearms it for the next
    /// request.
    fn handle_client_write(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        if conn.request.status != ClientStatus::ReadyForResponse {
            return;
        }
        let Some(response) = conn.responses.front_mut() else {
            return;
        };

        info!("sending response");
        if let Err(e) = response.send_to_client(&mut conn.stream) {
            error!("send: {}", e);
            self.remove_client(token);
            return;
        }
        if !response.send_is_complete() {
            info!("response partially sent, waiting for socket to drain");
            return;
        }

        let Some(sent) = conn.responses.pop_front() else {
            return;
        };
        if sent.status_code / 100 != 2 {
            conn.request.keep_alive = false;
        }
        conn.request.reset_send_start();

        if !conn.request.keep_alive {
            self.remove_client(token);
            return;
        }

        conn.request.reset_keep_alive();
        conn.request.status = ClientStatus::WaitingData;
        conn.request.set_idle_start();
        if let Err(e) = self
            .poll
            .registry()
            .reregister(&mut conn.stream, token, Interest::READABLE)
        {
            error!("failed to rearm socket for reading: {}", e);
            self.remove_client(token);
        }
    }

    /// Per-tick sweep: finish CGI children whose EOF arrived before their
    /// exit, then apply the idle/recv/send/gateway deadlines.
    fn check_timeouts(&mut self) {
        let tokens: Vec<Token> = self.connections.keys().copied().collect();

        for token in tokens {
            let Some(conn) = self.connections.get_mut(&token) else {
                continue;
            };

            if conn.request.status == ClientStatus::CgiRunning
                && conn.cgi.as_mut().is_some_and(|c| c.is_finished())
            {
                self.finalize_cgi(token);
                continue;
            }

            conn.check_timeouts();
            match conn.request.status {
                ClientStatus::RecvTimeout => {
                    conn.request.override_code = Some(HTTP_REQUEST_TIMEOUT);
                    let conf = conn.resolve_config();
                    self.prepare_response(token, conf);
                }
                ClientStatus::IdleTimeout | ClientStatus::SendTimeout => {
                    self.remove_client(token);
                }
                ClientStatus::GatewayTimeout => {
                    self.abort_cgi(token, HTTP_GATEWAY_TIMEOUT);
                }
                _ => {}
            }
        }
    }

    /// Closes a client and releases everything it owns; a live CGI child is
    /// killed and reaped on drop.
    fn remove_client(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            info!("removing client");
            if let Some(mut cgi_req) = conn.cgi.take() {
                self.release_cgi(&mut cgi_req);
                // CgiRequest::drop reaps the child.
            }
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
    }

    pub fn client_count(&self) -> usize {
        self.connections.len()
    }

    pub fn listener_count(&self) -> usize {
        self.groups.len()
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.groups
            .iter()
            .filter_map(|group| group.listener.local_addr().ok())
            .collect()
    }
}

/// Creates one listening socket: SO_REUSEADDR, non-blocking, bound, with the
/// pending-connection backlog capped.
fn create_listener(host: &str, port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| FatalError::Config(format!("{}:{}: {}", host, port, e)))?;

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(SockProtocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(MAX_PENDING)?;

    Ok(TcpListener::from_std(socket.into()))
}
