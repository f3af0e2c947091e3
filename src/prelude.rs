pub use crate::config::{AppConfig, Config};
pub use crate::error::{FatalError, Result};
pub use crate::http::*;
pub use crate::pages::{PageCache, PageError};

pub use log::{debug, error, info, trace, warn};
pub use mio::{
    Events, Interest, Poll, Token,
    event::Event,
    net::{TcpListener, TcpStream},
};
pub use std::collections::{HashMap, VecDeque};
pub use std::fs::{self, File, OpenOptions};
pub use std::io::{ErrorKind, Read, Write};
pub use std::net::SocketAddr;
pub use std::path::{Path, PathBuf};
pub use std::sync::Arc;
pub use std::time::{Duration, Instant};

pub use std::{
    fmt::{self, Display},
    io,
    os::unix::net::UnixStream,
    process::{Child, Command, Stdio},
    str::FromStr,
};

// 2xx
pub const HTTP_OK: u16 = 200;
pub const HTTP_CREATED: u16 = 201;
pub const HTTP_NO_CONTENT: u16 = 204;

// 4xx client errors
pub const HTTP_BAD_REQUEST: u16 = 400;
pub const HTTP_FORBIDDEN: u16 = 403;
pub const HTTP_NOT_FOUND: u16 = 404;
pub const HTTP_METHOD_NOT_ALLOWED: u16 = 405;
pub const HTTP_REQUEST_TIMEOUT: u16 = 408;
pub const HTTP_CONFLICT: u16 = 409;
pub const HTTP_PAYLOAD_TOO_LARGE: u16 = 413;

// 5xx server errors
pub const HTTP_INTERNAL_SERVER_ERROR: u16 = 500;
pub const HTTP_BAD_GATEWAY: u16 = 502;
pub const HTTP_GATEWAY_TIMEOUT: u16 = 504;

pub const REQLINE_MAX_SIZE: usize = 8192;
pub const HEADERS_MAX_SIZE: usize = 32768;
pub const CLIENT_MAX_BODY_SIZE: usize = 1_048_576; // default, configs may override
pub const CACHE_SIZE_MAX: usize = 4_194_304; // 4 MiB
pub const MAX_PENDING: i32 = 20;
pub const MAX_CLIENTS: usize = 128;
pub const RECV_BUF_SIZE: usize = 4096;

pub const POLL_TIMEOUT: Duration = Duration::from_millis(500);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);
pub const CGI_TIMEOUT: Duration = Duration::from_secs(5);

pub const SERVER_SOFTWARE: &str = "Webserv/1.0";
