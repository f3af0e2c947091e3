pub mod cgi;
pub mod config;
pub mod error;
pub mod http;
pub mod pages;
pub mod prelude;
pub mod server;
pub mod upload;
pub mod utils;

pub use config::{AppConfig, Config};
pub use error::{FatalError, Result};
pub use http::{ClientStatus, Connection, Method, Request, Response};
pub use pages::PageCache;
pub use server::Server;
