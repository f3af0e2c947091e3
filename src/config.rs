use crate::error::{FatalError, Result};
use crate::prelude::CLIENT_MAX_BODY_SIZE;
use crate::utils::{is_unsigned_int_literal, is_valid_ipv4, uri_target_above_root};

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

/// One `server` entry as written in the configuration file. A single entry
/// may listen on several ports; it is expanded into one [`Config`] per port.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub host: String,
    #[serde(alias = "host_name")]
    pub server_name: String,
    pub listen: Vec<u16>,
    #[serde(default)]
    pub error_pages: HashMap<String, String>,
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
    #[serde(default)]
    pub upload_dir: Option<String>,
    #[serde(default)]
    pub client_max_body_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: Vec<ServerEntry>,
}

impl AppConfig {
    pub fn load(path: &str) -> Result<AppConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FatalError::Config(format!("{}: {}", path, e)))?;
        let config: AppConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.server.is_empty() {
            return Err("no server entries".into());
        }
        for entry in &self.server {
            if !is_valid_ipv4(&entry.host) {
                return Err(format!("invalid host address: {}", entry.host).into());
            }
            if entry.listen.is_empty() {
                return Err(format!("server {} has no listen ports", entry.server_name).into());
            }
            for code in entry.error_pages.keys() {
                if !is_unsigned_int_literal(code) || code.parse::<u16>().is_err() {
                    return Err(format!("invalid error page code: {}", code).into());
                }
            }
        }
        Ok(())
    }

    /// Expands file entries into runtime units, one per (host, port). File
    /// order is preserved so that the first entry for an endpoint stays the
    /// endpoint's default virtual host.
    pub fn expand(&self) -> Vec<Arc<Config>> {
        let mut configs = Vec::new();
        for entry in &self.server {
            for &port in &entry.listen {
                let error_pages = entry
                    .error_pages
                    .iter()
                    .filter_map(|(code, path)| Some((code.parse::<u16>().ok()?, path.clone())))
                    .collect();
                configs.push(Arc::new(Config {
                    host: entry.host.clone(),
                    port,
                    server_name: entry.server_name.clone(),
                    routes: entry.routes.clone(),
                    error_pages,
                    upload_dir: entry.upload_dir.clone().map(PathBuf::from),
                    client_max_body_size: entry.client_max_body_size,
                }));
            }
        }
        configs
    }
}

/// Runtime configuration unit bound to exactly one (host, port).
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub server_name: String,
    pub routes: BTreeMap<String, String>,
    pub error_pages: HashMap<u16, String>,
    pub upload_dir: Option<PathBuf>,
    pub client_max_body_size: Option<usize>,
}

impl Config {
    pub fn max_body_size(&self) -> usize {
        self.client_max_body_size.unwrap_or(CLIENT_MAX_BODY_SIZE)
    }

    /// Longest-prefix route match for a request target.
    pub fn find_route(&self, target: &str) -> Option<(&str, &str)> {
        self.routes
            .iter()
            .filter(|(prefix, _)| target.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(prefix, root)| (prefix.as_str(), root.as_str()))
    }

    /// Maps a target through `routes` onto the local filesystem, refusing
    /// targets that climb out of their route root.
    pub fn resolve_target(&self, target: &str) -> Option<PathBuf> {
        if uri_target_above_root(target) {
            return None;
        }
        let (prefix, root) = self.find_route(target)?;
        let rest = target[prefix.len()..].trim_start_matches('/');
        let mut path = PathBuf::from(root);
        if !rest.is_empty() {
            path.push(rest);
        }
        Some(path)
    }
}
