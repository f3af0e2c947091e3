use crate::prelude::*;
use crate::utils::get_file_as_bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageError {
    NotFound,
    FileTooLarge,
    Io,
}

impl Display for PageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageError::NotFound => write!(f, "page not found"),
            PageError::FileTooLarge => write!(f, "file too large for cache"),
            PageError::Io => write!(f, "page i/o error"),
        }
    }
}

impl std::error::Error for PageError {}

const DEFAULT_200: &str = "<!DOCTYPE html>
<html>
\t<head>
\t</head>
\t<body>
\t\t<p>200: OK</p>
\t</body>
</html>
";

const DEFAULT_204: &str = "<!DOCTYPE html>
<html>
\t<head>
\t</head>
\t<body>
\t\t<p>204: no content</p>
\t</body>
</html>
";

const DEFAULT_400: &str = "<!DOCTYPE html>
<html>
\t<head>
\t</head>
\t<body>
\t\t<p>400: bad request</p>
\t</body>
</html>
";

const DEFAULT_404: &str = "<!DOCTYPE html>
<html>
\t<head>
\t</head>
\t<body>
\t\t<p>404: resource not found</p>
\t</body>
</html>
";

/// Bounded in-memory cache of file contents, keyed by absolute path plus the
/// synthetic `default…` keys. Entries are reference counted so a page being
/// sent stays valid even if it is evicted mid-send. Only the reactor thread
/// touches the cache.
pub struct PageCache {
    entries: HashMap<String, Arc<Vec<u8>>>,
    size: usize,
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PageCache {
    pub fn new() -> Self {
        PageCache {
            entries: HashMap::new(),
            size: 0,
        }
    }

    /// Installs the four compiled-in fallback pages, replacing any previous
    /// versions.
    pub fn load_defaults(&mut self) {
        for (key, body) in [
            ("default200", DEFAULT_200),
            ("default204", DEFAULT_204),
            ("default400", DEFAULT_400),
            ("default404", DEFAULT_404),
        ] {
            if let Some(old) = self.entries.remove(key) {
                self.size -= old.len();
            }
            self.insert(key.to_string(), body.as_bytes().to_vec());
        }
    }

    /// Returns the cached content for `key`, loading it from disk on a miss.
    /// Non-default keys are treated as absolute paths so every resource has a
    /// unique identifier.
    pub fn get(&mut self, key: &str) -> std::result::Result<Arc<Vec<u8>>, PageError> {
        if let Some(content) = self.entries.get(key) {
            return Ok(Arc::clone(content));
        }

        trace!("page cache miss for {}", key);
        let page = get_file_as_bytes(key, "/")?;
        if page.len() > CACHE_SIZE_MAX {
            return Err(PageError::FileTooLarge);
        }
        Ok(self.insert(key.to_string(), page))
    }

    fn insert(&mut self, key: String, page: Vec<u8>) -> Arc<Vec<u8>> {
        while self.size > 0 && self.size + page.len() > CACHE_SIZE_MAX {
            // Any entry will do, the contract is the bound, not the order.
            let Some(victim) = self.entries.keys().next().cloned() else {
                break;
            };
            debug!("evicting {} from page cache to make room for {}", victim, key);
            if let Some(old) = self.entries.remove(&victim) {
                self.size -= old.len();
            }
        }

        let content = Arc::new(page);
        self.size += content.len();
        self.entries.insert(key, Arc::clone(&content));
        content
    }

    pub fn clear_cache(&mut self) {
        self.entries.clear();
        self.size = 0;
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Maps a status code to the closest built-in fallback page key.
    pub fn default_key_for(code: u16) -> &'static str {
        match code {
            HTTP_NO_CONTENT => "default204",
            HTTP_NOT_FOUND => "default404",
            c if (200..300).contains(&c) => "default200",
            c if (400..500).contains(&c) => "default400",
            _ => "default400",
        }
    }
}
