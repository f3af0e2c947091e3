use crate::pages::PageError;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use crate::prelude::CACHE_SIZE_MAX;

/// Current time in the RFC 7231 preferred format, e.g.
/// `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn imf_fixdate() -> String {
    httpdate::fmt_http_date(SystemTime::now())
}

pub fn is_valid_imf_fixdate(s: &str) -> bool {
    httpdate::parse_http_date(s).is_ok()
}

/// Removes leading and trailing spaces and horizontal tabs.
pub fn trim_whitespace(s: &str) -> &str {
    s.trim_matches(|c| c == ' ' || c == '\t')
}

/// Splits on `delim`, dropping empty segments.
pub fn split_str<'a>(s: &'a str, delim: &str) -> Vec<&'a str> {
    s.split(delim).filter(|part| !part.is_empty()).collect()
}

pub fn is_valid_ipv4(s: &str) -> bool {
    let octets = split_str(s, ".");
    if octets.len() != 4 || s.starts_with('.') || s.ends_with('.') || s.contains("..") {
        return false;
    }
    octets.iter().all(|octet| {
        octet.len() <= 3
            && !octet.is_empty()
            && octet.bytes().all(|b| b.is_ascii_digit())
            && octet.parse::<u16>().map(|n| n <= 255).unwrap_or(false)
    })
}

pub fn is_valid_port(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) && s.parse::<u16>().is_ok()
}

pub fn is_unsigned_int_literal(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

pub fn is_positive_double_literal(s: &str) -> bool {
    let mut dots = 0;
    if s.is_empty() || s.starts_with('.') || s.ends_with('.') {
        return false;
    }
    for b in s.bytes() {
        match b {
            b'.' => dots += 1,
            b'0'..=b'9' => {}
            _ => return false,
        }
    }
    dots <= 1
}

/// URI targets may not carry control bytes, DEL, or the characters that break
/// out of an HTML or header context.
pub fn uri_format_ok(uri: &str) -> bool {
    uri.bytes()
        .all(|b| (32..127).contains(&b) && b != b'<' && b != b'>' && b != b'"' && b != b'\\')
}

/// True when normalizing the path climbs above its search root, e.g.
/// `/a/../../etc/passwd`.
pub fn uri_target_above_root(uri: &str) -> bool {
    let mut depth: isize = 0;
    for segment in uri.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            _ => depth += 1,
        }
    }
    false
}

/// Extracts the run of text following `key`, up to the next CR, LF, or
/// semicolon. Used on multipart part-header blocks, e.g.
/// `extract_value(h, "Content-Type: ")`.
pub fn extract_value(src: &str, key: &str) -> Option<String> {
    let start = src.find(key)? + key.len();
    let rest = &src[start..];
    let end = rest
        .find(|c| c == '\r' || c == '\n' || c == ';')
        .unwrap_or(rest.len());
    Some(trim_whitespace(&rest[..end]).to_string())
}

/// Extracts a double-quoted value following `key`, e.g.
/// `extract_quoted_value(h, "filename=")` on `filename="a.txt"`.
pub fn extract_quoted_value(src: &str, key: &str) -> Option<String> {
    let start = src.find(key)? + key.len();
    let rest = &src[start..];
    let rest = rest.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

/// Reads a file that must live under `search_dir` once both paths are
/// normalized. Rejects files larger than the page-cache bound so callers can
/// fall back to a streaming read.
pub fn get_file_as_bytes(name: &str, search_dir: &str) -> Result<Vec<u8>, PageError> {
    let root = Path::new(search_dir)
        .canonicalize()
        .map_err(|_| PageError::NotFound)?;
    let path = resolve_under(&root, name)?;

    let meta = std::fs::metadata(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => PageError::NotFound,
        _ => PageError::Io,
    })?;
    if !meta.is_file() {
        return Err(PageError::NotFound);
    }
    if meta.len() as usize > CACHE_SIZE_MAX {
        return Err(PageError::FileTooLarge);
    }

    std::fs::read(&path).map_err(|_| PageError::Io)
}

fn resolve_under(root: &Path, name: &str) -> Result<PathBuf, PageError> {
    let candidate = if Path::new(name).is_absolute() {
        PathBuf::from(name)
    } else {
        root.join(name)
    };
    let resolved = candidate.canonicalize().map_err(|_| PageError::NotFound)?;
    if !resolved.starts_with(root) {
        return Err(PageError::NotFound);
    }
    Ok(resolved)
}

/// Strips any directory components from a client-supplied filename.
pub fn sanitize_filename(name: &str) -> Option<String> {
    let base = Path::new(name)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .next_back()?;
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    Some(base.to_string())
}

/// Locates `needle` in `haystack` starting from `from`.
pub fn find_subsequence(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| from + pos)
}
