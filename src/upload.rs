use crate::prelude::*;
use crate::utils::{extract_quoted_value, extract_value, find_subsequence, sanitize_filename};

/// One decoded part of a multipart/form-data body.
#[derive(Debug, Default)]
pub struct MultipartPart {
    pub name: Option<String>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// Drains as many complete multipart parts as the buffer holds, writing each
/// file part under the configured upload directory. Called from the reactor
/// whenever new bytes arrive for a POST with a boundary.
///
/// The closing `--<boundary>--` delimiter completes the request with 201.
/// A missing upload directory is 403, a name collision 409, and any write
/// failure 500.
pub fn handle_file_upload(req: &mut Request) {
    let Some(boundary) = req.boundary.clone() else {
        return;
    };
    let part_delim = format!("--{}", boundary).into_bytes();
    let end_suffix = b"--";

    loop {
        let Some(part_start) = find_subsequence(&req.buffer, &part_delim, 0) else {
            req.status = ClientStatus::WaitingData;
            break;
        };

        let after_delim = part_start + part_delim.len();
        if req.buffer[after_delim..].starts_with(end_suffix) {
            // Closing delimiter: upload finished.
            req.buffer.clear();
            req.override_code = Some(HTTP_CREATED);
            req.status = ClientStatus::CompleteReq;
            break;
        }

        let mut headers_start = after_delim;
        if req.buffer[headers_start..].starts_with(b"\r\n") {
            headers_start += 2;
        }

        let Some(part_end) = find_subsequence(&req.buffer, &part_delim, headers_start) else {
            req.status = ClientStatus::WaitingData;
            break;
        };

        if part_end < headers_start + 2 {
            error!("no data between multipart delimiters");
            req.status = ClientStatus::Error;
            req.keep_alive = false;
            return;
        }

        // The part body ends right before the CRLF preceding the next
        // delimiter.
        let chunk = &req.buffer[headers_start..part_end - 2];
        let Some(part) = split_part(chunk) else {
            error!("multipart part without a header section");
            req.status = ClientStatus::Error;
            req.keep_alive = false;
            return;
        };

        if part.filename.is_some() && !save_part(req, &part) {
            return;
        }

        req.buffer.drain(..part_end);
    }
}

/// Splits a complete part into its header block and data, extracting the
/// Content-Disposition fields.
fn split_part(chunk: &[u8]) -> Option<MultipartPart> {
    let headers_end = find_subsequence(chunk, b"\r\n\r\n", 0)?;
    let headers = String::from_utf8_lossy(&chunk[..headers_end]);

    Some(MultipartPart {
        name: extract_quoted_value(&headers, "name="),
        filename: extract_quoted_value(&headers, "filename="),
        content_type: extract_value(&headers, "Content-Type: "),
        data: chunk[headers_end + 4..].to_vec(),
    })
}

/// Opens `<upload_dir>/<basename>` for the part and writes its data. Each
/// part with a filename gets its own destination; overwriting an existing
/// file is refused.
fn save_part(req: &mut Request, part: &MultipartPart) -> bool {
    let Some(upload_dir) = req.upload_dir.clone() else {
        error!("upload directory is not configured");
        req.override_code = Some(HTTP_FORBIDDEN);
        req.status = ClientStatus::Invalid;
        return false;
    };

    if !upload_dir.exists() {
        if let Err(e) = fs::create_dir_all(&upload_dir) {
            error!("failed to create upload directory: {}", e);
            req.override_code = Some(HTTP_INTERNAL_SERVER_ERROR);
            req.status = ClientStatus::Invalid;
            return false;
        }
    }

    let Some(basename) = part.filename.as_deref().and_then(sanitize_filename) else {
        error!("multipart part carries an unusable filename");
        req.override_code = Some(HTTP_INTERNAL_SERVER_ERROR);
        req.status = ClientStatus::Invalid;
        return false;
    };
    let target = upload_dir.join(&basename);

    if target.exists() {
        error!("upload target {} already exists", target.display());
        req.override_code = Some(HTTP_CONFLICT);
        req.status = ClientStatus::Invalid;
        return false;
    }

    let mut file = match OpenOptions::new().write(true).create_new(true).open(&target) {
        Ok(file) => file,
        Err(e) => {
            error!("failed to open {}: {}", target.display(), e);
            req.override_code = Some(HTTP_INTERNAL_SERVER_ERROR);
            req.status = ClientStatus::Invalid;
            return false;
        }
    };

    if let Err(e) = file.write_all(&part.data) {
        error!("failed to write {}: {}", target.display(), e);
        req.override_code = Some(HTTP_INTERNAL_SERVER_ERROR);
        req.status = ClientStatus::Invalid;
        return false;
    }

    debug!("saved upload {}", target.display());
    req.upload_file = Some(file);
    true
}
