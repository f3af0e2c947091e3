use webserv::config::{AppConfig, ServerEntry};
use webserv::{PageCache, Server};

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::thread;
use std::time::Duration;

fn boot_server(port: u16, root: &Path, upload_dir: Option<&Path>) {
    let mut routes = BTreeMap::new();
    routes.insert("/".to_string(), root.to_string_lossy().into_owned());
    routes.insert(
        "/cgi-bin".to_string(),
        root.join("cgi-bin").to_string_lossy().into_owned(),
    );

    let entry = ServerEntry {
        host: "127.0.0.1".to_string(),
        server_name: "localhost".to_string(),
        listen: vec![port],
        error_pages: HashMap::new(),
        routes,
        upload_dir: upload_dir.map(|p| p.to_string_lossy().into_owned()),
        client_max_body_size: Some(1_048_576),
    };
    let config = AppConfig {
        server: vec![entry],
    };

    thread::spawn(move || {
        let mut pages = PageCache::new();
        pages.load_defaults();
        let mut server = Server::new(&config, pages).expect("server boot failed");
        let _ = server.run();
    });

    // Give the listener time to bind.
    thread::sleep(Duration::from_millis(300));
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect failed");
    stream
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();
    stream
}

/// Reads one response: the header section, then exactly Content-Length body
/// bytes.
fn read_response(stream: &mut TcpStream) -> (u16, String, Vec<u8>) {
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut buf).expect("read failed");
        assert!(n > 0, "connection closed before a full response arrived");
        raw.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&raw[..header_end]).into_owned();
    let content_length: usize = head
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length: "))
        .map(|v| v.parse().unwrap())
        .unwrap_or(0);

    let mut body = raw[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf).expect("read failed");
        assert!(n > 0, "connection closed mid-body");
        body.extend_from_slice(&buf[..n]);
    }

    let code: u16 = head
        .split_whitespace()
        .nth(1)
        .and_then(|c| c.parse().ok())
        .expect("status line has a code");
    (code, head, body)
}

#[test]
fn get_serves_static_content_and_keeps_the_connection_alive() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("hello.html"), b"<p>hello</p>").unwrap();
    boot_server(18311, dir.path(), None);

    let mut stream = connect(18311);
    stream
        .write_all(b"GET /hello.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let (code, head, body) = read_response(&mut stream);
    assert_eq!(code, 200);
    assert!(head.contains("Connection: keep-alive"));
    assert!(head.contains("Content-Type: text/html"));
    assert!(head.contains("Server: Webserv/1.0"));
    assert_eq!(body, b"<p>hello</p>");

    // Same socket serves a second request.
    stream
        .write_all(b"GET /hello.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let (code, _, body) = read_response(&mut stream);
    assert_eq!(code, 200);
    assert_eq!(body, b"<p>hello</p>");
}

#[test]
fn missing_host_is_400_and_the_connection_closes() {
    let dir = tempfile::tempdir().unwrap();
    boot_server(18312, dir.path(), None);

    let mut stream = connect(18312);
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    let (code, head, _) = read_response(&mut stream);
    assert_eq!(code, 400);
    assert!(head.contains("Connection: close"));

    // The server closes after a non-2xx response.
    let mut rest = Vec::new();
    let eof = stream.read_to_end(&mut rest);
    assert!(matches!(eof, Ok(0)));
}

#[test]
fn unknown_target_gets_the_404_page() {
    let dir = tempfile::tempdir().unwrap();
    boot_server(18313, dir.path(), None);

    let mut stream = connect(18313);
    stream
        .write_all(b"GET /missing.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let (code, _, body) = read_response(&mut stream);
    assert_eq!(code, 404);
    assert!(String::from_utf8_lossy(&body).contains("404"));
}

#[test]
fn suspicious_header_drops_the_connection_without_a_response() {
    let dir = tempfile::tempdir().unwrap();
    boot_server(18314, dir.path(), None);

    let mut stream = connect(18314);
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nBadLine\r\n\r\n")
        .unwrap();

    let mut out = Vec::new();
    let result = stream.read_to_end(&mut out);
    assert!(matches!(result, Ok(0)), "expected a silent disconnect");
    assert!(out.is_empty());
}

#[test]
fn multipart_upload_lands_on_disk_with_201() {
    let dir = tempfile::tempdir().unwrap();
    let uploads = dir.path().join("uploads");
    boot_server(18315, dir.path(), Some(uploads.as_path()));

    let mut body = Vec::new();
    body.extend_from_slice(b"--B\r\n");
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"f\"; filename=\"up.txt\"\r\n\r\n",
    );
    body.extend_from_slice(b"uploaded bytes\r\n");
    body.extend_from_slice(b"--B--\r\n");

    let mut request = Vec::new();
    request.extend_from_slice(b"POST /upload HTTP/1.1\r\nHost: localhost\r\n");
    request.extend_from_slice(b"Content-Type: multipart/form-data; boundary=B\r\n");
    request.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    request.extend_from_slice(&body);

    let mut stream = connect(18315);
    stream.write_all(&request).unwrap();
    let (code, _, _) = read_response(&mut stream);
    assert_eq!(code, 201);

    let saved = std::fs::read(uploads.join("up.txt")).unwrap();
    assert_eq!(saved, b"uploaded bytes");
}

#[test]
fn cgi_script_runs_and_its_output_becomes_the_response() {
    let dir = tempfile::tempdir().unwrap();
    let cgi_dir = dir.path().join("cgi-bin");
    std::fs::create_dir_all(&cgi_dir).unwrap();
    let script = cgi_dir.join("hello.sh");
    std::fs::write(
        &script,
        "#!/bin/sh\nprintf 'Content-Type: text/plain\\r\\n\\r\\nhi'\n",
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    boot_server(18316, dir.path(), None);

    let mut stream = connect(18316);
    stream
        .write_all(b"GET /cgi-bin/hello.sh HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let (code, head, body) = read_response(&mut stream);
    assert_eq!(code, 200);
    assert!(head.contains("Content-Type: text/plain"));
    assert_eq!(body, b"hi");
}

#[test]
fn oversized_declared_body_is_413() {
    let dir = tempfile::tempdir().unwrap();
    boot_server(18317, dir.path(), None);

    let mut stream = connect(18317);
    stream
        .write_all(
            b"POST /cgi-bin/x HTTP/1.1\r\nHost: localhost\r\nContent-Length: 99999999\r\n\r\n",
        )
        .unwrap();
    let (code, head, _) = read_response(&mut stream);
    assert_eq!(code, 413);
    assert!(head.contains("Connection: close"));
}
