use webserv::pages::PageError;
use webserv::utils::*;

#[test]
fn imf_fixdate_round_trips() {
    let date = imf_fixdate();
    assert!(date.ends_with(" GMT"));
    assert!(is_valid_imf_fixdate(&date));
    assert!(is_valid_imf_fixdate("Sun, 06 Nov 1994 08:49:37 GMT"));
    assert!(!is_valid_imf_fixdate("half past nine"));
}

#[test]
fn trim_removes_spaces_and_tabs_only() {
    assert_eq!(trim_whitespace("  hi\t "), "hi");
    assert_eq!(trim_whitespace("\t\t"), "");
    assert_eq!(trim_whitespace("a b"), "a b");
    assert_eq!(trim_whitespace("\r\n"), "\r\n");
}

#[test]
fn split_drops_empty_segments() {
    assert_eq!(split_str("a,,b,", ","), vec!["a", "b"]);
    assert_eq!(split_str("one two", " "), vec!["one", "two"]);
    assert!(split_str("", ",").is_empty());
}

#[test]
fn ipv4_validation() {
    assert!(is_valid_ipv4("127.0.0.1"));
    assert!(is_valid_ipv4("0.0.0.0"));
    assert!(is_valid_ipv4("255.255.255.255"));
    assert!(!is_valid_ipv4("256.0.0.1"));
    assert!(!is_valid_ipv4("1.2.3"));
    assert!(!is_valid_ipv4("1.2.3.4.5"));
    assert!(!is_valid_ipv4("a.b.c.d"));
    assert!(!is_valid_ipv4("1..2.3"));
}

#[test]
fn port_validation() {
    assert!(is_valid_port("8080"));
    assert!(is_valid_port("1"));
    assert!(!is_valid_port("65536"));
    assert!(!is_valid_port("-1"));
    assert!(!is_valid_port("http"));
    assert!(!is_valid_port(""));
}

#[test]
fn number_literal_predicates() {
    assert!(is_unsigned_int_literal("42"));
    assert!(!is_unsigned_int_literal("4.2"));
    assert!(!is_unsigned_int_literal("-4"));
    assert!(!is_unsigned_int_literal(""));

    assert!(is_positive_double_literal("4.2"));
    assert!(is_positive_double_literal("42"));
    assert!(!is_positive_double_literal(".5"));
    assert!(!is_positive_double_literal("5."));
    assert!(!is_positive_double_literal("1.2.3"));
    assert!(!is_positive_double_literal("-1.0"));
}

#[test]
fn uri_character_rules() {
    assert!(uri_format_ok("/index.html"));
    assert!(uri_format_ok("/a/b?c=d&e=f"));
    assert!(!uri_format_ok("/a<b"));
    assert!(!uri_format_ok("/a\"b"));
    assert!(!uri_format_ok("/a\\b"));
    assert!(!uri_format_ok("/a\x7fb"));
    assert!(!uri_format_ok("/a\nb"));
}

#[test]
fn uri_root_escape_detection() {
    assert!(!uri_target_above_root("/a/b/c"));
    assert!(!uri_target_above_root("/a/../b"));
    assert!(uri_target_above_root("/../etc/passwd"));
    assert!(uri_target_above_root("/a/../../b"));
    assert!(!uri_target_above_root("/"));
    assert!(!uri_target_above_root("/./a"));
}

#[test]
fn value_extraction_from_part_headers() {
    let headers = "Content-Disposition: form-data; name=\"file\"; filename=\"photo.png\"\r\nContent-Type: image/png";

    assert_eq!(
        extract_quoted_value(headers, "name=").as_deref(),
        Some("file")
    );
    assert_eq!(
        extract_quoted_value(headers, "filename=").as_deref(),
        Some("photo.png")
    );
    assert_eq!(
        extract_value(headers, "Content-Type: ").as_deref(),
        Some("image/png")
    );
    assert_eq!(extract_quoted_value(headers, "missing="), None);
}

#[test]
fn filename_sanitization() {
    assert_eq!(sanitize_filename("a.txt").as_deref(), Some("a.txt"));
    assert_eq!(sanitize_filename("dir/a.txt").as_deref(), Some("a.txt"));
    assert_eq!(sanitize_filename("../../a.txt").as_deref(), Some("a.txt"));
    assert_eq!(sanitize_filename(""), None);
}

#[test]
fn bounded_file_read_enforces_the_root() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("inside.txt"), b"content").unwrap();
    let root = dir.path().to_string_lossy();

    let content = get_file_as_bytes("inside.txt", &root).unwrap();
    assert_eq!(content, b"content");

    let err = get_file_as_bytes("/etc/hostname", &root).unwrap_err();
    assert_eq!(err, PageError::NotFound);

    let err = get_file_as_bytes("missing.txt", &root).unwrap_err();
    assert_eq!(err, PageError::NotFound);
}

#[test]
fn subsequence_search() {
    assert_eq!(find_subsequence(b"abcdef", b"cd", 0), Some(2));
    assert_eq!(find_subsequence(b"abcdef", b"cd", 3), None);
    assert_eq!(find_subsequence(b"abcabc", b"abc", 1), Some(3));
    assert_eq!(find_subsequence(b"abc", b"", 0), None);
}
