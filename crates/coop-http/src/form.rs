//! Decoding helpers for query strings, form bodies and cookies

use std::collections::HashMap;

use crate::request::{File, RequestParameters};

/// Decode `%XX` escapes, and `+` as space when `plus_as_space` is set
///
/// Malformed escapes are kept literally. Invalid UTF-8 is replaced.
pub(crate) fn percent_decode(s: &str, plus_as_space: bool) -> String {
    if !s.contains('%') && !(plus_as_space && s.contains('+')) {
        return s.to_string();
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => match (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b'+' if plus_as_space => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Parse `a=1&b=2;a=3` into a multimap
///
/// Pairs without `=` and pairs with an empty value are dropped.
pub(crate) fn parse_query(qs: &str) -> RequestParameters {
    let mut params = RequestParameters::new();
    for pair in qs.split(|c| c == '&' || c == ';') {
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        params.push(percent_decode(name, true), percent_decode(value, true));
    }
    params
}

/// Split `text/html; charset="utf-8"` into the value and its parameters
///
/// Parameter names are lowercased and quotes around values removed.
pub(crate) fn parse_header_value(value: &str) -> (String, HashMap<String, String>) {
    let mut parts = value.split(';');
    let main = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
    let params = parts
        .filter_map(|p| {
            let (k, v) = p.split_once('=')?;
            let v = v.trim();
            let v = v
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(v);
            Some((k.trim().to_ascii_lowercase(), v.to_string()))
        })
        .collect();
    (main, params)
}

/// `a=1; b="two"` into name/value pairs, skipping malformed entries
pub(crate) fn parse_cookies(header: &str) -> HashMap<String, String> {
    header
        .split(';')
        .filter_map(|item| {
            let (name, value) = item.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

#[derive(Debug)]
pub(crate) struct MalformedMultipart;

/// Split a `multipart/form-data` body into plain fields and files
///
/// A part is a file when it has a filename or its own content type.
pub(crate) fn parse_multipart(
    body: &[u8],
    boundary: &str,
) -> Result<(RequestParameters, RequestParameters<File>), MalformedMultipart> {
    let mut fields = RequestParameters::new();
    let mut files = RequestParameters::new();

    let delimiter = [b"--", boundary.as_bytes()].concat();
    let mut rest = match find(body, &delimiter) {
        Some(at) => &body[at + delimiter.len()..],
        None => return Err(MalformedMultipart),
    };

    loop {
        if rest.starts_with(b"--") {
            break;
        }
        let part_start = rest.strip_prefix(b"\r\n").ok_or(MalformedMultipart)?;
        let end = find(part_start, &delimiter).ok_or(MalformedMultipart)?;
        let part = &part_start[..end];
        rest = &part_start[end + delimiter.len()..];

        let header_end = find(part, b"\r\n\r\n").ok_or(MalformedMultipart)?;
        let head = std::str::from_utf8(&part[..header_end]).map_err(|_| MalformedMultipart)?;
        let data = &part[header_end + 4..];
        let data = data.strip_suffix(b"\r\n").unwrap_or(data);

        let mut field_name = None;
        let mut file_name = None;
        let mut file_type = None;
        for line in head.split("\r\n") {
            let (name, value) = line.split_once(':').ok_or(MalformedMultipart)?;
            let (value, params) = parse_header_value(value);
            if name.trim().eq_ignore_ascii_case("content-disposition") {
                field_name = params.get("name").cloned();
                file_name = params.get("filename").cloned();
            } else if name.trim().eq_ignore_ascii_case("content-type") {
                file_type = Some(value);
            }
        }

        let field_name = field_name.unwrap_or_default();
        if file_name.is_some() || file_type.is_some() {
            files.push(
                field_name,
                File {
                    content_type: file_type,
                    name: file_name,
                    body: data.to_vec(),
                },
            );
        } else {
            fields.push(field_name, String::from_utf8_lossy(data).into_owned());
        }
    }
    Ok((fields, files))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("a%20b", false), "a b");
        assert_eq!(percent_decode("a+b", true), "a b");
        assert_eq!(percent_decode("a+b", false), "a+b");
        assert_eq!(percent_decode("100%", false), "100%");
        assert_eq!(percent_decode("%zz%41", false), "%zzA");
        assert_eq!(percent_decode("caf%C3%A9", false), "café");
    }

    #[test]
    fn test_parse_query() {
        let q = parse_query("a=1&b=two+words&a=3;empty=&flag");
        assert_eq!(q.get("a"), Some(&"1".to_string()));
        assert_eq!(q.get_list("a").unwrap(), &["1".to_string(), "3".to_string()]);
        assert_eq!(q.get("b"), Some(&"two words".to_string()));
        assert!(q.get("empty").is_none());
        assert!(q.get("flag").is_none());
    }

    #[test]
    fn test_parse_header_value() {
        let (v, p) = parse_header_value("multipart/form-data; Boundary=\"xyz\"");
        assert_eq!(v, "multipart/form-data");
        assert_eq!(p.get("boundary").map(String::as_str), Some("xyz"));
    }

    #[test]
    fn test_parse_cookies() {
        let c = parse_cookies("session=abc; theme=\"dark\"; junk");
        assert_eq!(c.get("session").map(String::as_str), Some("abc"));
        assert_eq!(c.get("theme").map(String::as_str), Some("dark"));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_parse_multipart() {
        let body = b"--XX\r\n\
Content-Disposition: form-data; name=\"title\"\r\n\r\n\
hello\r\n\
--XX\r\n\
Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
Content-Type: text/plain\r\n\r\n\
file body\r\n\
--XX--\r\n";
        let (fields, files) = parse_multipart(body, "XX").unwrap();
        assert_eq!(fields.get("title"), Some(&"hello".to_string()));
        let f = files.get("upload").unwrap();
        assert_eq!(f.name.as_deref(), Some("a.txt"));
        assert_eq!(f.content_type.as_deref(), Some("text/plain"));
        assert_eq!(f.body, b"file body");
    }

    #[test]
    fn test_parse_multipart_malformed() {
        assert!(parse_multipart(b"no boundary here", "XX").is_err());
    }
}
