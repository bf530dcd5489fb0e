//! Parsed HTTP request
//!
//! A `Request` is built by the connection protocol while parsing and is
//! immutable once handed to a handler as `Rc<Request>`. Derived views
//! (JSON body, query arguments, form fields, uploaded files, cookies) are
//! computed on first access and cached.

use std::cell::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use crate::error::HttpError;
use crate::form;
use crate::headers::Headers;

/// Media type assumed when a request does not declare one
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Connect,
    Trace,
}

impl Method {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"GET" => Some(Method::Get),
            b"POST" => Some(Method::Post),
            b"PUT" => Some(Method::Put),
            b"DELETE" => Some(Method::Delete),
            b"PATCH" => Some(Method::Patch),
            b"HEAD" => Some(Method::Head),
            b"OPTIONS" => Some(Method::Options),
            b"CONNECT" => Some(Method::Connect),
            b"TRACE" => Some(Method::Trace),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Connect => "CONNECT",
            Method::Trace => "TRACE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Multimap where `get` returns the first value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestParameters<T = String> {
    values: HashMap<String, Vec<T>>,
}

impl<T> Default for RequestParameters<T> {
    fn default() -> Self {
        Self { values: HashMap::new() }
    }
}

impl<T> RequestParameters<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: T) {
        self.values.entry(name.into()).or_default().push(value);
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.values.get(name).and_then(|v| v.first())
    }

    pub fn get_list(&self, name: &str) -> Option<&[T]> {
        self.values.get(name).map(Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[T])> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

/// Uploaded file from a multipart form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub content_type: Option<String>,
    pub name: Option<String>,
    pub body: Vec<u8>,
}

struct ParsedForm {
    fields: RequestParameters,
    files: RequestParameters<File>,
}

pub struct Request {
    method: Method,
    path: String,
    query_string: Option<String>,
    version: String,
    headers: Headers,
    body: Vec<u8>,
    remote_addr: Option<SocketAddr>,

    parsed_json: OnceCell<serde_json::Value>,
    parsed_args: OnceCell<RequestParameters>,
    parsed_form: OnceCell<ParsedForm>,
    parsed_cookies: OnceCell<HashMap<String, String>>,
}

impl Request {
    /// Build a request from the raw request target
    ///
    /// The target is split into path and query string; a fragment, if a
    /// client sent one, is dropped.
    pub fn new(method: Method, target: &[u8], version: impl Into<String>, headers: Headers) -> Self {
        let target = String::from_utf8_lossy(target);
        let target = target.split('#').next().unwrap_or_default();
        let (path, query_string) = match target.split_once('?') {
            Some((p, q)) => (p.to_string(), (!q.is_empty()).then(|| q.to_string())),
            None => (target.to_string(), None),
        };
        Self {
            method,
            path,
            query_string,
            version: version.into(),
            headers,
            body: Vec::new(),
            remote_addr: None,
            parsed_json: OnceCell::new(),
            parsed_args: OnceCell::new(),
            parsed_form: OnceCell::new(),
            parsed_cookies: OnceCell::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub(crate) fn extend_body(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Request path, without the query string
    pub fn url(&self) -> &str {
        &self.path
    }

    pub fn query_string(&self) -> Option<&str> {
        self.query_string.as_deref()
    }

    /// e.g. `"1.1"`
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Body parsed as JSON
    ///
    /// A body that fails to parse is an `InvalidUsage` error; the failure is
    /// not cached.
    pub fn json(&self) -> Result<&serde_json::Value, HttpError> {
        if let Some(v) = self.parsed_json.get() {
            return Ok(v);
        }
        let value: serde_json::Value = serde_json::from_slice(&self.body)
            .map_err(|_| HttpError::InvalidUsage("Failed when parsing body as json".to_string()))?;
        Ok(self.parsed_json.get_or_init(|| value))
    }

    /// Query string arguments
    pub fn args(&self) -> &RequestParameters {
        self.parsed_args.get_or_init(|| match &self.query_string {
            Some(qs) => form::parse_query(qs),
            None => RequestParameters::new(),
        })
    }

    /// Fields of a urlencoded or multipart body
    ///
    /// A body that cannot be decoded yields no fields.
    pub fn form(&self) -> &RequestParameters {
        &self.parsed_form().fields
    }

    /// Files of a multipart body
    pub fn files(&self) -> &RequestParameters<File> {
        &self.parsed_form().files
    }

    pub fn cookies(&self) -> &HashMap<String, String> {
        self.parsed_cookies.get_or_init(|| match self.headers.get("Cookie") {
            Some(header) => form::parse_cookies(header),
            None => HashMap::new(),
        })
    }

    fn parsed_form(&self) -> &ParsedForm {
        self.parsed_form.get_or_init(|| {
            let content_type = self.headers.get("Content-Type").unwrap_or(DEFAULT_CONTENT_TYPE);
            let (content_type, params) = form::parse_header_value(content_type);
            let mut parsed = ParsedForm {
                fields: RequestParameters::new(),
                files: RequestParameters::new(),
            };

            match content_type.as_str() {
                "application/x-www-form-urlencoded" => {
                    parsed.fields = form::parse_query(&String::from_utf8_lossy(&self.body));
                }
                "multipart/form-data" => {
                    let result = params
                        .get("boundary")
                        .ok_or(form::MalformedMultipart)
                        .and_then(|b| form::parse_multipart(&self.body, b));
                    match result {
                        Ok((fields, files)) => {
                            parsed.fields = fields;
                            parsed.files = files;
                        }
                        Err(_) => {
                            tracing::warn!(path = %self.path, "failed when parsing multipart form");
                        }
                    }
                }
                _ => {}
            }
            parsed
        })
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.path)
            .field("query_string", &self.query_string)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(target: &str, headers: &[(&str, &str)], body: &[u8]) -> Request {
        let headers = headers.iter().map(|(n, v)| (*n, *v)).collect();
        Request::new(Method::Post, target.as_bytes(), "1.1", headers).with_body(body)
    }

    #[test]
    fn test_path_and_query() {
        let r = request("/search?q=rust+lang&page=2#top", &[], b"");
        assert_eq!(r.url(), "/search");
        assert_eq!(r.query_string(), Some("q=rust+lang&page=2"));
        assert_eq!(r.args().get("q").map(String::as_str), Some("rust lang"));
        assert_eq!(r.args().get("page").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_no_query() {
        let r = request("/plain", &[], b"");
        assert_eq!(r.query_string(), None);
        assert!(r.args().is_empty());
    }

    #[test]
    fn test_json_body() {
        let r = request("/", &[], br#"{"a": [1, 2]}"#);
        assert_eq!(r.json().unwrap()["a"][1], 2);
        // Cached value is returned again
        assert!(std::ptr::eq(r.json().unwrap(), r.json().unwrap()));
    }

    #[test]
    fn test_json_failure() {
        let r = request("/", &[], b"{not json");
        assert_eq!(
            r.json().unwrap_err(),
            HttpError::InvalidUsage("Failed when parsing body as json".into())
        );
    }

    #[test]
    fn test_urlencoded_form() {
        let r = request(
            "/",
            &[("Content-Type", "application/x-www-form-urlencoded")],
            b"name=J%C3%B6rg&tag=a&tag=b",
        );
        assert_eq!(r.form().get("name").map(String::as_str), Some("Jörg"));
        assert_eq!(r.form().get_list("tag").map(<[String]>::len), Some(2));
        assert!(r.files().is_empty());
    }

    #[test]
    fn test_multipart_without_boundary_is_empty() {
        let r = request("/", &[("Content-Type", "multipart/form-data")], b"--x\r\n");
        assert!(r.form().is_empty());
        assert!(r.files().is_empty());
    }

    #[test]
    fn test_cookies() {
        let r = request("/", &[("cookie", "a=1; b=2")], b"");
        assert_eq!(r.cookies().get("b").map(String::as_str), Some("2"));
    }
}
