//! HTTP response and its wire serialization
//!
//! ```text
//!   HTTP/<version> <status> <reason>\r\n
//!   Content-Type: <type>\r\n
//!   Content-Length: <n>\r\n
//!   Connection: keep-alive|close\r\n
//!   [Keep-Alive: timeout=<secs>\r\n]
//!   [<name>: <value>\r\n]*
//!   \r\n
//!   <body>
//! ```

use std::borrow::Cow;
use std::io::Write;
use std::path::Path;

use crate::error::HttpError;
use crate::headers::Headers;
use crate::status::reason_phrase;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: 200,
            content_type: "text/plain".to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }
}

impl Response {
    pub fn new(status: u16, content_type: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: content_type.into(),
            headers: Headers::new(),
            body: body.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Serialize for the wire
    ///
    /// The `Keep-Alive` header is only written for a kept-alive connection
    /// with a non-zero timeout. CR and LF are dropped from the content type
    /// and from header names and values, so a field can never start a new line.
    pub fn output(&self, version: &str, keep_alive: bool, keep_alive_timeout: Option<u64>) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        // Writes into a Vec cannot fail
        let _ = write!(
            out,
            "HTTP/{} {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: {}\r\n",
            version,
            self.status,
            reason_phrase(self.status),
            single_line(&self.content_type),
            self.body.len(),
            if keep_alive { "keep-alive" } else { "close" },
        );
        if let Some(timeout) = keep_alive_timeout.filter(|t| keep_alive && *t > 0) {
            let _ = write!(out, "Keep-Alive: timeout={}\r\n", timeout);
        }
        for (name, value) in self.headers.iter() {
            let _ = write!(out, "{}: {}\r\n", single_line(name), single_line(value));
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

fn single_line(field: &str) -> Cow<'_, str> {
    if field.contains(['\r', '\n']) {
        Cow::Owned(field.chars().filter(|c| !matches!(c, '\r' | '\n')).collect())
    } else {
        Cow::Borrowed(field)
    }
}

pub fn text(body: impl Into<String>) -> Response {
    Response::new(200, "text/plain; charset=utf-8", body.into())
}

pub fn html(body: impl Into<String>) -> Response {
    Response::new(200, "text/html; charset=utf-8", body.into())
}

pub fn json(body: &serde_json::Value) -> Response {
    Response::new(200, "application/json", body.to_string())
}

pub fn raw(body: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Response {
    Response::new(200, content_type, body)
}

/// Serve a file, guessing its content type from the extension
///
/// A missing file is reported as `FileNotFound` carrying the path.
pub fn file(location: impl AsRef<Path>, mime_type: Option<&str>) -> Result<Response, HttpError> {
    let location = location.as_ref();
    let body = std::fs::read(location).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => HttpError::FileNotFound {
            message: "File not found".to_string(),
            path: location.display().to_string(),
            relative_url: location
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        },
        _ => HttpError::ServerError(format!("Error reading file: {}", e)),
    })?;
    let content_type = mime_type.unwrap_or_else(|| guess_type(location));
    Ok(Response::new(200, content_type, body))
}

/// Content type for a file name, `text/plain` when unknown
pub fn guess_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "wasm" => "application/wasm",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "text/plain",
    }
}
