//! Request metadata and responses as the gateway core sees them, independent
//! of the HTTP server driving it.

use std::fs::File;

pub struct Request {
    pub method: String,
    /// Path part of the request target, still percent-encoded.
    pub path: String,
    /// Raw query string, never unescaped.
    pub query: Option<String>,
    /// e.g. `HTTP/1.1`
    pub protocol: String,
    pub server_name: String,
    pub server_port: u16,
    pub remote_addr: String,
    /// Header lines in arrival order; a name may repeat.
    pub headers: Vec<(String, String)>,
}

impl Request {
    pub fn new<M: Into<String>, P: Into<String>>(method: M, path: P) -> Request {
        Request {
            method: method.into(),
            path: path.into(),
            query: None,
            protocol: "HTTP/1.1".to_owned(),
            server_name: "localhost".to_owned(),
            server_port: 8000,
            remote_addr: "127.0.0.1".to_owned(),
            headers: Vec::new(),
        }
    }

    pub fn with_query<Q: Into<String>>(mut self, query: Q) -> Request {
        self.query = Some(query.into());
        self
    }

    pub fn with_header<N: Into<String>, V: Into<String>>(mut self, name: N, value: V) -> Request {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|&&(ref key, _)| key.eq_ignore_ascii_case(name))
            .map(|&(_, ref value)| value.as_str())
    }

    pub fn headers_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |&&(ref key, _)| key.eq_ignore_ascii_case(name))
            .map(|&(_, ref value)| value.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("Content-Length").and_then(|len| len.trim().parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.headers_all("Transfer-Encoding")
            .any(|value| value.to_ascii_lowercase().contains("chunked"))
    }
}

#[derive(Debug)]
pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    File(File),
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl Response {
    pub fn new(status: u16) -> Response {
        Response {
            status,
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|&&(ref key, _)| key.eq_ignore_ascii_case(name))
            .map(|&(_, ref value)| value.as_str())
    }
}
