use crate::types::header::{find_header, Header};

/// A request or response head. Which of `method`/`status` is set follows
/// from the direction it travels in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub method: Option<String>,
    pub path: Option<String>,
    pub status: Option<u16>,
    pub headers: Vec<Header>,
}

impl Message {
    pub fn request(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: Some(method.into()),
            path: Some(path.into()),
            status: None,
            headers: Vec::new(),
        }
    }

    pub fn response(status: u16) -> Self {
        Self {
            method: None,
            path: None,
            status: Some(status),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }

    pub fn content_length(&self) -> Option<u64> {
        find_header(&self.headers, "content-length").and_then(|v| v.parse().ok())
    }

    /// Legacy-variant drain signal.
    pub fn wants_connection_close(&self) -> bool {
        find_header(&self.headers, "connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false)
    }
}
