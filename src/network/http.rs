//! Minimal HTTP/1.x message head parser.
//!
//! Used by the HTTP `CONNECT` proxy and the WebSocket upgrade handshake.
//! Only the start line and headers are parsed; bodies are never read.

use crate::error::{Result, TransportError};

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Returns the offset just past the blank line that ends a message head,
/// or `None` if the head is not complete yet.
pub fn header_end(data: &[u8]) -> Option<usize> {
    data.windows(HEADER_END.len())
        .position(|window| window == HEADER_END)
        .map(|position| position + HEADER_END.len())
}

/// First line of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request {
        method: String,
        uri: String,
        version: (u8, u8),
    },
    Response {
        version: (u8, u8),
        status: u16,
        reason: String,
    },
}

/// Parsed message head. Header names keep their original case; lookups
/// are case-insensitive. Repeated headers are folded into one value
/// separated by `", "`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpMessage {
    pub start: StartLine,
    headers: Vec<(String, String)>,
}

impl HttpMessage {
    /// Parses a complete head (everything up to and including the blank
    /// line).
    pub fn parse(head: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(head)
            .map_err(|_| TransportError::protocol("HTTP message head is not valid UTF-8"))?;
        let mut lines = text.split("\r\n");

        let first = lines
            .next()
            .filter(|line| !line.is_empty())
            .ok_or_else(|| TransportError::protocol("empty HTTP message"))?;
        let start = parse_start_line(first)?;

        let mut headers: Vec<(String, String)> = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }

            if line.starts_with(' ') || line.starts_with('\t') {
                let Some((_, value)) = headers.last_mut() else {
                    return Err(TransportError::protocol(
                        "HTTP continuation line without a header",
                    ));
                };
                value.push(' ');
                value.push_str(line.trim());
                continue;
            }

            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| TransportError::protocol(format!("malformed header `{line}'")))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(TransportError::protocol("empty HTTP header name"));
            }
            let value = value.trim();

            match headers
                .iter_mut()
                .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            {
                Some((_, existing)) => {
                    existing.push_str(", ");
                    existing.push_str(value);
                }
                None => headers.push((name.to_string(), value.to_string())),
            }
        }

        Ok(Self { start, headers })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// True if the comma separated header `name` contains `token`,
    /// compared case-insensitively.
    pub fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.header(name).is_some_and(|value| {
            value
                .split(',')
                .any(|item| item.trim().eq_ignore_ascii_case(token))
        })
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }
}

fn parse_start_line(line: &str) -> Result<StartLine> {
    let mut parts = line.splitn(3, ' ');
    let first = parts.next().unwrap_or_default();

    if first.starts_with("HTTP/") {
        let version = parse_version(first)?;
        let status = parts
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .filter(|code| (100..1000).contains(code))
            .ok_or_else(|| TransportError::protocol(format!("invalid HTTP status line `{line}'")))?;
        let reason = parts.next().unwrap_or_default().to_string();
        return Ok(StartLine::Response {
            version,
            status,
            reason,
        });
    }

    let (Some(uri), Some(version)) = (parts.next(), parts.next()) else {
        return Err(TransportError::protocol(format!(
            "invalid HTTP request line `{line}'"
        )));
    };
    if first.is_empty() || uri.is_empty() {
        return Err(TransportError::protocol(format!(
            "invalid HTTP request line `{line}'"
        )));
    }
    Ok(StartLine::Request {
        method: first.to_string(),
        uri: uri.to_string(),
        version: parse_version(version)?,
    })
}

fn parse_version(text: &str) -> Result<(u8, u8)> {
    text.strip_prefix("HTTP/")
        .and_then(|version| version.split_once('.'))
        .and_then(|(major, minor)| Some((major.parse().ok()?, minor.parse().ok()?)))
        .ok_or_else(|| TransportError::protocol(format!("invalid HTTP version `{text}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_end_is_found_only_when_complete() {
        assert_eq!(header_end(b"HTTP/1.1 200 OK\r\n"), None);
        assert_eq!(header_end(b"HTTP/1.1 200 OK\r\n\r\nbody"), Some(19));
    }

    #[test]
    fn parses_upgrade_request() {
        let message = HttpMessage::parse(
            b"GET /chat HTTP/1.1\r\nHost: server\r\nUpgrade: websocket\r\nConnection: keep-alive, Upgrade\r\n\r\n",
        )
        .unwrap();
        assert_eq!(
            message.start,
            StartLine::Request {
                method: "GET".to_string(),
                uri: "/chat".to_string(),
                version: (1, 1),
            }
        );
        assert_eq!(message.header("host"), Some("server"));
        assert!(message.header_has_token("connection", "upgrade"));
    }

    #[test]
    fn folds_repeated_headers_and_continuations() {
        let message = HttpMessage::parse(
            b"HTTP/1.0 200 Connection established\r\nVia: a\r\nvia: b\r\nX-Long: one\r\n two\r\n\r\n",
        )
        .unwrap();
        assert_eq!(message.status(), Some(200));
        assert_eq!(message.header("Via"), Some("a, b"));
        assert_eq!(message.header("x-long"), Some("one two"));
    }

    #[test]
    fn rejects_garbage_start_line() {
        assert!(HttpMessage::parse(b"HTTP/1.1 abc\r\n\r\n").is_err());
        assert!(HttpMessage::parse(b"GET\r\n\r\n").is_err());
    }
}
