//! RTSP/1.0 requests, responses and interleaved binary frames on one TCP stream.

use bytes::{Buf, Bytes, BytesMut};

use crate::core::RtspError;

const MAX_HEAD_LEN: usize = 64 * 1024;
const USER_AGENT: &str = concat!("sscs-node/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct Request {
    pub method: &'static str,
    pub uri: String,
    pub headers: Vec<(String, String)>,
}

impl Request {
    pub fn new(method: &'static str, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn encode(&self, cseq: u32) -> Vec<u8> {
        let mut out = format!("{} {} RTSP/1.0\r\nCSeq: {}\r\n", self.method, self.uri, cseq);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("User-Agent: ");
        out.push_str(USER_AGENT);
        out.push_str("\r\n\r\n");
        out.into_bytes()
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Response {
    /// First header with this name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn cseq(&self) -> Option<u32> {
        self.header("CSeq").and_then(|v| v.trim().parse().ok())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One unit read off the control connection.
#[derive(Debug, Clone)]
pub enum Incoming {
    Interleaved { channel: u8, payload: Bytes },
    Response(Response),
    /// Server-to-client request (e.g. `OPTIONS` pings); not answered.
    Request { method: String },
}

/// Splits one complete message off the front of `buf`, if there is one.
pub fn parse_incoming(buf: &mut BytesMut) -> Result<Option<Incoming>, RtspError> {
    if buf.is_empty() {
        return Ok(None);
    }

    if buf[0] == b'$' {
        if buf.len() < 4 {
            return Ok(None);
        }
        let channel = buf[1];
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if buf.len() < 4 + len {
            return Ok(None);
        }
        buf.advance(4);
        let payload = buf.split_to(len).freeze();
        return Ok(Some(Incoming::Interleaved { channel, payload }));
    }

    let head_end = match find_head_end(buf) {
        Some(pos) => pos,
        None if buf.len() > MAX_HEAD_LEN => {
            return Err(RtspError::MalformedResponse("header block too large".into()));
        }
        None => return Ok(None),
    };

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| RtspError::MalformedResponse("header is not utf-8".into()))?;
    let mut lines = head.split("\r\n");
    let start = lines.next().unwrap_or_default();
    let headers = parse_headers(lines)?;

    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| RtspError::MalformedResponse(format!("bad Content-Length '{}'", v)))
        })
        .transpose()?
        .unwrap_or(0);

    let total = head_end + 4 + content_length;
    if buf.len() < total {
        return Ok(None);
    }

    if let Some(rest) = start.strip_prefix("RTSP/1.0 ") {
        let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
        let status = code
            .parse::<u16>()
            .map_err(|_| RtspError::MalformedResponse(format!("bad status line '{}'", start)))?;
        let reason = reason.to_string();

        buf.advance(head_end + 4);
        let body = buf.split_to(content_length).freeze();
        return Ok(Some(Incoming::Response(Response {
            status,
            reason,
            headers,
            body,
        })));
    }

    let method = match start.split_whitespace().collect::<Vec<_>>().as_slice() {
        [method, _, version] if version.starts_with("RTSP/") => method.to_string(),
        _ => {
            return Err(RtspError::MalformedResponse(format!(
                "unexpected start line '{}'",
                start
            )));
        }
    };
    buf.advance(total);
    Ok(Some(Incoming::Request { method }))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_headers<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<Vec<(String, String)>, RtspError> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| RtspError::MalformedResponse(format!("bad header line '{}'", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

/// `Session: 12345678;timeout=60` → (`12345678`, Some(60)).
pub fn parse_session_header(value: &str) -> (String, Option<u64>) {
    let mut parts = value.split(';');
    let id = parts.next().unwrap_or_default().trim().to_string();
    let timeout = parts
        .filter_map(|p| p.trim().strip_prefix("timeout="))
        .find_map(|t| t.trim().parse().ok());
    (id, timeout)
}
