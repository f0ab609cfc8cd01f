//! Minimal HTTP/1.1 request reader and response writer.
//!
//! Only what controllers send is supported: a request line, headers and a
//! `Content-Length` delimited body. Responses always carry `Content-Length`.

use std::collections::HashMap;
use std::fmt::Write as _;

use hap_core::error::{Error, ParseError, TransportError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Media type of pair-setup, pair-verify and pairings bodies.
pub const CONTENT_TYPE_TLV8: &str = "application/pairing+tlv8";
/// Media type of accessory and characteristic bodies.
pub const CONTENT_TYPE_HAP_JSON: &str = "application/hap+json";

/// Protocol token of a normal response.
pub const HTTP_PROTOCOL: &str = "HTTP/1.1";
/// Protocol token replacing `HTTP/1.1` in unsolicited event notifications.
pub const EVENT_PROTOCOL: &str = "EVENT/1.0";

const MAX_HEADER_BYTES: usize = 8 * 1024;
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Request methods the accessory routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
        }
    }

    fn parse(s: &str) -> Result<Self, ParseError> {
        match s {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            other => Err(ParseError::InvalidValue(format!("method {}", other))),
        }
    }
}

/// Parsed request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (target.to_string(), None),
        };
        Self {
            method,
            path,
            query,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Header value (case-insensitive).
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Value of one `key=value` query parameter.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.as_deref()?.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    /// Serialize to wire format, as a controller would send it.
    pub fn serialize(&self) -> Vec<u8> {
        let mut head = String::new();
        let target = match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        };
        let _ = write!(head, "{} {} {}\r\n", self.method.as_str(), target, HTTP_PROTOCOL);

        let mut sorted: Vec<_> = self.headers.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in sorted {
            if !key.eq_ignore_ascii_case("Content-Length") {
                let _ = write!(head, "{}: {}\r\n", key, value);
            }
        }
        let _ = write!(head, "Content-Length: {}\r\n\r\n", self.body.len());

        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

/// Read one request.
///
/// Returns `Ok(None)` when the peer closed the stream between requests.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<HttpRequest>, Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::new();
    loop {
        let before = head.len();
        // One byte past the limit is enough to know the head is too large.
        let budget = (MAX_HEADER_BYTES + 1 - before) as u64;
        let n = (&mut *reader)
            .take(budget)
            .read_until(b'\n', &mut head)
            .await?;
        if n == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(TransportError::ConnectionClosed.into());
        }
        if head.len() > MAX_HEADER_BYTES {
            return Err(TransportError::RequestTooLarge(head.len()).into());
        }
        let line = &head[before..];
        if line == b"\r\n" || line == b"\n" {
            // Tolerate blank lines before the request line.
            if before == 0 {
                head.clear();
                continue;
            }
            break;
        }
    }

    let head = std::str::from_utf8(&head)
        .map_err(|_| ParseError::InvalidFormat("request head is not UTF-8".to_string()))?;
    let mut lines = head.lines();

    let request_line = lines.next().ok_or(ParseError::MissingField("request line"))?;
    let mut parts = request_line.split_whitespace();
    let method = Method::parse(parts.next().ok_or(ParseError::MissingField("method"))?)?;
    let target = parts.next().ok_or(ParseError::MissingField("request target"))?;
    let version = parts.next().ok_or(ParseError::MissingField("version"))?;
    if !version.starts_with("HTTP/") {
        return Err(ParseError::InvalidValue(format!("version {}", version)).into());
    }

    let mut request = HttpRequest::new(method, target);
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            request
                .headers
                .insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    let content_length = match request.header_value("Content-Length") {
        Some(v) => v
            .parse::<usize>()
            .map_err(|_| ParseError::InvalidValue(format!("Content-Length {}", v)))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(TransportError::RequestTooLarge(content_length).into());
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;
    request.body = body;
    Ok(Some(request))
}

/// Response to serialize back to the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            status_text: reason_phrase(status_code).to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// `200 OK` with a TLV8 body.
    pub fn tlv8(body: Vec<u8>) -> Self {
        Self::new(200).with_body(CONTENT_TYPE_TLV8, body)
    }

    /// JSON response with the HAP media type.
    pub fn json(status_code: u16, value: &serde_json::Value) -> Self {
        Self::new(status_code).with_body(CONTENT_TYPE_HAP_JSON, value.to_string().into_bytes())
    }

    /// `204 No Content`.
    pub fn no_content() -> Self {
        Self::new(204)
    }

    pub fn with_body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.headers
            .push(("Content-Type".to_string(), content_type.to_string()));
        self.body = body;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Bytes of a normal response.
    pub fn serialize(&self) -> Vec<u8> {
        self.serialize_with(HTTP_PROTOCOL)
    }

    /// Same layout as [`serialize`](Self::serialize) with the `EVENT/1.0` token.
    pub fn serialize_event(&self) -> Vec<u8> {
        self.serialize_with(EVENT_PROTOCOL)
    }

    fn serialize_with(&self, protocol: &str) -> Vec<u8> {
        let mut head = String::new();
        let _ = write!(
            head,
            "{} {} {}\r\n",
            protocol, self.status_code, self.status_text
        );
        for (key, value) in &self.headers {
            let _ = write!(head, "{}: {}\r\n", key, value);
        }
        let _ = write!(head, "Content-Length: {}\r\n\r\n", self.body.len());

        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }

    /// Parse one complete response or event from `data`.
    ///
    /// Returns the response, whether it was an event, and the bytes consumed;
    /// `None` if `data` does not yet hold a complete message.
    pub fn parse(data: &[u8]) -> Result<Option<(Self, bool, usize)>, ParseError> {
        let Some(header_end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
            return Ok(None);
        };
        let head = std::str::from_utf8(&data[..header_end])
            .map_err(|_| ParseError::InvalidFormat("response head is not UTF-8".to_string()))?;
        let mut lines = head.lines();

        let status_line = lines.next().ok_or(ParseError::MissingField("status line"))?;
        let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
        if parts.len() < 2 {
            return Err(ParseError::InvalidFormat(format!(
                "malformed status line: {}",
                status_line
            )));
        }
        let is_event = match parts[0] {
            HTTP_PROTOCOL => false,
            EVENT_PROTOCOL => true,
            other => {
                return Err(ParseError::InvalidValue(format!("protocol {}", other)));
            }
        };
        let status_code = parts[1]
            .parse()
            .map_err(|_| ParseError::InvalidValue(format!("status code {}", parts[1])))?;
        let status_text = parts.get(2).unwrap_or(&"").to_string();

        let mut headers = Vec::new();
        for line in lines {
            if let Some((key, value)) = line.split_once(':') {
                headers.push((key.trim().to_string(), value.trim().to_string()));
            }
        }

        let mut response = Self {
            status_code,
            status_text,
            headers,
            body: Vec::new(),
        };
        let content_length = response
            .header("Content-Length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);

        let body_start = header_end + 4;
        if data.len() < body_start + content_length {
            return Ok(None);
        }
        response.body = data[body_start..body_start + content_length].to_vec();
        // Content-Length is re-added on serialize.
        response
            .headers
            .retain(|(k, _)| !k.eq_ignore_ascii_case("Content-Length"));
        Ok(Some((response, is_event, body_start + content_length)))
    }
}

fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        204 => "No Content",
        207 => "Multi-Status",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        422 => "Unprocessable Entity",
        470 => "Connection Authorization Required",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
