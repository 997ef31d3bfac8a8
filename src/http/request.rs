//! HTTP/1.1 request line, header, and gating logic (§4.J).

use std::collections::HashMap;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::util::path::url_unescape;

const MAX_REQUEST_LINE: usize = 1024;
const MAX_HEADERS: usize = 20;
const MAX_BODY: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Streaming,
    Interactive,
    Background,
}

#[derive(Debug, Default)]
pub struct Flags {
    pub range: bool,
    pub host_validated: bool,
    pub chunked: bool,
    pub time_seek: bool,
    pub play_speed: bool,
    pub real_time_info: bool,
    pub invalid: bool,
    pub caption: bool,
    pub transfer_mode: Option<TransferMode>,
}

#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub content_length: i64,
    pub flags: Flags,
    pub soap_action: Option<String>,
    pub callback: Option<String>,
    pub sid: Option<String>,
    pub nt: Option<String>,
    pub timeout_secs: Option<u64>,
    pub range_start: Option<u64>,
    pub range_end: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("request line too long")]
    LineTooLong,
    #[error("unsupported method")]
    UnsupportedMethod,
    #[error("malformed protocol suffix")]
    BadProtocol,
    #[error("body too large")]
    BodyTooLarge,
    #[error("connection closed")]
    Eof,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R, cap: usize) -> Result<String, RequestError> {
    let mut line = String::new();
    let mut byte = [0u8; 1];
    loop {
        use tokio::io::AsyncReadExt;
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            if line.is_empty() {
                return Err(RequestError::Eof);
            }
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        if byte[0] != b'\r' {
            line.push(byte[0] as char);
        }
        if line.len() > cap {
            return Err(RequestError::LineTooLong);
        }
    }
    Ok(line)
}

fn parse_method(s: &str) -> Option<Method> {
    match s {
        "GET" => Some(Method::Get),
        "HEAD" => Some(Method::Head),
        "POST" => Some(Method::Post),
        "SUBSCRIBE" => Some(Method::Subscribe),
        "UNSUBSCRIBE" => Some(Method::Unsubscribe),
        _ => None,
    }
}

fn strip_absolute_uri(url: &str) -> &str {
    if let Some(rest) = url.strip_prefix("http://") {
        if let Some(slash) = rest.find('/') {
            return &rest[slash..];
        }
        return "/";
    }
    url
}

fn parse_range(value: &str) -> Option<(Option<u64>, Option<u64>)> {
    let value = value.trim();
    let spec = value.strip_prefix("bytes=")?;
    if let Some(suffix) = spec.strip_prefix('-') {
        let n: u64 = suffix.parse().ok()?;
        return Some((None, Some(n)));
    }
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    if end.is_empty() {
        Some((Some(start), None))
    } else {
        Some((Some(start), Some(end.parse().ok()?)))
    }
}

/// Parses the request line and headers from a connection. `our_host`
/// is the `ip[:port]` the accepting interface should be addressed as,
/// used for the Host rebinding defence.
pub async fn parse_request<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    our_host: &str,
) -> Result<Request, RequestError> {
    let request_line = read_line(reader, MAX_REQUEST_LINE).await?;
    let mut parts = request_line.split(' ');
    let method_str = parts.next().unwrap_or("");
    let url = parts.next().unwrap_or("");
    let proto = parts.next().unwrap_or("");

    let method = parse_method(method_str).ok_or(RequestError::UnsupportedMethod)?;
    if proto != "HTTP/1.1" {
        return Err(RequestError::BadProtocol);
    }

    let path = url_unescape(strip_absolute_uri(url));

    let mut headers: HashMap<String, String> = HashMap::new();
    for _ in 0..MAX_HEADERS {
        let line = read_line(reader, MAX_REQUEST_LINE).await?;
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let mut flags = Flags::default();

    let content_length = headers
        .get("content-length")
        .and_then(|v| v.parse::<i64>().ok())
        .map(|n| n.max(0))
        .unwrap_or(0);

    let soap_action = headers.get("soapaction").map(|v| v.trim().trim_matches('"').to_string());

    let callback = headers.get("callback").map(|v| v.trim().trim_start_matches('<').trim_end_matches('>').to_string());

    let sid = headers.get("sid").cloned();
    let nt = headers.get("nt").cloned();

    let timeout_secs = headers.get("timeout").and_then(|v| v.strip_prefix("Second-").and_then(|n| n.parse().ok()));

    let (mut range_start, mut range_end) = (None, None);
    if let Some(range_val) = headers.get("range") {
        flags.range = true;
        if let Some((s, e)) = parse_range(range_val) {
            range_start = s;
            range_end = e;
        } else {
            flags.invalid = true;
        }
    }

    if headers.get("transfer-encoding").map(|v| v.eq_ignore_ascii_case("chunked")).unwrap_or(false) {
        flags.chunked = true;
    }

    if headers.contains_key("timeseekrange.dlna.org") {
        flags.time_seek = true;
    }
    if headers.contains_key("playspeed.dlna.org") {
        flags.play_speed = true;
    }
    if headers.contains_key("realtimeinfo.dlna.org") {
        flags.real_time_info = true;
    }
    if headers.contains_key("getcaptioninfo.sec") {
        flags.caption = true;
    }
    if let Some(mode) = headers.get("transfermode.dlna.org") {
        flags.transfer_mode = match mode.as_str() {
            "Streaming" => Some(TransferMode::Streaming),
            "Interactive" => Some(TransferMode::Interactive),
            "Background" => Some(TransferMode::Background),
            _ => None,
        };
    }
    if let Some(cf) = headers.get("getcontentfeatures.dlna.org") {
        if cf.trim() != "1" {
            flags.invalid = true;
        }
    }

    match headers.get("host") {
        Some(h) if h == our_host => flags.host_validated = true,
        _ => flags.host_validated = false,
    }

    if content_length as usize > MAX_BODY && !flags.chunked {
        return Err(RequestError::BodyTooLarge);
    }

    Ok(Request {
        method,
        path,
        content_length,
        flags,
        soap_action,
        callback,
        sid,
        nt,
        timeout_secs,
        range_start,
        range_end,
    })
}

/// Post-header gate checks (§4.J): returns the status code to send, if
/// the request must be rejected before dispatch.
pub fn gate_check(req: &Request) -> Option<u16> {
    if !req.flags.host_validated {
        return Some(400);
    }
    if req.flags.invalid {
        return Some(400);
    }
    if (req.flags.time_seek || req.flags.play_speed) && !req.flags.range {
        return Some(406);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn parse(raw: &str, host: &str) -> Result<Request, RequestError> {
        let mut reader = BufReader::new(raw.as_bytes());
        parse_request(&mut reader, host).await
    }

    #[tokio::test]
    async fn parses_simple_get() {
        let raw = "GET /rootDesc.xml HTTP/1.1\r\nHost: 192.168.1.2:2800\r\n\r\n";
        let req = parse(raw, "192.168.1.2:2800").await.unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/rootDesc.xml");
        assert!(req.flags.host_validated);
    }

    #[tokio::test]
    async fn rejects_unknown_method() {
        let raw = "TRACE / HTTP/1.1\r\n\r\n";
        assert!(matches!(parse(raw, "h").await, Err(RequestError::UnsupportedMethod)));
    }

    #[tokio::test]
    async fn rejects_wrong_protocol() {
        let raw = "GET / HTTP/1.0\r\n\r\n";
        assert!(matches!(parse(raw, "h").await, Err(RequestError::BadProtocol)));
    }

    #[tokio::test]
    async fn host_mismatch_fails_validation() {
        let raw = "GET /rootDesc.xml HTTP/1.1\r\nHost: evil.example.com\r\n\r\n";
        let req = parse(raw, "192.168.1.2:2800").await.unwrap();
        assert!(!req.flags.host_validated);
        assert_eq!(gate_check(&req), Some(400));
    }

    #[tokio::test]
    async fn range_header_parses_start_end() {
        let raw = "GET /MediaItems/clip.mp4 HTTP/1.1\r\nHost: h\r\nRange: bytes=1024-2047\r\n\r\n";
        let req = parse(raw, "h").await.unwrap();
        assert_eq!(req.range_start, Some(1024));
        assert_eq!(req.range_end, Some(2047));
    }

    #[tokio::test]
    async fn suffix_range_has_no_start() {
        let raw = "GET /x HTTP/1.1\r\nHost: h\r\nRange: bytes=-500\r\n\r\n";
        let req = parse(raw, "h").await.unwrap();
        assert_eq!(req.range_start, None);
        assert_eq!(req.range_end, Some(500));
    }

    #[tokio::test]
    async fn timeseek_without_range_is_406() {
        let raw = "GET /x HTTP/1.1\r\nHost: h\r\nTimeSeekRange.dlna.org: npt=0-\r\n\r\n";
        let req = parse(raw, "h").await.unwrap();
        assert_eq!(gate_check(&req), Some(406));
    }

    #[tokio::test]
    async fn soap_action_is_unquoted_and_trimmed() {
        let raw = "POST /ctl/ContentDir HTTP/1.1\r\nHost: h\r\nSOAPAction: \"urn:x#Browse\"\r\n\r\n";
        let req = parse(raw, "h").await.unwrap();
        assert_eq!(req.soap_action.as_deref(), Some("urn:x#Browse"));
    }

    #[tokio::test]
    async fn content_features_must_be_exactly_one() {
        let raw = "GET /x HTTP/1.1\r\nHost: h\r\ngetcontentFeatures.dlna.org: 0\r\n\r\n";
        let req = parse(raw, "h").await.unwrap();
        assert!(req.flags.invalid);
    }
}
