use percent_encoding::percent_decode_str;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::utils::{ProxyCacheError, Result};

/// Upper bound on the request head we are willing to buffer.
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// One inbound GET against the loopback proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRequest {
    /// Decoded upstream URL (or the reserved ping path)
    pub url: String,
    /// First requested byte
    pub offset: u64,
    /// `offset > 0`
    pub partial: bool,
    /// The request carried a usable `Range: bytes=N-` header
    pub ranged: bool,
}

impl CacheRequest {
    /// Parse a raw request head (request line plus headers).
    pub fn parse(head: &str) -> Result<Self> {
        let url = parse_url(head)?;
        let offset = parse_range_offset(head);
        let offset_value = offset.unwrap_or(0);

        Ok(Self {
            url,
            offset: offset_value,
            partial: offset_value > 0,
            ranged: offset.is_some(),
        })
    }

    /// Read a request head up to the terminating blank line and parse it.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut head = String::new();
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 || line.trim_end_matches(['\r', '\n']).is_empty() {
                break;
            }
            head.push_str(&line);
            if head.len() > MAX_HEAD_SIZE {
                return Err(ProxyCacheError::Parse(format!(
                    "request head exceeds {} bytes",
                    MAX_HEAD_SIZE
                )));
            }
        }
        Self::parse(&head)
    }
}

fn parse_url(head: &str) -> Result<String> {
    let request_line = head
        .lines()
        .next()
        .ok_or_else(|| ProxyCacheError::Parse("empty request".to_string()))?;

    let mut parts = request_line.split_whitespace();
    let (Some("GET"), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ProxyCacheError::Parse(format!(
            "not a GET request line: {:?}",
            request_line
        )));
    };
    if !version.starts_with("HTTP") {
        return Err(ProxyCacheError::Parse(format!(
            "missing HTTP version: {:?}",
            request_line
        )));
    }

    let encoded = target.strip_prefix('/').unwrap_or(target);
    if encoded.is_empty() {
        return Err(ProxyCacheError::Parse("request has no url".to_string()));
    }

    // Form-style encoding: '+' is a space.
    let encoded = encoded.replace('+', " ");
    percent_decode_str(&encoded)
        .decode_utf8()
        .map(|url| url.into_owned())
        .map_err(|e| ProxyCacheError::Parse(format!("url is not valid UTF-8: {}", e)))
}

/// Offset from the first `Range: bytes=N-` header, if it has that exact shape.
fn parse_range_offset(head: &str) -> Option<u64> {
    let value = head.lines().skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim().eq_ignore_ascii_case("range").then(|| value.trim())
    })?;

    let digits = value.strip_prefix("bytes=")?.split_once('-')?.0;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
