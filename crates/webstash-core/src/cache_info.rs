//! Freshness evaluation of archived responses from their HTTP cache headers.

use crate::header::{parse_http_time, Header};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheInfo {
    pub expired: bool,
    /// Epoch seconds of the `Last-Modified` header, 0 when absent.
    pub last_modified_time: i64,
    pub etag: String,
}

/// Evaluates the cacheability of a stored response at time `now`.
///
/// Returns `None` for uncacheable responses (`no-store`). The directive scan
/// checks the request header before the response header and stops at the
/// first match, mirroring the recorded sessions this tool replays rather
/// than RFC 7234 precedence.
pub fn evaluate(
    status: u16,
    response_header: &Header,
    request_header: &Header,
    now: i64,
) -> Option<CacheInfo> {
    let max_age = cache_max_age(response_header, request_header)?;

    let date = response_header
        .get("Date")
        .and_then(parse_http_time)
        .unwrap_or(0);
    let age = now - date;

    let mut info = CacheInfo {
        expired: age > max_age,
        ..CacheInfo::default()
    };

    // a permanent redirect stays valid no matter what its headers claim
    if status == 301 {
        info.expired = false;
    }

    if let Some(time) = response_header.get("Last-Modified").and_then(parse_http_time) {
        info.last_modified_time = time;
    }
    if let Some(etag) = response_header.get("ETag") {
        info.etag = etag.to_string();
    }
    Some(info)
}

fn cache_max_age(response_header: &Header, request_header: &Header) -> Option<i64> {
    for header in [request_header, response_header] {
        for value in header.get_all("Cache-Control") {
            if value.contains("no-store") {
                return None;
            }
            if value.contains("no-cache") {
                return Some(0);
            }
            if let Some(seconds) = directive_seconds(value, "s-max-age=") {
                return Some(seconds);
            }
            if let Some(seconds) = directive_seconds(value, "max-age=") {
                return Some(seconds);
            }
        }
    }

    if let Some(date) = response_header.get("Date").and_then(parse_http_time) {
        if let Some(expires) = response_header.get("Expires").and_then(parse_http_time) {
            return Some(expires - date);
        }
        if let Some(modified) = response_header.get("Last-Modified").and_then(parse_http_time) {
            return Some((date - modified) / 10);
        }
    }
    Some(0)
}

fn directive_seconds(value: &str, directive: &str) -> Option<i64> {
    let pos = value.find(directive)?;
    let rest = &value[pos + directive.len()..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    Some(rest[..end].parse().unwrap_or(0))
}
