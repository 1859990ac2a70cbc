//! An ordered, case-insensitive HTTP header multimap plus the date helpers
//! the cache evaluator needs.
//!
//! Insertion order and duplicate names are preserved: the archive replays
//! responses byte-for-byte-ish, so the header serialization must not reorder
//! or dedupe what the origin sent.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    entries: Vec<(String, String)>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces every value of `name` with a single one.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove_all(name);
        self.append(name, value);
    }

    /// First value of `name`, compared ASCII-case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove_all(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, String)> for Header {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Header {
    type Item = (&'a str, &'a str);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a str)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str())))
    }
}

/// Splits a `Content-Type` value into `(mime_type, charset)`, both trimmed.
pub fn split_content_type(content_type: &str) -> (&str, &str) {
    let Some(semicolon) = content_type.find(';') else {
        return (content_type.trim(), "");
    };
    let mime_type = &content_type[..semicolon];
    let mut charset = "";
    if let Some(pos) = content_type[semicolon..].find("charset") {
        let rest = &content_type[semicolon + pos..];
        if let Some(eq) = rest.find('=') {
            charset = &rest[eq + 1..];
        }
    }
    (mime_type.trim(), charset.trim())
}

/// Formats epoch seconds as an IMF-fixdate (`Wed, 21 Oct 2015 07:28:00 GMT`).
pub fn format_http_time(time: i64) -> String {
    let time = UNIX_EPOCH + Duration::from_secs(time.max(0) as u64);
    httpdate::fmt_http_date(time)
}

/// Parses an HTTP date into epoch seconds; tolerant of the legacy formats
/// `httpdate` accepts, `None` for anything else.
pub fn parse_http_time(value: &str) -> Option<i64> {
    let time = httpdate::parse_http_date(value.trim()).ok()?;
    let since_epoch = time.duration_since(UNIX_EPOCH).ok()?;
    Some(since_epoch.as_secs() as i64)
}

/// Current time in epoch seconds.
pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs() as i64
}
