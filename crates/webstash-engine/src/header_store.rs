//! The persistent `identifying URL -> (status, header)` map, stored in the
//! archive under the `headers` key.
//!
//! Callers are responsible for serializing mutations (the engine holds its
//! write mutex); the store itself is plain data.

use std::collections::BTreeMap;
use webstash_core::header::Header;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderStoreEntry {
    pub status: u16,
    pub header: Header,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderStore {
    entries: BTreeMap<String, HeaderStoreEntry>,
}

impl HeaderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the entry for `url`.
    pub fn write(&mut self, url: impl Into<String>, status: u16, header: Header) {
        self.entries
            .insert(url.into(), HeaderStoreEntry { status, header });
    }

    pub fn read(&self, url: &str) -> Option<&HeaderStoreEntry> {
        self.entries.get(url)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.entries.contains_key(url)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in lexicographic key order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &HeaderStoreEntry)> {
        self.entries.iter().map(|(url, entry)| (url.as_str(), entry))
    }

    /// Line format: `<status> SP <url> CRLF` followed by one
    /// `TAB <name> ":" <value> CRLF` per header.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (url, entry) in &self.entries {
            out.push_str(&format!("{} {}\r\n", entry.status, url));
            for (name, value) in entry.header.iter() {
                out.push_str(&format!("\t{name}:{value}\r\n"));
            }
        }
        out
    }

    /// Tolerant inverse of [`serialize`](Self::serialize): malformed lines
    /// are skipped, blank values and duplicate names survive.
    pub fn deserialize(data: &str) -> Self {
        let mut store = Self::new();
        let mut current_url: Option<String> = None;
        for line in data.split("\r\n") {
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix('\t') {
                let Some(url) = &current_url else {
                    continue;
                };
                let Some(colon) = rest.find(':') else {
                    continue;
                };
                if let Some(entry) = store.entries.get_mut(url) {
                    entry.header.append(&rest[..colon], &rest[colon + 1..]);
                }
            } else {
                let Some(space) = line.find(' ') else {
                    current_url = None;
                    continue;
                };
                let Ok(status) = line[..space].parse::<u16>() else {
                    current_url = None;
                    continue;
                };
                let url = line[space + 1..].to_string();
                store.write(url.clone(), status, Header::new());
                current_url = Some(url);
            }
        }
        store
    }
}
