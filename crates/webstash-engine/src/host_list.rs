//! Host sets loaded from hosts-format block lists.

use std::collections::HashSet;
use std::path::Path;
use webstash_core::urls::{get_hostname_port, get_without_first_domain};
use webstash_core::{Error, Result};

#[derive(Debug, Default)]
pub struct HostList {
    hosts: HashSet<String>,
}

impl HostList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hosts_from_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {} failed: {e}", path.display())))?;
        self.add_hosts(&text);
        Ok(())
    }

    /// Parses hosts-format text: `#` starts a comment, a leading `0.0.0.0`
    /// address is stripped, lines with inner whitespace are ignored.
    pub fn add_hosts(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let line = line.strip_prefix("0.0.0.0").unwrap_or(line).trim();
            if !line.is_empty() && !line.contains(' ') {
                self.hosts.insert(line.to_string());
            }
        }
    }

    pub fn has_hosts(&self) -> bool {
        !self.hosts.is_empty()
    }

    /// Longest-suffix domain match: the URL's host matches when it or any
    /// parent domain is listed.
    pub fn contains(&self, url: &str) -> bool {
        let mut domain = get_hostname_port(url);
        while !domain.is_empty() {
            if self.hosts.contains(domain) {
                return true;
            }
            domain = get_without_first_domain(domain);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hosts_format() {
        let mut list = HostList::new();
        list.add_hosts(
            "# comment line\n\
             0.0.0.0 ads.example.com\n\
             tracker.net # trailing comment\n\
             \n\
             malformed entry with spaces\n\
             plain.org\n",
        );
        assert!(list.has_hosts());
        assert!(list.contains("http://ads.example.com/pixel.gif"));
        assert!(list.contains("https://tracker.net/"));
        assert!(list.contains("http://plain.org/x"));
        assert!(!list.contains("http://malformed/"));
        assert!(!list.contains("http://example.com/"));
    }

    #[test]
    fn matches_by_domain_suffix() {
        let mut list = HostList::new();
        list.add_hosts("example.com\n");
        assert!(list.contains("http://example.com/"));
        assert!(list.contains("http://www.example.com/"));
        assert!(list.contains("http://deep.sub.example.com/"));
        assert!(!list.contains("http://example.org/"));
        assert!(!list.contains("http://badexample.com/"));
    }

    #[test]
    fn empty_list_matches_nothing() {
        let list = HostList::new();
        assert!(!list.has_hosts());
        assert!(!list.contains("http://example.com/"));
    }
}
