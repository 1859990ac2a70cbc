//! Thread-safe cookie storage, keyed by hostname.
//!
//! Cookies recorded here are also exposed to replayed pages through the
//! bootstrap script, so the store keeps the raw `Set-Cookie` value and only
//! truncates attributes when building the `Cookie:` request line.

use std::collections::BTreeMap;
use std::sync::Mutex;
use webstash_core::urls::get_hostname;

#[derive(Debug, Default)]
struct Inner {
    cookies: BTreeMap<String, BTreeMap<String, String>>,
    /// Memoized `Cookie:` line per host; invalidated inside the same critical
    /// section as any mutation of that host.
    list_cache: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
pub struct CookieStore {
    inner: Mutex<Inner>,
}

impl CookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a raw `Set-Cookie` value for the host of `url`.
    pub fn set(&self, url: &str, cookie: &str) {
        let hostname = get_hostname(url).to_string();
        let (name, value) = match cookie.find('=') {
            Some(equal) => (&cookie[..equal], &cookie[equal + 1..]),
            None => (cookie, ""),
        };
        let mut inner = self.lock();
        inner
            .cookies
            .entry(hostname.clone())
            .or_default()
            .insert(name.to_string(), value.to_string());
        inner.list_cache.remove(&hostname);
    }

    /// The `Cookie:` request line for the host of `url`, memoized per host.
    /// Attributes after the first `;` of each stored value are dropped.
    pub fn get_cookies_list(&self, url: &str) -> String {
        let hostname = get_hostname(url).to_string();
        let mut inner = self.lock();
        if let Some(list) = inner.list_cache.get(&hostname) {
            return list.clone();
        }
        let list = build_cookies_list(inner.cookies.get(&hostname));
        inner.list_cache.insert(hostname, list.clone());
        list
    }

    /// Line format: `<host> CRLF` then one `TAB <name> "=" <value> CRLF` per
    /// cookie.
    pub fn serialize(&self) -> String {
        let inner = self.lock();
        let mut out = String::new();
        for (hostname, cookies) in &inner.cookies {
            out.push_str(&format!("{hostname}\r\n"));
            for (name, value) in cookies {
                out.push_str(&format!("\t{name}={value}\r\n"));
            }
        }
        out
    }

    /// Tolerant inverse of [`serialize`](Self::serialize).
    pub fn deserialize(data: &str) -> Self {
        let mut cookies: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut current_host: Option<String> = None;
        for line in data.split("\r\n") {
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix('\t') {
                let Some(host) = &current_host else {
                    continue;
                };
                let Some(equal) = rest.find('=') else {
                    continue;
                };
                cookies
                    .entry(host.clone())
                    .or_default()
                    .insert(rest[..equal].to_string(), rest[equal + 1..].to_string());
            } else {
                current_host = Some(line.to_string());
            }
        }
        Self {
            inner: Mutex::new(Inner {
                cookies,
                list_cache: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn build_cookies_list(cookies: Option<&BTreeMap<String, String>>) -> String {
    let Some(cookies) = cookies else {
        return String::new();
    };
    cookies
        .iter()
        .map(|(name, value)| {
            let value = match value.find(';') {
                Some(semicolon) => &value[..semicolon],
                None => value.as_str(),
            };
            format!("{name}={value}")
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn cookies_are_stored_per_host() {
        let store = CookieStore::new();
        store.set("http://a.com/sub/page", "session=abc; Path=/; HttpOnly");
        store.set("http://a.com/", "theme=dark");
        store.set("http://b.com/", "session=other");

        assert_eq!(store.get_cookies_list("http://a.com/x"), "session=abc; theme=dark");
        assert_eq!(store.get_cookies_list("http://b.com/"), "session=other");
        assert_eq!(store.get_cookies_list("http://c.com/"), "");
    }

    #[test]
    fn memo_is_invalidated_by_writes() {
        let store = CookieStore::new();
        store.set("http://a.com/", "a=1");
        assert_eq!(store.get_cookies_list("http://a.com/"), "a=1");
        store.set("http://a.com/", "b=2");
        assert_eq!(store.get_cookies_list("http://a.com/"), "a=1; b=2");
    }

    #[test]
    fn attributes_are_dropped_from_the_list_only() {
        let store = CookieStore::new();
        store.set("http://a.com/", "session=abc; Expires=Wed, 21 Oct 2026 07:28:00 GMT");
        assert_eq!(store.get_cookies_list("http://a.com/"), "session=abc");
        // the raw value survives serialization
        assert!(store.serialize().contains("session=abc; Expires="));
    }

    #[test]
    fn value_less_cookies_are_tolerated() {
        let store = CookieStore::new();
        store.set("http://a.com/", "flag");
        assert_eq!(store.get_cookies_list("http://a.com/"), "flag=");
    }

    #[test]
    fn serialize_roundtrips() {
        let store = CookieStore::new();
        store.set("http://a.com/", "session=abc; Path=/");
        store.set("http://a.com/", "theme=dark");
        store.set("http://b.com:8080/", "x=y");

        let text = store.serialize();
        let restored = CookieStore::deserialize(&text);
        assert_eq!(restored.serialize(), text);
        assert_eq!(restored.get_cookies_list("http://a.com/"), "session=abc; theme=dark");
    }

    proptest! {
        #[test]
        fn deserialize_never_panics(data in ".{0,256}") {
            let _ = CookieStore::deserialize(&data);
        }
    }
}
