//! URL and filename utilities.
//!
//! These are deliberately not built on a general URL parser: the proxy deals
//! in *patched* URLs (`/https://host/x` as a path component) and in joins that
//! must preserve whatever the page author wrote (double slashes included), so
//! the accessors below slice the raw string the way the rest of the engine
//! expects. All functions are total; none perform IO.

use siphasher::sip::SipHasher24;
use std::hash::Hasher;

/// Maximum length of an archive key in bytes.
pub const MAX_FILENAME_LENGTH: usize = 255;

/// 16 lowercase hex digits of the SipHash-2-4 of `data` under a zero key.
///
/// Collisions are acceptably rare for archive keys and nothing here is
/// security sensitive.
pub fn get_hash(data: &[u8]) -> String {
    let mut hasher = SipHasher24::new_with_keys(0, 0);
    hasher.write(data);
    format!("{:016x}", hasher.finish())
}

/// The scheme of `url`, or `None` when no scheme parses.
///
/// A scheme is a non-empty run of lowercase letters terminated by `:`;
/// `http`/`https` take a fast path.
pub fn get_scheme(url: &str) -> Option<&str> {
    if url.starts_with("http:") {
        return Some("http");
    }
    if url.starts_with("https:") {
        return Some("https");
    }
    for (i, c) in url.char_indices() {
        match c {
            ':' => return if i > 0 { Some(&url[..i]) } else { None },
            'a'..='z' => {}
            _ => return None,
        }
    }
    None
}

pub fn is_relative_url(url: &str) -> bool {
    get_scheme(url).is_none()
}

/// Equality modulo a single trailing slash.
pub fn is_same_url(a: &str, b: &str) -> bool {
    a.strip_suffix('/').unwrap_or(a) == b.strip_suffix('/').unwrap_or(b)
}

/// `hostname[:port]` of an absolute URL, `""` for relative ones.
pub fn get_hostname_port(url: &str) -> &str {
    if is_relative_url(url) {
        return "";
    }
    let Some(begin) = url.find("://") else {
        return "";
    };
    let rest = &url[begin + 3..];
    match rest.find('/') {
        Some(slash) => &rest[..slash],
        None => rest,
    }
}

/// Hostname without the port.
pub fn get_hostname(url: &str) -> &str {
    let hostname_port = get_hostname_port(url);
    match hostname_port.find(':') {
        Some(colon) => &hostname_port[..colon],
        None => hostname_port,
    }
}

/// `scheme://hostname[:port]`; relative URLs pass through unchanged.
pub fn get_scheme_hostname_port(url: &str) -> &str {
    if is_relative_url(url) {
        return url;
    }
    let Some(begin) = url.find("://") else {
        return "";
    };
    match url[begin + 3..].find('/') {
        Some(slash) => &url[..begin + 3 + slash],
        None => url,
    }
}

/// The URL up to (excluding) the first `?` or `#`.
pub fn get_scheme_hostname_port_path(url: &str) -> &str {
    let question = url.find('?');
    let hash = url.find('#');
    let end = match (question, hash) {
        (Some(q), Some(h)) => q.min(h),
        (Some(q), None) => q,
        (None, Some(h)) => h,
        (None, None) => url.len(),
    };
    &url[..end]
}

/// Like [`get_scheme_hostname_port_path`] but with the final path segment
/// removed (the "directory" of the URL).
pub fn get_scheme_hostname_port_path_base(url: &str) -> &str {
    if is_relative_url(url) {
        return url;
    }
    let path = get_scheme_hostname_port_path(url);
    if path == get_scheme_hostname_port(url) {
        return path;
    }
    match path.rfind('/') {
        Some(slash) => &path[..slash + 1],
        None => path,
    }
}

/// Drops the leftmost domain label, e.g. `www.a.com` -> `a.com` -> `com`.
pub fn get_without_first_domain(domain: &str) -> &str {
    match domain.find('.') {
        Some(dot) => &domain[dot + 1..],
        None => "",
    }
}

/// File extension of the URL's path, `""` when there is none.
pub fn get_file_extension(url: &str) -> &str {
    let path = get_scheme_hostname_port_path(url);
    match (path.rfind('.'), path.rfind('/')) {
        (Some(dot), Some(slash)) if dot > slash => &path[dot + 1..],
        (Some(dot), None) => &path[dot + 1..],
        _ => "",
    }
}

/// Resolves `url` against `relative_to`.
///
/// Scheme-preserving: `//host/...` inherits the base scheme when the
/// authority looks like a host (contains a dot); otherwise the reference is
/// treated as a root-relative path, which is what pages using `//assets/...`
/// mean. Relative joins drop the final segment of the base path, then `/./`
/// collapses and `/../` consumes the previous segment (at position 0 it
/// erases itself). Double slashes inside the joined path are preserved.
pub fn to_absolute_url(url: &str, relative_to: &str) -> String {
    if !is_relative_url(url) {
        return url.to_string();
    }

    let base_root = get_scheme_hostname_port(relative_to);
    if let Some(rest) = url.strip_prefix("//") {
        let authority = rest.split('/').next().unwrap_or("");
        if authority.contains('.') {
            if let Some(scheme) = get_scheme(relative_to) {
                return format!("{scheme}:{url}");
            }
        }
        return format!("{base_root}{url}");
    }
    if url.starts_with('/') {
        return format!("{base_root}{url}");
    }

    let base_path_end = get_scheme_hostname_port_path(relative_to).len();
    let mut path = relative_to[base_root.len()..base_path_end].to_string();

    // remove the filename segment
    match path.rfind('/') {
        Some(slash) => path.truncate(slash + 1),
        None => path.push('/'),
    }
    path.push_str(url);

    while let Some(i) = path.find("/./") {
        path.replace_range(i..i + 2, "");
    }
    loop {
        let Some(i) = path.find("/..") else {
            break;
        };
        if i == 0 {
            path.replace_range(0..3, "");
        } else {
            let slash = path[..i].rfind('/').unwrap_or(0);
            path.replace_range(slash..i + 3, "");
        }
    }

    format!("{base_root}{path}")
}

/// Inverse of [`to_absolute_url`] for URLs under `base_url`: returns the
/// `/`-rooted suffix, or `url` unchanged when it lies elsewhere.
pub fn to_relative_url<'a>(url: &'a str, base_url: &str) -> &'a str {
    if let Some(rest) = url.strip_prefix(base_url) {
        if rest.is_empty() {
            return "/";
        }
        return rest;
    }
    url
}

/// Prefixes `http://` when the input carries no scheme.
pub fn url_from_input(url: &str) -> String {
    if url.contains("://") {
        url.to_string()
    } else {
        format!("http://{url}")
    }
}

/// A patched URL embeds an absolute URL as an absolute path: `/https://a/x`.
pub fn patch_absolute_url(url: &str) -> String {
    format!("/{url}")
}

/// Strips the patched-URL slash, but only when an http(s) URL follows.
pub fn unpatch_url(url: &str) -> &str {
    if url.starts_with("/http://") || url.starts_with("/https://") {
        &url[1..]
    } else {
        url
    }
}

/// Same-origin URLs become relative, everything else gets patched so the
/// client requests it back through the proxy.
pub fn to_relative_or_patch_url(url: &str, server_base: &str) -> String {
    if url.starts_with(server_base) {
        to_relative_url(url, server_base).to_string()
    } else {
        patch_absolute_url(url)
    }
}

/// The archive key of a request: the URL, plus a hash of the request body
/// when one is present (POSTs to the same URL archive separately).
pub fn get_identifying_url(url: &str, request_body: &[u8]) -> String {
    if request_body.is_empty() {
        return url.to_string();
    }
    let delimiter = if url.contains('?') { '&' } else { '?' };
    format!("{url}{delimiter}h={}", get_hash(request_body))
}

/// Derives the slash-normalized archive key of a URL.
///
/// The fragment is dropped, `://` becomes `/`, double slashes collapse, a
/// trailing slash gets an `index` filename, and over-length keys are
/// truncated with a hash of the removed tail so the result stays unique and
/// at most `MAX_FILENAME_LENGTH` bytes.
pub fn to_local_filename(url: &str) -> String {
    to_local_filename_max(url, MAX_FILENAME_LENGTH)
}

fn to_local_filename_max(url: &str, max_length: usize) -> String {
    let mut url = match url.find('#') {
        Some(i) => url[..i].to_string(),
        None => url.to_string(),
    };
    if let Some(i) = url.find("://") {
        url.replace_range(i..i + 3, "/");
    }
    while let Some(i) = url.find("//") {
        url.replace_range(i..i + 1, "");
    }
    if url.ends_with('/') {
        url.push_str("index");
    }
    if url.len() > max_length {
        let mut cut = max_length - 17;
        while !url.is_char_boundary(cut) {
            cut -= 1;
        }
        let hash = get_hash(url[cut..].as_bytes());
        url.truncate(cut);
        url.push('~');
        url.push_str(&hash);
    }
    url
}

/// Replaces characters that are illegal in filenames with visually
/// confusable Unicode analogues (see unicode.org's confusables table).
pub fn get_legal_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            '/' => '\u{2571}',  // BOX DRAWINGS LIGHT DIAGONAL UPPER RIGHT TO LOWER LEFT
            '\\' => '\u{2572}', // BOX DRAWINGS LIGHT DIAGONAL UPPER LEFT TO LOWER RIGHT
            '<' => '\u{27E8}',  // MATHEMATICAL LEFT ANGLE BRACKET
            '>' => '\u{27E9}',  // MATHEMATICAL RIGHT ANGLE BRACKET
            ':' => '\u{A789}',  // MODIFIER LETTER COLON
            '"' => '\u{02EE}',  // MODIFIER LETTER DOUBLE APOSTROPHE
            '|' => '\u{2223}',  // DIVIDES
            '*' => '\u{2217}',  // ASTERISK OPERATOR
            '?' => '\u{FF1F}',  // FULLWIDTH QUESTION MARK
            c => c,
        })
        .collect()
}

/// A presentable default archive filename for a URL: the local filename
/// minus the scheme segment and any trailing `/index`, made legal.
pub fn filename_from_url(url: &str) -> String {
    let filename = to_local_filename(url);
    let filename = match filename.find('/') {
        Some(i) => &filename[i + 1..],
        None => filename.as_str(),
    };
    let filename = filename.strip_suffix("/index").unwrap_or(filename);
    get_legal_filename(filename)
}

/// Builds an anchored regex source matching `url` with either scheme and,
/// optionally, any subdomain.
pub fn url_to_regex(url: &str, sub_domains: bool) -> String {
    let mut regex = url.replace("http://", "https?://");
    if sub_domains {
        regex = regex.replace("://", "://([^/]+.)?");
    }
    regex = regex.replace('.', "\\.").replace('/', "\\/");
    format!("^{regex}.*")
}
