//! Rewrites HTML and CSS so every linked resource flows back through the
//! proxy, and injects the bootstrap script replayed pages rely on.
//!
//! Edits are collected as `(start, end, replacement)` spans into the original
//! text and applied in one pass. The tag scanner below is deliberately local:
//! it only has to find start tags and attribute value offsets in real-world
//! (frequently malformed) markup, and a DOM parser would re-serialize the
//! document instead of leaving unpatched bytes untouched.

use webstash_core::urls::{
    get_hostname, get_hostname_port, get_scheme, get_scheme_hostname_port,
    get_scheme_hostname_port_path_base, is_relative_url, to_absolute_url,
    to_relative_or_patch_url,
};

#[derive(Debug, Clone)]
struct Patch {
    start: usize,
    end: usize,
    replacement: String,
}

#[derive(Debug, Clone, Copy)]
struct Attribute {
    name_start: usize,
    name_end: usize,
    value_start: usize,
    value_end: usize,
    /// One past the raw attribute (the closing quote included).
    raw_end: usize,
}

pub struct HtmlPatcher {
    server_base: String,
    base_url: String,
    data: String,
    inject_js_path: String,
    cookies: String,
    response_time: i64,
    patch_base_tag: bool,
    patches: Vec<Patch>,
}

impl HtmlPatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server_base: String,
        base_url: String,
        mime_type: &str,
        data: String,
        inject_js_path: String,
        cookies: String,
        response_time: i64,
        patch_base_tag: bool,
    ) -> Self {
        let mut patcher = Self {
            server_base,
            base_url,
            data,
            inject_js_path,
            cookies,
            response_time,
            patch_base_tag,
            patches: Vec::new(),
        };
        if mime_type.eq_ignore_ascii_case("text/css") {
            let end = patcher.data.len();
            patcher.parse_css(0, end);
        } else {
            patcher.parse_html();
        }
        patcher
    }

    /// Applies the collected edits, sorted by start offset; an edit starting
    /// inside the previous one is dropped (broken markup produces nested
    /// match ranges now and then).
    pub fn get_patched(&self) -> String {
        let mut patches: Vec<&Patch> = self.patches.iter().collect();
        patches.sort_by_key(|patch| patch.start);

        let mut out = String::with_capacity(self.data.len());
        let mut pos = 0;
        for patch in patches {
            if patch.start < pos {
                continue;
            }
            out.push_str(&self.data[pos..patch.start]);
            out.push_str(&patch.replacement);
            pos = patch.end;
        }
        out.push_str(&self.data[pos..]);
        out
    }

    fn parse_html(&mut self) {
        let bytes = self.data.as_bytes().to_vec();
        let mut injection_point: Option<usize> = None;
        let mut has_base_tag = false;
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] != b'<' {
                i += 1;
                continue;
            }
            if bytes[i..].starts_with(b"<!--") {
                i = find(&bytes, b"-->", i + 4).map(|p| p + 3).unwrap_or(bytes.len());
                continue;
            }
            if bytes[i..].starts_with(b"<!") || bytes[i..].starts_with(b"<?") || bytes[i..].starts_with(b"</") {
                i = find(&bytes, b">", i).map(|p| p + 1).unwrap_or(bytes.len());
                continue;
            }

            let tag_start = i;
            let name_start = i + 1;
            let mut j = name_start;
            while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'-') {
                j += 1;
            }
            if j == name_start {
                i += 1;
                continue;
            }
            let name = self.data[name_start..j].to_ascii_lowercase();
            let (attributes, after_tag) = scan_attributes(&bytes, j);

            match name.as_str() {
                "base" => {
                    injection_point = Some(injection_point.unwrap_or(tag_start).min(tag_start));
                    if let Some(href) = find_attribute(&self.data, &attributes, "href") {
                        self.apply_base(href.value_start, href.value_end);
                    }
                    has_base_tag = true;
                }
                "script" => {
                    injection_point = Some(injection_point.unwrap_or(tag_start).min(tag_start));
                }
                _ => {}
            }

            for removable in ["integrity", "crossorigin"] {
                if let Some(attribute) = find_attribute(&self.data, &attributes, removable) {
                    if attribute.value_end > attribute.value_start {
                        self.patches.push(Patch {
                            start: attribute.name_start,
                            end: attribute.raw_end,
                            replacement: String::new(),
                        });
                    }
                }
            }

            if name != "base" {
                for linked in ["href", "src", "poster"] {
                    if let Some(attribute) = find_attribute(&self.data, &attributes, linked) {
                        self.patch_link(attribute.value_start, attribute.value_end);
                    }
                }
            }
            if let Some(attribute) = find_attribute(&self.data, &attributes, "srcset") {
                self.parse_source_set(attribute.value_start, attribute.value_end);
            }
            if let Some(attribute) = find_attribute(&self.data, &attributes, "style") {
                self.parse_css(attribute.value_start, attribute.value_end);
            }

            i = after_tag;
            if name == "script" {
                i = find_ci(&bytes, b"</script", i).unwrap_or(bytes.len());
            } else if name == "style" {
                let content_end = find_ci(&bytes, b"</style", i).unwrap_or(bytes.len());
                self.parse_css(i, content_end);
                i = content_end;
            }
        }

        let injection_point = injection_point.or_else(|| {
            // no head start is visible in markup this broken; a literal scan
            // still finds most of them
            find(self.data.as_bytes(), b"<head>", 0)
                .or_else(|| find(self.data.as_bytes(), b"<HEAD>", 0))
                .map(|p| p + 6)
        });
        let injection_point = injection_point.unwrap_or(self.data.len());

        if self.patch_base_tag && !has_base_tag {
            self.inject_base(injection_point);
        }
        self.inject_patch_script(injection_point);
    }

    /// Rewrites every `url(...)` token of a style attribute, `<style>` body
    /// or whole stylesheet.
    fn parse_css(&mut self, start: usize, end: usize) {
        let bytes = self.data.as_bytes();
        let mut links = Vec::new();
        let mut i = start;
        while let Some(open) = find_ci(bytes, b"url(", i) {
            if open >= end {
                break;
            }
            let mut j = open + 4;
            while j < end && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            let close = match find(bytes, b")", j) {
                Some(close) if close < end => close,
                _ => break,
            };
            links.push((j, close));
            i = close + 1;
        }
        for (link_start, link_end) in links {
            self.patch_link(link_start, link_end);
        }
    }

    /// `srcset` holds comma-separated candidates of the form `url [width]`.
    fn parse_source_set(&mut self, start: usize, end: usize) {
        let bytes = self.data.as_bytes();
        let mut links = Vec::new();
        let mut candidate_start = start;
        loop {
            let candidate_end = find(bytes, b",", candidate_start)
                .filter(|comma| *comma < end)
                .unwrap_or(end);
            let mut url_start = candidate_start;
            while url_start < candidate_end && bytes[url_start].is_ascii_whitespace() {
                url_start += 1;
            }
            let mut url_end = url_start;
            while url_end < candidate_end && !bytes[url_end].is_ascii_whitespace() {
                url_end += 1;
            }
            if url_end > url_start {
                links.push((url_start, url_end));
            }
            if candidate_end >= end {
                break;
            }
            candidate_start = candidate_end + 1;
        }
        for (link_start, link_end) in links {
            self.patch_link(link_start, link_end);
        }
    }

    /// Rewrites one link span: same-origin URLs become relative, other
    /// http(s) URLs get patched through the proxy; any other scheme and
    /// in-page fragments stay untouched.
    fn patch_link(&mut self, start: usize, end: usize) {
        let patch = {
            let (start, end) = get_link(&self.data, start, end);
            let link = &self.data[start..end];
            if link.is_empty() || link.starts_with('#') {
                None
            } else if !is_relative_url(link)
                && !matches!(get_scheme(link), Some("http") | Some("https"))
            {
                None
            } else {
                let absolute = to_absolute_url(link, &self.base_url);
                let patched = to_relative_or_patch_url(&absolute, &self.server_base);
                (patched != link).then(|| Patch {
                    start,
                    end,
                    replacement: patched,
                })
            }
        };
        if let Some(patch) = patch {
            self.patches.push(patch);
        }
    }

    /// `<base href>` both moves the document base and gets re-patched itself.
    fn apply_base(&mut self, start: usize, end: usize) {
        let (start, end) = get_link(&self.data, start, end);
        let new_base = to_absolute_url(&self.data[start..end], &self.base_url);
        let replacement = to_relative_or_patch_url(&new_base, &self.server_base);
        self.base_url = new_base;
        self.patches.push(Patch {
            start,
            end,
            replacement,
        });
    }

    fn inject_base(&mut self, at: usize) {
        let base = get_scheme_hostname_port_path_base(&self.base_url);
        self.patches.push(Patch {
            start: at,
            end: at,
            replacement: format!("<base href='{base}'>"),
        });
    }

    fn inject_patch_script(&mut self, at: usize) {
        if self.inject_js_path.is_empty() {
            return;
        }
        let escape = |s: &str| s.replace('\\', "\\\\").replace('\'', "\\'");
        let replacement = format!(
            "<script type='text/javascript'>__webrecorder = {{ \
             server_base:'{}', origin:'{}', host:'{}', hostname:'{}', \
             cookies:'{}', response_time:{}, }}</script>\
             <script type='text/javascript' src='{}'></script>",
            escape(&self.server_base),
            escape(get_scheme_hostname_port(&self.base_url)),
            escape(get_hostname_port(&self.base_url)),
            escape(get_hostname(&self.base_url)),
            escape(&self.cookies),
            self.response_time,
            escape(&self.inject_js_path),
        );
        self.patches.push(Patch {
            start: at,
            end: at,
            replacement,
        });
    }
}

/// Trims whitespace and strips one layer of `'`, `"` or `&quot;...&quot;`
/// from a value span, returning the narrowed span.
fn get_link(data: &str, mut start: usize, mut end: usize) -> (usize, usize) {
    let bytes = data.as_bytes();
    while start < end && bytes[start].is_ascii_whitespace() {
        start += 1;
    }
    while end > start && bytes[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    if end - start >= 2
        && bytes[start] == bytes[end - 1]
        && (bytes[start] == b'"' || bytes[start] == b'\'')
    {
        start += 1;
        end -= 1;
    }
    if end - start >= 12
        && data[start..].starts_with("&quot;")
        && data[..end].ends_with("&quot;")
    {
        start += 6;
        end -= 6;
    }
    (start, end)
}

fn find_attribute<'a>(
    data: &str,
    attributes: &'a [Attribute],
    name: &str,
) -> Option<&'a Attribute> {
    attributes
        .iter()
        .find(|a| data[a.name_start..a.name_end].eq_ignore_ascii_case(name))
}

/// Scans `name`, `name=value`, `name="value"` and `name='value'` pairs up to
/// the closing `>`. Returns the attributes and the index just past the tag.
fn scan_attributes(bytes: &[u8], mut i: usize) -> (Vec<Attribute>, usize) {
    let mut attributes = Vec::new();
    loop {
        while i < bytes.len() && (bytes[i].is_ascii_whitespace() || bytes[i] == b'/') {
            i += 1;
        }
        if i >= bytes.len() {
            return (attributes, i);
        }
        if bytes[i] == b'>' {
            return (attributes, i + 1);
        }

        let name_start = i;
        while i < bytes.len()
            && !bytes[i].is_ascii_whitespace()
            && !matches!(bytes[i], b'=' | b'>' | b'/')
        {
            i += 1;
        }
        let name_end = i;
        if name_end == name_start {
            i += 1;
            continue;
        }

        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i < bytes.len() && bytes[i] == b'=' {
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            let (value_start, value_end, raw_end) =
                if i < bytes.len() && (bytes[i] == b'"' || bytes[i] == b'\'') {
                    let quote = bytes[i];
                    let value_start = i + 1;
                    let mut j = value_start;
                    while j < bytes.len() && bytes[j] != quote {
                        j += 1;
                    }
                    let raw_end = if j < bytes.len() { j + 1 } else { j };
                    (value_start, j, raw_end)
                } else {
                    let value_start = i;
                    let mut j = value_start;
                    while j < bytes.len() && !bytes[j].is_ascii_whitespace() && bytes[j] != b'>' {
                        j += 1;
                    }
                    (value_start, j, j)
                };
            i = raw_end;
            attributes.push(Attribute {
                name_start,
                name_end,
                value_start,
                value_end,
                raw_end,
            });
        } else {
            attributes.push(Attribute {
                name_start,
                name_end,
                value_start: name_end,
                value_end: name_end,
                raw_end: name_end,
            });
        }
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|p| p + from)
}

fn find_ci(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
        .map(|p| p + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(html: &str) -> String {
        HtmlPatcher::new(
            "http://a.com".into(),
            "http://a.com/sub/index.html".into(),
            "text/html",
            html.into(),
            "/__webrecorder.js".into(),
            "session=abc".into(),
            1_600_000_000,
            false,
        )
        .get_patched()
    }

    #[test]
    fn same_origin_links_become_relative() {
        let out = patch(r#"<a href="http://a.com/page">x</a>"#);
        assert!(out.contains(r#"<a href="/page">x</a>"#), "{out}");
    }

    #[test]
    fn relative_links_resolve_against_the_document_base() {
        let out = patch(r#"<img src="pic.png">"#);
        assert!(out.contains(r#"<img src="/sub/pic.png">"#), "{out}");
        let out = patch(r#"<img src='../pic.png'>"#);
        assert!(out.contains("<img src='/pic.png'>"), "{out}");
    }

    #[test]
    fn cross_origin_links_are_patched_absolute() {
        let out = patch(r#"<script src="https://cdn.b.com/lib.js"></script>"#);
        assert!(out.contains(r#"src="/https://cdn.b.com/lib.js""#), "{out}");
    }

    #[test]
    fn other_schemes_and_fragments_are_untouched() {
        let out = patch(r##"<a href="javascript:void(0)">j</a><a href="#top">t</a><img src="data:image/png;base64,AA==">"##);
        assert!(out.contains(r#"href="javascript:void(0)""#), "{out}");
        assert!(out.contains(r##"href="#top""##), "{out}");
        assert!(out.contains(r#"src="data:image/png;base64,AA==""#), "{out}");
    }

    #[test]
    fn unquoted_and_entity_quoted_values_are_handled() {
        let out = patch("<img src=pic.png >");
        assert!(out.contains("<img src=/sub/pic.png >"), "{out}");
        let out = patch(r#"<a href="&quot;http://b.com/x&quot;">x</a>"#);
        assert!(out.contains("/http://b.com/x"), "{out}");
    }

    #[test]
    fn integrity_and_crossorigin_attributes_are_removed() {
        let out = patch(
            r#"<script src="http://a.com/x.js" integrity="sha384-abc" crossorigin="anonymous"></script>"#,
        );
        assert!(!out.contains("integrity"), "{out}");
        assert!(!out.contains("crossorigin"), "{out}");
        assert!(out.contains(r#"src="/x.js""#), "{out}");
        // empty values are left alone
        let out = patch(r#"<script src="x.js" integrity=""></script>"#);
        assert!(out.contains(r#"integrity="""#), "{out}");
    }

    #[test]
    fn srcset_candidates_are_each_rewritten() {
        let out = patch(r#"<img srcset="small.png 480w, http://b.com/big.png 1080w">"#);
        assert!(out.contains("/sub/small.png 480w"), "{out}");
        assert!(out.contains("/http://b.com/big.png 1080w"), "{out}");
    }

    #[test]
    fn css_urls_are_rewritten_in_style_attributes_blocks_and_sheets() {
        let out = patch(r#"<div style="background:url('bg.png')"></div>"#);
        assert!(out.contains("url('/sub/bg.png')"), "{out}");

        let out = patch("<style>body { background: url(http://b.com/bg.png); }</style>");
        assert!(out.contains("url(/http://b.com/bg.png)"), "{out}");

        let css = HtmlPatcher::new(
            "http://a.com".into(),
            "http://a.com/css/site.css".into(),
            "text/css",
            "@font-face { src: URL( \"font.woff2\" ); }".into(),
            String::new(),
            String::new(),
            0,
            false,
        )
        .get_patched();
        assert!(css.contains("\"/css/font.woff2\""), "{css}");
    }

    #[test]
    fn script_bodies_are_not_rewritten() {
        let out = patch(r#"<script>var x = "http://a.com/page";</script>"#);
        assert!(out.contains(r#"var x = "http://a.com/page";"#), "{out}");
    }

    #[test]
    fn bootstrap_is_injected_before_the_first_script() {
        let out = patch("<html><head><script src=\"app.js\"></script></head></html>");
        let bootstrap = out.find("__webrecorder = {").expect("bootstrap missing");
        let app = out.find("app.js").unwrap();
        assert!(bootstrap < app, "{out}");
        assert!(out.contains("server_base:'http://a.com'"), "{out}");
        assert!(out.contains("origin:'http://a.com'"), "{out}");
        assert!(out.contains("hostname:'a.com'"), "{out}");
        assert!(out.contains("cookies:'session=abc'"), "{out}");
        assert!(out.contains("response_time:1600000000"), "{out}");
        assert!(out.contains("src='/__webrecorder.js'"), "{out}");
    }

    #[test]
    fn bootstrap_falls_back_to_head_then_eof() {
        let out = patch("<html><head><title>t</title></head><body>b</body></html>");
        let bootstrap = out.find("__webrecorder").unwrap();
        assert!(bootstrap < out.find("<title>").unwrap(), "{out}");

        let out = patch("plain text, no markup");
        assert!(out.starts_with("plain text, no markup<script"), "{out}");
    }

    #[test]
    fn bootstrap_requires_an_inject_path() {
        let out = HtmlPatcher::new(
            "http://a.com".into(),
            "http://a.com/".into(),
            "text/html",
            "<html><head></head></html>".into(),
            String::new(),
            String::new(),
            0,
            false,
        )
        .get_patched();
        assert!(!out.contains("__webrecorder"), "{out}");
    }

    #[test]
    fn cookie_quotes_are_escaped_in_the_bootstrap() {
        let out = HtmlPatcher::new(
            "http://a.com".into(),
            "http://a.com/".into(),
            "text/html",
            "<head></head>".into(),
            "/__webrecorder.js".into(),
            "name=it's".into(),
            0,
            false,
        )
        .get_patched();
        assert!(out.contains("cookies:'name=it\\'s'"), "{out}");
    }

    #[test]
    fn base_tags_move_the_document_base_and_get_patched() {
        let out = patch(r#"<head><base href="http://b.com/dir/"><link href="x.css"></head>"#);
        // the base itself is re-patched
        assert!(out.contains(r#"<base href="/http://b.com/dir/">"#), "{out}");
        // later links resolve against the new base
        assert!(out.contains(r#"href="/http://b.com/dir/x.css""#), "{out}");
    }

    #[test]
    fn base_tag_is_injected_on_request() {
        let out = HtmlPatcher::new(
            "http://a.com".into(),
            "http://a.com/sub/index.html".into(),
            "text/html",
            "<head></head>".into(),
            String::new(),
            String::new(),
            0,
            true,
        )
        .get_patched();
        assert!(out.contains("<base href='http://a.com/sub/'>"), "{out}");
    }

    #[test]
    fn comments_and_doctype_are_skipped() {
        let out = patch("<!DOCTYPE html><!-- <img src=\"x.png\"> --><img src=\"y.png\">");
        assert!(out.contains("<img src=\"x.png\">"), "{out}");
        assert!(out.contains("<img src=\"/sub/y.png\">"), "{out}");
    }

    #[test]
    fn overlapping_edits_keep_the_earliest() {
        let mut patcher = HtmlPatcher::new(
            "http://a.com".into(),
            "http://a.com/".into(),
            "text/html",
            "0123456789".into(),
            String::new(),
            String::new(),
            0,
            false,
        );
        patcher.patches.push(Patch {
            start: 2,
            end: 6,
            replacement: "AB".into(),
        });
        patcher.patches.push(Patch {
            start: 4,
            end: 8,
            replacement: "CD".into(),
        });
        assert_eq!(patcher.get_patched(), "01AB6789");
    }

    #[test]
    fn truncated_markup_never_panics() {
        for html in [
            "<",
            "<a",
            "<a href",
            "<a href=",
            "<a href=\"x",
            "<a href='x' ",
            "<style>url(",
            "<!-- unterminated",
            "<script>unterminated",
            "<img srcset=\"a.png 1x,",
        ] {
            let _ = patch(html);
        }
    }

    #[test]
    fn patched_document_parses_cleanly() {
        let out = patch(
            "<html><head><script src='https://cdn.b.com/lib.js' integrity='sha384-x'></script>\
             </head><body><img src='pic.png'></body></html>",
        );
        let document = html_scraper::Html::parse_document(&out);
        let scripts = html_scraper::Selector::parse("script[src]").unwrap();
        let sources: Vec<_> = document
            .select(&scripts)
            .filter_map(|el| el.value().attr("src"))
            .collect();
        assert!(sources.contains(&"/__webrecorder.js"));
        assert!(sources.contains(&"/https://cdn.b.com/lib.js"));
        let images = html_scraper::Selector::parse("img").unwrap();
        let img = document.select(&images).next().unwrap();
        assert_eq!(img.value().attr("src"), Some("/sub/pic.png"));
        assert_eq!(img.value().attr("integrity"), None);
    }
}
