//! Source resolution logic for media-relay
//!
//! Rewrites share links from known file hosts into URLs that serve the raw
//! bytes on a single GET, and decides whether a URL is worth streaming at all.

use chrono::Utc;
use url::Url;
use uuid::Uuid;

/// Extensions we accept as "this path is a media file"
pub const MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "webm", "avi", "mov", "m4v", "wmv", "flv", "mpg", "mpeg", "ts", "3gp", "mp3",
    "m4a", "aac", "flac", "ogg", "opus", "wav",
];

/// Extension used when the URL does not reveal one
pub const DEFAULT_EXTENSION: &str = "mp4";

/// Rewrites a URL of a known host; `None` leaves the URL untouched
pub type RewriteFn = fn(&Url) -> Option<Url>;

/// A host-specific rewrite rule
#[derive(Clone)]
pub struct HostRule {
    /// Short name used in logs
    pub name: &'static str,
    /// Substring matched against the URL host
    pub host: &'static str,
    rewrite: RewriteFn,
}

impl HostRule {
    /// Create a rule. `rewrite` must map its own output to itself (or `None`).
    pub fn new(name: &'static str, host: &'static str, rewrite: RewriteFn) -> Self {
        Self { name, host, rewrite }
    }

    fn matches(&self, url: &Url) -> bool {
        url.host_str().is_some_and(|host| host.contains(self.host))
    }
}

impl std::fmt::Debug for HostRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRule")
            .field("name", &self.name)
            .field("host", &self.host)
            .finish()
    }
}

/// Ordered registry of host rules
#[derive(Debug, Clone)]
pub struct SourceResolver {
    rules: Vec<HostRule>,
}

impl Default for SourceResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceResolver {
    /// Resolver with the built-in host table
    pub fn new() -> Self {
        Self {
            rules: vec![
                HostRule::new("pixeldrain", "pixeldrain.com", pixeldrain_direct),
                HostRule::new("google-drive", "drive.google.com", google_drive_export),
                HostRule::new("dropbox", "dropbox.com", dropbox_direct),
                HostRule::new("tmpfiles", "tmpfiles.org", tmpfiles_direct),
            ],
        }
    }

    /// Resolver without any rules (every URL passes through)
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule; it is tried after every rule already registered
    pub fn with_rule(mut self, rule: HostRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Registered rules in evaluation order
    pub fn rules(&self) -> &[HostRule] {
        &self.rules
    }

    /// First rule whose host pattern matches
    pub fn matching_rule(&self, url: &Url) -> Option<&HostRule> {
        self.rules.iter().find(|rule| rule.matches(url))
    }

    /// Rewrites `url` with the first matching rule. Never fails: unparseable
    /// input and unknown hosts come back unchanged.
    pub fn resolve(&self, url: &str) -> String {
        let Ok(parsed) = Url::parse(url) else {
            return url.to_string();
        };
        match self.matching_rule(&parsed) {
            Some(rule) => match (rule.rewrite)(&parsed) {
                Some(rewritten) => {
                    log::debug!("{} rule rewrote {url} -> {rewritten}", rule.name);
                    rewritten.to_string()
                }
                None => url.to_string(),
            },
            None => url.to_string(),
        }
    }

    /// Whether a single GET on `url` is expected to return the file itself
    pub fn classify_streamable(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return false;
        }
        self.matching_rule(&parsed).is_some()
            || media_extension(parsed.path()).is_some()
            || has_download_marker(&parsed)
    }
}

/// Recognized media extension of the last path segment, lowercased
pub fn media_extension(path: &str) -> Option<String> {
    let last = path.rsplit('/').next()?;
    let (_, ext) = last.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    MEDIA_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

fn has_download_marker(url: &Url) -> bool {
    url.query_pairs().any(|(key, value)| match key.as_ref() {
        "download" => value != "0" && value != "false",
        "dl" => value == "1",
        "export" => value == "download",
        _ => false,
    })
}

fn path_segments(url: &Url) -> Vec<String> {
    url.path_segments()
        .map(|segments| {
            segments
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn query_value(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// `/u/{id}` share pages and bare API links become the download endpoint
fn pixeldrain_direct(url: &Url) -> Option<Url> {
    let segments = path_segments(url);
    let id = match segments.as_slice() {
        [u, id] if u == "u" => id.clone(),
        [api, file, id] if api == "api" && file == "file" => id.clone(),
        _ => return None,
    };
    let mut out = url.clone();
    out.set_path(&format!("/api/file/{id}"));
    out.set_query(Some("download"));
    out.set_fragment(None);
    Some(out)
}

/// Share and open links become `uc?export=download`
fn google_drive_export(url: &Url) -> Option<Url> {
    let segments = path_segments(url);
    let id = match segments.as_slice() {
        [file, d, id, ..] if file == "file" && d == "d" => id.clone(),
        [page] if page == "open" || page == "uc" => query_value(url, "id")?,
        _ => return None,
    };
    let mut out = url.clone();
    out.set_path("/uc");
    out.query_pairs_mut()
        .clear()
        .append_pair("export", "download")
        .append_pair("id", &id);
    out.set_fragment(None);
    Some(out)
}

/// Forces `dl=1`, keeping any other query parameters (e.g. `rlkey`)
fn dropbox_direct(url: &Url) -> Option<Url> {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "dl")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut out = url.clone();
    {
        let mut query = out.query_pairs_mut();
        query.clear();
        for (k, v) in &kept {
            query.append_pair(k, v);
        }
        query.append_pair("dl", "1");
    }
    out.set_fragment(None);
    Some(out)
}

/// `/{n}/{file}` landing pages become `/dl/{n}/{file}`
fn tmpfiles_direct(url: &Url) -> Option<Url> {
    let segments = path_segments(url);
    match segments.as_slice() {
        [n, file] if n != "dl" => {
            let mut out = url.clone();
            let _ = out.set_scheme("https");
            out.set_path(&format!("/dl/{n}/{file}"));
            Some(out)
        }
        _ => None,
    }
}

/// Reduces free text to a filesystem-safe token of at most `max_len` chars
pub fn sanitize_component(text: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(text.len().min(max_len));
    let mut pending_sep = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c);
        } else {
            pending_sep = true;
        }
        if out.len() >= max_len {
            break;
        }
    }
    out.truncate(max_len);
    if out.is_empty() {
        "file".to_string()
    } else {
        out
    }
}

/// Generates a collision-free artifact filename for one transfer
pub fn artifact_filename(title: &str, variant: &str, content_id: &str, source_url: &str) -> String {
    let ext = Url::parse(source_url)
        .ok()
        .and_then(|url| media_extension(url.path()))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}_{}-{}.{}",
        sanitize_component(title, 48),
        sanitize_component(variant, 16),
        sanitize_component(content_id, 16),
        Utc::now().timestamp_millis(),
        &random[..8],
        ext
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_pixeldrain_share_link() {
        let resolver = SourceResolver::new();
        assert_eq!(
            resolver.resolve("https://pixeldrain.com/u/abc123"),
            "https://pixeldrain.com/api/file/abc123?download"
        );
        assert_eq!(
            resolver.resolve("https://pixeldrain.com/api/file/abc123"),
            "https://pixeldrain.com/api/file/abc123?download"
        );
    }

    #[test]
    fn test_resolve_google_drive() {
        let resolver = SourceResolver::new();
        let expected = "https://drive.google.com/uc?export=download&id=1AbC_dEf";
        assert_eq!(
            resolver.resolve("https://drive.google.com/file/d/1AbC_dEf/view?usp=sharing"),
            expected
        );
        assert_eq!(
            resolver.resolve("https://drive.google.com/open?id=1AbC_dEf"),
            expected
        );
        assert_eq!(resolver.resolve(expected), expected);
    }

    #[test]
    fn test_resolve_dropbox() {
        let resolver = SourceResolver::new();
        assert_eq!(
            resolver.resolve("https://www.dropbox.com/s/xyz/movie.mkv?rlkey=k1&dl=0"),
            "https://www.dropbox.com/s/xyz/movie.mkv?rlkey=k1&dl=1"
        );
        assert_eq!(
            resolver.resolve("https://www.dropbox.com/s/xyz/movie.mkv"),
            "https://www.dropbox.com/s/xyz/movie.mkv?dl=1"
        );
    }

    #[test]
    fn test_resolve_tmpfiles() {
        let resolver = SourceResolver::new();
        assert_eq!(
            resolver.resolve("http://tmpfiles.org/12345/clip.mp4"),
            "https://tmpfiles.org/dl/12345/clip.mp4"
        );
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let resolver = SourceResolver::new();
        let urls = [
            "https://pixeldrain.com/u/abc123",
            "https://drive.google.com/file/d/ID/view",
            "https://www.dropbox.com/s/xyz/a%20b.mp4?dl=0&x=a+b",
            "http://tmpfiles.org/1/f.mkv",
            "https://example.com/movie.mp4",
            "not a url at all",
        ];
        for url in urls {
            let once = resolver.resolve(url);
            assert_eq!(resolver.resolve(&once), once, "not idempotent for {url}");
        }
    }

    #[test]
    fn test_unmatched_hosts_pass_through() {
        let resolver = SourceResolver::new();
        for url in [
            "https://example.com/movie.mp4",
            "https://cdn.example.org/watch?v=1",
            "ftp://files.example.net/a.mkv",
            "garbage",
        ] {
            assert_eq!(resolver.resolve(url), url);
        }
        // Rule-less resolver leaves even known hosts alone
        let empty = SourceResolver::empty();
        assert_eq!(
            empty.resolve("https://pixeldrain.com/u/abc123"),
            "https://pixeldrain.com/u/abc123"
        );
    }

    #[test]
    fn test_unrecognized_path_on_known_host_is_unchanged() {
        let resolver = SourceResolver::new();
        assert_eq!(
            resolver.resolve("https://pixeldrain.com/l/listing"),
            "https://pixeldrain.com/l/listing"
        );
    }

    #[test]
    fn test_classify_streamable() {
        let resolver = SourceResolver::new();
        assert!(resolver.classify_streamable("https://example.com/movie.mp4"));
        assert!(resolver.classify_streamable("https://example.com/a/b/Song.FLAC"));
        assert!(resolver.classify_streamable("https://pixeldrain.com/u/abc"));
        assert!(resolver.classify_streamable("https://host.example/get?id=7&download"));
        assert!(resolver.classify_streamable("https://host.example/get?id=7&dl=1"));
        assert!(!resolver.classify_streamable("https://host.example/get?id=7&dl=0"));
        assert!(!resolver.classify_streamable("https://example.com/watch/123"));
        assert!(!resolver.classify_streamable("https://example.com/page.html"));
        assert!(!resolver.classify_streamable("ftp://example.com/movie.mp4"));
        assert!(!resolver.classify_streamable("movie.mp4"));
    }

    #[test]
    fn test_custom_rule_is_data() {
        fn always_api(url: &Url) -> Option<Url> {
            let mut out = url.clone();
            out.set_path("/api");
            Some(out)
        }
        let resolver = SourceResolver::empty().with_rule(HostRule::new("custom", "files.example", always_api));
        assert_eq!(resolver.resolve("https://files.example/x"), "https://files.example/api");
        assert!(resolver.classify_streamable("https://files.example/x"));
        assert_eq!(resolver.rules().len(), 1);
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("Spider-Man: No Way Home", 48), "Spider-Man_No_Way_Home");
        assert_eq!(sanitize_component("../../etc/passwd", 48), "etc_passwd");
        assert_eq!(sanitize_component("!!!", 48), "file");
        assert_eq!(sanitize_component("abcdefgh", 4), "abcd");
    }

    #[test]
    fn test_artifact_filename() {
        let a = artifact_filename("The Matrix", "720p", "42", "https://example.com/m.MKV");
        let b = artifact_filename("The Matrix", "720p", "42", "https://example.com/m.MKV");
        assert!(a.starts_with("The_Matrix_720p_42_"));
        assert!(a.ends_with(".mkv"));
        assert_ne!(a, b);

        let c = artifact_filename("x", "480p", "1", "https://pixeldrain.com/api/file/abc?download");
        assert!(c.ends_with(".mp4"));
    }
}
