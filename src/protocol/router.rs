//! Path pattern routing on the channel receive side (§4.1).
//!
//! Patterns look like `/seg/:name/seg`. Matching splits on `/`, ignores the
//! query string when comparing segment counts, binds `:name` params, and
//! parses `?k=v&...` with URL-decoding. A request matching no pattern is
//! the caller's cue to emit it as a generic event instead.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedRequest {
    pub params: HashMap<String, String>,
    pub query: HashMap<String, String>,
}

/// A single registered `/seg/:name/seg` pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Param(String),
}

impl Pattern {
    pub fn parse(pattern: &str) -> Self {
        let segments = pattern
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| match s.strip_prefix(':') {
                Some(name) => Segment::Param(name.to_string()),
                None => Segment::Literal(s.to_string()),
            })
            .collect();
        Self { segments }
    }

    fn matches(&self, path_segments: &[&str]) -> Option<HashMap<String, String>> {
        if self.segments.len() != path_segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (seg, actual) in self.segments.iter().zip(path_segments.iter()) {
            match seg {
                Segment::Literal(lit) => {
                    if lit != actual {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    params.insert(name.clone(), actual.to_string());
                }
            }
        }
        Some(params)
    }
}

/// An ordered table of patterns, checked in registration order — first
/// match wins.
#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: Vec<(String, Pattern)>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pattern: &str) {
        self.routes.push((pattern.to_string(), Pattern::parse(pattern)));
    }

    /// Match `path_and_query` (e.g. `/post/relay/r1?token=abc`) against the
    /// registered patterns. Returns the matched pattern string and bindings,
    /// or `None` if nothing matches (the raw request should be emitted as a
    /// generic event in that case).
    pub fn route(&self, path_and_query: &str) -> Option<(&str, MatchedRequest)> {
        let (path, query_str) = match path_and_query.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path_and_query, None),
        };
        let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        for (raw, pattern) in &self.routes {
            if let Some(params) = pattern.matches(&path_segments) {
                let query = query_str.map(parse_query).unwrap_or_default();
                return Some((raw.as_str(), MatchedRequest { params, query }));
            }
        }
        None
    }
}

pub(crate) fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|kv| !kv.is_empty())
        .map(|kv| match kv.split_once('=') {
            Some((k, v)) => (url_decode(k), url_decode(v)),
            None => (url_decode(kv), String::new()),
        })
        .collect()
}

fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
                out.push(bytes[i]);
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_and_binds_param() {
        let mut router = Router::new();
        router.register("/get/relay/:id/:connectionKey");
        let (pattern, matched) = router.route("/get/relay/r1/abc123").unwrap();
        assert_eq!(pattern, "/get/relay/:id/:connectionKey");
        assert_eq!(matched.params.get("id"), Some(&"r1".to_string()));
        assert_eq!(matched.params.get("connectionKey"), Some(&"abc123".to_string()));
    }

    #[test]
    fn query_string_ignored_for_segment_count() {
        let mut router = Router::new();
        router.register("/post/join/:id");
        let (_, matched) = router.route("/post/join/X?foo=bar&baz=qux%20quux").unwrap();
        assert_eq!(matched.params.get("id"), Some(&"X".to_string()));
        assert_eq!(matched.query.get("foo"), Some(&"bar".to_string()));
        assert_eq!(matched.query.get("baz"), Some(&"qux quux".to_string()));
    }

    #[test]
    fn no_match_returns_none() {
        let mut router = Router::new();
        router.register("/post/join/:id");
        assert!(router.route("/unregistered/path").is_none());
    }

    #[test]
    fn segment_count_mismatch_does_not_match() {
        let mut router = Router::new();
        router.register("/a/:b");
        assert!(router.route("/a/b/c").is_none());
        assert!(router.route("/a").is_none());
    }
}
