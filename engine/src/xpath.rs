//! Matching of element and attribute paths against configured patterns.
//!
//! Patterns are slash-separated like the paths the analyzer builds (`a:Foo/a:bar/@id`). A leading
//! `//`, or `//` between two components, lets the next component match at any depth below the
//! previous one.

use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq, Eq)]
struct XPathComponent {
    value: String,
    direct_child: bool,
}

#[derive(Clone, Debug)]
struct Pattern {
    source: String,
    components: Vec<XPathComponent>,
}

/// A compiled set of reference paths.
#[derive(Clone, Debug, Default)]
pub struct XPathMatcher {
    patterns: Vec<Pattern>,
    /// prefix -> namespace URI, as declared next to the patterns
    namespaces: HashMap<String, String>,
}

impl XPathMatcher {
    /// Compiles `reference_xpaths`, whose prefixes are declared in `namespaces`
    /// (prefix -> URI).
    pub fn compile<I, S>(reference_xpaths: I, namespaces: HashMap<String, String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns = reference_xpaths
            .into_iter()
            .map(Into::into)
            .map(|source| {
                let components = tokenize(&source, |component| component.to_string());
                Pattern { source, components }
            })
            .collect();
        Self {
            patterns,
            namespaces,
        }
    }

    /// Rewrites the prefixes of the patterns to the ones used by a document (URI -> prefix).
    /// Prefixes unknown on either side are left untouched.
    pub fn set_document_uri_to_prefix(&mut self, uri_to_prefix: &HashMap<String, String>) {
        for pattern in &mut self.patterns {
            let namespaces = &self.namespaces;
            pattern.components = tokenize(&pattern.source, |component| {
                translate_prefix(component, namespaces, uri_to_prefix)
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// The first pattern matching `xpath`, in declaration order.
    pub fn matches(&self, xpath: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|p| matches_components(xpath, &p.components))
            .map(|p| p.source.as_str())
    }
}

fn tokenize(xpath: &str, map: impl Fn(&str) -> String) -> Vec<XPathComponent> {
    let mut components = Vec::new();
    let mut direct_child = true;
    for (i, token) in xpath.split('/').enumerate() {
        if token.is_empty() {
            // A leading single slash anchors the pattern; any other empty token comes from `//`
            if i > 0 || xpath.starts_with("//") {
                direct_child = false;
            }
            continue;
        }
        components.push(XPathComponent {
            value: map(token),
            direct_child,
        });
        direct_child = true;
    }
    components
}

fn translate_prefix(
    component: &str,
    namespaces: &HashMap<String, String>,
    uri_to_prefix: &HashMap<String, String>,
) -> String {
    let (marker, name) = match component.strip_prefix('@') {
        Some(rest) => ("@", rest),
        None => ("", component),
    };
    let Some((prefix, local)) = name.split_once(':') else {
        return component.to_string();
    };
    match namespaces
        .get(prefix)
        .and_then(|uri| uri_to_prefix.get(uri))
    {
        Some(doc_prefix) if doc_prefix.is_empty() => format!("{marker}{local}"),
        Some(doc_prefix) => format!("{marker}{doc_prefix}:{local}"),
        None => component.to_string(),
    }
}

fn matches_components(xpath: &str, components: &[XPathComponent]) -> bool {
    if components.is_empty() {
        return false;
    }
    let len = xpath.len();
    let mut pos = 0;
    let mut idx = 0;
    let mut direct_child = true;
    while pos < len && idx < components.len() {
        let component = &components[idx];
        direct_child = component.direct_child;
        let end = xpath[pos..].find('/').map_or(len, |i| pos + i);
        if xpath[pos..end] == component.value {
            idx += 1;
            pos = if end == len { len } else { end + 1 };
            direct_child = true;
        } else {
            if direct_child || end == len {
                return false;
            }
            pos = end + 1;
        }
    }
    (!direct_child || pos >= len) && idx == components.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(patterns: &[&str]) -> XPathMatcher {
        XPathMatcher::compile(patterns.iter().copied(), HashMap::new())
    }

    #[test]
    fn descendant_and_direct() {
        assert_eq!(matcher(&["//@c"]).matches("a/b/@c"), Some("//@c"));
        assert_eq!(matcher(&["/a/@c"]).matches("a/b/@c"), None);
        assert_eq!(matcher(&["/a/b/@c"]).matches("a/b/@c"), Some("/a/b/@c"));
        assert_eq!(matcher(&["a/b"]).matches("a/b"), Some("a/b"));
        assert_eq!(matcher(&["a//c"]).matches("a/b/c"), Some("a//c"));
        assert_eq!(matcher(&["a//c"]).matches("x/a/b/c"), None);
    }

    #[test]
    fn pattern_must_reach_the_end() {
        assert_eq!(matcher(&["//a"]).matches("a/b"), None);
        assert_eq!(matcher(&["/a"]).matches("a/b"), None);
        assert_eq!(matcher(&["//b"]).matches("a/b"), Some("//b"));
    }

    #[test]
    fn first_match_wins() {
        let m = matcher(&["//x", "//b", "/a/b"]);
        assert_eq!(m.matches("a/b"), Some("//b"));
        assert!(matcher(&[]).matches("a").is_none());
        assert!(matcher(&[]).is_empty());
    }

    #[test]
    fn document_prefixes() {
        let mut m = XPathMatcher::compile(
            ["//myns:Foo/@myns:id", "//other:Bar"],
            HashMap::from([
                ("myns".to_string(), "urn:foo".to_string()),
                ("other".to_string(), "urn:unknown".to_string()),
            ]),
        );
        m.set_document_uri_to_prefix(&HashMap::from([(
            "urn:foo".to_string(),
            "f".to_string(),
        )]));
        assert_eq!(m.matches("r/f:Foo/@f:id"), Some("//myns:Foo/@myns:id"));
        assert_eq!(m.matches("r/myns:Foo/@myns:id"), None);
        assert_eq!(m.matches("other:Bar"), Some("//other:Bar"));
    }
}
