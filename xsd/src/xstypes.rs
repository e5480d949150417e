use std::fmt;

use roxmltree::Node;

use super::error::XsdError;

pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// An expanded name: a local name and an optional namespace URI.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QName {
    pub namespace_name: Option<String>,
    pub local_name: String,
}

/// Clark notation, `{namespace}local`.
impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace_name {
            Some(ns) => write!(f, "{{{ns}}}{}", self.local_name),
            None => f.write_str(&self.local_name),
        }
    }
}

impl QName {
    pub fn with_namespace(namespace: impl Into<String>, local_name: impl Into<String>) -> Self {
        Self {
            namespace_name: Some(namespace.into()),
            local_name: local_name.into(),
        }
    }

    pub fn with_optional_namespace(
        namespace: Option<impl Into<String>>,
        local_name: impl Into<String>,
    ) -> Self {
        Self {
            namespace_name: namespace.map(Into::into),
            local_name: local_name.into(),
        }
    }

    /// Resolves a `prefix:local` or `local` name against the namespace declarations in scope
    /// at `context`. Unprefixed names take the default namespace, if any.
    pub fn parse(source: &str, context: Node) -> Result<Self, XsdError> {
        let Some((prefix, local)) = source.rsplit_once(':') else {
            return Ok(Self::with_optional_namespace(
                context.lookup_namespace_uri(None),
                source,
            ));
        };
        let namespace = match prefix {
            "xml" => XML_NAMESPACE,
            _ => context
                .lookup_namespace_uri(Some(prefix))
                .ok_or_else(|| XsdError::NamePrefixNotResolved(prefix.into()))?,
        };
        Ok(Self::with_namespace(namespace, local))
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace_name.as_deref()
    }

    pub fn is(&self, namespace: &str, local_name: &str) -> bool {
        self.namespace() == Some(namespace) && self.local_name == local_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_resolve_in_scope() {
        let doc = roxmltree::Document::parse(
            r#"<r xmlns="urn:d" xmlns:p="urn:p"><c xmlns:p="urn:q"/></r>"#,
        )
        .unwrap();
        let child = doc.root_element().first_child().unwrap();
        assert_eq!(QName::parse("p:a", child).unwrap(), QName::with_namespace("urn:q", "a"));
        assert_eq!(QName::parse("a", child).unwrap(), QName::with_namespace("urn:d", "a"));
        assert!(QName::parse("xml:lang", child).unwrap().is(XML_NAMESPACE, "lang"));
        assert!(matches!(
            QName::parse("z:a", child),
            Err(XsdError::NamePrefixNotResolved(_))
        ));
        assert_eq!(QName::with_namespace("urn:d", "a").to_string(), "{urn:d}a");
    }
}
