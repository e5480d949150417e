//! Resolution of `xlink:href` links to documents outside the one being read.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{
    cache::{FetchOptions, ResourceCache},
    conf::{DerivedField, ResolutionMode, XLinkResolutionConf, XLinkRule},
    model::{Field, FieldCategory, FieldType},
    storage::{parse_scalar, Value},
    xpath::XPathMatcher,
};

/// Whether `href` points inside the current document.
pub fn is_internal(href: &str) -> bool {
    href.starts_with('#')
}

/// The column storing the body of the documents an href field points to.
pub fn raw_content_field(href: &Field) -> Field {
    let mut field = Field::new(
        format!("{}_rawcontent", base_name(href)),
        format!("{}_rawcontent", href.xpath),
        FieldCategory::Regular,
    );
    field.documentation = format!("Content of the documents referenced by {}", href.xpath);
    field
}

/// The column storing the values `derived` extracts from the documents an href field points to.
pub fn derived_field(href: &Field, derived: &DerivedField) -> Field {
    let mut field = Field::new(
        format!("{}_{}", base_name(href), derived.name),
        format!("{}_derived_{}", href.xpath, derived.name),
        FieldCategory::Regular,
    );
    let field_type = FieldType::from_xsd_name(&derived.field_type);
    field.set_type(field_type, derived.field_type.clone());
    field
}

/// Whether `field` holds data fetched through a link rather than document content.
pub fn is_resolved_field(field: &Field) -> bool {
    field.xpath.ends_with("_rawcontent") || field.xpath.contains("_derived_")
}

fn base_name(href: &Field) -> &str {
    href.name.strip_suffix("_href").unwrap_or(&href.name)
}

/// Fetches linked documents within the configured time budget.
pub struct XLinkResolver {
    conf: XLinkResolutionConf,
    cache: ResourceCache,
    spent: Duration,
    budget_exhausted: bool,
    cached_results: HashMap<String, Option<String>>,
    notes: Vec<String>,
}

impl XLinkResolver {
    pub fn new(conf: &XLinkResolutionConf) -> Self {
        Self {
            conf: conf.clone(),
            cache: ResourceCache::new(conf.cache_directory.clone(), true),
            spent: Duration::ZERO,
            budget_exhausted: false,
            cached_results: HashMap::new(),
            notes: Vec::new(),
        }
    }

    pub fn rule_for(&self, href: &str) -> Option<&XLinkRule> {
        if is_internal(href) {
            return None;
        }
        self.conf.rule_for(href)
    }

    /// Things worth reporting that happened while resolving: skipped or failed fetches.
    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    pub fn take_notes(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notes)
    }

    fn note(&mut self, message: String) {
        warn!("{message}");
        self.notes.push(message);
    }

    /// The body of the document `href` points to, if a rule applies and it could be fetched.
    pub fn fetch(&mut self, href: &str) -> Option<String> {
        let rule = self.rule_for(href)?.clone();
        if rule.cache_results {
            if let Some(result) = self.cached_results.get(href) {
                return result.clone();
            }
        }
        if let Some(budget) = self.conf.max_global_resolution_time {
            if self.spent >= budget {
                if !self.budget_exhausted {
                    self.budget_exhausted = true;
                    self.note(format!(
                        "Time budget for link resolution exhausted, {href} and later links are \
                         not resolved"
                    ));
                } else {
                    debug!("Not resolving {href}, time budget exhausted");
                }
                return None;
            }
        }

        let timeout = match self.conf.max_global_resolution_time {
            Some(budget) => self.conf.timeout.min(budget - self.spent),
            None => self.conf.timeout,
        };
        let options = FetchOptions {
            allow_remote: rule.allow_remote_download,
            use_disk_cache: rule.cache_results,
            timeout: Some(timeout),
            max_size: Some(self.conf.max_file_size),
            headers: &rule.http_headers,
        };
        let started = Instant::now();
        let result = self.cache.fetch_with(href, &options);
        self.spent += started.elapsed();
        let body = match result {
            Ok(body) => Some(body),
            Err(e) => {
                self.note(format!("Cannot resolve {href}: {e}"));
                None
            }
        };
        if rule.cache_results {
            self.cached_results.insert(href.to_string(), body.clone());
        }
        body
    }

    /// Resolves `href` following its rule: the values to store, keyed by column name, for the
    /// href field `href_field`.
    pub fn resolve(&mut self, href_field: &Field, href: &str) -> Vec<(String, Value)> {
        let Some(rule) = self.rule_for(href).cloned() else {
            return Vec::new();
        };
        let Some(body) = self.fetch(href) else {
            return Vec::new();
        };
        match rule.resolution_mode {
            ResolutionMode::RawContent => {
                vec![(raw_content_field(href_field).name, Value::String(body))]
            }
            ResolutionMode::FieldsFromXPath => {
                let texts = match derive_texts(&rule.fields, &body) {
                    Ok(texts) => texts,
                    Err(e) => {
                        self.note(format!("Cannot parse {href}: {e}"));
                        return Vec::new();
                    }
                };
                let mut values = Vec::new();
                for (derived, text) in rule.fields.iter().zip(texts) {
                    let Some(text) = text else { continue };
                    let field_type = FieldType::from_xsd_name(&derived.field_type);
                    let value = parse_scalar(&text, field_type).unwrap_or_else(|| {
                        self.note(format!(
                            "Value {text:?} of {} in {href} is not a valid {}",
                            derived.name, derived.field_type
                        ));
                        Value::Null
                    });
                    values.push((derived_field(href_field, derived).name, value));
                }
                values
            }
        }
    }
}

/// Evaluates every derived field against `body`, giving the text matched by each. Repeated
/// matches are joined with a space.
pub fn derive_texts(
    fields: &[DerivedField],
    body: &str,
) -> Result<Vec<Option<String>>, roxmltree::Error> {
    let document = roxmltree::Document::parse(body)?;
    let matchers = fields
        .iter()
        .map(|f| XPathMatcher::compile([f.xpath.as_str()], HashMap::new()))
        .collect::<Vec<_>>();
    let mut texts: Vec<Option<String>> = vec![None; fields.len()];
    let mut add = |path: &str, text: &str| {
        for (i, matcher) in matchers.iter().enumerate() {
            if matcher.matches(path).is_some() {
                let slot = texts[i].get_or_insert_with(String::new);
                if !slot.is_empty() {
                    slot.push(' ');
                }
                slot.push_str(text.trim());
            }
        }
    };

    let mut stack = vec![(document.root_element(), qualified_name(document.root_element()))];
    while let Some((node, path)) = stack.pop() {
        for attribute in node.attributes() {
            let name = match attribute.namespace().and_then(|ns| node.lookup_prefix(ns)) {
                Some(prefix) => format!("{path}/@{prefix}:{}", attribute.name()),
                None => format!("{path}/@{}", attribute.name()),
            };
            add(&name, attribute.value());
        }
        let text = node
            .children()
            .filter(|c| c.is_text())
            .filter_map(|c| c.text())
            .collect::<String>();
        if !text.trim().is_empty() {
            add(&path, &text);
        }
        let children = node.children().filter(|c| c.is_element()).collect::<Vec<_>>();
        for child in children.into_iter().rev() {
            let child_path = format!("{path}/{}", qualified_name(child));
            stack.push((child, child_path));
        }
    }

    Ok(texts)
}

fn qualified_name(node: roxmltree::Node) -> String {
    let name = node.tag_name();
    match name.namespace().and_then(|ns| node.lookup_prefix(ns)) {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}:{}", name.name()),
        _ => name.name().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;

    use super::*;

    fn href_field() -> Field {
        Field::new("ref_href", "t:A/t:ref/@xlink:href", FieldCategory::Regular)
    }

    fn rule(prefix: &str, mode: ResolutionMode, fields: Vec<DerivedField>) -> XLinkRule {
        XLinkRule {
            url_prefix: Some(prefix.into()),
            resolution_mode: mode,
            fields,
            ..Default::default()
        }
    }

    #[test]
    fn exhausted_budget_skips_fetches() {
        let conf = XLinkResolutionConf {
            max_global_resolution_time: Some(Duration::ZERO),
            url_specific_rules: vec![rule(
                "http://example.invalid/",
                ResolutionMode::RawContent,
                Vec::new(),
            )],
            ..Default::default()
        };
        let mut resolver = XLinkResolver::new(&conf);
        let href = "http://example.invalid/doc.xml";
        assert!(resolver.resolve(&href_field(), href).is_empty());
        assert!(resolver.resolve(&href_field(), href).is_empty());
        assert_eq!(resolver.notes().len(), 1);
        assert!(resolver.notes()[0].contains(href));
    }

    #[test]
    fn raw_content_and_derived_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linked.xml");
        fs::write(
            &path,
            r#"<doc xmlns:x="urn:x"><x:title>First</x:title><x:title>Second</x:title><count n="3"/></doc>"#,
        )
        .unwrap();
        let prefix = dir.path().to_string_lossy().to_string();
        let href = path.to_string_lossy().to_string();

        let raw = XLinkResolutionConf {
            url_specific_rules: vec![rule(&prefix, ResolutionMode::RawContent, Vec::new())],
            ..Default::default()
        };
        let values = XLinkResolver::new(&raw).resolve(&href_field(), &href);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].0, "ref_rawcontent");

        let derived = XLinkResolutionConf {
            url_specific_rules: vec![rule(
                &prefix,
                ResolutionMode::FieldsFromXPath,
                vec![
                    DerivedField {
                        name: "title".into(),
                        field_type: "string".into(),
                        xpath: "//x:title".into(),
                    },
                    DerivedField {
                        name: "count".into(),
                        field_type: "int".into(),
                        xpath: "doc/count/@n".into(),
                    },
                ],
            )],
            ..Default::default()
        };
        let values = XLinkResolver::new(&derived).resolve(&href_field(), &href);
        assert_eq!(
            values,
            [
                ("ref_title".to_string(), Value::String("First Second".into())),
                ("ref_count".to_string(), Value::Integer(3)),
            ]
        );
        assert_eq!(
            derived_field(&href_field(), &derived.url_specific_rules[0].fields[1]).xpath,
            "t:A/t:ref/@xlink:href_derived_count"
        );
    }

    #[test]
    fn unparsable_derived_values_are_null() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linked.xml");
        fs::write(&path, r#"<doc><count>many</count><name>Lake</name></doc>"#).unwrap();
        let conf = XLinkResolutionConf {
            url_specific_rules: vec![rule(
                &dir.path().to_string_lossy(),
                ResolutionMode::FieldsFromXPath,
                vec![
                    DerivedField {
                        name: "count".into(),
                        field_type: "integer".into(),
                        xpath: "doc/count".into(),
                    },
                    DerivedField {
                        name: "name".into(),
                        field_type: "string".into(),
                        xpath: "doc/name".into(),
                    },
                ],
            )],
            ..Default::default()
        };
        let mut resolver = XLinkResolver::new(&conf);
        let values = resolver.resolve(&href_field(), &path.to_string_lossy());
        assert_eq!(
            values,
            [
                ("ref_count".to_string(), Value::Null),
                ("ref_name".to_string(), Value::String("Lake".into())),
            ]
        );
        assert_eq!(resolver.notes().len(), 1);
        assert!(resolver.notes()[0].contains("\"many\""));
    }

    #[test]
    fn internal_links_have_no_rule() {
        let conf = XLinkResolutionConf {
            default_resolution: Some(XLinkRule::default()),
            ..Default::default()
        };
        let resolver = XLinkResolver::new(&conf);
        assert!(resolver.rule_for("#a1").is_none());
        assert!(resolver.rule_for("http://x/").is_some());
        assert!(is_internal("#a1"));
    }
}
