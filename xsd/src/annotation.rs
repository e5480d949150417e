use roxmltree::Node;

use super::xstypes::QName;

/// The content of the `<annotation>` children of a schema element.
///
/// This is not a schema component of its own; it is stored inline on the components that can
/// carry annotations.
#[derive(Clone, Debug, Default)]
pub struct Annotation {
    /// Text content of each `<documentation>` element, in document order.
    pub documentation: Vec<String>,
    /// Every element found directly below an `<appinfo>` element.
    pub app_info: Vec<AppInfoEntry>,
}

#[derive(Clone, Debug)]
pub struct AppInfoEntry {
    pub name: QName,
    pub text: String,
    /// The text content interpreted as a QName in the scope of the entry, if it is one.
    pub text_as_qname: Option<QName>,
}

impl Annotation {
    pub const TAG_NAME: &'static str = "annotation";

    /// Collects the annotations that are direct children of `element`.
    pub(super) fn map_from_xml(element: Node) -> Option<Self> {
        let mut annotation = Self::default();
        let mut found = false;
        for annot in element
            .children()
            .filter(|c| c.tag_name().name() == Self::TAG_NAME)
        {
            found = true;
            for child in annot.children().filter(Node::is_element) {
                match child.tag_name().name() {
                    "documentation" => {
                        let text = collect_text(child);
                        if !text.is_empty() {
                            annotation.documentation.push(text);
                        }
                    }
                    "appinfo" => {
                        for entry in child.children().filter(Node::is_element) {
                            let text = collect_text(entry);
                            annotation.app_info.push(AppInfoEntry {
                                name: QName::with_optional_namespace(
                                    entry.tag_name().namespace(),
                                    entry.tag_name().name(),
                                ),
                                text_as_qname: QName::parse(&text, entry).ok(),
                                text,
                            });
                        }
                    }
                    _ => {}
                }
            }
        }
        found.then_some(annotation)
    }

    /// All documentation strings joined by blank lines.
    pub fn documentation_text(&self) -> String {
        self.documentation.join("\n\n")
    }

    pub fn app_info_by_name(&self, namespace: &str, local_name: &str) -> Option<&AppInfoEntry> {
        self.app_info
            .iter()
            .find(|e| e.name.is(namespace, local_name))
    }
}

fn collect_text(node: Node) -> String {
    node.descendants()
        .filter(Node::is_text)
        .filter_map(|t| t.text())
        .collect::<String>()
        .trim()
        .to_string()
}
