use roxmltree::Node;

use super::{
    error::XsdError,
    values::attribute_value,
    MappingContext, Ref,
};

/// Schema Component: Wildcard, a kind of [Term](super::shared::Term) (§3.10)
#[derive(Clone, Debug)]
pub struct Wildcard {
    pub namespace_constraint: NamespaceConstraint,
    pub process_contents: ProcessContents,
}

/// Property Record: Namespace Constraint (§3.10)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NamespaceConstraint {
    Any,
    /// Any namespace except the listed ones (`None` is "no namespace").
    Not(Vec<Option<String>>),
    /// Exactly the listed namespaces (`None` is "no namespace").
    Enumeration(Vec<Option<String>>),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProcessContents {
    Skip,
    Strict,
    Lax,
}


impl Wildcard {
    pub const ANY_TAG_NAME: &'static str = "any";
    pub const ANY_ATTRIBUTE_TAG_NAME: &'static str = "anyAttribute";

    pub(super) fn map_from_xml(
        context: &mut MappingContext,
        wildcard: Node,
        schema: Node,
    ) -> Result<Ref<Self>, XsdError> {
        let target_namespace = schema.attribute("targetNamespace").map(str::to_string);

        // {namespace constraint}
        //   ##any (the default), ##other, or a list of URIs which may contain ##targetNamespace
        //   and ##local.
        let namespace = attribute_value::<&str>(wildcard, "namespace")?.unwrap_or("##any");
        let namespace_constraint = match namespace.trim() {
            "##any" => NamespaceConstraint::Any,
            "##other" => NamespaceConstraint::Not(vec![target_namespace, None]),
            list => NamespaceConstraint::Enumeration(
                list.split_ascii_whitespace()
                    .map(|uri| match uri {
                        "##targetNamespace" => target_namespace.clone(),
                        "##local" => None,
                        uri => Some(uri.to_string()),
                    })
                    .collect(),
            ),
        };

        // {process contents}
        //   The ·actual value· of the processContents [attribute], if present, otherwise strict.
        let process_contents = match attribute_value::<&str>(wildcard, "processContents")? {
            None | Some("strict") => ProcessContents::Strict,
            Some("lax") => ProcessContents::Lax,
            Some("skip") => ProcessContents::Skip,
            Some(other) => {
                return Err(XsdError::InvalidValue {
                    what: "processContents",
                    value: other.into(),
                })
            }
        };

        Ok(context.create(Self {
            namespace_constraint,
            process_contents,
        }))
    }

    /// Whether an element or attribute in `namespace` is allowed by this wildcard.
    pub fn allows_namespace(&self, namespace: Option<&str>) -> bool {
        match &self.namespace_constraint {
            NamespaceConstraint::Any => true,
            NamespaceConstraint::Not(excluded) => {
                !excluded.iter().any(|ns| ns.as_deref() == namespace)
            }
            NamespaceConstraint::Enumeration(allowed) => {
                allowed.iter().any(|ns| ns.as_deref() == namespace)
            }
        }
    }
}
