use crate::{error::XsdError, xstypes::QName};
use roxmltree::Node;

pub trait ActualValue<'a>: Sized {
    fn convert(src: &'a str, parent: Node) -> Result<Self, XsdError>;
}

impl<'a> ActualValue<'a> for &'a str {
    fn convert(src: &'a str, _parent: Node) -> Result<Self, XsdError> {
        Ok(src)
    }
}

impl ActualValue<'_> for String {
    fn convert(src: &'_ str, _parent: Node) -> Result<Self, XsdError> {
        Ok(src.to_string())
    }
}

impl ActualValue<'_> for QName {
    fn convert(src: &'_ str, parent: Node) -> Result<Self, XsdError> {
        QName::parse(src.trim(), parent)
    }
}

impl<'a, T: ActualValue<'a>> ActualValue<'a> for Vec<T> {
    fn convert(src: &'a str, parent: Node) -> Result<Self, XsdError> {
        // NOTE: This assumes a list with whiteSpace="collapse"
        src.split_ascii_whitespace()
            .map(|a| ActualValue::convert(a, parent))
            .collect()
    }
}

impl ActualValue<'_> for bool {
    fn convert(src: &str, _parent: Node) -> Result<Self, XsdError> {
        match src.trim() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(XsdError::InvalidValue {
                what: "boolean",
                value: src.into(),
            }),
        }
    }
}

impl ActualValue<'_> for u64 {
    fn convert(src: &str, _parent: Node) -> Result<Self, XsdError> {
        src.trim().parse().map_err(|_| XsdError::InvalidValue {
            what: "nonNegativeInteger",
            value: src.into(),
        })
    }
}

pub fn actual_value<'a, T: ActualValue<'a>>(x: &'a str, parent: Node) -> Result<T, XsdError> {
    T::convert(x, parent)
}

/// Reads an optional attribute and converts it to its ·actual value·.
pub fn attribute_value<'a, T: ActualValue<'a>>(
    node: Node<'a, '_>,
    name: &str,
) -> Result<Option<T>, XsdError> {
    node.attribute(name)
        .map(|v| actual_value(v, node))
        .transpose()
}
