//! The relational model derived from a schema: classes (tables) and their fields (columns and
//! relationships).

use std::collections::HashMap;

use relmap_xsd::MaxOccurs;

/// Primitive type of a field, named after the XSD built-in it comes from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FieldType {
    String,
    Id,
    Boolean,
    Short,
    Int32,
    Int64,
    Float,
    Double,
    Decimal,
    Date,
    GYear,
    GYearMonth,
    Time,
    DateTime,
    Base64Binary,
    HexBinary,
    AnyUri,
    AnyType,
    AnySimpleType,
    Geometry,
}

impl FieldType {
    const NAMES: [(FieldType, &'static str); 20] = [
        (Self::String, "string"),
        (Self::Id, "ID"),
        (Self::Boolean, "boolean"),
        (Self::Short, "short"),
        (Self::Int32, "int"),
        (Self::Int64, "long"),
        (Self::Float, "float"),
        (Self::Double, "double"),
        (Self::Decimal, "decimal"),
        (Self::Date, "date"),
        (Self::GYear, "gYear"),
        (Self::GYearMonth, "gYearMonth"),
        (Self::Time, "time"),
        (Self::DateTime, "dateTime"),
        (Self::Base64Binary, "base64Binary"),
        (Self::HexBinary, "hexBinary"),
        (Self::AnyUri, "anyURI"),
        (Self::AnyType, "anyType"),
        (Self::AnySimpleType, "anySimpleType"),
        (Self::Geometry, "geometry"),
    ];

    /// The field type for the name of an XSD built-in type. Unknown names map to
    /// [`FieldType::String`].
    pub fn from_xsd_name(name: &str) -> Self {
        match name {
            "int" | "byte" | "unsignedByte" | "unsignedShort" => Self::Int32,
            "long" | "unsignedInt" | "unsignedLong" | "integer" | "negativeInteger"
            | "nonNegativeInteger" | "nonPositiveInteger" | "positiveInteger" => Self::Int64,
            _ => Self::NAMES
                .iter()
                .find(|(_, n)| *n == name)
                .map_or(Self::String, |(t, _)| *t),
        }
    }

    pub fn as_str(self) -> &'static str {
        Self::NAMES
            .iter()
            .find(|(t, _)| *t == self)
            .map_or("string", |(_, n)| n)
    }

    /// Whether repeated values of this type can be stored in a single array column.
    pub fn is_array_compatible(self) -> bool {
        matches!(
            self,
            Self::String
                | Self::Boolean
                | Self::Short
                | Self::Int32
                | Self::Int64
                | Self::Float
                | Self::Double
                | Self::Decimal
                | Self::AnyUri
        )
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Self::Short | Self::Int32 | Self::Int64)
    }

    pub fn is_real(self) -> bool {
        matches!(self, Self::Float | Self::Double | Self::Decimal)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum GeometryType {
    Unknown,
    Point,
    LineString,
    Polygon,
    MultiPoint,
    MultiLineString,
    MultiPolygon,
    GeometryCollection,
    Curve,
    Surface,
    MultiCurve,
    MultiSurface,
}

impl GeometryType {
    /// The geometry type carried by a GML property type, or `None` when `type_name` is not one.
    pub fn from_gml_property_type(type_name: &str) -> Option<Self> {
        Some(match type_name {
            "GeometryPropertyType" => Self::Unknown,
            "PointPropertyType" => Self::Point,
            "PolygonPropertyType" => Self::Polygon,
            "LineStringPropertyType" => Self::LineString,
            "MultiPointPropertyType" => Self::MultiPoint,
            "MultiPolygonPropertyType" => Self::MultiPolygon,
            "MultiLineStringPropertyType" => Self::MultiLineString,
            "MultiGeometryPropertyType" => Self::GeometryCollection,
            "MultiCurvePropertyType" => Self::MultiCurve,
            "MultiSurfacePropertyType" => Self::MultiSurface,
            "MultiSolidPropertyType" => Self::Unknown,
            "CurvePropertyType" | "CompositeCurvePropertyType" => Self::Curve,
            "SurfacePropertyType" | "CompositeSurfacePropertyType" => Self::Surface,
            "CompositeSolidPropertyType" | "GeometricComplexPropertyType" => Self::Unknown,
            _ => return None,
        })
    }

    pub fn parse(s: &str) -> Self {
        [
            Self::Point,
            Self::LineString,
            Self::Polygon,
            Self::MultiPoint,
            Self::MultiLineString,
            Self::MultiPolygon,
            Self::GeometryCollection,
            Self::Curve,
            Self::Surface,
            Self::MultiCurve,
            Self::MultiSurface,
        ]
        .into_iter()
        .find(|g| g.as_str() == s)
        .unwrap_or(Self::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "Geometry",
            Self::Point => "Point",
            Self::LineString => "LineString",
            Self::Polygon => "Polygon",
            Self::MultiPoint => "MultiPoint",
            Self::MultiLineString => "MultiLineString",
            Self::MultiPolygon => "MultiPolygon",
            Self::GeometryCollection => "GeometryCollection",
            Self::Curve => "Curve",
            Self::Surface => "Surface",
            Self::MultiCurve => "MultiCurve",
            Self::MultiSurface => "MultiSurface",
        }
    }
}

/// How a field maps onto the relational model.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FieldCategory {
    /// A column holding the value of an attribute or of a simple element
    Regular,
    /// Child rows in a nested layer point back to this row
    PathToChildElementNoLink,
    /// A column holding the key of a row of another (top-level) layer
    PathToChildElementWithLink,
    /// Rows of a junction layer link this row to rows of another layer
    PathToChildElementWithJunctionTable,
    /// Rows of a nested group layer hold the repeated content of a model group
    Group,
}

impl FieldCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "REGULAR",
            Self::PathToChildElementNoLink => "PATH_TO_CHILD_ELEMENT_NO_LINK",
            Self::PathToChildElementWithLink => "PATH_TO_CHILD_ELEMENT_WITH_LINK",
            Self::PathToChildElementWithJunctionTable => {
                "PATH_TO_CHILD_ELEMENT_WITH_JUNCTION_TABLE"
            }
            Self::Group => "GROUP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            Self::Regular,
            Self::PathToChildElementNoLink,
            Self::PathToChildElementWithLink,
            Self::PathToChildElementWithJunctionTable,
            Self::Group,
        ]
        .into_iter()
        .find(|c| c.as_str() == s)
    }

    /// Whether the field is stored as a column of its layer.
    pub fn has_column(self) -> bool {
        matches!(self, Self::Regular | Self::PathToChildElementWithLink)
    }
}

#[derive(Clone, Debug)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub geometry_type: Option<GeometryType>,
    /// Name of the XSD type the field type was derived from
    pub type_name: String,
    pub width: Option<u64>,
    pub not_nullable: bool,
    pub xpath: String,
    /// Other element paths stored in this field, for substitution group members
    pub alternate_xpaths: Vec<String>,
    pub min_occurs: u64,
    pub max_occurs: MaxOccurs,
    pub is_array: bool,
    pub is_list: bool,
    pub fixed_value: Option<String>,
    pub default_value: Option<String>,
    pub category: FieldCategory,
    pub repetition_on_sequence: bool,
    /// Store the whole element, not only its content
    pub include_this_element_in_blob: bool,
    pub abstract_element_xpath: Option<String>,
    pub related_class_xpath: Option<String>,
    pub junction_layer: Option<String>,
    pub ignored: bool,
    pub documentation: String,
    pub may_appear_out_of_order: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, xpath: impl Into<String>, category: FieldCategory) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::String,
            geometry_type: None,
            type_name: "string".into(),
            width: None,
            not_nullable: false,
            xpath: xpath.into(),
            alternate_xpaths: Vec::new(),
            min_occurs: 0,
            max_occurs: MaxOccurs::Count(1),
            is_array: false,
            is_list: false,
            fixed_value: None,
            default_value: None,
            category,
            repetition_on_sequence: false,
            include_this_element_in_blob: false,
            abstract_element_xpath: None,
            related_class_xpath: None,
            junction_layer: None,
            ignored: false,
            documentation: String::new(),
            may_appear_out_of_order: false,
        }
    }

    pub fn set_type(&mut self, field_type: FieldType, type_name: impl Into<String>) {
        self.field_type = field_type;
        self.type_name = type_name.into();
    }

    /// Whether the field designates an attribute.
    pub fn is_attribute(&self) -> bool {
        self.xpath
            .rsplit('/')
            .next()
            .is_some_and(|last| last.starts_with('@'))
    }

    pub fn is_geometry(&self) -> bool {
        self.field_type == FieldType::Geometry
    }
}

/// Stable index of a class in a [`SchemaModel`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub usize);

/// One table of the relational model.
#[derive(Clone, Debug, Default)]
pub struct FeatureClass {
    pub name: String,
    /// Path of the element the class models. Classes of repeated sequences and groups carry an
    /// `;extra=` suffix, junction classes `parent_element|child_element`.
    pub xpath: String,
    pub fields: Vec<Field>,
    pub nested: Vec<ClassId>,
    pub parent: Option<ClassId>,
    pub is_repeated_sequence: bool,
    pub is_group: bool,
    pub is_junction_table: bool,
    /// Whether the element is a global declaration
    pub is_top_level: bool,
    pub parent_xpath: Option<String>,
    pub child_xpath: Option<String>,
    pub documentation: String,
}

impl FeatureClass {
    /// The element path without the `;extra=` marker.
    pub fn element_xpath(&self) -> &str {
        strip_extra(&self.xpath)
    }

    /// The required ID-typed attribute of the element itself, used as primary key.
    pub fn id_field(&self) -> Option<&Field> {
        let prefix = format!("{}/@", self.xpath);
        self.fields.iter().find(|f| {
            f.field_type == FieldType::Id
                && f.category == FieldCategory::Regular
                && f.not_nullable
                && f.xpath
                    .strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.contains('/'))
        })
    }

    pub fn field_by_xpath(&self, xpath: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.xpath == xpath)
    }
}

/// Removes the `;extra=...` marker of group and sequence class paths.
pub fn strip_extra(xpath: &str) -> &str {
    xpath.split_once(";extra=").map_or(xpath, |(p, _)| p)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceInfo {
    pub uri: String,
    pub prefix: String,
    /// Location of the schema the namespace was requested from
    pub location: Option<String>,
}

/// The relational model: an arena of classes plus the namespace bindings needed to build and
/// interpret element paths.
#[derive(Clone, Debug, Default)]
pub struct SchemaModel {
    classes: Vec<FeatureClass>,
    roots: Vec<ClassId>,
    /// Every namespace known to the model, in declaration order
    pub namespaces: Vec<NamespaceInfo>,
    pub gml_version: Option<String>,
    by_xpath: HashMap<String, ClassId>,
}

impl SchemaModel {
    pub fn new(namespaces: Vec<NamespaceInfo>, gml_version: Option<String>) -> Self {
        Self {
            namespaces,
            gml_version,
            ..Default::default()
        }
    }

    /// Adds a class, as a root when `parent` is `None`.
    pub fn add_class(&mut self, mut class: FeatureClass, parent: Option<ClassId>) -> ClassId {
        let id = ClassId(self.classes.len());
        class.parent = parent;
        self.by_xpath.entry(class.xpath.clone()).or_insert(id);
        self.classes.push(class);
        match parent {
            Some(p) => self.classes[p.0].nested.push(id),
            None => self.roots.push(id),
        }
        id
    }

    pub fn class(&self, id: ClassId) -> &FeatureClass {
        &self.classes[id.0]
    }

    pub fn class_mut(&mut self, id: ClassId) -> &mut FeatureClass {
        &mut self.classes[id.0]
    }

    /// Every class, depth first from the roots.
    pub fn classes(&self) -> Vec<ClassId> {
        let mut order = Vec::with_capacity(self.classes.len());
        let mut stack = self.roots.iter().rev().copied().collect::<Vec<_>>();
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.classes[id.0].nested.iter().rev().copied());
        }
        order
    }

    pub fn roots(&self) -> &[ClassId] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn find_by_xpath(&self, xpath: &str) -> Option<ClassId> {
        self.by_xpath.get(xpath).copied()
    }

    pub fn find_by_name(&self, name: &str) -> Option<ClassId> {
        self.classes
            .iter()
            .position(|c| c.name == name)
            .map(ClassId)
    }

    pub fn prefix_of(&self, uri: &str) -> Option<&str> {
        self.namespaces
            .iter()
            .find(|n| n.uri == uri)
            .map(|n| n.prefix.as_str())
    }

    pub fn uri_of(&self, prefix: &str) -> Option<&str> {
        self.namespaces
            .iter()
            .find(|n| n.prefix == prefix)
            .map(|n| n.uri.as_str())
    }

    pub fn uri_to_prefix(&self) -> HashMap<String, String> {
        self.namespaces
            .iter()
            .map(|n| (n.uri.clone(), n.prefix.clone()))
            .collect()
    }

    /// Drops the classes for which `keep` returns false, with their nested classes.
    pub fn retain(&mut self, mut keep: impl FnMut(ClassId, &FeatureClass) -> bool) {
        let mut dropped = vec![false; self.classes.len()];
        for id in self.classes() {
            let parent_dropped = self.classes[id.0].parent.is_some_and(|p| dropped[p.0]);
            dropped[id.0] = parent_dropped || !keep(id, &self.classes[id.0]);
        }
        let old = std::mem::take(&mut self.classes);
        let old_roots = std::mem::take(&mut self.roots);
        self.by_xpath.clear();
        let mut stack = old_roots.iter().rev().map(|r| (*r, None)).collect::<Vec<_>>();
        while let Some((id, parent)) = stack.pop() {
            if dropped[id.0] {
                continue;
            }
            let mut class = old[id.0].clone();
            let nested = std::mem::take(&mut class.nested);
            let new_id = self.add_class(class, parent);
            stack.extend(nested.iter().rev().map(|n| (*n, Some(new_id))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_names() {
        assert_eq!(FieldType::from_xsd_name("unsignedShort"), FieldType::Int32);
        assert_eq!(FieldType::from_xsd_name("positiveInteger"), FieldType::Int64);
        assert_eq!(FieldType::from_xsd_name("NCName"), FieldType::String);
        assert_eq!(FieldType::from_xsd_name("ID"), FieldType::Id);
        assert_eq!(FieldType::from_xsd_name("dateTime"), FieldType::DateTime);
        assert!(FieldType::AnyUri.is_array_compatible());
        assert!(!FieldType::Date.is_array_compatible());
    }

    #[test]
    fn arena_and_retain() {
        let mut model = SchemaModel::default();
        let root = model.add_class(
            FeatureClass {
                name: "Root".into(),
                xpath: "t:Root".into(),
                ..Default::default()
            },
            None,
        );
        let item = model.add_class(
            FeatureClass {
                name: "Item".into(),
                xpath: "t:Root/t:Item".into(),
                ..Default::default()
            },
            Some(root),
        );
        model.add_class(
            FeatureClass {
                name: "Other".into(),
                xpath: "t:Other".into(),
                ..Default::default()
            },
            None,
        );
        assert_eq!(model.class(root).nested, [item]);
        assert_eq!(model.find_by_xpath("t:Root/t:Item"), Some(item));
        assert_eq!(model.classes().len(), 3);

        model.retain(|_, c| c.name != "Root");
        assert_eq!(model.len(), 1);
        assert_eq!(model.class(model.roots()[0]).name, "Other");
        assert!(model.find_by_xpath("t:Root/t:Item").is_none());
    }

    #[test]
    fn class_paths() {
        assert_eq!(strip_extra("a:B;extra=sequence"), "a:B");
        let mut class = FeatureClass {
            xpath: "a:B".into(),
            ..Default::default()
        };
        let mut id = Field::new("id", "a:B/@gml:id", FieldCategory::Regular);
        id.set_type(FieldType::Id, "ID");
        id.not_nullable = true;
        class.fields.push(id);
        assert_eq!(class.id_field().map(|f| f.name.as_str()), Some("id"));
        assert!(class.fields[0].is_attribute());
    }
}
