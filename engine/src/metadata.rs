//! Table layout of a model and the metadata tables describing it.
//!
//! The reader records the model it used in four tables next to the data; the writer rebuilds the
//! model from them, so a store can be written back without the original schemas.

use std::collections::HashMap;

use relmap_xsd::MaxOccurs;
use tracing::debug;

use crate::{
    model::{
        ClassId, FeatureClass, Field, FieldCategory, FieldType, GeometryType, NamespaceInfo,
        SchemaModel,
    },
    storage::{ColumnDef, Row, Storage, StorageError, TableDef, Value},
};

pub const LAYERS_METADATA: &str = "_layers_metadata";
pub const FIELDS_METADATA: &str = "_fields_metadata";
pub const LAYER_RELATIONSHIPS: &str = "_layer_relationships";
pub const OTHER_METADATA: &str = "_other_metadata";

pub const METADATA_TABLES: [&str; 4] = [
    LAYERS_METADATA,
    FIELDS_METADATA,
    LAYER_RELATIONSHIPS,
    OTHER_METADATA,
];

const GENERATED_PKID: &str = "pkid";
pub const PARENT_PKID: &str = "parent_pkid";
pub const OCCURRENCE: &str = "occurrence";
pub const CHILD_PKID: &str = "child_pkid";
const UNBOUNDED: i64 = i32::MAX as i64;

/// Key columns of one table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerKeys {
    /// `None` for junction tables
    pub pkid: Option<String>,
    /// Whether the key is generated rather than taken from an ID attribute
    pub generated: bool,
    pub parent_pkid: Option<String>,
}

/// Key columns of every table of a model, indexed by class.
#[derive(Clone, Debug, Default)]
pub struct Layout {
    keys: Vec<LayerKeys>,
}

impl Layout {
    pub fn new(model: &SchemaModel, always_generate_pkid: bool) -> Self {
        let mut keys = vec![
            LayerKeys {
                pkid: None,
                generated: false,
                parent_pkid: None,
            };
            model.len()
        ];
        for id in model.classes() {
            let class = model.class(id);
            if class.is_junction_table {
                keys[id.0].parent_pkid = Some(PARENT_PKID.into());
                continue;
            }
            let id_field = class.id_field().filter(|_| !always_generate_pkid);
            keys[id.0] = LayerKeys {
                pkid: Some(id_field.map_or(GENERATED_PKID.into(), |f| f.name.clone())),
                generated: id_field.is_none(),
                parent_pkid: class.parent.map(|_| PARENT_PKID.into()),
            };
        }
        Self { keys }
    }

    pub fn keys(&self, id: ClassId) -> &LayerKeys {
        &self.keys[id.0]
    }

    /// The primary key column of `id`, empty for junction tables.
    pub fn pkid(&self, id: ClassId) -> &str {
        self.keys[id.0].pkid.as_deref().unwrap_or_default()
    }

    /// The table storing the rows of class `id`.
    pub fn table_def(
        &self,
        model: &SchemaModel,
        id: ClassId,
        include_geometry_xml: bool,
    ) -> TableDef {
        let class = model.class(id);
        let keys = self.keys(id);
        if class.is_junction_table {
            let mut occurrence = ColumnDef::new(OCCURRENCE, FieldType::Int32);
            occurrence.nullable = false;
            return TableDef {
                name: class.name.clone(),
                columns: vec![
                    occurrence,
                    ColumnDef::new(PARENT_PKID, FieldType::String),
                    ColumnDef::new(CHILD_PKID, FieldType::String),
                ],
                primary_key: None,
            };
        }

        let mut columns = Vec::new();
        if let Some(pkid) = &keys.pkid {
            let field_type = if keys.generated {
                FieldType::String
            } else {
                FieldType::Id
            };
            let mut column = ColumnDef::new(pkid.clone(), field_type);
            column.nullable = false;
            columns.push(column);
        }
        if let Some(parent) = &keys.parent_pkid {
            columns.push(ColumnDef::new(parent.clone(), FieldType::String));
        }
        for field in &class.fields {
            if field.ignored || !field.category.has_column() {
                continue;
            }
            if !keys.generated && keys.pkid.as_deref() == Some(field.name.as_str()) {
                continue;
            }
            if field.category == FieldCategory::PathToChildElementWithLink {
                columns.push(ColumnDef::new(field.name.clone(), FieldType::String));
                continue;
            }
            columns.push(ColumnDef {
                name: field.name.clone(),
                field_type: field.field_type,
                is_array: field.is_array || field.is_list,
                nullable: !field.not_nullable,
            });
            if field.is_geometry() && include_geometry_xml {
                columns.push(ColumnDef::new(format!("{}_xml", field.name), FieldType::String));
            }
        }
        TableDef {
            name: class.name.clone(),
            columns,
            primary_key: keys.pkid.clone(),
        }
    }
}

fn string(value: impl Into<String>) -> Value {
    Value::String(value.into())
}

fn optional(value: Option<&str>) -> Value {
    value.map_or(Value::Null, string)
}

fn row<const N: usize>(cells: [(&str, Value); N]) -> Row {
    let mut row = Row::new();
    for (column, value) in cells {
        row.set(column, value);
    }
    row
}

fn table(name: &str, columns: &[(&str, FieldType)]) -> TableDef {
    TableDef {
        name: name.into(),
        columns: columns
            .iter()
            .map(|(name, field_type)| ColumnDef::new(*name, *field_type))
            .collect(),
        primary_key: None,
    }
}

/// The `layer_category` of `class` in the layers metadata.
pub fn layer_category(class: &FeatureClass) -> &'static str {
    if class.is_junction_table {
        "JUNCTION_TABLE"
    } else if class.parent.is_none() {
        "TOP_LEVEL_ELEMENT"
    } else {
        "NESTED_ELEMENT"
    }
}

/// Creates the metadata tables and fills them with the description of `model`.
pub fn write_metadata(
    storage: &mut dyn Storage,
    model: &SchemaModel,
    layout: &Layout,
) -> Result<(), StorageError> {
    use FieldType::{Boolean, Int32, String as Text};

    storage.create_table(table(
        LAYERS_METADATA,
        &[
            ("layer_name", Text),
            ("layer_xpath", Text),
            ("layer_category", Text),
            ("layer_documentation", Text),
            ("layer_pkid_name", Text),
            ("layer_parent_pkid_name", Text),
            ("layer_is_repeated_sequence", Boolean),
        ],
    ))?;
    storage.create_table(table(
        FIELDS_METADATA,
        &[
            ("layer_name", Text),
            ("field_index", Int32),
            ("field_name", Text),
            ("field_xpath", Text),
            ("field_alternative_xpath", Text),
            ("field_type", Text),
            ("field_geometry_type", Text),
            ("field_width", Int32),
            ("field_is_list", Boolean),
            ("field_is_array", Boolean),
            ("field_not_nullable", Boolean),
            ("field_ignored", Boolean),
            ("field_min_occurs", Int32),
            ("field_max_occurs", Int32),
            ("field_repetition_on_sequence", Boolean),
            ("field_default_value", Text),
            ("field_fixed_value", Text),
            ("field_category", Text),
            ("field_related_layer", Text),
            ("field_junction_layer", Text),
            ("field_documentation", Text),
        ],
    ))?;
    storage.create_table(table(
        LAYER_RELATIONSHIPS,
        &[
            ("parent_layer", Text),
            ("parent_pkid", Text),
            ("parent_element_name", Text),
            ("child_layer", Text),
            ("child_pkid", Text),
        ],
    ))?;
    storage.create_table(table(OTHER_METADATA, &[("key", Text), ("value", Text)]))?;

    let name_of = |xpath: &Option<String>| {
        xpath
            .as_deref()
            .and_then(|x| model.find_by_xpath(x))
            .map(|id| model.class(id).name.clone())
    };

    for id in model.classes() {
        let class = model.class(id);
        let keys = layout.keys(id);
        storage.insert(
            LAYERS_METADATA,
            row([
                ("layer_name", string(&class.name)),
                ("layer_xpath", string(&class.xpath)),
                ("layer_category", string(layer_category(class))),
                ("layer_documentation", string(&class.documentation)),
                ("layer_pkid_name", optional(keys.pkid.as_deref())),
                ("layer_parent_pkid_name", optional(keys.parent_pkid.as_deref())),
                (
                    "layer_is_repeated_sequence",
                    Value::Boolean(class.is_repeated_sequence),
                ),
            ]),
        )?;

        for (index, field) in class.fields.iter().enumerate() {
            let related = name_of(&field.related_class_xpath);
            let max_occurs = match field.max_occurs {
                MaxOccurs::Unbounded => UNBOUNDED,
                MaxOccurs::Count(n) => i64::try_from(n).unwrap_or(UNBOUNDED),
            };
            storage.insert(
                FIELDS_METADATA,
                row([
                    ("layer_name", string(&class.name)),
                    ("field_index", Value::Integer(index as i64 + 1)),
                    ("field_name", string(&field.name)),
                    ("field_xpath", string(&field.xpath)),
                    (
                        "field_alternative_xpath",
                        if field.alternate_xpaths.is_empty() {
                            Value::Null
                        } else {
                            string(field.alternate_xpaths.join(","))
                        },
                    ),
                    ("field_type", string(&field.type_name)),
                    (
                        "field_geometry_type",
                        optional(field.geometry_type.map(GeometryType::as_str)),
                    ),
                    (
                        "field_width",
                        field
                            .width
                            .and_then(|w| i64::try_from(w).ok())
                            .map_or(Value::Null, Value::Integer),
                    ),
                    ("field_is_list", Value::Boolean(field.is_list)),
                    ("field_is_array", Value::Boolean(field.is_array)),
                    ("field_not_nullable", Value::Boolean(field.not_nullable)),
                    ("field_ignored", Value::Boolean(field.ignored)),
                    (
                        "field_min_occurs",
                        Value::Integer(i64::try_from(field.min_occurs).unwrap_or(UNBOUNDED)),
                    ),
                    ("field_max_occurs", Value::Integer(max_occurs)),
                    (
                        "field_repetition_on_sequence",
                        Value::Boolean(field.repetition_on_sequence),
                    ),
                    ("field_default_value", optional(field.default_value.as_deref())),
                    ("field_fixed_value", optional(field.fixed_value.as_deref())),
                    ("field_category", string(field.category.as_str())),
                    ("field_related_layer", optional(related.as_deref())),
                    ("field_junction_layer", optional(field.junction_layer.as_deref())),
                    ("field_documentation", string(&field.documentation)),
                ]),
            )?;

            let Some(child) = related.and_then(|name| model.find_by_name(&name)) else {
                continue;
            };
            let child_pkid = match field.category {
                FieldCategory::PathToChildElementNoLink | FieldCategory::Group => {
                    layout.keys(child).parent_pkid.clone()
                }
                FieldCategory::PathToChildElementWithLink
                | FieldCategory::PathToChildElementWithJunctionTable => {
                    layout.keys(child).pkid.clone()
                }
                FieldCategory::Regular => None,
            };
            storage.insert(
                LAYER_RELATIONSHIPS,
                row([
                    ("parent_layer", string(&class.name)),
                    ("parent_pkid", optional(keys.pkid.as_deref())),
                    ("parent_element_name", string(&field.name)),
                    ("child_layer", string(&model.class(child).name)),
                    ("child_pkid", optional(child_pkid.as_deref())),
                ]),
            )?;
        }
    }

    let mut other = Vec::new();
    for (i, namespace) in model.namespaces.iter().enumerate() {
        let n = i + 1;
        other.push((format!("namespace_uri_{n}"), namespace.uri.clone()));
        other.push((format!("namespace_prefix_{n}"), namespace.prefix.clone()));
        if let Some(location) = &namespace.location {
            other.push((format!("namespace_location_{n}"), location.clone()));
        }
    }
    if let Some(version) = &model.gml_version {
        other.push(("gml_version".into(), version.clone()));
    }
    for (key, value) in other {
        storage.insert(OTHER_METADATA, row([("key", string(key)), ("value", string(value))]))?;
    }
    debug!("Wrote metadata of {} layers", model.len());
    Ok(())
}

/// Rebuilds the model and its layout from the metadata tables of `storage`.
pub fn read_model(storage: &dyn Storage) -> Result<(SchemaModel, Layout), StorageError> {
    let corrupt = |what: String| StorageError::Corrupt(what);
    let text = |row: &Row, column: &str| row.get_str(column).map(str::to_string);
    let flag = |row: &Row, column: &str| matches!(row.get(column), Some(Value::Boolean(true)));
    let integer = |row: &Row, column: &str| match row.get(column) {
        Some(Value::Integer(i)) => Some(*i),
        _ => None,
    };

    let mut namespaces: Vec<NamespaceInfo> = Vec::new();
    let mut gml_version = None;
    let mut other = HashMap::new();
    for entry in storage.rows(OTHER_METADATA)? {
        if let (Some(key), Some(value)) = (text(&entry, "key"), text(&entry, "value")) {
            other.insert(key, value);
        }
    }
    for n in 1.. {
        let Some(uri) = other.get(&format!("namespace_uri_{n}")) else {
            break;
        };
        namespaces.push(NamespaceInfo {
            uri: uri.clone(),
            prefix: other
                .get(&format!("namespace_prefix_{n}"))
                .cloned()
                .unwrap_or_default(),
            location: other.get(&format!("namespace_location_{n}")).cloned(),
        });
    }
    if let Some(version) = other.get("gml_version") {
        gml_version = Some(version.clone());
    }

    let relationships = storage.rows(LAYER_RELATIONSHIPS)?;
    let mut fields_by_layer: HashMap<String, Vec<Row>> = HashMap::new();
    for field in storage.rows(FIELDS_METADATA)? {
        let layer = text(&field, "layer_name").ok_or_else(|| corrupt("field without layer".into()))?;
        fields_by_layer.entry(layer).or_default().push(field);
    }

    let layers = storage.rows(LAYERS_METADATA)?;
    let mut xpath_of: HashMap<String, String> = HashMap::new();
    for layer in &layers {
        if let (Some(name), Some(xpath)) = (text(layer, "layer_name"), text(layer, "layer_xpath")) {
            xpath_of.insert(name, xpath);
        }
    }

    let mut model = SchemaModel::new(namespaces, gml_version);
    let mut keys = Vec::new();
    for layer in &layers {
        let name = text(layer, "layer_name").ok_or_else(|| corrupt("layer without name".into()))?;
        let xpath = xpath_of.get(&name).cloned().unwrap_or_default();
        let category = text(layer, "layer_category").unwrap_or_default();
        let is_junction = category == "JUNCTION_TABLE";
        let parent = if category == "NESTED_ELEMENT" {
            let parent_name = relationships
                .iter()
                .find(|r| {
                    r.get_str("child_layer") == Some(name.as_str())
                        && r.get_str("child_pkid") == layer.get_str("layer_parent_pkid_name")
                })
                .and_then(|r| r.get_str("parent_layer"))
                .ok_or_else(|| corrupt(format!("no parent for nested layer {name}")))?;
            Some(
                model
                    .find_by_name(parent_name)
                    .ok_or_else(|| corrupt(format!("parent {parent_name} of {name} not yet defined")))?,
            )
        } else {
            None
        };

        let mut fields = Vec::new();
        for row in fields_by_layer.remove(&name).unwrap_or_default() {
            let field_name = text(&row, "field_name").unwrap_or_default();
            let category = text(&row, "field_category")
                .and_then(|c| FieldCategory::parse(&c))
                .ok_or_else(|| corrupt(format!("bad category for field {field_name} of {name}")))?;
            let mut field = Field::new(field_name, text(&row, "field_xpath").unwrap_or_default(), category);
            let type_name = text(&row, "field_type").unwrap_or_else(|| "string".into());
            field.set_type(FieldType::from_xsd_name(&type_name), type_name);
            field.geometry_type =
                text(&row, "field_geometry_type").map(|g| GeometryType::parse(&g));
            field.width = integer(&row, "field_width").and_then(|w| u64::try_from(w).ok());
            field.alternate_xpaths = text(&row, "field_alternative_xpath")
                .map(|x| x.split(',').map(str::to_string).collect())
                .unwrap_or_default();
            field.is_list = flag(&row, "field_is_list");
            field.is_array = flag(&row, "field_is_array");
            field.not_nullable = flag(&row, "field_not_nullable");
            field.ignored = flag(&row, "field_ignored");
            field.min_occurs = integer(&row, "field_min_occurs")
                .and_then(|n| u64::try_from(n).ok())
                .unwrap_or(0);
            field.max_occurs = match integer(&row, "field_max_occurs") {
                Some(UNBOUNDED) => MaxOccurs::Unbounded,
                Some(n) => MaxOccurs::Count(u64::try_from(n).unwrap_or(1)),
                None => MaxOccurs::Count(1),
            };
            field.repetition_on_sequence = flag(&row, "field_repetition_on_sequence");
            field.default_value = text(&row, "field_default_value");
            field.fixed_value = text(&row, "field_fixed_value");
            field.related_class_xpath = text(&row, "field_related_layer")
                .and_then(|layer| xpath_of.get(&layer).cloned());
            field.junction_layer = text(&row, "field_junction_layer");
            if let Some(junction) = field.junction_layer.as_ref().and_then(|j| xpath_of.get(j)) {
                field.abstract_element_xpath =
                    junction.split_once('|').map(|(element, _)| element.to_string());
            }
            field.documentation = text(&row, "field_documentation").unwrap_or_default();
            fields.push(field);
        }

        let (parent_xpath, child_xpath) = if is_junction {
            match xpath.split_once('|') {
                Some((element, child)) => (
                    element.rsplit_once('/').map(|(owner, _)| owner.to_string()),
                    Some(child.to_string()),
                ),
                None => (None, None),
            }
        } else {
            (None, None)
        };
        let class = FeatureClass {
            name,
            is_group: xpath.contains(";extra=") && !xpath.ends_with(";extra=sequence"),
            xpath,
            fields,
            is_repeated_sequence: flag(layer, "layer_is_repeated_sequence"),
            is_junction_table: is_junction,
            is_top_level: category == "TOP_LEVEL_ELEMENT",
            parent_xpath,
            child_xpath,
            documentation: text(layer, "layer_documentation").unwrap_or_default(),
            ..Default::default()
        };
        let pkid = text(layer, "layer_pkid_name");
        keys.push(LayerKeys {
            generated: pkid.is_some() && !class.fields.iter().any(|f| Some(&f.name) == pkid.as_ref()),
            pkid,
            parent_pkid: text(layer, "layer_parent_pkid_name"),
        });
        model.add_class(class, parent);
    }
    Ok((model, Layout { keys }))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::storage::MemoryStore;

    fn sample_model() -> SchemaModel {
        let mut model = SchemaModel::new(
            vec![NamespaceInfo {
                uri: "urn:t".into(),
                prefix: "t".into(),
                location: Some("main.xsd".into()),
            }],
            None,
        );
        let mut id = Field::new("id", "t:Root/@id", FieldCategory::Regular);
        id.set_type(FieldType::Id, "ID");
        id.not_nullable = true;
        id.min_occurs = 1;
        let mut items = Field::new("Item", "t:Root/t:Item", FieldCategory::PathToChildElementNoLink);
        items.max_occurs = MaxOccurs::Unbounded;
        items.related_class_xpath = Some("t:Root/t:Item".into());
        let root = model.add_class(
            FeatureClass {
                name: "Root".into(),
                xpath: "t:Root".into(),
                fields: vec![id, items],
                is_top_level: true,
                ..Default::default()
            },
            None,
        );
        let mut tags = Field::new("Name", "t:Root/t:Item/t:Name", FieldCategory::Regular);
        tags.is_array = true;
        tags.max_occurs = MaxOccurs::Unbounded;
        model.add_class(
            FeatureClass {
                name: "Item".into(),
                xpath: "t:Root/t:Item".into(),
                fields: vec![tags],
                ..Default::default()
            },
            Some(root),
        );
        model
    }

    #[test]
    fn layout_of_tables() {
        let model = sample_model();
        let layout = Layout::new(&model, false);
        let root = model.find_by_name("Root").unwrap();
        let item = model.find_by_name("Item").unwrap();
        assert_eq!(layout.pkid(root), "id");
        assert_eq!(layout.pkid(item), "pkid");
        let names = |def: TableDef| def.columns.into_iter().map(|c| c.name).collect::<Vec<_>>();
        assert_eq!(names(layout.table_def(&model, root, false)), ["id"]);
        assert_eq!(names(layout.table_def(&model, item, false)), ["pkid", "parent_pkid", "Name"]);
        assert!(layout.table_def(&model, item, false).columns[2].is_array);

        let generated = Layout::new(&model, true);
        assert_eq!(names(generated.table_def(&model, root, false)), ["pkid", "id"]);
    }

    #[test]
    fn model_survives_metadata_tables() {
        let model = sample_model();
        let layout = Layout::new(&model, false);
        let mut store = MemoryStore::new();
        write_metadata(&mut store, &model, &layout).unwrap();
        assert_eq!(store.row_count(FIELDS_METADATA), 3);
        assert_eq!(store.row_count(LAYER_RELATIONSHIPS), 1);

        let (read, read_layout) = read_model(&store).unwrap();
        assert_eq!(read.len(), 2);
        let root = read.find_by_name("Root").unwrap();
        let item = read.find_by_name("Item").unwrap();
        assert_eq!(read.class(item).parent, Some(root));
        assert_eq!(read.class(root).fields[1].related_class_xpath.as_deref(), Some("t:Root/t:Item"));
        assert_eq!(read.class(root).fields[1].max_occurs, MaxOccurs::Unbounded);
        assert!(read.class(item).fields[0].is_array);
        assert_eq!(read.class(root).id_field().map(|f| f.name.as_str()), Some("id"));
        assert_eq!(read_layout.keys(root), layout.keys(root));
        assert_eq!(read_layout.keys(item), layout.keys(item));
        assert_eq!(read.prefix_of("urn:t"), Some("t"));
        assert_eq!(read.namespaces[0].location.as_deref(), Some("main.xsd"));
    }
}
