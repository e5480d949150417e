//! Rebuilding of XML documents from the rows of a [`Storage`].
//!
//! The schema comes back from the metadata tables. Each top-level row that no other row refers
//! to becomes a member of a feature collection, with its child rows nested following the
//! relationships of the model.

use std::{
    collections::{HashMap, HashSet},
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
};

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use serde_json::{Map, Value as Json};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    conf::{Conf, LineFormat, SrsNameFormat, WriterConf, Wrapping},
    geometry::{parse_gml, to_gml32, GeometryError, GeometryValue, SwapCoordinates},
    metadata::{read_model, Layout, CHILD_PKID, OCCURRENCE, PARENT_PKID},
    model::{strip_extra, ClassId, FeatureClass, Field, FieldCategory, FieldType, SchemaModel},
    storage::{Row, Storage, StorageError, Value},
    xlink::is_resolved_field,
};

pub const WFS20_NAMESPACE: &str = "http://www.opengis.net/wfs/2.0";
pub const RELMAP_NAMESPACE: &str = "http://relmap.org/feature-collection";
const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";
const XS_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema";
/// Depth of nested rows beyond which the relationships are considered cyclic
const MAX_NESTING: usize = 100;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Xml(#[from] quick_xml::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error("rows of {0} are nested more than {MAX_NESTING} levels deep")]
    TooDeep(String),
}

/// Splits an element path in its element and attribute names, without `;extra=` markers.
fn components(xpath: &str) -> Vec<String> {
    strip_extra(xpath)
        .split('/')
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

// -- Element tree

#[derive(Debug, PartialEq)]
enum Node {
    Element(Element),
    Text(String),
    /// Already serialized content
    Markup(String),
}

#[derive(Debug, Default, PartialEq)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    fn set_attribute(&mut self, name: &str, value: String) {
        match self.attributes.iter_mut().find(|(n, _)| n == name) {
            Some(attribute) => attribute.1 = value,
            None => self.attributes.push((name.to_string(), value)),
        }
    }

    fn with_attribute(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_attribute(name, value.into());
        self
    }

    fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    fn start_tag(&self) -> BytesStart<'_> {
        BytesStart::new(self.name.as_str()).with_attributes(
            self.attributes
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str())),
        )
    }
}

/// The elements currently open, from the outermost one. Moving to a path closes the open
/// elements below the common prefix and opens the missing ones.
#[derive(Default)]
struct Cursor {
    root: Element,
    open: Vec<Element>,
}

impl Cursor {
    fn depth(&self) -> usize {
        self.open.len()
    }

    fn current(&mut self) -> &mut Element {
        match self.open.last_mut() {
            Some(element) => element,
            None => &mut self.root,
        }
    }

    fn close_to(&mut self, depth: usize) {
        while self.open.len() > depth {
            if let Some(element) = self.open.pop() {
                self.current().children.push(Node::Element(element));
            }
        }
    }

    fn move_to(&mut self, path: &[String]) {
        let common = self
            .open
            .iter()
            .zip(path)
            .take_while(|(element, name)| element.name == **name)
            .count();
        self.close_to(common);
        for name in &path[common..] {
            self.open.push(Element::new(name.clone()));
        }
    }

    /// Opens a new element for the last component of `path`, even if one is open already.
    fn open_new(&mut self, path: &[String]) {
        let Some((last, parent)) = path.split_last() else {
            return;
        };
        self.move_to(parent);
        self.open.push(Element::new(last.clone()));
    }

    fn finish(mut self) -> Vec<Node> {
        self.close_to(0);
        self.root.children
    }
}

/// Turns the line feeds written through it into `eol`.
struct LineEnds<W> {
    inner: W,
    eol: &'static str,
}

impl<W: Write> Write for LineEnds<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.eol == "\n" {
            self.inner.write_all(buf)?;
            return Ok(buf.len());
        }
        for (i, line) in buf.split(|&b| b == b'\n').enumerate() {
            if i > 0 {
                self.inner.write_all(self.eol.as_bytes())?;
            }
            self.inner.write_all(line)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Writes element trees, one element per line. Elements holding only text stay on one line.
struct Serializer<W: Write> {
    writer: quick_xml::Writer<LineEnds<W>>,
}

impl<W: Write> Serializer<W> {
    fn new(out: W, indentation: usize, eol: &'static str) -> Self {
        Self {
            writer: quick_xml::Writer::new_with_indent(
                LineEnds { inner: out, eol },
                b' ',
                indentation,
            ),
        }
    }

    fn declaration(&mut self) -> Result<(), quick_xml::Error> {
        self.writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
    }

    /// Opens `element`, whose children are written separately.
    fn start(&mut self, element: &Element) -> Result<(), quick_xml::Error> {
        self.writer.write_event(Event::Start(element.start_tag()))
    }

    fn end(&mut self, name: &str) -> Result<(), quick_xml::Error> {
        self.writer.write_event(Event::End(BytesEnd::new(name)))
    }

    /// Writes `text` as a comment, breaking up the `--` sequences it may hold.
    fn comment(&mut self, text: &str) -> Result<(), quick_xml::Error> {
        let mut text = text.to_string();
        while text.contains("--") {
            text = text.replace("--", "- -");
        }
        self.writer
            .write_event(Event::Comment(BytesText::from_escaped(format!(" {text} "))))
    }

    fn node(&mut self, node: &Node) -> Result<(), quick_xml::Error> {
        match node {
            Node::Element(element) => self.element(element),
            Node::Text(text) => self.writer.write_event(Event::Text(BytesText::new(text))),
            Node::Markup(markup) => self
                .writer
                .write_event(Event::Text(BytesText::from_escaped(markup.as_str()))),
        }
    }

    fn element(&mut self, element: &Element) -> Result<(), quick_xml::Error> {
        if element.children.is_empty() {
            return self.writer.write_event(Event::Empty(element.start_tag()));
        }
        self.start(element)?;
        for child in &element.children {
            self.node(child)?;
        }
        self.end(&element.name)
    }

    /// Ends the last line.
    fn finish(mut self) -> Result<(), quick_xml::Error> {
        self.writer.get_mut().write_all(b"\n")?;
        Ok(())
    }
}

// -- Rows

/// Rows of every table, loaded once, with lookups by column value.
struct RowSource<'s> {
    storage: &'s dyn Storage,
    tables: HashMap<String, Vec<Row>>,
    indexes: HashMap<(String, String), HashMap<String, Vec<usize>>>,
}

impl<'s> RowSource<'s> {
    fn new(storage: &'s dyn Storage) -> Self {
        Self {
            storage,
            tables: HashMap::new(),
            indexes: HashMap::new(),
        }
    }

    fn rows(&mut self, table: &str) -> Result<&[Row], StorageError> {
        if !self.tables.contains_key(table) {
            let rows = self.storage.rows(table)?;
            self.tables.insert(table.to_string(), rows);
        }
        Ok(self.tables.get(table).map(Vec::as_slice).unwrap_or_default())
    }

    /// Rows of `table` whose `column` holds `value`, in insertion order.
    fn find(&mut self, table: &str, column: &str, value: &str) -> Result<Vec<Row>, StorageError> {
        let key = (table.to_string(), column.to_string());
        if !self.indexes.contains_key(&key) {
            let mut index: HashMap<String, Vec<usize>> = HashMap::new();
            for (i, row) in self.rows(table)?.iter().enumerate() {
                if let Some(text) = row.get(column).and_then(key_text) {
                    index.entry(text).or_default().push(i);
                }
            }
            self.indexes.insert(key.clone(), index);
        }
        let positions = self
            .indexes
            .get(&key)
            .and_then(|index| index.get(value))
            .cloned()
            .unwrap_or_default();
        let rows = self.rows(table)?;
        Ok(positions.into_iter().filter_map(|i| rows.get(i).cloned()).collect())
    }
}

/// Text of a key column.
fn key_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Integer(i) => Some(i.to_string()),
        _ => None,
    }
}

/// Writes documents from the rows of a storage.
pub struct Writer<'c> {
    conf: &'c WriterConf,
}

struct Session<'s, 'm> {
    model: &'m SchemaModel,
    layout: &'m Layout,
    rows: RowSource<'s>,
    srs_name_format: SrsNameFormat,
}

impl<'c> Writer<'c> {
    pub fn new(conf: &'c Conf) -> Self {
        Self { conf: &conf.writer }
    }

    /// Writes the document to `path`. With the relmap wrapping, a schema for the wrapper is
    /// written next to it with the `xsd` extension. Returns the number of members written.
    pub fn write_file(&self, storage: &dyn Storage, path: &Path) -> Result<usize, WriteError> {
        let (model, _) = read_model(storage)?;
        let xsd = match self.conf.wrapping {
            Wrapping::GmlasFeatureCollection => {
                let xsd_path = path.with_extension("xsd");
                std::fs::write(&xsd_path, wrapper_schema(&model, self.conf.line_format)?)?;
                info!("Wrote {}", xsd_path.display());
                xsd_path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            }
            Wrapping::Wfs2FeatureCollection => None,
        };
        let mut out = BufWriter::new(File::create(path)?);
        let written = self.write(storage, &mut out, xsd.as_deref())?;
        out.flush()?;
        Ok(written)
    }

    /// Writes the document to `out`. `wrapper_xsd` is the location of the schema of the relmap
    /// wrapper, if any. Returns the number of members written.
    pub fn write(
        &self,
        storage: &dyn Storage,
        out: &mut dyn Write,
        wrapper_xsd: Option<&str>,
    ) -> Result<usize, WriteError> {
        let (model, layout) = read_model(storage)?;
        let mut session = Session {
            model: &model,
            layout: &layout,
            rows: RowSource::new(storage),
            srs_name_format: self.conf.srs_name_format,
        };
        let members = session.top_level_rows()?;
        info!("Writing {} members", members.len());

        let mut serializer = Serializer::new(
            out,
            self.conf.indentation_size,
            self.conf.line_format.eol(),
        );
        let (collection, member) =
            self.write_header(&mut serializer, &model, members.len(), wrapper_xsd)?;
        for (class, row) in &members {
            let mut cursor = Cursor::default();
            session.write_row(&mut cursor, *class, row, &[], 0, 0)?;
            serializer.start(&Element::new(member.as_str()))?;
            for node in cursor.finish() {
                serializer.node(&node)?;
            }
            serializer.end(&member)?;
        }
        serializer.end(&collection)?;
        serializer.finish()?;
        Ok(members.len())
    }

    /// Writes the XML declaration, the opening tag of the collection and the comment. Returns the
    /// names of the collection and member elements.
    fn write_header<W: Write>(
        &self,
        serializer: &mut Serializer<W>,
        model: &SchemaModel,
        count: usize,
        wrapper_xsd: Option<&str>,
    ) -> Result<(String, String), WriteError> {
        let mut root = Element::default();
        let mut declared: HashMap<String, String> = HashMap::new();
        let mut schema_locations = Vec::new();
        let (collection, member) = match self.conf.wrapping {
            Wrapping::Wfs2FeatureCollection => {
                root.name = "wfs:FeatureCollection".into();
                let timestamp = self.conf.timestamp.clone().unwrap_or_else(|| {
                    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
                });
                root.set_attribute("timeStamp", timestamp);
                root.set_attribute("numberMatched", "unknown".into());
                root.set_attribute("numberReturned", count.to_string());
                root.set_attribute("xmlns:wfs", WFS20_NAMESPACE.into());
                declared.insert("wfs".into(), WFS20_NAMESPACE.into());
                schema_locations.push(format!(
                    "{WFS20_NAMESPACE} {}",
                    self.conf.wfs20_schema_location
                ));
                ("wfs:FeatureCollection", "wfs:member")
            }
            Wrapping::GmlasFeatureCollection => {
                root.name = "relmap:FeatureCollection".into();
                root.set_attribute("xmlns:relmap", RELMAP_NAMESPACE.into());
                declared.insert("relmap".into(), RELMAP_NAMESPACE.into());
                if let Some(xsd) = wrapper_xsd {
                    schema_locations.push(format!("{RELMAP_NAMESPACE} {xsd}"));
                }
                ("relmap:FeatureCollection", "relmap:featureMember")
            }
        };
        root.set_attribute("xmlns:xsi", XSI_NAMESPACE.into());
        declared.insert("xsi".into(), XSI_NAMESPACE.into());

        for namespace in &model.namespaces {
            if namespace.uri.is_empty() {
                if let Some(location) = &namespace.location {
                    root.set_attribute("xsi:noNamespaceSchemaLocation", location.clone());
                }
                continue;
            }
            if let Some(uri) = declared.get(&namespace.prefix) {
                if *uri != namespace.uri {
                    debug!(
                        "Prefix {} already bound to {uri}, not to {}",
                        namespace.prefix, namespace.uri
                    );
                }
                continue;
            }
            declared.insert(namespace.prefix.clone(), namespace.uri.clone());
            let attribute = if namespace.prefix.is_empty() {
                "xmlns".to_string()
            } else {
                format!("xmlns:{}", namespace.prefix)
            };
            root.set_attribute(&attribute, namespace.uri.clone());
            if let Some(location) = &namespace.location {
                schema_locations.push(format!("{} {location}", namespace.uri));
            }
        }
        if !schema_locations.is_empty() {
            root.set_attribute("xsi:schemaLocation", schema_locations.join(" "));
        }

        serializer.declaration()?;
        serializer.start(&root)?;
        if let Some(comment) = &self.conf.comment {
            serializer.comment(comment)?;
        }
        Ok((collection.to_string(), member.to_string()))
    }
}

/// Schema of the relmap feature collection, importing the schemas of the model.
pub fn wrapper_schema(model: &SchemaModel, line_format: LineFormat) -> Result<String, WriteError> {
    let mut schema = Element::new("xs:schema")
        .with_attribute("targetNamespace", RELMAP_NAMESPACE)
        .with_attribute("xmlns:relmap", RELMAP_NAMESPACE)
        .with_attribute("xmlns:xs", XS_NAMESPACE)
        .with_attribute("elementFormDefault", "qualified")
        .with_attribute("version", "1.0");
    for namespace in &model.namespaces {
        let Some(location) = &namespace.location else {
            continue;
        };
        let mut import = Element::new("xs:import");
        if !namespace.uri.is_empty() {
            import.set_attribute("namespace", namespace.uri.clone());
        }
        schema = schema.with_child(import.with_attribute("schemaLocation", location.as_str()));
    }
    let member = Element::new("xs:element")
        .with_attribute("name", "featureMember")
        .with_attribute("minOccurs", "0")
        .with_attribute("maxOccurs", "unbounded")
        .with_child(
            Element::new("xs:complexType")
                .with_child(Element::new("xs:sequence").with_child(Element::new("xs:any"))),
        );
    let schema = schema
        .with_child(
            Element::new("xs:element")
                .with_attribute("name", "FeatureCollection")
                .with_attribute("type", "relmap:FeatureCollectionType"),
        )
        .with_child(
            Element::new("xs:complexType")
                .with_attribute("name", "FeatureCollectionType")
                .with_child(Element::new("xs:sequence").with_child(member)),
        );

    let mut out = Vec::new();
    let mut serializer = Serializer::new(&mut out, 2, line_format.eol());
    serializer.declaration()?;
    serializer.element(&schema)?;
    serializer.finish()?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

impl Session<'_, '_> {
    /// Rows of the top-level layers that no other row contains, in model order.
    fn top_level_rows(&mut self) -> Result<Vec<(ClassId, Row)>, WriteError> {
        let (model, layout) = (self.model, self.layout);
        let mut referenced: HashMap<ClassId, HashSet<String>> = HashMap::new();
        for id in model.classes() {
            let class = model.class(id);
            for field in &class.fields {
                if field.xpath.starts_with('{') {
                    continue;
                }
                let Some(target) = field
                    .related_class_xpath
                    .as_deref()
                    .and_then(|x| model.find_by_xpath(x))
                else {
                    continue;
                };
                match field.category {
                    FieldCategory::PathToChildElementWithLink => {
                        for row in self.rows.rows(&class.name)? {
                            if let Some(pkid) = row.get(&field.name).and_then(key_text) {
                                referenced.entry(target).or_default().insert(pkid);
                            }
                        }
                    }
                    FieldCategory::PathToChildElementWithJunctionTable => {
                        let Some(junction) = &field.junction_layer else {
                            continue;
                        };
                        for row in self.rows.rows(junction)? {
                            if let Some(pkid) = row.get(CHILD_PKID).and_then(key_text) {
                                referenced.entry(target).or_default().insert(pkid);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        let mut members = Vec::new();
        for &id in model.roots() {
            let class = model.class(id);
            if class.is_junction_table {
                continue;
            }
            let pkid = layout.pkid(id);
            let skipped = referenced.get(&id);
            for row in self.rows.rows(&class.name)? {
                let is_child = row
                    .get(pkid)
                    .and_then(key_text)
                    .is_some_and(|key| skipped.is_some_and(|keys| keys.contains(&key)));
                if !is_child {
                    members.push((id, row.clone()));
                }
            }
        }
        Ok(members)
    }

    /// Writes `row` of class `id` at `prefix`, then closes the cursor back to `depth`.
    fn write_row(
        &mut self,
        cursor: &mut Cursor,
        id: ClassId,
        row: &Row,
        prefix: &[String],
        depth: usize,
        nesting: usize,
    ) -> Result<(), WriteError> {
        let (model, layout) = (self.model, self.layout);
        let class = model.class(id);
        if nesting > MAX_NESTING {
            return Err(WriteError::TooDeep(class.name.clone()));
        }
        let element = [prefix, &components(&class.xpath)].concat();
        if shares_element(class) && nesting > 0 {
            cursor.move_to(&element);
        } else {
            cursor.open_new(&element);
        }
        let pkid = row.get(layout.pkid(id)).and_then(key_text);

        for field in &class.fields {
            if field.xpath.starts_with('{') || is_resolved_field(field) {
                continue;
            }
            match field.category {
                FieldCategory::Regular => self.write_field(cursor, class, field, row, prefix, &pkid)?,
                FieldCategory::PathToChildElementNoLink | FieldCategory::Group => {
                    let Some(child) = self.related(field) else { continue };
                    let Some(pkid) = &pkid else { continue };
                    let Some(parent_column) = &layout.keys(child).parent_pkid else {
                        continue;
                    };
                    let children = self.rows.find(&model.class(child).name, parent_column, pkid)?;
                    self.write_children(cursor, field, child, &children, prefix, nesting)?;
                }
                FieldCategory::PathToChildElementWithLink => {
                    let Some(child) = self.related(field) else { continue };
                    let Some(key) = row.get(&field.name).and_then(key_text) else {
                        continue;
                    };
                    let children =
                        self.rows
                            .find(&model.class(child).name, layout.pkid(child), &key)?;
                    self.write_children(cursor, field, child, &children, prefix, nesting)?;
                }
                FieldCategory::PathToChildElementWithJunctionTable => {
                    let Some(child) = self.related(field) else { continue };
                    let (Some(junction), Some(pkid)) = (&field.junction_layer, &pkid) else {
                        continue;
                    };
                    let mut links = self.rows.find(junction, PARENT_PKID, pkid)?;
                    links.sort_by_key(|link| match link.get(OCCURRENCE) {
                        Some(Value::Integer(i)) => *i,
                        _ => i64::MAX,
                    });
                    let child_table = &model.class(child).name;
                    let child_pkid = layout.pkid(child);
                    let mut children = Vec::new();
                    for link in links {
                        if let Some(key) = link.get(CHILD_PKID).and_then(key_text) {
                            children.extend(self.rows.find(child_table, child_pkid, &key)?);
                        }
                    }
                    self.write_children(cursor, field, child, &children, prefix, nesting)?;
                }
            }
        }
        cursor.close_to(depth);
        Ok(())
    }

    fn related(&self, field: &Field) -> Option<ClassId> {
        field
            .related_class_xpath
            .as_deref()
            .and_then(|x| self.model.find_by_xpath(x))
    }

    fn write_children(
        &mut self,
        cursor: &mut Cursor,
        field: &Field,
        child: ClassId,
        children: &[Row],
        prefix: &[String],
        nesting: usize,
    ) -> Result<(), WriteError> {
        if children.is_empty() {
            return Ok(());
        }
        let model = self.model;
        let class = model.class(child);
        let field_path = components(&field.xpath);
        let class_path = components(&class.xpath);
        let scope = field_path.len().saturating_sub(class_path.len());
        let child_prefix = [prefix, &field_path[..scope]].concat();
        let mut shared = [child_prefix.as_slice(), &class_path].concat();
        if !shares_element(class) {
            shared.pop();
        }
        cursor.move_to(&shared);
        let depth = cursor.depth();
        for row in children {
            self.write_row(cursor, child, row, &child_prefix, depth, nesting + 1)?;
        }
        Ok(())
    }

    fn write_field(
        &mut self,
        cursor: &mut Cursor,
        class: &FeatureClass,
        field: &Field,
        row: &Row,
        prefix: &[String],
        pkid: &Option<String>,
    ) -> Result<(), WriteError> {
        let value = match row.get(&field.name) {
            Some(value) if !value.is_null() && !field.ignored => value.clone(),
            _ => match (&field.fixed_value, field.ignored) {
                (Some(fixed), true) => Value::String(fixed.clone()),
                _ => return Ok(()),
            },
        };
        let mut path = [prefix, &components(&field.xpath)].concat();

        if field.is_attribute() {
            let Some(attribute) = path.pop() else {
                return Ok(());
            };
            let name = attribute.trim_start_matches('@');
            cursor.move_to(&path);
            if name == "*" {
                let text = value.to_lexical(field.field_type).unwrap_or_default();
                let attributes = serde_json::from_str::<Map<String, Json>>(&text).unwrap_or_default();
                for (name, value) in attributes {
                    let value = match value {
                        Json::String(s) => s,
                        other => other.to_string(),
                    };
                    cursor.current().set_attribute(&name, value);
                }
            } else if let Some(text) = value.to_lexical(field.field_type) {
                cursor.current().set_attribute(name, text);
            }
            return Ok(());
        }

        if let Value::Geometry(geometry) = &value {
            let markup = self.geometry_markup(class, field, row, geometry, pkid)?;
            if field.include_this_element_in_blob {
                path.pop();
            }
            cursor.move_to(&path);
            cursor.current().children.push(Node::Markup(markup));
            return Ok(());
        }
        if field.field_type == FieldType::AnyType {
            if field.include_this_element_in_blob {
                path.pop();
            }
            cursor.move_to(&path);
            if let Some(markup) = value.to_lexical(field.field_type) {
                cursor.current().children.push(Node::Markup(markup));
            }
            return Ok(());
        }

        if field.is_array && !field.is_list {
            for item in value.list_items(field.field_type) {
                cursor.open_new(&path);
                cursor.current().children.push(Node::Text(item));
            }
            return Ok(());
        }
        if let Some(text) = value.to_lexical(field.field_type) {
            cursor.move_to(&path);
            cursor.current().children.push(Node::Text(text));
        }
        Ok(())
    }

    /// The preserved markup of a geometry when it still describes the stored value, a new
    /// encoding otherwise.
    fn geometry_markup(
        &self,
        class: &FeatureClass,
        field: &Field,
        row: &Row,
        geometry: &GeometryValue,
        pkid: &Option<String>,
    ) -> Result<String, WriteError> {
        if let Some(xml) = row.get_str(&format!("{}_xml", field.name)) {
            let preserved = parse_gml(xml, SwapCoordinates::Auto);
            if preserved.is_ok_and(|p| p.same_shape(geometry)) {
                return Ok(xml.trim().to_string());
            }
        }
        let gml_id = format!(
            "{}.{}.{}",
            class.name,
            pkid.as_deref().unwrap_or("0"),
            field.name
        );
        Ok(to_gml32(geometry, self.srs_name_format, &gml_id)?)
    }
}

/// Whether the rows of `class` share the element of their parent rather than having one each.
fn shares_element(class: &FeatureClass) -> bool {
    class.xpath.contains(";extra=") || class.is_repeated_sequence
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        analyzer::SchemaAnalyzer,
        reader::{Reader, XmlEventSource},
        storage::MemoryStore,
        testing::load_schema,
    };

    fn path(xpath: &str) -> Vec<String> {
        components(xpath)
    }

    #[test]
    fn cursor_diffs_open_elements() {
        let mut cursor = Cursor::default();
        cursor.move_to(&path("a/b/c"));
        cursor.current().children.push(Node::Text("1".into()));
        cursor.move_to(&path("a/b/d"));
        cursor.current().set_attribute("x", "y".into());
        cursor.open_new(&path("a/b/d"));
        cursor.move_to(&path("a/e"));
        let nodes = cursor.finish();

        let mut out = Vec::new();
        let mut serializer = Serializer::new(&mut out, 2, "\n");
        for node in &nodes {
            serializer.node(node).unwrap();
        }
        serializer.finish().unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "<a>\n  <b>\n    <c>1</c>\n    <d x=\"y\"/>\n    <d/>\n  </b>\n  <e/>\n</a>\n"
        );
    }

    #[test]
    fn serializer_escapes_and_ends_lines() {
        let mut element = Element::new("t:a")
            .with_attribute("note", "\"x\" < y")
            .with_child(Element::new("t:b"));
        element.children.push(Node::Text("1 & 2".into()));
        element.children.push(Node::Markup("<o:c xmlns:o=\"urn:o\">3</o:c>".into()));

        let mut out = Vec::new();
        let mut serializer = Serializer::new(&mut out, 1, "\r\n");
        serializer.comment("a--b").unwrap();
        serializer.element(&element).unwrap();
        serializer.finish().unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "<!-- a- -b -->\r\n<t:a note=\"&quot;x&quot; &lt; y\">\r\n <t:b/>1 &amp; 2<o:c xmlns:o=\"urn:o\">3</o:c></t:a>\r\n"
        );
    }

    #[test]
    fn components_drop_markers() {
        assert_eq!(path("t:A/t:B;extra=sequence"), ["t:A", "t:B"]);
        assert_eq!(path("t:A/@id"), ["t:A", "@id"]);
    }

    const SCHEMA: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
        xmlns:t="urn:t" targetNamespace="urn:t" elementFormDefault="qualified">
      <xs:element name="Root">
        <xs:complexType>
          <xs:sequence>
            <xs:element name="title" type="xs:string"/>
            <xs:element name="Item" maxOccurs="unbounded">
              <xs:complexType>
                <xs:sequence>
                  <xs:element name="Name" type="xs:string"/>
                </xs:sequence>
                <xs:attribute name="id" type="xs:string" use="required"/>
              </xs:complexType>
            </xs:element>
          </xs:sequence>
        </xs:complexType>
      </xs:element>
    </xs:schema>"#;

    #[test]
    fn writes_members_with_nested_rows() {
        let mut conf = Conf::default();
        conf.writer.timestamp = Some("2020-01-01T00:00:00Z".into());
        conf.writer.comment = Some("made -- here".into());
        let (model, _) = SchemaAnalyzer::new(&conf)
            .analyze(&load_schema(SCHEMA))
            .unwrap();
        let mut store = MemoryStore::new();
        let mut source = XmlEventSource::from_string(
            "doc.xml",
            r#"<t:Root xmlns:t="urn:t"><t:title>A &amp; B</t:title>
                 <t:Item id="1"><t:Name>x</t:Name></t:Item>
                 <t:Item id="2"><t:Name>y</t:Name></t:Item></t:Root>"#,
        );
        Reader::new(model, &conf)
            .read(&mut source, &mut store)
            .unwrap();

        let mut out = Vec::new();
        let written = Writer::new(&conf).write(&store, &mut out, None).unwrap();
        assert_eq!(written, 1);
        let text = String::from_utf8(out).unwrap();
        let body = text
            .lines()
            .skip_while(|line| !line.contains("<!--"))
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(
            body,
            r#"  <!-- made - - here -->
  <wfs:member>
    <t:Root>
      <t:title>A &amp; B</t:title>
      <t:Item id="1">
        <t:Name>x</t:Name>
      </t:Item>
      <t:Item id="2">
        <t:Name>y</t:Name>
      </t:Item>
    </t:Root>
  </wfs:member>
</wfs:FeatureCollection>"#
        );
        assert!(text.contains(r#"timeStamp="2020-01-01T00:00:00Z" numberMatched="unknown" numberReturned="1""#));
        assert!(text.contains(r#"xmlns:t="urn:t""#));
    }

    #[test]
    fn wrapper_schema_imports_sources() {
        let mut model = SchemaModel::default();
        model.namespaces.push(crate::model::NamespaceInfo {
            uri: "urn:t".into(),
            prefix: "t".into(),
            location: Some("t.xsd".into()),
        });
        let schema = wrapper_schema(&model, LineFormat::Lf).unwrap();
        assert!(schema.contains(r#"<xs:import namespace="urn:t" schemaLocation="t.xsd"/>"#));
        assert!(schema.ends_with("</xs:schema>\n"));
    }
}
