//! Streaming of XML documents into relational rows.
//!
//! The [`Reader`] drives an [`EventSource`] twice. The first pass only observes the document and
//! fills a [`ResolutionTable`]: the SRS of each geometry field, the links found, the identifiers
//! of rows and the layers and fields actually used. The table decides the final shape of the
//! tables; the second pass emits the rows into a [`Storage`].

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs::File,
    io::{BufRead, BufReader},
    path::PathBuf,
};

use quick_xml::{
    events::{attributes::AttrError, BytesEnd, BytesStart, BytesText, Event},
    name::ResolveResult,
    NsReader, Writer,
};
use relmap_xsd::{import::resolve_location, SchemaSource};
use serde_json::{Map, Value as Json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    analyzer::pkid_xpath,
    conf::{Conf, ResolutionMode},
    geometry::{has_northing_first_axis_order, parse_gml, Geometry, GeometryValue, SwapCoordinates},
    metadata::{write_metadata, Layout, CHILD_PKID, OCCURRENCE, PARENT_PKID},
    model::{ClassId, Field, FieldCategory, FieldType, SchemaModel},
    storage::{parse_list, parse_scalar, Row, Storage, StorageError, Value},
    xlink::{derived_field, is_internal, raw_content_field, XLinkResolver},
    xpath::XPathMatcher,
    XLINK_NAMESPACE,
};

const XMLNS_NAMESPACE: &str = "http://www.w3.org/2000/xmlns/";
const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";
/// Interval between two calls of the progress callback, in bytes of input
const PROGRESS_STEP: u64 = 100 * 1024;
pub const DEFAULT_MAX_CONTENT_SIZE: usize = 100 * 1024 * 1024;
pub const DEFAULT_MAX_NESTING_LEVEL: usize = 100;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error(transparent)]
    Xml(#[from] quick_xml::Error),
    #[error(transparent)]
    Attribute(#[from] AttrError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("validation failed: {0}")]
    Validation(String),
}

/// An attribute as delivered by an [`EventSource`]. Namespace declarations are included, with the
/// `xmlns` namespace.
#[derive(Clone, Debug)]
pub struct Attribute {
    pub namespace: Option<String>,
    pub local_name: String,
    pub qname: String,
    pub value: String,
}

/// Receives the events of a document.
pub trait SaxHandler {
    fn start_element(
        &mut self,
        namespace: Option<&str>,
        local_name: &str,
        qname: &str,
        attributes: &[Attribute],
    ) -> Result<(), ReadError>;

    fn characters(&mut self, text: &str) -> Result<(), ReadError>;

    fn end_element(
        &mut self,
        namespace: Option<&str>,
        local_name: &str,
        qname: &str,
    ) -> Result<(), ReadError>;
}

/// Produces the events of one document, as many times as asked.
pub trait EventSource {
    /// Name of the document, used to derive row keys.
    fn name(&self) -> &str;

    /// Delivers every event of the document to `handler`. `progress` gets the fraction of the
    /// input read so far; when it returns false parsing stops and `Ok(false)` is returned.
    fn parse(
        &mut self,
        handler: &mut dyn SaxHandler,
        progress: &mut dyn FnMut(f64) -> bool,
    ) -> Result<bool, ReadError>;
}

enum Input {
    File(PathBuf),
    Memory(Vec<u8>),
}

/// An [`EventSource`] parsing a file or an in-memory document with quick-xml.
pub struct XmlEventSource {
    name: String,
    input: Input,
}

impl XmlEventSource {
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: path.to_string_lossy().into_owned(),
            input: Input::File(path),
        }
    }

    pub fn from_string(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input: Input::Memory(text.into().into_bytes()),
        }
    }

    /// The schemas named by the `xsi:schemaLocation` and `xsi:noNamespaceSchemaLocation`
    /// attributes of the root element, resolved against the location of the document.
    pub fn schema_locations(&self) -> Result<Vec<SchemaSource>, ReadError> {
        match &self.input {
            Input::File(path) => root_schema_locations(
                NsReader::from_reader(BufReader::new(File::open(path)?)),
                &self.name,
            ),
            Input::Memory(bytes) => {
                root_schema_locations(NsReader::from_reader(bytes.as_slice()), &self.name)
            }
        }
    }
}

fn root_schema_locations<R: BufRead>(
    mut reader: NsReader<R>,
    base: &str,
) -> Result<Vec<SchemaSource>, ReadError> {
    let mut buffer = Vec::new();
    let attributes = loop {
        buffer.clear();
        match reader.read_event_into(&mut buffer)? {
            Event::Start(tag) | Event::Empty(tag) => break attributes_of(&reader, &tag)?,
            Event::Eof => return Ok(Vec::new()),
            _ => {}
        }
    };
    let mut sources = Vec::new();
    for attribute in attributes
        .iter()
        .filter(|a| a.namespace.as_deref() == Some(XSI_NAMESPACE))
    {
        match attribute.local_name.as_str() {
            "schemaLocation" => {
                let tokens = attribute.value.split_whitespace().collect::<Vec<_>>();
                for pair in tokens.chunks(2) {
                    if let [namespace, location] = pair {
                        sources.push(SchemaSource {
                            namespace: Some(namespace.to_string()),
                            location: resolve_location(base, location),
                        });
                    }
                }
            }
            "noNamespaceSchemaLocation" => sources.push(SchemaSource {
                namespace: None,
                location: resolve_location(base, attribute.value.trim()),
            }),
            _ => {}
        }
    }
    Ok(sources)
}

impl EventSource for XmlEventSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn parse(
        &mut self,
        handler: &mut dyn SaxHandler,
        progress: &mut dyn FnMut(f64) -> bool,
    ) -> Result<bool, ReadError> {
        match &self.input {
            Input::File(path) => {
                let file = File::open(path)?;
                let total = file.metadata()?.len();
                run(NsReader::from_reader(BufReader::new(file)), total, handler, progress)
            }
            Input::Memory(bytes) => run(
                NsReader::from_reader(bytes.as_slice()),
                bytes.len() as u64,
                handler,
                progress,
            ),
        }
    }
}

fn namespace_of(result: ResolveResult) -> Option<String> {
    match result {
        ResolveResult::Bound(ns) => Some(String::from_utf8_lossy(ns.into_inner()).into_owned()),
        ResolveResult::Unbound => None,
        ResolveResult::Unknown(prefix) => {
            debug!("Undeclared prefix {}", String::from_utf8_lossy(&prefix));
            None
        }
    }
}

fn attributes_of<R>(reader: &NsReader<R>, tag: &BytesStart) -> Result<Vec<Attribute>, ReadError> {
    let mut attributes = Vec::new();
    for attribute in tag.attributes() {
        let attribute = attribute?;
        let qname = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        let value = attribute.unescape_value()?.into_owned();
        if attribute.key.as_namespace_binding().is_some() {
            attributes.push(Attribute {
                namespace: Some(XMLNS_NAMESPACE.into()),
                local_name: qname.split_once(':').map_or("", |(_, l)| l).to_string(),
                qname,
                value,
            });
            continue;
        }
        let (namespace, local) = reader.resolve_attribute(attribute.key);
        attributes.push(Attribute {
            namespace: namespace_of(namespace),
            local_name: String::from_utf8_lossy(local.into_inner()).into_owned(),
            qname,
            value,
        });
    }
    Ok(attributes)
}

fn run<R: BufRead>(
    mut reader: NsReader<R>,
    total: u64,
    handler: &mut dyn SaxHandler,
    progress: &mut dyn FnMut(f64) -> bool,
) -> Result<bool, ReadError> {
    let mut buffer = Vec::new();
    let mut next_report = PROGRESS_STEP;
    loop {
        match reader.read_event_into(&mut buffer)? {
            Event::Start(tag) => {
                let (namespace, local) = reader.resolve_element(tag.name());
                let namespace = namespace_of(namespace);
                let local = String::from_utf8_lossy(local.into_inner()).into_owned();
                let qname = String::from_utf8_lossy(tag.name().as_ref()).into_owned();
                let attributes = attributes_of(&reader, &tag)?;
                handler.start_element(namespace.as_deref(), &local, &qname, &attributes)?;
            }
            Event::Empty(tag) => {
                let (namespace, local) = reader.resolve_element(tag.name());
                let namespace = namespace_of(namespace);
                let local = String::from_utf8_lossy(local.into_inner()).into_owned();
                let qname = String::from_utf8_lossy(tag.name().as_ref()).into_owned();
                let attributes = attributes_of(&reader, &tag)?;
                handler.start_element(namespace.as_deref(), &local, &qname, &attributes)?;
                handler.end_element(namespace.as_deref(), &local, &qname)?;
            }
            Event::End(tag) => {
                let (namespace, local) = reader.resolve_element(tag.name());
                let namespace = namespace_of(namespace);
                let local = String::from_utf8_lossy(local.into_inner()).into_owned();
                let qname = String::from_utf8_lossy(tag.name().as_ref()).into_owned();
                handler.end_element(namespace.as_deref(), &local, &qname)?;
            }
            Event::Text(text) => handler.characters(&text.unescape()?)?,
            Event::CData(data) => handler.characters(&String::from_utf8_lossy(&data))?,
            Event::Eof => break,
            _ => {}
        }
        buffer.clear();
        let position = reader.buffer_position() as u64;
        if position >= next_report {
            next_report = position + PROGRESS_STEP;
            if !progress(position as f64 / total.max(1) as f64) {
                return Ok(false);
            }
        }
    }
    Ok(progress(1.0))
}

/// What the first pass learned about the document.
#[derive(Debug, Default)]
pub struct ResolutionTable {
    /// First SRS name seen per (layer path, geometry field path)
    pub srs_names: HashMap<(String, String), String>,
    /// (layer path, href field path) with internal links, to the path of the linked layer
    pub internal_links: HashMap<(String, String), String>,
    /// (layer path, href field path) with external links, to the URL prefixes of the rules used
    pub external_links: HashMap<(String, String), Vec<Option<String>>>,
    /// Value of ID attributes to the key of the row holding them
    pub ids: HashMap<String, String>,
    /// Layer of the row holding each identifier
    pub id_layers: HashMap<String, String>,
    pub used_layers: HashSet<String>,
    pub used_fields: HashSet<(String, String)>,
    /// Internal links seen, before their targets are known
    pending_links: Vec<((String, String), String)>,
}

impl ResolutionTable {
    /// Binds the internal links seen to the layer of their target, once every identifier of the
    /// document is known.
    fn resolve_pending_links(&mut self) {
        for (key, id) in std::mem::take(&mut self.pending_links) {
            match self.id_layers.get(&id) {
                Some(layer) => {
                    self.internal_links.entry(key).or_insert_with(|| layer.clone());
                }
                None => debug!("No element with identifier {id}"),
            }
        }
    }
}

/// Warnings and counts of a read.
#[derive(Debug, Default)]
pub struct ReadReport {
    pub warnings: Vec<String>,
    pub validation_errors: Vec<String>,
    /// Skipped or failed link resolutions
    pub xlink_notes: Vec<String>,
    /// Rows written per layer
    pub rows: BTreeMap<String, usize>,
    pub removed_layers: Vec<String>,
}

#[derive(Debug)]
pub enum ReadOutcome {
    Completed(ReadReport),
    /// The progress callback asked to stop
    Interrupted(ReadReport),
}

impl ReadOutcome {
    pub fn report(&self) -> &ReadReport {
        match self {
            Self::Completed(report) | Self::Interrupted(report) => report,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }
}

/// Reads documents following a model.
pub struct Reader<'c> {
    conf: &'c Conf,
    model: SchemaModel,
    layout: Layout,
    max_content_size: usize,
    max_nesting_level: usize,
    progress: Box<dyn FnMut(f64) -> bool + 'c>,
}

impl<'c> Reader<'c> {
    pub fn new(model: SchemaModel, conf: &'c Conf) -> Self {
        let layout = Layout::new(&model, conf.layer_building.always_generate_pkid);
        Self {
            conf,
            model,
            layout,
            max_content_size: DEFAULT_MAX_CONTENT_SIZE,
            max_nesting_level: DEFAULT_MAX_NESTING_LEVEL,
            progress: Box::new(|_| true),
        }
    }

    pub fn with_max_content_size(mut self, size: usize) -> Self {
        self.max_content_size = size;
        self
    }

    /// Deepest element, counted from the document root, kept in captured anyType or geometry
    /// content. Deeper content truncates the field it belongs to.
    pub fn with_max_nesting_level(mut self, level: usize) -> Self {
        self.max_nesting_level = level;
        self
    }

    /// Installs a callback getting the fraction of the work done, returning false to stop.
    pub fn with_progress(mut self, progress: impl FnMut(f64) -> bool + 'c) -> Self {
        self.progress = Box::new(progress);
        self
    }

    /// The model of the tables written, once a read has happened.
    pub fn model(&self) -> &SchemaModel {
        &self.model
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Reads the document of `source` into `storage`, creating the tables and the metadata
    /// tables first.
    pub fn read(
        &mut self,
        source: &mut dyn EventSource,
        storage: &mut dyn Storage,
    ) -> Result<ReadOutcome, ReadError> {
        let document_key = format!("{:08X}", fnv1a(source.name().as_bytes()));
        let mut report = ReadReport::default();
        let progress = &mut *self.progress;

        info!("Scanning {}", source.name());
        let index = ModelIndex::new(&self.model, self.conf);
        let mut scan = RowHandler::new(
            &self.model,
            &index,
            &self.layout,
            self.conf,
            &document_key,
            (self.max_content_size, self.max_nesting_level),
            Pass::Scan(ResolutionTable::default()),
        );
        if !source.parse(&mut scan, &mut |f| progress(f / 2.0))? {
            return Ok(ReadOutcome::Interrupted(report));
        }
        let mut table = scan.into_table();
        table.resolve_pending_links();

        let (model, removed) = finalize_model(&self.model, &table, self.conf);
        report.removed_layers = removed;
        self.model = model;
        self.layout = Layout::new(&self.model, self.conf.layer_building.always_generate_pkid);
        for id in self.model.classes() {
            storage.create_table(self.layout.table_def(
                &self.model,
                id,
                self.conf.layer_building.include_geometry_xml,
            ))?;
        }
        write_metadata(storage, &self.model, &self.layout)?;

        info!("Reading {}", source.name());
        let index = ModelIndex::new(&self.model, self.conf);
        let mut resolver = XLinkResolver::new(&self.conf.xlink);
        let mut handler = RowHandler::new(
            &self.model,
            &index,
            &self.layout,
            self.conf,
            &document_key,
            (self.max_content_size, self.max_nesting_level),
            Pass::Emit {
                storage,
                table: &table,
                resolver: &mut resolver,
            },
        );
        let completed = source.parse(&mut handler, &mut |f| progress(0.5 + f / 2.0))?;
        report.warnings = std::mem::take(&mut handler.warnings);
        report.validation_errors = std::mem::take(&mut handler.validation_errors);
        report.rows = std::mem::take(&mut handler.rows);
        drop(handler);
        report.xlink_notes = resolver.take_notes();
        info!(
            "Read {} rows with {} warnings",
            report.rows.values().sum::<usize>(),
            report.warnings.len()
        );
        Ok(if completed {
            ReadOutcome::Completed(report)
        } else {
            ReadOutcome::Interrupted(report)
        })
    }
}

/// 32-bit FNV-1a.
fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5_u32, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(0x0100_0193)
    })
}

/// Drops what went unused when asked and adds the link columns the first pass found a use for.
/// Returns the names of the dropped layers.
fn finalize_model(
    model: &SchemaModel,
    table: &ResolutionTable,
    conf: &Conf,
) -> (SchemaModel, Vec<String>) {
    let mut model = model.clone();
    let rules = &conf.layer_building;
    let mut removed = Vec::new();
    if rules.remove_unused_layers {
        model.retain(|_, class| {
            let keep = table.used_layers.contains(&class.xpath);
            if !keep {
                removed.push(class.name.clone());
            }
            keep
        });
        if !removed.is_empty() {
            info!("Removed {} unused layers", removed.len());
        }
    }
    let kept_xpaths = model
        .classes()
        .into_iter()
        .map(|id| model.class(id).xpath.clone())
        .collect::<HashSet<_>>();
    for id in model.classes() {
        let id_xpath = model.class(id).id_field().map(|f| f.xpath.clone());
        let class = model.class_mut(id);
        let class_xpath = class.xpath.clone();
        class.fields.retain(|field| match field.category {
            FieldCategory::Regular | FieldCategory::PathToChildElementWithLink
                if rules.remove_unused_fields =>
            {
                Some(&field.xpath) == id_xpath.as_ref()
                    || field.fixed_value.is_some() && field.ignored
                    || table
                        .used_fields
                        .contains(&(class_xpath.clone(), field.xpath.clone()))
            }
            FieldCategory::Regular => true,
            _ => field
                .related_class_xpath
                .as_ref()
                .map_or(true, |related| kept_xpaths.contains(related)),
        });
    }

    for id in model.classes() {
        let class = model.class(id);
        let mut added: Vec<Field> = Vec::new();
        for field in &class.fields {
            let key = (class.xpath.clone(), field.xpath.clone());
            if let Some(target) = table.internal_links.get(&key) {
                let link_xpath = pkid_xpath(&field.xpath);
                if class.field_by_xpath(&link_xpath).is_none() && kept_xpaths.contains(target) {
                    let base = field.name.strip_suffix("_href").unwrap_or(&field.name);
                    let mut link = Field::new(
                        format!("{base}_pkid"),
                        link_xpath,
                        FieldCategory::PathToChildElementWithLink,
                    );
                    link.related_class_xpath = Some(target.clone());
                    added.push(link);
                }
            }
            for prefix in table.external_links.get(&key).into_iter().flatten() {
                let rule = match prefix {
                    Some(prefix) => conf
                        .xlink
                        .url_specific_rules
                        .iter()
                        .find(|r| r.url_prefix.as_ref() == Some(prefix)),
                    None => conf.xlink.default_resolution.as_ref(),
                };
                let Some(rule) = rule else { continue };
                let fields = match rule.resolution_mode {
                    ResolutionMode::RawContent => vec![raw_content_field(field)],
                    ResolutionMode::FieldsFromXPath => rule
                        .fields
                        .iter()
                        .map(|derived| derived_field(field, derived))
                        .collect(),
                };
                for new in fields {
                    let exists = class.field_by_xpath(&new.xpath).is_some()
                        || added.iter().any(|f| f.xpath == new.xpath);
                    if !exists {
                        added.push(new);
                    }
                }
            }
        }
        model.class_mut(id).fields.extend(added);
    }
    (model, removed)
}

/// Per class lookups used while reading.
#[derive(Default)]
struct ClassIndex {
    /// Path of an element or attribute to the field storing it, with the class owning the field
    /// (the class itself or one of its group classes)
    fields: HashMap<String, (ClassId, usize)>,
    /// Paths of elements holding fields deeper down
    prefixes: HashSet<String>,
    /// Element path to its required attribute fields
    required_attributes: HashMap<String, Vec<String>>,
    /// Field storing the text of the class element itself
    value_field: Option<usize>,
}

struct ModelIndex {
    classes: Vec<ClassIndex>,
    /// Element path of the top-level classes
    roots: HashMap<String, ClassId>,
    ignored: XPathMatcher,
    ignored_warn: HashMap<String, bool>,
    xlink_prefix: String,
}

impl ModelIndex {
    fn new(model: &SchemaModel, conf: &Conf) -> Self {
        let mut classes = (0..model.len()).map(|_| ClassIndex::default()).collect::<Vec<_>>();
        let mut roots = HashMap::new();
        for id in model.classes() {
            let class = model.class(id);
            if class.is_junction_table || class.xpath.contains(";extra=") {
                continue;
            }
            if class.parent.is_none() {
                roots.insert(class.xpath.clone(), id);
            }
            let index = &mut classes[id.0];
            index.value_field = class
                .fields
                .iter()
                .position(|f| f.category == FieldCategory::Regular && f.xpath == class.xpath);

            // The class and, recursively, its group classes
            let mut owners = vec![id];
            let mut i = 0;
            while i < owners.len() {
                for &nested in &model.class(owners[i]).nested {
                    if model.class(nested).xpath.contains(";extra=") {
                        owners.push(nested);
                    }
                }
                i += 1;
            }
            for owner in owners {
                for (f, field) in model.class(owner).fields.iter().enumerate() {
                    if field.xpath.starts_with('{')
                        || field.category == FieldCategory::Group
                        || field.xpath.contains(";extra=")
                        || (owner == id && field.xpath == class.xpath)
                    {
                        continue;
                    }
                    for xpath in std::iter::once(&field.xpath).chain(&field.alternate_xpaths) {
                        index.fields.entry(xpath.clone()).or_insert((owner, f));
                        let mut prefix = xpath.as_str();
                        while let Some((head, _)) = prefix.rsplit_once('/') {
                            if head.len() <= class.xpath.len() {
                                break;
                            }
                            index.prefixes.insert(head.to_string());
                            prefix = head;
                        }
                    }
                    if field.is_attribute() && field.not_nullable && !field.ignored {
                        if let Some((element, _)) = field.xpath.rsplit_once("/@") {
                            index
                                .required_attributes
                                .entry(element.to_string())
                                .or_default()
                                .push(field.xpath.clone());
                        }
                    }
                }
            }
        }

        let mut ignored = XPathMatcher::compile(
            conf.ignored_xpaths.xpaths.iter().map(|x| x.xpath.clone()),
            conf.ignored_xpaths.namespaces.clone(),
        );
        ignored.set_document_uri_to_prefix(&model.uri_to_prefix());
        let ignored_warn = conf
            .ignored_xpaths
            .xpaths
            .iter()
            .map(|x| {
                let warn = x.warn.unwrap_or(conf.ignored_xpaths.warn_if_found_in_document);
                (x.xpath.clone(), warn)
            })
            .collect();
        Self {
            classes,
            roots,
            ignored,
            ignored_warn,
            xlink_prefix: model.prefix_of(XLINK_NAMESPACE).unwrap_or("xlink").to_string(),
        }
    }
}

enum Pass<'s> {
    Scan(ResolutionTable),
    Emit {
        storage: &'s mut dyn Storage,
        table: &'s ResolutionTable,
        resolver: &'s mut XLinkResolver,
    },
}

/// Which row of the current context a field belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Owner {
    Context,
    Group(ClassId),
}

struct GroupRow {
    class: ClassId,
    pkid: String,
    row: Row,
    last_field: Option<usize>,
}

/// A row being built, for the element that started it.
struct Context {
    class: ClassId,
    pkid: String,
    parent_pkid: Option<String>,
    row: Row,
    last_field: Option<usize>,
    groups: Vec<GroupRow>,
    occurrences: HashMap<ClassId, i64>,
}

enum Frame {
    /// Outside of any layer
    Outside,
    /// Started a context
    Context { path: String },
    /// Started a context whose element text is a field of it
    ContextValue { path: String, field: usize, nil: bool },
    Field {
        path: String,
        owner: Owner,
        field: usize,
        nil: bool,
    },
    /// Holds fields deeper down
    Path { path: String },
    Skip,
}

impl Frame {
    fn path(&self) -> Option<&str> {
        match self {
            Self::Context { path }
            | Self::ContextValue { path, .. }
            | Self::Field { path, .. }
            | Self::Path { path } => Some(path),
            Self::Outside | Self::Skip => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Truncation {
    Size,
    Nesting,
}

/// Serialized subtree of an anyType or geometry field.
struct Blob {
    owner: Owner,
    field: usize,
    path: String,
    /// Top-level elements and text captured so far
    xml: String,
    /// Start tag of the open top-level element. It gets the namespace declarations its content
    /// needs once it closes.
    top: Option<BytesStart<'static>>,
    /// Markup inside `top`
    inner: String,
    /// Prefixes used inside `top` but declared outside of the blob, with their URI
    inherited: BTreeMap<String, String>,
    /// Prefixes declared by each open element of the blob
    declared: Vec<Vec<String>>,
    include_root: bool,
    truncated: Option<Truncation>,
    srs_name: Option<String>,
}

impl Blob {
    fn new(owner: Owner, field: usize, path: String, include_root: bool) -> Self {
        Self {
            owner,
            field,
            path,
            xml: String::new(),
            top: None,
            inner: String::new(),
            inherited: BTreeMap::new(),
            declared: Vec::new(),
            include_root,
            truncated: None,
            srs_name: None,
        }
    }

    fn depth(&self) -> usize {
        self.declared.len()
    }

    /// Appends `markup` to the open top-level element, or after the captured ones. Once the
    /// content would exceed `max` bytes nothing more is captured.
    fn push(&mut self, markup: &str, max: usize) {
        if self.truncated.is_some() {
            return;
        }
        if self.xml.len() + self.inner.len() + markup.len() > max {
            self.truncated = Some(Truncation::Size);
            return;
        }
        match self.top {
            Some(_) => self.inner.push_str(markup),
            None => self.xml.push_str(markup),
        }
    }

    /// Closes the open top-level element, declaring on it the prefixes it inherits.
    fn close_top(&mut self, qname: &str, max: usize) -> Result<(), ReadError> {
        let Some(mut start) = self.top.take() else {
            return Ok(());
        };
        for (prefix, uri) in std::mem::take(&mut self.inherited) {
            let key = match prefix.as_str() {
                "" => "xmlns".to_string(),
                _ => format!("xmlns:{prefix}"),
            };
            start.push_attribute((key.as_str(), uri.as_str()));
        }
        let inner = std::mem::take(&mut self.inner);
        let element = if inner.is_empty() {
            markup(Event::Empty(start))?
        } else {
            markup(Event::Start(start))? + &inner + &markup(Event::End(BytesEnd::new(qname)))?
        };
        self.push(&element, max);
        Ok(())
    }
}

/// Serializes one event.
fn markup(event: Event) -> Result<String, ReadError> {
    let mut writer = Writer::new(Vec::new());
    writer.write_event(event)?;
    Ok(String::from_utf8_lossy(&writer.into_inner()).into_owned())
}

fn is_declaration(attribute: &Attribute) -> bool {
    attribute.namespace.as_deref() == Some(XMLNS_NAMESPACE)
}

/// Prefix of a qualified name, empty for unprefixed names.
fn prefix_of(qname: &str) -> &str {
    qname.split_once(':').map_or("", |(prefix, _)| prefix)
}

/// URI bound to `prefix` by the innermost declaration in `scopes`.
fn in_scope<'s>(scopes: &'s [Vec<(String, String)>], prefix: &str) -> Option<&'s str> {
    scopes
        .iter()
        .rev()
        .flatten()
        .find(|(declared, _)| declared == prefix)
        .map(|(_, uri)| uri.as_str())
}

struct RowHandler<'a, 's> {
    model: &'a SchemaModel,
    index: &'a ModelIndex,
    layout: &'a Layout,
    conf: &'a Conf,
    document_key: &'a str,
    max_content_size: usize,
    max_nesting_level: usize,
    pass: Pass<'s>,
    frames: Vec<Frame>,
    /// Namespace declarations of each open element
    scopes: Vec<Vec<(String, String)>>,
    contexts: Vec<Context>,
    counters: HashMap<ClassId, usize>,
    text: String,
    text_truncated: bool,
    blob: Option<Blob>,
    warned: HashSet<String>,
    warnings: Vec<String>,
    validation_errors: Vec<String>,
    rows: BTreeMap<String, usize>,
}

impl<'a, 's> RowHandler<'a, 's> {
    fn new(
        model: &'a SchemaModel,
        index: &'a ModelIndex,
        layout: &'a Layout,
        conf: &'a Conf,
        document_key: &'a str,
        (max_content_size, max_nesting_level): (usize, usize),
        pass: Pass<'s>,
    ) -> Self {
        Self {
            model,
            index,
            layout,
            conf,
            document_key,
            max_content_size,
            max_nesting_level,
            pass,
            frames: Vec::new(),
            scopes: Vec::new(),
            contexts: Vec::new(),
            counters: HashMap::new(),
            text: String::new(),
            text_truncated: false,
            blob: None,
            warned: HashSet::new(),
            warnings: Vec::new(),
            validation_errors: Vec::new(),
            rows: BTreeMap::new(),
        }
    }

    /// What a scanning pass learned.
    fn into_table(self) -> ResolutionTable {
        match self.pass {
            Pass::Scan(table) => table,
            Pass::Emit { .. } => ResolutionTable::default(),
        }
    }

    fn emitting(&self) -> bool {
        matches!(self.pass, Pass::Emit { .. })
    }

    fn warn(&mut self, message: String) {
        if self.emitting() {
            warn!("{message}");
            self.warnings.push(message);
        }
    }

    /// Warns about `message` once per `key`.
    fn warn_once(&mut self, key: &str, message: String) {
        if self.emitting() && self.warned.insert(key.to_string()) {
            self.warn(message);
        }
    }

    fn validation_error(&mut self, message: String) -> Result<(), ReadError> {
        if !self.conf.validation.enabled || !self.emitting() {
            return Ok(());
        }
        if self.conf.validation.fail_if_error {
            return Err(ReadError::Validation(message));
        }
        warn!("{message}");
        self.validation_errors.push(message);
        Ok(())
    }

    /// Name of an element or attribute with the prefix the model uses for its namespace.
    fn model_name(&self, namespace: Option<&str>, local_name: &str) -> String {
        match namespace {
            Some(uri) => match self.model.prefix_of(uri) {
                Some("") => local_name.to_string(),
                Some(prefix) => format!("{prefix}:{local_name}"),
                None => format!("{{{uri}}}{local_name}"),
            },
            None => local_name.to_string(),
        }
    }

    fn class_index(&self, class: ClassId) -> &'a ClassIndex {
        &self.index.classes[class.0]
    }

    fn field(&self, owner_class: ClassId, field: usize) -> &'a Field {
        &self.model.class(owner_class).fields[field]
    }

    fn owner_class(&self, owner: Owner) -> ClassId {
        match owner {
            Owner::Group(class) => class,
            Owner::Context => self.contexts.last().map_or(ClassId(0), |c| c.class),
        }
    }

    fn next_pkid(&mut self, class: ClassId, local_name: &str, parent: Option<&str>) -> String {
        let counter = self.counters.entry(class).or_default();
        *counter += 1;
        format!("{}_{local_name}_{counter}", parent.unwrap_or(self.document_key))
    }

    // -- Rows

    fn open_context(
        &mut self,
        class: ClassId,
        parent_pkid: Option<String>,
        local_name: &str,
        attributes: &[Attribute],
        path: &str,
    ) -> String {
        let keys = self.layout.keys(class);
        let id_value = if keys.generated {
            None
        } else {
            self.model.class(class).id_field().and_then(|f| {
                attributes
                    .iter()
                    .find(|a| {
                        format!("{path}/@{}", self.model_name(a.namespace.as_deref(), &a.local_name))
                            == f.xpath
                    })
                    .map(|a| a.value.clone())
            })
        };
        let pkid = match id_value {
            Some(id) => id,
            None => {
                let prefix = parent_pkid.clone();
                self.next_pkid(class, local_name, prefix.as_deref())
            }
        };
        self.contexts.push(Context {
            class,
            pkid: pkid.clone(),
            parent_pkid,
            row: Row::new(),
            last_field: None,
            groups: Vec::new(),
            occurrences: HashMap::new(),
        });
        pkid
    }

    fn keyed_row(&self, class: ClassId, pkid: &str, parent_pkid: Option<&str>, mut row: Row) -> Row {
        let keys = self.layout.keys(class);
        if let Some(column) = &keys.pkid {
            row.set(column.clone(), Value::String(pkid.to_string()));
        }
        if let (Some(column), Some(parent)) = (&keys.parent_pkid, parent_pkid) {
            row.set(column.clone(), Value::String(parent.to_string()));
        }
        row
    }

    fn emit(&mut self, class: ClassId, row: Row) -> Result<(), ReadError> {
        let class = self.model.class(class);
        match &mut self.pass {
            Pass::Scan(table) => {
                table.used_layers.insert(class.xpath.clone());
                for (column, value) in row.iter() {
                    if value.is_null() {
                        continue;
                    }
                    if let Some(field) = class.fields.iter().find(|f| f.name == column) {
                        table
                            .used_fields
                            .insert((class.xpath.clone(), field.xpath.clone()));
                    }
                }
            }
            Pass::Emit { storage, .. } => {
                storage.insert(&class.name, row)?;
                *self.rows.entry(class.name.clone()).or_default() += 1;
            }
        }
        Ok(())
    }

    fn flush_groups(&mut self, keep: usize) -> Result<(), ReadError> {
        while self.contexts.last().is_some_and(|c| c.groups.len() > keep) {
            let Some(group) = self.contexts.last_mut().and_then(|c| c.groups.pop()) else {
                break;
            };
            let parent = self.contexts.last().map(|c| match c.groups.last() {
                Some(outer) => outer.pkid.clone(),
                None => c.pkid.clone(),
            });
            let row = self.keyed_row(group.class, &group.pkid, parent.as_deref(), group.row);
            self.emit(group.class, row)?;
        }
        Ok(())
    }

    fn close_context(&mut self) -> Result<(), ReadError> {
        self.flush_groups(0)?;
        if let Some(context) = self.contexts.pop() {
            let row = self.keyed_row(
                context.class,
                &context.pkid,
                context.parent_pkid.as_deref(),
                context.row,
            );
            self.emit(context.class, row)?;
        }
        Ok(())
    }

    /// Makes the row `owner` designates current for `field`, starting a new one when the field
    /// was already seen in a repeated sequence or group.
    fn prepare_row(&mut self, owner: Owner, field: usize, is_attribute: bool) -> Result<(), ReadError> {
        let Some(context) = self.contexts.last() else {
            return Ok(());
        };
        match owner {
            Owner::Context => {
                let class = context.class;
                let repeated = self.model.class(class).is_repeated_sequence;
                if repeated && !is_attribute && context.last_field.is_some_and(|last| field <= last) {
                    self.restart_context()?;
                }
                if !is_attribute {
                    self.flush_groups(0)?;
                    if let Some(context) = self.contexts.last_mut() {
                        context.last_field = Some(field);
                    }
                }
            }
            Owner::Group(group) => {
                // Chain of group classes from the context class down to `group`
                let mut chain = vec![group];
                let mut current = group;
                while let Some(parent) = self.model.class(current).parent {
                    if parent == context.class {
                        break;
                    }
                    chain.push(parent);
                    current = parent;
                }
                chain.reverse();

                let active = context
                    .groups
                    .iter()
                    .zip(&chain)
                    .take_while(|(g, c)| g.class == **c)
                    .count();
                let repeats = active == chain.len()
                    && !is_attribute
                    && context
                        .groups
                        .get(active - 1)
                        .and_then(|g| g.last_field)
                        .is_some_and(|last| field <= last);
                let keep = if repeats { active - 1 } else { active };
                self.flush_groups(keep)?;
                for &class in &chain[keep..] {
                    let parent = self.contexts.last().map(|c| match c.groups.last() {
                        Some(outer) => outer.pkid.clone(),
                        None => c.pkid.clone(),
                    });
                    let name = self.model.class(class).name.clone();
                    let pkid = self.next_pkid(class, &name, parent.as_deref());
                    if let Some(context) = self.contexts.last_mut() {
                        context.groups.push(GroupRow {
                            class,
                            pkid,
                            row: Row::new(),
                            last_field: None,
                        });
                    }
                }
                if !is_attribute {
                    if let Some(group) = self.contexts.last_mut().and_then(|c| c.groups.last_mut()) {
                        group.last_field = Some(field);
                    }
                }
            }
        }
        Ok(())
    }

    /// Emits the row of the current context and starts a new one for the same element.
    fn restart_context(&mut self) -> Result<(), ReadError> {
        self.flush_groups(0)?;
        let Some(context) = self.contexts.last_mut() else {
            return Ok(());
        };
        let row = std::mem::take(&mut context.row);
        let class = context.class;
        let pkid = context.pkid.clone();
        let parent = context.parent_pkid.clone();
        let keyed = self.keyed_row(class, &pkid, parent.as_deref(), row);
        self.emit(class, keyed)?;
        let name = self.model.class(class).name.clone();
        let new_pkid = self.next_pkid(class, &name, parent.as_deref());
        if let Some(context) = self.contexts.last_mut() {
            context.pkid = new_pkid;
            context.last_field = None;
        }
        Ok(())
    }

    fn row_mut(&mut self, owner: Owner) -> Option<&mut Row> {
        let context = self.contexts.last_mut()?;
        match owner {
            Owner::Context => Some(&mut context.row),
            Owner::Group(class) => context
                .groups
                .iter_mut()
                .rev()
                .find(|g| g.class == class)
                .map(|g| &mut g.row),
        }
    }

    fn row_pkid(&self, owner: Owner) -> Option<String> {
        let context = self.contexts.last()?;
        match owner {
            Owner::Context => Some(context.pkid.clone()),
            Owner::Group(class) => context
                .groups
                .iter()
                .rev()
                .find(|g| g.class == class)
                .map(|g| g.pkid.clone()),
        }
    }

    fn set(&mut self, owner: Owner, column: &str, value: Value) {
        if let Some(row) = self.row_mut(owner) {
            row.set(column, value);
        }
    }

    // -- Values

    fn store_text(&mut self, owner: Owner, field_index: usize, path: &str, nil: bool) {
        let class = self.owner_class(owner);
        let field = self.field(class, field_index);
        let text = std::mem::take(&mut self.text);
        if nil {
            if self.conf.layer_building.use_null_state {
                self.set(owner, &field.name, Value::Null);
            }
            return;
        }
        if field.field_type == FieldType::AnyType || field.is_geometry() {
            return;
        }
        let is_string = matches!(
            field.field_type,
            FieldType::String | FieldType::Id | FieldType::AnyUri | FieldType::AnySimpleType
        );
        if text.trim().is_empty() && !is_string {
            return;
        }
        let converted = if field.is_list {
            parse_list(&text, field.field_type)
        } else {
            parse_scalar(&text, field.field_type)
        };
        let Some(value) = converted else {
            self.warn(format!(
                "Cannot convert '{}' of {path} to {}",
                text.trim(),
                field.type_name
            ));
            if !field.is_array {
                self.set(owner, &field.name, Value::Null);
            }
            return;
        };
        if field.is_array && !field.is_list {
            let existing = self.row_mut(owner).and_then(|row| row.get(&field.name).cloned());
            self.set(owner, &field.name, append(existing, value));
        } else {
            self.set(owner, &field.name, value);
        }
    }

    fn store_blob(&mut self, blob: Blob) {
        let class = self.owner_class(blob.owner);
        let field = self.field(class, blob.field);
        let class_xpath = self.model.class(class).xpath.clone();
        match blob.truncated {
            Some(Truncation::Size) => self.warn(format!(
                "Content of {} exceeds {} bytes and was truncated",
                blob.path, self.max_content_size
            )),
            Some(Truncation::Nesting) => self.warn(format!(
                "Content of {} is nested deeper than {} levels and was truncated",
                blob.path, self.max_nesting_level
            )),
            None => {}
        }
        if !field.is_geometry() {
            self.set(blob.owner, &field.name, Value::String(blob.xml));
            return;
        }

        let key = (class_xpath, field.xpath.clone());
        let inherited = match &mut self.pass {
            Pass::Scan(table) => {
                if let Some(srs_name) = blob.srs_name {
                    table.srs_names.entry(key.clone()).or_insert(srs_name);
                }
                table.used_fields.insert(key);
                return;
            }
            Pass::Emit { table, .. } => table.srs_names.get(&key).cloned(),
        };
        let mut value = match parse_gml(&blob.xml, SwapCoordinates::Auto) {
            Ok(value) => value,
            Err(e) => {
                self.warn(format!("Cannot parse geometry of {}: {e}", blob.path));
                return;
            }
        };
        if value.srs_name.is_none() {
            if let Some(srs_name) = inherited {
                if has_northing_first_axis_order(&srs_name) {
                    value.geometry.swap_axes();
                }
                value.srs_name = Some(srs_name);
            }
        }
        if self.conf.layer_building.include_geometry_xml {
            self.set(blob.owner, &format!("{}_xml", field.name), Value::String(blob.xml));
        }
        let existing = self.row_mut(blob.owner).and_then(|row| row.get(&field.name).cloned());
        let value = match existing {
            Some(Value::Geometry(previous)) if field.is_array => {
                let members = match previous.geometry {
                    Geometry::GeometryCollection(members) => members,
                    other => vec![other],
                };
                let mut members = members;
                members.push(value.geometry);
                GeometryValue {
                    geometry: Geometry::GeometryCollection(members),
                    srs_name: previous.srs_name,
                }
            }
            _ => value,
        };
        self.set(blob.owner, &field.name, Value::Geometry(Box::new(value)));
    }

    fn process_attributes(
        &mut self,
        path: &str,
        attributes: &[Attribute],
    ) -> Result<(), ReadError> {
        let Some(class) = self.contexts.last().map(|c| c.class) else {
            return Ok(());
        };
        let index = self.class_index(class);
        let mut present = HashSet::new();
        for attribute in attributes {
            let namespace = attribute.namespace.as_deref();
            if namespace == Some(XMLNS_NAMESPACE) {
                continue;
            }
            let name = self.model_name(namespace, &attribute.local_name);
            let xpath = format!("{path}/@{name}");
            present.insert(xpath.clone());
            let Some(&(owner_class, f)) = index.fields.get(&xpath) else {
                self.unmatched_attribute(path, &xpath, attribute)?;
                continue;
            };
            let field = self.field(owner_class, f);
            if field.ignored {
                continue;
            }
            let owner = if owner_class == class {
                Owner::Context
            } else {
                Owner::Group(owner_class)
            };
            self.prepare_row(owner, f, true)?;
            let value = if field.is_list {
                parse_list(&attribute.value, field.field_type)
            } else {
                parse_scalar(&attribute.value, field.field_type)
            };
            match value {
                Some(value) => self.set(owner, &field.name, value),
                None => {
                    self.warn(format!(
                        "Cannot convert '{}' of {xpath} to {}",
                        attribute.value, field.type_name
                    ));
                    self.set(owner, &field.name, Value::Null);
                }
            }
            if field.field_type == FieldType::Id && owner == Owner::Context {
                let pkid = self.row_pkid(owner);
                let layer = &self.model.class(class).xpath;
                if let (Pass::Scan(table), Some(pkid)) = (&mut self.pass, pkid) {
                    table.ids.insert(attribute.value.clone(), pkid);
                    table.id_layers.insert(attribute.value.clone(), layer.clone());
                }
            }
            if xpath.ends_with(&format!("/@{}:href", self.index.xlink_prefix)) {
                self.process_href(owner, owner_class, field, &attribute.value);
            }
        }
        if let Some(required) = index.required_attributes.get(path) {
            for xpath in required {
                if !present.contains(xpath) {
                    self.validation_error(format!("Missing required attribute {xpath}"))?;
                }
            }
        }
        Ok(())
    }

    fn unmatched_attribute(
        &mut self,
        path: &str,
        xpath: &str,
        attribute: &Attribute,
    ) -> Result<(), ReadError> {
        let Some(class) = self.contexts.last().map(|c| c.class) else {
            return Ok(());
        };
        let wildcard = format!("{path}/@*");
        if let Some(&(owner_class, f)) = self.class_index(class).fields.get(&wildcard) {
            let owner = if owner_class == class {
                Owner::Context
            } else {
                Owner::Group(owner_class)
            };
            let name = self.field(owner_class, f).name.clone();
            let mut map = self
                .row_mut(owner)
                .and_then(|row| row.get_str(&name))
                .and_then(|text| serde_json::from_str::<Map<String, Json>>(text).ok())
                .unwrap_or_default();
            map.insert(attribute.qname.clone(), Json::String(attribute.value.clone()));
            self.set(owner, &name, Value::String(Json::Object(map).to_string()));
            return Ok(());
        }
        if attribute.namespace.as_deref() == Some(XSI_NAMESPACE) {
            return Ok(());
        }
        if self.is_ignored(xpath) {
            return Ok(());
        }
        self.warn_once(xpath, format!("Unexpected attribute {xpath}"));
        self.validation_error(format!("Unexpected attribute {xpath}"))
    }

    fn process_href(&mut self, owner: Owner, owner_class: ClassId, field: &Field, href: &str) {
        let class_xpath = self.model.class(owner_class).xpath.clone();
        let key = (class_xpath, field.xpath.clone());
        if is_internal(href) {
            if !self.conf.xlink.resolve_internal_xlinks {
                return;
            }
            let id = &href[1..];
            let target = match &mut self.pass {
                Pass::Scan(table) => {
                    // Targets may come later in the document
                    table.pending_links.push((key, id.to_string()));
                    return;
                }
                Pass::Emit { table, .. } => table.ids.get(id).cloned(),
            };
            let Some(pkid) = target else {
                self.warn_once(href, format!("No element with identifier {id}"));
                return;
            };
            let link_xpath = pkid_xpath(&field.xpath);
            if let Some(link) = self.model.class(owner_class).field_by_xpath(&link_xpath) {
                self.set(owner, &link.name, Value::String(pkid));
            }
            return;
        }

        match &mut self.pass {
            Pass::Scan(table) => {
                if let Some(rule) = self.conf.xlink.rule_for(href) {
                    let prefixes = table.external_links.entry(key).or_default();
                    if !prefixes.contains(&rule.url_prefix) {
                        prefixes.push(rule.url_prefix.clone());
                    }
                }
            }
            Pass::Emit { resolver, .. } => {
                let values = resolver.resolve(field, href);
                for (column, value) in values {
                    self.set(owner, &column, value);
                }
            }
        }
    }

    fn is_ignored(&mut self, xpath: &str) -> bool {
        let index = self.index;
        let Some(pattern) = index.ignored.matches(xpath) else {
            return false;
        };
        if index.ignored_warn.get(pattern).copied().unwrap_or(true) {
            self.warn_once(xpath, format!("{xpath} found in document, ignored"));
        }
        true
    }

    // -- Elements

    fn start_blob(&mut self, owner: Owner, field: usize, path: String, include_root: bool) {
        self.blob = Some(Blob::new(owner, field, path, include_root));
    }

    /// Captures the start of an element. The prefixes it uses that were declared outside of the
    /// blob are recorded, to be declared again on the top-level element holding it.
    fn blob_start(&mut self, qname: &str, attributes: &[Attribute]) -> Result<(), ReadError> {
        let max = self.max_content_size;
        let too_deep = self.scopes.len() > self.max_nesting_level;
        let Some(blob) = &mut self.blob else {
            return Ok(());
        };
        if blob.srs_name.is_none() {
            blob.srs_name = attributes
                .iter()
                .find(|a| a.local_name == "srsName" && a.namespace.is_none())
                .map(|a| a.value.clone());
        }
        let declared = attributes
            .iter()
            .filter(|a| is_declaration(a))
            .map(|a| a.local_name.clone())
            .collect::<Vec<_>>();
        let used = attributes
            .iter()
            .filter(|a| !is_declaration(a) && a.qname.contains(':'))
            .map(|a| prefix_of(&a.qname))
            .chain(std::iter::once(prefix_of(qname)));
        for prefix in used {
            let mut local = declared.iter().chain(blob.declared.iter().flatten());
            if prefix == "xml" || local.any(|p| p == prefix) {
                continue;
            }
            if let Some(uri) = in_scope(&self.scopes, prefix) {
                blob.inherited
                    .entry(prefix.to_string())
                    .or_insert_with(|| uri.to_string());
            }
        }
        blob.declared.push(declared);

        if too_deep {
            blob.truncated.get_or_insert(Truncation::Nesting);
            return Ok(());
        }
        let start = BytesStart::new(qname.to_string())
            .with_attributes(attributes.iter().map(|a| (a.qname.as_str(), a.value.as_str())));
        if blob.depth() == 1 {
            blob.top = Some(start);
        } else {
            blob.push(&markup(Event::Start(start))?, max);
        }
        Ok(())
    }

    fn open_link(
        &mut self,
        owner: Owner,
        field: &'a Field,
        local_name: &str,
        attributes: &[Attribute],
    ) -> Result<Option<Frame>, ReadError> {
        let Some(related) = field
            .related_class_xpath
            .as_deref()
            .and_then(|x| self.model.find_by_xpath(x))
        else {
            return Ok(None);
        };
        let parent_pkid = self.row_pkid(owner);
        let related_xpath = self.model.class(related).xpath.clone();
        let child_pkid = self.open_context(
            related,
            parent_pkid.clone(),
            local_name,
            attributes,
            &related_xpath,
        );

        // The link itself goes to the row of the enclosing context
        let parent_index = self.contexts.len().checked_sub(2);
        if field.category == FieldCategory::PathToChildElementWithLink {
            if let Some(parent) = parent_index.and_then(|i| self.contexts.get_mut(i)) {
                let row = match owner {
                    Owner::Context => Some(&mut parent.row),
                    Owner::Group(class) => parent
                        .groups
                        .iter_mut()
                        .rev()
                        .find(|g| g.class == class)
                        .map(|g| &mut g.row),
                };
                if let Some(row) = row {
                    row.set(field.name.clone(), Value::String(child_pkid.clone()));
                }
            }
        }
        if field.category == FieldCategory::PathToChildElementWithJunctionTable {
            let junction = field
                .junction_layer
                .as_deref()
                .and_then(|name| self.model.find_by_name(name));
            if let (Some(junction), Some(parent_pkid)) = (junction, parent_pkid) {
                let occurrence = match parent_index.and_then(|i| self.contexts.get_mut(i)) {
                    Some(parent) => {
                        let counter = parent.occurrences.entry(junction).or_default();
                        *counter += 1;
                        *counter
                    }
                    None => 1,
                };
                let mut row = Row::new();
                row.set(OCCURRENCE, Value::Integer(occurrence));
                row.set(PARENT_PKID, Value::String(parent_pkid));
                row.set(CHILD_PKID, Value::String(child_pkid));
                self.emit(junction, row)?;
            }
        }

        let frame = match self.class_index(related).value_field {
            Some(value) => Frame::ContextValue {
                path: related_xpath.clone(),
                field: value,
                nil: is_nil(attributes),
            },
            None => Frame::Context {
                path: related_xpath.clone(),
            },
        };
        if matches!(frame, Frame::ContextValue { .. }) {
            self.text.clear();
            self.text_truncated = false;
        }
        self.process_attributes(&related_xpath, attributes)?;
        Ok(Some(frame))
    }

    fn start_in_context(
        &mut self,
        path: String,
        local_name: &str,
        attributes: &[Attribute],
    ) -> Result<Frame, ReadError> {
        let Some(class) = self.contexts.last().map(|c| c.class) else {
            return Ok(Frame::Skip);
        };
        let index = self.class_index(class);
        if let Some(&(owner_class, f)) = index.fields.get(&path) {
            let owner = if owner_class == class {
                Owner::Context
            } else {
                Owner::Group(owner_class)
            };
            let field = self.field(owner_class, f);
            if field.ignored {
                return Ok(Frame::Skip);
            }
            self.prepare_row(owner, f, false)?;
            match field.category {
                FieldCategory::Regular => {
                    if field.is_geometry() || field.field_type == FieldType::AnyType {
                        let include_root = field.include_this_element_in_blob;
                        self.start_blob(owner, f, path.clone(), include_root);
                        if include_root {
                            return Ok(Frame::Skip);
                        }
                        // The property element's own attributes are fields
                        self.process_attributes(&path, attributes)?;
                        return Ok(Frame::Skip);
                    }
                    self.text.clear();
                    self.text_truncated = false;
                    self.process_attributes(&path, attributes)?;
                    return Ok(Frame::Field {
                        path,
                        owner,
                        field: f,
                        nil: is_nil(attributes),
                    });
                }
                FieldCategory::Group => return Ok(Frame::Skip),
                _ => {
                    if let Some(frame) = self.open_link(owner, field, local_name, attributes)? {
                        return Ok(frame);
                    }
                    self.warn_once(&path, format!("No layer for {path}"));
                    return Ok(Frame::Skip);
                }
            }
        }
        if index.prefixes.contains(&path) {
            self.process_attributes(&path, attributes)?;
            return Ok(Frame::Path { path });
        }
        if self.is_ignored(&path) {
            return Ok(Frame::Skip);
        }
        self.warn_once(&path, format!("Unexpected element {path}"));
        self.validation_error(format!("Unexpected element {path}"))?;
        Ok(Frame::Skip)
    }
}

fn is_nil(attributes: &[Attribute]) -> bool {
    attributes.iter().any(|a| {
        a.namespace.as_deref() == Some(XSI_NAMESPACE)
            && a.local_name == "nil"
            && matches!(a.value.trim(), "true" | "1")
    })
}

/// Adds `value` to the list `existing`.
fn append(existing: Option<Value>, value: Value) -> Value {
    match (existing, value) {
        (Some(Value::StringList(mut items)), Value::String(s)) => {
            items.push(s);
            Value::StringList(items)
        }
        (Some(Value::IntegerList(mut items)), Value::Integer(i)) => {
            items.push(i);
            Value::IntegerList(items)
        }
        (Some(Value::RealList(mut items)), Value::Real(r)) => {
            items.push(r);
            Value::RealList(items)
        }
        (Some(Value::BooleanList(mut items)), Value::Boolean(b)) => {
            items.push(b);
            Value::BooleanList(items)
        }
        (_, Value::String(s)) => Value::StringList(vec![s]),
        (_, Value::Integer(i)) => Value::IntegerList(vec![i]),
        (_, Value::Real(r)) => Value::RealList(vec![r]),
        (_, Value::Boolean(b)) => Value::BooleanList(vec![b]),
        (_, other) => other,
    }
}

impl SaxHandler for RowHandler<'_, '_> {
    fn start_element(
        &mut self,
        namespace: Option<&str>,
        local_name: &str,
        qname: &str,
        attributes: &[Attribute],
    ) -> Result<(), ReadError> {
        self.scopes.push(
            attributes
                .iter()
                .filter(|a| is_declaration(a))
                .map(|a| (a.local_name.clone(), a.value.clone()))
                .collect(),
        );
        if self.blob.is_some() {
            self.blob_start(qname, attributes)?;
            self.frames.push(Frame::Skip);
            return Ok(());
        }
        let name = self.model_name(namespace, local_name);
        let frame = match self.frames.last() {
            Some(Frame::Skip) => Frame::Skip,
            None | Some(Frame::Outside) => match self.index.roots.get(&name).copied() {
                Some(class) => {
                    self.open_context(class, None, local_name, attributes, &name);
                    self.process_attributes(&name, attributes)?;
                    match self.class_index(class).value_field {
                        Some(field) => {
                            self.text.clear();
                            self.text_truncated = false;
                            Frame::ContextValue {
                                path: name,
                                field,
                                nil: is_nil(attributes),
                            }
                        }
                        None => Frame::Context { path: name },
                    }
                }
                None => Frame::Outside,
            },
            Some(parent) => {
                let path = format!("{}/{name}", parent.path().unwrap_or_default());
                self.start_in_context(path, local_name, attributes)?
            }
        };
        // Blob fields including their own element start capturing here
        if let Some(blob) = &self.blob {
            if blob.include_root && blob.depth() == 0 {
                self.blob_start(qname, attributes)?;
            }
        }
        self.frames.push(frame);
        Ok(())
    }

    fn characters(&mut self, text: &str) -> Result<(), ReadError> {
        let max = self.max_content_size;
        if let Some(blob) = &mut self.blob {
            blob.push(&markup(Event::Text(BytesText::new(text)))?, max);
            return Ok(());
        }
        if matches!(
            self.frames.last(),
            Some(Frame::Field { .. } | Frame::ContextValue { .. })
        ) {
            if self.text.len() + text.len() > max {
                if !self.text_truncated {
                    self.text_truncated = true;
                    self.warn("Text content truncated".into());
                }
                return Ok(());
            }
            self.text.push_str(text);
        }
        Ok(())
    }

    fn end_element(
        &mut self,
        _namespace: Option<&str>,
        _local_name: &str,
        qname: &str,
    ) -> Result<(), ReadError> {
        let frame = self.frames.pop();
        self.scopes.pop();
        let max = self.max_content_size;
        if let Some(blob) = &mut self.blob {
            if blob.depth() > 0 {
                blob.declared.pop();
                if blob.depth() == 0 {
                    blob.close_top(qname, max)?;
                } else {
                    blob.push(&markup(Event::End(BytesEnd::new(qname)))?, max);
                }
                if blob.depth() > 0 || !blob.include_root {
                    return Ok(());
                }
            }
            // The captured element or the property holding it closed
            if let Some(blob) = self.blob.take() {
                self.store_blob(blob);
            }
            return Ok(());
        }
        match frame {
            Some(Frame::Field {
                path,
                owner,
                field,
                nil,
            }) => self.store_text(owner, field, &path, nil),
            Some(Frame::ContextValue { path, field, nil }) => {
                self.store_text(Owner::Context, field, &path, nil);
                self.close_context()?;
            }
            Some(Frame::Context { .. }) => self.close_context()?,
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{analyzer::SchemaAnalyzer, storage::MemoryStore, testing::load_schema};

    const SCHEMA: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
        xmlns:t="urn:t" targetNamespace="urn:t" elementFormDefault="qualified">
      <xs:element name="Root">
        <xs:complexType>
          <xs:sequence>
            <xs:element name="count" type="xs:int" minOccurs="0"/>
            <xs:element name="Item" maxOccurs="unbounded">
              <xs:complexType>
                <xs:sequence>
                  <xs:element name="Name" type="xs:string"/>
                  <xs:element name="Price" type="xs:double" minOccurs="0"/>
                </xs:sequence>
                <xs:attribute name="id" type="xs:string" use="required"/>
              </xs:complexType>
            </xs:element>
          </xs:sequence>
        </xs:complexType>
      </xs:element>
    </xs:schema>"#;

    fn read(document: &str, conf: &Conf) -> (MemoryStore, ReadOutcome) {
        let schemas = load_schema(SCHEMA);
        let (model, _) = SchemaAnalyzer::new(conf).analyze(&schemas).unwrap();
        let mut store = MemoryStore::new();
        let mut source = XmlEventSource::from_string("doc.xml", document);
        let outcome = Reader::new(model, conf)
            .read(&mut source, &mut store)
            .unwrap();
        (store, outcome)
    }

    #[test]
    fn rows_of_nested_layers() {
        let conf = Conf::default();
        let (store, outcome) = read(
            r#"<t:Root xmlns:t="urn:t"><t:count>2</t:count>
                 <t:Item id="a"><t:Name>First</t:Name><t:Price>1.5</t:Price></t:Item>
                 <t:Item id="b"><t:Name>Second</t:Name></t:Item>
               </t:Root>"#,
            &conf,
        );
        assert!(outcome.report().warnings.is_empty());
        let roots = store.rows("Root").unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].get("count"), Some(&Value::Integer(2)));
        let root_pkid = roots[0].get("pkid").cloned().unwrap();

        let items = store.rows("Item").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].get_str("Name"), Some("First"));
        assert_eq!(items[0].get("Price"), Some(&Value::Real(1.5)));
        assert_eq!(items[1].get("Price"), None);
        assert_eq!(items[1].get_str("id"), Some("b"));
        assert!(items.iter().all(|i| i.get("parent_pkid") == Some(&root_pkid)));
        assert_ne!(items[0].get("pkid"), items[1].get("pkid"));
        assert_eq!(outcome.report().rows.get("Item"), Some(&2));
        assert_eq!(store.row_count(crate::metadata::LAYERS_METADATA), 2);
    }

    #[test]
    fn invalid_values_become_null_with_a_warning() {
        let conf = Conf::default();
        let (store, outcome) = read(
            r#"<t:Root xmlns:t="urn:t"><t:count>12x</t:count>
                 <t:Item id="a"><t:Name>First</t:Name></t:Item></t:Root>"#,
            &conf,
        );
        let roots = store.rows("Root").unwrap();
        assert_eq!(roots[0].get("count"), Some(&Value::Null));
        assert_eq!(outcome.report().warnings.len(), 1);
        assert!(outcome.report().warnings[0].contains("12x"));
        assert_eq!(store.row_count("Item"), 1);
    }

    #[test]
    fn unexpected_content_and_validation() {
        let mut conf = Conf::default();
        conf.validation.enabled = true;
        let (_, outcome) = read(
            r#"<t:Root xmlns:t="urn:t"><t:Bogus/><t:Bogus/>
                 <t:Item><t:Name>First</t:Name></t:Item></t:Root>"#,
            &conf,
        );
        let report = outcome.report();
        assert_eq!(report.warnings, ["Unexpected element t:Root/t:Bogus"]);
        assert_eq!(
            report.validation_errors,
            [
                "Unexpected element t:Root/t:Bogus",
                "Unexpected element t:Root/t:Bogus",
                "Missing required attribute t:Root/t:Item/@id",
            ]
        );

        conf.validation.fail_if_error = true;
        let schemas = load_schema(SCHEMA);
        let (model, _) = SchemaAnalyzer::new(&conf).analyze(&schemas).unwrap();
        let mut source =
            XmlEventSource::from_string("doc.xml", r#"<t:Root xmlns:t="urn:t"><t:Bogus/></t:Root>"#);
        let result = Reader::new(model, &conf).read(&mut source, &mut MemoryStore::new());
        assert!(matches!(result, Err(ReadError::Validation(_))));
    }

    #[test]
    fn progress_can_interrupt() {
        let conf = Conf::default();
        let schemas = load_schema(SCHEMA);
        let (model, _) = SchemaAnalyzer::new(&conf).analyze(&schemas).unwrap();
        let mut source = XmlEventSource::from_string(
            "doc.xml",
            r#"<t:Root xmlns:t="urn:t"><t:Item id="a"><t:Name>x</t:Name></t:Item></t:Root>"#,
        );
        let mut store = MemoryStore::new();
        let mut calls = 0;
        let outcome = Reader::new(model, &conf)
            .with_progress(|_| {
                calls += 1;
                false
            })
            .read(&mut source, &mut store)
            .unwrap();
        assert!(outcome.is_interrupted());
        assert!(store.table_names().is_empty());
        assert_eq!(calls, 1);
    }

    #[test]
    fn unused_layers_are_removed() {
        let mut conf = Conf::default();
        conf.layer_building.remove_unused_layers = true;
        conf.layer_building.remove_unused_fields = true;
        let (store, outcome) = read(r#"<t:Root xmlns:t="urn:t"><t:count>1</t:count></t:Root>"#, &conf);
        assert_eq!(outcome.report().removed_layers, ["Item"]);
        assert!(store.table("Item").is_none());
        let columns = store
            .table("Root")
            .unwrap()
            .columns
            .iter()
            .map(|c| c.name.clone())
            .collect::<Vec<_>>();
        assert_eq!(columns, ["pkid", "count"]);
    }

    #[test]
    fn fnv_hash() {
        assert_eq!(fnv1a(b""), 0x811c_9dc5);
        assert_eq!(fnv1a(b"a"), 0xe40c_292c);
    }

    #[test]
    fn schema_locations_of_the_root_element() {
        let source = XmlEventSource::from_string(
            "data/doc.xml",
            r#"<?xml version="1.0"?>
            <t:Root xmlns:t="urn:t" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"
                xsi:schemaLocation="urn:t schemas/t.xsd  urn:u http://example.invalid/u.xsd"/>"#,
        );
        let sources = source.schema_locations().unwrap();
        assert_eq!(
            sources
                .iter()
                .map(|s| (s.namespace.as_deref(), s.location.as_str()))
                .collect::<Vec<_>>(),
            [
                (Some("urn:t"), "data/schemas/t.xsd"),
                (Some("urn:u"), "http://example.invalid/u.xsd"),
            ]
        );
    }
}
