use std::{fs, path::Path};

use pretty_assertions::assert_eq;
use relmap_engine::{
    geometry::{Coord, Geometry},
    load_schemas, Conf, FieldCategory, MemoryStore, ReadOutcome, Reader, SchemaAnalyzer,
    SchemaModel, Storage, Value, Writer, XmlEventSource,
};
use relmap_xsd::SchemaSource;

fn offline_conf() -> Conf {
    let mut conf = Conf::default();
    conf.allow_remote_schema_download = false;
    conf.schema_cache.enabled = false;
    conf.writer.timestamp = Some("2024-05-01T00:00:00Z".into());
    conf
}

/// Writes `documents` to `dir` and analyzes the first one.
fn analyze(dir: &Path, documents: &[(&str, &str)], conf: &Conf) -> SchemaModel {
    for (name, text) in documents {
        fs::write(dir.join(name), text).unwrap();
    }
    let sources = [SchemaSource {
        namespace: Some("urn:t".into()),
        location: dir.join(documents[0].0).to_string_lossy().into_owned(),
    }];
    let schemas = load_schemas(conf, &sources).unwrap();
    let (model, warnings) = SchemaAnalyzer::new(conf).analyze(&schemas).unwrap();
    assert_eq!(warnings, Vec::<String>::new());
    model
}

fn read(model: SchemaModel, conf: &Conf, document: &str) -> (MemoryStore, ReadOutcome) {
    let mut store = MemoryStore::new();
    let mut source = XmlEventSource::from_string("doc.xml", document);
    let outcome = Reader::new(model, conf)
        .read(&mut source, &mut store)
        .unwrap();
    (store, outcome)
}

fn write(store: &MemoryStore, conf: &Conf) -> String {
    let mut out = Vec::new();
    Writer::new(conf).write(store, &mut out, None).unwrap();
    String::from_utf8(out).unwrap()
}

/// The element with its namespaced name, sorted attributes, trimmed text and children.
fn canonical(node: roxmltree::Node) -> String {
    let name = node.tag_name();
    let mut attributes = node
        .attributes()
        .filter(|a| a.name() != "schemaLocation")
        .map(|a| format!(" {{{}}}{}={:?}", a.namespace().unwrap_or(""), a.name(), a.value()))
        .collect::<Vec<_>>();
    attributes.sort();
    let mut text = format!(
        "<{{{}}}{}{}>",
        name.namespace().unwrap_or(""),
        name.name(),
        attributes.concat()
    );
    for child in node.children() {
        if child.is_element() {
            text.push_str(&canonical(child));
        } else if child.is_text() {
            text.push_str(child.text().unwrap_or("").trim());
        }
    }
    text.push_str("</>");
    text
}

/// Canonical forms of the members of a written feature collection.
fn members(document: &str) -> Vec<String> {
    let document = roxmltree::Document::parse(document).unwrap();
    document
        .root_element()
        .children()
        .filter(|c| c.is_element())
        .filter_map(|member| member.children().find(|c| c.is_element()))
        .map(canonical)
        .collect()
}

fn canonical_elements(document: &str) -> Vec<String> {
    let document = roxmltree::Document::parse(document).unwrap();
    let root = document.root_element();
    if root.tag_name().namespace() == Some("urn:c") {
        root.children().filter(|c| c.is_element()).map(canonical).collect()
    } else {
        vec![canonical(root)]
    }
}

const ROOT_ITEM: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
    xmlns:t="urn:t" targetNamespace="urn:t" elementFormDefault="qualified">
  <xs:element name="Root">
    <xs:complexType>
      <xs:sequence>
        <xs:element name="title" type="xs:string"/>
        <xs:element name="count" type="xs:int" minOccurs="0"/>
        <xs:element name="Item" maxOccurs="unbounded">
          <xs:complexType>
            <xs:sequence><xs:element name="Name" type="xs:string"/></xs:sequence>
            <xs:attribute name="id" type="xs:ID" use="required"/>
            <xs:attribute name="lang" type="xs:string"/>
          </xs:complexType>
        </xs:element>
        <xs:element name="tag" type="xs:string" minOccurs="0" maxOccurs="unbounded"/>
      </xs:sequence>
    </xs:complexType>
  </xs:element>
</xs:schema>"#;

const ROOT_ITEM_DOCUMENT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<t:Root xmlns:t="urn:t">
  <t:title>Hello &amp; welcome</t:title>
  <t:count>3</t:count>
  <t:Item id="i1" lang="en"><t:Name>one</t:Name></t:Item>
  <t:Item id="i2"><t:Name>two</t:Name></t:Item>
  <t:tag>a</t:tag>
  <t:tag>b</t:tag>
</t:Root>"#;

#[test]
fn root_with_repeated_items() {
    let dir = tempfile::tempdir().unwrap();
    let conf = offline_conf();
    let model = analyze(dir.path(), &[("main.xsd", ROOT_ITEM)], &conf);

    let root = model.class(model.find_by_name("Root").unwrap());
    let link = root.fields.iter().find(|f| f.name == "Item").unwrap();
    assert_eq!(link.category, FieldCategory::PathToChildElementNoLink);
    let tag = root.fields.iter().find(|f| f.name == "tag").unwrap();
    assert!(tag.is_array);

    let (store, outcome) = read(model, &conf, ROOT_ITEM_DOCUMENT);
    let report = outcome.report();
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert_eq!(report.rows.get("Root"), Some(&1));
    assert_eq!(report.rows.get("Item"), Some(&2));

    let item = store.table("Item").unwrap();
    for column in ["id", "Name", "parent_pkid"] {
        assert!(item.column(column).is_some(), "Item has no {column}");
    }
    let items = store.rows("Item").unwrap();
    assert_eq!(items[0].get("Name"), Some(&Value::String("one".into())));
    let roots = store.rows("Root").unwrap();
    assert_eq!(roots[0].get("count"), Some(&Value::Integer(3)));
    assert_eq!(items[1].get("parent_pkid"), roots[0].get("pkid"));
}

#[test]
fn written_documents_match_the_source() {
    let dir = tempfile::tempdir().unwrap();
    let conf = offline_conf();
    let model = analyze(dir.path(), &[("main.xsd", ROOT_ITEM)], &conf);
    let (store, _) = read(model, &conf, ROOT_ITEM_DOCUMENT);

    let written = write(&store, &conf);
    assert!(written.starts_with(r#"<?xml version="1.0" encoding="utf-8"?>"#));
    assert_eq!(members(&written), canonical_elements(ROOT_ITEM_DOCUMENT));
}

#[test]
fn invalid_integer_becomes_null() {
    let dir = tempfile::tempdir().unwrap();
    let conf = offline_conf();
    let model = analyze(dir.path(), &[("main.xsd", ROOT_ITEM)], &conf);
    let document = r#"<c:Collection xmlns:c="urn:c" xmlns:t="urn:t">
        <t:Root><t:title>a</t:title><t:count>12x</t:count>
          <t:Item id="i1"><t:Name>x</t:Name></t:Item></t:Root>
        <t:Root><t:title>b</t:title><t:count>7</t:count>
          <t:Item id="i2"><t:Name>y</t:Name></t:Item></t:Root>
    </c:Collection>"#;
    let (store, outcome) = read(model, &conf, document);
    assert!(!outcome.is_interrupted());
    assert_eq!(outcome.report().warnings.len(), 1);
    assert!(outcome.report().warnings[0].contains("12x"));

    let roots = store.rows("Root").unwrap();
    assert_eq!(roots.len(), 2);
    assert!(matches!(roots[0].get("count"), None | Some(Value::Null)));
    assert_eq!(roots[1].get("count"), Some(&Value::Integer(7)));
}

const SHARED: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
    xmlns:t="urn:t" targetNamespace="urn:t" elementFormDefault="qualified">
  <xs:element name="Shared">
    <xs:complexType>
      <xs:sequence><xs:element name="v" type="xs:int"/></xs:sequence>
    </xs:complexType>
  </xs:element>
  <xs:element name="Foo">
    <xs:complexType><xs:sequence>
      <xs:element name="label" type="xs:string"/>
      <xs:element ref="t:Shared" maxOccurs="unbounded"/>
    </xs:sequence></xs:complexType>
  </xs:element>
  <xs:element name="Bar">
    <xs:complexType><xs:sequence>
      <xs:element ref="t:Shared" maxOccurs="unbounded"/>
    </xs:sequence></xs:complexType>
  </xs:element>
</xs:schema>"#;

#[test]
fn shared_elements_through_junction_tables() {
    let dir = tempfile::tempdir().unwrap();
    let conf = offline_conf();
    let model = analyze(dir.path(), &[("main.xsd", SHARED)], &conf);

    let shared = model
        .classes()
        .into_iter()
        .filter(|id| model.class(*id).name == "Shared")
        .count();
    assert_eq!(shared, 1);
    for (class, junction) in [("Foo", "Foo_Shared_Shared"), ("Bar", "Bar_Shared_Shared")] {
        let class = model.class(model.find_by_name(class).unwrap());
        let link = class
            .fields
            .iter()
            .find(|f| f.category == FieldCategory::PathToChildElementWithJunctionTable)
            .unwrap();
        assert_eq!(link.junction_layer.as_deref(), Some(junction));
    }

    let document = r#"<c:Collection xmlns:c="urn:c" xmlns:t="urn:t">
      <t:Foo>
        <t:label>first</t:label>
        <t:Shared><t:v>1</t:v></t:Shared>
        <t:Shared><t:v>2</t:v></t:Shared>
      </t:Foo>
      <t:Bar>
        <t:Shared><t:v>3</t:v></t:Shared>
      </t:Bar>
    </c:Collection>"#;
    let (store, outcome) = read(model.clone(), &conf, document);
    assert!(outcome.report().warnings.is_empty(), "{:?}", outcome.report().warnings);
    assert_eq!(store.row_count("Shared"), 3);
    assert_eq!(store.row_count("Foo_Shared_Shared"), 2);
    assert_eq!(store.row_count("Bar_Shared_Shared"), 1);
    let junction = store.rows("Foo_Shared_Shared").unwrap();
    assert_eq!(junction[1].get("occurrence"), Some(&Value::Integer(2)));

    let written = write(&store, &conf);
    assert_eq!(members(&written), canonical_elements(document));

    // The written collection reads back into the same rows
    let (again, _) = read(model, &conf, &written);
    for table in ["Foo", "Bar", "Shared", "Foo_Shared_Shared", "Bar_Shared_Shared"] {
        assert_eq!(again.row_count(table), store.row_count(table), "{table}");
    }
}

#[test]
fn repeated_values_are_never_scalar_columns() {
    let dir = tempfile::tempdir().unwrap();
    let mut conf = offline_conf();
    for use_arrays in [true, false] {
        conf.layer_building.use_arrays = use_arrays;
        let model = analyze(dir.path(), &[("main.xsd", ROOT_ITEM)], &conf);
        for id in model.classes() {
            for field in &model.class(id).fields {
                if field.max_occurs.is_many() && field.category == FieldCategory::Regular {
                    assert!(field.is_array || field.is_list, "{} is scalar", field.name);
                }
            }
        }
    }
}

#[test]
fn long_identifiers_are_truncated_without_collisions() {
    let dir = tempfile::tempdir().unwrap();
    let xsd = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
        xmlns:t="urn:t" targetNamespace="urn:t" elementFormDefault="qualified">
      <xs:element name="MeasurementStation">
        <xs:complexType><xs:sequence>
          <xs:element name="temperatureReadingMinimum" type="xs:double"/>
          <xs:element name="temperatureReadingMaximum" type="xs:double"/>
          <xs:element name="temperatureReadingAverage" type="xs:double"/>
        </xs:sequence></xs:complexType>
      </xs:element>
    </xs:schema>"#;
    let mut conf = offline_conf();
    conf.layer_building.identifier_max_length = 16;
    let model = analyze(dir.path(), &[("main.xsd", xsd)], &conf);
    let again = analyze(dir.path(), &[("main.xsd", xsd)], &conf);

    let class = model.class(model.classes()[0]);
    assert!(class.name.chars().count() <= 16, "{}", class.name);
    let names = class.fields.iter().map(|f| f.name.clone()).collect::<Vec<_>>();
    let mut unique = names.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), names.len(), "{names:?}");
    assert!(names.iter().all(|n| n.chars().count() <= 16), "{names:?}");

    let again = again.class(again.classes()[0]);
    assert_eq!(
        again.fields.iter().map(|f| f.name.clone()).collect::<Vec<_>>(),
        names
    );
}

#[test]
fn relmap_wrapping_writes_a_companion_schema() {
    let dir = tempfile::tempdir().unwrap();
    let mut conf = Conf::from_xml_str(
        r#"<Configuration>
             <AllowRemoteSchemaDownload>false</AllowRemoteSchemaDownload>
             <SchemaCache enabled="false"/>
             <WriterConfig>
               <IndentationSize>4</IndentationSize>
               <Wrapping>GMLAS_FEATURECOLLECTION</Wrapping>
               <Comment>exported</Comment>
             </WriterConfig>
           </Configuration>"#,
    )
    .unwrap();
    conf.writer.timestamp = None;
    let model = analyze(dir.path(), &[("main.xsd", ROOT_ITEM)], &conf);
    let (store, _) = read(model, &conf, ROOT_ITEM_DOCUMENT);

    let output = dir.path().join("out.xml");
    let written = Writer::new(&conf).write_file(&store, &output).unwrap();
    assert_eq!(written, 1);
    let text = fs::read_to_string(&output).unwrap();
    assert!(text.contains("<relmap:FeatureCollection"));
    assert!(text.contains("\n    <relmap:featureMember>"));
    assert!(text.contains("<!-- exported -->"));
    assert!(text.contains("out.xsd"));
    let schema = fs::read_to_string(dir.path().join("out.xsd")).unwrap();
    assert!(schema.contains(r#"<xs:import namespace="urn:t""#));
    assert_eq!(members(&text), canonical_elements(ROOT_ITEM_DOCUMENT));
}

#[test]
fn storage_dump_keeps_everything_the_writer_needs() {
    let dir = tempfile::tempdir().unwrap();
    let conf = offline_conf();
    let model = analyze(dir.path(), &[("main.xsd", ROOT_ITEM)], &conf);
    let (store, _) = read(model, &conf, ROOT_ITEM_DOCUMENT);
    let dump = dir.path().join("store.json");
    store.save(&dump).unwrap();

    let loaded = MemoryStore::load(&dump).unwrap();
    assert_eq!(write(&loaded, &conf), write(&store, &conf));
}

const ANY_CONTENT: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
    xmlns:t="urn:t" targetNamespace="urn:t" elementFormDefault="qualified">
  <xs:element name="Doc">
    <xs:complexType>
      <xs:sequence>
        <xs:element name="name" type="xs:string"/>
        <xs:element name="extra" type="xs:anyType" minOccurs="0"/>
      </xs:sequence>
    </xs:complexType>
  </xs:element>
</xs:schema>"#;

#[test]
fn captured_content_declares_the_namespaces_of_its_ancestors() {
    let dir = tempfile::tempdir().unwrap();
    let conf = offline_conf();
    let model = analyze(dir.path(), &[("main.xsd", ANY_CONTENT)], &conf);
    let document = r#"<t:Doc xmlns:t="urn:t" xmlns:o="urn:o" xmlns="urn:d">
        <t:name>n</t:name>
        <t:extra><o:thing k="1"/><note>hi &amp; bye</note></t:extra>
    </t:Doc>"#;
    let (store, outcome) = read(model, &conf, document);
    assert!(outcome.report().warnings.is_empty(), "{:?}", outcome.report().warnings);

    let docs = store.rows("Doc").unwrap();
    assert_eq!(
        docs[0].get_str("extra"),
        Some(r#"<o:thing k="1" xmlns:o="urn:o"/><note xmlns="urn:d">hi &amp; bye</note>"#)
    );

    let written = write(&store, &conf);
    assert_eq!(members(&written), canonical_elements(document));
}

#[test]
fn captured_content_is_truncated_at_the_size_limit() {
    let dir = tempfile::tempdir().unwrap();
    let conf = offline_conf();
    let model = analyze(dir.path(), &[("main.xsd", ANY_CONTENT)], &conf);
    let document = r#"<t:Doc xmlns:t="urn:t"><t:name>n</t:name><t:extra><a>0123456789</a><b>abcdefghijklmnopqrstuvwxyz</b></t:extra></t:Doc>"#;
    let mut store = MemoryStore::new();
    let mut source = XmlEventSource::from_string("doc.xml", document);
    let outcome = Reader::new(model, &conf)
        .with_max_content_size(30)
        .read(&mut source, &mut store)
        .unwrap();

    let warnings = &outcome.report().warnings;
    assert_eq!(warnings.len(), 1, "{warnings:?}");
    assert!(warnings[0].contains("exceeds 30 bytes"), "{}", warnings[0]);
    // Only complete elements are kept
    let docs = store.rows("Doc").unwrap();
    assert_eq!(docs[0].get_str("name"), Some("n"));
    assert_eq!(docs[0].get_str("extra"), Some("<a>0123456789</a>"));
}

#[test]
fn captured_content_is_truncated_below_the_nesting_limit() {
    let dir = tempfile::tempdir().unwrap();
    let conf = offline_conf();
    let model = analyze(dir.path(), &[("main.xsd", ANY_CONTENT)], &conf);
    let document = r#"<t:Doc xmlns:t="urn:t"><t:name>n</t:name><t:extra><a>1</a><b><c><d>deep</d></c></b></t:extra></t:Doc>"#;
    let mut store = MemoryStore::new();
    let mut source = XmlEventSource::from_string("doc.xml", document);
    let outcome = Reader::new(model, &conf)
        .with_max_nesting_level(4)
        .read(&mut source, &mut store)
        .unwrap();

    let warnings = &outcome.report().warnings;
    assert_eq!(warnings.len(), 1, "{warnings:?}");
    assert!(warnings[0].contains("nested deeper than 4 levels"), "{}", warnings[0]);
    let docs = store.rows("Doc").unwrap();
    assert_eq!(docs[0].get_str("extra"), Some("<a>1</a>"));
}

const GML_STUB: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
    xmlns:gml="http://www.opengis.net/gml/3.2"
    targetNamespace="http://www.opengis.net/gml/3.2" elementFormDefault="qualified">
  <xs:complexType name="PointPropertyType">
    <xs:sequence><xs:any minOccurs="0"/></xs:sequence>
  </xs:complexType>
</xs:schema>"#;

const SITES: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
    xmlns:t="urn:t" xmlns:gml="http://www.opengis.net/gml/3.2"
    targetNamespace="urn:t" elementFormDefault="qualified">
  <xs:import namespace="http://www.opengis.net/gml/3.2" schemaLocation="gml.xsd"/>
  <xs:element name="Site">
    <xs:complexType>
      <xs:sequence>
        <xs:element name="name" type="xs:string"/>
        <xs:element name="location" type="gml:PointPropertyType" minOccurs="0"/>
      </xs:sequence>
    </xs:complexType>
  </xs:element>
</xs:schema>"#;

const WGS84_URN: &str = "urn:ogc:def:crs:EPSG::4326";

const SITES_DOCUMENT: &str = r#"<c:Collection xmlns:c="urn:c" xmlns:t="urn:t"
    xmlns:gml="http://www.opengis.net/gml/3.2">
  <t:Site>
    <t:name>a</t:name>
    <t:location><gml:Point gml:id="p1" srsName="urn:ogc:def:crs:EPSG::4326"><gml:pos>49 2</gml:pos></gml:Point></t:location>
  </t:Site>
  <t:Site>
    <t:name>b</t:name>
    <t:location><gml:Point gml:id="p2"><gml:pos>48 3</gml:pos></gml:Point></t:location>
  </t:Site>
</c:Collection>"#;

fn point_of(row: &relmap_engine::storage::Row) -> (Coord, Option<String>) {
    match row.get("location") {
        Some(Value::Geometry(value)) => match &value.geometry {
            Geometry::Point(coord) => (*coord, value.srs_name.clone()),
            other => panic!("not a point: {other:?}"),
        },
        other => panic!("not a geometry: {other:?}"),
    }
}

#[test]
fn geometries_without_srs_inherit_the_first_one_of_their_field() {
    let dir = tempfile::tempdir().unwrap();
    let conf = offline_conf();
    let model = analyze(dir.path(), &[("main.xsd", SITES), ("gml.xsd", GML_STUB)], &conf);
    let (store, outcome) = read(model, &conf, SITES_DOCUMENT);
    assert!(outcome.report().warnings.is_empty(), "{:?}", outcome.report().warnings);

    // Stored in easting/northing order
    let sites = store.rows("Site").unwrap();
    assert_eq!(
        point_of(&sites[0]),
        (Coord::xy(2.0, 49.0), Some(WGS84_URN.to_string()))
    );
    assert_eq!(
        point_of(&sites[1]),
        (Coord::xy(3.0, 48.0), Some(WGS84_URN.to_string()))
    );
}

#[test]
fn preserved_geometry_markup_is_written_back() {
    let dir = tempfile::tempdir().unwrap();
    let mut conf = offline_conf();
    conf.layer_building.include_geometry_xml = true;
    let model = analyze(dir.path(), &[("main.xsd", SITES), ("gml.xsd", GML_STUB)], &conf);
    let (store, _) = read(model, &conf, SITES_DOCUMENT);

    let preserved = r#"<gml:Point gml:id="p1" srsName="urn:ogc:def:crs:EPSG::4326" xmlns:gml="http://www.opengis.net/gml/3.2"><gml:pos>49 2</gml:pos></gml:Point>"#;
    let sites = store.rows("Site").unwrap();
    assert_eq!(sites[0].get_str("location_xml"), Some(preserved));

    let written = write(&store, &conf);
    assert!(written.contains(preserved), "{written}");
    assert_eq!(members(&written), canonical_elements(SITES_DOCUMENT));
}

#[test]
fn geometries_are_encoded_when_no_markup_was_kept() {
    let dir = tempfile::tempdir().unwrap();
    let conf = offline_conf();
    let model = analyze(dir.path(), &[("main.xsd", SITES), ("gml.xsd", GML_STUB)], &conf);
    let (store, _) = read(model, &conf, SITES_DOCUMENT);
    assert!(store.rows("Site").unwrap()[0].get("location_xml").is_none());

    let written = write(&store, &conf);
    let document = roxmltree::Document::parse(&written).unwrap();
    let points = document
        .descendants()
        .filter(|n| n.has_tag_name(("http://www.opengis.net/gml/3.2", "Point")))
        .collect::<Vec<_>>();
    assert_eq!(points.len(), 2);
    for point in &points {
        assert_eq!(
            point.attribute("srsName"),
            Some("http://www.opengis.net/def/crs/EPSG/0/4326")
        );
    }
    let positions = document
        .descendants()
        .filter(|n| n.has_tag_name(("http://www.opengis.net/gml/3.2", "pos")))
        .filter_map(|n| n.text())
        .collect::<Vec<_>>();
    assert_eq!(positions, ["49 2", "48 3"]);
}
