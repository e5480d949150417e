use std::{fs, time::Duration};

use pretty_assertions::assert_eq;
use relmap_engine::{
    conf::XLinkRule, load_schemas, Conf, MemoryStore, Reader, ResourceCache, SchemaAnalyzer,
    Storage, Value, XmlEventSource,
};
use relmap_xsd::SchemaSource;

const XLINK: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
    targetNamespace="http://www.w3.org/1999/xlink">
  <xs:attribute name="href" type="xs:anyURI"/>
</xs:schema>"#;

const LINKED: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
    xmlns:t="urn:t" xmlns:xlink="http://www.w3.org/1999/xlink"
    targetNamespace="urn:t" elementFormDefault="qualified">
  <xs:import namespace="http://www.w3.org/1999/xlink" schemaLocation="xlink.xsd"/>
  <xs:element name="Doc">
    <xs:complexType>
      <xs:sequence>
        <xs:element name="name" type="xs:string"/>
        <xs:element name="source" minOccurs="0">
          <xs:complexType>
            <xs:attribute ref="xlink:href"/>
          </xs:complexType>
        </xs:element>
      </xs:sequence>
      <xs:attribute name="id" type="xs:ID"/>
    </xs:complexType>
  </xs:element>
</xs:schema>"#;

fn offline_conf() -> Conf {
    let mut conf = Conf::default();
    conf.allow_remote_schema_download = false;
    conf.schema_cache.enabled = false;
    conf
}

#[test]
fn exhausted_resolution_budget_skips_fetches() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("main.xsd"), LINKED).unwrap();
    fs::write(dir.path().join("xlink.xsd"), XLINK).unwrap();

    let mut conf = offline_conf();
    conf.xlink.max_global_resolution_time = Some(Duration::ZERO);
    conf.xlink.default_resolution = Some(XLinkRule::default());
    let sources = [SchemaSource {
        namespace: Some("urn:t".into()),
        location: dir.path().join("main.xsd").to_string_lossy().into_owned(),
    }];
    let schemas = load_schemas(&conf, &sources).unwrap();
    let (model, _) = SchemaAnalyzer::new(&conf).analyze(&schemas).unwrap();

    let href = "http://example.invalid/sources/a.xml";
    let document = format!(
        r#"<t:Doc xmlns:t="urn:t" xmlns:xlink="http://www.w3.org/1999/xlink">
             <t:name>linked</t:name>
             <t:source xlink:href="{href}"/>
           </t:Doc>"#
    );
    let mut store = MemoryStore::new();
    let mut source = XmlEventSource::from_string("doc.xml", document);
    let outcome = Reader::new(model, &conf)
        .read(&mut source, &mut store)
        .unwrap();

    let notes = &outcome.report().xlink_notes;
    assert_eq!(notes.len(), 1);
    assert!(notes[0].contains(href));

    let rows = store.rows("Doc").unwrap();
    assert_eq!(rows.len(), 1);
    let stored_href = rows[0]
        .iter()
        .find(|(column, _)| column.ends_with("_href"))
        .map(|(_, value)| value.clone());
    assert_eq!(stored_href, Some(Value::String(href.into())));
    assert!(rows[0]
        .iter()
        .filter(|(column, _)| column.ends_with("_rawcontent"))
        .all(|(_, value)| value.is_null()));
}

#[test]
fn internal_links_reference_rows_of_the_document() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("main.xsd"), LINKED).unwrap();
    fs::write(dir.path().join("xlink.xsd"), XLINK).unwrap();
    let conf = offline_conf();
    let sources = [SchemaSource {
        namespace: Some("urn:t".into()),
        location: dir.path().join("main.xsd").to_string_lossy().into_owned(),
    }];
    let schemas = load_schemas(&conf, &sources).unwrap();
    let (model, _) = SchemaAnalyzer::new(&conf).analyze(&schemas).unwrap();

    let document = r##"<c:Collection xmlns:c="urn:c" xmlns:t="urn:t"
            xmlns:xlink="http://www.w3.org/1999/xlink">
        <t:Doc id="d1"><t:name>first</t:name></t:Doc>
        <t:Doc id="d2"><t:name>second</t:name><t:source xlink:href="#d1"/></t:Doc>
    </c:Collection>"##;
    let mut store = MemoryStore::new();
    let mut source = XmlEventSource::from_string("doc.xml", document);
    let outcome = Reader::new(model, &conf)
        .read(&mut source, &mut store)
        .unwrap();
    assert!(outcome.report().xlink_notes.is_empty());

    // The optional ID attribute is a plain field, rows get a generated key
    let rows = store.rows("Doc").unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get_str("id"), Some("d1"));
    let first_key = rows[0].get("pkid").cloned();
    assert!(first_key.is_some());
    let link = rows[1]
        .iter()
        .find(|(column, _)| column.ends_with("_pkid") && *column != "pkid")
        .map(|(_, value)| value.clone());
    assert_eq!(link, first_key);
}

#[test]
fn schemas_are_served_from_the_disk_cache() {
    let dir = tempfile::tempdir().unwrap();
    let mut conf = offline_conf();
    conf.schema_cache.enabled = true;
    conf.schema_cache.directory = Some(dir.path().to_path_buf());

    let main = "http://example.invalid/schemas/main.xsd";
    let cache = ResourceCache::for_schemas(&conf);
    assert_eq!(cache.directory(), Some(dir.path()));
    for (url, text) in [
        (main, LINKED),
        ("http://example.invalid/schemas/xlink.xsd", XLINK),
    ] {
        let path = cache.cache_path(url).unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    }

    let sources = [SchemaSource {
        namespace: Some("urn:t".into()),
        location: main.into(),
    }];
    let schemas = load_schemas(&conf, &sources).unwrap();
    let (model, _) = SchemaAnalyzer::new(&conf).analyze(&schemas).unwrap();
    assert!(model.find_by_name("Doc").is_some());
    assert_eq!(
        model
            .namespaces
            .iter()
            .find(|n| n.uri == "urn:t")
            .and_then(|n| n.location.as_deref()),
        Some(main)
    );
}
