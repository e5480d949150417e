//! The configuration document driving analysis, reading and writing.
//!
//! Every element of the document is optional; missing ones keep the values of
//! [`Conf::default`].

use std::{collections::HashMap, path::Path, path::PathBuf, time::Duration};

use roxmltree::{Document, Node};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfError {
    #[error("failed to read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Parse(#[from] roxmltree::Error),
    #[error("unexpected root element <{0}> in configuration")]
    UnexpectedRoot(String),
    #[error("invalid value {value:?} for {what}")]
    InvalidValue { what: &'static str, value: String },
}

pub const MIN_IDENTIFIER_MAX_LENGTH: usize = 10;

#[derive(Clone, Debug)]
pub struct Conf {
    pub allow_remote_schema_download: bool,
    pub schema_cache: SchemaCacheConf,
    pub schema_full_checking: bool,
    pub handle_multiple_imports: bool,
    pub validation: ValidationConf,
    pub layer_building: LayerBuildingRules,
    pub typing_constraints: TypingConstraints,
    pub ignored_xpaths: IgnoredXPaths,
    pub xlink: XLinkResolutionConf,
    pub writer: WriterConf,
}

#[derive(Clone, Debug)]
pub struct SchemaCacheConf {
    pub enabled: bool,
    pub directory: Option<PathBuf>,
}

#[derive(Clone, Debug, Default)]
pub struct ValidationConf {
    pub enabled: bool,
    pub fail_if_error: bool,
}

#[derive(Clone, Debug)]
pub struct LayerBuildingRules {
    pub always_generate_pkid: bool,
    pub remove_unused_layers: bool,
    pub remove_unused_fields: bool,
    pub use_arrays: bool,
    pub use_null_state: bool,
    pub include_geometry_xml: bool,
    pub instantiate_gml_features_only: bool,
    /// 0 means unlimited
    pub identifier_max_length: usize,
    pub case_insensitive_identifier: bool,
    pub postgresql_identifier_laundering: bool,
    pub flattening: FlatteningRules,
}

#[derive(Clone, Debug)]
pub struct FlatteningRules {
    pub maximum_number_of_fields: usize,
    pub namespaces: HashMap<String, String>,
    pub force_xpaths: Vec<String>,
    pub disable_xpaths: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct TypingConstraints {
    pub namespaces: HashMap<String, String>,
    pub child_constraints: Vec<ChildConstraint>,
}

/// Restricts the elements that may realize the abstract children of a container.
#[derive(Clone, Debug, Default)]
pub struct ChildConstraint {
    pub container_xpath: String,
    pub children: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct IgnoredXPaths {
    pub warn_if_found_in_document: bool,
    pub namespaces: HashMap<String, String>,
    pub xpaths: Vec<IgnoredXPath>,
}

#[derive(Clone, Debug)]
pub struct IgnoredXPath {
    pub xpath: String,
    /// Overrides [`IgnoredXPaths::warn_if_found_in_document`] for this path
    pub warn: Option<bool>,
}

#[derive(Clone, Debug)]
pub struct XLinkResolutionConf {
    pub timeout: Duration,
    /// `None` is unlimited
    pub max_global_resolution_time: Option<Duration>,
    pub max_file_size: u64,
    pub cache_directory: Option<PathBuf>,
    pub default_resolution: Option<XLinkRule>,
    pub url_specific_rules: Vec<XLinkRule>,
    pub resolve_internal_xlinks: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResolutionMode {
    RawContent,
    FieldsFromXPath,
}

#[derive(Clone, Debug)]
pub struct XLinkRule {
    /// `None` for the default rule
    pub url_prefix: Option<String>,
    pub http_headers: Vec<(String, String)>,
    pub allow_remote_download: bool,
    pub resolution_mode: ResolutionMode,
    pub cache_results: bool,
    pub fields: Vec<DerivedField>,
}

/// A column filled from the document an xlink points to.
#[derive(Clone, Debug)]
pub struct DerivedField {
    pub name: String,
    pub field_type: String,
    pub xpath: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LineFormat {
    Native,
    Lf,
    CrLf,
}

impl LineFormat {
    pub fn eol(self) -> &'static str {
        match self {
            Self::Lf => "\n",
            Self::CrLf => "\r\n",
            Self::Native if cfg!(windows) => "\r\n",
            Self::Native => "\n",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SrsNameFormat {
    Short,
    OgcUrn,
    OgcUrl,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Wrapping {
    Wfs2FeatureCollection,
    GmlasFeatureCollection,
}

#[derive(Clone, Debug)]
pub struct WriterConf {
    pub indentation_size: usize,
    pub comment: Option<String>,
    pub line_format: LineFormat,
    pub srs_name_format: SrsNameFormat,
    pub wrapping: Wrapping,
    pub timestamp: Option<String>,
    pub wfs20_schema_location: String,
}

pub const WFS20_SCHEMA_LOCATION: &str = "http://schemas.opengis.net/wfs/2.0/wfs.xsd";

impl Default for Conf {
    fn default() -> Self {
        Self {
            allow_remote_schema_download: true,
            schema_cache: SchemaCacheConf {
                enabled: true,
                directory: None,
            },
            schema_full_checking: false,
            handle_multiple_imports: false,
            validation: ValidationConf::default(),
            layer_building: LayerBuildingRules::default(),
            typing_constraints: TypingConstraints::default(),
            ignored_xpaths: IgnoredXPaths {
                warn_if_found_in_document: true,
                namespaces: HashMap::new(),
                xpaths: Vec::new(),
            },
            xlink: XLinkResolutionConf::default(),
            writer: WriterConf::default(),
        }
    }
}

impl Default for LayerBuildingRules {
    fn default() -> Self {
        Self {
            always_generate_pkid: false,
            remove_unused_layers: false,
            remove_unused_fields: false,
            use_arrays: true,
            use_null_state: false,
            include_geometry_xml: false,
            instantiate_gml_features_only: true,
            identifier_max_length: 0,
            case_insensitive_identifier: true,
            postgresql_identifier_laundering: true,
            flattening: FlatteningRules {
                maximum_number_of_fields: 10,
                namespaces: HashMap::new(),
                force_xpaths: Vec::new(),
                disable_xpaths: Vec::new(),
            },
        }
    }
}

impl Default for XLinkResolutionConf {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_global_resolution_time: None,
            max_file_size: 1024 * 1024,
            cache_directory: None,
            default_resolution: None,
            url_specific_rules: Vec::new(),
            resolve_internal_xlinks: true,
        }
    }
}

impl Default for XLinkRule {
    fn default() -> Self {
        Self {
            url_prefix: None,
            http_headers: Vec::new(),
            allow_remote_download: true,
            resolution_mode: ResolutionMode::RawContent,
            cache_results: false,
            fields: Vec::new(),
        }
    }
}

impl Default for WriterConf {
    fn default() -> Self {
        Self {
            indentation_size: 2,
            comment: None,
            line_format: LineFormat::Native,
            srs_name_format: SrsNameFormat::OgcUrl,
            wrapping: Wrapping::Wfs2FeatureCollection,
            timestamp: None,
            wfs20_schema_location: WFS20_SCHEMA_LOCATION.into(),
        }
    }
}

impl Conf {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_xml_str(&text)
    }

    pub fn from_xml_str(source: &str) -> Result<Self, ConfError> {
        let xml = Document::parse(source)?;
        let root = xml.root_element();
        if root.tag_name().name() != "Configuration" {
            return Err(ConfError::UnexpectedRoot(root.tag_name().name().into()));
        }

        let mut conf = Self::default();
        if let Some(v) = bool_at(root, &["AllowRemoteSchemaDownload"])? {
            conf.allow_remote_schema_download = v;
        }
        if let Some(cache) = child(root, "SchemaCache") {
            if let Some(v) = bool_attribute(cache, "enabled")? {
                conf.schema_cache.enabled = v;
            }
            conf.schema_cache.directory = text_at(cache, &["Directory"]).map(PathBuf::from);
        }
        if let Some(v) = bool_at(root, &["SchemaAnalysisOptions", "SchemaFullChecking"])? {
            conf.schema_full_checking = v;
        }
        if let Some(v) = bool_at(root, &["SchemaAnalysisOptions", "HandleMultipleImports"])? {
            conf.handle_multiple_imports = v;
        }
        if let Some(validation) = child(root, "Validation") {
            conf.validation.enabled = bool_attribute(validation, "enabled")?.unwrap_or(false);
            if let Some(v) = bool_at(validation, &["FailIfError"])? {
                conf.validation.fail_if_error = v;
            }
        }
        if let Some(rules) = child(root, "LayerBuildingRules") {
            conf.layer_building.read(rules)?;
        }
        if let Some(constraints) = child(root, "TypingConstraints") {
            conf.typing_constraints.namespaces = namespaces(constraints);
            for constraint in children(constraints, "ChildConstraint") {
                conf.typing_constraints.child_constraints.push(ChildConstraint {
                    container_xpath: text_at(constraint, &["ContainerXPath"]).unwrap_or_default(),
                    children: child(constraint, "ChildrenElements")
                        .map(|c| children(c, "Element").map(text).collect())
                        .unwrap_or_default(),
                });
            }
        }
        if let Some(ignored) = child(root, "IgnoredXPaths") {
            if let Some(v) = bool_at(ignored, &["WarnIfIgnoredXPathFoundInDocInstance"])? {
                conf.ignored_xpaths.warn_if_found_in_document = v;
            }
            conf.ignored_xpaths.namespaces = namespaces(ignored);
            for xpath in children(ignored, "XPath") {
                let mut value = text(xpath);
                if !value.starts_with('/') {
                    value.insert_str(0, "//");
                }
                conf.ignored_xpaths.xpaths.push(IgnoredXPath {
                    xpath: value,
                    warn: bool_attribute(xpath, "warnIfIgnoredXPathFoundInDocInstance")?,
                });
            }
        }
        if let Some(xlink) = child(root, "XLinkResolution") {
            conf.xlink.read(xlink)?;
        }
        if let Some(writer) = child(root, "WriterConfig") {
            conf.writer.read(writer)?;
        }
        Ok(conf)
    }

    /// The identifier length limit in effect, if any.
    pub fn identifier_max_length(&self) -> Option<usize> {
        let length = self.layer_building.identifier_max_length;
        (length >= MIN_IDENTIFIER_MAX_LENGTH).then_some(length)
    }
}

impl LayerBuildingRules {
    fn read(&mut self, node: Node) -> Result<(), ConfError> {
        let flags: [(&[&str], &mut bool); 9] = [
            (&["AlwaysGeneratePkid"], &mut self.always_generate_pkid),
            (&["RemoveUnusedLayers"], &mut self.remove_unused_layers),
            (&["RemoveUnusedFields"], &mut self.remove_unused_fields),
            (&["UseArrays"], &mut self.use_arrays),
            (&["UseNullState"], &mut self.use_null_state),
            (&["GML", "IncludeGeometryXML"], &mut self.include_geometry_xml),
            (
                &["GML", "InstantiateGMLFeaturesOnly"],
                &mut self.instantiate_gml_features_only,
            ),
            (
                &["CaseInsensitiveIdentifier"],
                &mut self.case_insensitive_identifier,
            ),
            (
                &["PostgreSQLIdentifierLaundering"],
                &mut self.postgresql_identifier_laundering,
            ),
        ];
        for (path, flag) in flags {
            if let Some(v) = bool_at(node, path)? {
                *flag = v;
            }
        }
        if let Some(v) = parse_at::<usize>(node, &["IdentifierMaxLength"], "IdentifierMaxLength")? {
            self.identifier_max_length = v;
        }
        if let Some(flattening) = child(node, "Flatening") {
            if let Some(v) = parse_at::<usize>(
                flattening,
                &["MaximumNumberOfFields"],
                "MaximumNumberOfFields",
            )? {
                self.flattening.maximum_number_of_fields = v;
            }
            self.flattening.namespaces = namespaces(flattening);
            self.flattening.force_xpaths = children(flattening, "ForceFlatteningXPath")
                .map(text)
                .collect();
            self.flattening.disable_xpaths = children(flattening, "DisableFlatteningXPath")
                .map(text)
                .collect();
        }
        Ok(())
    }
}

impl XLinkResolutionConf {
    fn read(&mut self, node: Node) -> Result<(), ConfError> {
        if let Some(v) = parse_at::<u64>(node, &["Timeout"], "Timeout")? {
            self.timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_at::<u64>(node, &["MaxGlobalResolutionTime"], "MaxGlobalResolutionTime")? {
            self.max_global_resolution_time = (v > 0).then(|| Duration::from_secs(v));
        }
        if let Some(v) = parse_at::<u64>(node, &["MaxFileSize"], "MaxFileSize")? {
            self.max_file_size = v;
        }
        self.cache_directory = text_at(node, &["CacheDirectory"]).map(PathBuf::from);
        if let Some(default) = child(node, "DefaultResolution") {
            if bool_attribute(default, "enabled")?.unwrap_or(false) {
                self.default_resolution = Some(read_rule(default, None)?);
            }
        }
        for rule in children(node, "URLSpecificResolution") {
            let prefix = text_at(rule, &["URLPrefix"]).unwrap_or_default();
            self.url_specific_rules.push(read_rule(rule, Some(prefix))?);
        }
        if let Some(v) = bool_at(node, &["ResolveInternalXLinks"])? {
            self.resolve_internal_xlinks = v;
        }
        Ok(())
    }

    /// The rule applying to `url`: the first URL-specific rule whose prefix matches, otherwise
    /// the default rule if it is enabled.
    pub fn rule_for(&self, url: &str) -> Option<&XLinkRule> {
        self.url_specific_rules
            .iter()
            .find(|r| r.url_prefix.as_deref().is_some_and(|p| url.starts_with(p)))
            .or(self.default_resolution.as_ref())
    }
}

fn read_rule(node: Node, url_prefix: Option<String>) -> Result<XLinkRule, ConfError> {
    let mut rule = XLinkRule {
        url_prefix,
        ..Default::default()
    };
    for header in children(node, "HTTPHeader") {
        if let (Some(name), Some(value)) = (text_at(header, &["Name"]), text_at(header, &["Value"]))
        {
            rule.http_headers.push((name, value));
        }
    }
    if let Some(v) = bool_at(node, &["AllowRemoteDownload"])? {
        rule.allow_remote_download = v;
    }
    if let Some(mode) = text_at(node, &["ResolutionMode"]) {
        rule.resolution_mode = match mode.as_str() {
            "RawContent" => ResolutionMode::RawContent,
            "FieldsFromXPath" => ResolutionMode::FieldsFromXPath,
            _ => {
                return Err(ConfError::InvalidValue {
                    what: "ResolutionMode",
                    value: mode,
                })
            }
        };
    }
    // Links found in resolved documents are never followed
    if let Some(v) = parse_at::<u32>(node, &["ResolutionDepth"], "ResolutionDepth")? {
        if v != 1 {
            warn!("Only a resolution depth of 1 is supported, got {v}");
        }
    }
    if let Some(v) = bool_at(node, &["CacheResults"])? {
        rule.cache_results = v;
    }
    for field in children(node, "Field") {
        rule.fields.push(DerivedField {
            name: text_at(field, &["Name"]).unwrap_or_default(),
            field_type: text_at(field, &["Type"]).unwrap_or_else(|| "string".into()),
            xpath: text_at(field, &["XPath"]).unwrap_or_default(),
        });
    }
    Ok(rule)
}

impl WriterConf {
    fn read(&mut self, node: Node) -> Result<(), ConfError> {
        if let Some(v) = parse_at::<usize>(node, &["IndentationSize"], "IndentationSize")? {
            self.indentation_size = v.min(8);
        }
        self.comment = text_at(node, &["Comment"]);
        if let Some(v) = text_at(node, &["LineFormat"]) {
            self.line_format = match v.as_str() {
                "NATIVE" => LineFormat::Native,
                "LF" => LineFormat::Lf,
                "CRLF" => LineFormat::CrLf,
                _ => return Err(ConfError::InvalidValue { what: "LineFormat", value: v }),
            };
        }
        if let Some(v) = text_at(node, &["SRSNameFormat"]) {
            self.srs_name_format = match v.as_str() {
                "SHORT" => SrsNameFormat::Short,
                "OGC_URN" => SrsNameFormat::OgcUrn,
                "OGC_URL" => SrsNameFormat::OgcUrl,
                _ => return Err(ConfError::InvalidValue { what: "SRSNameFormat", value: v }),
            };
        }
        if let Some(v) = text_at(node, &["Wrapping"]) {
            self.wrapping = v.parse()?;
        }
        self.timestamp = text_at(node, &["Timestamp"]);
        if let Some(v) = text_at(node, &["WFS20SchemaLocation"]) {
            self.wfs20_schema_location = v;
        }
        Ok(())
    }
}

impl std::str::FromStr for Wrapping {
    type Err = ConfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WFS2_FEATURECOLLECTION" => Ok(Self::Wfs2FeatureCollection),
            "GMLAS_FEATURECOLLECTION" => Ok(Self::GmlasFeatureCollection),
            _ => Err(ConfError::InvalidValue {
                what: "Wrapping",
                value: s.into(),
            }),
        }
    }
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
}

fn children<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children()
        .filter(move |c| c.is_element() && c.tag_name().name() == name)
}

fn descend<'a, 'input>(node: Node<'a, 'input>, path: &[&str]) -> Option<Node<'a, 'input>> {
    path.iter().try_fold(node, |n, name| child(n, name))
}

fn text(node: Node) -> String {
    node.text().unwrap_or_default().trim().to_string()
}

fn text_at(node: Node, path: &[&str]) -> Option<String> {
    descend(node, path).map(text)
}

fn parse_bool(what: &'static str, value: &str) -> Result<bool, ConfError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ConfError::InvalidValue {
            what,
            value: value.into(),
        }),
    }
}

fn bool_at(node: Node, path: &[&str]) -> Result<Option<bool>, ConfError> {
    match text_at(node, path) {
        Some(v) => parse_bool("boolean setting", &v).map(Some),
        None => Ok(None),
    }
}

fn bool_attribute(node: Node, name: &str) -> Result<Option<bool>, ConfError> {
    node.attribute(name)
        .map(|v| parse_bool("boolean attribute", v))
        .transpose()
}

fn parse_at<T: std::str::FromStr>(
    node: Node,
    path: &[&str],
    what: &'static str,
) -> Result<Option<T>, ConfError> {
    text_at(node, path)
        .map(|v| v.parse().map_err(|_| ConfError::InvalidValue { what, value: v }))
        .transpose()
}

fn namespaces(node: Node) -> HashMap<String, String> {
    child(node, "Namespaces")
        .map(|ns| {
            children(ns, "Namespace")
                .filter_map(|n| Some((n.attribute("prefix")?.into(), n.attribute("uri")?.into())))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let conf = Conf::default();
        assert!(conf.layer_building.use_arrays);
        assert_eq!(conf.layer_building.flattening.maximum_number_of_fields, 10);
        assert_eq!(conf.xlink.timeout, Duration::from_secs(10));
        assert_eq!(conf.xlink.max_global_resolution_time, None);
        assert_eq!(conf.writer.indentation_size, 2);
        assert_eq!(conf.identifier_max_length(), None);
    }

    #[test]
    fn read_document() {
        let conf = Conf::from_xml_str(
            r#"<Configuration>
              <Validation enabled="true"><FailIfError>true</FailIfError></Validation>
              <LayerBuildingRules>
                <UseArrays>false</UseArrays>
                <IdentifierMaxLength>16</IdentifierMaxLength>
                <GML><InstantiateGMLFeaturesOnly>false</InstantiateGMLFeaturesOnly></GML>
                <Flatening>
                  <MaximumNumberOfFields>3</MaximumNumberOfFields>
                  <Namespaces><Namespace prefix="t" uri="urn:t"/></Namespaces>
                  <ForceFlatteningXPath>t:A/t:b</ForceFlatteningXPath>
                </Flatening>
              </LayerBuildingRules>
              <IgnoredXPaths>
                <XPath warnIfIgnoredXPathFoundInDocInstance="false">t:A/@x</XPath>
                <XPath>/t:B</XPath>
              </IgnoredXPaths>
              <XLinkResolution>
                <MaxGlobalResolutionTime>0</MaxGlobalResolutionTime>
                <DefaultResolution enabled="true">
                  <ResolutionMode>FieldsFromXPath</ResolutionMode>
                  <Field><Name>title</Name><XPath>//title</XPath></Field>
                </DefaultResolution>
                <URLSpecificResolution>
                  <URLPrefix>http://example.com/</URLPrefix>
                  <HTTPHeader><Name>Accept</Name><Value>text/xml</Value></HTTPHeader>
                </URLSpecificResolution>
              </XLinkResolution>
              <WriterConfig>
                <IndentationSize>12</IndentationSize>
                <LineFormat>CRLF</LineFormat>
                <Wrapping>GMLAS_FEATURECOLLECTION</Wrapping>
              </WriterConfig>
            </Configuration>"#,
        )
        .unwrap();
        assert!(conf.validation.enabled && conf.validation.fail_if_error);
        assert!(!conf.layer_building.use_arrays);
        assert!(!conf.layer_building.instantiate_gml_features_only);
        assert_eq!(conf.identifier_max_length(), Some(16));
        assert_eq!(conf.layer_building.flattening.maximum_number_of_fields, 3);
        assert_eq!(conf.layer_building.flattening.force_xpaths, ["t:A/t:b"]);
        assert_eq!(conf.ignored_xpaths.xpaths[0].xpath, "//t:A/@x");
        assert_eq!(conf.ignored_xpaths.xpaths[0].warn, Some(false));
        assert_eq!(conf.ignored_xpaths.xpaths[1].xpath, "/t:B");
        assert_eq!(conf.xlink.max_global_resolution_time, None);
        let rule = conf.xlink.rule_for("http://example.com/x").unwrap();
        assert_eq!(rule.http_headers, [("Accept".to_string(), "text/xml".to_string())]);
        let default = conf.xlink.rule_for("http://other.org/").unwrap();
        assert_eq!(default.resolution_mode, ResolutionMode::FieldsFromXPath);
        assert_eq!(default.fields[0].name, "title");
        assert_eq!(conf.writer.indentation_size, 8);
        assert_eq!(conf.writer.line_format, LineFormat::CrLf);
        assert_eq!(conf.writer.wrapping, Wrapping::GmlasFeatureCollection);
    }

    #[test]
    fn reject_bad_values() {
        assert!(matches!(
            Conf::from_xml_str("<Config/>"),
            Err(ConfError::UnexpectedRoot(_))
        ));
        assert!(matches!(
            Conf::from_xml_str(
                "<Configuration><LayerBuildingRules><UseArrays>maybe</UseArrays></LayerBuildingRules></Configuration>"
            ),
            Err(ConfError::InvalidValue { .. })
        ));
    }

    #[test]
    fn resolution_depth_is_checked_but_fixed() {
        let conf = Conf::from_xml_str(
            r#"<Configuration>
              <ExposeMetadataLayers>true</ExposeMetadataLayers>
              <XLinkResolution>
                <DefaultResolution enabled="true"><ResolutionDepth>2</ResolutionDepth></DefaultResolution>
              </XLinkResolution>
            </Configuration>"#,
        )
        .unwrap();
        assert!(conf.xlink.rule_for("http://example.com/").is_some());
        assert!(matches!(
            Conf::from_xml_str(
                "<Configuration><XLinkResolution><DefaultResolution enabled=\"true\"><ResolutionDepth>deep</ResolutionDepth></DefaultResolution></XLinkResolution></Configuration>"
            ),
            Err(ConfError::InvalidValue { .. })
        ));
    }
}
