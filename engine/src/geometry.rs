//! GML geometry decoding and GML 3.2 encoding.

use lazy_static::lazy_static;
use quick_xml::{
    events::{BytesEnd, BytesStart, BytesText, Event},
    Reader, Writer,
};
use regex::Regex;
use thiserror::Error;

use crate::conf::SrsNameFormat;

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error(transparent)]
    Xml(#[from] quick_xml::Error),
    #[error(transparent)]
    Attribute(#[from] quick_xml::events::attributes::AttrError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("no geometry element found")]
    Empty,
    #[error("unsupported geometry element {0}")]
    Unsupported(String),
    #[error("invalid coordinates: {0}")]
    InvalidCoordinates(String),
}

lazy_static! {
    // urn:ogc:def:crs:EPSG::4326, urn:x-ogc:def:crs:EPSG:6.6:4326, http://www.opengis.net/def/crs/EPSG/0/4326
    static ref AUTHORITY_FORM: Regex = Regex::new(
        r"^(?:urn:(?:x-)?ogc:def:crs:EPSG:[^:]*:|https?://www\.opengis\.net/def/crs/EPSG/[^/]+/)(\d+)$"
    )
    .unwrap();
    // EPSG:4326, http://www.opengis.net/gml/srs/epsg.xml#4326
    static ref SHORT_FORM: Regex =
        Regex::new(r"^(?:EPSG:|https?://www\.opengis\.net/gml/srs/epsg\.xml#)(\d+)$").unwrap();
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
}

impl Coord {
    pub fn xy(x: f64, y: f64) -> Self {
        Self { x, y, z: None }
    }

    fn swapped(self) -> Self {
        Self {
            x: self.y,
            y: self.x,
            z: self.z,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Geometry {
    Point(Coord),
    LineString(Vec<Coord>),
    /// Exterior ring first
    Polygon(Vec<Vec<Coord>>),
    MultiPoint(Vec<Coord>),
    MultiLineString(Vec<Vec<Coord>>),
    MultiPolygon(Vec<Vec<Vec<Coord>>>),
    GeometryCollection(Vec<Geometry>),
}

impl Geometry {
    fn map_coords(&mut self, f: &impl Fn(Coord) -> Coord) {
        let apply = |coords: &mut Vec<Coord>| coords.iter_mut().for_each(|c| *c = f(*c));
        match self {
            Self::Point(c) => *c = f(*c),
            Self::LineString(coords) | Self::MultiPoint(coords) => apply(coords),
            Self::Polygon(rings) | Self::MultiLineString(rings) => {
                rings.iter_mut().for_each(&apply)
            }
            Self::MultiPolygon(polygons) => polygons
                .iter_mut()
                .for_each(|rings| rings.iter_mut().for_each(&apply)),
            Self::GeometryCollection(members) => members.iter_mut().for_each(|m| m.map_coords(f)),
        }
    }

    pub fn swap_axes(&mut self) {
        self.map_coords(&Coord::swapped);
    }

    pub fn has_z(&self) -> bool {
        match self {
            Self::Point(c) => c.z.is_some(),
            Self::LineString(coords) | Self::MultiPoint(coords) => {
                coords.iter().any(|c| c.z.is_some())
            }
            Self::Polygon(rings) | Self::MultiLineString(rings) => {
                rings.iter().flatten().any(|c| c.z.is_some())
            }
            Self::MultiPolygon(polygons) => polygons.iter().flatten().flatten().any(|c| c.z.is_some()),
            Self::GeometryCollection(members) => members.iter().any(Geometry::has_z),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Point(_) => "Point",
            Self::LineString(_) => "LineString",
            Self::Polygon(_) => "Polygon",
            Self::MultiPoint(_) => "MultiPoint",
            Self::MultiLineString(_) => "MultiLineString",
            Self::MultiPolygon(_) => "MultiPolygon",
            Self::GeometryCollection(_) => "GeometryCollection",
        }
    }
}

/// A geometry with its spatial reference system. Coordinates are kept in easting/northing
/// (longitude/latitude) order.
#[derive(Clone, Debug, PartialEq)]
pub struct GeometryValue {
    pub geometry: Geometry,
    pub srs_name: Option<String>,
}

impl GeometryValue {
    /// Equality that tolerates a swapped axis order.
    pub fn same_shape(&self, other: &GeometryValue) -> bool {
        if self.geometry == other.geometry {
            return true;
        }
        let mut swapped = other.geometry.clone();
        swapped.swap_axes();
        self.geometry == swapped
    }
}

/// Whether coordinates are swapped to easting/northing order when read.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SwapCoordinates {
    /// Swap for geographic EPSG systems named in URN or URL form
    #[default]
    Auto,
    Yes,
    No,
}

impl SwapCoordinates {
    fn applies(self, srs_name: Option<&str>) -> bool {
        match self {
            Self::Auto => srs_name.is_some_and(has_northing_first_axis_order),
            Self::Yes => true,
            Self::No => false,
        }
    }
}

/// The EPSG code of an SRS name in any of the usual forms.
pub fn epsg_code(srs_name: &str) -> Option<u32> {
    AUTHORITY_FORM
        .captures(srs_name)
        .or_else(|| SHORT_FORM.captures(srs_name))
        .and_then(|caps| caps[1].parse().ok())
}

/// Whether `srs_name` is in a form that mandates the authority axis order and designates a
/// geographic system, whose coordinates then come latitude first.
pub fn has_northing_first_axis_order(srs_name: &str) -> bool {
    AUTHORITY_FORM
        .captures(srs_name)
        .and_then(|caps| caps[1].parse::<u32>().ok())
        .is_some_and(|code| (4000..5000).contains(&code))
}

/// Rewrites an EPSG SRS name in the requested form. Other names are returned unchanged.
pub fn format_srs_name(srs_name: &str, format: SrsNameFormat) -> String {
    match epsg_code(srs_name) {
        Some(code) => match format {
            SrsNameFormat::Short => format!("EPSG:{code}"),
            SrsNameFormat::OgcUrn => format!("urn:ogc:def:crs:EPSG::{code}"),
            SrsNameFormat::OgcUrl => format!("http://www.opengis.net/def/crs/EPSG/0/{code}"),
        },
        None => srs_name.to_string(),
    }
}

/// Formats a double like C's `%.16g`.
pub fn format_number(value: f64) -> String {
    if !value.is_finite() {
        return value.to_string();
    }
    if value == 0.0 {
        return "0".into();
    }
    let scientific = format!("{value:.15e}");
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return value.to_string();
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if !(-4..16).contains(&exponent) {
        let mantissa = trim_fraction(mantissa);
        let sign = if exponent < 0 { '-' } else { '+' };
        return format!("{mantissa}e{sign}{:02}", exponent.abs());
    }
    let decimals = (15 - exponent).max(0) as usize;
    trim_fraction(&format!("{value:.decimals$}")).to_string()
}

fn trim_fraction(number: &str) -> &str {
    if number.contains('.') {
        number.trim_end_matches('0').trim_end_matches('.')
    } else {
        number
    }
}

// -- Decoding

#[derive(Debug, Default)]
struct Node {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
    text: String,
}

impl Node {
    fn attribute(&self, local_name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == local_name)
            .map(|(_, v)| v.as_str())
    }

    fn child(&self, local_name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == local_name)
    }

    fn descendants<'n>(&'n self, out: &mut Vec<&'n Node>) {
        for child in &self.children {
            out.push(child);
            child.descendants(out);
        }
    }

    /// Geometries held by the member properties of a multi geometry.
    fn members(&self) -> impl Iterator<Item = &Node> {
        self.children
            .iter()
            .filter(|c| c.name.ends_with("Member") || c.name.ends_with("Members"))
            .flat_map(|m| m.children.iter())
    }
}

fn local_name(qualified: &[u8]) -> String {
    let name = String::from_utf8_lossy(qualified);
    match name.split_once(':') {
        Some((_, local)) => local.to_string(),
        None => name.into_owned(),
    }
}

fn node_from(start: &BytesStart) -> Result<Node, GeometryError> {
    let mut node = Node {
        name: local_name(start.name().as_ref()),
        ..Default::default()
    };
    for attribute in start.attributes() {
        let attribute = attribute?;
        node.attributes.push((
            local_name(attribute.key.as_ref()),
            attribute.unescape_value()?.into_owned(),
        ));
    }
    Ok(node)
}

fn parse_tree(xml: &str) -> Result<Node, GeometryError> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Node> = Vec::new();
    loop {
        let finished = match reader.read_event()? {
            Event::Start(start) => {
                stack.push(node_from(&start)?);
                None
            }
            Event::Empty(start) => Some(node_from(&start)?),
            Event::End(_) => stack.pop(),
            Event::Text(text) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&text.unescape()?);
                }
                None
            }
            Event::CData(data) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(&data));
                }
                None
            }
            Event::Eof => return Err(GeometryError::Empty),
            _ => None,
        };
        if let Some(node) = finished {
            match stack.last_mut() {
                Some(parent) => parent.children.push(node),
                None => return Ok(node),
            }
        }
    }
}

const GEOMETRY_ELEMENTS: [&str; 16] = [
    "Point",
    "LineString",
    "LinearRing",
    "Curve",
    "CompositeCurve",
    "Polygon",
    "Surface",
    "CompositeSurface",
    "MultiPoint",
    "MultiCurve",
    "MultiLineString",
    "MultiSurface",
    "MultiPolygon",
    "MultiGeometry",
    "Envelope",
    "Box",
];

fn is_geometry(node: &Node) -> bool {
    GEOMETRY_ELEMENTS.contains(&node.name.as_str())
}

/// Decodes the first GML geometry of `xml`, which is either a geometry element or a property
/// element wrapping one.
pub fn parse_gml(xml: &str, swap: SwapCoordinates) -> Result<GeometryValue, GeometryError> {
    let root = parse_tree(xml)?;
    let node = if is_geometry(&root) {
        &root
    } else {
        root.children
            .iter()
            .find(|c| is_geometry(c))
            .ok_or(GeometryError::Empty)?
    };
    let srs_name = node.attribute("srsName").map(str::to_string).or_else(|| {
        let mut all = Vec::new();
        node.descendants(&mut all);
        all.into_iter()
            .find_map(|n| n.attribute("srsName"))
            .map(str::to_string)
    });
    let dimension = dimension_of(node, 2);
    let mut geometry = decode(node, dimension)?;
    if swap.applies(srs_name.as_deref()) {
        geometry.swap_axes();
    }
    Ok(GeometryValue { geometry, srs_name })
}

fn dimension_of(node: &Node, inherited: usize) -> usize {
    node.attribute("srsDimension")
        .and_then(|d| d.parse().ok())
        .unwrap_or(inherited)
}

fn decode(node: &Node, dimension: usize) -> Result<Geometry, GeometryError> {
    let dimension = dimension_of(node, dimension);
    Ok(match node.name.as_str() {
        "Point" => Geometry::Point(
            coords(node, dimension)?
                .into_iter()
                .next()
                .ok_or_else(|| GeometryError::InvalidCoordinates("empty point".into()))?,
        ),
        "LineString" | "LinearRing" => Geometry::LineString(coords(node, dimension)?),
        "Curve" | "CompositeCurve" => Geometry::LineString(curve_coords(node, dimension)?),
        "Polygon" | "PolygonPatch" | "Rectangle" => Geometry::Polygon(rings(node, dimension)?),
        "Surface" | "CompositeSurface" => {
            let mut patches = Vec::new();
            let mut all = Vec::new();
            node.descendants(&mut all);
            for patch in all.into_iter().filter(|n| n.name == "PolygonPatch") {
                patches.push(rings(patch, dimension)?);
            }
            match patches.len() {
                0 => return Err(GeometryError::InvalidCoordinates("surface without patch".into())),
                1 => Geometry::Polygon(patches.remove(0)),
                _ => Geometry::MultiPolygon(patches),
            }
        }
        "MultiPoint" => {
            let mut points = Vec::new();
            for member in node.members() {
                if let Geometry::Point(c) = decode(member, dimension)? {
                    points.push(c);
                }
            }
            Geometry::MultiPoint(points)
        }
        "MultiCurve" | "MultiLineString" => {
            let mut lines = Vec::new();
            for member in node.members() {
                match decode(member, dimension)? {
                    Geometry::LineString(line) => lines.push(line),
                    Geometry::MultiLineString(more) => lines.extend(more),
                    other => return Err(GeometryError::Unsupported(other.type_name().into())),
                }
            }
            Geometry::MultiLineString(lines)
        }
        "MultiSurface" | "MultiPolygon" => {
            let mut polygons = Vec::new();
            for member in node.members() {
                match decode(member, dimension)? {
                    Geometry::Polygon(rings) => polygons.push(rings),
                    Geometry::MultiPolygon(more) => polygons.extend(more),
                    other => return Err(GeometryError::Unsupported(other.type_name().into())),
                }
            }
            Geometry::MultiPolygon(polygons)
        }
        "MultiGeometry" => Geometry::GeometryCollection(
            node.members()
                .map(|m| decode(m, dimension))
                .collect::<Result<_, _>>()?,
        ),
        "Envelope" | "Box" => {
            let corners = match (node.child("lowerCorner"), node.child("upperCorner")) {
                (Some(lower), Some(upper)) => vec![parse_pos(&lower.text)?, parse_pos(&upper.text)?],
                _ => coords(node, dimension)?,
            };
            let [lower, upper] = corners[..] else {
                return Err(GeometryError::InvalidCoordinates("envelope needs two corners".into()));
            };
            Geometry::Polygon(vec![vec![
                Coord::xy(lower.x, lower.y),
                Coord::xy(upper.x, lower.y),
                Coord::xy(upper.x, upper.y),
                Coord::xy(lower.x, upper.y),
                Coord::xy(lower.x, lower.y),
            ]])
        }
        other => return Err(GeometryError::Unsupported(other.to_string())),
    })
}

fn rings(polygon: &Node, dimension: usize) -> Result<Vec<Vec<Coord>>, GeometryError> {
    let mut exterior = None;
    let mut interiors = Vec::new();
    for boundary in &polygon.children {
        let Some(ring) = boundary.children.first() else {
            continue;
        };
        let ring_coords = match ring.name.as_str() {
            "Ring" => curve_coords(ring, dimension)?,
            _ => coords(ring, dimension)?,
        };
        match boundary.name.as_str() {
            "exterior" | "outerBoundaryIs" => exterior = Some(ring_coords),
            "interior" | "innerBoundaryIs" => interiors.push(ring_coords),
            _ => {}
        }
    }
    let mut rings = vec![exterior
        .ok_or_else(|| GeometryError::InvalidCoordinates("polygon without exterior".into()))?];
    rings.extend(interiors);
    Ok(rings)
}

/// Coordinates of every segment of a curve, joints not repeated.
fn curve_coords(curve: &Node, dimension: usize) -> Result<Vec<Coord>, GeometryError> {
    let mut all = Vec::new();
    curve.descendants(&mut all);
    let mut result: Vec<Coord> = Vec::new();
    for segment in all.into_iter().filter(|n| {
        matches!(
            n.name.as_str(),
            "LineStringSegment" | "LineString" | "Arc" | "ArcString"
        )
    }) {
        let segment_coords = coords(segment, dimension)?;
        let skip = usize::from(result.last().is_some() && result.last() == segment_coords.first());
        result.extend(segment_coords.into_iter().skip(skip));
    }
    Ok(result)
}

fn coords(node: &Node, dimension: usize) -> Result<Vec<Coord>, GeometryError> {
    let mut result = Vec::new();
    for child in &node.children {
        match child.name.as_str() {
            "pos" => result.push(parse_pos(&child.text)?),
            "posList" => {
                result.extend(parse_pos_list(&child.text, dimension_of(child, dimension))?)
            }
            "coordinates" => result.extend(parse_coordinates(child)?),
            "coord" => {
                let value = |axis: &str| {
                    child
                        .child(axis)
                        .map(|n| parse_number(&n.text))
                        .transpose()
                };
                result.push(Coord {
                    x: value("X")?.unwrap_or_default(),
                    y: value("Y")?.unwrap_or_default(),
                    z: value("Z")?,
                });
            }
            "pointProperty" | "pointRep" => {
                if let Some(point) = child.children.first() {
                    result.extend(coords(point, dimension)?);
                }
            }
            _ => {}
        }
    }
    Ok(result)
}

fn parse_number(text: &str) -> Result<f64, GeometryError> {
    text.trim()
        .parse()
        .map_err(|_| GeometryError::InvalidCoordinates(text.to_string()))
}

fn parse_pos(text: &str) -> Result<Coord, GeometryError> {
    let values = text
        .split_whitespace()
        .map(parse_number)
        .collect::<Result<Vec<_>, _>>()?;
    match values[..] {
        [x, y] => Ok(Coord::xy(x, y)),
        [x, y, z] => Ok(Coord { x, y, z: Some(z) }),
        _ => Err(GeometryError::InvalidCoordinates(text.to_string())),
    }
}

fn parse_pos_list(text: &str, dimension: usize) -> Result<Vec<Coord>, GeometryError> {
    let values = text
        .split_whitespace()
        .map(parse_number)
        .collect::<Result<Vec<_>, _>>()?;
    if !(2..=3).contains(&dimension) || values.len() % dimension != 0 {
        return Err(GeometryError::InvalidCoordinates(text.to_string()));
    }
    Ok(values
        .chunks(dimension)
        .map(|c| Coord {
            x: c[0],
            y: c[1],
            z: c.get(2).copied(),
        })
        .collect())
}

fn parse_coordinates(node: &Node) -> Result<Vec<Coord>, GeometryError> {
    let cs = node.attribute("cs").unwrap_or(",");
    let decimal = node.attribute("decimal").unwrap_or(".");
    let tuples: Vec<&str> = match node.attribute("ts") {
        Some(ts) if !ts.trim().is_empty() => node.text.split(ts).collect(),
        _ => node.text.split_whitespace().collect(),
    };
    tuples
        .into_iter()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|tuple| {
            let values = tuple
                .split(cs)
                .map(|v| parse_number(&v.replace(decimal, ".")))
                .collect::<Result<Vec<_>, _>>()?;
            match values[..] {
                [x, y] => Ok(Coord::xy(x, y)),
                [x, y, z] => Ok(Coord { x, y, z: Some(z) }),
                _ => Err(GeometryError::InvalidCoordinates(tuple.to_string())),
            }
        })
        .collect()
}

// -- Encoding

/// Encodes `value` as a GML 3.2 geometry element. `gml_id` identifies the top geometry, members
/// get numbered ids derived from it.
pub fn to_gml32(
    value: &GeometryValue,
    srs_format: SrsNameFormat,
    gml_id: &str,
) -> Result<String, GeometryError> {
    let srs_name = value
        .srs_name
        .as_deref()
        .map(|s| format_srs_name(s, srs_format));
    let mut geometry = value.geometry.clone();
    if srs_name.as_deref().is_some_and(has_northing_first_axis_order) {
        geometry.swap_axes();
    }
    let mut encoder = Encoder {
        writer: Writer::new(Vec::new()),
        dimension: if geometry.has_z() { 3 } else { 2 },
        counter: 0,
    };
    let mut attributes = vec![("gml:id", gml_id.to_string())];
    if let Some(srs_name) = srs_name {
        attributes.push(("srsName", srs_name));
    }
    if encoder.dimension == 3 {
        attributes.push(("srsDimension", "3".into()));
    }
    encoder.geometry(&geometry, &attributes, gml_id)?;
    Ok(String::from_utf8_lossy(&encoder.writer.into_inner()).into_owned())
}

struct Encoder {
    writer: Writer<Vec<u8>>,
    dimension: usize,
    counter: usize,
}

impl Encoder {
    fn start(&mut self, name: &str, attributes: &[(&str, String)]) -> Result<(), GeometryError> {
        let start = BytesStart::new(name)
            .with_attributes(attributes.iter().map(|(k, v)| (*k, v.as_str())));
        self.writer.write_event(Event::Start(start))?;
        Ok(())
    }

    fn end(&mut self, name: &str) -> Result<(), GeometryError> {
        self.writer.write_event(Event::End(BytesEnd::new(name)))?;
        Ok(())
    }

    fn text_element(&mut self, name: &str, text: &str) -> Result<(), GeometryError> {
        self.start(name, &[])?;
        self.writer.write_event(Event::Text(BytesText::new(text)))?;
        self.end(name)
    }

    fn coordinates(&self, coords: &[Coord]) -> String {
        coords
            .iter()
            .flat_map(|c| {
                let mut values = vec![c.x, c.y];
                if self.dimension == 3 {
                    values.push(c.z.unwrap_or_default());
                }
                values
            })
            .map(format_number)
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn member_id(&mut self, parent_id: &str) -> Vec<(&'static str, String)> {
        self.counter += 1;
        vec![("gml:id", format!("{parent_id}.{}", self.counter))]
    }

    fn ring(&mut self, boundary: &str, ring: &[Coord]) -> Result<(), GeometryError> {
        self.start(boundary, &[])?;
        self.start("gml:LinearRing", &[])?;
        let text = self.coordinates(ring);
        self.text_element("gml:posList", &text)?;
        self.end("gml:LinearRing")?;
        self.end(boundary)
    }

    fn polygon(
        &mut self,
        rings: &[Vec<Coord>],
        attributes: &[(&str, String)],
    ) -> Result<(), GeometryError> {
        self.start("gml:Polygon", attributes)?;
        for (i, ring) in rings.iter().enumerate() {
            self.ring(if i == 0 { "gml:exterior" } else { "gml:interior" }, ring)?;
        }
        self.end("gml:Polygon")
    }

    fn geometry(
        &mut self,
        geometry: &Geometry,
        attributes: &[(&str, String)],
        id: &str,
    ) -> Result<(), GeometryError> {
        match geometry {
            Geometry::Point(c) => {
                self.start("gml:Point", attributes)?;
                let text = self.coordinates(std::slice::from_ref(c));
                self.text_element("gml:pos", &text)?;
                self.end("gml:Point")
            }
            Geometry::LineString(coords) => {
                self.start("gml:LineString", attributes)?;
                let text = self.coordinates(coords);
                self.text_element("gml:posList", &text)?;
                self.end("gml:LineString")
            }
            Geometry::Polygon(rings) => self.polygon(rings, attributes),
            Geometry::MultiPoint(points) => {
                self.start("gml:MultiPoint", attributes)?;
                for point in points {
                    self.start("gml:pointMember", &[])?;
                    let member = self.member_id(id);
                    self.geometry(&Geometry::Point(*point), &member, id)?;
                    self.end("gml:pointMember")?;
                }
                self.end("gml:MultiPoint")
            }
            Geometry::MultiLineString(lines) => {
                self.start("gml:MultiCurve", attributes)?;
                for line in lines {
                    self.start("gml:curveMember", &[])?;
                    let member = self.member_id(id);
                    self.geometry(&Geometry::LineString(line.clone()), &member, id)?;
                    self.end("gml:curveMember")?;
                }
                self.end("gml:MultiCurve")
            }
            Geometry::MultiPolygon(polygons) => {
                self.start("gml:MultiSurface", attributes)?;
                for rings in polygons {
                    self.start("gml:surfaceMember", &[])?;
                    let member = self.member_id(id);
                    self.polygon(rings, &member)?;
                    self.end("gml:surfaceMember")?;
                }
                self.end("gml:MultiSurface")
            }
            Geometry::GeometryCollection(members) => {
                self.start("gml:MultiGeometry", attributes)?;
                for geometry in members {
                    self.start("gml:geometryMember", &[])?;
                    let member = self.member_id(id);
                    self.geometry(geometry, &member, id)?;
                    self.end("gml:geometryMember")?;
                }
                self.end("gml:MultiGeometry")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_order_rules() {
        assert!(has_northing_first_axis_order("urn:ogc:def:crs:EPSG::4326"));
        assert!(has_northing_first_axis_order(
            "http://www.opengis.net/def/crs/EPSG/0/4258"
        ));
        assert!(!has_northing_first_axis_order("EPSG:4326"));
        assert!(!has_northing_first_axis_order("urn:ogc:def:crs:EPSG::25832"));
        assert!(!has_northing_first_axis_order("urn:ogc:def:crs:OGC:1.3:CRS84"));
        assert_eq!(epsg_code("http://www.opengis.net/gml/srs/epsg.xml#27700"), Some(27700));
        assert_eq!(
            format_srs_name("EPSG:4326", SrsNameFormat::OgcUrn),
            "urn:ogc:def:crs:EPSG::4326"
        );
    }

    #[test]
    fn point_in_geographic_urn_is_swapped() {
        let xml = r#"<t:geom xmlns:t="urn:t" xmlns:gml="http://www.opengis.net/gml/3.2">
            <gml:Point gml:id="p1" srsName="urn:ogc:def:crs:EPSG::4326"><gml:pos>49 2</gml:pos></gml:Point>
        </t:geom>"#;
        let value = parse_gml(xml, SwapCoordinates::Auto).unwrap();
        assert_eq!(value.geometry, Geometry::Point(Coord::xy(2.0, 49.0)));
        assert_eq!(value.srs_name.as_deref(), Some("urn:ogc:def:crs:EPSG::4326"));

        let kept = parse_gml(xml, SwapCoordinates::No).unwrap();
        assert_eq!(kept.geometry, Geometry::Point(Coord::xy(49.0, 2.0)));
        assert!(value.same_shape(&kept));
    }

    #[test]
    fn polygons_curves_and_envelopes() {
        let polygon = r#"<gml:Polygon xmlns:gml="http://www.opengis.net/gml/3.2" srsName="EPSG:2154">
            <gml:exterior><gml:LinearRing><gml:posList>0 0 1 0 1 1 0 0</gml:posList></gml:LinearRing></gml:exterior>
            <gml:interior><gml:LinearRing><gml:pos>0.1 0.1</gml:pos><gml:pos>0.2 0.1</gml:pos><gml:pos>0.2 0.2</gml:pos><gml:pos>0.1 0.1</gml:pos></gml:LinearRing></gml:interior>
        </gml:Polygon>"#;
        let value = parse_gml(polygon, SwapCoordinates::Auto).unwrap();
        let Geometry::Polygon(rings) = &value.geometry else {
            panic!("not a polygon: {value:?}");
        };
        assert_eq!(rings.len(), 2);
        assert_eq!(rings[0].len(), 4);

        let curve = r#"<gml:Curve xmlns:gml="http://www.opengis.net/gml/3.2"><gml:segments>
            <gml:LineStringSegment><gml:posList>0 0 1 1</gml:posList></gml:LineStringSegment>
            <gml:LineStringSegment><gml:posList>1 1 2 0</gml:posList></gml:LineStringSegment>
        </gml:segments></gml:Curve>"#;
        let value = parse_gml(curve, SwapCoordinates::Auto).unwrap();
        assert_eq!(
            value.geometry,
            Geometry::LineString(vec![
                Coord::xy(0.0, 0.0),
                Coord::xy(1.0, 1.0),
                Coord::xy(2.0, 0.0)
            ])
        );

        let coordinates = r#"<gml:LineString xmlns:gml="http://www.opengis.net/gml"><gml:coordinates>1,2 3,4</gml:coordinates></gml:LineString>"#;
        let value = parse_gml(coordinates, SwapCoordinates::Auto).unwrap();
        assert_eq!(
            value.geometry,
            Geometry::LineString(vec![Coord::xy(1.0, 2.0), Coord::xy(3.0, 4.0)])
        );

        let envelope = r#"<gml:Envelope xmlns:gml="http://www.opengis.net/gml/3.2"><gml:lowerCorner>0 0</gml:lowerCorner><gml:upperCorner>2 1</gml:upperCorner></gml:Envelope>"#;
        let value = parse_gml(envelope, SwapCoordinates::Auto).unwrap();
        assert!(matches!(value.geometry, Geometry::Polygon(ref r) if r[0].len() == 5));
    }

    #[test]
    fn export_swaps_back_and_parses_again() {
        let value = GeometryValue {
            geometry: Geometry::MultiPoint(vec![Coord::xy(2.5, 49.0), Coord::xy(3.0, 50.25)]),
            srs_name: Some("EPSG:4326".into()),
        };
        let gml = to_gml32(&value, SrsNameFormat::OgcUrl, "f1.geom").unwrap();
        assert!(gml.starts_with(
            r#"<gml:MultiPoint gml:id="f1.geom" srsName="http://www.opengis.net/def/crs/EPSG/0/4326">"#
        ));
        assert!(gml.contains("<gml:pos>49 2.5</gml:pos>"));
        let back = parse_gml(&gml, SwapCoordinates::Auto).unwrap();
        assert_eq!(back.geometry, value.geometry);

        let short = to_gml32(&value, SrsNameFormat::Short, "f1.geom").unwrap();
        assert!(short.contains("<gml:pos>2.5 49</gml:pos>"));
    }

    #[test]
    fn number_formatting() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(0.1 + 0.2), "0.3");
        assert_eq!(format_number(-2.5), "-2.5");
        assert_eq!(format_number(1e20), "1e+20");
        assert_eq!(format_number(0.000012), "1.2e-05");
        assert_eq!(format_number(123456.789), "123456.789");
    }
}
