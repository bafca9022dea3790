use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use log::{debug, info};
use rkyv::AlignedVec;
use xz::bufread::XzDecoder;

use crate::data::OsmTables;
use crate::data::features::RenderedOsm;
use crate::data::osm::{parse_document, XmlElement};
use crate::data::table::{Record, Table, TableBuilder, Value};
use crate::errors::{Error, Result};
use crate::etl::render_osm::render;

use super::Etl;

pub const ETL_NAME: &str = "parse_osm";
pub const OUTPUT_FILE_NAME: &str = "osm_tables.rkyv";
pub const JSON_FILE_NAME: &str = "osm_tables.json";

// Provenance and editor bookkeeping that would only clutter the tag columns.
// Same list osmtogeojson strips.
pub(crate) const UNINTERESTING_TAGS: [&str; 9] = [
    "source",
    "source_ref",
    "source:ref",
    "history",
    "attribution",
    "created_by",
    "tiger:county",
    "tiger:tlid",
    "tiger:upload_uuid",
];

// Native attributes that key or type a row. A tag never overrides these.
const RESERVED_KEYS: [&str; 4] = ["id", "lat", "lon", "timestamp"];

/// Whether a tag key survives into the tables.
pub fn is_interesting_tag(key: &str) -> bool {
    !UNINTERESTING_TAGS.contains(&key)
}

/// Flatten an element and its `tag` children into one record: the element's
/// attributes first, then every interesting tag. A tag wins over an attribute
/// of the same name, except for the reserved keying/typed attributes.
pub fn element_to_record(element: &XmlElement) -> Result<Record> {
    let mut record = Record::new();
    for (key, value) in &element.attributes {
        record.insert(key, value.as_str());
    }

    for tag in element.children_named("tag") {
        let key = tag.attr("k")
            .ok_or_else(|| Error::xml(format!("<tag> without k in <{}>", element.name)))?;
        let value = tag.attr("v")
            .ok_or_else(|| Error::xml(format!("<tag k={:?}> without v in <{}>", key, element.name)))?;
        if !is_interesting_tag(key) {
            continue;
        }
        if RESERVED_KEYS.contains(&key) {
            debug!(element = element.name.as_str(), key = key; "Ignoring tag that shadows a reserved attribute");
            continue;
        }
        record.insert(key, value);
    }

    Ok(record)
}

fn required_id<'a>(element: &'a XmlElement) -> Result<&'a str> {
    element.attr("id")
        .ok_or_else(|| Error::xml(format!("<{}> without id attribute", element.name)))
}

/// A row of a link table: the child's own attributes plus the owner's id and
/// the child's position among its siblings.
fn link_record(child: &XmlElement, owner_id: &str, index: usize) -> Record {
    let mut record = Record::new();
    for (key, value) in &child.attributes {
        record.insert(key, value.as_str());
    }
    record.insert("id", owner_id);
    record.insert("index", Value::Integer(index as i64));
    record
}

pub fn read_nodes(doc: &XmlElement) -> Result<Table> {
    // <node id="1705717514" lat="42.3630798" lon="-71.0997601">
    //     <tag k="highway" v="crossing"/>
    // </node>
    let mut builder = TableBuilder::new();
    for xml_node in doc.children_named("node") {
        builder.push(element_to_record(xml_node)?);
    }
    let nodes = builder.build()?;

    if !nodes.is_empty() && !(nodes.has_column("lon") && nodes.has_column("lat")) {
        return Err(Error::xml("<node> elements carry no lon/lat attributes"));
    }
    Ok(nodes)
}

/// Returns `(waynodes, waytags)`.
pub fn read_ways(doc: &XmlElement) -> Result<(Table, Table)> {
    // <way id="8614593">
    //     <nd ref="61326730"/>
    //     <nd ref="61326036"/>
    //     <tag k="highway" v="residential"/>
    // </way>
    let mut waynodes = TableBuilder::new();
    let mut waytags = TableBuilder::new();
    for xml_way in doc.children_named("way") {
        let way_id = required_id(xml_way)?;
        for (index, xml_nd) in xml_way.children_named("nd").enumerate() {
            waynodes.push(link_record(xml_nd, way_id, index));
        }
        waytags.push(element_to_record(xml_way)?);
    }
    Ok((waynodes.build()?, waytags.build()?))
}

/// Returns `(relmembers, reltags)`.
pub fn read_relations(doc: &XmlElement) -> Result<(Table, Table)> {
    // <relation id="1933745">
    //     <member type="way" ref="134055159" role="outer"/>
    //     <tag k="boundary" v="administrative"/>
    // </relation>
    let mut relmembers = TableBuilder::new();
    let mut reltags = TableBuilder::new();
    for xml_rel in doc.children_named("relation") {
        let rel_id = required_id(xml_rel)?;
        for (index, xml_member) in xml_rel.children_named("member").enumerate() {
            relmembers.push(link_record(xml_member, rel_id, index));
        }
        reltags.push(element_to_record(xml_rel)?);
    }
    Ok((relmembers.build()?, reltags.build()?))
}

/// Parse raw OSM XML into the five tables.
pub fn read_tables(content: &[u8]) -> Result<OsmTables> {
    let doc = parse_document(content)?;

    let nodes = read_nodes(&doc)?;
    let (waynodes, waytags) = read_ways(&doc)?;
    let (relmembers, reltags) = read_relations(&doc)?;

    info!(
        nodes = nodes.len(),
        waynodes = waynodes.len(),
        ways = waytags.len(),
        relmembers = relmembers.len(),
        relations = reltags.len();
        "Read OSM tables"
    );

    Ok(OsmTables {
        nodes,
        waynodes,
        waytags,
        relmembers,
        reltags,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// Produce tagged geometries instead of the raw tables.
    pub render: bool,
    /// Leave nodes without tags out of the rendered points.
    pub drop_untagged: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        ReadOptions {
            render: true,
            drop_untagged: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OsmOutput {
    Tables(OsmTables),
    Features(RenderedOsm),
}

pub fn read_osm(content: &[u8], options: &ReadOptions) -> Result<OsmOutput> {
    let tables = read_tables(content)?;
    if options.render {
        Ok(OsmOutput::Features(render(&tables, options.drop_untagged)))
    } else {
        Ok(OsmOutput::Tables(tables))
    }
}

pub fn save_tables(path: &Path, tables: &OsmTables) -> Result<()> {
    let bytes = rkyv::to_bytes::<_, 256>(tables)
        .map_err(|err| Error::cache(format!("Could not serialize tables: {:?}", err)))?;
    fs::write(path, bytes.as_slice())?;
    Ok(())
}

pub fn load_tables(path: &Path) -> Result<OsmTables> {
    let bytes = fs::read(path)?;
    let mut aligned = AlignedVec::with_capacity(bytes.len());
    aligned.extend_from_slice(&bytes);
    rkyv::from_bytes::<OsmTables>(&aligned)
        .map_err(|err| Error::cache(format!("Could not read table cache {:?}: {:?}", path, err)))
}

/// Read an input file, decompressing it first if it is xz-compressed.
fn read_input(path: &Path) -> Result<Vec<u8>> {
    let mut file_reader = BufReader::new(File::open(path)?);
    let mut content = Vec::new();
    if path.extension().is_some_and(|ext| ext == "xz") {
        XzDecoder::new(file_reader).read_to_end(&mut content)?;
    } else {
        file_reader.read_to_end(&mut content)?;
    }
    Ok(content)
}

pub struct ParseOsmEtl {
    input_path: PathBuf,
    write_json: bool,
}

impl ParseOsmEtl {
    pub fn new(input_path: PathBuf, write_json: bool) -> ParseOsmEtl {
        ParseOsmEtl {
            input_path,
            write_json,
        }
    }
}

impl Etl for ParseOsmEtl {
    type Input = Vec<u8>;
    type Output = OsmTables;

    fn etl_name(&self) -> &str {
        ETL_NAME
    }

    fn output_file_name(&self) -> &str {
        OUTPUT_FILE_NAME
    }

    /// The table cache only counts when the JSON export asked for is there too.
    fn is_cached(&self, dir: &Path) -> Result<bool> {
        if !self.output_path(dir).try_exists()? {
            return Ok(false);
        }
        Ok(!self.write_json || dir.join(JSON_FILE_NAME).try_exists()?)
    }

    fn clean(&self, dir: &Path) -> Result<()> {
        for path in [self.output_path(dir), dir.join(JSON_FILE_NAME)] {
            if path.try_exists()? {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn extract(&mut self, _dir: &Path) -> Result<Self::Input> {
        read_input(&self.input_path)
    }

    fn transform(&mut self, input: Self::Input) -> Result<Self::Output> {
        read_tables(&input)
    }

    fn load(&mut self, dir: &Path, output: Self::Output) -> Result<()> {
        if self.write_json {
            let json = serde_json::to_string(&output)
                .map_err(|err| Error::cache(err.to_string()))?;
            fs::write(dir.join(JSON_FILE_NAME), json)?;
        }
        save_tables(&self.output_path(dir), &output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::features::GeometryKind;
    use crate::errors::ErrorKind;

    const SAMPLE: &[u8] = br#"<?xml version="1.0" encoding="UTF-8"?>
<osm version="0.6" generator="Overpass API">
  <node id="1705717514" lat="42.3630798" lon="-71.0997601">
    <tag k="crossing" v="zebra"/>
    <tag k="highway" v="crossing"/>
    <tag k="source" v="Bing"/>
  </node>
  <node id="61326730" lat="42.30" lon="-71.10"/>
  <node id="61326036" lat="42.31" lon="-71.11"/>
  <way id="8614593">
    <nd ref="61326730"/>
    <nd ref="61326036"/>
    <nd ref="1705717514"/>
    <tag k="attribution" v="MassGIS"/>
    <tag k="created_by" v="JOSM"/>
    <tag k="highway" v="residential"/>
    <tag k="name" v="Centre Street"/>
  </way>
  <way id="8614594">
    <tag k="highway" v="service"/>
  </way>
  <relation id="1933745">
    <member type="way" ref="8614593" role="outer"/>
    <member type="node" ref="61326730" role=""/>
    <tag k="boundary" v="administrative"/>
    <tag k="tiger:county" v="Middlesex"/>
  </relation>
</osm>"#;

    fn text(value: Option<&Value>) -> Option<&str> {
        value.and_then(Value::as_str)
    }

    #[test]
    fn denylist_matches_exact_keys() {
        for key in UNINTERESTING_TAGS {
            assert!(!is_interesting_tag(key));
        }
        assert!(is_interesting_tag("highway"));
        assert!(is_interesting_tag("tiger:cfcc"));
        assert!(is_interesting_tag("sources"));
    }

    #[test]
    fn flattening_merges_tags_over_attributes() {
        let doc = parse_document(SAMPLE).unwrap();
        let node = doc.children_named("node").next().unwrap();
        let record = element_to_record(node).unwrap();

        assert_eq!(text(record.get("highway")), Some("crossing"));
        assert_eq!(text(record.get("crossing")), Some("zebra"));
        assert_eq!(text(record.get("id")), Some("1705717514"));
        assert_eq!(text(record.get("lat")), Some("42.3630798"));
        assert_eq!(text(record.get("lon")), Some("-71.0997601"));
        assert!(!record.contains_key("source"));
    }

    #[test]
    fn flattening_without_tags_keeps_attributes_only() {
        let doc = parse_document(br#"<osm><node id="5" lat="1" lon="2"/></osm>"#).unwrap();
        let record = element_to_record(&doc.children[0]).unwrap();
        assert_eq!(record.keys().collect::<Vec<_>>(), vec!["id", "lat", "lon"]);
    }

    #[test]
    fn tag_overrides_plain_attribute_but_not_reserved_ones() {
        let doc = parse_document(br#"<osm>
            <node id="5" lat="1" lon="2" version="3">
              <tag k="version" v="tagged"/>
              <tag k="lon" v="east"/>
              <tag k="id" v="other"/>
            </node>
        </osm>"#).unwrap();
        let record = element_to_record(&doc.children[0]).unwrap();
        assert_eq!(text(record.get("version")), Some("tagged"));
        assert_eq!(text(record.get("lon")), Some("2"));
        assert_eq!(text(record.get("id")), Some("5"));
    }

    #[test]
    fn tag_without_key_is_an_xml_error() {
        let doc = parse_document(br#"<osm><node id="5" lat="1" lon="2"><tag v="x"/></node></osm>"#).unwrap();
        assert_eq!(element_to_record(&doc.children[0]).unwrap_err().kind, ErrorKind::Xml);
    }

    #[test]
    fn way_reader_indexes_node_refs_in_document_order() {
        let doc = parse_document(SAMPLE).unwrap();
        let (waynodes, waytags) = read_ways(&doc).unwrap();

        assert_eq!(waytags.len(), 2);
        assert_eq!(waynodes.len(), 3);
        let rows: Vec<_> = waynodes.rows()
            .map(|row| (
                text(row.get("id")).unwrap().to_string(),
                text(row.get("ref")).unwrap().to_string(),
                row.get("index").and_then(Value::as_i64).unwrap(),
            ))
            .collect();
        assert_eq!(rows, vec![
            ("8614593".to_string(), "61326730".to_string(), 0),
            ("8614593".to_string(), "61326036".to_string(), 1),
            ("8614593".to_string(), "1705717514".to_string(), 2),
        ]);

        let untagged_way = waytags.row(1).unwrap();
        assert_eq!(text(untagged_way.get("id")), Some("8614594"));
        assert_eq!(untagged_way.get("name"), Some(&Value::Null));
    }

    #[test]
    fn relation_reader_emits_members_and_tags() {
        let doc = parse_document(SAMPLE).unwrap();
        let (relmembers, reltags) = read_relations(&doc).unwrap();

        assert_eq!(relmembers.columns(), &["type", "ref", "role", "id", "index"]);
        let second = relmembers.row(1).unwrap();
        assert_eq!(text(second.get("type")), Some("node"));
        assert_eq!(text(second.get("role")), Some(""));
        assert_eq!(second.get("index"), Some(&Value::Integer(1)));

        assert_eq!(reltags.len(), 1);
        assert!(!reltags.has_column("tiger:county"));
        assert_eq!(text(reltags.row(0).unwrap().get("boundary")), Some("administrative"));
    }

    #[test]
    fn no_relations_gives_empty_tables() {
        let doc = parse_document(br#"<osm><node id="1" lat="0" lon="0"/></osm>"#).unwrap();
        let (relmembers, reltags) = read_relations(&doc).unwrap();
        assert!(relmembers.is_empty());
        assert!(reltags.is_empty());
    }

    #[test]
    fn denylisted_keys_never_become_columns() {
        let tables = read_tables(SAMPLE).unwrap();
        for table in [&tables.nodes, &tables.waytags, &tables.reltags] {
            for key in UNINTERESTING_TAGS {
                assert!(!table.has_column(key), "{} leaked", key);
            }
        }
        assert_eq!(tables.nodes.row(0).unwrap().get("lat"), Some(&Value::Float(42.3630798)));
    }

    #[test]
    fn malformed_xml_returns_no_tables() {
        let err = read_osm(b"<osm><node id=\"1\" lat=\"0\" lon=\"0\"></osm>", &ReadOptions::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Xml);
    }

    #[test]
    fn read_osm_selects_output_by_render_flag() {
        let options = ReadOptions { render: false, drop_untagged: true };
        match read_osm(SAMPLE, &options).unwrap() {
            OsmOutput::Tables(tables) => assert_eq!(tables.nodes.len(), 3),
            OsmOutput::Features(_) => panic!("expected tables"),
        }

        match read_osm(SAMPLE, &ReadOptions::default()).unwrap() {
            OsmOutput::Features(rendered) => {
                assert_eq!(rendered.count(GeometryKind::Point), 1);
                assert_eq!(rendered.count(GeometryKind::LineString), 2);
            },
            OsmOutput::Tables(_) => panic!("expected features"),
        }
    }

    #[test]
    fn non_finite_coordinates_fail_the_read() {
        let err = read_osm(br#"<osm><node id="1" lat="NaN" lon="inf"/></osm>"#, &ReadOptions::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Coercion);
    }

    #[test]
    fn missing_json_export_is_a_cache_miss() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("sample.osm");
        fs::write(&input, SAMPLE).unwrap();

        ParseOsmEtl::new(input.clone(), false).process(dir.path()).unwrap();
        assert!(!dir.path().join(JSON_FILE_NAME).exists());

        let mut with_json = ParseOsmEtl::new(input, true);
        assert!(!with_json.is_cached(dir.path()).unwrap());
        with_json.process(dir.path()).unwrap();
        assert!(with_json.is_cached(dir.path()).unwrap());
        assert!(dir.path().join(JSON_FILE_NAME).exists());
    }

    #[test]
    fn etl_round_trips_through_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("sample.osm");
        fs::write(&input, SAMPLE).unwrap();

        let mut etl = ParseOsmEtl::new(input, true);
        etl.process(dir.path()).unwrap();
        assert!(etl.is_cached(dir.path()).unwrap());
        assert!(dir.path().join(JSON_FILE_NAME).exists());

        let cached = load_tables(&etl.output_path(dir.path())).unwrap();
        assert_eq!(cached, read_tables(SAMPLE).unwrap());

        etl.clean(dir.path()).unwrap();
        assert!(!etl.is_cached(dir.path()).unwrap());
        assert!(!dir.path().join(JSON_FILE_NAME).exists());
    }
}
