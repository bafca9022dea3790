use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use geo::{LineString, Point};
use log::{info, warn};

use crate::data::OsmTables;
use crate::data::features::{Feature, FeatureGeometry, GeometryKind, RenderedOsm, WGS84};
use crate::data::table::{Table, TableRow, Value};
use crate::errors::{Error, Result};
use crate::etl::parse_osm::{self, load_tables};

use super::Etl;

pub const ETL_NAME: &str = "render_osm";
pub const OUTPUT_FILE_NAME: &str = "osm_features.geojson";
/// Records the options the GeoJSON was rendered with.
pub const OPTIONS_FILE_NAME: &str = "osm_features.options.json";

const COORD_COLUMNS: [&str; 2] = ["lon", "lat"];
const NODE_KEY_COLUMNS: [&str; 3] = ["id", "lon", "lat"];

fn coordinates(row: &TableRow) -> Option<(f64, f64)> {
    let lon = row.get("lon")?.as_f64()?;
    let lat = row.get("lat")?.as_f64()?;
    Some((lon, lat))
}

fn is_untagged(row: &TableRow) -> bool {
    row.iter()
        .filter(|(column, _)| !NODE_KEY_COLUMNS.contains(column))
        .all(|(_, value)| value.is_null())
}

/// One point per node, carrying every node column except `lon`/`lat`.
pub fn render_nodes(nodes: &Table, drop_untagged: bool) -> RenderedOsm {
    let columns = nodes.columns().iter()
        .filter(|column| !COORD_COLUMNS.contains(&column.as_str()))
        .cloned()
        .collect();
    let mut rendered = RenderedOsm::new(WGS84, columns);

    for row in nodes.rows() {
        if drop_untagged && is_untagged(&row) {
            continue;
        }
        let Some((lon, lat)) = coordinates(&row) else {
            rendered.skipped_nodes += 1;
            continue;
        };
        let values = row.iter()
            .filter(|(column, _)| !COORD_COLUMNS.contains(column))
            .map(|(_, value)| value.clone())
            .collect();
        rendered.features.push(Feature {
            geometry: FeatureGeometry::Point(Point::new(lon, lat)),
            values,
        });
    }

    if rendered.skipped_nodes > 0 {
        warn!(skipped_nodes = rendered.skipped_nodes; "Nodes without coordinates left out of the points");
    }
    rendered
}

/// One line per way, with its nodes in `index` order. Returns `None` when
/// there are no way-node links at all.
pub fn render_ways(nodes: &Table, waynodes: &Table, waytags: &Table) -> Option<RenderedOsm> {
    if waynodes.is_empty() {
        return None;
    }

    let node_coords: HashMap<&str, (f64, f64)> = nodes.rows()
        .filter_map(|row| {
            let id = row.get("id")?.as_str()?;
            Some((id, coordinates(&row)?))
        })
        .collect();

    // The join leaves members in whatever order the links came in; each way
    // is sorted by index on its own afterwards.
    let mut members: HashMap<&str, Vec<(i64, (f64, f64))>> = HashMap::new();
    let mut dangling_refs = 0;
    for link in waynodes.rows() {
        let way_id = link.get("id").and_then(Value::as_str);
        let node_ref = link.get("ref").and_then(Value::as_str);
        let index = link.get("index").and_then(Value::as_i64);
        let (Some(way_id), Some(node_ref), Some(index)) = (way_id, node_ref, index) else {
            dangling_refs += 1;
            continue;
        };
        match node_coords.get(node_ref) {
            Some(coord) => members.entry(way_id).or_default().push((index, *coord)),
            None => dangling_refs += 1,
        }
    }
    for way_members in members.values_mut() {
        way_members.sort_by_key(|(index, _)| *index);
    }

    let mut rendered = RenderedOsm::new(WGS84, waytags.columns().to_vec());
    rendered.dangling_refs = dangling_refs;
    for row in waytags.rows() {
        let line: LineString<f64> = row.get("id")
            .and_then(Value::as_str)
            .and_then(|id| members.get(id))
            .map(|way_members| way_members.iter().map(|(_, coord)| *coord).collect())
            .unwrap_or_else(|| LineString::new(Vec::new()));
        rendered.features.push(Feature {
            geometry: FeatureGeometry::LineString(line),
            values: row.values().to_vec(),
        });
    }

    if dangling_refs > 0 {
        warn!(dangling_refs = dangling_refs; "Way-node references to nodes missing from the document were dropped");
    }
    Some(rendered)
}

/// Points for nodes followed by lines for ways, in one collection.
pub fn render(tables: &OsmTables, drop_untagged: bool) -> RenderedOsm {
    let mut rendered = render_nodes(&tables.nodes, drop_untagged);
    if let Some(ways) = render_ways(&tables.nodes, &tables.waynodes, &tables.waytags) {
        rendered.append(ways);
    }

    info!(
        points = rendered.count(GeometryKind::Point),
        lines = rendered.count(GeometryKind::LineString),
        dangling_refs = rendered.dangling_refs;
        "Rendered OSM features"
    );
    rendered
}

pub struct RenderOsmEtl {
    drop_untagged: bool,
}

impl RenderOsmEtl {
    pub fn new(drop_untagged: bool) -> RenderOsmEtl {
        RenderOsmEtl {
            drop_untagged,
        }
    }

    fn input_path(dir: &Path) -> PathBuf {
        dir.join(parse_osm::OUTPUT_FILE_NAME)
    }

    fn options_json(&self) -> serde_json::Value {
        serde_json::json!({ "drop_untagged": self.drop_untagged })
    }
}

impl Etl for RenderOsmEtl {
    type Input = OsmTables;
    type Output = RenderedOsm;

    fn etl_name(&self) -> &str {
        ETL_NAME
    }

    fn output_file_name(&self) -> &str {
        OUTPUT_FILE_NAME
    }

    /// Cached only when the GeoJSON was rendered with the same options.
    fn is_cached(&self, dir: &Path) -> Result<bool> {
        let options_path = dir.join(OPTIONS_FILE_NAME);
        if !self.output_path(dir).try_exists()? || !options_path.try_exists()? {
            return Ok(false);
        }
        let written = serde_json::from_slice::<serde_json::Value>(&fs::read(options_path)?);
        Ok(written.is_ok_and(|options| options == self.options_json()))
    }

    fn clean(&self, dir: &Path) -> Result<()> {
        for path in [self.output_path(dir), dir.join(OPTIONS_FILE_NAME)] {
            if path.try_exists()? {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn extract(&mut self, dir: &Path) -> Result<Self::Input> {
        load_tables(&Self::input_path(dir))
    }

    fn transform(&mut self, input: Self::Input) -> Result<Self::Output> {
        Ok(render(&input, self.drop_untagged))
    }

    fn load(&mut self, dir: &Path, output: Self::Output) -> Result<()> {
        let geojson = serde_json::to_string(&output.to_geojson())
            .map_err(|err| Error::cache(err.to_string()))?;
        fs::write(self.output_path(dir), geojson)?;
        fs::write(dir.join(OPTIONS_FILE_NAME), self.options_json().to_string())?;
        Ok(())
    }
}
