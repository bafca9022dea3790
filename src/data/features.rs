use geo::{LineString, Point};
use geojson::JsonObject;
use serde_json::json;

use super::table::Value;

/// Coordinate reference system, identified by its EPSG code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crs {
    pub epsg: u32,
}

impl Crs {
    pub fn urn(&self) -> String {
        format!("urn:ogc:def:crs:EPSG::{}", self.epsg)
    }
}

/// WGS84 geographic coordinates, which is what OSM stores.
pub const WGS84: Crs = Crs { epsg: 4326 };

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryKind {
    Point,
    LineString,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeatureGeometry {
    Point(Point<f64>),
    LineString(LineString<f64>),
}

impl FeatureGeometry {
    pub fn kind(&self) -> GeometryKind {
        match self {
            FeatureGeometry::Point(_) => GeometryKind::Point,
            FeatureGeometry::LineString(_) => GeometryKind::LineString,
        }
    }

    /// Coordinates as `(lon, lat)` pairs, in order.
    pub fn coords(&self) -> Vec<(f64, f64)> {
        match self {
            FeatureGeometry::Point(point) => vec![(point.x(), point.y())],
            FeatureGeometry::LineString(line) => line.0.iter().map(|c| (c.x, c.y)).collect(),
        }
    }

    fn to_geojson(&self) -> geojson::Geometry {
        let value = match self {
            FeatureGeometry::Point(point) => geojson::Value::from(point),
            FeatureGeometry::LineString(line) => geojson::Value::from(line),
        };
        geojson::Geometry::new(value)
    }
}

/// One rendered primitive: a geometry plus values aligned with the
/// collection's column schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub geometry: FeatureGeometry,
    pub values: Vec<Value>,
}

/// Points and lines rendered from one OSM document, sharing a single column
/// schema.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedOsm {
    pub crs: Crs,
    pub columns: Vec<String>,
    pub features: Vec<Feature>,
    /// Way-node references that named no loaded node.
    pub dangling_refs: usize,
    /// Nodes without usable coordinates, left out of the point output.
    pub skipped_nodes: usize,
}

impl RenderedOsm {
    pub fn new(crs: Crs, columns: Vec<String>) -> RenderedOsm {
        RenderedOsm {
            crs,
            columns,
            features: Vec::new(),
            dangling_refs: 0,
            skipped_nodes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn count(&self, kind: GeometryKind) -> usize {
        self.features.iter()
            .filter(|feature| feature.geometry.kind() == kind)
            .count()
    }

    /// Concatenate `other` after this collection. Columns of `other` that are
    /// new here are added at the end and filled with `Null` for existing
    /// features.
    pub fn append(&mut self, other: RenderedOsm) {
        let mut positions = Vec::with_capacity(other.columns.len());
        for column in &other.columns {
            match self.columns.iter().position(|c| c == column) {
                Some(index) => positions.push(index),
                None => {
                    positions.push(self.columns.len());
                    self.columns.push(column.clone());
                },
            }
        }

        let width = self.columns.len();
        for feature in &mut self.features {
            feature.values.resize(width, Value::Null);
        }
        for feature in other.features {
            let mut values = vec![Value::Null; width];
            for (index, value) in positions.iter().zip(feature.values) {
                values[*index] = value;
            }
            self.features.push(Feature {
                geometry: feature.geometry,
                values,
            });
        }
        self.dangling_refs += other.dangling_refs;
        self.skipped_nodes += other.skipped_nodes;
    }

    pub fn value<'a>(&'a self, feature: &'a Feature, column: &str) -> Option<&'a Value> {
        let index = self.columns.iter().position(|c| c == column)?;
        feature.values.get(index)
    }

    /// Features whose `id` column equals `id`. Node and way ids share one
    /// column, so this may return one of each.
    pub fn find<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Feature> + 'a {
        self.features.iter()
            .filter(move |feature| self.value(feature, "id").and_then(Value::as_str) == Some(id))
    }

    fn properties(&self, feature: &Feature) -> JsonObject {
        let mut properties = JsonObject::new();
        for (column, value) in self.columns.iter().zip(feature.values.iter()) {
            if value.is_null() {
                continue;
            }
            if let Ok(json) = serde_json::to_value(value) {
                properties.insert(column.clone(), json);
            }
        }
        properties
    }

    pub fn to_geojson(&self) -> geojson::FeatureCollection {
        let features = self.features.iter()
            .map(|feature| geojson::Feature {
                bbox: None,
                geometry: Some(feature.geometry.to_geojson()),
                id: None,
                properties: Some(self.properties(feature)),
                foreign_members: None,
            })
            .collect();

        let mut foreign_members = JsonObject::new();
        foreign_members.insert(String::from("crs"), json!({
            "type": "name",
            "properties": { "name": self.crs.urn() },
        }));

        geojson::FeatureCollection {
            bbox: None,
            features,
            foreign_members: Some(foreign_members),
        }
    }
}
