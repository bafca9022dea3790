//! Read OpenStreetMap XML into relational tables and tagged point/line
//! geometries.

pub mod data;
pub mod errors;
pub mod etl;

use std::fs::{create_dir_all, File};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::{Error, Result};
use crate::etl::Etl;
use crate::etl::fetch_osm::{FetchOsmEtl, OsmQuery, OverpassClient, DEFAULT_OVERPASS_URL};
use crate::etl::parse_osm::ParseOsmEtl;
use crate::etl::render_osm::RenderOsmEtl;

pub use crate::data::OsmTables;
pub use crate::data::features::{RenderedOsm, WGS84};
pub use crate::etl::parse_osm::{read_osm, OsmOutput, ReadOptions};

fn default_true() -> bool {
    true
}

fn default_overpass_url() -> String {
    DEFAULT_OVERPASS_URL.to_string()
}

fn default_log_level() -> String {
    String::from("info")
}

#[derive(Deserialize, Debug, Clone)]
pub struct UserConfig {
    /// Local .osm (or .osm.xz) file to read instead of querying Overpass.
    #[serde(default)]
    pub data_path: Option<String>,
    #[serde(default)]
    pub query: Option<OsmQuery>,
    #[serde(default = "default_overpass_url")]
    pub overpass_url: String,
    pub dest_path: String,
    #[serde(default = "default_true")]
    pub render: bool,
    #[serde(default = "default_true")]
    pub drop_untagged: bool,
    /// Only download; keep the raw XML and skip parsing.
    #[serde(default)]
    pub raw: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl UserConfig {
    pub fn load(path: &Path) -> Result<UserConfig> {
        let file = File::open(path)?;
        let config: UserConfig = serde_json::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match (&self.data_path, &self.query) {
            (Some(_), Some(_)) => Err(Error::config("Set either data_path or query, not both.")),
            (None, None) => Err(Error::config("One of data_path or query is required.")),
            (Some(_), None) if self.raw => Err(Error::config("raw only applies to a query.")),
            _ => Ok(()),
        }
    }

    pub fn read_options(&self) -> ReadOptions {
        ReadOptions {
            render: self.render,
            drop_untagged: self.drop_untagged,
        }
    }
}

fn create_output_dir(config: &UserConfig) -> Result<PathBuf> {
    let output_dir = PathBuf::from(&config.dest_path);
    create_dir_all(&output_dir)?;
    Ok(output_dir)
}

/// Run the configured stages, skipping any whose output is already present
/// and was made with the same options.
pub fn run(config: &UserConfig) -> Result<()> {
    config.validate()?;
    let output_dir = create_output_dir(config)?;

    let input_path = match (&config.data_path, &config.query) {
        (Some(data_path), _) => PathBuf::from(data_path),
        (None, Some(query)) => {
            let mut fetch = FetchOsmEtl::new(query.clone(), OverpassClient::new(&config.overpass_url));
            fetch.process(&output_dir)?;
            if config.raw {
                return Ok(());
            }
            fetch.output_path(&output_dir)
        },
        (None, None) => return Err(Error::config("One of data_path or query is required.")),
    };

    let options = config.read_options();
    ParseOsmEtl::new(input_path, !options.render).process(&output_dir)?;
    if options.render {
        RenderOsmEtl::new(options.drop_untagged).process(&output_dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::etl::{parse_osm, render_osm};

    fn config(json: &str) -> UserConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn defaults_render_and_drop_untagged() {
        let config = config(r#"{"data_path": "map.osm", "dest_path": "out"}"#);
        assert_eq!(config.read_options(), ReadOptions::default());
        assert_eq!(config.overpass_url, DEFAULT_OVERPASS_URL);
        assert_eq!(config.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn needs_exactly_one_input() {
        let neither = config(r#"{"dest_path": "out"}"#);
        assert_eq!(neither.validate().unwrap_err().kind, ErrorKind::Config);

        let both = config(r#"{"data_path": "map.osm", "query": {"type": "node"}, "dest_path": "out"}"#);
        assert_eq!(both.validate().unwrap_err().kind, ErrorKind::Config);
    }

    #[test]
    fn runs_local_file_through_all_stages() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("map.osm");
        std::fs::write(&input, r#"<osm>
            <node id="1" lat="10" lon="1"><tag k="amenity" v="cafe"/></node>
            <node id="2" lat="20" lon="2"/>
            <way id="100"><nd ref="1"/><nd ref="2"/><tag k="highway" v="path"/></way>
        </osm>"#).unwrap();
        let dest = dir.path().join("out");

        let mut config = config(r#"{"dest_path": ""}"#);
        config.data_path = Some(input.to_string_lossy().into_owned());
        config.dest_path = dest.to_string_lossy().into_owned();
        run(&config).unwrap();

        assert!(dest.join(parse_osm::OUTPUT_FILE_NAME).exists());
        assert!(!dest.join(parse_osm::JSON_FILE_NAME).exists());
        let geojson = std::fs::read_to_string(dest.join(render_osm::OUTPUT_FILE_NAME)).unwrap();
        assert!(geojson.contains("\"LineString\""));
    }

    #[test]
    fn tables_only_run_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("map.osm");
        std::fs::write(&input, r#"<osm><node id="1" lat="10" lon="1"/></osm>"#).unwrap();

        let mut config = config(r#"{"dest_path": "", "render": false}"#);
        config.data_path = Some(input.to_string_lossy().into_owned());
        config.dest_path = dir.path().to_string_lossy().into_owned();
        run(&config).unwrap();

        let json: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join(parse_osm::JSON_FILE_NAME)).unwrap(),
        ).unwrap();
        assert_eq!(json["nodes"]["columns"], serde_json::json!(["id", "lat", "lon"]));
        assert_eq!(json["nodes"]["rows"][0], serde_json::json!(["1", 10.0, 1.0]));
        assert!(!dir.path().join(render_osm::OUTPUT_FILE_NAME).exists());
    }

    #[test]
    fn rerun_follows_changed_flags() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("map.osm");
        std::fs::write(&input, r#"<osm>
            <node id="1" lat="10" lon="1"><tag k="amenity" v="cafe"/></node>
            <node id="2" lat="20" lon="2"/>
            <way id="100"><nd ref="1"/><nd ref="2"/><tag k="highway" v="path"/></way>
        </osm>"#).unwrap();
        let dest = dir.path().join("out");
        let feature_count = || {
            let geojson: serde_json::Value = serde_json::from_str(
                &std::fs::read_to_string(dest.join(render_osm::OUTPUT_FILE_NAME)).unwrap(),
            ).unwrap();
            geojson["features"].as_array().unwrap().len()
        };

        let mut config = config(r#"{"dest_path": ""}"#);
        config.data_path = Some(input.to_string_lossy().into_owned());
        config.dest_path = dest.to_string_lossy().into_owned();
        run(&config).unwrap();
        assert_eq!(feature_count(), 2);

        config.drop_untagged = false;
        run(&config).unwrap();
        assert_eq!(feature_count(), 3);

        config.render = false;
        run(&config).unwrap();
        assert!(dest.join(parse_osm::JSON_FILE_NAME).exists());

        config.render = true;
        config.drop_untagged = true;
        run(&config).unwrap();
        assert_eq!(feature_count(), 2);
    }
}
