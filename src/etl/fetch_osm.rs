use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Deserializer};
use ureq::Agent;

use crate::errors::Result;

use super::Etl;

pub const ETL_NAME: &str = "fetch_osm";
pub const OUTPUT_FILE_NAME: &str = "osm_raw.osm";
pub const DEFAULT_OVERPASS_URL: &str = "http://www.overpass-api.de/api/interpreter";

const MAX_ATTEMPTS: u32 = 5;
const RATE_LIMIT_PAUSE: Duration = Duration::from_secs(5);
const MAX_RESPONSE_BYTES: u64 = 1 << 30;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Node,
    Way,
    Relation,
}

impl ElementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::Node => "node",
            ElementType::Way => "way",
            ElementType::Relation => "relation",
        }
    }
}

/// Which related elements Overpass should pull in alongside the matches.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Recurse {
    Up,
    UpRel,
    Down,
    DownRel,
}

impl Recurse {
    pub fn symbol(&self) -> &'static str {
        match self {
            Recurse::Up => "<",
            Recurse::UpRel => "<<",
            Recurse::Down => ">",
            Recurse::DownRel => ">>",
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(tag) if tag.is_empty() => Vec::new(),
        OneOrMany::One(tag) => vec![tag],
        OneOrMany::Many(tags) => tags,
    })
}

/// An Overpass query for one element type.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct OsmQuery {
    #[serde(rename = "type")]
    pub typ: ElementType,
    /// (min lon, min lat, max lon, max lat)
    #[serde(default)]
    pub bbox: Option<[f64; 4]>,
    #[serde(default)]
    pub recurse: Option<Recurse>,
    /// Overpass tag filters such as `highway` or `name~"^Magazine"`.
    #[serde(default, deserialize_with = "one_or_many")]
    pub tags: Vec<String>,
    /// Ask for changeset, timestamp, uid, user and version as well.
    #[serde(default)]
    pub meta: bool,
}

impl OsmQuery {
    pub fn new(typ: ElementType) -> OsmQuery {
        OsmQuery {
            typ,
            bbox: None,
            recurse: None,
            tags: Vec::new(),
            meta: false,
        }
    }

    pub fn to_overpass_ql(&self) -> String {
        // Overpass wants (min lat, min lon, max lat, max lon).
        let bbox = match self.bbox {
            Some([min_lon, min_lat, max_lon, max_lat]) => {
                format!("({},{},{},{})", min_lat, min_lon, max_lat, max_lon)
            },
            None => String::new(),
        };
        let filters: String = self.tags.iter()
            .map(|tag| format!("[{}]", tag))
            .collect();
        let recurse = self.recurse.map(|r| r.symbol()).unwrap_or("");
        let meta = if self.meta { "meta" } else { "" };

        format!("({}{}{};{};);out {};", self.typ.as_str(), bbox, filters, recurse, meta)
    }
}

pub struct OverpassClient {
    agent: Agent,
    url: String,
}

impl OverpassClient {
    pub fn new(url: &str) -> OverpassClient {
        OverpassClient {
            agent: Agent::new_with_defaults(),
            url: url.to_string(),
        }
    }

    /// Run a query and return the raw response body. Rate-limited requests
    /// are retried after a pause.
    pub fn fetch(&self, query: &str) -> Result<Vec<u8>> {
        let mut attempt = 1;
        loop {
            match self.agent.get(&self.url).query("data", query).call() {
                Ok(mut response) => {
                    let body = response.body_mut()
                        .with_config()
                        .limit(MAX_RESPONSE_BYTES)
                        .read_to_vec()?;
                    return Ok(body);
                },
                Err(ureq::Error::StatusCode(429)) if attempt < MAX_ATTEMPTS => {
                    warn!(attempt = attempt; "Rate limited, waiting 5 seconds");
                    thread::sleep(RATE_LIMIT_PAUSE);
                    attempt += 1;
                },
                Err(err) => return Err(err.into()),
            }
        }
    }
}

pub struct FetchOsmEtl {
    query: OsmQuery,
    client: OverpassClient,
}

impl FetchOsmEtl {
    pub fn new(query: OsmQuery, client: OverpassClient) -> FetchOsmEtl {
        FetchOsmEtl {
            query,
            client,
        }
    }
}

impl Etl for FetchOsmEtl {
    type Input = String;
    type Output = Vec<u8>;

    fn etl_name(&self) -> &str {
        ETL_NAME
    }

    fn output_file_name(&self) -> &str {
        OUTPUT_FILE_NAME
    }

    fn extract(&mut self, _dir: &Path) -> Result<Self::Input> {
        Ok(self.query.to_overpass_ql())
    }

    fn transform(&mut self, input: Self::Input) -> Result<Self::Output> {
        info!(etl_name = ETL_NAME, query = input.as_str(); "Sending query");
        let content = self.client.fetch(&input)?;
        info!(etl_name = ETL_NAME, bytes = content.len(); "Received response");
        Ok(content)
    }

    fn load(&mut self, dir: &Path, output: Self::Output) -> Result<()> {
        fs::write(self.output_path(dir), output)?;
        Ok(())
    }
}
