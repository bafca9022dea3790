use serde::Serialize;

use self::table::Table;

pub mod features;
pub mod osm;
pub mod table;

/// The five relational tables read from one .osm document. Built once and
/// never changed afterwards.

#[derive(rkyv::Archive, rkyv::Deserialize, rkyv::Serialize, Serialize, Debug, Default, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct OsmTables {
    pub nodes: Table,
    /// Way-to-node links: `id` (way), `ref` (node) and `index`.
    pub waynodes: Table,
    pub waytags: Table,
    /// Relation members: `id` (relation), `type`, `ref`, `role` and `index`.
    pub relmembers: Table,
    pub reltags: Table,
}
