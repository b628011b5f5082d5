use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::record::TypeTag;

/// The document written to `<root>/<type>/<id>.json` and loaded into the
/// document store.
///
/// Field order is fixed by the struct and both maps are key-sorted, so the same
/// input always serializes to the same bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDocument {
    pub id: String,
    pub partition_key: String,
    pub type_name: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub types: BTreeMap<String, TypeTag>,
}

impl TargetDocument {
    /// Pretty JSON with a trailing newline, the on-disk form.
    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
