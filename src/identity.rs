//! Derived document identities.
//!
//! Exporter, importer and the live persistence adapter never look ids up; they
//! each recompute them from the saga type, the correlation property name and
//! the correlation value. Everything here is a pure function of those inputs.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::{Builder, Uuid, Version};

/// Length of every derived id (hyphenated UUID text).
pub const DERIVED_ID_LEN: usize = 36;

/// Derives the document id (which doubles as the partition key).
///
/// Each input is framed with its byte length before hashing, so moving a
/// character across an input boundary always yields a different digest. The
/// first 16 bytes of the SHA-256 digest become a version 8 UUID, rendered as
/// lowercase hyphenated text: fixed length, filesystem safe, and legal as a
/// document id or partition key value.
pub fn derive(type_full_name: &str, key_property_name: &str, key_value: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [type_full_name, key_property_name, key_value] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();

    let mut bytes = [0_u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Builder::from_custom_bytes(bytes)
        .into_uuid()
        .hyphenated()
        .to_string()
}

/// True when `candidate` has the exact shape `derive` produces.
pub fn is_derived_id(candidate: &str) -> bool {
    if candidate.len() != DERIVED_ID_LEN
        || candidate.chars().any(|c| c.is_ascii_uppercase())
    {
        return false;
    }
    match Uuid::try_parse(candidate) {
        Ok(uuid) => uuid.get_version() == Some(Version::Custom),
        Err(_) => false,
    }
}

/// The business key of one saga instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaKey {
    pub type_name: String,
    pub property: String,
    pub value: String,
}

impl SagaKey {
    pub fn new(
        type_name: impl Into<String>,
        property: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            property: property.into(),
            value: value.into(),
        }
    }

    pub fn document_id(&self) -> String {
        derive(&self.type_name, &self.property, &self.value)
    }

    pub fn partition_key(&self) -> String {
        self.document_id()
    }
}

impl fmt::Display for SagaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}={}]", self.type_name, self.property, self.value)
    }
}
