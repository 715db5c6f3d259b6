//! Schema-descriptor hand-off file.
//!
//! Phases often run as separate process invocations. After a schema object
//! may have been dropped, check/clean still need to identify the records
//! they are verifying by schema identity, so populate writes this thin JSON
//! document and later phases read it back. It is a hand-off file, not a
//! data structure the core depends on.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::HarnessError;

/// Identity of the schema the run's records were written under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    /// Name of the backing table.
    pub table: String,
    /// Store-assigned schema identity.
    pub schema_id: u64,
    /// Seed of the run that created the schema.
    pub seed: i64,
}

impl SchemaDescriptor {
    /// Writes the descriptor as JSON.
    pub fn save(&self, path: &Path) -> Result<(), HarnessError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| {
            HarnessError::DescriptorFormat {
                path: path.to_path_buf(),
                source,
            }
        })?;
        fs::write(path, json).map_err(|source| HarnessError::DescriptorIo {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads a descriptor written by an earlier phase invocation.
    pub fn load(path: &Path) -> Result<Self, HarnessError> {
        let json = fs::read_to_string(path).map_err(|source| HarnessError::DescriptorIo {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|source| HarnessError::DescriptorFormat {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("schema.json");

        let descriptor = SchemaDescriptor {
            table: "gritstone_records".to_string(),
            schema_id: 7,
            seed: 42,
        };
        descriptor.save(&path).expect("save");

        let loaded = SchemaDescriptor::load(&path).expect("load");
        assert_eq!(loaded, descriptor);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = SchemaDescriptor::load(Path::new("/nonexistent/schema.json"))
            .expect_err("missing file");
        assert!(matches!(err, HarnessError::DescriptorIo { .. }));
    }

    #[test]
    fn load_malformed_file_is_format_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("schema.json");
        std::fs::write(&path, "not json").expect("write");

        let err = SchemaDescriptor::load(&path).expect_err("malformed");
        assert!(matches!(err, HarnessError::DescriptorFormat { .. }));
    }
}
