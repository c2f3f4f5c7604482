use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SluiceError};
use crate::types::Record;

/// Field selection applied by output steps before records leave the pipeline.
///
/// A non-empty `fields` list wins and `exclude` is ignored; otherwise
/// `exclude` drops fields. `rename` is applied last.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldProjection {
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
}

impl FieldProjection {
    /// Read `fields`, `exclude` and `rename` from a step config object.
    pub fn from_config(config: &serde_json::Value) -> Result<Self> {
        if config.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(config.clone())
            .map_err(|e| SluiceError::InvalidPipeline(format!("field projection: {e}")))
    }

    pub fn is_identity(&self) -> bool {
        self.fields.is_empty() && self.exclude.is_empty() && self.rename.is_empty()
    }

    pub fn apply(&self, record: &Record) -> Record {
        let selected: Record = if !self.fields.is_empty() {
            self.fields
                .iter()
                .filter_map(|f| record.get(f).map(|v| (f.clone(), v.clone())))
                .collect()
        } else {
            record
                .iter()
                .filter(|(k, _)| !self.exclude.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        if self.rename.is_empty() {
            return selected;
        }
        // Rebuild so renamed fields keep their position.
        selected
            .into_iter()
            .map(|(k, v)| match self.rename.get(&k) {
                Some(to) => (to.clone(), v),
                None => (k, v),
            })
            .collect()
    }

    pub fn apply_all(&self, records: &[Record]) -> Vec<Record> {
        if self.is_identity() {
            return records.to_vec();
        }
        records.iter().map(|r| self.apply(r)).collect()
    }
}
